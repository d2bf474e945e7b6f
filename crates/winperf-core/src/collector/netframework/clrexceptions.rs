//! `clrexceptions`: .NET CLR exception counters per process.

use std::sync::Arc;

use crate::collector::BuildContext;
use crate::counter_row;
use crate::error::CollectorError;
use crate::filter::InstanceFilter;
use crate::instances::{GLOBAL_INSTANCE, Instanced, per_instance};
use crate::mapper::map_rows;
use crate::metric::Desc;
use crate::session::{NAMESPACE_ROOT_CIMV2, NativeSession, Query};
use crate::sink::SampleSink;

use super::NAME;

pub const CLASS: &str = "Win32_PerfRawData_NETFramework_NETCLRExceptions";

counter_row! {
    pub struct ClrExceptionsRow {
        #[source = "Name"]
        pub name: String,
        #[source = "NumberofExcepsThrown"]
        pub exceptions_thrown: u32,
        #[source = "NumberofExcepsThrownPersec"]
        pub exceptions_thrown_per_sec: u32,
        #[source = "NumberofFiltersPersec"]
        pub filters: u32,
        #[source = "NumberofFinallysPersec"]
        pub finallys: u32,
        #[source = "ThrowToCatchDepthPersec"]
        pub throw_to_catch_depth: u32,
    }
}

impl Instanced for ClrExceptionsRow {
    fn instance_name(&self) -> &str {
        &self.name
    }
}

pub(super) struct ClrExceptions {
    query: Query,
    exceptions_thrown: Arc<Desc>,
    filters: Arc<Desc>,
    finallys: Arc<Desc>,
    throw_to_catch_depth: Arc<Desc>,
}

impl ClrExceptions {
    pub(super) fn build(ctx: &mut BuildContext<'_>) -> Result<Self, CollectorError> {
        let query = Query::select::<ClrExceptionsRow>(CLASS)
            .map_err(|e| CollectorError::session("clrexceptions query", e))?;

        Ok(Self {
            query,
            exceptions_thrown: ctx.desc(
                NAME,
                "clrexceptions_exceptions_thrown_total",
                "Displays the total number of exceptions thrown since the application started. This includes both .NET exceptions and unmanaged exceptions that are converted into .NET exceptions.",
                &["process"],
            )?,
            filters: ctx.desc(
                NAME,
                "clrexceptions_exceptions_filters_total",
                "Displays the total number of .NET exception filters executed. An exception filter evaluates regardless of whether an exception is handled.",
                &["process"],
            )?,
            finallys: ctx.desc(
                NAME,
                "clrexceptions_exceptions_finallys_total",
                "Displays the total number of finally blocks executed. Only the finally blocks executed for an exception are counted; finally blocks on normal code paths are not counted by this counter.",
                &["process"],
            )?,
            throw_to_catch_depth: ctx.desc(
                NAME,
                "clrexceptions_throw_to_catch_depth_total",
                "Displays the total number of stack frames traversed, from the frame that threw the exception to the frame that handled the exception.",
                &["process"],
            )?,
        })
    }

    pub(super) fn collect(
        &self,
        session: &dyn NativeSession,
        filter: &InstanceFilter,
        sink: &SampleSink,
    ) -> Result<(), CollectorError> {
        let raw = session
            .query(NAMESPACE_ROOT_CIMV2, &self.query)
            .map_err(|e| CollectorError::session("WMI query failed", e))?;
        let rows: Vec<ClrExceptionsRow> =
            map_rows(&raw).map_err(|e| CollectorError::mapping(CLASS, e))?;

        for process in per_instance(&rows, GLOBAL_INSTANCE) {
            if !filter.matches(&process.name) {
                continue;
            }
            let labels = [process.name.as_str()];

            sink.counter(&self.exceptions_thrown, f64::from(process.exceptions_thrown), &labels)?;
            sink.counter(&self.filters, f64::from(process.filters), &labels)?;
            sink.counter(&self.finallys, f64::from(process.finallys), &labels)?;
            sink.counter(
                &self.throw_to_catch_depth,
                f64::from(process.throw_to_catch_depth),
                &labels,
            )?;
        }

        Ok(())
    }
}
