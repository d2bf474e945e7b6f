//! `clrjit`: .NET JIT compiler counters per process.

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
use crate::util::ratio;

use super::NAME;

pub const CLASS: &str = "Win32_PerfRawData_NETFramework_NETCLRJit";

counter_row! {
    pub struct ClrJitRow {
        #[source = "Name"]
        pub name: String,
        /// Divisor of `PercentTimeinJit`; may change between polls.
        #[source = "Frequency_PerfTime"]
        pub frequency_perf_time: u32,
        #[source = "ILBytesJittedPersec"]
        pub il_bytes_jitted_per_sec: u32,
        #[source = "NumberofILBytesJitted"]
        pub il_bytes_jitted: u32,
        #[source = "NumberofMethodsJitted"]
        pub methods_jitted: u32,
        #[source = "PercentTimeinJit"]
        pub percent_time_in_jit: u32,
        #[source = "StandardJitFailures"]
        pub standard_jit_failures: u32,
        #[source = "TotalNumberofILBytesJitted"]
        pub total_il_bytes_jitted: u32,
    }
}

impl Instanced for ClrJitRow {
    fn instance_name(&self) -> &str {
        &self.name
    }
}

impl ClrJitRow {
    /// Fraction of time spent in JIT compilation, 0..1.
    pub fn time_in_jit(&self) -> f64 {
        ratio(
            f64::from(self.percent_time_in_jit),
            f64::from(self.frequency_perf_time),
        )
    }
}

pub(super) struct ClrJit {
    query: Query,
    methods_jitted: Arc<Desc>,
    time_in_jit: Arc<Desc>,
    standard_jit_failures: Arc<Desc>,
    il_bytes_jitted: Arc<Desc>,
}

impl ClrJit {
    pub(super) fn build(ctx: &mut BuildContext<'_>) -> Result<Self, CollectorError> {
        let query = Query::select::<ClrJitRow>(CLASS)
            .map_err(|e| CollectorError::session("clrjit query", e))?;

        Ok(Self {
            query,
            methods_jitted: ctx.desc(
                NAME,
                "clrjit_jit_methods_total",
                "Displays the total number of methods JIT-compiled since the application started. This counter does not include pre-JIT-compiled methods.",
                &["process"],
            )?,
            time_in_jit: ctx.desc(
                NAME,
                "clrjit_jit_time_percent",
                "Displays the percentage of time spent in JIT compilation. This counter is updated at the end of every JIT compilation phase. A JIT compilation phase occurs when a method and its dependencies are compiled.",
                &["process"],
            )?,
            standard_jit_failures: ctx.desc(
                NAME,
                "clrjit_jit_standard_failures_total",
                "Displays the peak number of methods the JIT compiler has failed to compile since the application started. This failure can occur if the MSIL cannot be verified or if there is an internal error in the JIT compiler.",
                &["process"],
            )?,
            il_bytes_jitted: ctx.desc(
                NAME,
                "clrjit_jit_il_bytes_total",
                "Displays the total number of Microsoft intermediate language (MSIL) bytes compiled by the just-in-time (JIT) compiler since the application started",
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
        let rows: Vec<ClrJitRow> = map_rows(&raw).map_err(|e| CollectorError::mapping(CLASS, e))?;

        for process in per_instance(&rows, GLOBAL_INSTANCE) {
            if !filter.matches(&process.name) {
                continue;
            }
            let labels = [process.name.as_str()];

            sink.counter(&self.methods_jitted, f64::from(process.methods_jitted), &labels)?;
            sink.gauge(&self.time_in_jit, process.time_in_jit(), &labels)?;
            // Reported as a gauge: the counter is a peak, not a running total.
            sink.gauge(
                &self.standard_jit_failures,
                f64::from(process.standard_jit_failures),
                &labels,
            )?;
            sink.counter(
                &self.il_bytes_jitted,
                f64::from(process.total_il_bytes_jitted),
                &labels,
            )?;
        }

        Ok(())
    }
}
