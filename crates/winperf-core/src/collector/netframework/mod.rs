//! .NET Framework CLR counters from WMI.
//!
//! Split into sub-collectors that can be enabled one by one through
//! `collector.netframework.enabled`. Each sub-collector runs one WMI select
//! per scrape and reports one set of samples per process, skipping the
//! `_Global_` aggregate row.

mod clrexceptions;
mod clrjit;

use std::sync::Arc;

use tracing::debug;

use crate::collector::{BuildContext, Collector};
use crate::config::{ConfigError, NetFrameworkSettings};
use crate::error::{CollectorError, ErrorList};
use crate::filter::InstanceFilter;
use crate::session::NativeSession;
use crate::sink::SampleSink;

pub use clrexceptions::ClrExceptionsRow;
pub use clrjit::ClrJitRow;

use clrexceptions::ClrExceptions;
use clrjit::ClrJit;

pub const NAME: &str = "netframework";

pub const CLR_EXCEPTIONS: &str = "clrexceptions";
pub const CLR_JIT: &str = "clrjit";

/// Every known sub-collector name.
pub const SUB_COLLECTORS: &[&str] = &[CLR_EXCEPTIONS, CLR_JIT];

pub struct NetFramework {
    filter: InstanceFilter,
    enabled: Vec<&'static str>,
    session: Option<Arc<dyn NativeSession>>,
    exceptions: Option<ClrExceptions>,
    jit: Option<ClrJit>,
}

impl NetFramework {
    pub fn new(settings: &NetFrameworkSettings) -> Result<Self, ConfigError> {
        let mut enabled = Vec::new();
        for name in settings.enabled.names() {
            let known = SUB_COLLECTORS
                .iter()
                .find(|known| **known == name.as_str())
                .ok_or_else(|| {
                    ConfigError::Invalid(format!(
                        "collector.netframework.enabled: unknown sub-collector {:?} (known: {})",
                        name,
                        SUB_COLLECTORS.join(", ")
                    ))
                })?;
            if !enabled.contains(known) {
                enabled.push(*known);
            }
        }

        Ok(Self {
            filter: settings.filter.compile("collector.netframework")?,
            enabled,
            session: None,
            exceptions: None,
            jit: None,
        })
    }

    fn is_enabled(&self, sub: &str) -> bool {
        self.enabled.contains(&sub)
    }
}

impl Collector for NetFramework {
    fn name(&self) -> &'static str {
        NAME
    }

    fn build(&mut self, ctx: &mut BuildContext<'_>) -> Result<(), CollectorError> {
        let mut errors = ErrorList::new();

        if self.is_enabled(CLR_EXCEPTIONS) {
            self.exceptions = errors.check(ClrExceptions::build(ctx));
        }
        if self.is_enabled(CLR_JIT) {
            self.jit = errors.check(ClrJit::build(ctx));
        }

        self.session = Some(Arc::clone(ctx.session()));
        debug!(sub_collectors = ?self.enabled, "netframework built");
        errors.finish()
    }

    fn collect(&mut self, sink: &SampleSink) -> Result<(), CollectorError> {
        let session = self
            .session
            .as_deref()
            .ok_or_else(|| CollectorError::Config("collect called before build".to_string()))?;
        let mut errors = ErrorList::new();

        if let Some(exceptions) = &self.exceptions {
            errors.check(exceptions.collect(session, &self.filter, sink));
        }
        if let Some(jit) = &self.jit {
            errors.check(jit.collect(session, &self.filter, sink));
        }

        errors.finish()
    }

    fn close(&mut self) -> Result<(), CollectorError> {
        self.exceptions = None;
        self.jit = None;
        self.session = None;
        Ok(())
    }
}
