//! Collector trait and the compiled-in collectors.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          Registry                            │
//! │   build() once ─► collect() per scrape ─► close() once       │
//! └──────────────────────────────┬───────────────────────────────┘
//!                                │ Box<dyn Collector>
//!         ┌──────────────────────┼──────────────────────┐
//!         │                      │                      │
//!  ┌──────▼───────┐       ┌──────▼───────┐       ┌──────▼───────┐
//!  │ netframework │       │scheduled_task│       │    vmware    │
//!  │  WMI select  │       │ Task Sched.  │       │ PDH counters │
//!  │              │       │ (apartment)  │       │              │
//!  └──────┬───────┘       └──────┬───────┘       └──────┬───────┘
//!         └──────────────────────┼──────────────────────┘
//!                         ┌──────▼──────┐
//!                         │NativeSession│ (trait)
//!                         └─────────────┘
//! ```
//!
//! # Usage
//!
//! ```
//! use std::sync::Arc;
//! use winperf_core::{Config, MockSession, Registry};
//!
//! let mut registry = Registry::from_config(&Config::default()).unwrap();
//! registry.build(Arc::new(MockSession::typical_host())).unwrap();
//! let scrape = registry.scrape();
//! assert!(!scrape.is_failed());
//! registry.close().unwrap();
//! ```

pub mod netframework;
pub mod scheduled_task;
pub mod vmware;

use std::sync::Arc;

use crate::config::{Config, ConfigError};
use crate::error::CollectorError;
use crate::metric::{Desc, DescRegistry, NAMESPACE, fq_name};
use crate::session::NativeSession;
use crate::sink::SampleSink;

pub use netframework::NetFramework;
pub use scheduled_task::ScheduledTaskCollector;
pub use vmware::Vmware;

/// A per-subsystem collector.
///
/// Lifecycle: `build` exactly once, then `collect` once per scrape, then
/// `close` exactly once. `collect` never runs concurrently with itself.
pub trait Collector: Send {
    fn name(&self) -> &'static str;

    /// Registers descriptors and acquires native resources.
    ///
    /// Independent sub-resources are all attempted and their errors joined.
    fn build(&mut self, ctx: &mut BuildContext<'_>) -> Result<(), CollectorError>;

    /// Emits this cycle's samples into `sink`.
    fn collect(&mut self, sink: &SampleSink) -> Result<(), CollectorError>;

    /// Releases what `build` acquired.
    fn close(&mut self) -> Result<(), CollectorError>;
}

/// What a collector gets during `build`: the native session and a place to
/// register its metric descriptors.
pub struct BuildContext<'a> {
    session: Arc<dyn NativeSession>,
    descs: &'a mut DescRegistry,
    collector: &'static str,
    registered: Vec<Arc<Desc>>,
}

impl<'a> BuildContext<'a> {
    pub fn new(
        session: Arc<dyn NativeSession>,
        descs: &'a mut DescRegistry,
        collector: &'static str,
    ) -> Self {
        Self {
            session,
            descs,
            collector,
            registered: Vec::new(),
        }
    }

    pub fn session(&self) -> &Arc<dyn NativeSession> {
        &self.session
    }

    /// Registers `windows_<subsystem>_<name>` for the building collector.
    pub fn desc(
        &mut self,
        subsystem: &str,
        name: &str,
        help: &str,
        labels: &[&str],
    ) -> Result<Arc<Desc>, CollectorError> {
        let desc = self
            .descs
            .register(fq_name(NAMESPACE, subsystem, name), help, labels)?;
        if !self.registered.iter().any(|d| Arc::ptr_eq(d, &desc)) {
            self.registered.push(Arc::clone(&desc));
        }
        Ok(desc)
    }

    pub fn collector(&self) -> &'static str {
        self.collector
    }

    /// Descriptors registered so far by this collector.
    pub fn registered(&self) -> &[Arc<Desc>] {
        &self.registered
    }

    pub fn into_registered(self) -> Vec<Arc<Desc>> {
        self.registered
    }
}

/// The closed set of collectors compiled into the exporter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CollectorKind {
    NetFramework,
    ScheduledTask,
    Vmware,
}

impl CollectorKind {
    pub const ALL: [CollectorKind; 3] = [
        CollectorKind::NetFramework,
        CollectorKind::ScheduledTask,
        CollectorKind::Vmware,
    ];

    pub fn name(self) -> &'static str {
        match self {
            CollectorKind::NetFramework => netframework::NAME,
            CollectorKind::ScheduledTask => scheduled_task::NAME,
            CollectorKind::Vmware => vmware::NAME,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }

    /// Constructs the collector from its configuration section.
    pub fn create(self, config: &Config) -> Result<Box<dyn Collector>, ConfigError> {
        Ok(match self {
            CollectorKind::NetFramework => {
                Box::new(NetFramework::new(&config.collector.netframework)?)
            }
            CollectorKind::ScheduledTask => {
                Box::new(ScheduledTaskCollector::new(&config.collector.scheduled_task)?)
            }
            CollectorKind::Vmware => Box::new(Vmware::new(&config.collector.vmware)),
        })
    }
}

impl std::fmt::Display for CollectorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
