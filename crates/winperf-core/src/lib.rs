//! winperf-core — performance-data collection framework for the Windows exporter.
//!
//! Provides:
//! - `session` — native query sessions (WMI, PDH, Task Scheduler) behind one trait,
//!   with an in-memory mock for tests and non-Windows hosts
//! - `mapper` — declarative raw row → typed row conversion
//! - `instances` — per-instance multiplexing and container tree walks
//! - `apartment` — dedicated worker threads for apartment-bound sessions
//! - `metric` / `sink` — metric descriptors, samples and the emission channel
//! - `filter` — anchored include/exclude instance filters
//! - `config` — YAML-backed exporter configuration
//! - `collector` — the collector trait and the compiled-in collectors
//! - `registry` — collector lifecycle and the per-scrape fan-out

pub mod apartment;
pub mod collector;
pub mod config;
pub mod error;
pub mod filter;
pub mod instances;
pub mod mapper;
pub mod metric;
pub mod registry;
pub mod session;
pub mod sink;
pub mod util;

pub use collector::{BuildContext, Collector, CollectorKind};
pub use config::Config;
pub use error::{CollectorError, ErrorList};
pub use metric::{Desc, Sample, ValueKind};
pub use registry::{Registry, Scrape};
pub use session::{MockSession, NativeSession};
pub use sink::SampleSink;
