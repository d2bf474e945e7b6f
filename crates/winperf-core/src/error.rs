//! Collector-level errors and the error accumulator.
//!
//! Lower layers define their own error types (`SessionError`, `MapError`,
//! `MetricError`, `ApartmentError`). A collector wraps them into
//! [`CollectorError`] with enough context to log meaningfully, and uses
//! [`ErrorList`] wherever several independent sub-resources may fail in the
//! same call.

use crate::apartment::ApartmentError;
use crate::mapper::MapError;
use crate::metric::MetricError;
use crate::session::SessionError;

/// Error returned by a collector's `build`, `collect` or `close`.
#[derive(Debug)]
pub enum CollectorError {
    /// A native query or counter handle failed.
    Session {
        context: String,
        source: SessionError,
    },
    /// Raw rows could not be mapped onto the declared row type.
    Mapping { context: String, source: MapError },
    /// A metric descriptor could not be registered.
    Metric(MetricError),
    /// The apartment worker could not run the job.
    Apartment(ApartmentError),
    /// The scrape consumer stopped listening (the cycle timed out).
    SinkClosed,
    /// A previous collection of this collector is still running.
    Busy,
    /// The collector did not finish within the scrape timeout.
    TimedOut(std::time::Duration),
    /// Invalid collector configuration.
    Config(String),
    /// A query returned no rows where at least one was required.
    NoData(String),
    /// A failure attributed to one collector by the registry.
    Named {
        collector: &'static str,
        source: Box<CollectorError>,
    },
    /// Several independent failures from one call.
    Joined(Vec<CollectorError>),
}

impl CollectorError {
    pub fn session(context: impl Into<String>, source: SessionError) -> Self {
        CollectorError::Session {
            context: context.into(),
            source,
        }
    }

    pub fn mapping(context: impl Into<String>, source: MapError) -> Self {
        CollectorError::Mapping {
            context: context.into(),
            source,
        }
    }

    /// Attributes this error to `collector`.
    pub fn named(self, collector: &'static str) -> Self {
        CollectorError::Named {
            collector,
            source: Box::new(self),
        }
    }

    /// Number of leaf errors, counting through `Joined`.
    pub fn count(&self) -> usize {
        match self {
            CollectorError::Joined(errors) => errors.iter().map(CollectorError::count).sum(),
            CollectorError::Named { source, .. } => source.count(),
            _ => 1,
        }
    }
}

impl std::fmt::Display for CollectorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CollectorError::Session { context, source } => write!(f, "{}: {}", context, source),
            CollectorError::Mapping { context, source } => write!(f, "{}: {}", context, source),
            CollectorError::Metric(e) => write!(f, "metric descriptor: {}", e),
            CollectorError::Apartment(e) => write!(f, "apartment worker: {}", e),
            CollectorError::SinkClosed => write!(f, "sample sink closed"),
            CollectorError::Busy => write!(f, "previous collection still running"),
            CollectorError::TimedOut(after) => write!(f, "timed out after {:?}", after),
            CollectorError::Named { collector, source } => {
                write!(f, "collector {}: {}", collector, source)
            }
            CollectorError::Config(msg) => write!(f, "configuration: {}", msg),
            CollectorError::NoData(msg) => write!(f, "no data: {}", msg),
            CollectorError::Joined(errors) => {
                for (i, e) in errors.iter().enumerate() {
                    if i > 0 {
                        write!(f, "; ")?;
                    }
                    write!(f, "{}", e)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for CollectorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CollectorError::Session { source, .. } => Some(source),
            CollectorError::Mapping { source, .. } => Some(source),
            CollectorError::Metric(e) => Some(e),
            CollectorError::Apartment(e) => Some(e),
            CollectorError::Named { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}

impl From<MetricError> for CollectorError {
    fn from(e: MetricError) -> Self {
        CollectorError::Metric(e)
    }
}

impl From<ApartmentError> for CollectorError {
    fn from(e: ApartmentError) -> Self {
        CollectorError::Apartment(e)
    }
}

/// Accumulates independent failures instead of stopping at the first one.
///
/// ```
/// use winperf_core::error::{CollectorError, ErrorList};
///
/// let mut errors = ErrorList::new();
/// errors.push(CollectorError::NoData("VM Processor".into()));
/// errors.push(CollectorError::NoData("VM Memory".into()));
/// let err = errors.finish().unwrap_err();
/// assert_eq!(err.count(), 2);
/// ```
#[derive(Debug, Default)]
pub struct ErrorList {
    errors: Vec<CollectorError>,
}

impl ErrorList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, error: CollectorError) {
        self.errors.push(error);
    }

    /// Records the error of `result`, if any, and hands back the success value.
    pub fn check<T>(&mut self, result: Result<T, CollectorError>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(e) => {
                self.push(e);
                None
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// `Ok(())` when nothing failed, the error itself when exactly one did,
    /// `CollectorError::Joined` otherwise.
    pub fn finish(mut self) -> Result<(), CollectorError> {
        match self.errors.len() {
            0 => Ok(()),
            1 => Err(self.errors.remove(0)),
            _ => Err(CollectorError::Joined(self.errors)),
        }
    }
}
