//! Metric descriptors and samples.
//!
//! A [`Desc`] is created once per collector during `build` and never changes
//! afterwards. Every [`Sample`] points at its descriptor and carries label
//! values positional to the descriptor's label names.

use std::collections::HashMap;
use std::sync::Arc;

/// Namespace of every metric this exporter publishes.
pub const NAMESPACE: &str = "windows";

/// Joins the non-empty parts with `_`.
///
/// ```
/// use winperf_core::metric::fq_name;
///
/// assert_eq!(fq_name("windows", "vmware", "cpu_shares"), "windows_vmware_cpu_shares");
/// assert_eq!(fq_name("windows", "", "up"), "windows_up");
/// ```
pub fn fq_name(namespace: &str, subsystem: &str, name: &str) -> String {
    [namespace, subsystem, name]
        .iter()
        .filter(|part| !part.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join("_")
}

/// Whether a value is cumulative or point-in-time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Counter,
    Gauge,
}

impl ValueKind {
    /// Name used in the `# TYPE` line of the text format.
    pub fn as_str(self) -> &'static str {
        match self {
            ValueKind::Counter => "counter",
            ValueKind::Gauge => "gauge",
        }
    }
}

/// Stable identity of a metric: fully-qualified name, help and label names.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Desc {
    fq_name: String,
    help: String,
    labels: Vec<String>,
}

impl Desc {
    pub fn fq_name(&self) -> &str {
        &self.fq_name
    }

    pub fn help(&self) -> &str {
        &self.help
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }
}

/// Error type for descriptor registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetricError {
    InvalidName(String),
    InvalidLabel { metric: String, label: String },
    /// Same name registered again with different help or labels.
    Conflict(String),
}

impl std::fmt::Display for MetricError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MetricError::InvalidName(name) => write!(f, "invalid metric name {:?}", name),
            MetricError::InvalidLabel { metric, label } => {
                write!(f, "invalid label name {:?} on {}", label, metric)
            }
            MetricError::Conflict(name) => {
                write!(f, "descriptor {} already registered with a different schema", name)
            }
        }
    }
}

impl std::error::Error for MetricError {}

fn valid_metric_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == ':' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
}

fn valid_label_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    !name.starts_with("__") && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Every descriptor known to the exporter, keyed by fully-qualified name.
#[derive(Debug, Default)]
pub struct DescRegistry {
    descs: HashMap<String, Arc<Desc>>,
}

impl DescRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates and registers a descriptor.
    ///
    /// Registering an identical descriptor again returns the existing one.
    pub fn register(
        &mut self,
        fq_name: String,
        help: &str,
        labels: &[&str],
    ) -> Result<Arc<Desc>, MetricError> {
        if !valid_metric_name(&fq_name) {
            return Err(MetricError::InvalidName(fq_name));
        }
        for label in labels {
            if !valid_label_name(label) {
                return Err(MetricError::InvalidLabel {
                    metric: fq_name,
                    label: label.to_string(),
                });
            }
        }

        let desc = Desc {
            help: help.to_string(),
            labels: labels.iter().map(|l| l.to_string()).collect(),
            fq_name,
        };

        if let Some(existing) = self.descs.get(&desc.fq_name) {
            if **existing == desc {
                return Ok(Arc::clone(existing));
            }
            return Err(MetricError::Conflict(desc.fq_name));
        }

        let desc = Arc::new(desc);
        self.descs.insert(desc.fq_name.clone(), Arc::clone(&desc));
        Ok(desc)
    }

    pub fn get(&self, fq_name: &str) -> Option<&Arc<Desc>> {
        self.descs.get(fq_name)
    }

    pub fn len(&self) -> usize {
        self.descs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descs.is_empty()
    }
}

/// One metric value produced during a scrape.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub desc: Arc<Desc>,
    pub kind: ValueKind,
    pub value: f64,
    /// Positional to `desc.labels()`.
    pub label_values: Vec<String>,
}

impl Sample {
    /// Value of the label called `name`, if the descriptor has one.
    pub fn label(&self, name: &str) -> Option<&str> {
        self.desc
            .labels
            .iter()
            .position(|l| l == name)
            .and_then(|i| self.label_values.get(i))
            .map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_returns_shared_descriptor() {
        let mut registry = DescRegistry::new();
        let a = registry
            .register(fq_name(NAMESPACE, "vmware", "cpu_shares"), "CPU shares", &[])
            .unwrap();
        let b = registry
            .register(fq_name(NAMESPACE, "vmware", "cpu_shares"), "CPU shares", &[])
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn conflicting_schema_is_refused() {
        let mut registry = DescRegistry::new();
        registry
            .register("windows_x".into(), "help", &["process"])
            .unwrap();
        assert_eq!(
            registry.register("windows_x".into(), "help", &["task"]),
            Err(MetricError::Conflict("windows_x".into()))
        );
        assert_eq!(
            registry.register("windows_x".into(), "other help", &["process"]),
            Err(MetricError::Conflict("windows_x".into()))
        );
    }

    #[test]
    fn names_are_validated() {
        let mut registry = DescRegistry::new();
        assert!(registry.register("9lives".into(), "", &[]).is_err());
        assert!(registry.register("with-dash".into(), "", &[]).is_err());
        assert!(registry.register("".into(), "", &[]).is_err());
        assert!(registry.register("ok:name_1".into(), "", &[]).is_ok());

        assert!(matches!(
            registry.register("windows_y".into(), "", &["__reserved"]),
            Err(MetricError::InvalidLabel { .. })
        ));
        assert!(registry.register("windows_z".into(), "", &["a:b"]).is_err());
        assert!(registry.register("windows_w".into(), "", &["_ok"]).is_ok());
    }

    #[test]
    fn sample_label_lookup_by_name() {
        let mut registry = DescRegistry::new();
        let desc = registry
            .register("windows_scheduled_task_state".into(), "", &["task", "state"])
            .unwrap();
        let sample = Sample {
            desc,
            kind: ValueKind::Gauge,
            value: 1.0,
            label_values: vec!["/Backup".into(), "running".into()],
        };
        assert_eq!(sample.label("state"), Some("running"));
        assert_eq!(sample.label("task"), Some("/Backup"));
        assert_eq!(sample.label("process"), None);
    }
}
