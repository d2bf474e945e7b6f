//! Exporter configuration.
//!
//! Mirrors the YAML layout of the exporter's config file:
//!
//! ```yaml
//! collectors:
//!   enabled: netframework,scheduled_task,vmware
//! collector:
//!   scheduled_task:
//!     include: ".+"
//!     exclude: "/Microsoft/.+"
//!   netframework:
//!     enabled: [clrexceptions, clrjit]
//! scrape:
//!   timeout: 10s
//! ```
//!
//! Every section and key is optional. List settings accept a
//! comma-separated string or a YAML sequence.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::collector::CollectorKind;
use crate::filter::{DEFAULT_EXCLUDE, DEFAULT_INCLUDE, InstanceFilter};

/// Default scrape timeout.
pub const DEFAULT_SCRAPE_TIMEOUT: Duration = Duration::from_secs(10);

/// Error type for loading and validating configuration.
#[derive(Debug)]
pub enum ConfigError {
    Io {
        path: String,
        source: std::io::Error,
    },
    Parse(serde_yaml::Error),
    InvalidPattern {
        setting: String,
        source: regex::Error,
    },
    UnknownCollector(String),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io { path, source } => write!(f, "failed to read {}: {}", path, source),
            ConfigError::Parse(e) => write!(f, "invalid YAML: {}", e),
            ConfigError::InvalidPattern { setting, source } => {
                write!(f, "{}: invalid regular expression: {}", setting, source)
            }
            ConfigError::UnknownCollector(name) => write!(f, "unknown collector {:?}", name),
            ConfigError::Invalid(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io { source, .. } => Some(source),
            ConfigError::Parse(e) => Some(e),
            ConfigError::InvalidPattern { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// A list of names: `"a,b"` or `[a, b]`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "ListRepr")]
pub struct NameList(Vec<String>);

#[derive(Deserialize)]
#[serde(untagged)]
enum ListRepr {
    Joined(String),
    Seq(Vec<String>),
}

impl From<ListRepr> for NameList {
    fn from(repr: ListRepr) -> Self {
        match repr {
            ListRepr::Joined(s) => NameList::parse(&s),
            ListRepr::Seq(items) => NameList(
                items
                    .iter()
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
            ),
        }
    }
}

impl NameList {
    /// Splits a comma-separated list, dropping blanks.
    pub fn parse(s: &str) -> Self {
        NameList(
            s.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        )
    }

    pub fn names(&self) -> &[String] {
        &self.0
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.iter().any(|n| n == name)
    }
}

/// Include/exclude pattern pair as written in the config.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct FilterSettings {
    pub include: String,
    pub exclude: String,
}

impl Default for FilterSettings {
    fn default() -> Self {
        Self {
            include: DEFAULT_INCLUDE.to_string(),
            exclude: DEFAULT_EXCLUDE.to_string(),
        }
    }
}

impl FilterSettings {
    /// Compiles the pair; `setting` names the config key in errors.
    pub fn compile(&self, setting: &str) -> Result<InstanceFilter, ConfigError> {
        InstanceFilter::new(&self.include, &self.exclude).map_err(|source| {
            ConfigError::InvalidPattern {
                setting: setting.to_string(),
                source,
            }
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CollectorsSection {
    pub enabled: NameList,
}

impl Default for CollectorsSection {
    fn default() -> Self {
        Self {
            enabled: NameList(CollectorKind::ALL.iter().map(|k| k.name().to_string()).collect()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct NetFrameworkSettings {
    /// Sub-collectors: `clrexceptions`, `clrjit`.
    pub enabled: NameList,
    #[serde(flatten)]
    pub filter: FilterSettings,
}

impl Default for NetFrameworkSettings {
    fn default() -> Self {
        Self {
            enabled: NameList::parse("clrexceptions,clrjit"),
            filter: FilterSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ScheduledTaskSettings {
    #[serde(flatten)]
    pub filter: FilterSettings,
}

/// The vmware collector has no settings; the section is accepted and ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct VmwareSettings {}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CollectorSettings {
    pub scheduled_task: ScheduledTaskSettings,
    pub netframework: NetFrameworkSettings,
    pub vmware: VmwareSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ScrapeSettings {
    #[serde(deserialize_with = "deserialize_duration")]
    pub timeout: Duration,
}

impl Default for ScrapeSettings {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_SCRAPE_TIMEOUT,
        }
    }
}

/// Top-level exporter configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub collectors: CollectorsSection,
    pub collector: CollectorSettings,
    pub scrape: ScrapeSettings,
}

impl Config {
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        // An empty file is an empty mapping.
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(yaml).map_err(ConfigError::Parse)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml_str(&text)
    }

    /// Enabled collectors, in the order they were listed. Duplicates collapse.
    pub fn enabled_collectors(&self) -> Result<Vec<CollectorKind>, ConfigError> {
        let mut kinds = Vec::new();
        for name in self.collectors.enabled.names() {
            let kind = CollectorKind::from_name(name)
                .ok_or_else(|| ConfigError::UnknownCollector(name.clone()))?;
            if !kinds.contains(&kind) {
                kinds.push(kind);
            }
        }
        Ok(kinds)
    }

    /// Checks everything that can be checked without a native session.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.enabled_collectors()?;
        self.collector
            .scheduled_task
            .filter
            .compile("collector.scheduled_task")?;
        self.collector
            .netframework
            .filter
            .compile("collector.netframework")?;
        if self.scrape.timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "scrape.timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Parses `500ms`, `10s`, `2m`, `1h` or a bare number of seconds.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration".to_string());
    }

    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    let (num, unit) = s.split_at(split);
    let value: f64 = num
        .parse()
        .map_err(|e| format!("invalid duration '{}': {}", s, e))?;

    let seconds = match unit.trim() {
        "" | "s" => value,
        "ms" => value / 1000.0,
        "m" => value * 60.0,
        "h" => value * 3600.0,
        other => return Err(format!("invalid duration unit '{}' in '{}'", other, s)),
    };
    Duration::try_from_secs_f64(seconds).map_err(|e| format!("invalid duration '{}': {}", s, e))
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Seconds(u64),
        Text(String),
    }

    match Repr::deserialize(deserializer)? {
        Repr::Seconds(secs) => Ok(Duration::from_secs(secs)),
        Repr::Text(text) => parse_duration(&text).map_err(serde::de::Error::custom),
    }
}
