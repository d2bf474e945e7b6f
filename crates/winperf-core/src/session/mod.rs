//! Native query sessions.
//!
//! A [`NativeSession`] is the only way collectors reach the operating system.
//! It covers the three native subsystems the exporter reads from:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        NativeSession                         │
//! │  query()               open_counters()    connect_task_      │
//! │  WMI select            PDH counter set    scheduler()        │
//! │  → Vec<RawRow>         → CounterQuery     → TaskScheduler    │
//! └──────────────┬───────────────────────────────────────────────┘
//!                │
//!        ┌───────┴────────┐
//!        │                │
//! ┌──────▼───────┐ ┌──────▼───────┐
//! │WindowsSession│ │ MockSession  │
//! │ (cfg windows)│ │ (tests, any  │
//! │              │ │  platform)   │
//! └──────────────┘ └──────────────┘
//! ```
//!
//! Every call returns a point-in-time snapshot. An error means none of the
//! rows of that call can be trusted; sessions never return partial results.

pub mod mock;
mod row;
#[cfg(windows)]
pub mod windows;

pub use mock::{MockFolder, MockSession, MockTask};
pub use row::{RawRow, Value};
#[cfg(windows)]
pub use windows::WindowsSession;

use crate::instances::TOTAL_INSTANCE;
use crate::mapper::FromRow;

/// Default WMI namespace for performance classes.
pub const NAMESPACE_ROOT_CIMV2: &str = "root/cimv2";

/// Field carrying the instance name in every counter row.
pub const INSTANCE_FIELD: &str = "Name";

/// Error type for native session failures.
#[derive(Debug)]
pub enum SessionError {
    /// Query text is not a well-formed select statement.
    InvalidQuery(String),
    /// The requested class or counter object does not exist on this host.
    ObjectNotFound(String),
    /// A native call failed; the status code and message are kept verbatim.
    Native {
        operation: String,
        code: u32,
        message: String,
    },
    /// The operation is not available on this platform or session.
    Unsupported(&'static str),
}

impl SessionError {
    pub fn native(operation: impl Into<String>, code: u32, message: impl Into<String>) -> Self {
        SessionError::Native {
            operation: operation.into(),
            code,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::InvalidQuery(msg) => write!(f, "invalid query: {}", msg),
            SessionError::ObjectNotFound(name) => write!(f, "object not found: {}", name),
            SessionError::Native {
                operation,
                code,
                message,
            } => write!(f, "{} failed: {} (0x{:08X})", operation, message, code),
            SessionError::Unsupported(what) => write!(f, "unsupported: {}", what),
        }
    }
}

impl std::error::Error for SessionError {}

/// A validated WMI select statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    text: String,
    class: String,
    /// Selected columns; empty for `SELECT *`.
    columns: Vec<String>,
}

impl Query {
    /// Parses `SELECT <columns|*> FROM <class> [WHERE ...]`.
    pub fn new(text: impl Into<String>) -> Result<Self, SessionError> {
        let text = text.into();
        let tokens: Vec<&str> = text.split_whitespace().collect();

        if !tokens
            .first()
            .is_some_and(|t| t.eq_ignore_ascii_case("SELECT"))
        {
            return Err(SessionError::InvalidQuery(format!(
                "expected SELECT: {:?}",
                text
            )));
        }

        let from = tokens
            .iter()
            .position(|t| t.eq_ignore_ascii_case("FROM"))
            .ok_or_else(|| SessionError::InvalidQuery(format!("missing FROM: {:?}", text)))?;
        if from < 2 {
            return Err(SessionError::InvalidQuery(format!(
                "missing column list: {:?}",
                text
            )));
        }

        let column_list = tokens[1..from].join(" ");
        let columns = if column_list.trim() == "*" {
            Vec::new()
        } else {
            let mut columns = Vec::new();
            for column in column_list.split(',') {
                let column = column.trim();
                if !is_identifier(column) {
                    return Err(SessionError::InvalidQuery(format!(
                        "bad column {:?} in {:?}",
                        column, text
                    )));
                }
                columns.push(column.to_string());
            }
            columns
        };

        let class = match tokens.get(from + 1) {
            Some(class) if is_identifier(class) => class.to_string(),
            _ => {
                return Err(SessionError::InvalidQuery(format!(
                    "missing class name: {:?}",
                    text
                )));
            }
        };

        if let Some(rest) = tokens.get(from + 2)
            && !rest.eq_ignore_ascii_case("WHERE")
        {
            return Err(SessionError::InvalidQuery(format!(
                "unexpected {:?} after class name",
                rest
            )));
        }

        Ok(Self {
            text,
            class,
            columns,
        })
    }

    /// Builds a query selecting exactly the fields declared by `T`.
    pub fn select<T: FromRow>(class: &str) -> Result<Self, SessionError> {
        let columns: Vec<&str> = T::FIELDS.iter().map(|f| f.source).collect();
        Self::new(format!("SELECT {} FROM {}", columns.join(", "), class))
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn class(&self) -> &str {
        &self.class
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn selects_all(&self) -> bool {
        self.columns.is_empty()
    }
}

impl std::fmt::Display for Query {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.text)
    }
}

fn is_identifier(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// How raw performance-counter values are returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterKind {
    /// Raw first value as kept by the counter provider.
    Raw,
    /// Value formatted by the counter API (rates computed between two polls).
    Formatted,
}

/// Which instances of a counter object a query covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instances {
    /// The object has no instances (e.g. `VM Memory`).
    Single,
    /// Every instance the object currently exposes.
    All,
    /// Only the listed instances.
    Named(Vec<String>),
}

impl Instances {
    /// Only the `_Total` aggregate instance.
    pub fn total() -> Self {
        Instances::Named(vec![TOTAL_INSTANCE.to_string()])
    }
}

/// What to open with [`NativeSession::open_counters`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterSetSpec {
    pub object: String,
    pub counters: Vec<String>,
    pub instances: Instances,
    pub kind: CounterKind,
}

impl CounterSetSpec {
    /// Requests every counter declared by `T`, except the instance name field.
    pub fn for_row<T: FromRow>(object: &str, instances: Instances, kind: CounterKind) -> Self {
        Self {
            object: object.to_string(),
            counters: T::FIELDS
                .iter()
                .filter(|f| !f.source.eq_ignore_ascii_case(INSTANCE_FIELD))
                .map(|f| f.source.to_string())
                .collect(),
            instances,
            kind,
        }
    }

    /// Full counter paths, one per selected instance.
    ///
    /// `\VM Processor(_Total)\CPU stolen time`, `\VM Memory\Memory Used in MB`.
    pub fn counter_paths(&self, counter: &str) -> Vec<String> {
        match &self.instances {
            Instances::Single => vec![format!("\\{}\\{}", self.object, counter)],
            Instances::All => vec![format!("\\{}(*)\\{}", self.object, counter)],
            Instances::Named(names) => names
                .iter()
                .map(|instance| format!("\\{}({})\\{}", self.object, instance, counter))
                .collect(),
        }
    }
}

/// An open performance-counter query handle.
///
/// Dropping the handle releases the native query.
pub trait CounterQuery: Send {
    /// Counter object this handle was opened for.
    fn object(&self) -> &str;

    /// Counters that resolved when the handle was opened.
    fn resolved(&self) -> &[String];

    /// Polls every counter once and returns one row per instance.
    ///
    /// Each row carries the instance name in [`INSTANCE_FIELD`] and one
    /// field per resolved counter, all from the same poll.
    fn collect(&mut self) -> Result<Vec<RawRow>, SessionError>;
}

/// Raw `TASK_STATE` values reported in the `State` field of task rows.
pub mod task_state {
    pub const UNKNOWN: u32 = 0;
    pub const DISABLED: u32 = 1;
    pub const QUEUED: u32 = 2;
    pub const READY: u32 = 3;
    pub const RUNNING: u32 = 4;
}

/// A connected Task Scheduler automation session.
///
/// Apartment-bound: it must be created, used and dropped on the same thread.
pub trait TaskScheduler {
    fn root_folder(&self) -> Result<Box<dyn TaskFolder>, SessionError>;
}

/// A folder in the Task Scheduler library.
pub trait TaskFolder {
    /// Folder path, e.g. `\Microsoft\Windows`.
    fn path(&self) -> String;

    /// Registered tasks directly in this folder (hidden tasks included).
    ///
    /// Rows carry `Name`, `Path`, `Enabled`, `State`, `NumberOfMissedRuns`
    /// and `LastTaskResult`.
    fn tasks(&self) -> Result<Vec<RawRow>, SessionError>;

    /// Direct sub-folders.
    fn folders(&self) -> Result<Vec<Box<dyn TaskFolder>>, SessionError>;
}

/// Abstraction over the native management and performance subsystems.
pub trait NativeSession: Send + Sync {
    /// Runs a WMI select in `namespace` and returns every row of the result.
    fn query(&self, namespace: &str, query: &Query) -> Result<Vec<RawRow>, SessionError>;

    /// Opens a performance-counter query handle.
    ///
    /// Fails with [`SessionError::ObjectNotFound`] when the object does not
    /// exist on this host. Counters of an existing object that cannot be
    /// resolved are left out of [`CounterQuery::resolved`].
    fn open_counters(&self, spec: &CounterSetSpec) -> Result<Box<dyn CounterQuery>, SessionError>;

    /// Connects to the Task Scheduler service on the calling thread.
    fn connect_task_scheduler(&self) -> Result<Box<dyn TaskScheduler>, SessionError>;
}
