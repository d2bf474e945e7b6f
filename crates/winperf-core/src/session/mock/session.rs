use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use crate::session::{
    CounterQuery, CounterSetSpec, INSTANCE_FIELD, Instances, NAMESPACE_ROOT_CIMV2, NativeSession,
    Query, RawRow, SessionError, TaskFolder, TaskScheduler, task_state,
};

/// A registered task in a [`MockFolder`].
#[derive(Debug, Clone, PartialEq)]
pub struct MockTask {
    pub name: String,
    pub enabled: bool,
    /// Raw `TASK_STATE` value.
    pub state: u32,
    pub missed_runs: i32,
    /// Raw `HRESULT` of the last run.
    pub last_result: u32,
}

impl MockTask {
    /// An enabled task in `state` whose last run succeeded.
    pub fn new(name: impl Into<String>, state: u32) -> Self {
        Self {
            name: name.into(),
            enabled: state != task_state::DISABLED,
            state,
            missed_runs: 0,
            last_result: 0,
        }
    }

    pub fn with_last_result(mut self, last_result: u32) -> Self {
        self.last_result = last_result;
        self
    }

    pub fn with_missed_runs(mut self, missed_runs: i32) -> Self {
        self.missed_runs = missed_runs;
        self
    }
}

/// A Task Scheduler folder: tasks plus sub-folders.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MockFolder {
    pub name: String,
    pub tasks: Vec<MockTask>,
    pub folders: Vec<MockFolder>,
}

impl MockFolder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_task(mut self, task: MockTask) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn with_folder(mut self, folder: MockFolder) -> Self {
        self.folders.push(folder);
        self
    }
}

#[derive(Debug, Clone)]
struct CounterObject {
    counters: Vec<String>,
    rows: Vec<RawRow>,
}

#[derive(Debug, Clone)]
struct Failure {
    code: u32,
    message: String,
}

#[derive(Debug, Default)]
struct MockState {
    /// Keyed by `namespace:class`, lowercase.
    classes: HashMap<String, Vec<RawRow>>,
    /// Keyed by object name, lowercase.
    objects: HashMap<String, CounterObject>,
    task_root: MockFolder,

    query_failures: HashMap<String, Failure>,
    open_failures: HashMap<String, Failure>,
    collect_failures: HashMap<String, Failure>,
    scheduler_failure: Option<Failure>,
    folder_failures: HashMap<String, Failure>,

    /// Artificial latency per class, object or folder path, lowercase.
    delays: HashMap<String, Duration>,
    query_counts: HashMap<String, usize>,
    /// Names of the threads `connect_task_scheduler` ran on, in call order.
    scheduler_threads: Vec<Option<String>>,
}

fn class_key(namespace: &str, class: &str) -> String {
    format!(
        "{}:{}",
        namespace.to_ascii_lowercase().replace('\\', "/"),
        class.to_ascii_lowercase()
    )
}

fn sleep_if(delay: Option<Duration>) {
    if let Some(delay) = delay {
        std::thread::sleep(delay);
    }
}

/// In-memory [`NativeSession`].
///
/// Clones share state, so a test can keep a handle, pass another to the
/// registry and change the data between scrapes.
#[derive(Debug, Clone, Default)]
pub struct MockSession {
    state: Arc<RwLock<MockState>>,
    open_handles: Arc<AtomicUsize>,
}

impl MockSession {
    /// Creates an empty session: no classes, no counter objects, an empty
    /// task library.
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, MockState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, MockState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sets the rows of a class in `root/cimv2`.
    pub fn set_rows(&self, class: &str, rows: Vec<RawRow>) {
        self.set_rows_in(NAMESPACE_ROOT_CIMV2, class, rows);
    }

    pub fn set_rows_in(&self, namespace: &str, class: &str, rows: Vec<RawRow>) {
        self.write().classes.insert(class_key(namespace, class), rows);
    }

    /// Defines a counter object with the counters it exposes and one row per
    /// instance (each carrying `Name`).
    pub fn set_counter_object(&self, object: &str, counters: &[&str], rows: Vec<RawRow>) {
        self.write().objects.insert(
            object.to_ascii_lowercase(),
            CounterObject {
                counters: counters.iter().map(|c| c.to_string()).collect(),
                rows,
            },
        );
    }

    /// Replaces the instance rows of an existing counter object.
    pub fn set_counter_rows(&self, object: &str, rows: Vec<RawRow>) {
        if let Some(existing) = self.write().objects.get_mut(&object.to_ascii_lowercase()) {
            existing.rows = rows;
        }
    }

    pub fn remove_counter_object(&self, object: &str) {
        self.write().objects.remove(&object.to_ascii_lowercase());
    }

    /// Sets the root folder (`\`) of the task library.
    pub fn set_task_root(&self, root: MockFolder) {
        self.write().task_root = root;
    }

    pub fn fail_query(&self, class: &str, code: u32, message: &str) {
        self.write()
            .query_failures
            .insert(class.to_ascii_lowercase(), failure(code, message));
    }

    pub fn fail_open(&self, object: &str, code: u32, message: &str) {
        self.write()
            .open_failures
            .insert(object.to_ascii_lowercase(), failure(code, message));
    }

    pub fn fail_collect(&self, object: &str, code: u32, message: &str) {
        self.write()
            .collect_failures
            .insert(object.to_ascii_lowercase(), failure(code, message));
    }

    pub fn fail_task_scheduler(&self, code: u32, message: &str) {
        self.write().scheduler_failure = Some(failure(code, message));
    }

    /// Fails enumeration of the folder at `path` (e.g. `\Microsoft`).
    pub fn fail_folder(&self, path: &str, code: u32, message: &str) {
        self.write()
            .folder_failures
            .insert(path.to_ascii_lowercase(), failure(code, message));
    }

    pub fn clear_failures(&self) {
        let mut state = self.write();
        state.query_failures.clear();
        state.open_failures.clear();
        state.collect_failures.clear();
        state.scheduler_failure = None;
        state.folder_failures.clear();
    }

    /// Makes every call touching `name` (class, counter object or folder
    /// path) sleep for `delay` first.
    pub fn delay(&self, name: &str, delay: Duration) {
        self.write().delays.insert(name.to_ascii_lowercase(), delay);
    }

    pub fn clear_delays(&self) {
        self.write().delays.clear();
    }

    /// Number of `query` calls made against `class`.
    pub fn query_count(&self, class: &str) -> usize {
        self.read()
            .query_counts
            .get(&class.to_ascii_lowercase())
            .copied()
            .unwrap_or(0)
    }

    /// Counter handles opened and not yet dropped.
    pub fn open_handles(&self) -> usize {
        self.open_handles.load(Ordering::SeqCst)
    }

    /// Thread names `connect_task_scheduler` was called from.
    pub fn scheduler_threads(&self) -> Vec<Option<String>> {
        self.read().scheduler_threads.clone()
    }

    fn delay_for(&self, name: &str) -> Option<Duration> {
        self.read().delays.get(&name.to_ascii_lowercase()).copied()
    }
}

fn failure(code: u32, message: &str) -> Failure {
    Failure {
        code,
        message: message.to_string(),
    }
}

fn project(row: &RawRow, columns: &[String]) -> RawRow {
    let mut projected = RawRow::new();
    for column in columns {
        if let Some(value) = row.get(column) {
            projected.insert(column.clone(), value.clone());
        }
    }
    projected
}

impl NativeSession for MockSession {
    fn query(&self, namespace: &str, query: &Query) -> Result<Vec<RawRow>, SessionError> {
        let class = query.class().to_ascii_lowercase();
        let rows = {
            let mut state = self.write();
            *state.query_counts.entry(class.clone()).or_default() += 1;

            if let Some(f) = state.query_failures.get(&class) {
                return Err(SessionError::native(
                    format!("ExecQuery({})", query.class()),
                    f.code,
                    f.message.clone(),
                ));
            }
            state
                .classes
                .get(&class_key(namespace, query.class()))
                .cloned()
                .ok_or_else(|| SessionError::ObjectNotFound(query.class().to_string()))?
        };
        sleep_if(self.delay_for(&class));

        if query.selects_all() {
            Ok(rows)
        } else {
            Ok(rows.iter().map(|row| project(row, query.columns())).collect())
        }
    }

    fn open_counters(&self, spec: &CounterSetSpec) -> Result<Box<dyn CounterQuery>, SessionError> {
        let key = spec.object.to_ascii_lowercase();
        let state = self.read();

        if let Some(f) = state.open_failures.get(&key) {
            return Err(SessionError::native(
                format!("PdhAddEnglishCounter({})", spec.object),
                f.code,
                f.message.clone(),
            ));
        }
        let object = state
            .objects
            .get(&key)
            .ok_or_else(|| SessionError::ObjectNotFound(spec.object.clone()))?;

        let resolved: Vec<String> = spec
            .counters
            .iter()
            .filter(|c| object.counters.iter().any(|o| o.eq_ignore_ascii_case(c)))
            .cloned()
            .collect();

        self.open_handles.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockCounterQuery {
            session: self.clone(),
            spec: spec.clone(),
            resolved,
        }))
    }

    fn connect_task_scheduler(&self) -> Result<Box<dyn TaskScheduler>, SessionError> {
        let mut state = self.write();
        state
            .scheduler_threads
            .push(std::thread::current().name().map(str::to_string));

        if let Some(f) = &state.scheduler_failure {
            return Err(SessionError::native(
                "ITaskService::Connect",
                f.code,
                f.message.clone(),
            ));
        }
        Ok(Box::new(MockScheduler {
            session: self.clone(),
        }))
    }
}

struct MockCounterQuery {
    session: MockSession,
    spec: CounterSetSpec,
    resolved: Vec<String>,
}

impl CounterQuery for MockCounterQuery {
    fn object(&self) -> &str {
        &self.spec.object
    }

    fn resolved(&self) -> &[String] {
        &self.resolved
    }

    fn collect(&mut self) -> Result<Vec<RawRow>, SessionError> {
        let key = self.spec.object.to_ascii_lowercase();
        let rows = {
            let state = self.session.read();
            if let Some(f) = state.collect_failures.get(&key) {
                return Err(SessionError::native(
                    format!("PdhCollectQueryData({})", self.spec.object),
                    f.code,
                    f.message.clone(),
                ));
            }
            let object = state
                .objects
                .get(&key)
                .ok_or_else(|| SessionError::ObjectNotFound(self.spec.object.clone()))?;

            object
                .rows
                .iter()
                .filter(|row| {
                    let Instances::Named(names) = &self.spec.instances else {
                        return true;
                    };
                    match row.get(INSTANCE_FIELD) {
                        Some(crate::session::Value::Str(name)) => names.contains(name),
                        _ => false,
                    }
                })
                .map(|row| {
                    let name = row.get(INSTANCE_FIELD).cloned().unwrap_or("".into());
                    let mut projected = project(row, &self.resolved);
                    projected.insert(INSTANCE_FIELD, name);
                    projected
                })
                .collect::<Vec<_>>()
        };
        sleep_if(self.session.delay_for(&key));
        Ok(rows)
    }
}

impl Drop for MockCounterQuery {
    fn drop(&mut self) {
        self.session.open_handles.fetch_sub(1, Ordering::SeqCst);
    }
}

struct MockScheduler {
    session: MockSession,
}

impl TaskScheduler for MockScheduler {
    fn root_folder(&self) -> Result<Box<dyn TaskFolder>, SessionError> {
        let root = self.session.read().task_root.clone();
        Ok(Box::new(MockTaskFolder {
            session: self.session.clone(),
            path: "\\".to_string(),
            node: root,
        }))
    }
}

struct MockTaskFolder {
    session: MockSession,
    path: String,
    node: MockFolder,
}

impl MockTaskFolder {
    fn child_path(&self, name: &str) -> String {
        if self.path == "\\" {
            format!("\\{}", name)
        } else {
            format!("{}\\{}", self.path, name)
        }
    }

    fn check(&self, operation: &str) -> Result<(), SessionError> {
        sleep_if(self.session.delay_for(&self.path));
        let state = self.session.read();
        match state.folder_failures.get(&self.path.to_ascii_lowercase()) {
            Some(f) => Err(SessionError::native(
                format!("ITaskFolder::{}({})", operation, self.path),
                f.code,
                f.message.clone(),
            )),
            None => Ok(()),
        }
    }
}

impl TaskFolder for MockTaskFolder {
    fn path(&self) -> String {
        self.path.clone()
    }

    fn tasks(&self) -> Result<Vec<RawRow>, SessionError> {
        self.check("GetTasks")?;
        Ok(self
            .node
            .tasks
            .iter()
            .map(|task| {
                RawRow::new()
                    .with("Name", task.name.as_str())
                    .with("Path", self.child_path(&task.name))
                    .with("Enabled", task.enabled)
                    .with("State", task.state)
                    .with("NumberOfMissedRuns", task.missed_runs)
                    .with("LastTaskResult", task.last_result)
            })
            .collect())
    }

    fn folders(&self) -> Result<Vec<Box<dyn TaskFolder>>, SessionError> {
        self.check("GetFolders")?;
        Ok(self
            .node
            .folders
            .iter()
            .map(|folder| {
                Box::new(MockTaskFolder {
                    session: self.session.clone(),
                    path: self.child_path(&folder.name),
                    node: folder.clone(),
                }) as Box<dyn TaskFolder>
            })
            .collect())
    }
}
