//! Scheduled task state from the Task Scheduler library.
//!
//! The Task Scheduler automation session is apartment-bound, so the whole
//! enumeration (connect, walk every folder, release) runs as one job on the
//! collector's own [`ApartmentWorker`]. Only owned [`ScheduledTask`] values
//! leave that thread.

use std::sync::Arc;

use tracing::{debug, trace};

use crate::apartment::{ApartmentError, ApartmentWorker};
use crate::collector::{BuildContext, Collector};
use crate::config::{ConfigError, ScheduledTaskSettings};
use crate::counter_row;
use crate::error::CollectorError;
use crate::filter::InstanceFilter;
use crate::instances::walk_depth_first;
use crate::mapper::map_rows;
use crate::metric::Desc;
use crate::session::{NativeSession, RawRow, task_state};
use crate::sink::SampleSink;

pub const NAME: &str = "scheduled_task";

/// `LastTaskResult` of a successful run.
pub const SCHED_S_SUCCESS: u32 = 0x0000_0000;

/// `LastTaskResult` of a task that has never run.
pub const SCHED_S_TASK_HAS_NOT_RUN: u32 = 0x0004_1303;

/// Values of the `state` label, in emission order.
pub const TASK_STATES: [&str; 5] = ["disabled", "queued", "ready", "running", "unknown"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Unknown,
    Disabled,
    Queued,
    Ready,
    Running,
}

impl TaskState {
    /// Maps a raw `TASK_STATE` value; `None` for values outside the enum.
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            task_state::UNKNOWN => Some(TaskState::Unknown),
            task_state::DISABLED => Some(TaskState::Disabled),
            task_state::QUEUED => Some(TaskState::Queued),
            task_state::READY => Some(TaskState::Ready),
            task_state::RUNNING => Some(TaskState::Running),
            _ => None,
        }
    }

    /// Label value for this state.
    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Unknown => "unknown",
            TaskState::Disabled => "disabled",
            TaskState::Queued => "queued",
            TaskState::Ready => "ready",
            TaskState::Running => "running",
        }
    }
}

counter_row! {
    /// One registered task as delivered by the session.
    pub struct TaskRow {
        #[source = "Name"]
        pub name: String,
        #[source = "Path"]
        pub path: String,
        #[source = "Enabled", optional]
        pub enabled: bool,
        #[source = "State"]
        pub state: u32,
        #[source = "NumberOfMissedRuns"]
        pub missed_runs: i64,
        #[source = "LastTaskResult"]
        pub last_result: u32,
    }
}

/// A scheduled task, scoped to one collection.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledTask {
    pub name: String,
    /// Library path with `/` separators, e.g. `/Microsoft/Windows/Defrag/ScheduledDefrag`.
    pub path: String,
    pub enabled: bool,
    pub state: Option<TaskState>,
    pub missed_runs: f64,
    pub last_result: u32,
}

impl From<TaskRow> for ScheduledTask {
    fn from(row: TaskRow) -> Self {
        Self {
            path: row.path.replace('\\', "/"),
            name: row.name,
            enabled: row.enabled,
            state: TaskState::from_raw(row.state),
            missed_runs: row.missed_runs as f64,
            last_result: row.last_result,
        }
    }
}

/// Connects, walks the whole library and releases everything again.
///
/// Must run on an apartment worker.
fn enumerate(session: &dyn NativeSession) -> Result<Vec<ScheduledTask>, CollectorError> {
    let scheduler = session
        .connect_task_scheduler()
        .map_err(|e| CollectorError::session("get scheduled tasks: connect", e))?;
    let root = scheduler
        .root_folder()
        .map_err(|e| CollectorError::session("get scheduled tasks: open root folder", e))?;

    let mut raw: Vec<RawRow> = Vec::new();
    walk_depth_first(root, |task| {
        raw.push(task);
        Ok(())
    })
    .map_err(|e| CollectorError::session("get scheduled tasks: enumerate", e))?;

    let rows: Vec<TaskRow> =
        map_rows(&raw).map_err(|e| CollectorError::mapping("get scheduled tasks", e))?;
    Ok(rows.into_iter().map(ScheduledTask::from).collect())
}

struct TaskDescs {
    last_result: Arc<Desc>,
    missed_runs: Arc<Desc>,
    state: Arc<Desc>,
}

pub struct ScheduledTaskCollector {
    filter: InstanceFilter,
    session: Option<Arc<dyn NativeSession>>,
    worker: Option<ApartmentWorker>,
    descs: Option<TaskDescs>,
}

impl ScheduledTaskCollector {
    pub fn new(settings: &ScheduledTaskSettings) -> Result<Self, ConfigError> {
        Ok(Self {
            filter: settings.filter.compile("collector.scheduled_task")?,
            session: None,
            worker: None,
            descs: None,
        })
    }
}

impl Collector for ScheduledTaskCollector {
    fn name(&self) -> &'static str {
        NAME
    }

    fn build(&mut self, ctx: &mut BuildContext<'_>) -> Result<(), CollectorError> {
        self.descs = Some(TaskDescs {
            last_result: ctx.desc(
                NAME,
                "last_result",
                "The result that was returned the last time the registered task was run",
                &["task"],
            )?,
            missed_runs: ctx.desc(
                NAME,
                "missed_runs",
                "The number of times the registered task missed a scheduled run",
                &["task"],
            )?,
            state: ctx.desc(
                NAME,
                "state",
                "The current state of a scheduled task",
                &["task", "state"],
            )?,
        });
        self.worker = Some(ApartmentWorker::spawn(NAME)?);
        self.session = Some(Arc::clone(ctx.session()));
        Ok(())
    }

    fn collect(&mut self, sink: &SampleSink) -> Result<(), CollectorError> {
        let (Some(worker), Some(session), Some(d)) = (&self.worker, &self.session, &self.descs)
        else {
            return Err(CollectorError::Apartment(ApartmentError::WorkerGone));
        };

        let session = Arc::clone(session);
        let tasks = worker.run(move || enumerate(session.as_ref()))??;
        debug!(tasks = tasks.len(), "scheduled tasks enumerated");

        for task in &tasks {
            if !self.filter.matches(&task.path) {
                trace!(task = %task.path, "task filtered out");
                continue;
            }

            let current = task.state.map(TaskState::as_str);
            for state in TASK_STATES {
                let value = if current == Some(state) { 1.0 } else { 0.0 };
                sink.gauge(&d.state, value, &[&task.path, state])?;
            }

            if task.last_result == SCHED_S_TASK_HAS_NOT_RUN {
                continue;
            }

            let last_result = if task.last_result == SCHED_S_SUCCESS {
                1.0
            } else {
                0.0
            };
            sink.gauge(&d.last_result, last_result, &[&task.path])?;
            sink.gauge(&d.missed_runs, task.missed_runs, &[&task.path])?;
        }

        Ok(())
    }

    fn close(&mut self) -> Result<(), CollectorError> {
        if let Some(mut worker) = self.worker.take() {
            worker.shutdown();
        }
        self.session = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::testing;
    use crate::config::FilterSettings;
    use crate::metric::Sample;
    use crate::session::{MockFolder, MockSession, MockTask};

    fn collector(include: &str, exclude: &str) -> ScheduledTaskCollector {
        ScheduledTaskCollector::new(&ScheduledTaskSettings {
            filter: FilterSettings {
                include: include.to_string(),
                exclude: exclude.to_string(),
            },
        })
        .unwrap()
    }

    fn scrape(session: &MockSession, include: &str, exclude: &str) -> Vec<Sample> {
        let mut collector = collector(include, exclude);
        let descs = testing::build(&mut collector, Arc::new(session.clone())).unwrap();
        let (result, samples) = testing::collect(&mut collector, &descs);
        result.unwrap();
        collector.close().unwrap();
        samples
    }

    fn states_of<'a>(samples: &'a [Sample], task: &str) -> Vec<(&'a str, f64)> {
        samples
            .iter()
            .filter(|s| s.desc.fq_name() == "windows_scheduled_task_state")
            .filter(|s| s.label("task") == Some(task))
            .filter_map(|s| s.label("state").map(|state| (state, s.value)))
            .collect()
    }

    #[test]
    fn running_task_sets_exactly_one_state() {
        let samples = scrape(&MockSession::typical_host(), ".+", "");
        assert_eq!(
            states_of(&samples, "/Sync"),
            vec![
                ("disabled", 0.0),
                ("queued", 0.0),
                ("ready", 0.0),
                ("running", 1.0),
                ("unknown", 0.0),
            ]
        );
    }

    #[test]
    fn task_that_never_ran_has_no_result_samples() {
        let samples = scrape(&MockSession::typical_host(), ".+", "");
        let task = "/Microsoft/Windows/Defrag/ScheduledDefrag";
        assert_eq!(states_of(&samples, task).len(), 5);
        assert!(
            samples
                .iter()
                .filter(|s| s.label("task") == Some(task))
                .all(|s| s.desc.fq_name() == "windows_scheduled_task_state")
        );
    }

    #[test]
    fn last_result_and_missed_runs() {
        let samples = scrape(&MockSession::typical_host(), ".+", "");
        let last = "windows_scheduled_task_last_result";
        let missed = "windows_scheduled_task_missed_runs";
        assert_eq!(testing::value(&samples, last, &["/Backup"]), Some(1.0));
        assert_eq!(testing::value(&samples, last, &["/Sync"]), Some(0.0));
        assert_eq!(testing::value(&samples, missed, &["/Sync"]), Some(2.0));
    }

    #[test]
    fn every_task_in_typical_library_is_reported() {
        let samples = scrape(&MockSession::typical_host(), ".+", "");
        // 5 tasks x 5 states, plus 2 result samples for the 4 that ran.
        assert_eq!(samples.len(), 25 + 8);
    }

    #[test]
    fn filter_applies_to_slash_separated_path() {
        let samples = scrape(
            &MockSession::typical_host(),
            "/Microsoft/.+",
            "/Microsoft/Windows/Defrag/.*",
        );
        let tasks: std::collections::BTreeSet<_> =
            samples.iter().filter_map(|s| s.label("task")).collect();
        assert_eq!(
            tasks.into_iter().collect::<Vec<_>>(),
            vec![
                "/Microsoft/Windows/UpdateOrchestrator/Reboot",
                "/Microsoft/Windows/UpdateOrchestrator/Schedule Scan",
            ]
        );
    }

    #[test]
    fn deep_library_visits_every_task_once() {
        for depth in [1usize, 3, 10, 25] {
            let samples = scrape(&MockSession::deep_task_tree(depth), ".+", "");
            let states = samples
                .iter()
                .filter(|s| s.desc.fq_name() == "windows_scheduled_task_state")
                .count();
            assert_eq!(states, 5 * (2 * depth + 1), "depth {}", depth);
        }
    }

    #[test]
    fn out_of_range_state_reports_all_zero() {
        let session = MockSession::new();
        session.set_task_root(MockFolder::new("").with_task(MockTask::new("Odd", 9)));
        let samples = scrape(&session, ".+", "");
        let states = states_of(&samples, "/Odd");
        assert_eq!(states.len(), 5);
        assert!(states.iter().all(|(_, v)| *v == 0.0));
    }

    #[test]
    fn enumeration_runs_on_the_apartment_worker() {
        let session = MockSession::typical_host();
        let mut collector = collector(".+", "");
        let descs = testing::build(&mut collector, Arc::new(session.clone())).unwrap();
        for _ in 0..3 {
            testing::collect(&mut collector, &descs).0.unwrap();
        }
        collector.close().unwrap();

        let threads = session.scheduler_threads();
        assert_eq!(threads.len(), 3);
        assert!(threads.iter().all(|t| t.as_deref() == Some(NAME)));
    }

    #[test]
    fn connect_failure_is_reported_without_samples() {
        let session = MockSession::typical_host();
        session.fail_task_scheduler(0x8007_0005, "Access is denied.");
        let mut collector = collector(".+", "");
        let descs = testing::build(&mut collector, Arc::new(session)).unwrap();

        let (result, samples) = testing::collect(&mut collector, &descs);
        let err = result.unwrap_err();
        assert!(err.to_string().starts_with("get scheduled tasks"));
        assert!(samples.is_empty());
    }

    #[test]
    fn folder_failure_fails_the_whole_enumeration() {
        let session = MockSession::typical_host();
        session.fail_folder("\\Microsoft\\Windows", 0x8007_0005, "Access is denied.");
        let mut collector = collector(".+", "");
        let descs = testing::build(&mut collector, Arc::new(session)).unwrap();

        let (result, samples) = testing::collect(&mut collector, &descs);
        assert!(result.is_err());
        assert!(samples.is_empty());
    }

    #[test]
    fn collect_after_close_fails() {
        let session = MockSession::typical_host();
        let mut collector = collector(".+", "");
        let descs = testing::build(&mut collector, Arc::new(session)).unwrap();
        collector.close().unwrap();
        let (result, _) = testing::collect(&mut collector, &descs);
        assert!(matches!(
            result,
            Err(CollectorError::Apartment(ApartmentError::WorkerGone))
        ));
    }

    #[test]
    fn repeated_collect_is_idempotent() {
        let session = MockSession::typical_host();
        let mut collector = collector(".+", "");
        let descs = testing::build(&mut collector, Arc::new(session)).unwrap();
        let (_, first) = testing::collect(&mut collector, &descs);
        let (_, second) = testing::collect(&mut collector, &descs);
        assert_eq!(first, second);
        collector.close().unwrap();
    }
}
