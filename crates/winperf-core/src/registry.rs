//! Collector registry: drives every collector through its lifecycle.
//!
//! ```text
//!            build(session)              scrape() per cycle            close()
//! Constructed ──────────────► Built ──────────────────────► Built ──────────► Closed
//!      │                                   │
//!      └──── build error ──► Failed        └─ one thread per collector,
//!            (closed, skipped)                one bounded channel, one deadline
//! ```
//!
//! During a scrape every built collector runs on its own thread and emits
//! through a [`SampleSink`] into a single bounded channel. The calling
//! thread drains that channel until every collector reported back or the
//! scrape timeout elapsed. Collectors that miss the deadline are reported as
//! timed out and whatever they emitted is discarded; once the channel is
//! dropped their next emit fails with `SinkClosed` and they wind down.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use crossbeam_channel::{RecvTimeoutError, bounded};
use tracing::{debug, info, info_span, warn};

use crate::apartment::{ApartmentError, panic_message};
use crate::collector::{BuildContext, Collector};
use crate::config::{Config, ConfigError};
use crate::error::{CollectorError, ErrorList};
use crate::metric::{Desc, DescRegistry, NAMESPACE, Sample, ValueKind, fq_name};
use crate::session::NativeSession;
use crate::sink::{Envelope, SampleSink};

/// Capacity of the per-scrape emission channel.
const CHANNEL_CAPACITY: usize = 4096;

/// Subsystem of the registry's own metrics.
const SELF_SUBSYSTEM: &str = "exporter";

/// Lifecycle state of one registered collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Constructed,
    Built,
    /// `build` failed; the collector was closed and takes no part in scrapes.
    Failed,
    Closed,
}

struct Entry {
    name: &'static str,
    collector: Arc<Mutex<Box<dyn Collector>>>,
    state: State,
    /// Set while a `collect` of this collector is in flight.
    busy: Arc<AtomicBool>,
    descs: Arc<HashMap<String, Arc<Desc>>>,
}

fn lock(collector: &Mutex<Box<dyn Collector>>) -> MutexGuard<'_, Box<dyn Collector>> {
    collector.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Clears the busy flag when the collect thread ends, panicking or not.
struct BusyGuard(Arc<AtomicBool>);

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

struct SelfDescs {
    duration: Arc<Desc>,
    success: Arc<Desc>,
    timeout: Arc<Desc>,
}

impl SelfDescs {
    fn register(descs: &mut DescRegistry) -> Result<Self, CollectorError> {
        let name = |suffix: &str| fq_name(NAMESPACE, SELF_SUBSYSTEM, suffix);
        Ok(Self {
            duration: descs.register(
                name("collector_duration_seconds"),
                "windows_exporter: Duration of a collection.",
                &["collector"],
            )?,
            success: descs.register(
                name("collector_success"),
                "windows_exporter: Whether the collector was successful.",
                &["collector"],
            )?,
            timeout: descs.register(
                name("collector_timeout"),
                "windows_exporter: Whether the collector timed out.",
                &["collector"],
            )?,
        })
    }
}

/// How one collector fared in a scrape.
#[derive(Debug)]
pub struct CollectorOutcome {
    pub collector: &'static str,
    pub duration: Duration,
    pub result: Result<(), CollectorError>,
}

impl CollectorOutcome {
    pub fn succeeded(&self) -> bool {
        self.result.is_ok()
    }

    pub fn timed_out(&self) -> bool {
        matches!(self.result, Err(CollectorError::TimedOut(_)))
    }
}

/// Result of one scrape cycle.
#[derive(Debug)]
pub struct Scrape {
    pub started_at: DateTime<Utc>,
    /// Collector samples in registration order, followed by the registry's
    /// own per-collector metrics.
    pub samples: Vec<Sample>,
    /// One outcome per built collector, in registration order.
    pub outcomes: Vec<CollectorOutcome>,
}

impl Scrape {
    /// True when collectors ran and none of them succeeded.
    pub fn is_failed(&self) -> bool {
        !self.outcomes.is_empty() && !self.outcomes.iter().any(CollectorOutcome::succeeded)
    }

    /// Failed collectors with their errors.
    pub fn failures(&self) -> impl Iterator<Item = (&'static str, &CollectorError)> {
        self.outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().err().map(|e| (o.collector, e)))
    }
}

/// Owns the enabled collectors and runs scrapes over them.
pub struct Registry {
    entries: Vec<Entry>,
    descs: DescRegistry,
    self_descs: SelfDescs,
    timeout: Duration,
}

impl Registry {
    /// A registry over `collectors`, in the given order.
    pub fn new(
        collectors: Vec<Box<dyn Collector>>,
        timeout: Duration,
    ) -> Result<Self, CollectorError> {
        let mut descs = DescRegistry::new();
        let self_descs = SelfDescs::register(&mut descs)?;

        let entries = collectors
            .into_iter()
            .map(|collector| Entry {
                name: collector.name(),
                collector: Arc::new(Mutex::new(collector)),
                state: State::Constructed,
                busy: Arc::new(AtomicBool::new(false)),
                descs: Arc::new(HashMap::new()),
            })
            .collect();

        Ok(Self {
            entries,
            descs,
            self_descs,
            timeout,
        })
    }

    /// Constructs every enabled collector from `config`.
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        config.validate()?;
        let mut collectors = Vec::new();
        for kind in config.enabled_collectors()? {
            collectors.push(kind.create(config)?);
        }
        Self::new(collectors, config.scrape.timeout)
            .map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Names of the registered collectors, in registration order.
    pub fn names(&self) -> Vec<&'static str> {
        self.entries.iter().map(|e| e.name).collect()
    }

    pub fn state(&self, collector: &str) -> Option<State> {
        self.entries
            .iter()
            .find(|e| e.name == collector)
            .map(|e| e.state)
    }

    /// Builds every constructed collector against `session`.
    ///
    /// A collector whose build fails is closed right away and skipped by
    /// later scrapes; the others stay usable. All build failures are
    /// returned together.
    pub fn build(&mut self, session: Arc<dyn NativeSession>) -> Result<(), CollectorError> {
        let mut errors = ErrorList::new();

        for entry in &mut self.entries {
            if entry.state != State::Constructed {
                continue;
            }
            let span = info_span!("collector", collector = entry.name);
            let _enter = span.enter();

            let mut collector = lock(&entry.collector);
            let mut ctx = BuildContext::new(Arc::clone(&session), &mut self.descs, entry.name);
            let result = collector.build(&mut ctx);
            let registered = ctx.into_registered();

            match result {
                Ok(()) => {
                    entry.descs = Arc::new(
                        registered
                            .into_iter()
                            .map(|d| (d.fq_name().to_string(), d))
                            .collect(),
                    );
                    entry.state = State::Built;
                    info!(metrics = entry.descs.len(), "collector built");
                }
                Err(e) => {
                    warn!(error = %e, "collector build failed");
                    if let Err(close) = collector.close() {
                        debug!(error = %close, "close after failed build");
                    }
                    entry.state = State::Failed;
                    errors.push(e.named(entry.name));
                }
            }
        }

        errors.finish()
    }

    /// Runs one collection cycle over every built collector.
    ///
    /// # Panics
    ///
    /// Re-raises a panic from a collector's `collect` (a contract violation
    /// such as emitting against an unregistered descriptor).
    pub fn scrape(&mut self) -> Scrape {
        let started_at = Utc::now();
        let started = Instant::now();
        let deadline = started + self.timeout;

        let built: Vec<usize> = (0..self.entries.len())
            .filter(|&i| self.entries[i].state == State::Built)
            .collect();
        let mut results: HashMap<usize, (Result<(), CollectorError>, Duration)> = HashMap::new();
        let mut buffers: HashMap<usize, Vec<Sample>> = HashMap::new();

        let (tx, rx) = bounded::<Envelope>(CHANNEL_CAPACITY);
        let mut running = 0usize;

        for &i in &built {
            let entry = &self.entries[i];
            if entry.busy.swap(true, Ordering::SeqCst) {
                warn!(collector = entry.name, "previous collection still running");
                results.insert(i, (Err(CollectorError::Busy), Duration::ZERO));
                continue;
            }

            let sink = SampleSink::new(tx.clone(), i, Arc::clone(&entry.descs));
            let done = tx.clone();
            let collector = Arc::clone(&entry.collector);
            let busy = BusyGuard(Arc::clone(&entry.busy));
            let span = info_span!("collector", collector = entry.name);

            let spawned = std::thread::Builder::new()
                .name(format!("collect-{}", entry.name))
                .spawn(move || {
                    let _busy = busy;
                    let _enter = span.enter();
                    let begin = Instant::now();
                    let outcome =
                        catch_unwind(AssertUnwindSafe(|| lock(&collector).collect(&sink)));
                    let envelope = match outcome {
                        Ok(result) => Envelope::Done {
                            collector: i,
                            result,
                            duration: begin.elapsed(),
                        },
                        Err(payload) => Envelope::Panicked {
                            collector: i,
                            message: panic_message(payload.as_ref()),
                        },
                    };
                    // Nobody is listening after a timeout.
                    let _ = done.send(envelope);
                });

            match spawned {
                Ok(_) => running += 1,
                Err(e) => {
                    // The closure (and its busy guard) was dropped with the error.
                    results.insert(i, (Err(ApartmentError::Spawn(e).into()), Duration::ZERO));
                }
            }
        }
        drop(tx);

        let mut panicked: Option<(&'static str, String)> = None;
        while running > 0 {
            let Some(left) = deadline.checked_duration_since(Instant::now()) else {
                break;
            };
            match rx.recv_timeout(left) {
                Ok(Envelope::Sample { collector, sample }) => {
                    buffers.entry(collector).or_default().push(sample);
                }
                Ok(Envelope::Done {
                    collector,
                    result,
                    duration,
                }) => {
                    running -= 1;
                    results.insert(collector, (result, duration));
                }
                Ok(Envelope::Panicked { collector, message }) => {
                    panicked = Some((self.entries[collector].name, message));
                    break;
                }
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        drop(rx);

        if let Some((name, message)) = panicked {
            std::panic::resume_unwind(Box::new(format!(
                "collector {} panicked: {}",
                name, message
            )));
        }

        let mut samples = Vec::new();
        let mut outcomes = Vec::with_capacity(built.len());
        for &i in &built {
            let name = self.entries[i].name;
            let (result, duration) = results
                .remove(&i)
                .unwrap_or((Err(CollectorError::TimedOut(self.timeout)), started.elapsed()));

            match &result {
                Ok(()) => {
                    samples.extend(buffers.remove(&i).unwrap_or_default());
                    debug!(
                        collector = name,
                        duration_seconds = duration.as_secs_f64(),
                        "collector succeeded"
                    );
                }
                Err(CollectorError::TimedOut(_)) => {
                    warn!(collector = name, timeout = ?self.timeout, "collector timed out");
                }
                Err(e) => {
                    // Whatever was emitted before the failure is still valid for this cycle.
                    samples.extend(buffers.remove(&i).unwrap_or_default());
                    warn!(collector = name, error = %e, "collector failed");
                }
            }

            outcomes.push(CollectorOutcome {
                collector: name,
                duration,
                result,
            });
        }

        samples.extend(self.self_samples(&outcomes));
        Scrape {
            started_at,
            samples,
            outcomes,
        }
    }

    fn self_samples(&self, outcomes: &[CollectorOutcome]) -> Vec<Sample> {
        let d = &self.self_descs;
        let gauge = |desc: &Arc<Desc>, value: f64, collector: &str| Sample {
            desc: Arc::clone(desc),
            kind: ValueKind::Gauge,
            value,
            label_values: vec![collector.to_string()],
        };
        let flag = |b: bool| if b { 1.0 } else { 0.0 };

        let mut samples = Vec::with_capacity(outcomes.len() * 3);
        for o in outcomes {
            samples.push(gauge(&d.duration, o.duration.as_secs_f64(), o.collector));
            samples.push(gauge(&d.success, flag(o.succeeded()), o.collector));
            samples.push(gauge(&d.timeout, flag(o.timed_out()), o.collector));
        }
        samples
    }

    /// Closes every built collector exactly once.
    ///
    /// A collection still in flight is waited for before its collector is
    /// closed.
    pub fn close(&mut self) -> Result<(), CollectorError> {
        let mut errors = ErrorList::new();
        for entry in &mut self.entries {
            if entry.state != State::Built {
                continue;
            }
            let span = info_span!("collector", collector = entry.name);
            let _enter = span.enter();

            if let Err(e) = lock(&entry.collector).close() {
                warn!(error = %e, "collector close failed");
                errors.push(e.named(entry.name));
            } else {
                debug!("collector closed");
            }
            entry.state = State::Closed;
        }
        errors.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::netframework;
    use crate::session::MockSession;
    use std::sync::atomic::AtomicUsize;

    /// A collector whose behaviour is scripted by the test.
    struct Probe {
        name: &'static str,
        fail_build: bool,
        fail_collect: bool,
        rogue: bool,
        closes: Arc<AtomicUsize>,
        desc: Option<Arc<Desc>>,
    }

    impl Probe {
        fn new(name: &'static str) -> Self {
            Self {
                name,
                fail_build: false,
                fail_collect: false,
                rogue: false,
                closes: Arc::new(AtomicUsize::new(0)),
                desc: None,
            }
        }
    }

    impl Collector for Probe {
        fn name(&self) -> &'static str {
            self.name
        }

        fn build(&mut self, ctx: &mut BuildContext<'_>) -> Result<(), CollectorError> {
            if self.fail_build {
                return Err(CollectorError::Config(format!("{} cannot start", self.name)));
            }
            self.desc = Some(ctx.desc(self.name, "up", "Always one.", &[])?);
            Ok(())
        }

        fn collect(&mut self, sink: &SampleSink) -> Result<(), CollectorError> {
            if self.rogue {
                let mut foreign = DescRegistry::new();
                let desc =
                    foreign.register("windows_rogue_metric".into(), "Never registered.", &[])?;
                sink.gauge(&desc, 1.0, &[])?;
            }
            if let Some(desc) = &self.desc {
                sink.gauge(desc, 1.0, &[])?;
            }
            if self.fail_collect {
                return Err(CollectorError::NoData(self.name.to_string()));
            }
            Ok(())
        }

        fn close(&mut self) -> Result<(), CollectorError> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn registry(collectors: Vec<Box<dyn Collector>>, timeout: Duration) -> Registry {
        Registry::new(collectors, timeout).unwrap()
    }

    fn self_metric(scrape: &Scrape, suffix: &str, collector: &str) -> Option<f64> {
        let name = format!("windows_exporter_collector_{}", suffix);
        scrape
            .samples
            .iter()
            .find(|s| s.desc.fq_name() == name && s.label("collector") == Some(collector))
            .map(|s| s.value)
    }

    #[test]
    fn default_config_scrapes_typical_host() {
        let mut registry = Registry::from_config(&Config::default()).unwrap();
        registry.build(Arc::new(MockSession::typical_host())).unwrap();
        assert_eq!(registry.names(), vec!["netframework", "scheduled_task", "vmware"]);

        let scrape = registry.scrape();
        assert!(!scrape.is_failed());
        assert_eq!(scrape.failures().count(), 0);
        assert_eq!(scrape.outcomes.len(), 3);
        for name in registry.names() {
            assert_eq!(self_metric(&scrape, "success", name), Some(1.0));
            assert_eq!(self_metric(&scrape, "timeout", name), Some(0.0));
        }

        registry.close().unwrap();
        assert_eq!(registry.state("vmware"), Some(State::Closed));
    }

    #[test]
    fn samples_follow_registration_order() {
        let mut registry = Registry::from_config(&Config::default()).unwrap();
        registry.build(Arc::new(MockSession::typical_host())).unwrap();
        let scrape = registry.scrape();

        let subsystem = |s: &Sample| -> &'static str {
            let name = s.desc.fq_name();
            if name.starts_with("windows_netframework_") {
                "netframework"
            } else if name.starts_with("windows_scheduled_task_") {
                "scheduled_task"
            } else if name.starts_with("windows_vmware_") {
                "vmware"
            } else {
                "exporter"
            }
        };
        let mut order: Vec<&str> = scrape.samples.iter().map(subsystem).collect();
        order.dedup();
        assert_eq!(order, vec!["netframework", "scheduled_task", "vmware", "exporter"]);
        registry.close().unwrap();
    }

    #[test]
    fn build_failures_are_joined_and_named() {
        let mut a = Probe::new("a");
        a.fail_build = true;
        let a_closes = Arc::clone(&a.closes);
        let mut c = Probe::new("c");
        c.fail_build = true;

        let mut registry = registry(
            vec![Box::new(a), Box::new(Probe::new("b")), Box::new(c)],
            Duration::from_secs(5),
        );
        let err = registry.build(Arc::new(MockSession::new())).unwrap_err();
        assert_eq!(err.count(), 2);
        let text = err.to_string();
        assert!(text.contains("collector a: configuration: a cannot start"));
        assert!(text.contains("collector c: configuration: c cannot start"));

        assert_eq!(registry.state("a"), Some(State::Failed));
        assert_eq!(registry.state("b"), Some(State::Built));
        assert_eq!(a_closes.load(Ordering::SeqCst), 1);

        let scrape = registry.scrape();
        assert_eq!(scrape.outcomes.len(), 1);
        assert_eq!(scrape.outcomes[0].collector, "b");

        registry.close().unwrap();
        // Failed collectors were closed once, during build.
        assert_eq!(a_closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn missing_vmware_objects_only_disable_vmware() {
        let mut registry = Registry::from_config(&Config::default()).unwrap();
        let err = registry.build(Arc::new(MockSession::dotnet_only())).unwrap_err();
        assert_eq!(err.count(), 2);
        assert!(err.to_string().contains("collector vmware"));
        assert_eq!(registry.state("vmware"), Some(State::Failed));

        let scrape = registry.scrape();
        let ran: Vec<_> = scrape.outcomes.iter().map(|o| o.collector).collect();
        assert_eq!(ran, vec!["netframework", "scheduled_task"]);
        assert!(scrape.outcomes.iter().all(CollectorOutcome::succeeded));
        registry.close().unwrap();
    }

    #[test]
    fn one_failing_collector_does_not_fail_the_scrape() {
        let mut broken = Probe::new("broken");
        broken.fail_collect = true;
        let mut registry = registry(
            vec![Box::new(broken), Box::new(Probe::new("fine"))],
            Duration::from_secs(5),
        );
        registry.build(Arc::new(MockSession::new())).unwrap();

        let scrape = registry.scrape();
        assert!(!scrape.is_failed());
        let failures: Vec<_> = scrape.failures().map(|(name, _)| name).collect();
        assert_eq!(failures, vec!["broken"]);
        assert_eq!(self_metric(&scrape, "success", "broken"), Some(0.0));
        assert_eq!(self_metric(&scrape, "success", "fine"), Some(1.0));
        // Samples emitted before the failure are kept.
        assert!(
            scrape
                .samples
                .iter()
                .any(|s| s.desc.fq_name() == "windows_broken_up")
        );
        registry.close().unwrap();
    }

    #[test]
    fn scrape_fails_only_when_every_collector_fails() {
        let mut only = Probe::new("only");
        only.fail_collect = true;
        let mut registry = registry(vec![Box::new(only)], Duration::from_secs(5));
        registry.build(Arc::new(MockSession::new())).unwrap();
        assert!(registry.scrape().is_failed());
        registry.close().unwrap();

        let mut empty = registry_empty();
        assert!(!empty.scrape().is_failed());
    }

    fn registry_empty() -> Registry {
        let mut registry = registry(Vec::new(), Duration::from_secs(1));
        registry.build(Arc::new(MockSession::new())).unwrap();
        registry
    }

    #[test]
    fn slow_collector_times_out_and_is_busy_next_cycle() {
        let session = MockSession::typical_host();
        session.delay(
            "Win32_PerfRawData_NETFramework_NETCLRJit",
            Duration::from_millis(600),
        );

        let mut config = Config::default();
        config.scrape.timeout = Duration::from_millis(150);
        let mut registry = Registry::from_config(&config).unwrap();
        registry.build(Arc::new(session.clone())).unwrap();

        let scrape = registry.scrape();
        assert!(!scrape.is_failed());
        let outcome = scrape
            .outcomes
            .iter()
            .find(|o| o.collector == netframework::NAME)
            .unwrap();
        assert!(outcome.timed_out());
        assert_eq!(self_metric(&scrape, "timeout", netframework::NAME), Some(1.0));
        assert_eq!(self_metric(&scrape, "success", netframework::NAME), Some(0.0));
        // Exceptions were emitted before the slow JIT query, but the whole
        // collector's output is discarded.
        assert!(
            scrape
                .samples
                .iter()
                .all(|s| !s.desc.fq_name().starts_with("windows_netframework_"))
        );
        assert_eq!(self_metric(&scrape, "success", "vmware"), Some(1.0));

        let again = registry.scrape();
        let outcome = again
            .outcomes
            .iter()
            .find(|o| o.collector == netframework::NAME)
            .unwrap();
        assert!(matches!(outcome.result, Err(CollectorError::Busy)));

        session.clear_delays();
        std::thread::sleep(Duration::from_millis(800));
        let recovered = registry.scrape();
        assert!(recovered.outcomes.iter().all(CollectorOutcome::succeeded));

        registry.close().unwrap();
    }

    #[test]
    #[should_panic(expected = "collector rogue panicked")]
    fn contract_violation_is_reraised() {
        let mut rogue = Probe::new("rogue");
        rogue.rogue = true;
        let mut registry = registry(vec![Box::new(rogue)], Duration::from_secs(5));
        registry.build(Arc::new(MockSession::new())).unwrap();
        registry.scrape();
    }

    #[test]
    fn close_runs_once_per_collector() {
        let probe = Probe::new("p");
        let closes = Arc::clone(&probe.closes);
        let mut registry = registry(vec![Box::new(probe)], Duration::from_secs(5));
        registry.build(Arc::new(MockSession::new())).unwrap();

        registry.close().unwrap();
        registry.close().unwrap();
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert!(registry.scrape().outcomes.is_empty());
    }

    #[test]
    fn repeated_scrapes_report_identical_values() {
        let mut registry = Registry::from_config(&Config::default()).unwrap();
        registry.build(Arc::new(MockSession::typical_host())).unwrap();

        let values = |scrape: &Scrape| -> Vec<(String, Vec<String>, f64)> {
            scrape
                .samples
                .iter()
                .filter(|s| s.desc.fq_name() != "windows_exporter_collector_duration_seconds")
                .map(|s| (s.desc.fq_name().to_string(), s.label_values.clone(), s.value))
                .collect()
        };
        let first = registry.scrape();
        let second = registry.scrape();
        assert_eq!(values(&first), values(&second));
        registry.close().unwrap();
    }

    #[test]
    fn unknown_collector_in_config_is_rejected() {
        let config = Config::from_yaml_str("collectors:\n  enabled: netframework,cpu\n").unwrap();
        assert!(matches!(
            Registry::from_config(&config),
            Err(ConfigError::UnknownCollector(_))
        ));
    }
}
