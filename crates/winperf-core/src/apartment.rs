//! Dedicated worker threads for apartment-bound native sessions.
//!
//! Some native sessions (Task Scheduler automation) must be initialised,
//! used and torn down on one thread. An [`ApartmentWorker`] owns exactly one
//! OS thread and runs submitted jobs on it in order, so the whole lifetime of
//! such a session stays on that thread no matter which thread submits.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::thread::JoinHandle;

use crossbeam_channel::{Sender, bounded, unbounded};
use tracing::{debug, warn};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Error type for jobs submitted to an [`ApartmentWorker`].
#[derive(Debug)]
pub enum ApartmentError {
    /// The worker thread could not be started.
    Spawn(std::io::Error),
    /// The worker has shut down or its thread died.
    WorkerGone,
    /// The job panicked; the payload message is kept.
    Panicked(String),
}

impl std::fmt::Display for ApartmentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApartmentError::Spawn(e) => write!(f, "failed to start worker thread: {}", e),
            ApartmentError::WorkerGone => write!(f, "worker thread is gone"),
            ApartmentError::Panicked(msg) => write!(f, "job panicked: {}", msg),
        }
    }
}

impl std::error::Error for ApartmentError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ApartmentError::Spawn(e) => Some(e),
            _ => None,
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// A single OS thread fed by a job queue.
#[derive(Debug)]
pub struct ApartmentWorker {
    name: String,
    jobs: Option<Sender<Job>>,
    thread: Option<JoinHandle<()>>,
}

impl ApartmentWorker {
    /// Starts the worker thread.
    pub fn spawn(name: impl Into<String>) -> Result<Self, ApartmentError> {
        let name = name.into();
        let (tx, rx) = unbounded::<Job>();

        let thread = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                for job in rx {
                    job();
                }
            })
            .map_err(ApartmentError::Spawn)?;

        debug!(worker = %name, "apartment worker started");
        Ok(Self {
            name,
            jobs: Some(tx),
            thread: Some(thread),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Runs `job` on the worker thread and waits for its result.
    ///
    /// Jobs run one at a time in submission order. A panicking job does not
    /// take the worker down.
    pub fn run<F, T>(&self, job: F) -> Result<T, ApartmentError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let jobs = self.jobs.as_ref().ok_or(ApartmentError::WorkerGone)?;
        let (result_tx, result_rx) = bounded(1);

        let wrapped: Job = Box::new(move || {
            let result = catch_unwind(AssertUnwindSafe(job))
                .map_err(|payload| ApartmentError::Panicked(panic_message(payload.as_ref())));
            // The submitter may have gone away; nothing to report to then.
            let _ = result_tx.send(result);
        });

        jobs.send(wrapped).map_err(|_| ApartmentError::WorkerGone)?;
        result_rx.recv().map_err(|_| ApartmentError::WorkerGone)?
    }

    /// Closes the queue and joins the thread once the last job finished.
    pub fn shutdown(&mut self) {
        self.jobs.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!(worker = %self.name, "apartment worker thread panicked");
            } else {
                debug!(worker = %self.name, "apartment worker stopped");
            }
        }
    }
}

impl Drop for ApartmentWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}
