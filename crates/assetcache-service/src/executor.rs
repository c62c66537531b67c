//! Where the cache does its work, and where it delivers results.

use std::fmt;

use tokio::runtime::Handle;
use tokio::sync::mpsc;

/// A result delivery, ready to be run.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Runs result deliveries in the caller's preferred context.
pub trait CompletionExecutor: fmt::Debug + Send + Sync + 'static {
    fn execute(&self, job: Job);
}

/// Runs deliveries right away, on whichever thread produced the result.
#[derive(Clone, Copy, Debug, Default)]
pub struct InlineExecutor;

impl CompletionExecutor for InlineExecutor {
    fn execute(&self, job: Job) {
        job()
    }
}

/// Runs deliveries one after another on a single task, in the order they were submitted.
#[derive(Clone, Debug)]
pub struct SerialExecutor {
    sender: mpsc::UnboundedSender<Job>,
}

impl SerialExecutor {
    /// Spawns the delivery task onto `handle`.
    pub fn new(handle: &Handle) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Job>();
        handle.spawn(async move {
            while let Some(job) = receiver.recv().await {
                job();
            }
        });
        Self { sender }
    }
}

impl CompletionExecutor for SerialExecutor {
    fn execute(&self, job: Job) {
        if self.sender.send(job).is_err() {
            tracing::error!("Completion executor is gone, dropping result");
        }
    }
}

/// The runtimes the cache schedules its work on.
///
/// - `orchestration` runs the pipeline itself: disk lookups and bookkeeping.
/// - `transform` runs CPU heavy rendering.
/// - `io` runs background disk writes and trimming.
///
/// They may all point at the same runtime.
#[derive(Clone, Debug)]
pub struct WorkQueues {
    pub orchestration: Handle,
    pub transform: Handle,
    pub io: Handle,
}

impl WorkQueues {
    pub fn new(orchestration: Handle, transform: Handle, io: Handle) -> Self {
        Self {
            orchestration,
            transform,
            io,
        }
    }

    /// Runs all work on the current runtime.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a tokio runtime.
    pub fn current() -> Self {
        let handle = Handle::current();
        Self::new(handle.clone(), handle.clone(), handle)
    }
}
