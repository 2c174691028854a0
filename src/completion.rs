use crate::{
    graph::CompiledGraph,
    sync::{Condvar, Mutex, lock, wait},
    types::JobId,
};
use std::sync::Arc;
#[cfg(not(feature = "loom"))]
use std::time::{Duration, Instant};
use thiserror::Error;

/// Statistics of a graph that retired without a failing job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GraphReport {
    /// Jobs whose body ran.
    pub executed: usize,
    /// Jobs dropped without running because the graph was poisoned.
    pub skipped: usize,
}

/// Why a graph did not complete normally.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum GraphError {
    /// A job panicked. Jobs of the graph that had not started yet were
    /// skipped; their successors were still released so the graph retired.
    #[error("job {job} panicked: {message} ({panicked} panic(s), {skipped} job(s) skipped)")]
    JobPanicked {
        /// First job observed panicking.
        job: JobId,
        /// Its name, if it had one.
        job_name: Option<String>,
        /// Panic payload rendered as text.
        message: String,
        /// Total number of jobs that panicked.
        panicked: usize,
        /// Number of jobs skipped after the graph was poisoned.
        skipped: usize,
    },
    /// The executor shut down before the graph retired.
    #[error("executor shut down with {remaining} job(s) of the graph unfinished")]
    Abandoned {
        /// Jobs that never ran.
        remaining: usize,
    },
}

/// Final state of a submitted graph.
pub type GraphOutcome = Result<GraphReport, GraphError>;

/// One-shot event set when a graph retires.
///
/// Cloning yields another handle to the same event.
#[derive(Debug, Clone)]
pub struct CompletionEvent {
    inner: Arc<EventState>,
}

#[derive(Debug)]
struct EventState {
    outcome: Mutex<Option<GraphOutcome>>,
    signaled: Condvar,
}

impl CompletionEvent {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(EventState {
                outcome: Mutex::new(None),
                signaled: Condvar::new(),
            }),
        }
    }

    /// Store the outcome and wake all waiters. Only the first call has any
    /// effect; returns whether this call was it.
    pub(crate) fn signal(&self, outcome: GraphOutcome) -> bool {
        let mut slot = lock(&self.inner.outcome);
        if slot.is_some() {
            return false;
        }
        *slot = Some(outcome);
        drop(slot);
        self.inner.signaled.notify_all();
        true
    }

    /// Whether the event has been set.
    #[must_use]
    pub fn is_signaled(&self) -> bool {
        lock(&self.inner.outcome).is_some()
    }

    /// The outcome, if the event has been set.
    #[must_use]
    pub fn outcome(&self) -> Option<GraphOutcome> {
        lock(&self.inner.outcome).clone()
    }

    /// Block until the event is set.
    ///
    /// This only blocks. Jobs waiting for graphs of their own executor use
    /// [`JobContext::wait`](crate::context::JobContext::wait) instead, which
    /// runs queued jobs while it waits.
    pub fn wait(&self) -> GraphOutcome {
        let mut slot = lock(&self.inner.outcome);
        loop {
            if let Some(outcome) = slot.as_ref() {
                return outcome.clone();
            }
            slot = wait(&self.inner.signaled, slot);
        }
    }

    /// Block until the event is set or `timeout` elapses.
    #[cfg(not(feature = "loom"))]
    #[must_use]
    pub fn wait_timeout(&self, timeout: Duration) -> Option<GraphOutcome> {
        let deadline = Instant::now() + timeout;
        let mut slot = lock(&self.inner.outcome);
        while slot.is_none() {
            if self
                .inner
                .signaled
                .wait_until(&mut slot, deadline)
                .timed_out()
            {
                break;
            }
        }
        slot.clone()
    }
}

/// Producer-side handle of a submitted graph.
///
/// Keeps the graph alive for inspection after it retires; dropping the
/// handle neither cancels nor waits for the graph.
#[derive(Debug, Clone)]
pub struct GraphHandle {
    graph: Arc<CompiledGraph>,
}

impl GraphHandle {
    pub(crate) fn new(graph: Arc<CompiledGraph>) -> Self {
        Self { graph }
    }

    /// The submitted graph.
    #[must_use]
    pub fn graph(&self) -> &CompiledGraph {
        &self.graph
    }

    /// Jobs that have not retired yet.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.graph.remaining()
    }

    /// Whether the graph has retired (or was abandoned).
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.graph.completion().is_signaled()
    }

    /// The graph's completion event, for waiting from another thread.
    #[must_use]
    pub fn completion(&self) -> CompletionEvent {
        self.graph.completion().clone()
    }

    /// Block until the graph retires. See [`CompletionEvent::wait`].
    pub fn wait(&self) -> GraphOutcome {
        self.graph.completion().wait()
    }

    /// Block until the graph retires or `timeout` elapses.
    #[cfg(not(feature = "loom"))]
    #[must_use]
    pub fn wait_timeout(&self, timeout: Duration) -> Option<GraphOutcome> {
        self.graph.completion().wait_timeout(timeout)
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn first_signal_wins() {
        let event = CompletionEvent::new();
        assert!(!event.is_signaled());
        assert!(event.signal(Ok(GraphReport {
            executed: 3,
            skipped: 0
        })));
        assert!(!event.signal(Err(GraphError::Abandoned { remaining: 1 })));
        assert_eq!(
            event.outcome(),
            Some(Ok(GraphReport {
                executed: 3,
                skipped: 0
            }))
        );
    }

    #[test]
    fn wait_returns_after_signal_from_another_thread() {
        let event = CompletionEvent::new();
        let signaller = event.clone();
        let thread = thread::spawn(move || signaller.signal(Ok(GraphReport::default())));
        assert_eq!(event.wait(), Ok(GraphReport::default()));
        assert!(thread.join().unwrap());
    }

    #[test]
    fn wait_timeout_expires_on_unset_event() {
        let event = CompletionEvent::new();
        assert_eq!(event.wait_timeout(Duration::from_millis(10)), None);
    }

    #[test]
    fn panic_error_renders_details() {
        let error = GraphError::JobPanicked {
            job: JobId(4),
            job_name: Some("mix".to_owned()),
            message: "boom".to_owned(),
            panicked: 1,
            skipped: 2,
        };
        assert_eq!(
            error.to_string(),
            "job #4 panicked: boom (1 panic(s), 2 job(s) skipped)"
        );
    }
}
