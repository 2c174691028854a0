#[cfg(not(feature = "loom"))]
use crate::completion::GraphOutcome;
use crate::{
    completion::GraphHandle,
    executor::{Shared, SubmitError},
    graph::CompiledGraph,
    job::Job,
};
use derive_more::Debug;
use std::sync::{
    Arc, Weak,
    atomic::{AtomicBool, Ordering},
};

/// Shared, cooperative cancellation flag.
///
/// A group may have a parent: cancelling the parent cancels every group
/// below it, while cancelling a child leaves the parent untouched. The
/// executor never looks at the flag; long-running job bodies poll
/// [`JobContext::is_cancelled`] and return early.
#[derive(Debug, Clone, Default)]
pub struct CancelGroup {
    inner: Arc<CancelState>,
}

#[derive(Debug, Default)]
struct CancelState {
    cancelled: AtomicBool,
    parent: Option<CancelGroup>,
}

impl CancelGroup {
    /// A root group that is not cancelled.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A group that also reports cancellation whenever `parent` (or any of
    /// its ancestors) is cancelled.
    #[must_use]
    pub fn with_parent(parent: &CancelGroup) -> Self {
        Self {
            inner: Arc::new(CancelState {
                cancelled: AtomicBool::new(false),
                parent: Some(parent.clone()),
            }),
        }
    }

    /// Request cancellation of this group and all of its descendants.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
    }

    /// Clear this group's own flag. Ancestors are not touched.
    pub fn reset(&self) {
        self.inner.cancelled.store(false, Ordering::Release);
    }

    /// Whether this group or one of its ancestors has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        let mut group = Some(self);
        while let Some(current) = group {
            if current.inner.cancelled.load(Ordering::Acquire) {
                return true;
            }
            group = current.inner.parent.as_ref();
        }
        false
    }

    /// The group this one was derived from.
    #[must_use]
    pub fn parent(&self) -> Option<&CancelGroup> {
        self.inner.parent.as_ref()
    }
}

/// Associates a batch of jobs with the executor running them and an
/// optional [`CancelGroup`].
///
/// Every job receives the context of the graph it belongs to. Graphs
/// submitted through a context inherit it, which is how nested jobs share
/// their parent's cancel group.
#[derive(Debug, Clone)]
pub struct JobContext {
    inner: Arc<ContextInner>,
}

#[derive(Debug)]
struct ContextInner {
    #[debug(skip)]
    scheduler: Weak<Shared>,
    cancel_group: Option<CancelGroup>,
}

impl JobContext {
    pub(crate) fn new(scheduler: Weak<Shared>, cancel_group: Option<CancelGroup>) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                scheduler,
                cancel_group,
            }),
        }
    }

    /// A context bound to no executor. Submitting through it always fails;
    /// useful for invoking a [`Job`] directly.
    #[must_use]
    pub fn detached() -> Self {
        Self::new(Weak::new(), None)
    }

    /// A context on the same executor with a different cancel group.
    #[must_use]
    pub fn with_cancel_group(&self, cancel_group: CancelGroup) -> Self {
        Self::new(self.inner.scheduler.clone(), Some(cancel_group))
    }

    /// The cancel group attached to this context.
    #[must_use]
    pub fn cancel_group(&self) -> Option<&CancelGroup> {
        self.inner.cancel_group.as_ref()
    }

    /// Whether the attached cancel group (if any) has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_group().is_some_and(CancelGroup::is_cancelled)
    }

    /// Whether the executor behind this context is gone or shutting down.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.inner
            .scheduler
            .upgrade()
            .is_none_or(|scheduler| scheduler.is_shutting_down())
    }

    /// Submit a graph to this context's executor; its jobs receive this
    /// context.
    ///
    /// # Errors
    /// [`SubmitError::ShutDown`] if the executor has been dropped or is
    /// shutting down.
    pub fn submit(&self, graph: CompiledGraph) -> Result<GraphHandle, SubmitError> {
        let scheduler = self
            .inner
            .scheduler
            .upgrade()
            .ok_or(SubmitError::ShutDown)?;
        scheduler.try_enqueue(self, graph)
    }

    /// Submit a single independent job.
    ///
    /// # Errors
    /// See [`JobContext::submit`].
    pub fn submit_job(&self, job: Job) -> Result<GraphHandle, SubmitError> {
        self.submit(CompiledGraph::single(job))
    }

    /// Block until `handle`'s graph retires, running queued jobs of this
    /// context's executor on the calling thread meanwhile.
    ///
    /// This is how a job forks children and joins them: the waiting worker
    /// keeps the pool busy, so nesting deeper than the worker count can't
    /// starve it. A detached context only blocks.
    ///
    /// Returns [`GraphError::Abandoned`] early if the executor starts
    /// shutting down.
    ///
    /// [`GraphError::Abandoned`]: crate::completion::GraphError::Abandoned
    #[cfg(not(feature = "loom"))]
    pub fn wait(&self, handle: &GraphHandle) -> GraphOutcome {
        match self.inner.scheduler.upgrade() {
            Some(scheduler) => scheduler.help_until(handle),
            None => handle.wait(),
        }
    }
}
