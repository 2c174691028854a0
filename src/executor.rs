mod queue;
mod worker;

pub use crate::executor::worker::WorkerState;
#[cfg(not(feature = "loom"))]
use crate::completion::{GraphError, GraphOutcome};
use crate::{
    completion::GraphHandle,
    config::ExecutorConfig,
    context::{CancelGroup, JobContext},
    executor::{
        queue::{ReadyJob, SharedQueue},
        worker::Worker,
    },
    graph::CompiledGraph,
    job::Job,
    sync::{
        self, AtomicBool, AtomicU8, AtomicUsize, Backoff, Condvar, JoinHandle, Mutex, Ordering,
        lock,
    },
};
use crossbeam_utils::CachePadded;
use derive_more::Debug;
#[cfg(not(feature = "loom"))]
use std::time::Duration;
use std::{io, sync::Arc};
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Error returned when an [`Executor`] cannot be created.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ExecutorError {
    /// The operating system refused to start a worker thread.
    #[error("failed to spawn worker thread {index}")]
    Spawn {
        /// Index of the worker that could not be started.
        index: usize,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
}

/// Error returned when a graph is submitted to an executor that can no longer
/// run it.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum SubmitError {
    /// The executor has been dropped or is shutting down.
    #[error("executor is shut down")]
    ShutDown,
}

/// Pool of worker threads running [`CompiledGraph`]s.
///
/// Jobs whose predecessors have all completed are dispatched FIFO: a global
/// injector receives submitted roots, every worker keeps its own deque for
/// the successors it unblocks, and idle workers steal from both. A graph is
/// finalized by the worker that retires its last job.
///
/// Dropping the executor shuts it down: running jobs finish, queued jobs are
/// dropped unstarted and their graphs complete with
/// [`GraphError::Abandoned`](crate::completion::GraphError::Abandoned).
/// The executor must therefore not be dropped from one of its own jobs.
#[must_use]
#[derive(Debug)]
pub struct Executor {
    #[debug(skip)]
    shared: Arc<Shared>,
    context: JobContext,
    workers: Vec<JoinHandle>,
}

/// State shared by the executor, its workers and every [`JobContext`] bound
/// to it.
pub(crate) struct Shared {
    pub(crate) queue: SharedQueue,
    /// Jobs queued or running, over all graphs.
    pub(crate) outstanding: CachePadded<AtomicUsize>,
    shutdown: AtomicBool,
    /// Number of workers blocked on `wake`.
    pub(crate) sleepers: Mutex<usize>,
    pub(crate) wake: Condvar,
    pub(crate) states: Box<[CachePadded<AtomicU8>]>,
}

impl Shared {
    fn new(queue: SharedQueue, worker_count: usize) -> Self {
        Self {
            queue,
            outstanding: CachePadded::new(AtomicUsize::new(0)),
            shutdown: AtomicBool::new(false),
            sleepers: Mutex::new(0),
            wake: Condvar::new(),
            states: (0..worker_count)
                .map(|_| CachePadded::new(AtomicU8::new(WorkerState::Idle as u8)))
                .collect(),
        }
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Bind `graph` to `context` and enqueue its roots.
    ///
    /// The shutdown check and the pushes happen under the sleeper lock, which
    /// shutdown also takes: a graph is either fully queued before shutdown
    /// (and abandoned by it) or rejected.
    pub(crate) fn try_enqueue(
        &self,
        context: &JobContext,
        mut graph: CompiledGraph,
    ) -> Result<GraphHandle, SubmitError> {
        graph.attach(context.clone());
        let graph = Arc::new(graph);
        let roots: Vec<u32> = graph
            .jobs()
            .filter(|job| job.predecessors() == 0)
            .map(|job| job.id().0)
            .collect();
        debug_assert_eq!(roots.is_empty(), graph.is_empty(), "Shared::try_enqueue: [1]");

        {
            let sleepers = lock(&self.sleepers);
            if self.is_shutting_down() {
                drop(sleepers);
                warn!(graph = ?graph.name(), "submission rejected: executor is shutting down");
                return Err(SubmitError::ShutDown);
            }
            self.outstanding.fetch_add(roots.len(), Ordering::Relaxed);
            for &index in &roots {
                self.queue.push(ReadyJob {
                    graph: Arc::clone(&graph),
                    index,
                });
            }
            self.notify(*sleepers, roots.len());
        }
        trace!(graph = ?graph.name(), jobs = graph.len(), roots = roots.len(), "graph submitted");

        if graph.is_empty() {
            graph.finalize();
        }
        Ok(GraphHandle::new(graph))
    }

    /// Run one ready job and do the bookkeeping around it: successors it
    /// unblocks go to `push`, and the graph is finalized if this was its
    /// last job.
    pub(crate) fn execute(
        &self,
        job: ReadyJob,
        ready: &mut Vec<u32>,
        mut push: impl FnMut(ReadyJob),
    ) {
        let ReadyJob { graph, index } = job;
        // SAFETY: `index` was made ready either at submission (no
        // predecessors) or by the unique release that observed its counter
        // reach zero, and it was enqueued once and dequeued by the caller, so
        // the caller owns it.
        unsafe { graph.run_job(index as usize, ready) };

        let newly_ready = ready.len();
        if newly_ready != 0 {
            // Counted before this job is retired below, so `outstanding`
            // can't touch zero in between.
            self.outstanding.fetch_add(newly_ready, Ordering::Relaxed);
            for index in ready.drain(..) {
                push(ReadyJob {
                    graph: Arc::clone(&graph),
                    index,
                });
            }
            // The caller takes one of them itself.
            self.wake(newly_ready - 1);
        }

        if graph.release() == 0 {
            graph.finalize();
        }
        drop(graph);
        self.outstanding.fetch_sub(1, Ordering::Release);
    }

    /// Run queued jobs on the calling thread until `handle`'s graph retires.
    ///
    /// Once no work is left the thread parks on the completion event for
    /// `HELP_PARK` at a time, then looks for work again: jobs pushed by
    /// other threads don't wake helpers.
    #[cfg(not(feature = "loom"))]
    pub(crate) fn help_until(&self, handle: &GraphHandle) -> GraphOutcome {
        const HELP_PARK: Duration = Duration::from_millis(1);

        let completion = handle.completion();
        let backoff = Backoff::new();
        let mut ready = Vec::new();
        loop {
            if let Some(outcome) = completion.outcome() {
                return outcome;
            }
            if self.is_shutting_down() {
                // The graph is abandoned once the workers have stopped, and
                // this thread may be one of them.
                return Err(GraphError::Abandoned {
                    remaining: handle.remaining(),
                });
            }
            match self.queue.steal() {
                Some(job) => {
                    self.execute(job, &mut ready, |job| self.queue.push(job));
                    backoff.reset();
                }
                None if backoff.is_completed() => {
                    if let Some(outcome) = completion.wait_timeout(HELP_PARK) {
                        return outcome;
                    }
                }
                None => backoff.snooze(),
            }
        }
    }

    /// Wake up to `count` sleeping workers.
    pub(crate) fn wake(&self, count: usize) {
        if count == 0 {
            return;
        }
        let sleepers = lock(&self.sleepers);
        self.notify(*sleepers, count);
    }

    fn notify(&self, sleepers: usize, count: usize) {
        for _ in 0..count.min(sleepers) {
            self.wake.notify_one();
        }
    }
}

impl Executor {
    /// Start an executor with `thread_count` workers; `0` means one worker
    /// per hardware thread.
    ///
    /// # Errors
    /// [`ExecutorError::Spawn`] if a worker thread cannot be started.
    pub fn new(thread_count: usize) -> Result<Self, ExecutorError> {
        Self::with_config(ExecutorConfig::new(thread_count))
    }

    /// Start an executor as described by `config`.
    ///
    /// # Errors
    /// [`ExecutorError::Spawn`] if a worker thread cannot be started. Workers
    /// started before the failure are shut down again.
    pub fn with_config(config: ExecutorConfig) -> Result<Self, ExecutorError> {
        let worker_count = config.resolved_worker_count();
        let (queue, locals) = queue::new(worker_count);
        let shared = Arc::new(Shared::new(queue, worker_count));
        let mut executor = Self {
            context: JobContext::new(Arc::downgrade(&shared), None),
            shared,
            workers: Vec::with_capacity(worker_count),
        };

        for (index, local) in locals.into_iter().enumerate() {
            let worker = Worker::new(index, local, Arc::clone(&executor.shared));
            let name = format!("{}-{index}", config.thread_name);
            let handle = sync::spawn(name, config.stack_size, move || worker.run())
                .map_err(|source| ExecutorError::Spawn { index, source })?;
            executor.workers.push(handle);
        }
        debug!(workers = worker_count, thread_name = %config.thread_name, "executor started");
        Ok(executor)
    }

    /// Submit a graph; its jobs receive the executor's default context.
    ///
    /// An empty graph completes on the calling thread before this returns.
    pub fn submit(&self, graph: CompiledGraph) -> GraphHandle {
        self.enqueue(&self.context, graph)
    }

    /// Submit a single independent job.
    pub fn submit_job(&self, job: Job) -> GraphHandle {
        self.submit(CompiledGraph::single(job))
    }

    /// Submit a graph whose jobs see the cancel group of `context`.
    ///
    /// The graph always runs on this executor, whichever executor `context`
    /// came from.
    pub fn submit_in(&self, context: &JobContext, graph: CompiledGraph) -> GraphHandle {
        let context = self.context(context.cancel_group().cloned());
        self.enqueue(&context, graph)
    }

    fn enqueue(&self, context: &JobContext, graph: CompiledGraph) -> GraphHandle {
        // Shutdown only starts in `drop`, which can't overlap `&self`.
        self.shared
            .try_enqueue(context, graph)
            .expect("Executor::enqueue: [1]")
    }

    /// Spin, then yield, until no job is queued or running.
    ///
    /// Only a point-in-time observation: jobs submitted concurrently may
    /// already be queued again when this returns.
    pub fn drain(&self) {
        let backoff = Backoff::new();
        while self.shared.outstanding.load(Ordering::Acquire) != 0 {
            backoff.snooze();
        }
    }

    /// Number of jobs queued or running right now.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.shared.outstanding.load(Ordering::Acquire)
    }

    /// Number of worker threads.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.shared.states.len()
    }

    /// Snapshot of every worker's state, indexed like the worker threads.
    #[must_use]
    pub fn worker_states(&self) -> Vec<WorkerState> {
        self.shared
            .states
            .iter()
            .map(|state| WorkerState::from_u8(state.load(Ordering::Relaxed)))
            .collect()
    }

    /// A context bound to this executor carrying `cancel_group`.
    #[must_use]
    pub fn context(&self, cancel_group: Option<CancelGroup>) -> JobContext {
        JobContext::new(Arc::downgrade(&self.shared), cancel_group)
    }

    /// The context given to jobs of graphs passed to [`Executor::submit`].
    #[must_use]
    pub fn default_context(&self) -> &JobContext {
        &self.context
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        {
            let _sleepers = lock(&self.shared.sleepers);
            self.shared.shutdown.store(true, Ordering::Release);
            self.shared.wake.notify_all();
        }
        for (index, handle) in self.workers.drain(..).enumerate() {
            if !sync::join(handle) {
                warn!(index, "worker thread panicked");
            }
        }

        let abandoned = self.shared.queue.drain();
        let count = abandoned.len();
        for ReadyJob { graph, .. } in abandoned {
            graph.abandon();
            drop(graph);
            self.shared.outstanding.fetch_sub(1, Ordering::Release);
        }
        debug!(abandoned = count, "executor shut down");
    }
}
