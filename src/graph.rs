mod compile;

/// Builder and compile-time errors.
///
/// `GraphBuilder` collects jobs and symbolic links; `compile` resolves them
/// into a [`CompiledGraph`] or reports [`CompileError::Cycle`].
pub use crate::graph::compile::{CompileError, GraphBuilder};
use crate::{
    completion::{CompletionEvent, GraphError, GraphOutcome, GraphReport},
    context::JobContext,
    job::{Job, JobBody},
    sync::*,
    types::{JobId, SyncUnsafeCell},
    utils::panic_message,
};
use derive_more::Debug;
use std::{
    any::Any,
    borrow::Cow,
    panic::{self, AssertUnwindSafe},
};
use tracing::{debug, error, trace, warn};

/// Callback run once when a graph retires.
pub type CompletionCallback = Box<dyn FnOnce(&GraphOutcome) + Send + 'static>;

/// Immutable, link-resolved job graph: the unit of submission.
///
/// Produced by [`GraphBuilder::compile`]. Successor lists and predecessor
/// totals never change after compilation; the only state mutated while the
/// graph runs is each job's pending-predecessor counter, the `remaining`
/// counter and the run statistics.
#[must_use]
#[derive(Debug)]
pub struct CompiledGraph {
    name: Option<Cow<'static, str>>,
    jobs: Vec<JobSlot>,
    /// Indexes of the jobs unblocked by each job, sorted for locality.
    successors: Vec<Box<[JobId]>>,
    predecessors: Vec<PredecessorSlot>,
    /// Jobs that have not retired yet. Starts at `jobs.len()` and reaches zero
    /// exactly once.
    remaining: AtomicUsize,
    #[debug(skip)]
    on_complete: Mutex<Option<CompletionCallback>>,
    completion: CompletionEvent,
    context: JobContext,
    stats: RunStats,
}

#[must_use]
#[derive(Debug)]
pub(crate) struct JobSlot {
    name: Option<Cow<'static, str>>,
    /// Taken by the worker that dequeues the job.
    #[debug(skip)]
    body: SyncUnsafeCell<Option<Box<dyn JobBody>>>,
}

#[must_use]
#[derive(Debug)]
#[repr(align(128))]
pub(crate) struct PredecessorSlot {
    /// Total number of predecessor jobs.
    total: u32,
    /// Number of predecessor jobs that haven't finished yet.
    left: AtomicU32,
}

#[derive(Debug)]
struct RunStats {
    executed: AtomicUsize,
    skipped: AtomicUsize,
    panicked: AtomicUsize,
    poisoned: AtomicBool,
    finalized: AtomicBool,
    failure: Mutex<Option<JobFailure>>,
}

#[derive(Debug)]
struct JobFailure {
    job: JobId,
    job_name: Option<String>,
    message: String,
}

/// Read-only view of one job of a [`CompiledGraph`].
#[derive(Debug, Clone, Copy)]
pub struct JobInfo<'a> {
    #[debug(skip)]
    graph: &'a CompiledGraph,
    id: JobId,
}

impl JobSlot {
    pub(crate) fn new(name: Option<Cow<'static, str>>, body: Box<dyn JobBody>) -> Self {
        Self {
            name,
            body: SyncUnsafeCell::new(Some(body)),
        }
    }
}

impl PredecessorSlot {
    pub(crate) fn new(total: u32) -> Self {
        Self {
            total,
            left: AtomicU32::new(total),
        }
    }
}

impl RunStats {
    fn new() -> Self {
        Self {
            executed: AtomicUsize::new(0),
            skipped: AtomicUsize::new(0),
            panicked: AtomicUsize::new(0),
            poisoned: AtomicBool::new(false),
            finalized: AtomicBool::new(false),
            failure: Mutex::new(None),
        }
    }
}

impl<'a> JobInfo<'a> {
    /// The job's identifier.
    #[must_use]
    pub fn id(&self) -> JobId {
        self.id
    }

    /// The job's name, if it was given one.
    #[must_use]
    pub fn name(&self) -> Option<&'a str> {
        self.graph.jobs[self.id.index()].name.as_deref()
    }

    /// Number of predecessors declared at build time.
    #[must_use]
    pub fn predecessors(&self) -> usize {
        self.graph.predecessors[self.id.index()].total as usize
    }

    /// Number of predecessors that have not completed yet.
    #[must_use]
    pub fn pending_predecessors(&self) -> usize {
        self.graph.predecessors[self.id.index()]
            .left
            .load(Ordering::Acquire) as usize
    }

    /// Jobs unblocked by this one, in ascending order.
    #[must_use]
    pub fn successors(&self) -> &'a [JobId] {
        &self.graph.successors[self.id.index()]
    }
}

impl CompiledGraph {
    pub(crate) fn from_parts(
        name: Option<Cow<'static, str>>,
        jobs: Vec<JobSlot>,
        successors: Vec<Box<[JobId]>>,
        predecessors: Vec<PredecessorSlot>,
        on_complete: Option<CompletionCallback>,
    ) -> Self {
        assert_eq!(jobs.len(), successors.len(), "CompiledGraph: [1]");
        assert_eq!(jobs.len(), predecessors.len(), "CompiledGraph: [2]");
        Self {
            name,
            remaining: AtomicUsize::new(jobs.len()),
            jobs,
            successors,
            predecessors,
            on_complete: Mutex::new(on_complete),
            completion: CompletionEvent::new(),
            context: JobContext::detached(),
            stats: RunStats::new(),
        }
    }

    /// A graph made of one independent job.
    pub fn single(job: Job) -> Self {
        let (name, body) = job.into_parts();
        Self::from_parts(
            None,
            vec![JobSlot::new(name, body)],
            vec![Box::default()],
            vec![PredecessorSlot::new(0)],
            None,
        )
    }

    /// Name given to the builder, if any.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Number of jobs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    /// Whether the graph has no jobs. Such a graph retires on submission.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Jobs in the order they were added to the builder.
    pub fn jobs(&self) -> impl ExactSizeIterator<Item = JobInfo<'_>> + '_ {
        (0..self.jobs.len()).map(|index| JobInfo {
            graph: self,
            id: JobId::from_index(index),
        })
    }

    /// Number of jobs without predecessors, i.e. runnable on submission.
    #[must_use]
    pub fn roots(&self) -> usize {
        self.predecessors.iter().filter(|slot| slot.total == 0).count()
    }

    /// Jobs that have not retired yet.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.remaining.load(Ordering::Acquire)
    }

    pub(crate) fn completion(&self) -> &CompletionEvent {
        &self.completion
    }

    pub(crate) fn attach(&mut self, context: JobContext) {
        self.context = context;
    }

    fn label(&self) -> &str {
        self.name().unwrap_or("<unnamed>")
    }

    /// Atomically decrement the pending-predecessor counter of job `index`.
    ///
    /// Returns `true` for the single caller that observed the last
    /// predecessor; that caller must enqueue the job.
    pub(crate) fn release_predecessor(&self, index: usize) -> bool {
        let previous = self.predecessors[index]
            .left
            .fetch_sub(1, Ordering::Relaxed);
        debug_assert_ne!(previous, 0, "job #{index} released too many times");
        previous == 1
    }

    /// Atomically retire one job and return how many jobs are left.
    ///
    /// Exactly one caller observes `0`; it must call [`Self::finalize`].
    pub(crate) fn release(&self) -> usize {
        let previous = self.remaining.fetch_sub(1, Ordering::AcqRel);
        debug_assert_ne!(previous, 0, "graph released more times than it has jobs");
        previous - 1
    }

    /// Run (or skip, if the graph is poisoned) job `index` and push the
    /// indexes of successors it made ready into `ready`.
    ///
    /// # Safety
    ///
    /// - Job `index` must be ready: all of its predecessors have completed.
    /// - The calling worker must own the job: it was dequeued by this worker
    ///   and every job is dequeued at most once per submission, so no other
    ///   thread accesses the body slot concurrently.
    pub(crate) unsafe fn run_job(&self, index: usize, ready: &mut Vec<u32>) {
        let slot = &self.jobs[index];
        // SAFETY: the caller owns job `index`, so the body slot is not aliased.
        let body = unsafe { slot.body.get_mut().with(|ptr| (*ptr).take()) };
        match body {
            None => debug_assert!(false, "job #{index} dequeued twice"),
            Some(body) if self.stats.poisoned.load(Ordering::Acquire) => {
                trace!(graph = self.label(), job = index, "skipping job of poisoned graph");
                self.stats.skipped.fetch_add(1, Ordering::Relaxed);
                // Captured state may panic on drop too.
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(move || drop(body))) {
                    self.poison(index, payload.as_ref());
                }
            }
            Some(body) => {
                trace!(graph = self.label(), job = index, name = ?slot.name, "running job");
                let context = &self.context;
                match panic::catch_unwind(AssertUnwindSafe(move || body.invoke(context))) {
                    Ok(()) => {
                        self.stats.executed.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(payload) => self.poison(index, payload.as_ref()),
                }
            }
        }
        self.release_successors(index, ready);
    }

    /// Decrement every successor of job `index`; successors whose counter
    /// reached zero are appended to `ready`.
    ///
    /// The Release fence before the decrements, paired with the Acquire fence
    /// after a decrement observed zero, makes everything this job wrote
    /// visible to whoever runs the successor.
    fn release_successors(&self, index: usize, ready: &mut Vec<u32>) {
        let successors = &self.successors[index];
        if successors.is_empty() {
            return;
        }
        let already_ready = ready.len();
        fence(Ordering::Release);
        for &JobId(successor) in successors.iter() {
            if self.release_predecessor(successor as usize) {
                ready.push(successor);
            }
        }
        if ready.len() != already_ready {
            fence(Ordering::Acquire);
        }
    }

    fn poison(&self, index: usize, payload: &(dyn Any + Send)) {
        let message = panic_message(payload);
        let job_name = self.jobs[index].name.as_deref();
        error!(
            graph = self.label(),
            job = index,
            name = ?job_name,
            %message,
            "job panicked, skipping the unstarted jobs of its graph"
        );
        self.stats.panicked.fetch_add(1, Ordering::Relaxed);
        self.stats.poisoned.store(true, Ordering::Release);
        let mut failure = lock(&self.stats.failure);
        if failure.is_none() {
            *failure = Some(JobFailure {
                job: JobId::from_index(index),
                job_name: job_name.map(str::to_owned),
                message,
            });
        }
    }

    /// Complete the graph after its last job retired: run the completion
    /// callback and set the completion event.
    pub(crate) fn finalize(&self) {
        let already = self.stats.finalized.swap(true, Ordering::Relaxed);
        debug_assert!(!already, "graph finalized twice");
        let outcome = self.outcome();
        debug!(graph = self.label(), jobs = self.len(), ?outcome, "graph retired");
        self.complete(outcome);
    }

    /// Complete a graph whose queued jobs were dropped by a shutting-down
    /// executor.
    pub(crate) fn abandon(&self) {
        if self.completion.is_signaled() {
            return;
        }
        let remaining = self.remaining();
        warn!(graph = self.label(), remaining, "graph abandoned at shutdown");
        self.complete(Err(GraphError::Abandoned { remaining }));
    }

    fn complete(&self, outcome: GraphOutcome) {
        let callback = lock(&self.on_complete).take();
        if let Some(callback) = callback {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| callback(&outcome))) {
                error!(
                    graph = self.label(),
                    message = %panic_message(payload.as_ref()),
                    "completion callback panicked"
                );
            }
        }
        self.completion.signal(outcome);
    }

    fn outcome(&self) -> GraphOutcome {
        let executed = self.stats.executed.load(Ordering::Relaxed);
        let skipped = self.stats.skipped.load(Ordering::Relaxed);
        match lock(&self.stats.failure).take() {
            None => Ok(GraphReport { executed, skipped }),
            Some(JobFailure {
                job,
                job_name,
                message,
            }) => Err(GraphError::JobPanicked {
                job,
                job_name,
                message,
                panicked: self.stats.panicked.load(Ordering::Relaxed),
                skipped,
            }),
        }
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use std::sync::{
        Arc,
        atomic::{AtomicUsize as StdAtomicUsize, Ordering as StdOrdering},
    };

    fn diamond() -> CompiledGraph {
        let mut builder = GraphBuilder::named("diamond");
        let a = builder.add(Job::named("a", |_| {}));
        let b = builder.add(Job::new(|_| {}));
        let c = builder.add(Job::new(|_| {}));
        let d = builder.add(Job::new(|_| {}));
        builder.precede(a, b).precede(a, c).precede(b, d).precede(c, d);
        builder.compile().unwrap()
    }

    #[test]
    fn running_jobs_by_hand_walks_the_diamond() {
        let graph = diamond();
        let mut ready = Vec::new();

        // SAFETY: jobs are run one at a time in dependency order on this thread.
        unsafe { graph.run_job(0, &mut ready) };
        assert_eq!(ready, [1, 2]);
        assert_eq!(graph.release(), 3);

        ready.clear();
        // SAFETY: see above.
        unsafe { graph.run_job(2, &mut ready) };
        assert!(ready.is_empty(), "d still waits for b");
        assert_eq!(graph.release(), 2);

        // SAFETY: see above.
        unsafe { graph.run_job(1, &mut ready) };
        assert_eq!(ready, [3]);
        assert_eq!(graph.release(), 1);

        ready.clear();
        // SAFETY: see above.
        unsafe { graph.run_job(3, &mut ready) };
        assert_eq!(graph.release(), 0);
        graph.finalize();

        assert_eq!(
            graph.completion().outcome(),
            Some(Ok(GraphReport {
                executed: 4,
                skipped: 0
            }))
        );
    }

    #[test]
    fn job_info_reflects_links() {
        let graph = diamond();
        let infos: Vec<_> = graph.jobs().collect();
        assert_eq!(infos.len(), 4);
        assert_eq!(infos[0].name(), Some("a"));
        assert_eq!(infos[0].successors(), [JobId(1), JobId(2)]);
        assert_eq!(infos[3].predecessors(), 2);
        assert_eq!(infos[3].pending_predecessors(), 2);
        assert_eq!(graph.roots(), 1);
        assert_eq!(graph.remaining(), 4);
        assert_eq!(graph.name(), Some("diamond"));
    }

    #[test]
    fn panicking_job_poisons_the_rest() {
        let mut builder = GraphBuilder::new();
        let ran = Arc::new(StdAtomicUsize::new(0));
        let a = builder.add(Job::named("explodes", |_| panic!("boom")));
        let counter = Arc::clone(&ran);
        let b = builder.add(Job::new(move |_| {
            counter.fetch_add(1, StdOrdering::Relaxed);
        }));
        builder.precede(a, b);
        let graph = builder.compile().unwrap();

        let mut ready = Vec::new();
        // SAFETY: jobs are run one at a time in dependency order on this thread.
        unsafe { graph.run_job(0, &mut ready) };
        assert_eq!(ready, [1], "successors are released even after a panic");
        // SAFETY: see above.
        unsafe { graph.run_job(1, &mut ready) };
        graph.release();
        assert_eq!(graph.release(), 0);
        graph.finalize();

        assert_eq!(ran.load(StdOrdering::Relaxed), 0);
        assert_eq!(
            graph.completion().outcome(),
            Some(Err(GraphError::JobPanicked {
                job: JobId(0),
                job_name: Some("explodes".to_owned()),
                message: "boom".to_owned(),
                panicked: 1,
                skipped: 1,
            }))
        );
    }

    #[test]
    fn skipped_body_panicking_on_drop_still_releases_successors() {
        struct PanicsOnDrop;

        impl Drop for PanicsOnDrop {
            fn drop(&mut self) {
                panic!("dropped");
            }
        }

        let mut builder = GraphBuilder::new();
        let a = builder.add(Job::named("explodes", |_| panic!("boom")));
        let guard = PanicsOnDrop;
        let b = builder.add(Job::new(move |_| {
            let _held = &guard;
        }));
        let c = builder.add(Job::new(|_| {}));
        builder.precede(a, b).precede(b, c);
        let graph = builder.compile().unwrap();

        let mut ready = Vec::new();
        // SAFETY: jobs are run one at a time in dependency order on this thread.
        unsafe { graph.run_job(0, &mut ready) };
        assert_eq!(ready, [1]);
        ready.clear();
        // SAFETY: see above.
        unsafe { graph.run_job(1, &mut ready) };
        assert_eq!(ready, [2], "a body panicking on drop still releases its successors");
        ready.clear();
        // SAFETY: see above.
        unsafe { graph.run_job(2, &mut ready) };
        for left in (0..3).rev() {
            assert_eq!(graph.release(), left);
        }
        graph.finalize();

        assert_eq!(
            graph.completion().outcome(),
            Some(Err(GraphError::JobPanicked {
                job: JobId(0),
                job_name: Some("explodes".to_owned()),
                message: "boom".to_owned(),
                panicked: 2,
                skipped: 2,
            }))
        );
    }

    #[test]
    fn completion_callback_runs_once_with_outcome() {
        let calls = Arc::new(StdAtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let mut builder = GraphBuilder::new();
        builder.on_complete(move |outcome| {
            assert!(outcome.is_ok());
            counter.fetch_add(1, StdOrdering::Relaxed);
        });
        let graph = builder.compile().unwrap();
        graph.finalize();
        graph.abandon();
        assert_eq!(calls.load(StdOrdering::Relaxed), 1);
        assert_eq!(graph.completion().outcome(), Some(Ok(GraphReport::default())));
    }
}
