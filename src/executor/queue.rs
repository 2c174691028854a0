use crate::graph::CompiledGraph;
use std::sync::Arc;

/// A job whose predecessors have all completed, waiting for a worker.
pub(crate) struct ReadyJob {
    pub(crate) graph: Arc<CompiledGraph>,
    pub(crate) index: u32,
}

#[cfg(not(feature = "loom"))]
mod imp {
    use super::ReadyJob;
    use crossbeam_deque::{Injector, Steal, Stealer, Worker};
    use std::iter;

    /// Queues reachable from every thread: the injector fed by submissions
    /// and the stealing ends of the workers' deques.
    pub(crate) struct SharedQueue {
        injector: Injector<ReadyJob>,
        stealers: Box<[Stealer<ReadyJob>]>,
    }

    /// The owning end of one worker's FIFO deque.
    pub(crate) struct LocalQueue {
        index: usize,
        deque: Worker<ReadyJob>,
    }

    pub(crate) fn new(worker_count: usize) -> (SharedQueue, Vec<LocalQueue>) {
        let deques: Vec<_> = (0..worker_count).map(|_| Worker::new_fifo()).collect();
        let shared = SharedQueue {
            injector: Injector::new(),
            stealers: deques.iter().map(Worker::stealer).collect(),
        };
        let locals = deques
            .into_iter()
            .enumerate()
            .map(|(index, deque)| LocalQueue { index, deque })
            .collect();
        (shared, locals)
    }

    impl SharedQueue {
        pub(crate) fn push(&self, job: ReadyJob) {
            self.injector.push(job);
        }

        pub(crate) fn has_pending(&self) -> bool {
            !self.injector.is_empty() || self.stealers.iter().any(|stealer| !stealer.is_empty())
        }

        /// Take one job from the injector or any worker's deque. Used by
        /// threads that own no deque.
        pub(crate) fn steal(&self) -> Option<ReadyJob> {
            iter::repeat_with(|| {
                self.injector
                    .steal()
                    .or_else(|| self.stealers.iter().map(Stealer::steal).collect())
            })
            .find(|steal| !steal.is_retry())
            .and_then(Steal::success)
        }

        /// Take every queued job out. Only meaningful once the workers have
        /// stopped.
        pub(crate) fn drain(&self) -> Vec<ReadyJob> {
            let mut jobs = Vec::new();
            drain_into(&mut jobs, || self.injector.steal());
            for stealer in self.stealers.iter() {
                drain_into(&mut jobs, || stealer.steal());
            }
            jobs
        }
    }

    fn drain_into(jobs: &mut Vec<ReadyJob>, mut steal: impl FnMut() -> Steal<ReadyJob>) {
        loop {
            match steal() {
                Steal::Success(job) => jobs.push(job),
                Steal::Retry => {}
                Steal::Empty => break,
            }
        }
    }

    impl LocalQueue {
        pub(crate) fn push(&self, _shared: &SharedQueue, job: ReadyJob) {
            self.deque.push(job);
        }

        /// Own deque first, then a batch from the injector, then the other
        /// workers' deques.
        pub(crate) fn pop(&self, shared: &SharedQueue) -> Option<ReadyJob> {
            self.deque.pop().or_else(|| {
                iter::repeat_with(|| {
                    shared
                        .injector
                        .steal_batch_and_pop(&self.deque)
                        .or_else(|| {
                            shared
                                .stealers
                                .iter()
                                .enumerate()
                                .filter(|&(index, _)| index != self.index)
                                .map(|(_, stealer)| stealer.steal())
                                .collect()
                        })
                })
                .find(|steal| !steal.is_retry())
                .and_then(Steal::success)
            })
        }
    }
}

#[cfg(feature = "loom")]
mod imp {
    use super::ReadyJob;
    use crate::sync::{Mutex, lock};
    use std::collections::VecDeque;

    /// Under loom every worker shares one mutex-protected FIFO so the model
    /// checker sees all queue synchronization.
    pub(crate) struct SharedQueue {
        jobs: Mutex<VecDeque<ReadyJob>>,
    }

    pub(crate) struct LocalQueue;

    pub(crate) fn new(worker_count: usize) -> (SharedQueue, Vec<LocalQueue>) {
        let shared = SharedQueue {
            jobs: Mutex::new(VecDeque::new()),
        };
        (shared, (0..worker_count).map(|_| LocalQueue).collect())
    }

    impl SharedQueue {
        pub(crate) fn push(&self, job: ReadyJob) {
            lock(&self.jobs).push_back(job);
        }

        pub(crate) fn has_pending(&self) -> bool {
            !lock(&self.jobs).is_empty()
        }

        pub(crate) fn steal(&self) -> Option<ReadyJob> {
            lock(&self.jobs).pop_front()
        }

        pub(crate) fn drain(&self) -> Vec<ReadyJob> {
            lock(&self.jobs).drain(..).collect()
        }
    }

    impl LocalQueue {
        pub(crate) fn push(&self, shared: &SharedQueue, job: ReadyJob) {
            shared.push(job);
        }

        pub(crate) fn pop(&self, shared: &SharedQueue) -> Option<ReadyJob> {
            shared.steal()
        }
    }
}

pub(crate) use imp::*;
