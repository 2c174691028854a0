use crate::{
    executor::{
        Shared,
        queue::{LocalQueue, ReadyJob},
    },
    sync::{Ordering, lock, wait},
};
use std::sync::Arc;
use tracing::{debug_span, trace};

/// Observable state of a worker thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum WorkerState {
    /// Looking for work or asleep waiting for it.
    Idle = 0,
    /// Executing a job.
    Running = 1,
    /// Leaving its loop because the executor is being dropped.
    ShuttingDown = 2,
}

impl WorkerState {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Idle,
            1 => Self::Running,
            _ => Self::ShuttingDown,
        }
    }
}

/// One OS thread of the pool. Owns its local deque and the scratch buffer
/// successors are collected into.
pub(crate) struct Worker {
    index: usize,
    local: LocalQueue,
    shared: Arc<Shared>,
    ready: Vec<u32>,
}

impl Worker {
    pub(crate) fn new(index: usize, local: LocalQueue, shared: Arc<Shared>) -> Self {
        Self {
            index,
            local,
            shared,
            ready: Vec::new(),
        }
    }

    /// Worker loop: run jobs until the executor shuts down, sleeping while
    /// there is nothing to do. A job that has started always runs to
    /// completion.
    pub(crate) fn run(mut self) {
        let span = debug_span!("worker", index = self.index);
        let _entered = span.enter();
        trace!("worker started");
        while !self.shared.is_shutting_down() {
            match self.local.pop(&self.shared.queue) {
                Some(job) => self.execute(job),
                None => self.sleep(),
            }
        }
        self.set_state(WorkerState::ShuttingDown);
        trace!("worker stopped");
    }

    /// Block until woken by a producer or by shutdown.
    ///
    /// The queues and the shutdown flag are checked again under the sleeper
    /// lock. Submissions push while holding that lock and workers push
    /// before taking it to wake others, so a job pushed after the check is
    /// always followed by a notification.
    fn sleep(&self) {
        let mut sleepers = lock(&self.shared.sleepers);
        if self.shared.is_shutting_down() || self.shared.queue.has_pending() {
            return;
        }
        *sleepers += 1;
        sleepers = wait(&self.shared.wake, sleepers);
        *sleepers -= 1;
    }

    fn execute(&mut self, job: ReadyJob) {
        self.set_state(WorkerState::Running);
        let Self { local, shared, ready, .. } = self;
        shared.execute(job, ready, |job| local.push(&shared.queue, job));
        self.set_state(WorkerState::Idle);
    }

    fn set_state(&self, state: WorkerState) {
        trace!(?state, "worker state");
        self.shared.states[self.index].store(state as u8, Ordering::Relaxed);
    }
}
