use crate::sync::UnsafeCell;
use derive_more::{Deref, DerefMut, Display};
use indexmap::IndexSet as _IndexSet;
use rustc_hash::FxBuildHasher;

/// A minimal `UnsafeCell` wrapper that is `Sync` when `T: Send`.
///
/// Used for job bodies stored inside a compiled graph. A body is moved out by
/// exactly one worker: the one that dequeued the job, so no two threads ever
/// touch the same slot.
#[derive(Debug, Deref, DerefMut)]
#[repr(transparent)]
pub(crate) struct SyncUnsafeCell<T>(UnsafeCell<T>);

// SAFETY: the cell is only ever accessed by the single worker that owns the
// corresponding ready job, and ownership is transferred through the ready
// queues, which synchronize. Moving `T` between threads therefore only needs
// `T: Send`, the same bound `Mutex<T>` uses.
unsafe impl<T: Send> Sync for SyncUnsafeCell<T> {}

impl<T> SyncUnsafeCell<T> {
    pub(crate) fn new(val: T) -> Self {
        Self(UnsafeCell::new(val))
    }
}

/// Identifier of a job inside one graph.
///
/// Issued by [`GraphBuilder::add`](crate::graph::GraphBuilder::add) and equal
/// to the job's position in [`CompiledGraph::jobs`](crate::graph::CompiledGraph::jobs).
#[derive(Debug, Display, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[display("#{_0}")]
#[repr(transparent)]
pub struct JobId(pub(crate) u32);

impl JobId {
    pub(crate) fn from_index(index: usize) -> Self {
        Self(u32::try_from(index).expect("JobId::from_index"))
    }

    /// Position of the job in its graph.
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

pub(crate) type IndexSet<T> = _IndexSet<T, FxBuildHasher>;
