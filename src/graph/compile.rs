use crate::{
    completion::GraphOutcome,
    graph::{CompiledGraph, CompletionCallback, JobSlot, PredecessorSlot},
    job::Job,
    types::{IndexSet, JobId},
};
use derive_more::Debug;
use std::{borrow::Cow, collections::VecDeque};
use thiserror::Error;
use unzip3::Unzip3;

/// Error kind for graph compilation failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CompileError {
    /// The links contain cycle(s), so some jobs can never become ready.
    #[error("graph contains cycle(s): {unresolved} job(s) can never become ready")]
    Cycle {
        /// Number of jobs on or behind a cycle.
        unresolved: usize,
    },
}

/// Mutable, builder-side job graph.
///
/// Jobs live in an arena and are addressed by the [`JobId`] returned from
/// [`add`](Self::add); links between them are symbolic until
/// [`compile`](Self::compile) bakes them into a [`CompiledGraph`].
#[must_use]
#[derive(Debug, Default)]
pub struct GraphBuilder {
    name: Option<Cow<'static, str>>,
    jobs: Vec<Job>,
    /// Successors declared for each job. A set, so that repeating a link
    /// doesn't count the predecessor twice.
    successors: Vec<IndexSet<JobId>>,
    #[debug(skip)]
    on_complete: Option<CompletionCallback>,
}

impl GraphBuilder {
    /// An empty, unnamed builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// An empty builder whose graph carries `name` in logs and errors.
    pub fn named(name: impl Into<Cow<'static, str>>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    /// Number of jobs added so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    /// Whether no job has been added.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Add a job and return its identifier.
    pub fn add(&mut self, job: Job) -> JobId {
        let id = JobId::from_index(self.jobs.len());
        self.jobs.push(job);
        self.successors.push(IndexSet::default());
        id
    }

    /// Declare that `predecessor` must complete before `successor` starts.
    ///
    /// # Panics
    /// If either job was not added to this builder or both are the same job.
    pub fn precede(&mut self, predecessor: JobId, successor: JobId) -> &mut Self {
        for id in [predecessor, successor] {
            assert!(
                id.index() < self.jobs.len(),
                "Job {id} is linked but was not added to this graph"
            );
        }
        assert_ne!(predecessor, successor, "Job {predecessor} is linked to itself");
        self.successors[predecessor.index()].insert(successor);
        self
    }

    /// Declare that `successor` starts only after `predecessor` completes.
    ///
    /// # Panics
    /// See [`precede`](Self::precede).
    pub fn succeed(&mut self, successor: JobId, predecessor: JobId) -> &mut Self {
        self.precede(predecessor, successor)
    }

    /// Run `callback` with the graph's outcome when it retires, on whichever
    /// thread retires it.
    pub fn on_complete(
        &mut self,
        callback: impl FnOnce(&GraphOutcome) + Send + 'static,
    ) -> &mut Self {
        self.on_complete = Some(Box::new(callback));
        self
    }

    /// Resolve the symbolic links into successor index lists and predecessor
    /// counters.
    ///
    /// # Panics
    /// In case of internal invariant violations. Impossible if there are no
    /// bugs in the code.
    ///
    /// # Errors
    /// [`CompileError::Cycle`] if the links contain cycle(s).
    pub fn compile(self) -> Result<CompiledGraph, CompileError> {
        let Self {
            name,
            jobs,
            successors,
            on_complete,
        } = self;

        // Phase 1: count the predecessors of every job.
        let mut totals = vec![0u32; jobs.len()];
        for children in &successors {
            for child in children {
                let total = &mut totals[child.index()];
                *total = total.checked_add(1).expect("GraphBuilder::compile: [1]");
            }
        }

        // Phase 2: Kahn's walk from the roots. Every job reachable only
        // through a cycle keeps a non-zero counter and is never placed.
        let mut left = totals.clone();
        let mut pending: VecDeque<usize> = left
            .iter()
            .enumerate()
            .filter(|&(_, &count)| count == 0)
            .map(|(idx, _)| idx)
            .collect();
        let mut placed = 0usize;
        while let Some(idx) = pending.pop_front() {
            placed += 1;
            for child in &successors[idx] {
                let count = &mut left[child.index()];
                *count -= 1;
                if *count == 0 {
                    pending.push_back(child.index());
                }
            }
        }
        if placed != jobs.len() {
            return Err(CompileError::Cycle {
                unresolved: jobs.len() - placed,
            });
        }

        // Phase 3: materialize the slots. Successor indexes are sorted to
        // achieve better cache locality when they are released.
        let (slots, successors, predecessors): (Vec<_>, Vec<_>, Vec<_>) = jobs
            .into_iter()
            .zip(successors)
            .zip(totals)
            .map(|((job, children), total)| {
                let mut children: Vec<JobId> = children.into_iter().collect();
                children.sort_unstable();
                let (name, body) = job.into_parts();
                (
                    JobSlot::new(name, body),
                    children.into_boxed_slice(),
                    PredecessorSlot::new(total),
                )
            })
            .unzip3();

        Ok(CompiledGraph::from_parts(
            name,
            slots,
            successors,
            predecessors,
            on_complete,
        ))
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;

    fn noop() -> Job {
        Job::new(|_| {})
    }

    #[test]
    fn resolves_links_into_counts_and_sorted_successors() {
        let mut builder = GraphBuilder::new();
        let ids: Vec<_> = (0..4).map(|_| builder.add(noop())).collect();
        builder
            .precede(ids[0], ids[3])
            .precede(ids[0], ids[1])
            .succeed(ids[3], ids[2])
            .precede(ids[1], ids[2]);
        let graph = builder.compile().unwrap();

        let infos: Vec<_> = graph.jobs().collect();
        assert_eq!(infos[0].successors(), [ids[1], ids[3]]);
        assert_eq!(infos[1].successors(), [ids[2]]);
        assert_eq!(infos[2].successors(), [ids[3]]);
        assert!(infos[3].successors().is_empty());
        let counts: Vec<_> = infos.iter().map(|info| info.predecessors()).collect();
        assert_eq!(counts, [0, 1, 1, 2]);
        assert_eq!(graph.remaining(), 4);
    }

    #[test]
    fn repeated_links_count_once() {
        let mut builder = GraphBuilder::new();
        let a = builder.add(noop());
        let b = builder.add(noop());
        builder.precede(a, b).precede(a, b).succeed(b, a);
        let graph = builder.compile().unwrap();
        assert_eq!(graph.jobs().nth(1).unwrap().predecessors(), 1);
    }

    #[test]
    fn cycles_are_rejected() {
        let mut builder = GraphBuilder::new();
        let root = builder.add(noop());
        let a = builder.add(noop());
        let b = builder.add(noop());
        let c = builder.add(noop());
        let tail = builder.add(noop());
        builder
            .precede(root, a)
            .precede(a, b)
            .precede(b, c)
            .precede(c, a)
            .precede(c, tail);
        assert_eq!(
            builder.compile().unwrap_err(),
            CompileError::Cycle { unresolved: 4 }
        );
    }

    #[test]
    fn fully_cyclic_graph_is_rejected() {
        let mut builder = GraphBuilder::new();
        let a = builder.add(noop());
        let b = builder.add(noop());
        builder.precede(a, b).precede(b, a);
        assert_eq!(
            builder.compile().unwrap_err(),
            CompileError::Cycle { unresolved: 2 }
        );
    }

    #[test]
    fn empty_graph_compiles_with_nothing_remaining() {
        let builder = GraphBuilder::named("nothing");
        assert!(builder.is_empty());
        let graph = builder.compile().unwrap();
        assert!(graph.is_empty());
        assert_eq!(graph.remaining(), 0);
        assert_eq!(graph.roots(), 0);
    }

    #[test]
    #[should_panic(expected = "is linked to itself")]
    fn self_link_panics() {
        let mut builder = GraphBuilder::new();
        let a = builder.add(noop());
        builder.precede(a, a);
    }

    #[test]
    #[should_panic(expected = "was not added to this graph")]
    fn dangling_link_panics() {
        let mut other = GraphBuilder::new();
        other.add(noop());
        let foreign = other.add(noop());

        let mut builder = GraphBuilder::new();
        let a = builder.add(noop());
        builder.precede(a, foreign);
    }
}
