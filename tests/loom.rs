#![allow(missing_docs)]
#![cfg(feature = "loom")]

use jobgraph::{executor::Executor, graph::GraphBuilder, job::Job};
use loom::{
    model::Builder,
    sync::{
        Arc,
        atomic::{AtomicU32, AtomicUsize, Ordering},
    },
};

#[derive(Debug, Clone)]
struct Shared {
    // Written and read with Relaxed ordering only: a job sees its
    // predecessors' values solely through the executor's fences.
    outputs: Arc<Vec<AtomicU32>>,
    counts: Arc<Vec<AtomicUsize>>,
    finalized: Arc<AtomicUsize>,
}

impl Shared {
    fn new(capacity: usize) -> Self {
        Self {
            outputs: Arc::new((0..capacity).map(|_| AtomicU32::new(0)).collect()),
            counts: Arc::new((0..capacity).map(|_| AtomicUsize::new(0)).collect()),
            finalized: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn output(&self, index: usize) -> u32 {
        self.outputs[index].load(Ordering::Relaxed)
    }

    fn count(&self, index: usize) -> usize {
        self.counts[index].load(Ordering::Relaxed)
    }
}

/// Node `index` adds its own value to the sum of its parents' outputs.
struct Node {
    parents: &'static [usize],
    value: u32,
}

fn run(shared: &Shared, nodes: &[Node]) {
    let mut builder = GraphBuilder::named("loom");
    let ids: Vec<_> = nodes
        .iter()
        .enumerate()
        .map(|(index, node)| {
            let shared = shared.clone();
            let parents = node.parents;
            let value = node.value;
            builder.add(Job::new(move |_| {
                shared.counts[index].fetch_add(1, Ordering::Relaxed);
                let acc = parents
                    .iter()
                    .fold(value, |acc, &parent| acc + shared.output(parent));
                shared.outputs[index].store(acc, Ordering::Relaxed);
            }))
        })
        .collect();
    for (index, node) in nodes.iter().enumerate() {
        for &parent in node.parents {
            builder.precede(ids[parent], ids[index]);
        }
    }
    let finalized = Arc::clone(&shared.finalized);
    builder.on_complete(move |outcome| {
        assert!(outcome.is_ok());
        finalized.fetch_add(1, Ordering::Relaxed);
    });
    let graph = builder.compile().expect("graph must be acyclic");

    let executor = Executor::new(2).expect("workers must start");
    let handle = executor.submit(graph);
    let report = handle.wait().expect("no job panics");
    assert_eq!(report.executed, nodes.len());
    assert_eq!(handle.remaining(), 0);
    drop(executor);
}

fn model(f: impl Fn() + Sync + Send + 'static) {
    let mut builder = Builder::new();
    builder.preemption_bound = Some(2);
    builder.check(f);
}

#[test]
fn loom_diamond_correctness_and_single_exec() {
    model(|| {
        // Graph:
        //   A(0)   B(1)
        //     \    /
        //       C(2)
        //        |
        //       D(3)
        // Values: A=1, B=10, C=100, D=1000
        // Expectation: C = 1 + 10 + 100 = 111; D = 111 + 1000 = 1111
        let shared = Shared::new(4);
        run(
            &shared,
            &[
                Node { parents: &[], value: 1 },
                Node { parents: &[], value: 10 },
                Node { parents: &[0, 1], value: 100 },
                Node { parents: &[2], value: 1000 },
            ],
        );

        assert_eq!(shared.output(0), 1);
        assert_eq!(shared.output(1), 10);
        assert_eq!(shared.output(2), 111);
        assert_eq!(shared.output(3), 1111);
        for index in 0..4 {
            assert_eq!(shared.count(index), 1);
        }
        assert_eq!(shared.finalized.load(Ordering::Relaxed), 1);
    });
}

#[test]
fn loom_three_parents_visibility_and_single_exec() {
    model(|| {
        // Graph:
        //   A(0)   B(1)   C(2)
        //       \   |   /
        //          D(3)
        // Expectation: D = 1 + 2 + 4 + 8 = 15
        let shared = Shared::new(4);
        run(
            &shared,
            &[
                Node { parents: &[], value: 1 },
                Node { parents: &[], value: 2 },
                Node { parents: &[], value: 4 },
                Node { parents: &[0, 1, 2], value: 8 },
            ],
        );

        assert_eq!(shared.output(3), 15);
        for index in 0..4 {
            assert_eq!(shared.count(index), 1);
        }
        assert_eq!(shared.finalized.load(Ordering::Relaxed), 1);
    });
}

#[test]
fn loom_two_parents_two_shared_children() {
    model(|| {
        // Graph:
        //   A(0)   B(1)
        //    | \ / |
        //    |  X  |
        //    | / \ |
        //   C(2)  D(3)
        // Expectations: C = 1 + 10 + 100 = 111, D = 1 + 10 + 1000 = 1011
        //
        // Two independent counters: different workers may be the last
        // predecessor of each child.
        let shared = Shared::new(4);
        run(
            &shared,
            &[
                Node { parents: &[], value: 1 },
                Node { parents: &[], value: 10 },
                Node { parents: &[0, 1], value: 100 },
                Node { parents: &[0, 1], value: 1000 },
            ],
        );

        assert_eq!(shared.output(2), 111);
        assert_eq!(shared.output(3), 1011);
        for index in 0..4 {
            assert_eq!(shared.count(index), 1);
        }
        assert_eq!(shared.finalized.load(Ordering::Relaxed), 1);
    });
}

#[test]
fn loom_independent_jobs_finalize_once() {
    model(|| {
        let shared = Shared::new(3);
        run(
            &shared,
            &[
                Node { parents: &[], value: 1 },
                Node { parents: &[], value: 2 },
                Node { parents: &[], value: 3 },
            ],
        );

        for index in 0..3 {
            assert_eq!(shared.count(index), 1);
        }
        assert_eq!(shared.finalized.load(Ordering::Relaxed), 1);
    });
}
