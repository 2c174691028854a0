//! Job graph executor with explicit dependency links and work stealing.
//!
//! Work is described as a directed acyclic graph of jobs:
//! - A [`GraphBuilder`](graph::GraphBuilder) collects jobs in an arena and
//!   records `precede` links between them by [`JobId`](types::JobId).
//! - [`compile`](graph::GraphBuilder::compile) rejects cycles and resolves the
//!   links into successor lists and per-job predecessor counters.
//! - An [`Executor`](executor::Executor) runs the compiled graph on a pool of
//!   worker threads. A job becomes ready when its last predecessor completes;
//!   the worker that completed it pushes it onto its own deque, where idle
//!   workers can steal it.
//!
//! Readiness propagates with a Release fence, a Relaxed counter decrement and
//! an Acquire fence on the decrement that reaches zero, so a job observes
//! everything its predecessors wrote.
//!
//! Quick start:
//! 1. Create an `Executor` (or use [`global::instance`]).
//! 2. Add jobs to a `GraphBuilder` and link them with `precede`.
//! 3. `compile` the builder, `submit` the graph and `wait` on the returned
//!    [`GraphHandle`](completion::GraphHandle).
//!
//! Jobs receive a [`JobContext`](context::JobContext) through which they can
//! poll their [`CancelGroup`](context::CancelGroup) and submit further graphs.

/// Completion signaling for submitted graphs.
///
/// Defines the one-shot `CompletionEvent`, the `GraphHandle` returned on
/// submission and the `GraphOutcome` a graph retires with.
pub mod completion;
/// Worker pool configuration.
pub mod config;
/// Per-job execution context and cooperative cancellation.
///
/// `JobContext` is passed to every job invocation; `CancelGroup` is a
/// hierarchical, advisory cancellation flag.
pub mod context;
/// The worker pool.
///
/// Contains the `Executor`, its work-stealing ready queues and the worker
/// loop that runs jobs and releases their successors.
pub mod executor;
/// Process-wide executor for applications that want a single shared pool.
#[cfg(not(feature = "loom"))]
pub mod global;
/// Graph construction and the immutable compiled graph.
///
/// `GraphBuilder` validates links and detects cycles at compile time;
/// `CompiledGraph` holds the jobs together with their successor lists and
/// pending-predecessor counters.
pub mod graph;
/// Units of work: the `JobBody` trait and the type-erased `Job`.
pub mod job;
mod sync;
/// Core types used across the crate (`JobId` and the `SyncUnsafeCell`
/// primitive used internally).
pub mod types;
mod utils;
