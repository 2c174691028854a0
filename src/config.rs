use std::{num::NonZeroUsize, thread};

/// Worker pool configuration consumed by
/// [`Executor::with_config`](crate::executor::Executor::with_config).
///
/// The worker count is the only knob that changes scheduling; the rest only
/// affects how the OS threads are created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorConfig {
    /// Number of worker threads. `0` means "one per hardware thread".
    pub worker_count: usize,
    /// Prefix of worker thread names; the worker index is appended.
    pub thread_name: String,
    /// Stack size of worker threads, platform default when `None`.
    pub stack_size: Option<usize>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            worker_count: 0,
            thread_name: "job-worker".to_owned(),
            stack_size: None,
        }
    }
}

impl ExecutorConfig {
    /// Default configuration with an explicit worker count.
    #[must_use]
    pub fn new(worker_count: usize) -> Self {
        Self {
            worker_count,
            ..Self::default()
        }
    }

    /// Set the worker thread name prefix.
    #[must_use]
    pub fn with_thread_name(mut self, thread_name: impl Into<String>) -> Self {
        self.thread_name = thread_name.into();
        self
    }

    /// Set the worker thread stack size in bytes.
    #[must_use]
    pub fn with_stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = Some(stack_size);
        self
    }

    /// The number of workers that will actually be spawned.
    ///
    /// Resolves `0` to the available hardware concurrency, falling back to a
    /// single worker when the platform cannot report it.
    #[must_use]
    pub fn resolved_worker_count(&self) -> usize {
        match NonZeroUsize::new(self.worker_count) {
            Some(count) => count.get(),
            None => thread::available_parallelism().map_or(1, NonZeroUsize::get),
        }
    }
}
