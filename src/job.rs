use crate::context::JobContext;
use derive_more::Debug;
use std::borrow::Cow;

/// A unit of work that can be scheduled by the executor.
///
/// Implemented for every `FnOnce(&JobContext) + Send + 'static` closure, so
/// most call sites never name this trait. Implement it directly for job types
/// that carry their own state.
pub trait JobBody: Send + 'static {
    /// Run the job. Called at most once.
    fn invoke(self: Box<Self>, ctx: &JobContext);
}

impl<F> JobBody for F
where
    F: FnOnce(&JobContext) + Send + 'static,
{
    fn invoke(self: Box<Self>, ctx: &JobContext) {
        (*self)(ctx);
    }
}

/// Type-erased job: a boxed [`JobBody`] plus an optional name used in logs
/// and diagnostics.
#[must_use]
#[derive(Debug)]
pub struct Job {
    name: Option<Cow<'static, str>>,
    #[debug(skip)]
    body: Box<dyn JobBody>,
}

impl Job {
    /// Wrap a closure.
    pub fn new<F>(body: F) -> Self
    where
        F: FnOnce(&JobContext) + Send + 'static,
    {
        Self::from_body(body)
    }

    /// Wrap a closure and give it a name.
    pub fn named<F>(name: impl Into<Cow<'static, str>>, body: F) -> Self
    where
        F: FnOnce(&JobContext) + Send + 'static,
    {
        Self::from_body(body).with_name(name)
    }

    /// Wrap any [`JobBody`] implementation.
    pub fn from_body(body: impl JobBody) -> Self {
        Self {
            name: None,
            body: Box::new(body),
        }
    }

    /// Replace the job's name.
    pub fn with_name(mut self, name: impl Into<Cow<'static, str>>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Name given at construction, if any.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Run the job on the current thread, consuming it.
    pub fn invoke(self, ctx: &JobContext) {
        self.body.invoke(ctx);
    }

    pub(crate) fn into_parts(self) -> (Option<Cow<'static, str>>, Box<dyn JobBody>) {
        (self.name, self.body)
    }
}
