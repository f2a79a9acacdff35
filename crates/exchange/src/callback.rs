use std::fmt;

use crate::protocol::Failure;

type CompleteFn = Box<dyn FnOnce(Result<(), Failure>) + Send>;

/// A one-shot completion callback for an asynchronous operation.
///
/// Consumed by exactly one of [`Callback::succeeded`] or [`Callback::failed`], so a completion
/// can never be signalled twice.
pub struct Callback {
    complete: CompleteFn,
}

impl Callback {
    pub fn new<F>(complete: F) -> Self
    where
        F: FnOnce(Result<(), Failure>) + Send + 'static,
    {
        Self { complete: Box::new(complete) }
    }

    /// Builds a callback from separate success and failure closures.
    pub fn from_fns<S, E>(on_success: S, on_failure: E) -> Self
    where
        S: FnOnce() + Send + 'static,
        E: FnOnce(Failure) + Send + 'static,
    {
        Self::new(move |result| match result {
            Ok(()) => on_success(),
            Err(failure) => on_failure(failure),
        })
    }

    /// A callback that ignores its outcome.
    pub fn noop() -> Self {
        Self::new(|_| {})
    }

    pub fn succeeded(self) {
        (self.complete)(Ok(()));
    }

    pub fn failed(self, cause: Failure) {
        (self.complete)(Err(cause));
    }

    pub fn complete(self, result: Result<(), Failure>) {
        (self.complete)(result);
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Callback")
    }
}
