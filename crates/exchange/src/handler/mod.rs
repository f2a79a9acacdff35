//! Application entry points.
//!
//! A [`Handler`] receives the request side, the response side and the completion callback of one
//! exchange. It may finish the exchange synchronously or keep the parts and finish later from
//! any thread; the exchange ends only when the [`Completion`] is signalled.

use std::fmt;

use crate::channel::{Completion, Request, Response};
use crate::protocol::BoxError;

mod error_page;

pub use error_page::DefaultErrorRenderer;
pub use error_page::ErrorPage;
pub use error_page::ErrorRenderer;

#[cfg(test)]
pub(crate) use error_page::MockErrorRenderer;

/// Handles the exchanges of a channel.
///
/// Returning `Err` (or panicking) fails the exchange with an application error, unless the
/// completion was already signalled.
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, request: Request, response: Response, completion: Completion) -> Result<(), BoxError>;
}

/// A [`Handler`] backed by a closure.
pub struct HandlerFn<F> {
    f: F,
}

impl<F> Handler for HandlerFn<F>
where
    F: Fn(Request, Response, Completion) -> Result<(), BoxError> + Send + Sync + 'static,
{
    fn handle(&self, request: Request, response: Response, completion: Completion) -> Result<(), BoxError> {
        (self.f)(request, response, completion)
    }
}

impl<F> fmt::Debug for HandlerFn<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("HandlerFn")
    }
}

pub fn make_handler<F>(f: F) -> HandlerFn<F>
where
    F: Fn(Request, Response, Completion) -> Result<(), BoxError> + Send + Sync + 'static,
{
    HandlerFn { f }
}
