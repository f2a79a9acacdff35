use bytes::Bytes;
use http::{HeaderMap, HeaderValue, StatusCode, header};

use crate::protocol::{Failure, RequestHeader};

/// What an error response should say.
#[derive(Debug, Clone)]
pub struct ErrorPage {
    status: StatusCode,
    message: String,
    cause: Option<Failure>,
}

impl ErrorPage {
    /// Builds a page; without a message the canonical reason of `status` is used.
    pub fn new(status: StatusCode, message: Option<String>, cause: Option<Failure>) -> Self {
        let message = message.unwrap_or_else(|| status.canonical_reason().unwrap_or("Unknown").to_string());
        Self { status, message, cause }
    }

    /// The page for a failed exchange: the failure's own status, or 500.
    pub fn for_failure(cause: &Failure) -> Self {
        let status = cause.status();
        let message = match cause.error() {
            crate::protocol::ExchangeError::Protocol { reason, .. } => Some(reason.clone()),
            _ => None,
        };
        Self::new(status, message, Some(cause.clone()))
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn cause(&self) -> Option<&Failure> {
        self.cause.as_ref()
    }
}

/// Renders the body of an error response.
///
/// The renderer fills in header fields and returns the body; the engine sets the status and
/// writes the body as the only, last write of the response.
#[cfg_attr(test, mockall::automock)]
pub trait ErrorRenderer: Send + Sync + 'static {
    fn render(&self, request: &RequestHeader, page: &ErrorPage, headers: &mut HeaderMap) -> Bytes;
}

/// Plain text error pages that must not be cached.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultErrorRenderer;

const ERROR_CACHE_CONTROL: HeaderValue = HeaderValue::from_static("must-revalidate,no-cache,no-store");

impl ErrorRenderer for DefaultErrorRenderer {
    fn render(&self, _request: &RequestHeader, page: &ErrorPage, headers: &mut HeaderMap) -> Bytes {
        headers.insert(header::CACHE_CONTROL, ERROR_CACHE_CONTROL);
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(mime::TEXT_PLAIN_UTF_8.as_ref()));
        Bytes::from(format!("{} {}\n", page.status().as_u16(), page.message()))
    }
}
