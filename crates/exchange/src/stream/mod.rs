//! The transport boundary.
//!
//! An [`HttpStream`] is the transport-side half of one exchange: it reads request content,
//! frames and writes response bytes, and learns how the exchange ended through
//! [`HttpStream::succeeded`] or [`HttpStream::failed`]. The engine is defined against this trait
//! only, so any HTTP version can sit behind it.
//!
//! Streams can be decorated at runtime with `HttpChannel::add_stream_wrapper`; a decorator
//! reports what it wraps through [`HttpStream::wrapped`].

use std::sync::Arc;

use bytes::Bytes;
use http::HeaderMap;

use crate::callback::Callback;
use crate::protocol::{Content, Failure, RequestHeader, ResponseMeta};

mod wrapper;

pub use wrapper::CompletionListenerStream;

/// Transport operations needed by the exchange engine.
///
/// Methods take `&self`: a stream is shared between the channel and whichever thread completes
/// its I/O, so implementations keep their own synchronization.
pub trait HttpStream: Send + Sync + 'static {
    /// Identifier of the stream within its connection.
    fn id(&self) -> String;

    /// Pulls the next available content, or `None` if nothing is ready yet.
    fn read_content(&self) -> Option<Content>;

    /// Asks the transport to signal `on_content_available` once content is ready.
    fn demand_content(&self);

    /// Lets the transport add version specific fields before the first send.
    fn prepare_response(&self, headers: &mut HeaderMap);

    /// Sends response bytes.
    ///
    /// `response` is present exactly once, on the first send. `callback` is completed when the
    /// bytes have been written or the write failed.
    fn send(&self, response: Option<ResponseMeta>, last: bool, callback: Callback, content: Vec<Bytes>);

    /// Best-effort server push; transports without push ignore it.
    fn push(&self, request: RequestHeader) {
        let _ = request;
    }

    /// Returns true once response bytes have been handed to the wire.
    fn is_committed(&self) -> bool;

    /// Drains and discards unread request content.
    ///
    /// Returns `None` when the body was fully consumed. A failure whose error is
    /// `UnconsumedBody` means the body is still pending and the connection must not be reused;
    /// any other failure means the body cannot be drained at all.
    fn consume_all(&self) -> Option<Failure>;

    /// The exchange finished successfully, final frame included.
    fn succeeded(&self);

    /// The exchange failed; the transport should abort the stream.
    fn failed(&self, cause: Failure);

    /// The stream this one decorates, if it is a wrapper.
    fn wrapped(&self) -> Option<&Arc<dyn HttpStream>> {
        None
    }
}

/// A callback that completes `stream` with the outcome of the final send.
pub(crate) fn stream_completion(stream: Arc<dyn HttpStream>) -> Callback {
    Callback::new(move |result| match result {
        Ok(()) => stream.succeeded(),
        Err(cause) => stream.failed(cause),
    })
}
