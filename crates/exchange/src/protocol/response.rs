//! Response metadata handed to the transport on commit.

use std::fmt;
use std::sync::Arc;

use http::{HeaderMap, Response, StatusCode};
use parking_lot::Mutex;

/// Status line and header fields of a response, without a body.
pub type ResponseHead = Response<()>;

/// Size information of a response payload, deciding how the transport frames the body.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PayloadSize {
    /// Payload with known length in bytes
    Length(u64),
    /// Payload of unknown length, streamed until the last write
    Chunked,
    /// No body framing at all
    Empty,
}

impl PayloadSize {
    #[inline]
    pub fn is_chunked(&self) -> bool {
        matches!(self, PayloadSize::Chunked)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        matches!(self, PayloadSize::Empty)
    }
}

/// What the transport receives with the first send of a response.
///
/// The header fields are frozen at this point; the trailers are not; they are read through
/// [`TrailerSupplier::take`] when the final frame is streamed.
#[derive(Debug)]
pub struct ResponseMeta {
    head: ResponseHead,
    content_length: Option<u64>,
    trailers: TrailerSupplier,
}

impl ResponseMeta {
    pub(crate) fn new(head: ResponseHead, content_length: Option<u64>, trailers: TrailerSupplier) -> Self {
        Self { head, content_length, trailers }
    }

    pub fn head(&self) -> &ResponseHead {
        &self.head
    }

    pub fn status(&self) -> StatusCode {
        self.head.status()
    }

    pub fn headers(&self) -> &HeaderMap {
        self.head.headers()
    }

    /// The committed content length, if one was declared or inferred.
    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    pub fn trailers(&self) -> &TrailerSupplier {
        &self.trailers
    }

    /// How the body should be framed.
    ///
    /// 1xx, 204 and 304 responses and a committed length of 0 have no body framing.
    pub fn payload_size(&self) -> PayloadSize {
        let status = self.status();
        if status.is_informational() || matches!(status, StatusCode::NO_CONTENT | StatusCode::NOT_MODIFIED) {
            return PayloadSize::Empty;
        }
        match self.content_length {
            Some(0) => PayloadSize::Empty,
            Some(length) => PayloadSize::Length(length),
            None => PayloadSize::Chunked,
        }
    }

    pub fn into_head(self) -> ResponseHead {
        self.head
    }
}

/// Deferred access to the response trailers.
///
/// The response side and the transport share one slot: the application may fill it at any time
/// before the final frame, the transport takes it once when streaming that frame.
#[derive(Clone, Default)]
pub struct TrailerSupplier {
    slot: Arc<Mutex<Option<HeaderMap>>>,
}

impl TrailerSupplier {
    /// Takes the trailers, leaving the slot empty.
    ///
    /// Returns `None` if the application never asked for trailers.
    pub fn take(&self) -> Option<HeaderMap> {
        self.slot.lock().take()
    }

    /// A copy of the trailers set so far; empty if none were allocated.
    pub(crate) fn snapshot(&self) -> HeaderMap {
        self.slot.lock().clone().unwrap_or_default()
    }

    pub(crate) fn store(&self, trailers: HeaderMap) {
        *self.slot.lock() = Some(trailers);
    }

    pub(crate) fn is_allocated(&self) -> bool {
        self.slot.lock().is_some()
    }

    pub(crate) fn clear(&self) {
        self.slot.lock().take();
    }
}

impl fmt::Debug for TrailerSupplier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrailerSupplier").field("allocated", &self.is_allocated()).finish()
    }
}
