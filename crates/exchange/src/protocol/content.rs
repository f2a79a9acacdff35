use std::fmt;

use bytes::Bytes;
use http::HeaderMap;

use crate::protocol::Failure;

/// One item read from the request side of an exchange.
///
/// A value is exactly one of: a body chunk, the request trailers, or the error that ended the
/// body. Trailers and errors are always terminal.
#[derive(Debug)]
pub enum Content {
    /// A chunk of body bytes, possibly the last one
    Chunk(Chunk),
    /// Trailing fields sent after the last body chunk
    Trailers(HeaderMap),
    /// The body cannot be read any further
    Error(Failure),
}

impl Content {
    /// Creates a body chunk without a release hook.
    pub fn chunk(bytes: Bytes, last: bool) -> Self {
        Content::Chunk(Chunk::new(bytes, last))
    }

    /// An empty, last chunk, marking the end of the body.
    pub fn eof() -> Self {
        Content::Chunk(Chunk::new(Bytes::new(), true))
    }

    pub fn error<F: Into<Failure>>(failure: F) -> Self {
        Content::Error(failure.into())
    }

    /// Returns true if nothing follows this content.
    #[inline]
    pub fn is_last(&self) -> bool {
        match self {
            Content::Chunk(chunk) => chunk.is_last(),
            Content::Trailers(_) | Content::Error(_) => true,
        }
    }

    #[inline]
    pub fn is_error(&self) -> bool {
        matches!(self, Content::Error(_))
    }

    /// Returns the failure if this is an error content.
    pub fn as_error(&self) -> Option<&Failure> {
        match self {
            Content::Error(failure) => Some(failure),
            _ => None,
        }
    }

    /// Returns the bytes if this is a body chunk.
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Content::Chunk(chunk) => Some(chunk.bytes()),
            _ => None,
        }
    }

    /// Hands the underlying buffer back to its owner.
    pub fn release(self) {
        if let Content::Chunk(chunk) = self {
            chunk.release();
        }
    }
}

type ReleaseHook = Box<dyn FnOnce() + Send>;

/// An immutable body chunk.
///
/// The transport may attach a release hook that returns the underlying buffer to its pool. The
/// hook runs exactly once: on [`Chunk::release`], when the bytes are taken with
/// [`Chunk::into_bytes`], or when the chunk is dropped.
pub struct Chunk {
    bytes: Bytes,
    last: bool,
    release: Option<ReleaseHook>,
}

impl Chunk {
    pub fn new(bytes: Bytes, last: bool) -> Self {
        Self { bytes, last, release: None }
    }

    pub fn with_release<F>(bytes: Bytes, last: bool, release: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self { bytes, last, release: Some(Box::new(release)) }
    }

    #[inline]
    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    #[inline]
    pub fn is_last(&self) -> bool {
        self.last
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn release(mut self) {
        self.run_release();
    }

    /// Takes the bytes out of the chunk, releasing the chunk itself.
    ///
    /// `Bytes` is reference counted, so the returned value stays valid after release.
    pub fn into_bytes(mut self) -> Bytes {
        self.run_release();
        std::mem::take(&mut self.bytes)
    }

    fn run_release(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for Chunk {
    fn drop(&mut self) {
        self.run_release();
    }
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chunk")
            .field("len", &self.bytes.len())
            .field("last", &self.last)
            .field("released", &self.release.is_none())
            .finish()
    }
}
