//! Parsed request header handling.
//!
//! [`RequestHeader`] wraps `http::Request<()>` so the engine can carry the method, target,
//! version, header fields and a typed extension map of a request without its body. The body is
//! read through the exchange, never through the header.

use http::request::Parts;
use http::{Extensions, HeaderMap, Method, Request, Uri, Version, header};

use crate::protocol::ExchangeError;

/// The header of one request, as delivered by the transport.
#[derive(Debug)]
pub struct RequestHeader {
    inner: Request<()>,
}

impl AsRef<Request<()>> for RequestHeader {
    fn as_ref(&self) -> &Request<()> {
        &self.inner
    }
}

impl AsMut<Request<()>> for RequestHeader {
    fn as_mut(&mut self) -> &mut Request<()> {
        &mut self.inner
    }
}

impl RequestHeader {
    /// The header used when a failure arrives before any real header was parsed.
    pub fn error_request() -> Self {
        let mut inner = Request::new(());
        *inner.version_mut() = Version::HTTP_10;
        Self { inner }
    }

    /// Consumes the header and returns the inner `Request<()>`.
    pub fn into_inner(self) -> Request<()> {
        self.inner
    }

    pub fn method(&self) -> &Method {
        self.inner.method()
    }

    pub fn uri(&self) -> &Uri {
        self.inner.uri()
    }

    pub fn version(&self) -> Version {
        self.inner.version()
    }

    pub fn headers(&self) -> &HeaderMap {
        self.inner.headers()
    }

    /// Typed per-request context supplied by the transport.
    pub fn extensions(&self) -> &Extensions {
        self.inner.extensions()
    }

    /// The declared body length, if the request has a valid `Content-Length` field.
    pub fn content_length(&self) -> Option<u64> {
        parse_content_length(self.headers())
    }
}

/// Reads a `Content-Length` value, ignoring absent or malformed fields.
pub(crate) fn parse_content_length(headers: &HeaderMap) -> Option<u64> {
    headers.get(header::CONTENT_LENGTH)?.to_str().ok()?.trim().parse().ok()
}

impl From<Parts> for RequestHeader {
    #[inline]
    fn from(parts: Parts) -> Self {
        Self { inner: Request::from_parts(parts, ()) }
    }
}

impl From<Request<()>> for RequestHeader {
    #[inline]
    fn from(inner: Request<()>) -> Self {
        Self { inner }
    }
}

/// Converts a header parsed by an HTTP/1 transport.
///
/// Fails with a protocol error when the parse was partial or a field is not a legal header.
impl<'headers, 'buf> TryFrom<httparse::Request<'headers, 'buf>> for RequestHeader {
    type Error = ExchangeError;

    fn try_from(req: httparse::Request<'headers, 'buf>) -> Result<Self, Self::Error> {
        let method = req.method.ok_or_else(|| ExchangeError::bad_request("missing method"))?;
        let path = req.path.ok_or_else(|| ExchangeError::bad_request("missing request target"))?;
        let version = match req.version {
            Some(1) => Version::HTTP_11,
            Some(0) => Version::HTTP_10,
            _ => return Err(ExchangeError::bad_request("unsupported http version")),
        };

        let mut builder = Request::builder().method(method).uri(path).version(version);
        if let Some(headers) = builder.headers_mut() {
            headers.reserve(req.headers.len());
        }
        for header in req.headers.iter() {
            builder = builder.header(header.name, header.value);
        }

        builder.body(()).map(Self::from).map_err(ExchangeError::bad_request)
    }
}
