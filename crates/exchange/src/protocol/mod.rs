//! Values exchanged between the engine, the transport stream and the application.
//!
//! - **Content** ([`content`]): what the request side reads
//!   - [`Content`]: a body chunk, the trailers, or the error that ended the body
//!   - [`Chunk`]: immutable body bytes with a release hook
//!
//! - **Request** ([`request`]): [`RequestHeader`], the parsed request without its body
//!
//! - **Response** ([`response`]): what the transport receives on commit
//!   - [`ResponseMeta`]: the frozen status line and header fields
//!   - [`TrailerSupplier`]: deferred access to trailers set after commit
//!   - [`PayloadSize`]: how the body must be framed
//!
//! - **Body** ([`body`]): [`RequestBody`](body::RequestBody), an `http_body::Body` over the
//!   request side
//!
//! - **Errors** ([`error`]): [`ExchangeError`] and the shared [`Failure`] cause

pub mod body;

mod content;
pub use content::Chunk;
pub use content::Content;

mod error;
pub use error::BoxError;
pub use error::ExchangeError;
pub use error::Failure;

mod request;
pub(crate) use request::parse_content_length;
pub use request::RequestHeader;

mod response;
pub use response::PayloadSize;
pub use response::ResponseHead;
pub use response::ResponseMeta;
pub use response::TrailerSupplier;
