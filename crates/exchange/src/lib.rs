//! The per-connection request/response exchange engine
//!
//! This crate turns one parsed request header plus a stream of request body content into a single
//! request/response cycle, while transport events and application threads race to read, write,
//! demand content and report errors on the same connection. The transport itself (parsing,
//! framing, I/O) stays outside: the engine talks to it through the [`stream::HttpStream`] trait.
//!
//! # Features
//!
//! - Exactly one exchange in flight per connection
//! - Demand based, non-blocking request body reads
//! - One-time response commit with content-length reconciliation
//! - Deferred response trailers
//! - Serialized callbacks with constant stack depth
//! - Ordered failure delivery and rendered error responses
//!
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use bytes::Bytes;
//! use http::StatusCode;
//! use micro_exchange::callback::Callback;
//! use micro_exchange::channel::HttpChannel;
//! use micro_exchange::handler::make_handler;
//! use micro_exchange::protocol::RequestHeader;
//! use micro_exchange::stream::HttpStream;
//! use tracing::info;
//!
//! fn serve(stream: Arc<dyn HttpStream>, header: RequestHeader) -> Result<(), Box<dyn std::error::Error>> {
//!     let channel = HttpChannel::builder()
//!         .handler(make_handler(|request, response, completion| {
//!             info!(path = request.uri().path(), "handling request");
//!             response.set_status(StatusCode::OK);
//!             response.write(
//!                 true,
//!                 Callback::from_fns(move || { let _ = completion.succeeded(); }, |_| {}),
//!                 vec![Bytes::from_static(b"Hello World!\r\n")],
//!             );
//!             Ok(())
//!         }))
//!         .build()?;
//!
//!     channel.set_stream(stream)?;
//!     // the dispatch task is the only one allowed to block
//!     channel.on_request(header)?.run();
//!     Ok(())
//! }
//! ```
//!
//!
//! # Architecture
//!
//! - [`channel`]: the [`channel::HttpChannel`] and the request, response and completion sides of
//!   an exchange
//! - [`invoker`]: the serialized callback queue
//! - [`stream`]: the transport boundary
//! - [`protocol`]: content, request and response metadata, errors
//! - [`handler`]: application entry points and error rendering
//! - [`config`]: channel configuration
//!
//! # Error Handling
//!
//! Failures are values: [`protocol::ExchangeError`] classifies them and [`protocol::Failure`]
//! shares the first failure of an exchange with every callback that needs to see it. Contract
//! violations such as a second pending demand are returned to the caller; a refused write fails
//! its own callback and never reaches the stream.

pub mod callback;
pub mod channel;
pub mod config;
pub mod date;
pub mod handler;
pub mod invoker;
pub mod protocol;
pub mod stream;

#[cfg(test)]
mod test_util;

mod utils;
pub(crate) use utils::ensure;
