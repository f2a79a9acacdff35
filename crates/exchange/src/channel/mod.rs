//! The per-connection exchange engine.
//!
//! An [`HttpChannel`] lives as long as its connection and runs one exchange at a time. The
//! transport drives it with four events:
//!
//! - [`HttpChannel::on_request`] when a request header was parsed; it creates the exchange and
//!   returns the task that dispatches it to the [`Handler`](crate::handler::Handler)
//! - [`HttpChannel::on_content_available`] when request content arrived after a demand
//! - [`HttpChannel::on_error`] when the stream failed, for example on an I/O error or timeout
//! - [`HttpChannel::on_connection_close`] when the connection went away
//!
//! The application drives the same exchange through its [`Request`], [`Response`] and
//! [`Completion`] handles, from any thread.
//!
//! # Concurrency
//!
//! All mutable channel state sits behind one lock that is held for state transitions only.
//! Callbacks are never run under it: they are offered to the channel's
//! [`SerializedInvoker`](crate::invoker::SerializedInvoker), which runs them one at a time.
//! Every method except the dispatch task returned by `on_request` is non-blocking.
//!
//! # Errors
//!
//! The first failure of an exchange is stored and short-circuits every later read, demand and
//! write. Delivering it wakes a pending demand, then fails a pending write, then notifies the
//! error listeners, then runs the failure path of the completion, in this order. Later failures
//! are recorded as suppressed causes of the first.

mod completion;
mod exchange;
mod request;
mod response;

#[cfg(test)]
mod tests;

pub use completion::Completion;
pub use exchange::ExchangePhase;
pub use request::Request;
pub use response::Response;

use std::fmt;
use std::iter;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use http::Version;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::config::ChannelConfig;
use crate::ensure;
use crate::handler::{DefaultErrorRenderer, ErrorRenderer, Handler};
use crate::invoker::{SerializedInvoker, Task, panic_failure};
use crate::protocol::{ExchangeError, Failure, RequestHeader};
use crate::stream::HttpStream;

use exchange::{Exchange, ExchangeCore, ExchangeState};

type CloseListener = Box<dyn FnOnce(Option<Failure>) + Send>;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// What the engine knows about the underlying connection.
#[derive(Debug)]
pub struct ConnectionMeta {
    id: String,
    version: Version,
    persistent: AtomicBool,
}

impl ConnectionMeta {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The protocol version responses are sent with.
    pub fn version(&self) -> Version {
        self.version
    }

    /// Returns false once the connection must be closed after the current exchange.
    pub fn is_persistent(&self) -> bool {
        self.persistent.load(Ordering::Acquire)
    }

    pub(crate) fn set_non_persistent(&self) {
        self.persistent.store(false, Ordering::Release);
    }
}

#[derive(Debug, Error)]
pub enum ChannelBuildError {
    #[error("a handler is required to build a channel")]
    MissingHandler,
}

struct ChannelState {
    stream: Option<Arc<dyn HttpStream>>,
    exchange: Option<ExchangeState>,
    close_listeners: Vec<CloseListener>,
    requests: u64,
}

impl ChannelState {
    /// The active exchange, if it is the one `core` belongs to.
    fn exchange_of(&self, core: &Arc<ExchangeCore>) -> Option<&ExchangeState> {
        self.exchange.as_ref().filter(|exchange| Arc::ptr_eq(&exchange.core, core))
    }

    fn exchange_of_mut(&mut self, core: &Arc<ExchangeCore>) -> Option<&mut ExchangeState> {
        self.exchange.as_mut().filter(|exchange| Arc::ptr_eq(&exchange.core, core))
    }
}

pub(crate) struct ChannelInner {
    state: Mutex<ChannelState>,
    invoker: SerializedInvoker,
    handler: Arc<dyn Handler>,
    renderer: Arc<dyn ErrorRenderer>,
    config: ChannelConfig,
    connection: ConnectionMeta,
}

/// One connection's exchange engine.
///
/// Cloning yields another handle to the same channel.
#[derive(Clone)]
pub struct HttpChannel {
    inner: Arc<ChannelInner>,
}

impl HttpChannel {
    pub fn builder() -> HttpChannelBuilder {
        HttpChannelBuilder::new()
    }

    pub fn connection(&self) -> &ConnectionMeta {
        &self.inner.connection
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.inner.config
    }

    /// Number of exchanges created on this channel.
    pub fn requests(&self) -> u64 {
        self.inner.state.lock().requests
    }

    /// Attaches the stream that the next request header will arrive on.
    pub fn set_stream(&self, stream: Arc<dyn HttpStream>) -> Result<(), ExchangeError> {
        let mut state = self.inner.state.lock();
        ensure!(state.stream.is_none(), ExchangeError::state_violation("stream already set"));
        trace!(stream = %stream.id(), "stream attached");
        state.stream = Some(stream);
        Ok(())
    }

    /// Creates the exchange for a parsed request header.
    ///
    /// Returns the task that dispatches the exchange to the handler. Unlike every other task of
    /// the channel it is not serialized and may block, see [`Task::spawn_blocking`].
    ///
    /// A request target that violates the configured URI compliance still creates the exchange;
    /// the returned task then fails it with a protocol error so an error response is rendered.
    ///
    /// # Errors
    ///
    /// Fails with a state violation if no stream is attached or an exchange is already active;
    /// the active exchange is left untouched.
    pub fn on_request(&self, header: RequestHeader) -> Result<Task, ExchangeError> {
        let inner = &self.inner;
        let (core, violation) = {
            let mut state = inner.state.lock();
            let stream_id = match &state.stream {
                Some(stream) => stream.id(),
                None => return Err(ExchangeError::state_violation("no stream")),
            };
            ensure!(state.exchange.is_none(), ExchangeError::state_violation("exchange already active"));

            let violation = inner.config.uri_compliance().validate(&header).err();
            let core = Arc::new(ExchangeCore::new(inner.request_id(&stream_id), header, &inner.config));
            state.exchange = Some(ExchangeState::new(Arc::clone(&core)));
            state.requests += 1;
            (core, violation)
        };

        let exchange = Exchange::new(Arc::clone(inner), core);
        match violation {
            None => {
                debug!(exchange = %exchange.id(), method = %exchange.core.header.method(), uri = %exchange.core.header.uri(), "exchange created");
                Ok(Task::new("handle", move || exchange.handle()))
            }
            Some(e) => {
                debug!(exchange = %exchange.id(), cause = %e, "bad request target");
                let failure = Failure::from(e);
                let inner = Arc::clone(inner);
                Ok(Task::new("bad-message", move || {
                    if let Some(task) = inner.on_error(failure) {
                        task.run();
                    }
                }))
            }
        }
    }

    /// Takes the pending content demand of the active exchange.
    ///
    /// Returns `None` if nothing is demanding content.
    pub fn on_content_available(&self) -> Option<Task> {
        let demand = self.inner.state.lock().exchange.as_mut().and_then(|exchange| exchange.on_content_available.take());
        self.inner.invoker.offer([demand])
    }

    /// Aborts the active exchange with `cause`.
    ///
    /// Returns the serialized task delivering the failure, or `None` if there is nothing to
    /// deliver: no stream is attached, or the exchange already failed. In the latter case `cause`
    /// is recorded as suppressed by the first failure unless it is that same failure.
    pub fn on_error<F: Into<Failure>>(&self, cause: F) -> Option<Task> {
        self.inner.on_error(cause.into())
    }

    /// Reports that the connection is gone.
    ///
    /// An active exchange is failed with `cause` first, then every close listener is notified.
    pub fn on_connection_close(&self, cause: Option<Failure>) -> Option<Task> {
        self.inner.on_connection_close(cause)
    }

    /// Replaces the active stream with `transform(stream)`.
    ///
    /// `transform` may be called again if the stream changes concurrently.
    ///
    /// # Errors
    ///
    /// Fails with a state violation if no stream is active, or if the result of `transform` does
    /// not report the stream it was given as [`HttpStream::wrapped`].
    pub fn add_stream_wrapper<F>(&self, transform: F) -> Result<(), ExchangeError>
    where
        F: FnMut(Arc<dyn HttpStream>) -> Arc<dyn HttpStream>,
    {
        self.inner.add_stream_wrapper(transform)
    }

    pub fn add_connection_close_listener<F>(&self, listener: F)
    where
        F: FnOnce(Option<Failure>) + Send + 'static,
    {
        self.inner.state.lock().close_listeners.push(Box::new(listener));
    }

    /// The request side of the active exchange.
    pub fn current_request(&self) -> Option<Request> {
        self.current().map(Request::new)
    }

    /// The response side of the active exchange.
    pub fn current_response(&self) -> Option<Response> {
        self.current().map(Response::new)
    }

    fn current(&self) -> Option<Exchange> {
        let core = self.inner.state.lock().exchange.as_ref().map(|exchange| Arc::clone(&exchange.core))?;
        Some(Exchange::new(Arc::clone(&self.inner), core))
    }
}

impl fmt::Debug for HttpChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("HttpChannel")
            .field("connection", &self.inner.connection.id)
            .field("exchange", &state.exchange.as_ref().map(|exchange| exchange.core.id.as_str()))
            .field("requests", &state.requests)
            .finish()
    }
}

impl ChannelInner {
    fn request_id(&self, stream_id: &str) -> String {
        format!("{}#{}", self.connection.id, stream_id)
    }

    fn on_error(self: &Arc<Self>, cause: Failure) -> Option<Task> {
        let mut state = self.state.lock();
        let Some(stream_id) = state.stream.as_ref().map(|stream| stream.id()) else {
            debug!(cause = %cause, "error without a stream, ignored");
            return None;
        };

        // a failure before any header still needs an exchange to render the error response
        let exchange = state.exchange.get_or_insert_with(|| {
            let core = ExchangeCore::new(self.request_id(&stream_id), RequestHeader::error_request(), &self.config);
            ExchangeState::new(Arc::new(core))
        });

        if let Some(stored) = &exchange.error {
            if !stored.is_same(&cause) {
                debug!(exchange = %exchange.core.id, cause = %cause, "suppressing later failure");
                stored.add_suppressed(cause);
            }
            return None;
        }

        exchange.error = Some(cause.clone());
        exchange.core.mark_errored(&cause);
        // failing counts as processing, even before dispatch
        if !mem::replace(&mut exchange.processing, true) {
            exchange.core.set_phase(ExchangePhase::Processing);
        }

        let demand = exchange.on_content_available.take();
        let write = exchange.on_write_complete.take();
        let listeners = mem::take(&mut exchange.error_listeners);
        let completion = Completion::new(Exchange::new(Arc::clone(self), Arc::clone(&exchange.core)));
        drop(state);

        debug!(exchange = %completion.id(), cause = %cause, "exchange failed");

        let write_failure = write.map(|callback| {
            let cause = cause.clone();
            Task::new("write-failure", move || callback.failed(cause))
        });
        let notify: Vec<_> = listeners
            .into_iter()
            .map(|listener| {
                let cause = cause.clone();
                Some(Task::new("error-listener", move || listener(cause)))
            })
            .collect();
        let complete = Task::new("completion-failure", move || completion.failed(cause));

        self.invoker.offer(iter::once(demand).chain(iter::once(write_failure)).chain(notify).chain(iter::once(Some(complete))))
    }

    fn on_connection_close(self: &Arc<Self>, cause: Option<Failure>) -> Option<Task> {
        let (has_stream, listeners) = {
            let mut state = self.state.lock();
            (state.stream.is_some(), mem::take(&mut state.close_listeners))
        };
        debug!(connection = %self.connection.id, cause = ?cause.as_ref().map(ToString::to_string), "connection closed");

        let fail_exchange = match (&cause, has_stream) {
            (Some(cause), true) => {
                let inner = Arc::clone(self);
                let cause = cause.clone();
                Some(Task::new("close-error", move || {
                    if let Some(task) = inner.on_error(cause) {
                        task.run();
                    }
                }))
            }
            _ => None,
        };
        let notify = listeners.into_iter().map(|listener| {
            let cause = cause.clone();
            Some(Task::new("close-listener", move || {
                if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(|| listener(cause))) {
                    warn!(cause = %panic_failure(panic.as_ref()), "connection close listener failed");
                }
            }))
        });

        self.invoker.offer(iter::once(fail_exchange).chain(notify))
    }

    fn add_stream_wrapper<F>(&self, mut transform: F) -> Result<(), ExchangeError>
    where
        F: FnMut(Arc<dyn HttpStream>) -> Arc<dyn HttpStream>,
    {
        loop {
            let current = self.state.lock().stream.clone().ok_or(ExchangeError::state_violation("no active stream"))?;

            let wrapper = transform(Arc::clone(&current));
            let wraps_current = wrapper.wrapped().is_some_and(|wrapped| same_stream(wrapped, &current));
            ensure!(wraps_current, ExchangeError::state_violation("stream wrapper does not wrap the active stream"));

            let mut state = self.state.lock();
            match state.stream.as_ref().map(|active| same_stream(active, &current)) {
                Some(true) => {
                    trace!(stream = %current.id(), "stream wrapped");
                    state.stream = Some(wrapper);
                    return Ok(());
                }
                Some(false) => continue,
                None => return Err(ExchangeError::state_violation("no active stream")),
            }
        }
    }

    /// Error hook of the invoker: a failing callback is suppressed by the stored exchange failure,
    /// or otherwise closes the connection.
    fn on_callback_failure(self: &Arc<Self>, task: &'static str, failure: Failure) {
        {
            let state = self.state.lock();
            if let Some(stored) = state.exchange.as_ref().and_then(|exchange| exchange.error.as_ref()) {
                warn!(task, cause = %failure, "callback failed on a failed exchange");
                stored.add_suppressed(failure);
                return;
            }
        }

        warn!(task, cause = %failure, "callback failed, closing connection");
        if let Some(task) = self.on_connection_close(Some(failure)) {
            task.run();
        }
    }
}

fn same_stream(a: &Arc<dyn HttpStream>, b: &Arc<dyn HttpStream>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// Assembles an [`HttpChannel`].
pub struct HttpChannelBuilder {
    connection_id: Option<String>,
    version: Version,
    persistent: bool,
    handler: Option<Arc<dyn Handler>>,
    renderer: Arc<dyn ErrorRenderer>,
    config: ChannelConfig,
}

impl HttpChannelBuilder {
    fn new() -> Self {
        Self {
            connection_id: None,
            version: Version::HTTP_11,
            persistent: true,
            handler: None,
            renderer: Arc::new(DefaultErrorRenderer),
            config: ChannelConfig::default(),
        }
    }

    /// Sets the connection id; a process-unique number is used otherwise.
    pub fn connection_id<S: Into<String>>(mut self, id: S) -> Self {
        self.connection_id = Some(id.into());
        self
    }

    pub fn version(mut self, version: Version) -> Self {
        self.version = version;
        self
    }

    pub fn persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    pub fn handler<H: Handler>(mut self, handler: H) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    pub fn error_renderer<R: ErrorRenderer>(mut self, renderer: R) -> Self {
        self.renderer = Arc::new(renderer);
        self
    }

    pub fn config(mut self, config: ChannelConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Result<HttpChannel, ChannelBuildError> {
        let handler = self.handler.ok_or(ChannelBuildError::MissingHandler)?;
        let id = self.connection_id.unwrap_or_else(|| NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed).to_string());
        let connection = ConnectionMeta { id, version: self.version, persistent: AtomicBool::new(self.persistent) };

        let inner = Arc::new_cyclic(|weak: &std::sync::Weak<ChannelInner>| {
            let weak = weak.clone();
            let invoker = SerializedInvoker::with_error_hook(move |task, failure| match weak.upgrade() {
                Some(inner) => inner.on_callback_failure(task, failure),
                None => warn!(task, cause = %failure, "callback failed after channel was dropped"),
            });
            ChannelInner {
                state: Mutex::new(ChannelState { stream: None, exchange: None, close_listeners: Vec::new(), requests: 0 }),
                invoker,
                handler,
                renderer: self.renderer,
                config: self.config,
                connection,
            }
        });
        Ok(HttpChannel { inner })
    }
}

impl fmt::Debug for HttpChannelBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpChannelBuilder")
            .field("connection_id", &self.connection_id)
            .field("version", &self.version)
            .field("persistent", &self.persistent)
            .field("config", &self.config)
            .finish()
    }
}
