use std::fmt;
use std::sync::Arc;

use http::{Extensions, HeaderMap, Method, Uri, Version};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::callback::Callback;
use crate::channel::ConnectionMeta;
use crate::channel::exchange::{Exchange, ExchangePhase};
use crate::ensure;
use crate::invoker::Task;
use crate::protocol::{Content, ExchangeError, Failure, RequestHeader};
use crate::stream::{CompletionListenerStream, HttpStream};

/// The request side of an exchange.
///
/// Body content is pulled with [`Request::read_content`]; when nothing is ready the application
/// registers a demand with [`Request::demand_content`] and reads again once it fires. Reads never
/// block.
#[derive(Clone)]
pub struct Request {
    exchange: Exchange,
}

impl Request {
    pub(crate) fn new(exchange: Exchange) -> Self {
        Self { exchange }
    }

    /// `"{connection id}#{stream id}"`
    pub fn id(&self) -> &str {
        self.exchange.id()
    }

    pub fn header(&self) -> &RequestHeader {
        &self.exchange.core.header
    }

    pub fn method(&self) -> &Method {
        self.header().method()
    }

    pub fn uri(&self) -> &Uri {
        self.header().uri()
    }

    pub fn version(&self) -> Version {
        self.header().version()
    }

    pub fn headers(&self) -> &HeaderMap {
        self.header().headers()
    }

    pub fn extensions(&self) -> &Extensions {
        self.header().extensions()
    }

    pub fn content_length(&self) -> Option<u64> {
        self.header().content_length()
    }

    pub fn connection(&self) -> &ConnectionMeta {
        &self.exchange.channel.connection
    }

    pub fn phase(&self) -> ExchangePhase {
        self.exchange.core.phase()
    }

    /// Returns true once a failure was delivered to this exchange.
    pub fn is_errored(&self) -> bool {
        self.exchange.core.failure().is_some()
    }

    /// The failure delivered to this exchange, if any.
    pub fn failure(&self) -> Option<Failure> {
        self.exchange.core.failure().cloned()
    }

    /// Reads the next piece of content.
    ///
    /// Returns `None` if nothing is available yet; call [`Request::demand_content`] then. Returns
    /// an error content, without touching the stream, once the exchange failed, before it is
    /// processing, or after it completed.
    pub fn read_content(&self) -> Option<Content> {
        let stream = {
            let state = self.exchange.channel.state.lock();
            let Some(exchange) = state.exchange_of(&self.exchange.core) else {
                return Some(match self.failure() {
                    Some(failure) => Content::Error(failure),
                    None => Content::error(ExchangeError::state_violation("completed")),
                });
            };
            if let Some(error) = &exchange.error {
                return Some(Content::Error(error.clone()));
            }
            if !exchange.processing {
                return Some(Content::error(ExchangeError::state_violation("not processing")));
            }
            state.stream.clone()?
        };
        stream.read_content()
    }

    /// Asks to be called once content can be read.
    ///
    /// If the exchange already failed or is not processing, `on_content_available` is run
    /// immediately through the invoker; the following read reports why.
    ///
    /// # Errors
    ///
    /// Fails with an invalid argument error if a demand is already pending, and with a state
    /// violation once the exchange completed successfully.
    pub fn demand_content<F>(&self, on_content_available: F) -> Result<(), ExchangeError>
    where
        F: FnOnce() + Send + 'static,
    {
        let task = Task::new("demand", on_content_available);
        let mut immediate = None;
        let stream = {
            let mut state = self.exchange.channel.state.lock();
            let stream = state.stream.clone();
            match state.exchange_of_mut(&self.exchange.core) {
                None if self.exchange.core.failure().is_none() => {
                    return Err(ExchangeError::state_violation("completed"));
                }
                Some(exchange) if exchange.error.is_none() && exchange.processing => {
                    ensure!(exchange.on_content_available.is_none(), ExchangeError::invalid_argument("demand pending"));
                    exchange.on_content_available = Some(task);
                    stream
                }
                _ => {
                    immediate = Some(task);
                    None
                }
            }
        };

        if let Some(task) = immediate {
            self.exchange.channel.invoker.run(task);
        } else if let Some(stream) = stream {
            trace!(exchange = %self.id(), "demanding content");
            stream.demand_content();
        }
        Ok(())
    }

    /// Registers a listener for the failure of this exchange.
    ///
    /// Listeners run in registration order. If the exchange already failed, `listener` runs
    /// right away with the stored failure.
    pub fn add_error_listener<F>(&self, listener: F)
    where
        F: FnOnce(Failure) + Send + 'static,
    {
        let stored = {
            let mut state = self.exchange.channel.state.lock();
            match state.exchange_of_mut(&self.exchange.core) {
                Some(exchange) => match &exchange.error {
                    Some(error) => error.clone(),
                    None => {
                        exchange.error_listeners.push(Box::new(listener));
                        return;
                    }
                },
                None => match self.exchange.core.failure() {
                    Some(failure) => failure.clone(),
                    None => {
                        debug!(exchange = %self.id(), "error listener added to a completed exchange");
                        return;
                    }
                },
            }
        };
        self.exchange.channel.invoker.run(Task::new("error-listener", move || listener(stored)));
    }

    /// Registers a callback for the final outcome of the exchange.
    ///
    /// The callback observes the stream completing, success or failure, before the transport
    /// does.
    pub fn add_completion_listener(&self, listener: Callback) -> Result<(), ExchangeError> {
        let current = self.exchange.channel.state.lock().exchange_of(&self.exchange.core).is_some();
        ensure!(current, ExchangeError::state_violation("completed"));

        let slot = Arc::new(Mutex::new(Some(listener)));
        self.exchange.channel.add_stream_wrapper(|stream| -> Arc<dyn HttpStream> {
            Arc::new(CompletionListenerStream::with_slot(stream, Arc::clone(&slot)))
        })
    }

    /// Lets the application start reading and writing.
    pub(crate) fn enable_processing(&self) {
        let mut state = self.exchange.channel.state.lock();
        if let Some(exchange) = state.exchange_of_mut(&self.exchange.core) {
            if exchange.processing {
                debug!(exchange = %self.id(), "exchange already processing");
            }
            exchange.processing = true;
            self.exchange.core.set_phase(ExchangePhase::Processing);
        }
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.id())
            .field("method", self.method())
            .field("uri", self.uri())
            .field("version", &self.version())
            .field("phase", &self.phase())
            .finish()
    }
}
