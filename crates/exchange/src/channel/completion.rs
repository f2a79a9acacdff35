use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use http::{HeaderMap, HeaderValue, header};
use tracing::{debug, warn};

use crate::callback::Callback;
use crate::channel::exchange::{Exchange, ExchangePhase};
use crate::channel::{Request, Response};
use crate::ensure;
use crate::handler::ErrorPage;
use crate::invoker::panic_failure;
use crate::protocol::{ExchangeError, Failure};
use crate::stream::{HttpStream, stream_completion};

/// Ends an exchange.
///
/// Exactly one of [`Completion::succeeded`] and [`Completion::failed`] takes effect; calls after
/// the exchange ended are ignored.
#[derive(Clone)]
pub struct Completion {
    exchange: Exchange,
}

impl Completion {
    pub(crate) fn new(exchange: Exchange) -> Self {
        Self { exchange }
    }

    pub(crate) fn id(&self) -> &str {
        self.exchange.id()
    }

    /// Completes the exchange successfully.
    ///
    /// Commits the response if no write did, drains the unread request body and sends the final
    /// frame. A body that cannot be drained fails the stream; a body that is merely left unread
    /// makes the connection non-persistent. A committed content length that does not match the
    /// bytes written fails the stream.
    ///
    /// # Errors
    ///
    /// Fails with a state violation, leaving the exchange active, if the exchange is not
    /// processing, has a demand or a write pending, or already failed.
    pub fn succeeded(&self) -> Result<(), ExchangeError> {
        let channel = &self.exchange.channel;
        let core = &self.exchange.core;

        let stream = {
            let mut state = channel.state.lock();
            let Some(exchange) = state.exchange_of(core) else {
                debug!(exchange = %self.id(), "exchange already completed");
                return Ok(());
            };
            ensure!(exchange.processing, ExchangeError::state_violation("not processing"));
            ensure!(exchange.on_content_available.is_none(), ExchangeError::state_violation("demand pending"));
            ensure!(exchange.on_write_complete.is_none(), ExchangeError::state_violation("write pending"));
            ensure!(exchange.error.is_none(), ExchangeError::state_violation("exchange failed"));

            state.exchange = None;
            match state.stream.take() {
                Some(stream) => stream,
                None => return Ok(()),
            }
        };
        core.set_phase(ExchangePhase::Completing);

        if let Some(unconsumed) = stream.consume_all() {
            if !unconsumed.error().is_unconsumed_body() {
                warn!(exchange = %self.id(), cause = %unconsumed, "request body cannot be drained");
                self.terminate(&stream, unconsumed);
                return Ok(());
            }
            if channel.connection.is_persistent() {
                debug!(exchange = %self.id(), cause = %unconsumed, "request body left unread, connection no longer persistent");
                channel.connection.set_non_persistent();
                let mut fields = core.fields.lock();
                if !fields.committed {
                    fields.headers.insert(header::CONNECTION, HeaderValue::from_static("close"));
                }
            }
        }

        let (meta, mismatch, last_written) = {
            let mut fields = core.fields.lock();
            let meta = fields
                .commit()
                .then(|| core.prepare_response(&mut fields, stream.as_ref(), channel.connection.version(), true));
            (meta, fields.length_mismatch(true), fields.last_written)
        };

        if let Some(error) = mismatch {
            warn!(exchange = %self.id(), cause = %error, "response does not match content length");
            self.terminate(&stream, error.into());
            return Ok(());
        }

        debug!(exchange = %self.id(), "exchange succeeded");
        if last_written {
            stream.succeeded();
        } else {
            stream.send(meta, true, stream_completion(Arc::clone(&stream)), Vec::new());
        }
        core.set_phase(ExchangePhase::Terminal);
        Ok(())
    }

    /// Completes the exchange with a failure.
    ///
    /// If the response is not committed yet, an error response is rendered for `cause` before
    /// the stream is failed; otherwise the stream is failed directly. Pending callbacks of the
    /// exchange are dropped.
    pub fn failed(&self, cause: Failure) {
        let channel = &self.exchange.channel;
        let core = &self.exchange.core;

        let (stream, committed) = {
            let mut state = channel.state.lock();
            let Some(exchange) = state.exchange_of(core) else {
                debug!(exchange = %self.id(), cause = %cause, "exchange already completed");
                return;
            };
            if !exchange.processing {
                debug!(exchange = %self.id(), "failing an exchange that never started processing");
            }
            state.exchange = None;
            let Some(stream) = state.stream.take() else {
                return;
            };

            // a write admitted before the failure owns the response head, even if the stream
            // has not seen it yet
            let committed = {
                let mut fields = core.fields.lock();
                if !fields.committed {
                    fields.recycle(cause.status(), &channel.config);
                }
                fields.committed
            };
            if !committed {
                core.trailers.clear();
            }
            (stream, committed)
        };
        core.set_phase(ExchangePhase::Completing);

        if committed {
            debug!(exchange = %self.id(), cause = %cause, "exchange failed after commit");
            self.terminate(&stream, cause);
        } else {
            self.send_error_response(stream, cause);
        }
    }

    /// Renders and sends the error response for `cause`, then fails the stream.
    fn send_error_response(&self, stream: Arc<dyn HttpStream>, cause: Failure) {
        let channel = &self.exchange.channel;
        let core = &self.exchange.core;

        let page = ErrorPage::for_failure(&cause);
        let mut headers = HeaderMap::new();
        let rendered = panic::catch_unwind(AssertUnwindSafe(|| channel.renderer.render(&core.header, &page, &mut headers)));
        let body = match rendered {
            Ok(body) => body,
            Err(panic) => {
                cause.add_suppressed(panic_failure(panic.as_ref()));
                self.terminate(&stream, cause);
                return;
            }
        };

        let meta = {
            let mut fields = core.fields.lock();
            fields.headers.extend(headers);
            fields.headers.remove(header::CONTENT_LENGTH);
            fields.written = body.len() as u64;
            fields.last_written = true;
            fields.commit();
            core.prepare_response(&mut fields, stream.as_ref(), channel.connection.version(), true)
        };
        debug!(exchange = %self.id(), status = page.status().as_u16(), cause = %cause, "sending error response");

        let failing = Arc::clone(&stream);
        let callback = Callback::new(move |result| {
            if let Err(write_failure) = result {
                cause.add_suppressed(write_failure);
            }
            failing.failed(cause);
        });
        stream.send(Some(meta), true, callback, vec![body]);
        core.set_phase(ExchangePhase::Terminal);
    }

    fn terminate(&self, stream: &Arc<dyn HttpStream>, cause: Failure) {
        stream.failed(cause);
        self.exchange.core.set_phase(ExchangePhase::Terminal);
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion").field("id", &self.id()).finish()
    }
}

impl Exchange {
    /// Runs the handler for this exchange.
    ///
    /// A handler error or panic fails the exchange, unless it was already completed.
    pub(super) fn handle(self) {
        let request = Request::new(self.clone());
        let response = Response::new(self.clone());
        let completion = Completion::new(self.clone());
        request.enable_processing();

        let handler = Arc::clone(&self.channel.handler);
        let handled = panic::catch_unwind(AssertUnwindSafe(|| handler.handle(request, response, completion.clone())));
        let failure = match handled {
            Ok(Ok(())) => return,
            Ok(Err(e)) => Failure::from(ExchangeError::application(e)),
            Err(panic) => panic_failure(panic.as_ref()),
        };
        warn!(exchange = %self.id(), cause = %failure, "handler failed");
        completion.failed(failure);
    }
}
