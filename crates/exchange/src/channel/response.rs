use std::fmt;
use std::future::Future;

use bytes::Bytes;
use futures::channel::oneshot;
use http::{HeaderMap, StatusCode, header};
use tracing::{debug, warn};

use crate::callback::Callback;
use crate::channel::exchange::{Admission, Exchange};
use crate::ensure;
use crate::handler::ErrorPage;
use crate::invoker::Task;
use crate::protocol::{ExchangeError, Failure, RequestHeader};

/// The response side of an exchange.
///
/// Status and header fields can be changed until the first write commits them. Only one write
/// may be outstanding; the next one is accepted after the previous callback completed.
#[derive(Clone)]
pub struct Response {
    exchange: Exchange,
}

impl Response {
    pub(crate) fn new(exchange: Exchange) -> Self {
        Self { exchange }
    }

    /// The status set so far; `None` means 200 on commit.
    pub fn status(&self) -> Option<StatusCode> {
        self.exchange.core.fields.lock().status
    }

    /// Sets the status; ignored once the response is committed.
    pub fn set_status(&self, status: StatusCode) {
        let mut fields = self.exchange.core.fields.lock();
        if !fields.committed {
            fields.status = Some(status);
        }
    }

    /// Reads a copy of the header fields; `f` runs without the exchange locked.
    pub fn with_headers<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&HeaderMap) -> R,
    {
        let headers = self.exchange.core.fields.lock().headers.clone();
        f(&headers)
    }

    /// Mutates the header fields.
    ///
    /// `f` edits a copy that replaces the fields when it returns, so it may call back into the
    /// response. Edits are discarded if a write committed the response in the meantime.
    ///
    /// # Errors
    ///
    /// Fails with a state violation once the response is committed.
    pub fn with_headers_mut<F, R>(&self, f: F) -> Result<R, ExchangeError>
    where
        F: FnOnce(&mut HeaderMap) -> R,
    {
        let mut headers = {
            let fields = self.exchange.core.fields.lock();
            ensure!(!fields.committed, ExchangeError::state_violation("committed"));
            fields.headers.clone()
        };
        let result = f(&mut headers);
        let mut fields = self.exchange.core.fields.lock();
        ensure!(!fields.committed, ExchangeError::state_violation("committed"));
        fields.headers = headers;
        Ok(result)
    }

    /// Declares the body length.
    pub fn set_content_length(&self, length: u64) -> Result<(), ExchangeError> {
        let mut fields = self.exchange.core.fields.lock();
        ensure!(!fields.committed, ExchangeError::state_violation("committed"));
        fields.headers.insert(header::CONTENT_LENGTH, length.into());
        Ok(())
    }

    /// Mutates the trailers, allocating them on first use.
    ///
    /// Trailers may still be added after commit, up to the final frame. Like
    /// [`with_headers_mut`](Self::with_headers_mut), `f` edits a copy.
    pub fn with_trailers_mut<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut HeaderMap) -> R,
    {
        let mut trailers = self.exchange.core.trailers.snapshot();
        let result = f(&mut trailers);
        self.exchange.core.trailers.store(trailers);
        result
    }

    pub fn is_committed(&self) -> bool {
        self.exchange.core.fields.lock().committed
    }

    /// Clears status, header fields and trailers.
    ///
    /// # Errors
    ///
    /// Fails with a state violation once the response is committed.
    pub fn reset(&self) -> Result<(), ExchangeError> {
        let mut fields = self.exchange.core.fields.lock();
        ensure!(!fields.committed, ExchangeError::state_violation("committed"));
        fields.reset();
        self.exchange.core.trailers.clear();
        Ok(())
    }

    /// Writes body bytes; `callback` completes when the stream has written them.
    ///
    /// The first write commits the response. A `last` write that commits without a declared
    /// content length declares the bytes written so far. The write fails through `callback`
    /// without sending anything if:
    ///
    /// - another write is pending, the exchange is not processing, or it completed (state violation)
    /// - the exchange failed (the stored failure)
    /// - the bytes written do not fit the committed content length (length mismatch)
    ///
    /// A write of no bytes that is not `last` commits the response if needed; once committed it
    /// completes immediately.
    pub fn write(&self, last: bool, callback: Callback, content: Vec<Bytes>) {
        let channel = &self.exchange.channel;
        let core = &self.exchange.core;

        let (stream, admission) = {
            let mut state = channel.state.lock();
            match (state.stream.clone(), state.exchange_of_mut(core)) {
                (Some(stream), Some(exchange)) => (Some(stream), exchange.admit_write(last, &content, callback)),
                _ => (None, Admission::Reject(callback, ExchangeError::state_violation("completed").into())),
            }
        };

        let (stream, commit) = match (stream, admission) {
            (Some(stream), Admission::Send { commit }) => (stream, commit),
            (_, Admission::Flush(callback)) => {
                channel.invoker.run(Task::new("write-complete", move || callback.succeeded()));
                return;
            }
            (_, Admission::Reject(callback, failure)) => {
                debug!(exchange = %self.exchange.id(), cause = %failure, "write refused");
                channel.invoker.run(Task::new("write-failure", move || callback.failed(failure)));
                return;
            }
            // admission only sends with a stream at hand
            (None, Admission::Send { .. }) => return,
        };

        let (meta, mismatch) = {
            let mut fields = core.fields.lock();
            let meta = commit.then(|| core.prepare_response(&mut fields, stream.as_ref(), channel.connection.version(), last));
            (meta, fields.length_mismatch(last))
        };

        if let Some(error) = mismatch {
            warn!(exchange = %self.exchange.id(), cause = %error, "write does not match content length");
            let pending = channel.state.lock().exchange_of_mut(core).and_then(|exchange| exchange.on_write_complete.take());
            if let Some(callback) = pending {
                let failure = Failure::from(error);
                channel.invoker.run(Task::new("write-failure", move || callback.failed(failure)));
            }
            return;
        }

        stream.send(meta, last, self.write_completion(), content);
    }

    /// Like [`Response::write`], resolving once the write completed.
    pub fn write_async(&self, last: bool, content: Vec<Bytes>) -> impl Future<Output = Result<(), Failure>> + Send + 'static {
        let (tx, rx) = oneshot::channel();
        self.write(
            last,
            Callback::new(move |result| {
                let _ = tx.send(result);
            }),
            content,
        );
        async move { rx.await.unwrap_or_else(|_| Err(ExchangeError::state_violation("write callback dropped").into())) }
    }

    /// Renders an error page with the channel's error renderer and writes it as the whole body.
    ///
    /// Fails through `callback` if the response is already committed.
    pub fn write_error(&self, status: StatusCode, message: Option<String>, callback: Callback) {
        let page = ErrorPage::new(status, message, None);
        let mut headers = HeaderMap::new();
        let body = self.exchange.channel.renderer.render(self.request_header(), &page, &mut headers);

        let prepared = {
            let mut fields = self.exchange.core.fields.lock();
            if fields.committed {
                false
            } else {
                fields.status = Some(status);
                fields.headers.remove(header::CONTENT_LENGTH);
                fields.headers.extend(headers);
                true
            }
        };

        if prepared {
            self.write(true, callback, vec![body]);
        } else {
            let failure = Failure::from(ExchangeError::state_violation("committed"));
            self.exchange.channel.invoker.run(Task::new("write-failure", move || callback.failed(failure)));
        }
    }

    /// Asks the stream to push a resource; ignored once the exchange completed.
    pub fn push(&self, request: RequestHeader) {
        let stream = {
            let state = self.exchange.channel.state.lock();
            state.exchange_of(&self.exchange.core).and(state.stream.clone())
        };
        match stream {
            Some(stream) => stream.push(request),
            None => debug!(exchange = %self.exchange.id(), "push after completion ignored"),
        }
    }

    fn request_header(&self) -> &RequestHeader {
        &self.exchange.core.header
    }

    /// The callback handed to the stream: completes the pending write of this exchange.
    fn write_completion(&self) -> Callback {
        let exchange = self.exchange.clone();
        Callback::new(move |result| {
            let pending =
                exchange.channel.state.lock().exchange_of_mut(&exchange.core).and_then(|state| state.on_write_complete.take());
            match pending {
                Some(callback) => exchange.channel.invoker.run(Task::new("write-complete", move || callback.complete(result))),
                None => debug!(exchange = %exchange.id(), "write completed after the exchange ended"),
            }
        })
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fields = self.exchange.core.fields.lock();
        f.debug_struct("Response")
            .field("id", &self.exchange.id())
            .field("status", &fields.status)
            .field("committed", &fields.committed)
            .field("written", &fields.written)
            .finish()
    }
}
