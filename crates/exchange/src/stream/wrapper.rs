use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use bytes::Bytes;
use http::HeaderMap;
use parking_lot::Mutex;
use tracing::warn;

use crate::callback::Callback;
use crate::invoker::panic_failure;
use crate::protocol::{Content, Failure, RequestHeader, ResponseMeta};
use crate::stream::HttpStream;

pub(crate) type ListenerSlot = Arc<Mutex<Option<Callback>>>;

/// A stream decorator that reports the end of the exchange to a listener.
///
/// The listener sees the outcome before it is propagated to the wrapped stream, and only once.
pub struct CompletionListenerStream {
    inner: Arc<dyn HttpStream>,
    listener: ListenerSlot,
}

impl CompletionListenerStream {
    pub fn new(inner: Arc<dyn HttpStream>, listener: Callback) -> Self {
        Self::with_slot(inner, Arc::new(Mutex::new(Some(listener))))
    }

    /// Wraps `inner` with a listener slot that may be shared by discarded wrappers.
    pub(crate) fn with_slot(inner: Arc<dyn HttpStream>, listener: ListenerSlot) -> Self {
        Self { inner, listener }
    }

    fn notify(&self, result: Result<(), Failure>) {
        let Some(listener) = self.listener.lock().take() else {
            return;
        };
        if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(|| listener.complete(result))) {
            warn!(cause = %panic_failure(panic.as_ref()), "completion listener failed");
        }
    }
}

impl HttpStream for CompletionListenerStream {
    fn id(&self) -> String {
        self.inner.id()
    }

    fn read_content(&self) -> Option<Content> {
        self.inner.read_content()
    }

    fn demand_content(&self) {
        self.inner.demand_content();
    }

    fn prepare_response(&self, headers: &mut HeaderMap) {
        self.inner.prepare_response(headers);
    }

    fn send(&self, response: Option<ResponseMeta>, last: bool, callback: Callback, content: Vec<Bytes>) {
        self.inner.send(response, last, callback, content);
    }

    fn push(&self, request: RequestHeader) {
        self.inner.push(request);
    }

    fn is_committed(&self) -> bool {
        self.inner.is_committed()
    }

    fn consume_all(&self) -> Option<Failure> {
        self.inner.consume_all()
    }

    fn succeeded(&self) {
        self.notify(Ok(()));
        self.inner.succeeded();
    }

    fn failed(&self, cause: Failure) {
        self.notify(Err(cause.clone()));
        self.inner.failed(cause);
    }

    fn wrapped(&self) -> Option<&Arc<dyn HttpStream>> {
        Some(&self.inner)
    }
}

impl fmt::Debug for CompletionListenerStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionListenerStream").field("id", &self.inner.id()).finish()
    }
}
