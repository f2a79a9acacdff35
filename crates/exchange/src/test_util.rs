//! A recording transport for driving channels in tests.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, Sender};

use bytes::Bytes;
use http::{HeaderMap, Method, Request as HttpRequest};
use parking_lot::Mutex;

use crate::callback::Callback;
use crate::channel::{Completion, HttpChannel, HttpChannelBuilder, Request, Response};
use crate::handler::make_handler;
use crate::protocol::{Content, Failure, RequestHeader, ResponseMeta};
use crate::stream::HttpStream;

/// Events shared between a stream and the callbacks of a test, in the order they happened.
pub(crate) type EventLog = Arc<Mutex<Vec<String>>>;

pub(crate) struct Sent {
    pub(crate) meta: Option<ResponseMeta>,
    pub(crate) last: bool,
    pub(crate) content: Vec<Bytes>,
}

impl Sent {
    pub(crate) fn body(&self) -> Vec<u8> {
        self.content.iter().flat_map(|b| b.iter().copied()).collect()
    }
}

#[derive(Default)]
struct Recorded {
    contents: VecDeque<Content>,
    sends: Vec<Sent>,
    pending: VecDeque<Callback>,
    demands: usize,
    pushes: Vec<RequestHeader>,
    committed: bool,
    outcome: Option<Result<(), Failure>>,
    unconsumed: Option<Failure>,
}

/// Holds the next `prepare_response` until released.
struct Gate {
    entered: Sender<()>,
    release: Receiver<()>,
}

pub(crate) struct RecordingStream {
    id: String,
    auto_complete: bool,
    recorded: Mutex<Recorded>,
    gate: Mutex<Option<Gate>>,
    events: EventLog,
}

impl RecordingStream {
    /// A stream that completes every send as soon as it is made.
    pub(crate) fn new(events: EventLog) -> Arc<Self> {
        Self::with_completion(events, true)
    }

    /// A stream that holds send callbacks until [`RecordingStream::complete_send`].
    pub(crate) fn manual(events: EventLog) -> Arc<Self> {
        Self::with_completion(events, false)
    }

    fn with_completion(events: EventLog, auto_complete: bool) -> Arc<Self> {
        Arc::new(Self { id: "1".to_string(), auto_complete, recorded: Mutex::default(), gate: Mutex::default(), events })
    }

    /// Blocks the next `prepare_response` until the returned sender fires; the receiver signals
    /// that a writer is blocked there, holding the response fields.
    pub(crate) fn hold_next_prepare(&self) -> (Receiver<()>, Sender<()>) {
        let (entered, on_entered) = mpsc::channel();
        let (release_tx, release) = mpsc::channel();
        *self.gate.lock() = Some(Gate { entered, release });
        (on_entered, release_tx)
    }

    pub(crate) fn push_content(&self, content: Content) {
        self.recorded.lock().contents.push_back(content);
    }

    pub(crate) fn set_unconsumed(&self, failure: Failure) {
        self.recorded.lock().unconsumed = Some(failure);
    }

    /// Completes the oldest pending send.
    pub(crate) fn complete_send(&self, result: Result<(), Failure>) {
        let callback = self.recorded.lock().pending.pop_front();
        callback.expect("no pending send").complete(result);
    }

    pub(crate) fn take_sends(&self) -> Vec<Sent> {
        std::mem::take(&mut self.recorded.lock().sends)
    }

    pub(crate) fn send_count(&self) -> usize {
        self.recorded.lock().sends.len()
    }

    pub(crate) fn demands(&self) -> usize {
        self.recorded.lock().demands
    }

    pub(crate) fn pushes(&self) -> usize {
        self.recorded.lock().pushes.len()
    }

    pub(crate) fn outcome(&self) -> Option<Result<(), Failure>> {
        self.recorded.lock().outcome.clone()
    }

    fn log(&self, event: &str) {
        self.events.lock().push(event.to_string());
    }
}

impl HttpStream for RecordingStream {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn read_content(&self) -> Option<Content> {
        self.recorded.lock().contents.pop_front()
    }

    fn demand_content(&self) {
        self.recorded.lock().demands += 1;
    }

    fn prepare_response(&self, _headers: &mut HeaderMap) {
        let gate = self.gate.lock().take();
        if let Some(gate) = gate {
            let _ = gate.entered.send(());
            let _ = gate.release.recv();
        }
    }

    fn send(&self, response: Option<ResponseMeta>, last: bool, callback: Callback, content: Vec<Bytes>) {
        self.log("stream.send");
        {
            let mut recorded = self.recorded.lock();
            recorded.committed |= response.is_some();
            recorded.sends.push(Sent { meta: response, last, content });
            if !self.auto_complete {
                recorded.pending.push_back(callback);
                return;
            }
        }
        callback.succeeded();
    }

    fn push(&self, request: RequestHeader) {
        self.recorded.lock().pushes.push(request);
    }

    fn is_committed(&self) -> bool {
        self.recorded.lock().committed
    }

    fn consume_all(&self) -> Option<Failure> {
        self.recorded.lock().unconsumed.clone()
    }

    fn succeeded(&self) {
        self.log("stream.succeeded");
        self.recorded.lock().outcome = Some(Ok(()));
    }

    fn failed(&self, cause: Failure) {
        self.log("stream.failed");
        self.recorded.lock().outcome = Some(Err(cause));
    }
}

pub(crate) type Parts = (Request, Response, Completion);

/// A channel whose handler hands the exchange parts to the test.
pub(crate) struct Harness {
    pub(crate) channel: HttpChannel,
    pub(crate) stream: Arc<RecordingStream>,
    pub(crate) events: EventLog,
    parts: Arc<Mutex<Option<Parts>>>,
}

impl Harness {
    pub(crate) fn new() -> Self {
        Self::with_builder(HttpChannel::builder(), false)
    }

    pub(crate) fn manual() -> Self {
        Self::with_builder(HttpChannel::builder(), true)
    }

    pub(crate) fn with_builder(builder: HttpChannelBuilder, manual: bool) -> Self {
        init_tracing();
        let parts = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&parts);
        let channel = builder
            .connection_id("c1")
            .handler(make_handler(move |request, response, completion| {
                *slot.lock() = Some((request, response, completion));
                Ok(())
            }))
            .build()
            .unwrap();

        let events = EventLog::default();
        let stream = if manual { RecordingStream::manual(Arc::clone(&events)) } else { RecordingStream::new(Arc::clone(&events)) };
        channel.set_stream(Arc::clone(&stream) as Arc<dyn HttpStream>).unwrap();
        Self { channel, stream, events, parts }
    }

    /// Delivers `header` and runs the dispatch task.
    pub(crate) fn start(&self, header: RequestHeader) -> Parts {
        self.channel.on_request(header).unwrap().run();
        self.parts.lock().take().expect("handler was not called")
    }

    pub(crate) fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }
}

/// Routes engine logs to the test output; repeated calls are no-ops.
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_max_level(tracing::Level::TRACE).with_test_writer().try_init();
}

pub(crate) fn get_request(method: Method, uri: &str) -> RequestHeader {
    RequestHeader::from(HttpRequest::builder().method(method).uri(uri).body(()).unwrap())
}
