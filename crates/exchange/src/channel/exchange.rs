use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use http::{HeaderMap, HeaderValue, StatusCode, Version, header};
use parking_lot::Mutex;
use tracing::debug;

use crate::callback::Callback;
use crate::channel::ChannelInner;
use crate::config::ChannelConfig;
use crate::date::DateService;
use crate::invoker::Task;
use crate::protocol::{
    ExchangeError, Failure, RequestHeader, ResponseHead, ResponseMeta, TrailerSupplier, parse_content_length,
};
use crate::stream::HttpStream;

/// Where an exchange is in its lifecycle.
///
/// Failure is not a phase of its own: an errored exchange keeps its phase and reports
/// [`Request::is_errored`](crate::channel::Request::is_errored) until the failure path completes it.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum ExchangePhase {
    /// The header was received, the application has not started yet
    Created = 0,
    /// The application is running and may read and write
    Processing = 1,
    /// The completion callback fired
    Completing = 2,
    /// The final frame was handed to the stream and the exchange is detached
    Terminal = 3,
}

impl ExchangePhase {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ExchangePhase::Created,
            1 => ExchangePhase::Processing,
            2 => ExchangePhase::Completing,
            _ => ExchangePhase::Terminal,
        }
    }
}

/// The immutable identity of an exchange plus the response fields.
///
/// Response fields have their own lock so application closures can inspect and mutate header
/// fields without holding the channel lock. When both are needed the channel lock is taken first.
pub(crate) struct ExchangeCore {
    pub(super) id: String,
    pub(super) header: RequestHeader,
    pub(super) fields: Mutex<ResponseFields>,
    pub(super) trailers: TrailerSupplier,
    phase: AtomicU8,
    failure: OnceLock<Failure>,
}

impl ExchangeCore {
    pub(super) fn new(id: String, header: RequestHeader, config: &ChannelConfig) -> Self {
        Self {
            id,
            header,
            fields: Mutex::new(ResponseFields::new(config)),
            trailers: TrailerSupplier::default(),
            phase: AtomicU8::new(ExchangePhase::Created as u8),
            failure: OnceLock::new(),
        }
    }

    pub(super) fn phase(&self) -> ExchangePhase {
        ExchangePhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    pub(super) fn set_phase(&self, phase: ExchangePhase) {
        self.phase.store(phase as u8, Ordering::Release);
    }

    /// The failure delivered to this exchange, kept after it is detached from the channel.
    pub(super) fn failure(&self) -> Option<&Failure> {
        self.failure.get()
    }

    pub(super) fn mark_errored(&self, failure: &Failure) {
        let _ = self.failure.set(failure.clone());
    }

    /// Freezes the response head for the first send.
    ///
    /// Defaults the status to 200 and resolves the committed content length: the declared
    /// `Content-Length` if any, otherwise the bytes written so far when this is the last write.
    pub(super) fn prepare_response(
        &self,
        fields: &mut ResponseFields,
        stream: &dyn HttpStream,
        version: Version,
        last: bool,
    ) -> ResponseMeta {
        let status = *fields.status.get_or_insert(StatusCode::OK);

        fields.committed_content_length = parse_content_length(&fields.headers);
        if last && fields.committed_content_length.is_none() {
            fields.committed_content_length = Some(fields.written);
            fields.headers.insert(header::CONTENT_LENGTH, HeaderValue::from(fields.written));
        }

        stream.prepare_response(&mut fields.headers);

        let mut head = ResponseHead::new(());
        *head.status_mut() = status;
        *head.version_mut() = version;
        *head.headers_mut() = fields.headers.clone();

        debug!(exchange = %self.id, status = status.as_u16(), content_length = ?fields.committed_content_length, "response committed");
        ResponseMeta::new(head, fields.committed_content_length, self.trailers.clone())
    }
}

/// Status, header fields and write accounting of a response.
pub(crate) struct ResponseFields {
    pub(super) status: Option<StatusCode>,
    pub(super) headers: HeaderMap,
    pub(super) committed: bool,
    pub(super) written: u64,
    pub(super) committed_content_length: Option<u64>,
    pub(super) last_written: bool,
}

impl ResponseFields {
    fn new(config: &ChannelConfig) -> Self {
        let mut fields = Self {
            status: None,
            headers: HeaderMap::new(),
            committed: false,
            written: 0,
            committed_content_length: None,
            last_written: false,
        };
        fields.add_standard_headers(config);
        fields
    }

    fn add_standard_headers(&mut self, config: &ChannelConfig) {
        if config.send_date_header() {
            self.headers.insert(header::DATE, DateService::get_global_instance().http_date());
        }
        if let Some(server) = config.server_header() {
            self.headers.insert(header::SERVER, server.clone());
        }
    }

    /// Performs the commit transition; returns true only for the call that committed.
    pub(super) fn commit(&mut self) -> bool {
        !std::mem::replace(&mut self.committed, true)
    }

    /// Clears status and header fields of an uncommitted response.
    pub(super) fn reset(&mut self) {
        self.status = None;
        self.headers.clear();
    }

    /// Starts over for an error response that replaces whatever was prepared.
    pub(super) fn recycle(&mut self, status: StatusCode, config: &ChannelConfig) {
        self.headers.clear();
        self.add_standard_headers(config);
        self.status = Some(status);
        self.committed = false;
        self.written = 0;
        self.committed_content_length = None;
        self.last_written = false;
    }

    /// Checks the bytes written so far against the committed content length.
    pub(super) fn length_mismatch(&self, last: bool) -> Option<ExchangeError> {
        let declared = self.committed_content_length?;
        let written = self.written;
        (declared < written || (last && declared > written)).then(|| ExchangeError::length_mismatch(declared, written))
    }
}

pub(super) type ErrorListener = Box<dyn FnOnce(Failure) + Send>;

/// The mutable, channel-locked part of the active exchange.
pub(crate) struct ExchangeState {
    pub(super) core: Arc<ExchangeCore>,
    pub(super) processing: bool,
    pub(super) error: Option<Failure>,
    pub(super) error_listeners: Vec<ErrorListener>,
    pub(super) on_content_available: Option<Task>,
    pub(super) on_write_complete: Option<Callback>,
}

/// The outcome of asking to start a write.
pub(super) enum Admission {
    /// Hand the bytes to the stream; `commit` is set for the committing write
    Send { commit: bool },
    /// Nothing to send, complete the callback right away
    Flush(Callback),
    /// The write is refused
    Reject(Callback, Failure),
}

impl ExchangeState {
    pub(super) fn new(core: Arc<ExchangeCore>) -> Self {
        Self {
            core,
            processing: false,
            error: None,
            error_listeners: Vec::new(),
            on_content_available: None,
            on_write_complete: None,
        }
    }

    /// Validates and registers a write, accounting for its bytes.
    pub(super) fn admit_write(&mut self, last: bool, content: &[Bytes], callback: Callback) -> Admission {
        let refused = if self.on_write_complete.is_some() {
            Some(ExchangeError::state_violation("write pending").into())
        } else if !self.processing {
            Some(ExchangeError::state_violation("not processing").into())
        } else {
            self.error.clone()
        };
        if let Some(failure) = refused {
            return Admission::Reject(callback, failure);
        }

        let mut fields = self.core.fields.lock();
        if fields.last_written {
            return Admission::Reject(callback, ExchangeError::state_violation("completed").into());
        }
        if content.is_empty() && !last && fields.committed {
            return Admission::Flush(callback);
        }

        fields.written += content.iter().map(|b| b.len() as u64).sum::<u64>();
        fields.last_written = last;
        let commit = fields.commit();
        drop(fields);

        self.on_write_complete = Some(callback);
        Admission::Send { commit }
    }
}

/// A handle on one exchange of a channel, shared by its request, response and completion sides.
#[derive(Clone)]
pub(crate) struct Exchange {
    pub(super) channel: Arc<ChannelInner>,
    pub(super) core: Arc<ExchangeCore>,
}

impl Exchange {
    pub(super) fn new(channel: Arc<ChannelInner>, core: Arc<ExchangeCore>) -> Self {
        Self { channel, core }
    }

    pub(super) fn id(&self) -> &str {
        &self.core.id
    }
}
