//! An `http_body::Body` view of the request side.
//!
//! [`RequestBody`] turns the pull-and-demand protocol of [`Request`] into a pollable body: it
//! reads while content is available and, when the stream has nothing, registers one demand whose
//! callback wakes the polling task.

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::task::AtomicWaker;
use http_body::{Body, Frame, SizeHint};
use tracing::error;

use crate::channel::Request;
use crate::protocol::{Content, Failure};

pub struct RequestBody {
    request: Request,
    waker: Arc<AtomicWaker>,
    in_flight: Arc<AtomicBool>,
    eof: bool,
}

impl RequestBody {
    pub fn new(request: Request) -> Self {
        Self { request, waker: Arc::new(AtomicWaker::new()), in_flight: Arc::new(AtomicBool::new(false)), eof: false }
    }

    fn demand(&self) -> Result<(), Failure> {
        if self.in_flight.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let waker = Arc::clone(&self.waker);
        let in_flight = Arc::clone(&self.in_flight);
        self.request
            .demand_content(move || {
                in_flight.store(false, Ordering::Release);
                waker.wake();
            })
            .map_err(|e| {
                error!(cause = %e, "failed to demand request content");
                self.in_flight.store(false, Ordering::Release);
                Failure::from(e)
            })
    }
}

impl Body for RequestBody {
    type Data = Bytes;
    type Error = Failure;

    fn poll_frame(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        if this.eof {
            return Poll::Ready(None);
        }
        this.waker.register(cx.waker());

        loop {
            match this.request.read_content() {
                Some(Content::Chunk(chunk)) => {
                    this.eof = chunk.is_last();
                    let bytes = chunk.into_bytes();
                    if !bytes.is_empty() {
                        return Poll::Ready(Some(Ok(Frame::data(bytes))));
                    }
                    if this.eof {
                        return Poll::Ready(None);
                    }
                }
                Some(Content::Trailers(trailers)) => {
                    this.eof = true;
                    return Poll::Ready(Some(Ok(Frame::trailers(trailers))));
                }
                Some(Content::Error(failure)) => {
                    this.eof = true;
                    return Poll::Ready(Some(Err(failure)));
                }
                None => {
                    if let Err(failure) = this.demand() {
                        this.eof = true;
                        return Poll::Ready(Some(Err(failure)));
                    }
                    // the demand may already have fired while registering it
                    if this.in_flight.load(Ordering::Acquire) {
                        return Poll::Pending;
                    }
                }
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.eof
    }

    fn size_hint(&self) -> SizeHint {
        match self.request.content_length() {
            Some(length) => SizeHint::with_exact(length),
            None => SizeHint::new(),
        }
    }
}
