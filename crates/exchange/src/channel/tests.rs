use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, mpsc};
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderValue, Method, StatusCode, header};
use parking_lot::Mutex;

use super::*;
use crate::callback::Callback;
use crate::config::ChannelConfig;
use crate::handler::{MockErrorRenderer, make_handler};
use crate::protocol::{Content, PayloadSize};
use crate::stream::CompletionListenerStream;
use crate::test_util::{EventLog, Harness, RecordingStream, get_request, init_tracing};

type Outcome = Arc<Mutex<Option<Result<(), Failure>>>>;

fn bytes(n: usize) -> Bytes {
    Bytes::from(vec![b'x'; n])
}

fn capture() -> (Callback, Outcome) {
    let outcome = Outcome::default();
    let slot = Arc::clone(&outcome);
    (Callback::new(move |result| *slot.lock() = Some(result)), outcome)
}

fn logging(events: &EventLog, name: &'static str) -> Callback {
    let events = Arc::clone(events);
    Callback::new(move |result| {
        let suffix = if result.is_ok() { "ok" } else { "failed" };
        events.lock().push(format!("{name}.{suffix}"));
    })
}

fn io_failure(message: &str) -> Failure {
    Failure::from(ExchangeError::io(io::Error::other(message.to_string())))
}

fn taken(outcome: &Outcome) -> Result<(), Failure> {
    outcome.lock().take().expect("callback was not completed")
}

#[test]
fn second_last_write_fails_as_completed() {
    let harness = Harness::new();
    let (_request, response, _completion) = harness.start(get_request(Method::GET, "/"));

    let (first, first_outcome) = capture();
    response.write(true, first, vec![bytes(5)]);
    assert!(taken(&first_outcome).is_ok());

    let (second, second_outcome) = capture();
    response.write(true, second, vec![bytes(5)]);
    let failure = taken(&second_outcome).unwrap_err();
    assert!(matches!(failure.error(), ExchangeError::StateViolation { reason: "completed" }));

    let sends = harness.stream.take_sends();
    assert_eq!(sends.len(), 1);
    let meta = sends[0].meta.as_ref().unwrap();
    assert_eq!(meta.content_length(), Some(5));
    assert_eq!(meta.headers().get(header::CONTENT_LENGTH).unwrap(), "5");
    assert_eq!(meta.payload_size(), PayloadSize::Length(5));
    assert!(sends[0].last);
}

#[test]
fn write_while_pending_is_refused() {
    let harness = Harness::manual();
    let (_request, response, completion) = harness.start(get_request(Method::GET, "/"));

    let (first, first_outcome) = capture();
    response.write(false, first, vec![bytes(3)]);
    let (second, second_outcome) = capture();
    response.write(false, second, vec![bytes(3)]);

    assert!(matches!(taken(&second_outcome).unwrap_err().error(), ExchangeError::StateViolation { reason: "write pending" }));
    assert_eq!(harness.stream.send_count(), 1);
    assert!(first_outcome.lock().is_none());

    harness.stream.complete_send(Ok(()));
    assert!(taken(&first_outcome).is_ok());

    let (third, third_outcome) = capture();
    response.write(true, third, vec![bytes(2)]);
    harness.stream.complete_send(Ok(()));
    assert!(taken(&third_outcome).is_ok());

    completion.succeeded().unwrap();
    assert!(matches!(harness.stream.outcome(), Some(Ok(()))));

    let sends = harness.stream.take_sends();
    assert_eq!(sends.len(), 2);
    let meta = sends[0].meta.as_ref().unwrap();
    assert_eq!(meta.payload_size(), PayloadSize::Chunked);
    assert!(sends[1].meta.is_none());
    assert!(sends[1].last);
}

#[test]
fn error_wakes_demand_then_write_then_listeners_then_completion() {
    let harness = Harness::manual();
    let (request, response, _completion) = harness.start(get_request(Method::POST, "/upload"));

    let events = Arc::clone(&harness.events);
    request.demand_content(move || events.lock().push("demand".to_string())).unwrap();
    response.write(false, logging(&harness.events, "write"), vec![bytes(3)]);
    let events = Arc::clone(&harness.events);
    request.add_error_listener(move |_| events.lock().push("listener".to_string()));
    harness.events.lock().clear();

    let cause = io_failure("reset");
    harness.channel.on_error(cause.clone()).unwrap().run();

    assert_eq!(harness.events(), vec!["demand", "write.failed", "listener", "stream.failed"]);
    match harness.stream.outcome() {
        Some(Err(failure)) => assert!(failure.is_same(&cause)),
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert!(request.is_errored());
    match request.read_content() {
        Some(Content::Error(failure)) => assert!(failure.is_same(&cause)),
        other => panic!("unexpected content: {other:?}"),
    }
}

#[test]
fn unread_body_makes_connection_non_persistent() {
    let harness = Harness::new();
    let (_request, response, completion) = harness.start(get_request(Method::POST, "/upload"));

    response.set_content_length(10).unwrap();
    response.write(true, Callback::noop(), vec![bytes(10)]);
    harness.stream.set_unconsumed(Failure::from(ExchangeError::unconsumed_body("10 bytes left")));

    completion.succeeded().unwrap();

    assert!(matches!(harness.stream.outcome(), Some(Ok(()))));
    assert!(!harness.channel.connection().is_persistent());
    assert_eq!(harness.stream.send_count(), 1);
}

#[test]
fn unread_body_before_commit_closes_the_connection() {
    let harness = Harness::new();
    let (_request, _response, completion) = harness.start(get_request(Method::POST, "/upload"));
    harness.stream.set_unconsumed(Failure::from(ExchangeError::unconsumed_body("chunked body left")));

    completion.succeeded().unwrap();

    let sends = harness.stream.take_sends();
    let meta = sends[0].meta.as_ref().unwrap();
    assert_eq!(meta.headers().get(header::CONNECTION).unwrap(), "close");
    assert_eq!(meta.headers().get(header::CONTENT_LENGTH).unwrap(), "0");
    assert!(matches!(harness.stream.outcome(), Some(Ok(()))));
    assert!(!harness.channel.connection().is_persistent());
}

#[test]
fn undrainable_body_fails_the_stream() {
    let harness = Harness::new();
    let (_request, _response, completion) = harness.start(get_request(Method::POST, "/upload"));
    let cause = io_failure("read failed");
    harness.stream.set_unconsumed(cause.clone());

    completion.succeeded().unwrap();

    match harness.stream.outcome() {
        Some(Err(failure)) => assert!(failure.is_same(&cause)),
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(harness.stream.send_count(), 0);
}

#[test]
fn second_request_is_rejected_while_one_is_active() {
    let harness = Harness::new();
    let (request, _response, _completion) = harness.start(get_request(Method::GET, "/first"));

    let error = harness.channel.on_request(get_request(Method::GET, "/second")).unwrap_err();

    assert!(error.is_state_violation());
    assert_eq!(harness.channel.current_request().unwrap().uri(), "/first");
    assert_eq!(harness.channel.requests(), 1);
    assert_eq!(request.phase(), ExchangePhase::Processing);
}

#[test]
fn reset_then_no_content_commits_an_empty_response() {
    let harness = Harness::new();
    let (_request, response, completion) = harness.start(get_request(Method::GET, "/"));

    response.with_headers_mut(|headers| headers.insert("x-trace", HeaderValue::from_static("1"))).unwrap();
    response.set_status(StatusCode::IM_A_TEAPOT);
    response.reset().unwrap();
    assert!(response.status().is_none());
    response.set_status(StatusCode::NO_CONTENT);

    completion.succeeded().unwrap();

    let sends = harness.stream.take_sends();
    assert_eq!(sends.len(), 1);
    let meta = sends[0].meta.as_ref().unwrap();
    assert_eq!(meta.status(), StatusCode::NO_CONTENT);
    assert_eq!(meta.headers().get(header::CONTENT_LENGTH).unwrap(), "0");
    assert!(meta.headers().get("x-trace").is_none());
    assert_eq!(meta.payload_size(), PayloadSize::Empty);
    assert!(sends[0].body().is_empty());
    assert!(sends[0].last);
    assert!(matches!(harness.stream.outcome(), Some(Ok(()))));
}

#[test]
fn reset_after_commit_is_refused() {
    let harness = Harness::new();
    let (_request, response, _completion) = harness.start(get_request(Method::GET, "/"));
    response.write(false, Callback::noop(), vec![bytes(1)]);

    assert!(response.is_committed());
    assert!(response.reset().unwrap_err().is_state_violation());
    assert!(response.set_content_length(3).unwrap_err().is_state_violation());
}

#[test]
fn write_beyond_declared_length_sends_nothing() {
    let harness = Harness::new();
    let (_request, response, completion) = harness.start(get_request(Method::GET, "/"));
    response.set_content_length(4).unwrap();

    let (callback, outcome) = capture();
    response.write(false, callback, vec![bytes(5)]);

    assert!(matches!(taken(&outcome).unwrap_err().error(), ExchangeError::LengthMismatch { declared: 4, written: 5 }));
    assert_eq!(harness.stream.send_count(), 0);

    completion.succeeded().unwrap();
    match harness.stream.outcome() {
        Some(Err(failure)) => assert!(failure.error().is_length_mismatch()),
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[test]
fn short_last_write_fails() {
    let harness = Harness::new();
    let (_request, response, _completion) = harness.start(get_request(Method::GET, "/"));
    response.set_content_length(10).unwrap();

    let (callback, outcome) = capture();
    response.write(true, callback, vec![bytes(4)]);

    assert!(matches!(taken(&outcome).unwrap_err().error(), ExchangeError::LengthMismatch { declared: 10, written: 4 }));
    assert_eq!(harness.stream.send_count(), 0);
}

#[test]
fn demand_after_failure_runs_immediately() {
    let harness = Harness::new();
    let (request, _response, _completion) = harness.start(get_request(Method::POST, "/upload"));
    let cause = io_failure("timeout");
    harness.channel.on_error(cause.clone()).unwrap().run();

    let seen = Arc::new(Mutex::new(None));
    let reader = request.clone();
    let slot = Arc::clone(&seen);
    request.demand_content(move || *slot.lock() = Some(reader.read_content())).unwrap();

    match seen.lock().take() {
        Some(Some(Content::Error(failure))) => assert!(failure.is_same(&cause)),
        other => panic!("unexpected read: {other:?}"),
    }
    assert_eq!(harness.stream.demands(), 0);

    let (tx, rx) = std::sync::mpsc::channel();
    request.add_error_listener(move |failure| tx.send(failure).unwrap());
    assert!(rx.try_recv().unwrap().is_same(&cause));
}

#[test]
fn only_one_demand_may_be_pending() {
    let harness = Harness::new();
    let (request, _response, _completion) = harness.start(get_request(Method::POST, "/upload"));

    let events = Arc::clone(&harness.events);
    request.demand_content(move || events.lock().push("first".to_string())).unwrap();
    let error = request.demand_content(|| {}).unwrap_err();
    assert!(matches!(error, ExchangeError::InvalidArgument { reason: "demand pending" }));
    assert_eq!(harness.stream.demands(), 1);

    harness.stream.push_content(Content::chunk(Bytes::from_static(b"ab"), true));
    harness.channel.on_content_available().unwrap().run();
    assert_eq!(harness.events(), vec!["first"]);
    assert!(harness.channel.on_content_available().is_none());

    match request.read_content() {
        Some(Content::Chunk(chunk)) => {
            assert!(chunk.is_last());
            assert_eq!(chunk.bytes(), &Bytes::from_static(b"ab"));
        }
        other => panic!("unexpected content: {other:?}"),
    }
}

#[test]
fn reads_wait_for_processing() {
    let harness = Harness::new();
    let dispatch = harness.channel.on_request(get_request(Method::POST, "/upload")).unwrap();
    let request = harness.channel.current_request().unwrap();

    assert_eq!(request.phase(), ExchangePhase::Created);
    match request.read_content() {
        Some(Content::Error(failure)) => {
            assert!(matches!(failure.error(), ExchangeError::StateViolation { reason: "not processing" }));
        }
        other => panic!("unexpected content: {other:?}"),
    }

    dispatch.run();
    assert_eq!(request.phase(), ExchangePhase::Processing);
    assert!(request.read_content().is_none());
}

#[test]
fn later_failures_are_suppressed_by_the_first() {
    let harness = Harness::new();
    let (_request, _response, _completion) = harness.start(get_request(Method::GET, "/"));

    let first = io_failure("reset");
    let drainer = harness.channel.on_error(first.clone()).unwrap();
    assert!(harness.channel.on_error(first.clone()).is_none());
    assert!(first.suppressed().is_empty());

    let second = io_failure("timeout");
    assert!(harness.channel.on_error(second.clone()).is_none());
    drainer.run();

    let suppressed = first.suppressed();
    assert_eq!(suppressed.len(), 1);
    assert!(suppressed[0].is_same(&second));
    match harness.stream.outcome() {
        Some(Err(failure)) => assert!(failure.is_same(&first)),
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[test]
fn failure_without_a_stream_is_dropped() {
    let harness = Harness::new();
    let (_request, _response, completion) = harness.start(get_request(Method::GET, "/"));
    completion.succeeded().unwrap();

    assert!(harness.channel.on_error(io_failure("late")).is_none());
    assert!(harness.channel.current_request().is_none());
}

#[test]
fn failure_before_any_request_renders_an_error_response() {
    let harness = Harness::new();
    let cause = io_failure("idle timeout");

    harness.channel.on_error(cause.clone()).unwrap().run();

    let sends = harness.stream.take_sends();
    assert_eq!(sends.len(), 1);
    let meta = sends[0].meta.as_ref().unwrap();
    assert_eq!(meta.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(meta.headers().get(header::CONTENT_TYPE).unwrap(), "text/plain; charset=utf-8");
    assert_eq!(sends[0].body(), b"500 Internal Server Error\n");
    match harness.stream.outcome() {
        Some(Err(failure)) => assert!(failure.is_same(&cause)),
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(harness.channel.requests(), 0);
}

#[test]
fn ambiguous_target_renders_bad_request() {
    let harness = Harness::new();

    harness.channel.on_request(get_request(Method::GET, "/a/%2F/b")).unwrap().run();

    let sends = harness.stream.take_sends();
    let meta = sends[0].meta.as_ref().unwrap();
    assert_eq!(meta.status(), StatusCode::BAD_REQUEST);
    assert_eq!(meta.content_length(), Some(sends[0].body().len() as u64));
    assert_eq!(sends[0].body(), b"400 Ambiguous URI path separator\n");
    match harness.stream.outcome() {
        Some(Err(failure)) => assert_eq!(failure.status(), StatusCode::BAD_REQUEST),
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[test]
fn handler_errors_and_panics_render_internal_error() {
    init_tracing();
    let failing = HttpChannel::builder().handler(make_handler(|_, _, _| Err("boom".into()))).build().unwrap();
    let panicking = HttpChannel::builder().handler(make_handler(|_, _, _| panic!("kaboom"))).build().unwrap();

    for channel in [failing, panicking] {
        let stream = RecordingStream::new(EventLog::default());
        channel.set_stream(Arc::clone(&stream) as Arc<dyn HttpStream>).unwrap();
        channel.on_request(get_request(Method::GET, "/")).unwrap().run();

        let sends = stream.take_sends();
        assert_eq!(sends[0].meta.as_ref().unwrap().status(), StatusCode::INTERNAL_SERVER_ERROR);
        match stream.outcome() {
            Some(Err(failure)) => assert!(matches!(failure.error(), ExchangeError::Application { .. })),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
}

#[test]
fn error_pages_come_from_the_configured_renderer() {
    let mut renderer = MockErrorRenderer::new();
    renderer
        .expect_render()
        .times(1)
        .withf(|_, page, _| page.status() == StatusCode::BAD_REQUEST && page.message() == "Ambiguous URI empty segment")
        .returning(|_, _, headers| {
            headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
            Bytes::from_static(b"{}")
        });
    let harness = Harness::with_builder(HttpChannel::builder().error_renderer(renderer), false);

    harness.channel.on_request(get_request(Method::GET, "/a//b")).unwrap().run();

    let sends = harness.stream.take_sends();
    let meta = sends[0].meta.as_ref().unwrap();
    assert_eq!(meta.headers().get(header::CONTENT_TYPE).unwrap(), "application/json");
    assert_eq!(meta.headers().get(header::CONTENT_LENGTH).unwrap(), "2");
    assert_eq!(sends[0].body(), b"{}");
}

#[test]
fn write_error_replaces_the_body() {
    let harness = Harness::new();
    let (_request, response, completion) = harness.start(get_request(Method::GET, "/missing"));

    let (callback, outcome) = capture();
    response.write_error(StatusCode::NOT_FOUND, None, callback);
    assert!(taken(&outcome).is_ok());

    let sends = harness.stream.take_sends();
    assert_eq!(sends[0].meta.as_ref().unwrap().status(), StatusCode::NOT_FOUND);
    assert_eq!(sends[0].body(), b"404 Not Found\n");

    let (callback, outcome) = capture();
    response.write_error(StatusCode::BAD_GATEWAY, Some("upstream".to_string()), callback);
    assert!(matches!(taken(&outcome).unwrap_err().error(), ExchangeError::StateViolation { reason: "committed" }));

    completion.succeeded().unwrap();
    assert!(matches!(harness.stream.outcome(), Some(Ok(()))));
}

#[test]
fn stream_wrappers_must_wrap_the_active_stream() {
    let harness = Harness::new();
    let (_request, _response, completion) = harness.start(get_request(Method::GET, "/"));

    let error = harness
        .channel
        .add_stream_wrapper(|_| -> Arc<dyn HttpStream> { RecordingStream::new(EventLog::default()) })
        .unwrap_err();
    assert!(error.is_state_violation());

    harness
        .channel
        .add_stream_wrapper(|stream| -> Arc<dyn HttpStream> { Arc::new(CompletionListenerStream::new(stream, Callback::noop())) })
        .unwrap();

    completion.succeeded().unwrap();
    let error = harness
        .channel
        .add_stream_wrapper(|stream| -> Arc<dyn HttpStream> { Arc::new(CompletionListenerStream::new(stream, Callback::noop())) })
        .unwrap_err();
    assert!(error.is_state_violation());
}

#[test]
fn completion_listener_runs_before_the_stream_completes() {
    let harness = Harness::new();
    let (request, response, completion) = harness.start(get_request(Method::GET, "/"));
    request.add_completion_listener(logging(&harness.events, "listener")).unwrap();
    response.write(true, Callback::noop(), vec![bytes(2)]);
    harness.events.lock().clear();

    completion.succeeded().unwrap();

    assert_eq!(harness.events(), vec!["listener.ok", "stream.succeeded"]);
    assert!(request.add_completion_listener(Callback::noop()).unwrap_err().is_state_violation());
}

#[test]
fn connection_close_fails_the_exchange_and_notifies_listeners() {
    let harness = Harness::new();
    let (request, _response, _completion) = harness.start(get_request(Method::GET, "/"));
    let seen = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&seen);
    harness.channel.add_connection_close_listener(move |cause| *slot.lock() = Some(cause));

    let cause = io_failure("connection reset");
    harness.channel.on_connection_close(Some(cause.clone())).unwrap().run();

    match seen.lock().take() {
        Some(Some(failure)) => assert!(failure.is_same(&cause)),
        other => panic!("unexpected close cause: {other:?}"),
    }
    match harness.stream.outcome() {
        Some(Err(failure)) => assert!(failure.is_same(&cause)),
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert!(request.failure().unwrap().is_same(&cause));
    assert!(harness.channel.on_connection_close(None).is_none());
}

#[test]
fn clean_close_notifies_listeners_without_a_cause() {
    let harness = Harness::new();
    let (_request, _response, completion) = harness.start(get_request(Method::GET, "/"));
    completion.succeeded().unwrap();

    let seen = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&seen);
    harness.channel.add_connection_close_listener(move |cause| *slot.lock() = Some(cause));
    harness.channel.add_connection_close_listener(|_| panic!("listener failed"));
    harness.channel.on_connection_close(None).unwrap().run();

    assert!(matches!(seen.lock().take(), Some(None)));
}

#[test]
fn panicking_callback_closes_the_connection() {
    let harness = Harness::new();
    let (_request, response, _completion) = harness.start(get_request(Method::GET, "/"));
    let seen = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&seen);
    harness.channel.add_connection_close_listener(move |cause| *slot.lock() = Some(cause));

    response.write(false, Callback::new(|_| panic!("boom")), vec![bytes(1)]);

    let close_cause = match seen.lock().take() {
        Some(Some(failure)) => failure,
        other => panic!("unexpected close cause: {other:?}"),
    };
    assert_eq!(close_cause.to_string(), "application error: boom");
    match harness.stream.outcome() {
        Some(Err(failure)) => assert!(failure.is_same(&close_cause)),
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[test]
fn panicking_callback_on_a_failed_exchange_is_suppressed() {
    let harness = Harness::manual();
    let (_request, response, _completion) = harness.start(get_request(Method::GET, "/"));
    response.write(false, Callback::new(|_| panic!("boom")), vec![bytes(1)]);

    let cause = io_failure("reset");
    harness.channel.on_error(cause.clone()).unwrap().run();

    let suppressed = cause.suppressed();
    assert_eq!(suppressed.len(), 1);
    assert_eq!(suppressed[0].to_string(), "application error: boom");
    assert!(harness.channel.connection().is_persistent());
}

#[test]
fn standard_headers_are_added_on_commit() {
    let config = ChannelConfig::builder().server_header(HeaderValue::from_static("micro-exchange")).build();
    let harness = Harness::with_builder(HttpChannel::builder().config(config), false);
    let (_request, _response, completion) = harness.start(get_request(Method::GET, "/"));

    completion.succeeded().unwrap();

    let sends = harness.stream.take_sends();
    let headers = sends[0].meta.as_ref().unwrap().headers();
    assert!(headers.contains_key(header::DATE));
    assert_eq!(headers.get(header::SERVER).unwrap(), "micro-exchange");
}

#[test]
fn trailers_can_be_added_after_commit() {
    let harness = Harness::new();
    let (_request, response, completion) = harness.start(get_request(Method::GET, "/"));

    response.write(false, Callback::noop(), vec![bytes(3)]);
    response.with_trailers_mut(|trailers| trailers.insert("x-checksum", HeaderValue::from_static("abc")));
    completion.succeeded().unwrap();

    let sends = harness.stream.take_sends();
    assert_eq!(sends.len(), 2);
    let trailers = sends[0].meta.as_ref().unwrap().trailers().take().unwrap();
    assert_eq!(trailers.get("x-checksum").unwrap(), "abc");
}

#[test]
fn empty_writes_commit_once_then_flush() {
    let harness = Harness::new();
    let (_request, response, _completion) = harness.start(get_request(Method::GET, "/events"));

    let (first, first_outcome) = capture();
    response.write(false, first, Vec::new());
    let (second, second_outcome) = capture();
    response.write(false, second, Vec::new());

    assert!(taken(&first_outcome).is_ok());
    assert!(taken(&second_outcome).is_ok());
    let sends = harness.stream.take_sends();
    assert_eq!(sends.len(), 1);
    assert_eq!(sends[0].meta.as_ref().unwrap().payload_size(), PayloadSize::Chunked);
}

#[test]
fn completion_waits_for_the_pending_write() {
    let harness = Harness::manual();
    let (_request, response, completion) = harness.start(get_request(Method::GET, "/"));
    response.write(false, Callback::noop(), vec![bytes(3)]);

    let error = completion.succeeded().unwrap_err();
    assert!(matches!(error, ExchangeError::StateViolation { reason: "write pending" }));
    assert!(harness.channel.current_request().is_some());

    harness.stream.complete_send(Ok(()));
    completion.succeeded().unwrap();
    harness.stream.complete_send(Ok(()));
    assert!(matches!(harness.stream.outcome(), Some(Ok(()))));
}

#[test]
fn phases_follow_the_exchange() {
    let harness = Harness::new();
    let (request, response, completion) = harness.start(get_request(Method::GET, "/"));
    assert_eq!(request.phase(), ExchangePhase::Processing);

    completion.succeeded().unwrap();
    assert_eq!(request.phase(), ExchangePhase::Terminal);

    let (callback, outcome) = capture();
    response.write(true, callback, vec![bytes(1)]);
    assert!(matches!(taken(&outcome).unwrap_err().error(), ExchangeError::StateViolation { reason: "completed" }));
    completion.failed(io_failure("ignored"));
    assert!(matches!(harness.stream.outcome(), Some(Ok(()))));
}

#[test]
fn request_ids_combine_connection_and_stream() {
    let harness = Harness::new();
    let (request, response, _completion) = harness.start(get_request(Method::GET, "/"));

    assert_eq!(request.id(), "c1#1");
    assert_eq!(request.connection().id(), "c1");

    response.push(get_request(Method::GET, "/style.css"));
    assert_eq!(harness.stream.pushes(), 1);
}

#[tokio::test]
async fn write_async_resolves_with_the_write() {
    let harness = Harness::new();
    let (_request, response, completion) = harness.start(get_request(Method::GET, "/"));

    response.write_async(true, vec![bytes(3)]).await.unwrap();
    let failure = response.write_async(true, vec![bytes(3)]).await.unwrap_err();
    assert!(failure.error().is_state_violation());

    completion.succeeded().unwrap();
    assert!(matches!(harness.stream.outcome(), Some(Ok(()))));
}

#[test]
fn failure_before_dispatch_starts_processing() {
    let harness = Harness::new();
    let _dispatch = harness.channel.on_request(get_request(Method::GET, "/")).unwrap();
    let request = harness.channel.current_request().unwrap();
    assert_eq!(request.phase(), ExchangePhase::Created);

    let drainer = harness.channel.on_error(io_failure("reset")).unwrap();
    assert_eq!(request.phase(), ExchangePhase::Processing);

    drainer.run();
    assert_eq!(request.phase(), ExchangePhase::Terminal);
    let sends = harness.stream.take_sends();
    assert_eq!(sends.len(), 1);
    assert_eq!(sends[0].meta.as_ref().unwrap().status(), StatusCode::INTERNAL_SERVER_ERROR);
}

#[test]
fn failure_during_a_committing_write_keeps_its_head() {
    let harness = Harness::new();
    let (_request, response, _completion) = harness.start(get_request(Method::GET, "/"));
    let (entered, release) = harness.stream.hold_next_prepare();
    let (callback, outcome) = capture();
    let cause = io_failure("reset");

    thread::scope(|scope| {
        let writer = response.clone();
        let writing = scope.spawn(move || writer.write(false, callback, vec![bytes(3)]));
        entered.recv_timeout(Duration::from_secs(2)).expect("write never reached the stream");

        let channel = harness.channel.clone();
        let failure = cause.clone();
        let failing = scope.spawn(move || channel.on_error(failure).unwrap().run());
        thread::sleep(Duration::from_millis(50));
        release.send(()).unwrap();

        writing.join().unwrap();
        failing.join().unwrap();
    });

    let sends = harness.stream.take_sends();
    assert_eq!(sends.len(), 1);
    assert_eq!(sends[0].meta.as_ref().unwrap().status(), StatusCode::OK);
    assert_eq!(sends[0].body(), b"xxx");
    match harness.stream.outcome() {
        Some(Err(failure)) => assert!(failure.is_same(&cause)),
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert!(taken(&outcome).unwrap_err().is_same(&cause));
}

#[test]
fn concurrent_writes_admit_one() {
    let harness = Harness::manual();
    let (_request, response, _completion) = harness.start(get_request(Method::GET, "/"));
    let barrier = Barrier::new(2);
    let outcomes: Vec<Outcome> = thread::scope(|scope| {
        let writers: Vec<_> = (0..2)
            .map(|_| {
                let (callback, outcome) = capture();
                let response = response.clone();
                let barrier = &barrier;
                scope.spawn(move || {
                    barrier.wait();
                    response.write(false, callback, vec![bytes(3)]);
                    outcome
                })
            })
            .collect();
        writers.into_iter().map(|writer| writer.join().unwrap()).collect()
    });

    assert_eq!(harness.stream.send_count(), 1);
    let (refused, pending): (Vec<_>, Vec<_>) = outcomes.iter().partition(|outcome| outcome.lock().is_some());
    assert_eq!(refused.len(), 1);
    assert!(matches!(taken(refused[0]).unwrap_err().error(), ExchangeError::StateViolation { reason: "write pending" }));

    harness.stream.complete_send(Ok(()));
    assert!(taken(pending[0]).is_ok());
}

#[test]
fn demand_races_content_arrival() {
    let harness = Harness::new();
    let (request, _response, _completion) = harness.start(get_request(Method::POST, "/upload"));
    let woken = Arc::new(AtomicUsize::new(0));

    for round in 0..200 {
        thread::scope(|scope| {
            let channel = harness.channel.clone();
            let woken_seen = Arc::clone(&woken);
            let arrival = scope.spawn(move || {
                while woken_seen.load(Ordering::Acquire) <= round {
                    if let Some(task) = channel.on_content_available() {
                        task.run();
                    }
                    thread::yield_now();
                }
            });

            let woken = Arc::clone(&woken);
            request.demand_content(move || {
                woken.fetch_add(1, Ordering::AcqRel);
            })
            .unwrap();
            arrival.join().unwrap();
        });
        assert_eq!(woken.load(Ordering::Acquire), round + 1);
    }
    assert_eq!(harness.stream.demands(), 200);
}

#[test]
fn stream_wrapper_retries_when_the_stream_changes() {
    let harness = Harness::new();
    let (_request, response, completion) = harness.start(get_request(Method::GET, "/"));
    let mut calls = 0;

    harness
        .channel
        .add_stream_wrapper(|stream| -> Arc<dyn HttpStream> {
            calls += 1;
            if calls == 1 {
                let channel = harness.channel.clone();
                let events = Arc::clone(&harness.events);
                thread::spawn(move || {
                    channel
                        .add_stream_wrapper(|stream| -> Arc<dyn HttpStream> {
                            Arc::new(CompletionListenerStream::new(stream, logging(&events, "inner")))
                        })
                        .unwrap();
                })
                .join()
                .unwrap();
            }
            Arc::new(CompletionListenerStream::new(stream, logging(&harness.events, "outer")))
        })
        .unwrap();
    assert_eq!(calls, 2);

    response.write(true, Callback::noop(), vec![bytes(2)]);
    completion.succeeded().unwrap();
    assert_eq!(harness.events(), vec!["stream.send", "outer.ok", "inner.ok", "stream.succeeded"]);
}

#[test]
fn header_closures_may_reenter_the_response() {
    let harness = Harness::new();
    let (_request, response, _completion) = harness.start(get_request(Method::GET, "/"));

    let (tx, rx) = mpsc::channel();
    let reentrant = response.clone();
    thread::spawn(move || {
        let committed = reentrant.with_headers_mut(|headers| {
            headers.insert("x-trace", HeaderValue::from_static("1"));
            reentrant.set_status(StatusCode::ACCEPTED);
            reentrant.with_headers(|headers| headers.len());
            reentrant.is_committed()
        });
        let status = reentrant.with_trailers_mut(|trailers| {
            trailers.insert("x-checksum", HeaderValue::from_static("abc"));
            reentrant.status()
        });
        let _ = tx.send((committed, status));
    });
    let (committed, status) = rx.recv_timeout(Duration::from_secs(2)).expect("header closure blocked");
    assert!(!committed.unwrap());
    assert_eq!(status, Some(StatusCode::ACCEPTED));

    response.write(true, Callback::noop(), vec![bytes(1)]);
    let sends = harness.stream.take_sends();
    let meta = sends[0].meta.as_ref().unwrap();
    assert_eq!(meta.status(), StatusCode::ACCEPTED);
    assert_eq!(meta.headers().get("x-trace").unwrap(), "1");
}

#[test]
fn header_edits_are_dropped_if_a_write_commits_first() {
    let harness = Harness::new();
    let (_request, response, _completion) = harness.start(get_request(Method::GET, "/"));

    let result = response.with_headers_mut(|headers| {
        headers.insert("x-late", HeaderValue::from_static("1"));
        response.write(true, Callback::noop(), vec![bytes(2)]);
    });

    assert!(matches!(result, Err(ExchangeError::StateViolation { reason: "committed" })));
    assert!(response.with_headers(|headers| !headers.contains_key("x-late")));
    let sends = harness.stream.take_sends();
    assert!(!sends[0].meta.as_ref().unwrap().headers().contains_key("x-late"));
}
