use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use parking_lot::Mutex;
use tonic::metadata::MetadataMap;
use tonic::{Code, Status};

use super::*;
use crate::codec::FnMarshaller;
use crate::config::CallOptions;
use crate::testutil::{Cancellation, FakeCall, FakeChannel, HandlerEvent, RecordingHandler};
use crate::transport::Transport;

type Events = Arc<Mutex<Vec<HandlerEvent<String>>>>;

fn utf8() -> impl Marshaller<String> {
    FnMarshaller::new(
        |s: &String| {
            if s == "unencodable" {
                return Err(Status::invalid_argument("refusing to encode"));
            }
            Ok(Bytes::from(s.clone()))
        },
        |buf: Bytes| {
            String::from_utf8(buf.to_vec()).map_err(|e| Status::internal(e.to_string()))
        },
    )
}

fn new_call() -> (StreamingCall<String, String>, Arc<FakeCall>) {
    let channel = FakeChannel::new();
    let transport = Transport::new("ctrl-plane:443", channel.clone(), CallOptions::default());
    let call = transport
        .create_streaming_call("Discover", utf8(), utf8())
        .unwrap();
    let fake = channel.last_call().unwrap();
    (call, fake)
}

fn started_call() -> (StreamingCall<String, String>, Arc<FakeCall>, Events) {
    let (call, fake) = new_call();
    let (handler, events) = RecordingHandler::new();
    call.start(handler).unwrap();
    (call, fake, events)
}

fn msg(s: &str) -> HandlerEvent<String> {
    HandlerEvent::Message(s.to_string())
}

fn status(code: Code, message: &str) -> HandlerEvent<String> {
    HandlerEvent::Status(code, message.to_string())
}

fn message_count(events: &Events) -> usize {
    events
        .lock()
        .iter()
        .filter(|e| matches!(e, HandlerEvent::Message(_)))
        .count()
}

#[test]
fn test_start_grants_one_message() {
    let (call, fake, events) = started_call();

    assert_eq!(call.state(), CallState::Active);
    assert!(fake.is_started());
    assert_eq!(fake.requested(), 1);

    fake.push_message("M1");
    fake.push_message("M2");
    assert_eq!(*events.lock(), vec![msg("M1")]);

    call.start_recv_message().unwrap();
    assert_eq!(*events.lock(), vec![msg("M1"), msg("M2")]);
    assert_eq!(fake.requested(), 2);
}

#[test]
fn test_n_pulls_deliver_at_most_n_plus_one_messages() {
    let (call, fake, events) = started_call();

    for i in 0..6 {
        fake.push_message(format!("M{i}"));
    }
    call.start_recv_message().unwrap();
    call.start_recv_message().unwrap();
    assert_eq!(message_count(&events), 3);

    // Credits accumulate when nothing is waiting.
    for _ in 0..5 {
        call.start_recv_message().unwrap();
    }
    assert_eq!(message_count(&events), 6);
    fake.push_message("M6");
    fake.push_message("M7");
    assert_eq!(message_count(&events), 8);
    fake.push_message("M8");
    assert_eq!(message_count(&events), 8);

    let received: Vec<_> = events
        .lock()
        .iter()
        .map(|e| match e {
            HandlerEvent::Message(m) => m.clone(),
            other => panic!("unexpected event {other:?}"),
        })
        .collect();
    assert_eq!(received, ["M0", "M1", "M2", "M3", "M4", "M5", "M6", "M7"]);
}

#[test]
fn test_status_is_delivered_once_and_last() {
    let (call, fake, events) = started_call();

    fake.close(Status::unavailable("connection reset"));
    assert_eq!(call.state(), CallState::Terminated);

    // Misbehaving connection layer: events after close are dropped.
    let listener = fake.listener().unwrap();
    listener.on_message(Bytes::from_static(b"late"));
    listener.on_ready();
    listener.on_close(Status::ok(""), MetadataMap::new());
    call.start_recv_message().unwrap_err();

    assert_eq!(
        *events.lock(),
        vec![status(Code::Unavailable, "connection reset")]
    );
}

#[test]
fn test_readiness_follows_connection() {
    let (call, fake, events) = started_call();
    assert!(call.is_ready());

    fake.set_ready(false);
    assert!(!call.is_ready());
    assert!(events.lock().is_empty());

    fake.set_ready(true);
    assert!(call.is_ready());
    assert_eq!(*events.lock(), vec![HandlerEvent::Ready]);

    fake.set_ready(false);
    fake.set_ready(true);
    assert_eq!(
        *events.lock(),
        vec![HandlerEvent::Ready, HandlerEvent::Ready]
    );
}

#[test]
fn test_start_twice_keeps_first_handler() {
    let (call, fake, first) = started_call();

    let (second_handler, second) = RecordingHandler::new();
    let err = call.start(second_handler).unwrap_err();
    assert!(matches!(err, Error::IllegalState(_)));
    assert_eq!(fake.requested(), 1);

    fake.push_message("M1");
    assert_eq!(*first.lock(), vec![msg("M1")]);
    assert!(second.lock().is_empty());
}

#[test]
fn test_operations_before_start_fail() {
    let (call, fake) = new_call();

    assert_eq!(call.state(), CallState::Unstarted);
    assert!(!call.is_ready());
    assert!(matches!(
        call.send_message(&"hello".to_string()),
        Err(Error::IllegalState(_))
    ));
    assert!(matches!(
        call.start_recv_message(),
        Err(Error::IllegalState(_))
    ));
    assert!(matches!(
        call.send_error("nope"),
        Err(Error::IllegalState(_))
    ));
    assert!(fake.sent().is_empty());
    assert_eq!(fake.requested(), 0);
    assert!(fake.cancellation().is_none());
}

#[test]
fn test_send_message_encodes() {
    let (call, fake, _events) = started_call();

    call.send_message(&"request-1".to_string()).unwrap();
    call.send_message(&"request-2".to_string()).unwrap();

    assert_eq!(
        fake.sent(),
        vec![
            Bytes::from_static(b"request-1"),
            Bytes::from_static(b"request-2")
        ]
    );
}

#[test]
fn test_send_error_cancels() {
    let (call, fake, events) = started_call();

    call.send_error("watch removed").unwrap();

    assert_eq!(
        fake.cancellation(),
        Some(Cancellation {
            reason: CANCEL_REASON.to_string(),
            cause: Some("watch removed".to_string()),
        })
    );
    assert_eq!(*events.lock(), vec![status(Code::Cancelled, CANCEL_REASON)]);
    assert_eq!(call.state(), CallState::Terminated);
    assert!(!call.is_ready());
    assert!(matches!(
        call.send_message(&"hello".to_string()),
        Err(Error::IllegalState(_))
    ));
    assert!(matches!(
        call.send_error("again"),
        Err(Error::IllegalState(_))
    ));
}

#[test]
fn test_clean_close_waits_for_held_messages() {
    let (call, fake, events) = started_call();

    fake.push_message("M1");
    fake.push_message("M2");
    fake.push_message("M3");
    fake.close(Status::ok(""));

    assert_eq!(*events.lock(), vec![msg("M1")]);
    assert_eq!(call.state(), CallState::Terminated);
    assert!(matches!(
        call.send_message(&"hello".to_string()),
        Err(Error::IllegalState(_))
    ));

    call.start_recv_message().unwrap();
    assert_eq!(*events.lock(), vec![msg("M1"), msg("M2")]);

    call.start_recv_message().unwrap();
    assert_eq!(
        *events.lock(),
        vec![msg("M1"), msg("M2"), msg("M3"), status(Code::Ok, "")]
    );
    assert!(matches!(
        call.start_recv_message(),
        Err(Error::IllegalState(_))
    ));
}

#[test]
fn test_failed_close_waits_for_held_messages() {
    let (call, fake, events) = started_call();

    fake.push_message("M1");
    fake.push_message("M2");
    fake.close(Status::internal("stream reset"));
    assert_eq!(*events.lock(), vec![msg("M1")]);

    call.start_recv_message().unwrap();
    assert_eq!(
        *events.lock(),
        vec![msg("M1"), msg("M2"), status(Code::Internal, "stream reset")]
    );
}

#[test]
fn test_send_error_drops_held_messages() {
    let (call, fake, events) = started_call();

    fake.push_message("M1");
    fake.push_message("M2");
    fake.push_message("M3");
    call.send_error("watch removed").unwrap();

    assert_eq!(
        *events.lock(),
        vec![msg("M1"), status(Code::Cancelled, CANCEL_REASON)]
    );
}

#[test]
fn test_call_started_after_shutdown_is_unavailable() {
    let channel = FakeChannel::new();
    let transport = Transport::new("ctrl-plane:443", channel.clone(), CallOptions::default());
    let call = transport
        .create_streaming_call("Discover", utf8(), utf8())
        .unwrap();
    let fake = channel.last_call().unwrap();

    transport.shutdown();

    let (handler, events) = RecordingHandler::new();
    call.start(handler).unwrap();
    fake.push_message("M1");

    assert_eq!(
        *events.lock(),
        vec![status(Code::Unavailable, "channel has been shut down")]
    );
    assert_eq!(call.state(), CallState::Terminated);
    assert!(matches!(
        call.send_message(&"hello".to_string()),
        Err(Error::IllegalState(_))
    ));
}

#[test]
fn test_headers_are_not_exposed() {
    let (_call, fake, events) = started_call();

    let mut headers = MetadataMap::new();
    headers.insert("x-server", "ctrl-plane".parse().unwrap());
    fake.push_headers(headers);

    assert!(events.lock().is_empty());
}

#[test]
fn test_decode_failure_terminates_with_internal() {
    let (call, fake, events) = started_call();

    fake.listener()
        .unwrap()
        .on_message(Bytes::from_static(&[0xff, 0xfe]));

    let events = events.lock().clone();
    assert_eq!(events.len(), 1);
    match &events[0] {
        HandlerEvent::Status(code, message) => {
            assert_eq!(*code, Code::Internal);
            assert!(message.starts_with("failed to decode response"));
        }
        other => panic!("expected status, got {other:?}"),
    }
    assert!(fake.cancellation().is_some());
    assert_eq!(call.state(), CallState::Terminated);
}

#[test]
fn test_encode_failure_cancels() {
    let (call, fake, events) = started_call();

    call.send_message(&"unencodable".to_string()).unwrap();

    assert!(fake.sent().is_empty());
    let cancellation = fake.cancellation().unwrap();
    assert!(cancellation.reason.starts_with("failed to encode request"));
    assert!(cancellation.reason.ends_with("refusing to encode"));
    assert!(cancellation.cause.is_some());
    assert!(matches!(
        events.lock().as_slice(),
        [HandlerEvent::Status(Code::Cancelled, _)]
    ));
    assert_eq!(call.state(), CallState::Terminated);
}

/// Panics on the message `boom` and records everything else.
struct PanickingHandler {
    received: Arc<Mutex<Vec<String>>>,
}

impl EventHandler<String> for PanickingHandler {
    fn on_recv_message(&self, message: String) {
        if message == "boom" {
            panic!("handler failed");
        }
        self.received.lock().push(message);
    }

    fn on_status_received(&self, status: Status) {
        self.received.lock().push(format!("status:{:?}", status.code()));
    }

    fn on_ready(&self) {}
}

#[test]
fn test_handler_panic_does_not_stall_later_events() {
    let (call, fake) = new_call();
    let received = Arc::new(Mutex::new(Vec::new()));
    call.start(PanickingHandler {
        received: received.clone(),
    })
    .unwrap();

    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        fake.push_message("boom");
    }));
    assert!(result.is_err());

    call.start_recv_message().unwrap();
    fake.push_message("M1");
    fake.close(Status::ok(""));

    assert_eq!(*received.lock(), ["M1", "status:Ok"]);
}

/// Pulls the next message from inside the callback.
struct PullingHandler {
    call: Arc<OnceLock<Arc<StreamingCall<String, String>>>>,
    received: Arc<Mutex<Vec<String>>>,
}

impl EventHandler<String> for PullingHandler {
    fn on_recv_message(&self, message: String) {
        self.received.lock().push(message);
        if let Some(call) = self.call.get() {
            call.start_recv_message().unwrap();
        }
    }

    fn on_status_received(&self, status: Status) {
        self.received.lock().push(format!("status:{:?}", status.code()));
    }

    fn on_ready(&self) {}
}

#[test]
fn test_handler_can_pull_from_callback() {
    let (call, fake) = new_call();
    let call = Arc::new(call);
    let slot = Arc::new(OnceLock::new());
    slot.set(call.clone()).unwrap();
    let received = Arc::new(Mutex::new(Vec::new()));

    call.start(PullingHandler {
        call: slot,
        received: received.clone(),
    })
    .unwrap();

    fake.push_message("M1");
    fake.push_message("M2");
    fake.push_message("M3");
    fake.close(Status::ok(""));

    assert_eq!(*received.lock(), ["M1", "M2", "M3", "status:Ok"]);
    assert_eq!(fake.requested(), 4);
}

#[test]
fn test_concurrent_delivery_keeps_order() {
    let (call, fake, events) = started_call();

    let pusher = {
        let fake = fake.clone();
        std::thread::spawn(move || {
            for i in 0..100 {
                fake.push_message(format!("{i}"));
            }
        })
    };
    for _ in 0..99 {
        call.start_recv_message().unwrap();
    }
    pusher.join().unwrap();

    let expected: Vec<_> = (0..100).map(|i| msg(&i.to_string())).collect();
    assert_eq!(*events.lock(), expected);
}

#[test]
fn test_discover_scenario() {
    let channel = FakeChannel::new();
    let transport = Transport::new("ctrl-plane:443", channel.clone(), CallOptions::default());
    let call = transport
        .create_streaming_call("Discover", utf8(), utf8())
        .unwrap();
    let fake = channel.last_call().unwrap();

    let (handler, events) = RecordingHandler::new();
    call.start(handler).unwrap();

    fake.push_message("M1");
    fake.push_message("M2");
    assert_eq!(*events.lock(), vec![msg("M1")]);

    call.start_recv_message().unwrap();
    assert_eq!(*events.lock(), vec![msg("M1"), msg("M2")]);

    fake.close(Status::ok(""));
    assert_eq!(
        *events.lock(),
        vec![msg("M1"), msg("M2"), status(Code::Ok, "")]
    );
    assert_eq!(call.state(), CallState::Terminated);
    assert!(matches!(
        call.send_message(&"after".to_string()),
        Err(Error::IllegalState(_))
    ));
}
