//! ---
//! acp_section: "02-messaging-transport"
//! acp_subsection: "tests"
//! acp_type: "source"
//! acp_scope: "code"
//! acp_description: "Message-queue transport integration tests."
//! acp_version: "v0.1.0"
//! acp_owner: "tbd"
//! ---
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use acp_comms::{
    CommsError, ErrorKind, Fields, MessageTemplate, Messenger, MessengerConfig, SocketPattern,
    Transport, LISTENER_STOP_DEADLINE,
};
use bson::doc;
use serde_json::{json, Value};

fn connected(config: MessengerConfig) -> Messenger {
    let mut messenger = Messenger::with_config(config).expect("configure");
    messenger.connect().expect("connect");
    messenger
}

fn bound(pattern: SocketPattern) -> Messenger {
    connected(MessengerConfig::new(pattern, "tcp://127.0.0.1:*").binding())
}

fn peer_of(server: &Messenger, pattern: SocketPattern) -> Messenger {
    let endpoint = server.last_endpoint().expect("endpoint");
    connected(MessengerConfig::new(pattern, endpoint).with_receive_timeout(Duration::from_secs(5)))
}

fn fields(value: Value) -> Fields {
    match value {
        Value::Object(map) => map,
        other => panic!("expected object, got {other}"),
    }
}

/// Publish `text` until the subscriber handler reports it or five seconds pass.
fn publish_until_seen(publisher: &Messenger, text: &str, seen: &mpsc::Receiver<Vec<u8>>) -> Vec<u8> {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        publisher.send_text(text).expect("publish");
        if let Ok(message) = seen.recv_timeout(Duration::from_millis(50)) {
            return message;
        }
    }
    panic!("subscriber never received {text:?}");
}

#[test]
fn publish_subscribe_end_to_end() {
    let publisher = bound(SocketPattern::Publish);
    let endpoint = publisher.last_endpoint().expect("endpoint");
    let mut subscriber = connected(MessengerConfig::new(SocketPattern::Subscribe, endpoint));

    let (seen_tx, seen) = mpsc::channel();
    let seen_tx = parking_lot::Mutex::new(seen_tx);
    subscriber.set_message_handler(move |message| {
        let _ = seen_tx.lock().send(message);
    });
    subscriber.start_listener().expect("listen");

    let message = publish_until_seen(&publisher, "status:hello", &seen);
    assert_eq!(message, b"status:hello");
    subscriber.disconnect();
    assert!(!subscriber.is_listening());
}

#[test]
fn topic_filter_drops_other_prefixes() {
    let publisher = bound(SocketPattern::Publish);
    let endpoint = publisher.last_endpoint().expect("endpoint");
    let mut subscriber = connected(
        MessengerConfig::new(SocketPattern::Subscribe, endpoint).with_topic("alarm:"),
    );
    let (seen_tx, seen) = mpsc::channel();
    let seen_tx = parking_lot::Mutex::new(seen_tx);
    subscriber.set_message_handler(move |message| {
        let _ = seen_tx.lock().send(message);
    });
    subscriber.start_listener().expect("listen");

    let deadline = Instant::now() + Duration::from_secs(5);
    let mut first = None;
    while first.is_none() && Instant::now() < deadline {
        publisher.send_text("status:ignored").expect("publish");
        publisher.send_text("alarm:high").expect("publish");
        first = seen.recv_timeout(Duration::from_millis(50)).ok();
    }
    assert_eq!(first.as_deref(), Some(&b"alarm:high"[..]));
    subscriber.stop_listener();
    while let Ok(message) = seen.try_recv() {
        assert!(message.starts_with(b"alarm:"));
    }
}

#[test]
fn connect_twice_fails_with_state_error() {
    let mut publisher = bound(SocketPattern::Publish);
    for _ in 0..2 {
        let err = publisher.connect().unwrap_err();
        assert!(matches!(err, CommsError::AlreadyConnected));
        assert_eq!(err.kind(), ErrorKind::State);
    }
    publisher.disconnect();
    assert!(!publisher.is_connected());
}

#[test]
fn disconnect_is_idempotent() {
    let mut messenger = bound(SocketPattern::Push);
    messenger.disconnect();
    messenger.disconnect();
    assert!(!messenger.is_connected());

    let mut never_connected = Messenger::new();
    never_connected.disconnect();
    assert!(!never_connected.is_connected());
}

#[test]
fn connect_then_disconnect_for_every_pattern() {
    for pattern in SocketPattern::ALL {
        let mut messenger = bound(pattern);
        assert!(messenger.is_connected());
        messenger.disconnect();
        assert!(!messenger.is_connected(), "{pattern} stayed connected");
    }
}

#[test]
fn template_send_merges_overrides() {
    let puller = connected(
        MessengerConfig::new(SocketPattern::Pull, "tcp://127.0.0.1:*")
            .binding()
            .with_receive_timeout(Duration::from_secs(5)),
    );
    let mut pusher = peer_of(&puller, SocketPattern::Push);

    let template = MessageTemplate::try_from(json!({"sensor_id": "T1", "data": {}})).unwrap();
    pusher.set_template(template);
    pusher
        .send_message_template(&fields(json!({"data": {"value": 21.5}, "count": 3})))
        .expect("send");

    let text = puller.receive_text().expect("receive");
    let merged: Value = serde_json::from_str(&text).expect("json");
    assert_eq!(merged, json!({"sensor_id": "T1", "data": {"value": 21.5}, "count": 3}));
    assert_eq!(
        pusher.template().unwrap().fields()["data"],
        json!({}),
        "template must not be modified by a send"
    );
}

#[test]
fn request_reply_round_trip() {
    let mut server = connected(
        MessengerConfig::new(SocketPattern::Reply, "tcp://127.0.0.1:*")
            .binding()
            .with_receive_timeout(Duration::from_secs(5)),
    );
    let client = peer_of(&server, SocketPattern::Request);

    let worker = thread::spawn(move || {
        let request = server.receive_message().expect("request");
        let mut reply = b"echo:".to_vec();
        reply.extend_from_slice(&request);
        server.send_message(&reply).expect("reply");
        server.disconnect();
    });

    let reply = client.request(b"ping").expect("reply");
    assert_eq!(reply, b"echo:ping");
    worker.join().expect("worker");
}

#[test]
fn documents_travel_as_binary() {
    let puller = connected(
        MessengerConfig::new(SocketPattern::Pull, "tcp://127.0.0.1:*")
            .binding()
            .with_receive_timeout(Duration::from_secs(5)),
    );
    let pusher = peer_of(&puller, SocketPattern::Push);

    pusher
        .send_document(&doc! { "sensor_id": "TEMP_001", "value": 19.25 })
        .expect("send document");
    pusher.send_text("plain").expect("send text");

    let document = puller.receive_document().expect("receive").expect("document");
    assert_eq!(document.get_str("sensor_id").unwrap(), "TEMP_001");
    assert_eq!(puller.receive_document().expect("receive"), None);
}

#[test]
fn listener_start_twice_and_restart() {
    let mut puller = bound(SocketPattern::Pull);
    puller.start_listener().expect("first start");
    assert!(matches!(puller.start_listener(), Err(CommsError::AlreadyListening)));
    assert!(matches!(puller.receive_message(), Err(CommsError::ListenerActive)));

    let started = Instant::now();
    puller.stop_listener();
    assert!(started.elapsed() < LISTENER_STOP_DEADLINE);
    assert!(!puller.is_listening());

    puller.start_listener().expect("restart");
    puller.stop_listener();
}

#[test]
fn sends_proceed_while_listener_runs() {
    let mut pair = bound(SocketPattern::Pull);
    let pusher = peer_of(&pair, SocketPattern::Push);
    let (seen_tx, seen) = mpsc::channel();
    let seen_tx = parking_lot::Mutex::new(seen_tx);
    pair.set_message_handler(move |message| {
        let _ = seen_tx.lock().send(message);
    });
    pair.start_listener().expect("listen");

    for n in 0..5u8 {
        pusher.send_message(&[n]).expect("push");
    }
    let received: Vec<Vec<u8>> = (0..5)
        .map(|_| seen.recv_timeout(Duration::from_secs(5)).expect("message"))
        .collect();
    assert_eq!(received, (0..5u8).map(|n| vec![n]).collect::<Vec<_>>());
    assert_eq!(pair.listener_metrics().units, 5);
}

#[test]
fn blocked_push_reports_backpressure() {
    // A bound PUSH socket without peers has nowhere to queue the message.
    let pusher = connected(
        MessengerConfig::new(SocketPattern::Push, "tcp://127.0.0.1:*")
            .binding()
            .with_send_timeout(Duration::from_millis(100)),
    );
    let err = pusher.send_text("stranded").unwrap_err();
    assert!(matches!(err, CommsError::Backpressure));
}
