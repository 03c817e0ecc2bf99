//! ---
//! acp_section: "02-messaging-transport"
//! acp_subsection: "tests"
//! acp_type: "source"
//! acp_scope: "code"
//! acp_description: "Datagram transport integration tests."
//! acp_version: "v0.1.0"
//! acp_owner: "tbd"
//! ---
use std::sync::mpsc;
use std::time::{Duration, Instant};

use acp_comms::{
    verify_checksummed, CommsError, DatagramEnvelope, Streamer, StreamerConfig, Transport,
};
use bson::doc;
use serde_json::json;

fn receiver(config: StreamerConfig) -> Streamer {
    let mut streamer = Streamer::with_config(config).expect("configure receiver");
    streamer.connect().expect("connect receiver");
    streamer
}

fn sender_to(port: u16) -> Streamer {
    let mut streamer =
        Streamer::with_config(StreamerConfig::remote("localhost", port)).expect("configure sender");
    streamer.connect().expect("connect sender");
    streamer
}

fn collect_envelopes(streamer: &mut Streamer) -> mpsc::Receiver<DatagramEnvelope> {
    let (seen_tx, seen) = mpsc::channel();
    let seen_tx = parking_lot::Mutex::new(seen_tx);
    streamer.set_packet_handler(move |envelope| {
        let _ = seen_tx.lock().send(envelope);
    });
    streamer.start_listener().expect("listen");
    seen
}

#[test]
fn ping_reaches_listener_with_sender_port() {
    let mut rx = receiver(StreamerConfig::bound(0));
    let port = rx.local_addr().expect("local addr").port();
    let seen = collect_envelopes(&mut rx);

    let tx = sender_to(port);
    tx.send_text("ping").expect("send");

    let envelope = seen.recv_timeout(Duration::from_secs(2)).expect("envelope");
    assert_eq!(envelope.text().expect("utf-8"), "ping");
    assert_eq!(envelope.sender_port(), tx.local_addr().expect("sender addr").port());
    assert!(envelope.sender_address().is_loopback());
    rx.disconnect();
}

#[test]
fn direct_receive_returns_sender_metadata() {
    let rx = receiver(StreamerConfig::bound(0).with_timeout(Duration::from_secs(2)));
    let port = rx.local_addr().unwrap().port();
    let tx = sender_to(port);

    tx.send_data(&[0xde, 0xad, 0xbe, 0xef]).expect("send");
    let envelope = rx.receive_data().expect("receive");
    assert_eq!(&envelope.payload[..], &[0xde, 0xad, 0xbe, 0xef]);
    assert_eq!(envelope.sender_port(), tx.local_addr().unwrap().port());
    assert!(envelope.document().is_none());
}

#[test]
fn documents_and_chunks_share_one_channel() {
    let rx = receiver(StreamerConfig::bound(0).with_timeout(Duration::from_secs(2)));
    let tx = sender_to(rx.local_addr().unwrap().port());

    tx.send_document(&doc! { "sensor_id": "TEMP_001", "chunk_count": 2 })
        .expect("send document");
    tx.send_chunk_with_checksum(b"chunk-1").expect("send chunk");

    let first = rx.receive_data().expect("document datagram");
    let document = first.document().expect("parsed document");
    assert_eq!(document.get_i32("chunk_count").unwrap(), 2);

    let second = rx.receive_data().expect("chunk datagram");
    assert!(second.document().is_none());
    assert_eq!(verify_checksummed(&second.payload), Some(&b"chunk-1"[..]));
}

#[test]
fn connect_twice_and_idempotent_disconnect() {
    let mut streamer = receiver(StreamerConfig::bound(0));
    assert!(matches!(streamer.connect(), Err(CommsError::AlreadyConnected)));
    assert!(matches!(streamer.connect(), Err(CommsError::AlreadyConnected)));
    streamer.disconnect();
    streamer.disconnect();
    assert!(!streamer.is_connected());
    assert!(matches!(streamer.send_text("late"), Err(CommsError::NotConnected)));
}

#[test]
fn listener_restarts_after_bounded_stop() {
    let mut rx = receiver(StreamerConfig::bound(0));
    let port = rx.local_addr().unwrap().port();
    let seen = collect_envelopes(&mut rx);
    assert!(matches!(rx.start_listener(), Err(CommsError::AlreadyListening)));

    let started = Instant::now();
    rx.stop_listener();
    assert!(started.elapsed() < Duration::from_secs(1));

    rx.start_listener().expect("restart");
    let tx = sender_to(port);
    tx.send_text("after-restart").expect("send");
    let envelope = seen.recv_timeout(Duration::from_secs(2)).expect("envelope");
    assert_eq!(envelope.text().unwrap(), "after-restart");
}

#[test]
fn apply_options_reconfigures_while_disconnected() {
    let mut streamer = Streamer::new();
    let options = json!({"host": "127.0.0.1", "port": 7001, "bufferSize": 512});
    let serde_json::Value::Object(options) = options else {
        unreachable!()
    };
    streamer.apply_options(&options).expect("apply");
    let config = streamer.config();
    assert_eq!(config.port, 7001);
    assert_eq!(config.buffer_size, 512);
    assert_eq!(streamer.remote_addr().unwrap().to_string(), "127.0.0.1:7001");
}
