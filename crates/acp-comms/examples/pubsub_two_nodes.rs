//! ---
//! acp_section: "02-messaging-transport"
//! acp_subsection: "example"
//! acp_type: "source"
//! acp_scope: "code"
//! acp_description: "Publisher and subscriber exchanging templated sensor readings."
//! acp_version: "v0.1.0"
//! acp_owner: "tbd"
//! ---
use std::sync::mpsc;
use std::time::Duration;

use acp_comms::{Fields, MessageTemplate, Messenger, MessengerConfig, SocketPattern, Transport};
use serde_json::json;

fn main() -> anyhow::Result<()> {
    acp_logging::init();

    // Node A publishes sensor readings on an ephemeral port.
    let mut publisher = Messenger::with_config(
        MessengerConfig::new(SocketPattern::Publish, "tcp://127.0.0.1:*").binding(),
    )?;
    publisher.connect()?;
    publisher.set_template(
        MessageTemplate::sensor_reading()
            .with("sensor_id", "TEMP_001")
            .with("sensor_type", "temperature"),
    );

    // Node B subscribes to everything node A publishes.
    let endpoint = publisher.last_endpoint()?;
    let mut subscriber =
        Messenger::with_config(MessengerConfig::new(SocketPattern::Subscribe, endpoint))?;
    subscriber.connect()?;
    let (tx, rx) = mpsc::channel();
    let tx = parking_lot::Mutex::new(tx);
    subscriber.set_message_handler(move |message| {
        let _ = tx.lock().send(message);
    });
    subscriber.start_listener()?;

    let mut received = 0;
    for count in 0..50u32 {
        let mut overrides = Fields::new();
        overrides.insert("data".into(), json!({ "value": 20.0 + f64::from(count) / 10.0 }));
        overrides.insert("count".into(), json!(count));
        publisher.send_message_template(&overrides)?;
        while let Ok(message) = rx.recv_timeout(Duration::from_millis(20)) {
            println!("Node B received {}", String::from_utf8_lossy(&message));
            received += 1;
        }
        if received >= 5 {
            break;
        }
    }

    subscriber.disconnect();
    publisher.disconnect();
    Ok(())
}
