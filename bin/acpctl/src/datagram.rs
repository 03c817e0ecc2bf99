//! ---
//! acp_section: "05-cli"
//! acp_subsection: "binary"
//! acp_type: "source"
//! acp_scope: "code"
//! acp_description: "Datagram subcommands for acpctl."
//! acp_version: "v0.1.0"
//! acp_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use acp_comms::{
    run_ingestion, CommsFile, DatagramEnvelope, JsonLinesSink, Streamer, Transport,
};
use anyhow::{Context, Result};
use bson::Bson;
use clap::Args;

use crate::millis;

#[derive(Debug, Args)]
pub struct SendArgs {
    /// Remote host.
    #[arg(long)]
    pub host: Option<String>,
    /// Remote port.
    #[arg(long)]
    pub port: Option<u16>,
    /// Text payload.
    pub text: String,
    /// Number of datagrams to send.
    #[arg(long, default_value_t = 1)]
    pub count: u64,
    /// Pause between datagrams in milliseconds.
    #[arg(long, default_value_t = 100)]
    pub interval_ms: u64,
    /// Append a CRC-32 trailer to every datagram.
    #[arg(long)]
    pub checksum: bool,
}

#[derive(Debug, Args)]
pub struct ListenArgs {
    /// Local port to bind.
    #[arg(long)]
    pub local_port: Option<u16>,
    /// Receive buffer size in bytes.
    #[arg(long)]
    pub buffer_size: Option<usize>,
    /// How long to listen, in seconds.
    #[arg(long, default_value_t = 10)]
    pub duration_secs: u64,
}

#[derive(Debug, Args)]
pub struct IngestArgs {
    /// Local port to bind.
    #[arg(long)]
    pub local_port: Option<u16>,
    /// Sensor identifier stored on each record.
    #[arg(long)]
    pub sensor_id: Option<String>,
    /// JSON-lines file receiving the records.
    #[arg(long, value_name = "FILE", default_value = "records.jsonl")]
    pub output: PathBuf,
    /// How long to ingest, in seconds.
    #[arg(long, default_value_t = 60)]
    pub duration_secs: u64,
}

pub fn send(file: &CommsFile, args: SendArgs) -> Result<()> {
    let mut config = file.streamer.clone();
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    let mut streamer = Streamer::with_config(config).context("configuring sender")?;
    streamer.connect()?;

    for sequence in 0..args.count {
        if sequence > 0 {
            thread::sleep(millis(args.interval_ms));
        }
        let sent = if args.checksum {
            streamer.send_chunk_with_checksum(args.text.as_bytes())?
        } else {
            streamer.send_text(&args.text)?
        };
        tracing::info!(sequence, bytes = sent, "datagram sent");
    }
    streamer.disconnect();
    Ok(())
}

pub fn listen(file: &CommsFile, args: ListenArgs) -> Result<()> {
    let mut config = file.streamer.clone();
    if let Some(port) = args.local_port {
        config.local_port = Some(port);
    }
    if let Some(size) = args.buffer_size {
        config.buffer_size = size;
    }
    let mut streamer = Streamer::with_config(config).context("configuring listener")?;
    streamer.connect()?;
    println!("listening on {}", streamer.local_addr()?);

    streamer.set_packet_handler(|envelope| println!("{}", describe(&envelope)));
    streamer.start_listener()?;
    thread::sleep(Duration::from_secs(args.duration_secs));
    streamer.disconnect();
    Ok(())
}

pub fn ingest(file: &CommsFile, args: IngestArgs) -> Result<()> {
    let mut config = file.ingest.clone();
    if let Some(port) = args.local_port {
        config.local_port = port;
    }
    if let Some(sensor_id) = args.sensor_id {
        config.sensor_id = sensor_id;
    }
    let sink = JsonLinesSink::open(&args.output)
        .with_context(|| format!("opening {}", args.output.display()))?;
    let session = run_ingestion(config, Arc::new(sink)).context("starting ingestion")?;
    println!("ingesting on {}", session.local_addr()?);

    thread::sleep(Duration::from_secs(args.duration_secs));
    let metrics = session.stop();
    println!("{}", serde_json::to_string_pretty(&metrics)?);
    Ok(())
}

fn describe(envelope: &DatagramEnvelope) -> String {
    match envelope.document() {
        Some(document) => format!(
            "{} document {}",
            envelope.sender,
            Bson::Document(document).into_relaxed_extjson()
        ),
        None => format!(
            "{} {} bytes: {}",
            envelope.sender,
            envelope.len(),
            String::from_utf8_lossy(&envelope.payload)
        ),
    }
}
