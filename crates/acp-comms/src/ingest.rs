//! ---
//! acp_section: "02-messaging-transport"
//! acp_subsection: "module"
//! acp_type: "source"
//! acp_scope: "code"
//! acp_description: "Datagram sensor ingestion into record sinks."
//! acp_version: "v0.1.0"
//! acp_owner: "tbd"
//! ---
//! Sensor ingestion: datagrams carrying binary documents become [`Record`]s.
//!
//! Each datagram is sniffed; documents are stored with their sender
//! metadata as tags, everything else is counted and skipped.
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use acp_logging::{acp_debug, acp_info, acp_warn, LogContext};
use bson::Bson;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::config::StreamerConfig;
use crate::lifecycle::Transport;
use crate::sniff::{sniff, Sniffed};
use crate::streamer::{DatagramEnvelope, Streamer};
use crate::template::Fields;
use crate::{CommsError, Result};

/// Source label stored on every ingested record.
pub const RECORD_SOURCE: &str = "UDPSensor";

/// One stored sensor record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    /// Producer label, [`RECORD_SOURCE`] for datagram ingestion.
    pub source: String,
    /// Configured sensor identifier.
    pub sensor_id: String,
    /// Transport metadata (`source`, `remoteHost`, `remotePort`, `packetSize`).
    pub tags: Fields,
    /// Decoded payload.
    pub payload: Value,
    /// Time the datagram was processed.
    pub received_at: DateTime<Utc>,
}

/// Destination for ingested records.
pub trait RecordSink: Send + Sync {
    /// Store one record.
    fn insert(&self, record: Record) -> Result<()>;
}

/// In-memory sink, optionally bounded.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<Record>>,
    limit: Option<usize>,
}

impl MemorySink {
    /// Unbounded sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sink that refuses records once `limit` are held.
    pub fn bounded(limit: usize) -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            limit: Some(limit),
        }
    }

    /// Copy of the stored records in arrival order.
    pub fn records(&self) -> Vec<Record> {
        self.records.lock().clone()
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Whether no record has been stored.
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

impl RecordSink for MemorySink {
    fn insert(&self, record: Record) -> Result<()> {
        let mut records = self.records.lock();
        if let Some(limit) = self.limit {
            if records.len() >= limit {
                return Err(CommsError::Sink(format!("memory sink full ({limit} records)")));
            }
        }
        records.push(record);
        Ok(())
    }
}

/// Appends one JSON object per line to a file.
#[derive(Debug)]
pub struct JsonLinesSink {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl JsonLinesSink {
    /// Open `path` for appending, creating it and its parent directory if needed.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    /// File the sink writes to.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RecordSink for JsonLinesSink {
    fn insert(&self, record: Record) -> Result<()> {
        let line = serde_json::to_string(&record)?;
        let mut writer = self.writer.lock();
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }
}

/// Options for a datagram ingestion job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestConfig {
    /// Identifier stored on every record.
    #[serde(default = "IngestConfig::default_sensor_id")]
    pub sensor_id: String,
    /// Human-readable job name.
    #[serde(default = "IngestConfig::default_name")]
    pub name: String,
    /// Local UDP port to listen on.
    #[serde(default = "IngestConfig::default_local_port")]
    pub local_port: u16,
    /// Receive buffer size.
    #[serde(default = "IngestConfig::default_buffer_size")]
    pub buffer_size: usize,
    /// Read timeout in milliseconds.
    #[serde(default = "IngestConfig::default_timeout")]
    pub timeout: u64,
}

impl IngestConfig {
    fn default_sensor_id() -> String {
        "udp-sensor".to_owned()
    }

    fn default_name() -> String {
        "UDP Sensor".to_owned()
    }

    const fn default_local_port() -> u16 {
        9999
    }

    const fn default_buffer_size() -> usize {
        8192
    }

    const fn default_timeout() -> u64 {
        5000
    }

    /// Reject values the job cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.sensor_id.trim().is_empty() {
            return Err(CommsError::InvalidConfiguration("sensorId must not be empty".into()));
        }
        self.streamer_config().validate()
    }

    /// Datagram transport options for this job.
    pub fn streamer_config(&self) -> StreamerConfig {
        StreamerConfig {
            buffer_size: self.buffer_size,
            local_port: Some(self.local_port),
            timeout: Some(self.timeout),
            ..StreamerConfig::default()
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            sensor_id: Self::default_sensor_id(),
            name: Self::default_name(),
            local_port: Self::default_local_port(),
            buffer_size: Self::default_buffer_size(),
            timeout: Self::default_timeout(),
        }
    }
}

/// Snapshot of ingestion counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IngestMetrics {
    /// Datagrams handed to the ingestor.
    pub received: u64,
    /// Records accepted by the sink.
    pub stored: u64,
    /// Datagrams that were not documents.
    pub ignored: u64,
    /// Records the sink refused.
    pub failed: u64,
}

#[derive(Default)]
struct Counters {
    received: AtomicU64,
    stored: AtomicU64,
    ignored: AtomicU64,
    failed: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> IngestMetrics {
        IngestMetrics {
            received: self.received.load(Ordering::Relaxed),
            stored: self.stored.load(Ordering::Relaxed),
            ignored: self.ignored.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Turns datagram envelopes into records for a sink.
#[derive(Clone)]
pub struct DatagramIngestor {
    sensor_id: Arc<str>,
    sink: Arc<dyn RecordSink>,
    counters: Arc<Counters>,
}

impl DatagramIngestor {
    /// Ingestor storing records tagged with `sensor_id` into `sink`.
    pub fn new(sensor_id: impl Into<String>, sink: Arc<dyn RecordSink>) -> Self {
        Self {
            sensor_id: Arc::from(sensor_id.into()),
            sink,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Build the record for `envelope`, or `None` when it carries no document.
    pub fn record_for(&self, envelope: &DatagramEnvelope) -> Option<Record> {
        let document = match sniff(&envelope.payload, envelope.len()) {
            Sniffed::Document { document, .. } => document,
            Sniffed::Opaque => return None,
        };
        Some(Record {
            source: RECORD_SOURCE.to_owned(),
            sensor_id: self.sensor_id.to_string(),
            tags: sender_tags(envelope.sender, envelope.len()),
            payload: json!({ "metadata": Bson::Document(document).into_relaxed_extjson() }),
            received_at: Utc::now(),
        })
    }

    /// Classify and store one datagram. Sink failures are counted, never raised.
    pub fn ingest(&self, envelope: DatagramEnvelope) {
        self.counters.received.fetch_add(1, Ordering::Relaxed);
        let peer = envelope.sender.to_string();
        let ctx = LogContext::new().with_transport("ingest").with_peer(&peer);

        let Some(record) = self.record_for(&envelope) else {
            self.counters.ignored.fetch_add(1, Ordering::Relaxed);
            acp_debug!(context = ctx, "{} byte datagram is not a document", envelope.len());
            return;
        };
        match self.sink.insert(record) {
            Ok(()) => {
                self.counters.stored.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                acp_warn!(context = ctx, "record rejected by sink: {err}");
            }
        }
    }

    /// Counters accumulated so far.
    pub fn metrics(&self) -> IngestMetrics {
        self.counters.snapshot()
    }
}

fn sender_tags(sender: SocketAddr, packet_size: usize) -> Fields {
    let mut tags = Fields::new();
    tags.insert("source".into(), json!("UDP"));
    tags.insert("remoteHost".into(), json!(sender.ip().to_string()));
    tags.insert("remotePort".into(), json!(sender.port()));
    tags.insert("packetSize".into(), json!(packet_size));
    tags
}

/// A running ingestion job.
pub struct IngestSession {
    streamer: Streamer,
    ingestor: DatagramIngestor,
}

impl IngestSession {
    /// Address the job is listening on.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.streamer.local_addr()
    }

    /// Counters accumulated so far.
    pub fn metrics(&self) -> IngestMetrics {
        self.ingestor.metrics()
    }

    /// Stop listening, release the socket, and return the final counters.
    pub fn stop(mut self) -> IngestMetrics {
        self.streamer.disconnect();
        let metrics = self.ingestor.metrics();
        acp_info!(
            context = LogContext::new().with_transport("ingest"),
            "ingestion stopped: {} received, {} stored, {} ignored, {} failed",
            metrics.received,
            metrics.stored,
            metrics.ignored,
            metrics.failed
        );
        metrics
    }
}

/// Bind the configured port and store every document datagram into `sink`.
pub fn run_ingestion(config: IngestConfig, sink: Arc<dyn RecordSink>) -> Result<IngestSession> {
    config.validate()?;
    let mut streamer = Streamer::with_config(config.streamer_config())?;
    streamer.connect()?;

    let ingestor = DatagramIngestor::new(config.sensor_id.clone(), sink);
    let handler = ingestor.clone();
    streamer.set_packet_handler(move |envelope| handler.ingest(envelope));
    streamer.start_listener()?;

    let local = streamer.local_addr()?.to_string();
    acp_info!(
        context = LogContext::new().with_transport("ingest").with_endpoint(&local),
        "ingestion '{}' started for sensor {}",
        config.name,
        config.sensor_id
    );
    Ok(IngestSession { streamer, ingestor })
}
