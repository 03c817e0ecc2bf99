//! ---
//! acp_section: "02-messaging-transport"
//! acp_subsection: "module"
//! acp_type: "source"
//! acp_scope: "code"
//! acp_description: "Typed transport options and configuration file loading."
//! acp_version: "v0.1.0"
//! acp_owner: "tbd"
//! ---
//! Per-backend configuration records.
//!
//! Field names serialize as the camelCase option names used on the wire and
//! in configuration files (`socketType`, `bufferSize`, `localPort`, ...).
//! Missing keys fall back to the documented defaults and unknown keys are
//! ignored.
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use acp_logging::LoggingConfig;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::ingest::IngestConfig;
use crate::template::Fields;
use crate::{CommsError, Result};

const DEFAULT_ENDPOINT: &str = "tcp://localhost:5555";
const DEFAULT_HOST: &str = "localhost";
const DEFAULT_REMOTE_PORT: u16 = 9999;
const DEFAULT_BUFFER_SIZE: usize = 8192;
const MAX_DATAGRAM_SIZE: usize = 65_535;

/// Message-exchange discipline of a message-queue socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum SocketPattern {
    /// One-way broadcast sender.
    Publish,
    /// One-way broadcast receiver with topic filtering.
    #[default]
    Subscribe,
    /// Client side of request/response.
    Request,
    /// Server side of request/response.
    Reply,
    /// Upstream end of a work-distribution pipeline.
    Push,
    /// Downstream end of a work-distribution pipeline.
    Pull,
}

impl SocketPattern {
    /// All patterns, in wire-name order.
    pub const ALL: [SocketPattern; 6] = [
        SocketPattern::Publish,
        SocketPattern::Subscribe,
        SocketPattern::Request,
        SocketPattern::Reply,
        SocketPattern::Push,
        SocketPattern::Pull,
    ];

    /// Wire name used in options (`PUB`, `SUB`, ...).
    pub fn as_str(&self) -> &'static str {
        match self {
            SocketPattern::Publish => "PUB",
            SocketPattern::Subscribe => "SUB",
            SocketPattern::Request => "REQ",
            SocketPattern::Reply => "REP",
            SocketPattern::Push => "PUSH",
            SocketPattern::Pull => "PULL",
        }
    }

    /// Backend socket type for this pattern.
    pub fn socket_type(&self) -> zmq::SocketType {
        match self {
            SocketPattern::Publish => zmq::PUB,
            SocketPattern::Subscribe => zmq::SUB,
            SocketPattern::Request => zmq::REQ,
            SocketPattern::Reply => zmq::REP,
            SocketPattern::Push => zmq::PUSH,
            SocketPattern::Pull => zmq::PULL,
        }
    }

    /// Whether sockets of this pattern can receive.
    pub fn can_receive(&self) -> bool {
        !matches!(self, SocketPattern::Publish | SocketPattern::Push)
    }

    /// Whether sockets of this pattern can send.
    pub fn can_send(&self) -> bool {
        !matches!(self, SocketPattern::Subscribe | SocketPattern::Pull)
    }
}

impl fmt::Display for SocketPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SocketPattern {
    type Err = CommsError;

    fn from_str(s: &str) -> Result<Self> {
        SocketPattern::ALL
            .into_iter()
            .find(|pattern| pattern.as_str() == s)
            .ok_or_else(|| CommsError::InvalidConfiguration(format!("invalid socket type: {s}")))
    }
}

impl TryFrom<String> for SocketPattern {
    type Error = CommsError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<SocketPattern> for String {
    fn from(pattern: SocketPattern) -> Self {
        pattern.as_str().to_owned()
    }
}

/// Options for the message-queue transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessengerConfig {
    /// Address to bind or connect (`tcp://host:port`, `ipc://path`, ...).
    #[serde(default = "MessengerConfig::default_endpoint")]
    pub endpoint: String,
    /// Socket pattern, fixed for the transport's lifetime once connected.
    #[serde(default)]
    pub socket_type: SocketPattern,
    /// `true` binds the endpoint, `false` connects out to it.
    #[serde(default)]
    pub bind: bool,
    /// Subscription prefix filter; only used by [`SocketPattern::Subscribe`].
    #[serde(default)]
    pub topic: String,
    /// Upper bound in milliseconds for direct receives; `None` blocks.
    #[serde(default)]
    pub receive_timeout: Option<u64>,
    /// Upper bound in milliseconds for queuing a send; `None` blocks.
    #[serde(default)]
    pub send_timeout: Option<u64>,
    /// Milliseconds unsent messages are kept after disconnect.
    #[serde(default)]
    pub linger: u64,
}

impl MessengerConfig {
    fn default_endpoint() -> String {
        DEFAULT_ENDPOINT.to_owned()
    }

    /// Shorthand for a configuration with the given pattern and endpoint.
    pub fn new(socket_type: SocketPattern, endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            socket_type,
            ..Self::default()
        }
    }

    /// Builder-style toggle for bind mode.
    pub fn binding(mut self) -> Self {
        self.bind = true;
        self
    }

    /// Builder-style topic filter.
    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = topic.into();
        self
    }

    /// Builder-style receive timeout.
    pub fn with_receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout = Some(whole_millis(timeout));
        self
    }

    /// Builder-style send timeout.
    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = Some(whole_millis(timeout));
        self
    }

    /// Reject values the backend cannot honour.
    pub fn validate(&self) -> Result<()> {
        if !self.endpoint.contains("://") {
            return Err(CommsError::InvalidConfiguration(format!(
                "endpoint must look like transport://address, got {:?}",
                self.endpoint
            )));
        }
        for (name, value) in [
            ("receiveTimeout", self.receive_timeout),
            ("sendTimeout", self.send_timeout),
        ] {
            if value == Some(0) {
                return Err(CommsError::InvalidConfiguration(format!(
                    "{name} must be positive when set"
                )));
            }
        }
        for (name, value) in [
            ("receiveTimeout", self.receive_timeout),
            ("sendTimeout", self.send_timeout),
            ("linger", Some(self.linger)),
        ] {
            if let Some(ms) = value {
                to_socket_millis(ms).map_err(|_| {
                    CommsError::InvalidConfiguration(format!("{name} out of range: {ms}"))
                })?;
            }
        }
        Ok(())
    }
}

impl Default for MessengerConfig {
    fn default() -> Self {
        Self {
            endpoint: Self::default_endpoint(),
            socket_type: SocketPattern::default(),
            bind: false,
            topic: String::new(),
            receive_timeout: None,
            send_timeout: None,
            linger: 0,
        }
    }
}

/// Options for the datagram transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamerConfig {
    /// Remote host for outgoing datagrams.
    #[serde(default = "StreamerConfig::default_host")]
    pub host: String,
    /// Remote port for outgoing datagrams.
    #[serde(default = "StreamerConfig::default_port")]
    pub port: u16,
    /// Receive buffer size; longer datagrams are truncated.
    #[serde(default = "StreamerConfig::default_buffer_size")]
    pub buffer_size: usize,
    /// Local port to bind; `None` picks an ephemeral port.
    #[serde(default)]
    pub local_port: Option<u16>,
    /// Read timeout in milliseconds applied on connect.
    #[serde(default)]
    pub timeout: Option<u64>,
}

impl StreamerConfig {
    fn default_host() -> String {
        DEFAULT_HOST.to_owned()
    }

    const fn default_port() -> u16 {
        DEFAULT_REMOTE_PORT
    }

    const fn default_buffer_size() -> usize {
        DEFAULT_BUFFER_SIZE
    }

    /// Shorthand for a sender towards `host:port`.
    pub fn remote(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    /// Shorthand for a receiver bound to `local_port`.
    pub fn bound(local_port: u16) -> Self {
        Self {
            local_port: Some(local_port),
            ..Self::default()
        }
    }

    /// Builder-style read timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(whole_millis(timeout));
        self
    }

    /// Read timeout as a duration.
    pub fn read_timeout(&self) -> Option<Duration> {
        self.timeout.map(Duration::from_millis)
    }

    /// Reject values the backend cannot honour.
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(CommsError::InvalidConfiguration("host must not be empty".into()));
        }
        if self.buffer_size == 0 || self.buffer_size > MAX_DATAGRAM_SIZE {
            return Err(CommsError::InvalidConfiguration(format!(
                "bufferSize must be within 1..={MAX_DATAGRAM_SIZE}, got {}",
                self.buffer_size
            )));
        }
        if self.timeout == Some(0) {
            return Err(CommsError::InvalidConfiguration(
                "timeout must be positive when set".into(),
            ));
        }
        Ok(())
    }
}

impl Default for StreamerConfig {
    fn default() -> Self {
        Self {
            host: Self::default_host(),
            port: Self::default_port(),
            buffer_size: Self::default_buffer_size(),
            local_port: None,
            timeout: None,
        }
    }
}

/// Duration in milliseconds, rounded up so sub-millisecond timeouts stay positive.
fn whole_millis(timeout: Duration) -> u64 {
    let nanos = timeout.as_nanos();
    let millis = nanos / 1_000_000 + u128::from(nanos % 1_000_000 != 0);
    u64::try_from(millis).unwrap_or(u64::MAX)
}

/// Convert a millisecond option into the signed value the socket layer expects.
pub(crate) fn to_socket_millis(ms: u64) -> std::result::Result<i32, std::num::TryFromIntError> {
    i32::try_from(ms)
}

/// Overlay `options` onto `current` key by key and decode the result.
///
/// Keys absent from `options` keep their current value; a `null` resets an
/// optional field.
pub(crate) fn merge_options<C>(current: &C, options: &Fields) -> Result<C>
where
    C: Serialize + DeserializeOwned,
{
    let mut merged = match serde_json::to_value(current)? {
        Value::Object(map) => map,
        _ => Fields::new(),
    };
    for (key, value) in options {
        merged.insert(key.clone(), value.clone());
    }
    serde_json::from_value(Value::Object(merged))
        .map_err(|err| CommsError::InvalidConfiguration(err.to_string()))
}

/// Configuration file consumed by `acpctl`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommsFile {
    /// Message-queue transport options.
    #[serde(default)]
    pub messenger: MessengerConfig,
    /// Datagram transport options.
    #[serde(default)]
    pub streamer: StreamerConfig,
    /// Sensor ingestion job options.
    #[serde(default)]
    pub ingest: IngestConfig,
    /// Logging options.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// A [`CommsFile`] together with the path it was read from.
#[derive(Debug, Clone)]
pub struct LoadedCommsFile {
    /// Parsed configuration.
    pub config: CommsFile,
    /// Source path, `None` when defaults were used.
    pub source: Option<PathBuf>,
}

impl CommsFile {
    /// Environment variable naming a configuration file that wins over candidates.
    pub const ENV_CONFIG_PATH: &'static str = "ACP_CONFIG";

    /// Load the first existing candidate, honouring `ACP_CONFIG`; defaults when none exist.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedCommsFile> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedCommsFile {
                    config,
                    source: Some(path),
                });
            }
        }

        for candidate in candidates {
            let path = candidate.as_ref();
            if path.exists() {
                let config = Self::from_path(path)?;
                return Ok(LoadedCommsFile {
                    config,
                    source: Some(path.to_path_buf()),
                });
            }
        }

        debug!("no configuration file found; using defaults");
        Ok(LoadedCommsFile {
            config: Self::default(),
            source: None,
        })
    }

    /// Parse a TOML configuration file and validate every section.
    pub fn from_path(path: &Path) -> Result<Self> {
        let file_error = |message: String| CommsError::ConfigFile {
            path: path.display().to_string(),
            message,
        };
        let raw = std::fs::read_to_string(path).map_err(|err| file_error(err.to_string()))?;
        let config: CommsFile = toml::from_str(&raw).map_err(|err| file_error(err.to_string()))?;
        config.messenger.validate()?;
        config.streamer.validate()?;
        config.ingest.validate()?;
        debug!(path = %path.display(), "configuration loaded");
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(value: Value) -> Fields {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    #[test]
    fn messenger_defaults_match_documented_values() {
        let config: MessengerConfig = serde_json::from_value(json!({})).expect("defaults");
        assert_eq!(config.endpoint, "tcp://localhost:5555");
        assert_eq!(config.socket_type, SocketPattern::Subscribe);
        assert!(!config.bind);
        assert_eq!(config.topic, "");
        assert_eq!(config, MessengerConfig::default());
    }

    #[test]
    fn streamer_defaults_match_documented_values() {
        let config: StreamerConfig = serde_json::from_value(json!({})).expect("defaults");
        assert_eq!(config.host, "localhost");
        assert_eq!(config.port, 9999);
        assert_eq!(config.buffer_size, 8192);
        assert_eq!(config.local_port, None);
        assert_eq!(config.timeout, None);
    }

    #[test]
    fn socket_pattern_parses_wire_names() {
        for pattern in SocketPattern::ALL {
            assert_eq!(pattern.as_str().parse::<SocketPattern>().unwrap(), pattern);
        }
        let err = "DEALER".parse::<SocketPattern>().unwrap_err();
        assert!(matches!(err, CommsError::InvalidConfiguration(_)));
    }

    #[test]
    fn merge_options_overrides_and_ignores_unknown_keys() {
        let current = MessengerConfig::default();
        let merged: MessengerConfig = merge_options(
            &current,
            &fields(json!({"socketType": "PUB", "bind": true, "colour": "blue"})),
        )
        .expect("merge");
        assert_eq!(merged.socket_type, SocketPattern::Publish);
        assert!(merged.bind);
        assert_eq!(merged.endpoint, current.endpoint);
    }

    #[test]
    fn merge_options_rejects_unknown_socket_type() {
        let err = merge_options(
            &MessengerConfig::default(),
            &fields(json!({"socketType": "ROUTER"})),
        )
        .unwrap_err();
        assert!(matches!(err, CommsError::InvalidConfiguration(ref msg) if msg.contains("ROUTER")));
    }

    #[test]
    fn merge_options_null_resets_optional_fields() {
        let current = StreamerConfig::bound(5005);
        let merged: StreamerConfig =
            merge_options(&current, &fields(json!({"localPort": null}))).expect("merge");
        assert_eq!(merged.local_port, None);
    }

    #[test]
    fn validation_rejects_unusable_values() {
        let mut streamer = StreamerConfig::default();
        streamer.buffer_size = 0;
        assert!(streamer.validate().is_err());
        streamer.buffer_size = 1024;
        streamer.timeout = Some(0);
        assert!(streamer.validate().is_err());

        let messenger = MessengerConfig::new(SocketPattern::Publish, "localhost:5555");
        assert!(messenger.validate().is_err());
        let messenger = MessengerConfig::default().with_receive_timeout(Duration::from_secs(1));
        assert!(messenger.validate().is_ok());
    }

    #[test]
    fn zero_and_sub_millisecond_timeouts() {
        let messenger = MessengerConfig {
            receive_timeout: Some(0),
            ..MessengerConfig::default()
        };
        assert!(matches!(
            messenger.validate(),
            Err(CommsError::InvalidConfiguration(ref msg)) if msg.contains("receiveTimeout")
        ));
        let messenger = MessengerConfig {
            send_timeout: Some(0),
            ..MessengerConfig::default()
        };
        assert!(messenger.validate().is_err());

        let short = Duration::from_micros(300);
        let messenger = MessengerConfig::default()
            .with_receive_timeout(short)
            .with_send_timeout(short);
        assert_eq!(messenger.receive_timeout, Some(1));
        assert_eq!(messenger.send_timeout, Some(1));
        assert!(messenger.validate().is_ok());
        assert_eq!(StreamerConfig::default().with_timeout(short).timeout, Some(1));
        assert_eq!(
            StreamerConfig::default().with_timeout(Duration::from_millis(250)).timeout,
            Some(250)
        );
    }

    #[test]
    fn comms_file_loads_from_toml() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("acp.toml");
        std::fs::write(
            &path,
            r#"
[messenger]
endpoint = "tcp://127.0.0.1:6000"
socketType = "PUB"
bind = true

[streamer]
localPort = 5005
bufferSize = 16384

[ingest]
sensorId = "udp-01"
"#,
        )
        .expect("write config");

        let loaded = CommsFile::load(&[path.clone()]).expect("load");
        assert_eq!(loaded.source.as_deref(), Some(path.as_path()));
        assert_eq!(loaded.config.messenger.socket_type, SocketPattern::Publish);
        assert!(loaded.config.messenger.bind);
        assert_eq!(loaded.config.streamer.local_port, Some(5005));
        assert_eq!(loaded.config.streamer.buffer_size, 16384);
        assert_eq!(loaded.config.streamer.port, 9999);
        assert_eq!(loaded.config.ingest.sensor_id, "udp-01");
    }

    #[test]
    fn comms_file_reports_invalid_socket_type() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[messenger]\nsocketType = \"XPUB\"\n").expect("write");
        let err = CommsFile::from_path(&path).unwrap_err();
        assert!(matches!(err, CommsError::ConfigFile { .. }));
    }

    #[test]
    fn missing_candidates_fall_back_to_defaults() {
        if std::env::var(CommsFile::ENV_CONFIG_PATH).is_ok() {
            return;
        }
        let dir = tempfile::tempdir().expect("tempdir");
        let loaded = CommsFile::load(&[dir.path().join("absent.toml")]).expect("load");
        assert!(loaded.source.is_none());
        assert_eq!(loaded.config, CommsFile::default());
    }
}
