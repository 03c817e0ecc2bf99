//! ---
//! acp_section: "02-messaging-transport"
//! acp_subsection: "module"
//! acp_type: "source"
//! acp_scope: "code"
//! acp_description: "Transport lifecycle, listeners, and message helpers."
//! acp_version: "v0.1.0"
//! acp_owner: "tbd"
//! ---
//! Discrete-message transports for ACP processes.
//!
//! Two interchangeable backends share one lifecycle contract
//! ([`Transport`]: configure, connect, send/receive, disconnect) and one
//! background [`Listener`]:
//!
//! * [`Messenger`] wraps a ZeroMQ socket of a chosen [`SocketPattern`].
//! * [`Streamer`] wraps a UDP socket talking to one remote address.
//!
//! Inbound datagrams can be classified with [`sniff`], and
//! [`DatagramIngestor`] turns length-prefixed documents into records for a
//! [`RecordSink`].
#![warn(missing_docs)]

use std::io;

pub mod config;
pub mod ingest;
pub mod lifecycle;
pub mod listener;
pub mod messenger;
pub mod sniff;
pub mod streamer;
pub mod template;

/// Shared result type for transport operations.
pub type Result<T> = std::result::Result<T, CommsError>;

/// Broad classification of a [`CommsError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Rejected options or unusable configuration.
    Configuration,
    /// Operation not allowed in the transport's current state.
    State,
    /// Backend-level send/receive or encoding failure.
    Transport,
    /// A bounded receive elapsed without data.
    Timeout,
}

/// Errors raised by transports, listeners, and sinks.
#[derive(Debug, thiserror::Error)]
pub enum CommsError {
    /// An option value was rejected.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    /// The remote host could not be resolved to an IPv4 address.
    #[error("unable to resolve host {host}: {reason}")]
    UnresolvedHost {
        /// Host name as configured.
        host: String,
        /// Resolver failure description.
        reason: String,
    },
    /// A configuration file could not be read or parsed.
    #[error("configuration file {path}: {message}")]
    ConfigFile {
        /// Offending file.
        path: String,
        /// Read or parse failure.
        message: String,
    },
    /// `connect` or `configure` called while connected.
    #[error("already connected")]
    AlreadyConnected,
    /// Data-plane operation attempted while disconnected.
    #[error("not connected")]
    NotConnected,
    /// A listener is already running on this transport.
    #[error("listener already running")]
    AlreadyListening,
    /// Direct receive attempted while the listener owns the socket.
    #[error("direct receive rejected while a listener is active")]
    ListenerActive,
    /// `send_message_template` called before `set_template`.
    #[error("message template not set")]
    TemplateNotSet,
    /// A bounded receive elapsed without data.
    #[error("receive timed out")]
    Timeout,
    /// A bounded send could not be queued before its timeout.
    #[error("send could not be queued before the send timeout elapsed")]
    Backpressure,
    /// ZeroMQ failure.
    #[error("zmq error: {0}")]
    Zmq(#[from] zmq::Error),
    /// Socket or file IO failure.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    /// JSON serialization or deserialization failure.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    /// Binary document encoding failure.
    #[error("document encoding error: {0}")]
    DocumentEncode(#[from] bson::ser::Error),
    /// Received bytes were not UTF-8 text.
    #[error("invalid utf-8 text: {0}")]
    InvalidText(#[from] std::string::FromUtf8Error),
    /// A record sink refused a record.
    #[error("record sink error: {0}")]
    Sink(String),
}

impl CommsError {
    /// Classify the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CommsError::InvalidConfiguration(_)
            | CommsError::UnresolvedHost { .. }
            | CommsError::ConfigFile { .. } => ErrorKind::Configuration,
            CommsError::AlreadyConnected
            | CommsError::NotConnected
            | CommsError::AlreadyListening
            | CommsError::ListenerActive
            | CommsError::TemplateNotSet => ErrorKind::State,
            CommsError::Timeout => ErrorKind::Timeout,
            CommsError::Backpressure
            | CommsError::Zmq(_)
            | CommsError::Io(_)
            | CommsError::Json(_)
            | CommsError::DocumentEncode(_)
            | CommsError::InvalidText(_)
            | CommsError::Sink(_) => ErrorKind::Transport,
        }
    }

    /// Map a socket read error, folding would-block/timed-out into [`CommsError::Timeout`].
    pub(crate) fn from_read(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => CommsError::Timeout,
            _ => CommsError::Io(err),
        }
    }
}

pub use config::{CommsFile, MessengerConfig, SocketPattern, StreamerConfig};
pub use ingest::{
    run_ingestion, DatagramIngestor, IngestConfig, IngestMetrics, IngestSession, JsonLinesSink,
    MemorySink, Record, RecordSink,
};
pub use lifecycle::{ConnectionState, Transport};
pub use listener::{
    Handler, Listener, ListenerMetrics, Received, UnitSource, Waker, LISTENER_STOP_DEADLINE,
};
pub use messenger::{Messenger, LISTENER_POLL_INTERVAL};
pub use sniff::{sniff, try_decode_document, Sniffed};
pub use streamer::{verify_checksummed, DatagramEnvelope, Streamer, LISTENER_HEARTBEAT};
pub use template::{Fields, MessageTemplate};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kinds_follow_taxonomy() {
        assert_eq!(
            CommsError::InvalidConfiguration("socketType".into()).kind(),
            ErrorKind::Configuration
        );
        assert_eq!(CommsError::AlreadyConnected.kind(), ErrorKind::State);
        assert_eq!(CommsError::TemplateNotSet.kind(), ErrorKind::State);
        assert_eq!(CommsError::Timeout.kind(), ErrorKind::Timeout);
        assert_eq!(CommsError::Backpressure.kind(), ErrorKind::Transport);
    }

    #[test]
    fn read_errors_fold_timeouts() {
        let timed_out = io::Error::new(io::ErrorKind::WouldBlock, "no data");
        assert!(matches!(CommsError::from_read(timed_out), CommsError::Timeout));
        let reset = io::Error::new(io::ErrorKind::ConnectionReset, "reset");
        assert!(matches!(CommsError::from_read(reset), CommsError::Io(_)));
    }

    #[test]
    fn error_display_is_stable() {
        assert_eq!(format!("{}", CommsError::TemplateNotSet), "message template not set");
        assert_eq!(format!("{}", CommsError::NotConnected), "not connected");
    }
}
