//! ---
//! acp_section: "02-messaging-transport"
//! acp_subsection: "module"
//! acp_type: "source"
//! acp_scope: "code"
//! acp_description: "UDP datagram transport."
//! acp_version: "v0.1.0"
//! acp_owner: "tbd"
//! ---
//! Datagram transport over one IPv4 UDP socket.
//!
//! The remote address is resolved at configure time. When `localPort` is set
//! the socket is bound eagerly so a receiver owns its port before
//! [`Transport::connect`] is called.
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4, ToSocketAddrs, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

use acp_logging::{acp_debug, log_lifecycle_event, LifecycleOutcome, LogContext};
use bson::Document;
use bytes::Bytes;
use tracing::{debug, trace};

use crate::config::StreamerConfig;
use crate::lifecycle::{ConnectionState, Transport};
use crate::listener::{Listener, Received, UnitSource, Waker};
use crate::sniff::{encode_document, try_decode_document};
use crate::{CommsError, Result};

/// Read timeout installed while a listener runs on a socket configured without one.
pub const LISTENER_HEARTBEAT: Duration = Duration::from_millis(250);

const TRANSPORT_NAME: &str = "streamer";
const CHECKSUM_LEN: usize = 4;

/// One received datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatagramEnvelope {
    /// Datagram payload, truncated to the configured buffer size.
    pub payload: Bytes,
    /// Address the datagram came from.
    pub sender: SocketAddr,
}

impl DatagramEnvelope {
    /// Wrap a payload and its sender.
    pub fn new(payload: impl Into<Bytes>, sender: SocketAddr) -> Self {
        Self {
            payload: payload.into(),
            sender,
        }
    }

    /// Sender IP address.
    pub fn sender_address(&self) -> IpAddr {
        self.sender.ip()
    }

    /// Sender port.
    pub fn sender_port(&self) -> u16 {
        self.sender.port()
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Payload decoded as UTF-8 text.
    pub fn text(&self) -> Result<String> {
        Ok(String::from_utf8(self.payload.to_vec())?)
    }

    /// Payload decoded as a binary document, when it is one.
    pub fn document(&self) -> Option<Document> {
        try_decode_document(&self.payload)
    }
}

/// Return the chunk carried by `datagram` if its CRC-32 trailer matches.
pub fn verify_checksummed(datagram: &[u8]) -> Option<&[u8]> {
    if datagram.len() < CHECKSUM_LEN {
        return None;
    }
    let (chunk, trailer) = datagram.split_at(datagram.len() - CHECKSUM_LEN);
    let expected = u32::from_be_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
    (crc32fast::hash(chunk) == expected).then_some(chunk)
}

/// UDP transport sending to one remote address.
pub struct Streamer {
    config: StreamerConfig,
    remote: Option<SocketAddr>,
    socket: Option<Arc<UdpSocket>>,
    state: ConnectionState,
    listener: Listener<DatagramEnvelope>,
}

impl Streamer {
    /// Create a disconnected streamer with default options.
    pub fn new() -> Self {
        Self {
            config: StreamerConfig::default(),
            remote: None,
            socket: None,
            state: ConnectionState::Disconnected,
            listener: Listener::new(TRANSPORT_NAME),
        }
    }

    /// Create and configure a streamer in one step.
    pub fn with_config(config: StreamerConfig) -> Result<Self> {
        let mut streamer = Self::new();
        streamer.configure(config)?;
        Ok(streamer)
    }

    /// Transmit one datagram to the configured remote address.
    pub fn send_data(&self, data: &[u8]) -> Result<usize> {
        let (socket, remote) = self.sending_socket()?;
        let sent = socket.send_to(data, remote)?;
        trace!(transport = TRANSPORT_NAME, peer = %remote, bytes = sent, "datagram sent");
        Ok(sent)
    }

    /// Transmit UTF-8 text as one datagram.
    pub fn send_text(&self, text: &str) -> Result<usize> {
        self.send_data(text.as_bytes())
    }

    /// Transmit a binary document as one datagram.
    pub fn send_document(&self, document: &Document) -> Result<usize> {
        self.send_data(&encode_document(document)?)
    }

    /// Transmit `chunk` followed by its CRC-32 as four big-endian bytes.
    pub fn send_chunk_with_checksum(&self, chunk: &[u8]) -> Result<usize> {
        let mut datagram = Vec::with_capacity(chunk.len() + CHECKSUM_LEN);
        datagram.extend_from_slice(chunk);
        datagram.extend_from_slice(&crc32fast::hash(chunk).to_be_bytes());
        self.send_data(&datagram)
    }

    /// Block for one datagram, bounded by the configured timeout.
    ///
    /// Fails with [`CommsError::Timeout`] when the timeout elapses and with
    /// [`CommsError::ListenerActive`] while the listener owns the socket.
    pub fn receive_data(&self) -> Result<DatagramEnvelope> {
        self.state.require_connected()?;
        if self.listener.is_running() {
            return Err(CommsError::ListenerActive);
        }
        let socket = self.socket.as_ref().ok_or(CommsError::NotConnected)?;
        let wake = wake_address(socket);
        loop {
            let envelope = receive_envelope(socket, self.config.buffer_size)?;
            // Skip a stop signal left behind by a listener that exited mid-handler.
            if envelope.is_empty() && Some(envelope.sender) == wake {
                continue;
            }
            return Ok(envelope);
        }
    }

    /// Register the callback invoked for every datagram the listener receives.
    pub fn set_packet_handler<F>(&self, handler: F)
    where
        F: Fn(DatagramEnvelope) + Send + Sync + 'static,
    {
        self.listener.set_handler(handler);
    }

    /// Start the background receive loop.
    pub fn start_listener(&mut self) -> Result<()> {
        self.state.require_connected()?;
        if self.listener.is_running() {
            return Err(CommsError::AlreadyListening);
        }
        let socket = Arc::clone(self.socket.as_ref().ok_or(CommsError::NotConnected)?);
        if self.config.timeout.is_none() {
            socket.set_read_timeout(Some(LISTENER_HEARTBEAT))?;
        }
        let source = DatagramSource {
            wake: wake_address(&socket),
            socket,
            buffer_size: self.config.buffer_size,
        };
        self.listener.start(source)
    }

    /// Stop the background receive loop; safe to call when none is running.
    pub fn stop_listener(&mut self) {
        if !self.listener.is_running() {
            return;
        }
        let joined = self.listener.stop();
        // A detached loop keeps the heartbeat so it can still notice the stop.
        if joined {
            if let Some(socket) = &self.socket {
                if let Err(err) = socket.set_read_timeout(self.config.read_timeout()) {
                    debug!(transport = TRANSPORT_NAME, error = %err, "failed to restore read timeout");
                }
            }
        }
    }

    /// Whether the background receive loop is running.
    pub fn is_listening(&self) -> bool {
        self.listener.is_running()
    }

    /// Local address of the socket, once one exists.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        let socket = self.socket.as_ref().ok_or(CommsError::NotConnected)?;
        Ok(socket.local_addr()?)
    }

    /// Resolved remote address, once configured.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote
    }

    /// Listener activity counters.
    pub fn listener_metrics(&self) -> crate::ListenerMetrics {
        self.listener.metrics()
    }

    fn sending_socket(&self) -> Result<(&UdpSocket, SocketAddr)> {
        self.state.require_connected()?;
        let socket = self.socket.as_deref().ok_or(CommsError::NotConnected)?;
        let remote = self.remote.ok_or(CommsError::NotConnected)?;
        Ok((socket, remote))
    }

    fn context_endpoint(&self) -> String {
        self.remote
            .map(|addr| addr.to_string())
            .unwrap_or_else(|| format!("{}:{}", self.config.host, self.config.port))
    }
}

impl Default for Streamer {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for Streamer {
    type Config = StreamerConfig;

    fn configure(&mut self, config: StreamerConfig) -> Result<()> {
        self.state.require_disconnected()?;
        config.validate()?;
        let remote = resolve_ipv4(&config.host, config.port)?;

        let socket = match (&self.socket, config.local_port) {
            (None, Some(port)) => Some(bind_socket(port)?),
            (Some(socket), Some(port)) if port != 0 => {
                let current = socket.local_addr().map(|addr| addr.port()).ok();
                if current == Some(port) {
                    Some(Arc::clone(socket))
                } else {
                    Some(bind_socket(port)?)
                }
            }
            // A socket bound for an explicit local port is released; connect picks an ephemeral one.
            (Some(_), None) if self.config.local_port.is_some() => None,
            (socket, _) => socket.clone(),
        };
        self.config = config;
        self.remote = Some(remote);
        self.socket = socket;
        debug!(transport = TRANSPORT_NAME, remote = %remote, "configured");
        Ok(())
    }

    fn connect(&mut self) -> Result<()> {
        self.state.require_disconnected()?;
        if self.remote.is_none() {
            self.remote = Some(resolve_ipv4(&self.config.host, self.config.port)?);
        }
        if self.socket.is_none() {
            self.socket = Some(bind_socket(self.config.local_port.unwrap_or(0))?);
        }
        if let Some(socket) = &self.socket {
            socket.set_read_timeout(self.config.read_timeout())?;
        }
        self.state = ConnectionState::Connected;

        let endpoint = self.context_endpoint();
        log_lifecycle_event(
            Some(&LogContext::new()
                .with_transport(TRANSPORT_NAME)
                .with_endpoint(&endpoint)),
            "connect",
            "datagram socket ready",
            LifecycleOutcome::Success,
        );
        Ok(())
    }

    fn disconnect(&mut self) {
        if self.state == ConnectionState::Disconnected {
            return;
        }
        self.stop_listener();
        self.socket = None;
        self.state = ConnectionState::Disconnected;

        let endpoint = self.context_endpoint();
        log_lifecycle_event(
            Some(&LogContext::new()
                .with_transport(TRANSPORT_NAME)
                .with_endpoint(&endpoint)),
            "disconnect",
            "datagram socket closed",
            LifecycleOutcome::Success,
        );
    }

    fn state(&self) -> ConnectionState {
        self.state
    }

    fn config(&self) -> StreamerConfig {
        self.config.clone()
    }

    fn name(&self) -> &'static str {
        TRANSPORT_NAME
    }
}

impl Drop for Streamer {
    fn drop(&mut self) {
        self.disconnect();
    }
}

struct DatagramSource {
    socket: Arc<UdpSocket>,
    buffer_size: usize,
    wake: Option<SocketAddr>,
}

impl UnitSource for DatagramSource {
    type Unit = DatagramEnvelope;

    fn receive_unit(&mut self) -> Result<Received<DatagramEnvelope>> {
        match receive_envelope(&self.socket, self.buffer_size) {
            Ok(envelope) if envelope.is_empty() && Some(envelope.sender) == self.wake => {
                Ok(Received::Idle)
            }
            Ok(envelope) => Ok(Received::Unit(envelope)),
            Err(CommsError::Timeout) => Ok(Received::Idle),
            Err(err) => Err(err),
        }
    }

    fn waker(&self) -> Option<Waker> {
        let target = self.wake?;
        let socket = Arc::clone(&self.socket);
        Some(Box::new(move || {
            if let Err(err) = socket.send_to(&[], target) {
                acp_debug!(
                    context = LogContext::new().with_transport(TRANSPORT_NAME),
                    "wake datagram failed: {err}"
                );
            }
        }))
    }
}

fn bind_socket(port: u16) -> Result<Arc<UdpSocket>> {
    let socket = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port))?;
    debug!(
        transport = TRANSPORT_NAME,
        local = %socket.local_addr()?,
        "socket bound"
    );
    Ok(Arc::new(socket))
}

fn receive_envelope(socket: &UdpSocket, buffer_size: usize) -> Result<DatagramEnvelope> {
    let mut buffer = vec![0u8; buffer_size];
    let (len, sender) = socket.recv_from(&mut buffer).map_err(CommsError::from_read)?;
    buffer.truncate(len);
    Ok(DatagramEnvelope::new(buffer, sender))
}

/// Address a datagram must be sent to in order to reach `socket` itself.
fn wake_address(socket: &UdpSocket) -> Option<SocketAddr> {
    let mut addr = socket.local_addr().ok()?;
    if addr.ip().is_unspecified() {
        addr.set_ip(IpAddr::V4(Ipv4Addr::LOCALHOST));
    }
    Some(addr)
}

fn resolve_ipv4(host: &str, port: u16) -> Result<SocketAddr> {
    let unresolved = |reason: String| CommsError::UnresolvedHost {
        host: host.to_owned(),
        reason,
    };
    (host, port)
        .to_socket_addrs()
        .map_err(|err| unresolved(err.to_string()))?
        .find(SocketAddr::is_ipv4)
        .ok_or_else(|| unresolved("no IPv4 address".into()))
}
