//! ---
//! acp_section: "02-messaging-transport"
//! acp_subsection: "module"
//! acp_type: "source"
//! acp_scope: "code"
//! acp_description: "ZeroMQ message-queue transport."
//! acp_version: "v0.1.0"
//! acp_owner: "tbd"
//! ---
//! Message-queue transport over a single ZeroMQ socket.
//!
//! The socket lives behind a mutex shared with the listener thread. The
//! listener holds the lock for one poll slice at a time, so sends issued
//! while it runs wait at most [`LISTENER_POLL_INTERVAL`].
use std::sync::Arc;
use std::time::Duration;

use acp_logging::{log_lifecycle_event, LifecycleOutcome, LogContext};
use bson::Document;
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, trace};

use crate::config::{to_socket_millis, MessengerConfig, SocketPattern};
use crate::lifecycle::{ConnectionState, Transport};
use crate::listener::{Listener, ListenerMetrics, Received, UnitSource};
use crate::sniff::{encode_document, try_decode_document};
use crate::template::{Fields, MessageTemplate};
use crate::{CommsError, Result};

/// Poll slice used by the listener between checks of its running flag.
pub const LISTENER_POLL_INTERVAL: Duration = Duration::from_millis(50);

const TRANSPORT_NAME: &str = "messenger";

type SharedSocket = Arc<Mutex<zmq::Socket>>;

/// ZeroMQ transport bound to one endpoint and one [`SocketPattern`].
pub struct Messenger {
    config: MessengerConfig,
    context: zmq::Context,
    socket: Option<SharedSocket>,
    state: ConnectionState,
    template: Option<MessageTemplate>,
    listener: Listener<Vec<u8>>,
}

impl Messenger {
    /// Create a disconnected messenger with default options.
    pub fn new() -> Self {
        Self {
            config: MessengerConfig::default(),
            context: zmq::Context::new(),
            socket: None,
            state: ConnectionState::Disconnected,
            template: None,
            listener: Listener::new(TRANSPORT_NAME),
        }
    }

    /// Create and configure a messenger in one step.
    pub fn with_config(config: MessengerConfig) -> Result<Self> {
        let mut messenger = Self::new();
        messenger.configure(config)?;
        Ok(messenger)
    }

    /// Send one message.
    ///
    /// Fails with [`CommsError::Backpressure`] when `sendTimeout` is set and
    /// the message could not be queued in time.
    pub fn send_message(&self, data: &[u8]) -> Result<()> {
        let socket = self.shared_socket()?;
        socket.lock().send(data, 0).map_err(map_send_error)?;
        trace!(transport = TRANSPORT_NAME, bytes = data.len(), "message sent");
        Ok(())
    }

    /// Send UTF-8 text as one message.
    pub fn send_text(&self, text: &str) -> Result<()> {
        self.send_message(text.as_bytes())
    }

    /// Send a binary document as one message.
    pub fn send_document(&self, document: &Document) -> Result<()> {
        self.send_message(&encode_document(document)?)
    }

    /// Block for one message, bounded by `receiveTimeout` when set.
    pub fn receive_message(&self) -> Result<Vec<u8>> {
        let socket = self.shared_socket()?;
        if self.listener.is_running() {
            return Err(CommsError::ListenerActive);
        }
        let bytes = socket.lock().recv_bytes(0).map_err(map_receive_error)?;
        Ok(bytes)
    }

    /// Receive one message as UTF-8 text.
    pub fn receive_text(&self) -> Result<String> {
        Ok(String::from_utf8(self.receive_message()?)?)
    }

    /// Receive one message and decode it as a binary document when it is one.
    pub fn receive_document(&self) -> Result<Option<Document>> {
        Ok(try_decode_document(&self.receive_message()?))
    }

    /// Send `request` and wait for the reply. Intended for the REQ pattern.
    ///
    /// After a [`CommsError::Timeout`] the socket stays usable; a late reply to
    /// the abandoned request is discarded.
    pub fn request(&self, request: &[u8]) -> Result<Vec<u8>> {
        self.send_message(request)?;
        self.receive_message()
    }

    /// Store a copy of `template` for [`send_message_template`](Self::send_message_template).
    pub fn set_template(&mut self, template: MessageTemplate) {
        self.template = Some(template);
    }

    /// Copy of the stored template.
    pub fn template(&self) -> Option<MessageTemplate> {
        self.template.clone()
    }

    /// Forget the stored template.
    pub fn clear_template(&mut self) {
        self.template = None;
    }

    /// Merge `overrides` onto the stored template and send the result as JSON text.
    pub fn send_message_template(&self, overrides: &Fields) -> Result<()> {
        let template = self.template.as_ref().ok_or(CommsError::TemplateNotSet)?;
        let text = template.render(overrides)?;
        self.send_text(&text)
    }

    /// Register the callback invoked for every message the listener receives.
    pub fn set_message_handler<F>(&self, handler: F)
    where
        F: Fn(Vec<u8>) + Send + Sync + 'static,
    {
        self.listener.set_handler(handler);
    }

    /// Start the background receive loop.
    pub fn start_listener(&mut self) -> Result<()> {
        let socket = Arc::clone(self.shared_socket()?);
        if !self.config.socket_type.can_receive() {
            return Err(CommsError::InvalidConfiguration(format!(
                "{} sockets cannot receive",
                self.config.socket_type
            )));
        }
        self.listener.start(SocketSource { socket })
    }

    /// Stop the background receive loop; safe to call when none is running.
    pub fn stop_listener(&mut self) {
        self.listener.stop();
    }

    /// Whether the background receive loop is running.
    pub fn is_listening(&self) -> bool {
        self.listener.is_running()
    }

    /// Listener activity counters.
    pub fn listener_metrics(&self) -> ListenerMetrics {
        self.listener.metrics()
    }

    /// Concrete endpoint of the last bind or connect, e.g. after binding `tcp://127.0.0.1:*`.
    pub fn last_endpoint(&self) -> Result<String> {
        let socket = self.shared_socket()?;
        let endpoint = match socket.lock().get_last_endpoint()? {
            Ok(text) => text,
            Err(raw) => String::from_utf8_lossy(&raw).into_owned(),
        };
        Ok(endpoint)
    }

    fn shared_socket(&self) -> Result<&SharedSocket> {
        self.state.require_connected()?;
        self.socket.as_ref().ok_or(CommsError::NotConnected)
    }

    fn open_socket(&self) -> Result<zmq::Socket> {
        let config = &self.config;
        let socket = self.context.socket(config.socket_type.socket_type())?;
        socket.set_linger(millis(config.linger)?)?;
        if let Some(ms) = config.receive_timeout {
            socket.set_rcvtimeo(millis(ms)?)?;
        }
        if let Some(ms) = config.send_timeout {
            socket.set_sndtimeo(millis(ms)?)?;
        }
        if config.socket_type == SocketPattern::Request {
            // A timed-out request must not wedge the socket in its awaiting-reply state.
            socket.set_req_relaxed(true)?;
            socket.set_req_correlate(true)?;
        }
        if config.bind {
            socket.bind(&config.endpoint)?;
        } else {
            socket.connect(&config.endpoint)?;
        }
        if config.socket_type == SocketPattern::Subscribe {
            socket.set_subscribe(config.topic.as_bytes())?;
        }
        Ok(socket)
    }

    fn lifecycle(&self, event: &str, message: &str, outcome: LifecycleOutcome) {
        let ctx = LogContext::new()
            .with_transport(TRANSPORT_NAME)
            .with_endpoint(&self.config.endpoint);
        log_lifecycle_event(Some(&ctx), event, message, outcome);
    }
}

impl Default for Messenger {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for Messenger {
    type Config = MessengerConfig;

    fn configure(&mut self, config: MessengerConfig) -> Result<()> {
        self.state.require_disconnected()?;
        config.validate()?;
        debug!(
            transport = TRANSPORT_NAME,
            endpoint = %config.endpoint,
            pattern = %config.socket_type,
            bind = config.bind,
            "configured"
        );
        self.config = config;
        Ok(())
    }

    fn connect(&mut self) -> Result<()> {
        self.state.require_disconnected()?;
        let socket = match self.open_socket() {
            Ok(socket) => socket,
            Err(err) => {
                self.lifecycle("connect", &err.to_string(), LifecycleOutcome::Fault);
                return Err(err);
            }
        };
        self.socket = Some(Arc::new(Mutex::new(socket)));
        self.state = ConnectionState::Connected;

        let mode = if self.config.bind { "bound" } else { "connected" };
        self.lifecycle(
            "connect",
            &format!("{} socket {mode}", self.config.socket_type),
            LifecycleOutcome::Success,
        );
        Ok(())
    }

    fn disconnect(&mut self) {
        if self.state == ConnectionState::Disconnected {
            return;
        }
        self.listener.stop();
        self.socket = None;
        self.state = ConnectionState::Disconnected;
        self.lifecycle("disconnect", "socket closed", LifecycleOutcome::Success);
    }

    fn state(&self) -> ConnectionState {
        self.state
    }

    fn config(&self) -> MessengerConfig {
        self.config.clone()
    }

    fn name(&self) -> &'static str {
        TRANSPORT_NAME
    }
}

impl Drop for Messenger {
    fn drop(&mut self) {
        self.disconnect();
    }
}

struct SocketSource {
    socket: SharedSocket,
}

impl UnitSource for SocketSource {
    type Unit = Vec<u8>;

    fn receive_unit(&mut self) -> Result<Received<Vec<u8>>> {
        let socket = self.socket.lock();
        let ready = socket.poll(zmq::POLLIN, LISTENER_POLL_INTERVAL.as_millis() as i64)?;
        if ready == 0 {
            // Hand the socket to a waiting sender before the next slice.
            MutexGuard::unlock_fair(socket);
            return Ok(Received::Idle);
        }
        match socket.recv_bytes(zmq::DONTWAIT) {
            Ok(bytes) => Ok(Received::Unit(bytes)),
            Err(zmq::Error::EAGAIN) => Ok(Received::Idle),
            Err(err) => Err(err.into()),
        }
    }
}

fn millis(ms: u64) -> Result<i32> {
    to_socket_millis(ms)
        .map_err(|_| CommsError::InvalidConfiguration(format!("timeout out of range: {ms}")))
}

fn map_send_error(err: zmq::Error) -> CommsError {
    match err {
        zmq::Error::EAGAIN => CommsError::Backpressure,
        other => CommsError::Zmq(other),
    }
}

fn map_receive_error(err: zmq::Error) -> CommsError {
    match err {
        zmq::Error::EAGAIN => CommsError::Timeout,
        other => CommsError::Zmq(other),
    }
}
