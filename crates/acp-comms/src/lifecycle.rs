//! ---
//! acp_section: "02-messaging-transport"
//! acp_subsection: "module"
//! acp_type: "source"
//! acp_scope: "code"
//! acp_description: "Shared connection lifecycle contract."
//! acp_version: "v0.1.0"
//! acp_owner: "tbd"
//! ---
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::config::merge_options;
use crate::template::Fields;
use crate::{CommsError, Result};

/// Connection state shared by every backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No backend resources are held.
    #[default]
    Disconnected,
    /// The backend socket is open and data-plane operations are allowed.
    Connected,
}

impl ConnectionState {
    /// Fail with [`CommsError::NotConnected`] unless connected.
    pub fn require_connected(self) -> Result<()> {
        match self {
            ConnectionState::Connected => Ok(()),
            ConnectionState::Disconnected => Err(CommsError::NotConnected),
        }
    }

    /// Fail with [`CommsError::AlreadyConnected`] unless disconnected.
    pub fn require_disconnected(self) -> Result<()> {
        match self {
            ConnectionState::Disconnected => Ok(()),
            ConnectionState::Connected => Err(CommsError::AlreadyConnected),
        }
    }
}

/// Lifecycle contract implemented by all transport backends.
///
/// `configure` → `connect` → send/receive or listen → `disconnect`.
pub trait Transport {
    /// Typed option record for this backend.
    type Config: Clone + Serialize + DeserializeOwned;

    /// Validate and store a complete option record. Fails while connected.
    fn configure(&mut self, config: Self::Config) -> Result<()>;

    /// Acquire backend resources. Fails with [`CommsError::AlreadyConnected`] when connected.
    fn connect(&mut self) -> Result<()>;

    /// Stop any listener and release backend resources. No-op when disconnected.
    fn disconnect(&mut self);

    /// Current connection state.
    fn state(&self) -> ConnectionState;

    /// Snapshot of the stored options.
    fn config(&self) -> Self::Config;

    /// Short backend name used in logs.
    fn name(&self) -> &'static str;

    /// Whether the transport is connected.
    fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Merge a dynamic option map over the stored options, then [`configure`](Self::configure).
    ///
    /// Keys use the camelCase option names; unknown keys are ignored.
    fn apply_options(&mut self, options: &Fields) -> Result<()> {
        let merged = merge_options(&self.config(), options)?;
        self.configure(merged)
    }
}
