//! ---
//! acp_section: "03-logging"
//! acp_subsection: "module"
//! acp_type: "source"
//! acp_scope: "code"
//! acp_description: "Structured logging adapters and sinks."
//! acp_version: "v0.1.0"
//! acp_owner: "tbd"
//! ---
#![warn(missing_docs)]

use std::path::PathBuf;

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::daily;
use tracing_subscriber::{fmt as subscriber_fmt, prelude::*, EnvFilter, Layer, Registry};

pub mod macros;

const LOG_ENV: &str = "ACP_LOG";

static FILE_GUARD: OnceCell<WorkerGuard> = OnceCell::new();
static STDOUT_GUARD: OnceCell<WorkerGuard> = OnceCell::new();

/// Initialize a baseline tracing subscriber suitable for development.
pub fn init() {
    let _ = Registry::default()
        .with(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .with(subscriber_fmt::layer())
        .try_init();
}

/// Output format of the stdout layer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LogFormat {
    /// One JSON object per event.
    StructuredJson,
    /// Human readable single-line events.
    #[default]
    Pretty,
}

/// Logging section of an ACP configuration file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoggingConfig {
    /// Format used on stdout.
    #[serde(default)]
    pub format: LogFormat,
    /// When set, a rolling daily JSON log file is written into this directory.
    #[serde(default)]
    pub directory: Option<PathBuf>,
    /// File name prefix for the rolling log; defaults to the service name.
    #[serde(default)]
    pub file_prefix: Option<String>,
}

/// Initialize the tracing subscriber based on configuration and environment variables.
///
/// `ACP_LOG` overrides the filter directive, then `RUST_LOG` is honoured, and
/// `info` is used when neither is set. Calling this more than once keeps the
/// first subscriber.
pub fn init_tracing(service_name: &str, config: &LoggingConfig) -> std::io::Result<()> {
    let filter = match std::env::var(LOG_ENV) {
        Ok(directive) => EnvFilter::try_new(directive).unwrap_or_else(|err| {
            eprintln!("invalid {LOG_ENV} directive ({err}); defaulting to info logging");
            EnvFilter::new("info")
        }),
        Err(_) => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    let (stdout_writer, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());
    let _ = STDOUT_GUARD.set(stdout_guard);

    let stdout_layer = match config.format {
        LogFormat::StructuredJson => subscriber_fmt::layer()
            .with_target(false)
            .with_timer(subscriber_fmt::time::UtcTime::rfc_3339())
            .json()
            .with_writer(stdout_writer)
            .boxed(),
        LogFormat::Pretty => subscriber_fmt::layer()
            .with_target(true)
            .with_timer(subscriber_fmt::time::UtcTime::rfc_3339())
            .with_writer(stdout_writer)
            .boxed(),
    };

    let file_layer = match &config.directory {
        Some(directory) => {
            std::fs::create_dir_all(directory)?;
            let prefix = config
                .file_prefix
                .clone()
                .unwrap_or_else(|| service_name.to_owned());
            let appender = daily(directory, format!("{prefix}.log"));
            let (file_writer, file_guard) = tracing_appender::non_blocking(appender);
            let _ = FILE_GUARD.set(file_guard);
            Some(
                subscriber_fmt::layer()
                    .with_target(true)
                    .with_timer(subscriber_fmt::time::UtcTime::rfc_3339())
                    .json()
                    .with_writer(file_writer)
                    .boxed(),
            )
        }
        None => None,
    };

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .try_init();

    tracing::info!(
        service = %service_name,
        format = ?config.format,
        log_dir = ?config.directory,
        "tracing initialised"
    );
    Ok(())
}

/// Structured logging context propagated by the convenience macros.
#[derive(Debug, Default, Clone)]
pub struct LogContext<'a> {
    /// Transport name (`messenger`, `streamer`, ...).
    pub transport: Option<&'a str>,
    /// Local or remote endpoint the transport is attached to.
    pub endpoint: Option<&'a str>,
    /// Peer address of the unit being processed.
    pub peer: Option<&'a str>,
}

impl<'a> LogContext<'a> {
    /// Create an empty logging context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a transport name.
    pub fn with_transport(mut self, transport: &'a str) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Attach an endpoint.
    pub fn with_endpoint(mut self, endpoint: &'a str) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    /// Attach a peer address.
    pub fn with_peer(mut self, peer: &'a str) -> Self {
        self.peer = Some(peer);
        self
    }
}

/// Outcome attached to lifecycle log events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleOutcome {
    /// The operation completed successfully.
    Success,
    /// The operation failed or was aborted.
    Fault,
}

impl LifecycleOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            LifecycleOutcome::Success => "success",
            LifecycleOutcome::Fault => "fault",
        }
    }
}

/// Emit a standardized lifecycle event (connect, disconnect, listener start/stop).
pub fn log_lifecycle_event(
    context: Option<&LogContext>,
    event: &str,
    message: &str,
    outcome: LifecycleOutcome,
) {
    let ctx = context.cloned().unwrap_or_default();
    match outcome {
        LifecycleOutcome::Success => tracing::info!(
            event,
            outcome = outcome.as_str(),
            transport = ctx.transport.unwrap_or(""),
            endpoint = ctx.endpoint.unwrap_or(""),
            peer = ctx.peer.unwrap_or(""),
            message = %message
        ),
        LifecycleOutcome::Fault => tracing::error!(
            event,
            outcome = outcome.as_str(),
            transport = ctx.transport.unwrap_or(""),
            endpoint = ctx.endpoint.unwrap_or(""),
            peer = ctx.peer.unwrap_or(""),
            message = %message
        ),
    }
}
