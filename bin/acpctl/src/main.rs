//! ---
//! acp_section: "05-cli"
//! acp_subsection: "binary"
//! acp_type: "source"
//! acp_scope: "code"
//! acp_description: "Control CLI driving ACP transports from the shell."
//! acp_version: "v0.1.0"
//! acp_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::time::Duration;

use acp_comms::config::LoadedCommsFile;
use acp_comms::CommsFile;
use acp_logging as logging;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

mod datagram;
mod inspect;
mod queue;

#[derive(Debug, Parser)]
#[command(author, version, about = "ACP transport control utility", long_about = None)]
struct Cli {
    /// Configuration file; command-line flags override its values.
    #[arg(long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Publish text or templated messages on a PUB socket.
    Publish(queue::PublishArgs),
    /// Print messages received on a SUB socket.
    Subscribe(queue::SubscribeArgs),
    /// Send one request on a REQ socket and print the reply.
    Request(queue::RequestArgs),
    /// Echo requests back on a REP socket.
    Reply(queue::ReplyArgs),
    /// Send datagrams to a remote host.
    Send(datagram::SendArgs),
    /// Print datagrams received on a local port.
    Listen(datagram::ListenArgs),
    /// Store document datagrams into a JSON-lines file.
    Ingest(datagram::IngestArgs),
    /// Classify a file as a binary document or opaque bytes.
    Sniff(inspect::SniffArgs),
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let loaded = load_config(cli.config.as_ref())?;
    if logging::init_tracing("acpctl", &loaded.config.logging).is_err() {
        logging::init();
    }
    if let Some(path) = &loaded.source {
        tracing::debug!(path = %path.display(), "using configuration file");
    }

    let file = loaded.config;
    match cli.command {
        Commands::Publish(args) => queue::publish(&file, args)?,
        Commands::Subscribe(args) => queue::subscribe(&file, args)?,
        Commands::Request(args) => queue::request(&file, args)?,
        Commands::Reply(args) => queue::reply(&file, args)?,
        Commands::Send(args) => datagram::send(&file, args)?,
        Commands::Listen(args) => datagram::listen(&file, args)?,
        Commands::Ingest(args) => datagram::ingest(&file, args)?,
        Commands::Sniff(args) => inspect::sniff_file(args)?,
    }
    Ok(())
}

fn load_config(explicit: Option<&PathBuf>) -> Result<LoadedCommsFile> {
    if let Some(path) = explicit {
        let config = CommsFile::from_path(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?;
        return Ok(LoadedCommsFile {
            config,
            source: Some(path.clone()),
        });
    }
    let candidates = [PathBuf::from("acp.toml"), PathBuf::from("configs/acp.toml")];
    CommsFile::load(&candidates).context("loading configuration")
}

/// Parse a millisecond flag into a duration.
pub(crate) fn millis(ms: u64) -> Duration {
    Duration::from_millis(ms)
}
