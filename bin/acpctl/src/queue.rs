//! ---
//! acp_section: "05-cli"
//! acp_subsection: "binary"
//! acp_type: "source"
//! acp_scope: "code"
//! acp_description: "Message-queue subcommands for acpctl."
//! acp_version: "v0.1.0"
//! acp_owner: "tbd"
//! ---
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use acp_comms::{
    CommsError, CommsFile, Fields, MessageTemplate, Messenger, MessengerConfig, SocketPattern,
    Transport,
};
use anyhow::{Context, Result};
use chrono::Utc;
use clap::Args;
use serde_json::{json, Value};

use crate::millis;

/// Endpoint flags shared by the message-queue commands.
#[derive(Debug, Args)]
pub struct EndpointArgs {
    /// Endpoint to bind or connect, e.g. `tcp://127.0.0.1:5555`.
    #[arg(long)]
    pub endpoint: Option<String>,
    /// Bind the endpoint instead of connecting to it.
    #[arg(long)]
    pub bind: bool,
}

impl EndpointArgs {
    fn resolve(&self, file: &CommsFile, pattern: SocketPattern) -> MessengerConfig {
        let mut config = file.messenger.clone();
        config.socket_type = pattern;
        if let Some(endpoint) = &self.endpoint {
            config.endpoint = endpoint.clone();
        }
        if self.bind {
            config.bind = true;
        }
        config
    }
}

#[derive(Debug, Args)]
pub struct PublishArgs {
    #[command(flatten)]
    pub endpoint: EndpointArgs,
    /// Text to publish; omit to publish from a template.
    #[arg(long, conflicts_with = "template")]
    pub text: Option<String>,
    /// JSON object file used as the message template.
    #[arg(long, value_name = "FILE")]
    pub template: Option<PathBuf>,
    /// Number of messages to publish.
    #[arg(long, default_value_t = 1)]
    pub count: u64,
    /// Pause between messages in milliseconds.
    #[arg(long, default_value_t = 1000)]
    pub interval_ms: u64,
}

#[derive(Debug, Args)]
pub struct SubscribeArgs {
    #[command(flatten)]
    pub endpoint: EndpointArgs,
    /// Subscription prefix; empty receives everything.
    #[arg(long)]
    pub topic: Option<String>,
    /// How long to listen, in seconds.
    #[arg(long, default_value_t = 10)]
    pub duration_secs: u64,
}

#[derive(Debug, Args)]
pub struct RequestArgs {
    #[command(flatten)]
    pub endpoint: EndpointArgs,
    /// Request body.
    pub message: String,
    /// Reply timeout in milliseconds.
    #[arg(long, default_value_t = 5000)]
    pub timeout_ms: u64,
}

#[derive(Debug, Args)]
pub struct ReplyArgs {
    #[command(flatten)]
    pub endpoint: EndpointArgs,
    /// Text prepended to each echoed request.
    #[arg(long, default_value = "")]
    pub prefix: String,
    /// Stop after this many requests.
    #[arg(long)]
    pub count: Option<u64>,
}

pub fn publish(file: &CommsFile, args: PublishArgs) -> Result<()> {
    let config = args.endpoint.resolve(file, SocketPattern::Publish);
    let mut messenger = Messenger::with_config(config)?;
    messenger.connect().context("connecting publisher")?;

    let text = match (&args.text, &args.template) {
        (Some(text), _) => Some(text.clone()),
        (None, Some(path)) => {
            messenger.set_template(read_template(path)?);
            None
        }
        (None, None) => {
            messenger.set_template(MessageTemplate::sensor_reading());
            None
        }
    };

    for sequence in 0..args.count {
        if sequence > 0 {
            thread::sleep(millis(args.interval_ms));
        }
        match &text {
            Some(text) => messenger.send_text(text)?,
            None => messenger.send_message_template(&reading_overrides(sequence))?,
        }
        tracing::info!(sequence, "published");
    }
    messenger.disconnect();
    Ok(())
}

pub fn subscribe(file: &CommsFile, args: SubscribeArgs) -> Result<()> {
    let mut config = args.endpoint.resolve(file, SocketPattern::Subscribe);
    if let Some(topic) = args.topic {
        config.topic = topic;
    }
    let mut messenger = Messenger::with_config(config)?;
    messenger.connect().context("connecting subscriber")?;
    messenger.set_message_handler(|message| {
        println!("{}", String::from_utf8_lossy(&message));
    });
    messenger.start_listener()?;
    thread::sleep(Duration::from_secs(args.duration_secs));
    messenger.disconnect();
    Ok(())
}

pub fn request(file: &CommsFile, args: RequestArgs) -> Result<()> {
    let mut config = args.endpoint.resolve(file, SocketPattern::Request);
    config.receive_timeout = Some(args.timeout_ms);
    let mut messenger = Messenger::with_config(config)?;
    messenger.connect().context("connecting requester")?;
    let reply = messenger
        .request(args.message.as_bytes())
        .context("waiting for reply")?;
    println!("{}", String::from_utf8_lossy(&reply));
    messenger.disconnect();
    Ok(())
}

pub fn reply(file: &CommsFile, args: ReplyArgs) -> Result<()> {
    let mut config = args.endpoint.resolve(file, SocketPattern::Reply);
    config.receive_timeout.get_or_insert(1000);
    let mut messenger = Messenger::with_config(config)?;
    messenger.connect().context("binding replier")?;

    let mut served = 0u64;
    while args.count.map_or(true, |limit| served < limit) {
        let request = match messenger.receive_message() {
            Ok(request) => request,
            Err(CommsError::Timeout) => continue,
            Err(err) => return Err(err.into()),
        };
        let mut response = args.prefix.as_bytes().to_vec();
        response.extend_from_slice(&request);
        messenger.send_message(&response)?;
        served += 1;
    }
    tracing::info!(served, "reply loop finished");
    messenger.disconnect();
    Ok(())
}

fn read_template(path: &Path) -> Result<MessageTemplate> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading template {}", path.display()))?;
    let value: Value = serde_json::from_str(&raw).context("parsing template")?;
    MessageTemplate::try_from(value).with_context(|| format!("template {}", path.display()))
}

fn reading_overrides(sequence: u64) -> Fields {
    let mut overrides = Fields::new();
    overrides.insert("timestamp".into(), json!(Utc::now().to_rfc3339()));
    overrides.insert("count".into(), json!(sequence));
    overrides
}
