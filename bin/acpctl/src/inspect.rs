//! ---
//! acp_section: "05-cli"
//! acp_subsection: "binary"
//! acp_type: "source"
//! acp_scope: "code"
//! acp_description: "Offline payload inspection for acpctl."
//! acp_version: "v0.1.0"
//! acp_owner: "tbd"
//! ---
use std::path::PathBuf;

use acp_comms::{sniff, Sniffed};
use anyhow::{Context, Result};
use bson::Bson;
use clap::Args;

#[derive(Debug, Args)]
pub struct SniffArgs {
    /// File holding one captured payload.
    pub file: PathBuf,
}

pub fn sniff_file(args: SniffArgs) -> Result<()> {
    let bytes = std::fs::read(&args.file)
        .with_context(|| format!("reading {}", args.file.display()))?;
    match sniff(&bytes, bytes.len()) {
        Sniffed::Document { length, document } => {
            println!("document ({length} bytes)");
            let json = Bson::Document(document).into_relaxed_extjson();
            println!("{}", serde_json::to_string_pretty(&json)?);
        }
        Sniffed::Opaque => println!("opaque ({} bytes)", bytes.len()),
    }
    Ok(())
}
