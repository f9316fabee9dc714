// CLASSIFICATION: COMMUNITY
// Filename: cli.rs v0.3
// Author: Lukas Bower
// Date Modified: 2026-02-12

use std::path::PathBuf;

use clap::Parser;

/// Broker server command line.
#[derive(Parser, Debug)]
#[command(author, version, about = "Remote compilation broker")]
pub struct BrokerArgs {
    /// Configuration environment, repeatable; merged in order.
    #[arg(long = "env", value_name = "ENV")]
    pub env: Vec<String>,
    /// Directory holding the layered configuration files.
    #[arg(long, default_value = "etc/config")]
    pub prefix: PathBuf,
    /// Language layer to merge (e.g. c++).
    #[arg(long)]
    pub language: Option<String>,
    #[arg(long, default_value = "0.0.0.0")]
    pub host: String,
    #[arg(long, default_value_t = 10240)]
    pub port: u16,
    /// Static asset directory, served by the front proxy.
    #[arg(long = "static", value_name = "DIR")]
    pub static_dir: Option<PathBuf>,
    /// Archived compiler versions manifest.
    #[arg(long)]
    pub archived_versions: Option<String>,
    #[arg(long)]
    pub debug: bool,
    /// Dump the merged configuration at startup.
    #[arg(long)]
    pub debug_properties: bool,
    /// Running under WSL; workspaces go to the Windows-mounted temp dir.
    #[arg(long)]
    pub wsl: bool,
}
