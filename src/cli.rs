//! Shared CLI fragments for the daemon binary

use clap::Parser;
use std::path::PathBuf;

/// Common daemon options; values given here override the config file
#[derive(Clone, Debug, Parser)]
#[command(author, version, about = "Gridmon management daemon")]
pub struct DaemonOpts {
    /// Path to the TOML configuration file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Bind address (host:port)
    #[arg(long)]
    pub bind: Option<String>,

    /// Directory receiving uploaded files
    #[arg(long)]
    pub file_store: Option<PathBuf>,

    /// Refuse cleartext frames once session encryption is established
    #[arg(long)]
    pub require_encryption: bool,

    /// Increase log verbosity (-v: debug, -vv: trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}
