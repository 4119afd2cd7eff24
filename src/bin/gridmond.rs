use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use gridmon::cli::DaemonOpts;
use gridmon::config::DaemonConfig;
use gridmon::server;
use gridmon::session::SessionRegistry;

fn main() -> Result<()> {
    let opts = DaemonOpts::parse();

    let default_level = match opts.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(format!("gridmon={default_level}"))),
        )
        .init();

    let mut config = match &opts.config {
        Some(path) => DaemonConfig::load(path)?,
        None => DaemonConfig::default(),
    };
    if let Some(bind) = opts.bind {
        config.bind = bind;
    }
    if let Some(store) = opts.file_store {
        config.file_store = store;
    }
    if opts.require_encryption {
        config.require_encryption = true;
    }

    std::fs::create_dir_all(&config.file_store).with_context(|| {
        format!(
            "create file store directory {}",
            config.file_store.display()
        )
    })?;

    if config.users.is_empty() {
        eprintln!("WARNING: no users configured; every login will be rejected");
    }
    if config.bind.starts_with("0.0.0.0") && !config.require_encryption {
        eprintln!("WARNING: listening on all interfaces without mandatory encryption");
        eprintln!("         consider --require-encryption or a specific bind address");
    }

    let config = Arc::new(config);
    let handlers = Arc::new(server::build_registry(&config));
    let sessions = Arc::new(SessionRegistry::new());

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;
    rt.block_on(server::serve(config, handlers, sessions))
}
