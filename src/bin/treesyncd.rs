use anyhow::{Context, Result};
use clap::Parser;

use treesync::cli::DaemonOpts;
use treesync::logger::{init_tracing, open_logger};

fn main() -> Result<()> {
    ctrlc::set_handler(move || {
        eprintln!("\nInterrupted by user. Exiting (Ctrl-C)...");
        std::process::exit(130);
    })
    .context("Error setting Ctrl-C handler")?;

    let opts = DaemonOpts::parse();
    init_tracing(opts.verbose);
    let mut config = opts.resolve()?;

    // Validate root directory exists and is a directory
    if !config.root.exists() {
        anyhow::bail!("Root directory does not exist: {}", config.root.display());
    }
    if !config.root.is_dir() {
        anyhow::bail!("Root path is not a directory: {}", config.root.display());
    }
    config.root = std::fs::canonicalize(&config.root)
        .with_context(|| format!("Failed to canonicalize root path: {}", config.root.display()))?;

    let bind = config.bind_addr();
    if bind.starts_with("0.0.0.0") {
        tracing::warn!("binding to {} exposes the tree to all network interfaces", bind);
    }

    let logger = open_logger(config.log_file.as_deref(), config.log_format)?;
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;
    rt.block_on(treesync::net_async::server::serve(config, logger))
}
