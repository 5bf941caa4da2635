//! treesync: mirror a directory tree from a peer.
//!
//! Without `--address` the node serves `--path`; with it, the node keeps
//! `--path` in step with the server at that address.

use anyhow::{Context, Result};
use clap::Parser;

use treesync::cli::SyncArgs;
use treesync::config::Config;
use treesync::logger::{init_tracing, open_logger};
use treesync::net_async;
use treesync::snapshot::Snapshot;

fn main() -> Result<()> {
    ctrlc::set_handler(move || {
        eprintln!("\nInterrupted by user. Exiting (Ctrl-C)...");
        // 128 + SIGINT
        std::process::exit(130);
    })
    .context("Error setting Ctrl-C handler")?;

    let args = SyncArgs::parse();
    init_tracing(args.verbose);
    let config = args.resolve()?;

    if args.list {
        return list_main(&config);
    }

    let logger = open_logger(config.log_file.as_deref(), config.log_format)?;
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    match args.address.as_deref() {
        Some(address) => {
            tracing::info!(
                "treesync {} mirroring {} into {}",
                env!("CARGO_PKG_VERSION"),
                config.server_addr(address),
                config.root.display()
            );
            rt.block_on(net_async::client::run(config, address, logger))
        }
        None => {
            if !config.root.is_dir() {
                anyhow::bail!("Root path is not a directory: {}", config.root.display());
            }
            rt.block_on(net_async::server::serve(config, logger))
        }
    }
}

/// `--list`: scan once and print what a server would publish
fn list_main(config: &Config) -> Result<()> {
    let snapshot = Snapshot::scan(&config.root, &config.filter, config.scan_limits())
        .with_context(|| format!("scan {}", config.root.display()))?;
    for entry in snapshot.entries() {
        println!("{:>12}  {}", entry.mtime, entry.name);
    }
    println!(
        "{} files, digest 0x{:08x}",
        snapshot.len(),
        snapshot.digest()
    );
    Ok(())
}
