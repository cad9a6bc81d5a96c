//! farswap-daemon - remote memory donor for swap clients
//!
//! # Usage
//!
//! ```bash
//! # Offer up to 32 1GiB chunks on port 9400
//! farswap-daemon 0.0.0.0 9400
//!
//! # Smaller chunks, start evicting below 4GB free
//! farswap-daemon 10.0.0.5 9400 --chunk-size 256M --evict-threshold-gb 4
//! ```

mod cli;

use anyhow::Context;
use clap::Parser;
use cli::Cli;
use farswap_core::{Config, ProcMeminfo, WireCodec};
use farswap_daemon::context::ProcessContext;
use farswap_daemon::transport::tcp::TcpTransport;
use farswap_daemon::{signals, Daemon};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref()).context("failed to load configuration")?;
    cli.apply(&mut config).context("invalid command-line option")?;

    let context = ProcessContext::new().context("failed to query host page size")?;
    let codec = WireCodec::new(config.pool.max_entries).context("invalid pool.max_entries")?;

    let addr = cli.socket_addr();
    let listener = TcpTransport::bind(addr, codec.frame_len())
        .with_context(|| format!("failed to listen on {addr}"))?;
    info!(addr = %addr, "listening");

    signals::install(context.shutdown.clone()).context("failed to install signal handler")?;

    let daemon = Daemon::new(listener, &config, context, Box::new(ProcMeminfo::new()))
        .context("failed to start daemon")?;
    let stats = daemon.run()?;

    println!("{stats}");
    Ok(())
}
