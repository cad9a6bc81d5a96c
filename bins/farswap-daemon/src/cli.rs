//! Command-line interface.

use clap::Parser;
use farswap_core::units::parse_size;
use farswap_core::Config;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

/// farswap-daemon - donate spare memory to remote swap clients
#[derive(Parser, Debug)]
#[command(name = "farswap-daemon")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Local address to listen on
    pub addr: IpAddr,

    /// Port to listen on
    pub port: u16,

    /// Configuration file (defaults to /etc/farswap.toml if present)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Maximum concurrent connections
    #[arg(long)]
    pub max_clients: Option<usize>,

    /// Maximum chunks offered
    #[arg(long)]
    pub max_chunks: Option<usize>,

    /// Chunk size (e.g., 1G, 256M)
    #[arg(long)]
    pub chunk_size: Option<String>,

    /// Evict when smoothed free memory drops below this many GB
    #[arg(long)]
    pub evict_threshold_gb: Option<u64>,

    /// Expand when smoothed free memory rises above this many GB
    #[arg(long)]
    pub expand_threshold_gb: Option<u64>,

    /// Consecutive low samples before evicting
    #[arg(long)]
    pub evict_hits: Option<u32>,

    /// Consecutive high samples before expanding
    #[arg(long)]
    pub expand_hits: Option<u32>,

    /// Weight of history in the free-memory average (0.0-1.0)
    #[arg(long)]
    pub free_mem_weight: Option<f64>,

    /// Acknowledgement timeout in milliseconds
    #[arg(long)]
    pub ack_timeout_ms: Option<u64>,
}

impl Cli {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.addr, self.port)
    }

    /// Apply command-line overrides on top of the loaded configuration.
    pub fn apply(&self, config: &mut Config) -> farswap_core::Result<()> {
        if let Some(v) = self.max_clients {
            config.session.max_clients = v;
        }
        if let Some(v) = self.ack_timeout_ms {
            config.session.ack_timeout_ms = v;
        }
        if let Some(v) = self.max_chunks {
            config.pool.max_chunks = v;
        }
        if let Some(size) = &self.chunk_size {
            config.pool.chunk_size = parse_size(size)?;
        }
        if let Some(v) = self.evict_threshold_gb {
            config.monitor.evict_threshold_gb = v;
        }
        if let Some(v) = self.expand_threshold_gb {
            config.monitor.expand_threshold_gb = v;
        }
        if let Some(v) = self.evict_hits {
            config.monitor.evict_hit_threshold = v;
        }
        if let Some(v) = self.expand_hits {
            config.monitor.expand_hit_threshold = v;
        }
        if let Some(v) = self.free_mem_weight {
            config.monitor.free_mem_weight = v;
        }
        Ok(())
    }
}
