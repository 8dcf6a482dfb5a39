//! Cache manager binary
//!
//! Run with: cargo run --bin cache-manager -- --help

use anyhow::Result;
use blade_cache::rdma::RdmaConfig;
use blade_cache::server::{run_server, ServerConfig};
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "cache-manager")]
#[command(about = "Single-node object cache serving TCP and RDMA clients")]
struct Args {
    /// JSON config file; flags below override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// Server node ID
    #[arg(long)]
    node_id: Option<u32>,

    /// TCP listen address
    #[arg(long)]
    listen_addr: Option<String>,

    /// Arena capacity in MB
    #[arg(long)]
    capacity_mb: Option<usize>,

    /// Largest object accepted, in MB
    #[arg(long)]
    max_object_mb: Option<usize>,

    /// Arena alignment in bytes (power of two)
    #[arg(long)]
    alignment: Option<usize>,

    /// Enable the loopback RDMA adapter
    #[arg(long, default_value_t = false)]
    rdma: bool,

    /// Number of RDMA worker threads
    #[arg(long, default_value = "4")]
    rdma_workers: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Number of worker threads for processing requests
    #[arg(long, default_value = "4")]
    worker_threads: usize,
}

fn build_config(args: &Args) -> Result<ServerConfig> {
    let mut config = match &args.config {
        Some(path) => ServerConfig::from_file(path)?,
        None => ServerConfig::default(),
    };

    if let Some(node_id) = args.node_id {
        config.node_id = node_id;
    }
    if let Some(addr) = &args.listen_addr {
        config.listen_addr = addr.clone();
    }
    if let Some(mb) = args.capacity_mb {
        config.cache.arena.capacity = mb * 1024 * 1024;
    }
    if let Some(mb) = args.max_object_mb {
        config.cache.max_object_size = mb * 1024 * 1024;
    }
    if let Some(alignment) = args.alignment {
        config.cache.arena.alignment = alignment;
    }
    if args.rdma {
        config.rdma = Some(RdmaConfig {
            worker_threads: args.rdma_workers,
            ..config.rdma.take().unwrap_or_default()
        });
    }

    config.cache.validate()?;
    Ok(config)
}

async fn run_with_config(args: Args) -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level)),
        )
        .init();

    let config = build_config(&args)?;

    tracing::info!("=== Cache Manager Configuration ===");
    tracing::info!("Worker threads: {}", args.worker_threads);
    tracing::info!("Listen address: {}", config.listen_addr);
    tracing::info!("Arena: {} MB", config.cache.arena.capacity / 1024 / 1024);
    tracing::info!("Max object: {} bytes", config.cache.max_object_size);
    tracing::info!("Node ID: {}", config.node_id);
    tracing::info!(
        "RDMA adapter: {}",
        match &config.rdma {
            Some(rdma) => format!("loopback, {} workers", rdma.worker_threads),
            None => "disabled".to_string(),
        }
    );
    tracing::info!("===================================");

    run_server(config).await
}

fn main() -> Result<()> {
    let args = Args::parse();
    let worker_threads = args.worker_threads;

    // Build tokio runtime with specified number of worker threads
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_all()
        .build()?
        .block_on(run_with_config(args))
}
