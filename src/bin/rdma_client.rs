//! RDMA client binary
//!
//! The loopback fabric only reaches arenas in the same process, so this
//! binary hosts its own cache and RDMA adapter and drives them through
//! one or more RDMA clients.
//!
//! Run with: cargo run --bin rdma-client -- --help

use anyhow::{anyhow, Result};
use blade_cache::cache::{CacheConfig, CacheManager, CacheStats};
use blade_cache::dispatcher::Dispatcher;
use blade_cache::protocol::{OpKind, Status};
use blade_cache::rdma::{RdmaAdapter, RdmaCacheClient, RdmaClientConfig, RdmaConfig};
use blade_cache::transport::{RdmaTransport, TransportConfig};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::Instant;

#[derive(Parser, Debug)]
#[command(name = "rdma-client")]
#[command(about = "Object cache client over the loopback RDMA fabric")]
struct Args {
    /// Cache arena size in MB
    #[arg(long, default_value = "256")]
    capacity_mb: usize,

    /// Number of RDMA domains/NICs to expose
    #[arg(long, default_value = "1")]
    num_domains: usize,

    /// Number of RDMA worker threads
    #[arg(long, default_value = "4")]
    worker_threads: usize,

    /// Receive buffer size in MB
    #[arg(long, default_value = "64")]
    buffer_mb: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Put, get and delete a few keys and print what happened
    Demo,
    /// Run benchmark with concurrent clients
    Bench {
        /// Number of operations per client
        #[arg(long, default_value = "1000")]
        ops: usize,
        /// Value size in bytes
        #[arg(long, default_value = "1024")]
        value_size: usize,
        /// Number of concurrent clients
        #[arg(long, default_value = "4")]
        clients: usize,
    },
}

fn start_adapter(args: &Args) -> Result<RdmaAdapter> {
    let capacity = args.capacity_mb * 1024 * 1024;
    let cache = CacheManager::new(CacheConfig::with_capacity(capacity, capacity / 4))?;
    let dispatcher = Arc::new(Dispatcher::new(Arc::new(cache)));
    let transport = RdmaTransport::loopback(TransportConfig {
        node_id: 0,
        num_domains: args.num_domains,
    });

    RdmaAdapter::start(
        dispatcher,
        transport,
        RdmaConfig {
            worker_threads: args.worker_threads,
            ..Default::default()
        },
    )
}

fn client_config(args: &Args, client_id: u32, max_value_size: usize) -> RdmaClientConfig {
    RdmaClientConfig {
        client_id,
        receive_buffer_size: args.buffer_mb * 1024 * 1024,
        max_value_size,
        ..Default::default()
    }
}

fn cmd_demo(args: &Args, adapter: &RdmaAdapter) -> Result<()> {
    let client = RdmaCacheClient::connect(adapter, client_config(args, 1, 1024 * 1024))?;

    client.put(b"hello", b"world")?;
    println!("PUT hello = world");

    let value = client.get(b"hello")?;
    println!("GET hello -> {}", String::from_utf8_lossy(&value));

    let size = client.call(OpKind::Size, b"hello")?;
    println!("SIZE hello -> {}", size.length);

    println!("DELETE hello -> {}", client.delete(b"hello")?);

    match client.get(b"hello") {
        Ok(_) => println!("GET hello -> unexpectedly present"),
        Err(e) => println!("GET hello -> {}", e),
    }

    let (transfers, bytes) = adapter.transport().counters();
    let stats = client.call(OpKind::Stats, b"")?;
    if stats.status != Status::Ok {
        return Err(anyhow!("STATS failed: {}", stats.error_message));
    }
    let stats: CacheStats = serde_json::from_slice(&stats.payload.unwrap_or_default())?;
    println!(
        "Transfers: {} ({} bytes) Hits: {} Misses: {}",
        transfers, bytes, stats.hits, stats.misses
    );
    Ok(())
}

fn cmd_bench(args: &Args, adapter: &RdmaAdapter, ops: usize, value_size: usize, clients: usize) -> Result<()> {
    let value = vec![b'x'; value_size];
    println!(
        "Running benchmark: {} clients x {} ops, {} byte values",
        clients, ops, value_size
    );

    let start = Instant::now();
    let results: Vec<Result<()>> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..clients)
            .map(|c| {
                let value = &value;
                s.spawn(move || -> Result<()> {
                    let client = RdmaCacheClient::connect(
                        adapter,
                        client_config(args, c as u32 + 1, value_size.max(1)),
                    )?;
                    for i in 0..ops {
                        let key = format!("bench_{}_{}", c, i);
                        client.put(key.as_bytes(), value)?;
                        let got = client.get(key.as_bytes())?;
                        if got.len() != value.len() {
                            return Err(anyhow!("short read for {}", key));
                        }
                    }
                    Ok(())
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().unwrap_or_else(|_| Err(anyhow!("client thread panicked"))))
            .collect()
    });
    let elapsed = start.elapsed();

    for result in results {
        result?;
    }

    let total = (clients * ops * 2) as f64;
    let (transfers, bytes) = adapter.transport().counters();
    println!(
        "PUT+GET: {} ops in {:.2}s = {:.0} ops/sec",
        total,
        elapsed.as_secs_f64(),
        total / elapsed.as_secs_f64()
    );
    println!(
        "RDMA writes: {} ({:.1} MB/s)",
        transfers,
        bytes as f64 / 1024.0 / 1024.0 / elapsed.as_secs_f64()
    );
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level)),
        )
        .init();

    let adapter = start_adapter(&args)?;

    let result = match &args.command {
        Commands::Demo => cmd_demo(&args, &adapter),
        Commands::Bench {
            ops,
            value_size,
            clients,
        } => cmd_bench(&args, &adapter, *ops, *value_size, *clients),
    };

    adapter.shutdown();
    result
}
