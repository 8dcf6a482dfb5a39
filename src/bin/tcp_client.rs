//! TCP cache client binary
//!
//! Run with: cargo run --bin tcp-client -- --help

use anyhow::Result;
use blade_cache::client::{TcpCacheClient, TcpClientConfig};
use clap::{Parser, Subcommand};
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "tcp-client")]
#[command(about = "Object cache client over TCP")]
struct Args {
    /// Server address
    #[arg(long, default_value = "127.0.0.1:12345")]
    server_addr: String,

    /// Per-request timeout in seconds
    #[arg(long, default_value = "30")]
    timeout_secs: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Get a value from the cache
    Get {
        /// Key to get
        key: String,
    },
    /// Put a value into the cache
    Put {
        /// Key to set
        key: String,
        /// Value to set
        value: String,
    },
    /// Delete a value from the cache
    Delete {
        /// Key to delete
        key: String,
    },
    /// Print cache statistics
    Stats,
    /// Run interactive REPL
    Repl,
    /// Run benchmark
    Bench {
        /// Number of operations
        #[arg(long, default_value = "1000")]
        ops: usize,
        /// Value size in bytes
        #[arg(long, default_value = "1024")]
        value_size: usize,
    },
}

async fn cmd_get(client: &TcpCacheClient, key: &str) -> Result<()> {
    match client.get(key.as_bytes()).await {
        Ok(value) => match String::from_utf8(value.clone()) {
            Ok(s) => println!("{}", s),
            Err(_) => println!("{:?}", value),
        },
        Err(e) => eprintln!("Error: {}", e),
    }
    Ok(())
}

async fn cmd_put(client: &TcpCacheClient, key: &str, value: &str) -> Result<()> {
    match client.put(key.as_bytes(), value.as_bytes()).await {
        Ok(()) => println!("OK"),
        Err(e) => eprintln!("Error: {}", e),
    }
    Ok(())
}

async fn cmd_delete(client: &TcpCacheClient, key: &str) -> Result<()> {
    match client.delete(key.as_bytes()).await {
        Ok(true) => println!("Deleted"),
        Ok(false) => println!("Key not found"),
        Err(e) => eprintln!("Error: {}", e),
    }
    Ok(())
}

async fn cmd_stats(client: &TcpCacheClient) -> Result<()> {
    let stats = client.stats().await?;
    println!(
        "Entries: {} ({} bytes of {} MB)",
        stats.entries,
        stats.stored_bytes,
        stats.capacity / 1024 / 1024
    );
    println!(
        "Hits: {} Misses: {} (hit rate {:.1}%)",
        stats.hits,
        stats.misses,
        stats.hit_rate() * 100.0
    );
    println!(
        "Puts: {} Evictions: {} Leases: {} Pending deletes: {}",
        stats.puts, stats.evictions, stats.outstanding_leases, stats.pending_deletes
    );
    if let Some(arena) = stats.arena {
        println!(
            "Arena: used={} available={} largest_free={} free_ranges={}",
            arena.used, arena.available, arena.largest_free, arena.free_ranges
        );
    }
    Ok(())
}

async fn cmd_repl(client: &TcpCacheClient) -> Result<()> {
    use std::io::{self, BufRead, Write};

    println!("Cache REPL - Commands: get <key>, put <key> <value>, delete <key>, exists <key>, size <key>, stats, ping, quit");
    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        print!("> ");
        stdout.flush()?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }

        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.is_empty() {
            continue;
        }

        match parts[0] {
            "get" => {
                if parts.len() < 2 {
                    println!("Usage: get <key>");
                    continue;
                }
                cmd_get(client, parts[1]).await?;
            }
            "put" => {
                if parts.len() < 3 {
                    println!("Usage: put <key> <value>");
                    continue;
                }
                cmd_put(client, parts[1], parts[2]).await?;
            }
            "delete" | "del" => {
                if parts.len() < 2 {
                    println!("Usage: delete <key>");
                    continue;
                }
                cmd_delete(client, parts[1]).await?;
            }
            "exists" => {
                if parts.len() < 2 {
                    println!("Usage: exists <key>");
                    continue;
                }
                println!("{}", client.exists(parts[1].as_bytes()).await?);
            }
            "size" => {
                if parts.len() < 2 {
                    println!("Usage: size <key>");
                    continue;
                }
                match client.size(parts[1].as_bytes()).await? {
                    Some(size) => println!("{}", size),
                    None => println!("Key not found"),
                }
            }
            "stats" => cmd_stats(client).await?,
            "ping" => println!("{}", if client.ping().await? { "PONG" } else { "no answer" }),
            "quit" | "exit" | "q" => {
                println!("Bye!");
                break;
            }
            _ => {
                println!("Unknown command: {}", parts[0]);
            }
        }
    }

    Ok(())
}

async fn cmd_bench(client: &TcpCacheClient, ops: usize, value_size: usize) -> Result<()> {
    use std::time::Instant;

    let value = vec![b'x'; value_size];

    println!("Running benchmark: {} ops, {} byte values", ops, value_size);

    // PUT benchmark
    let start = Instant::now();
    for i in 0..ops {
        let key = format!("bench_key_{}", i);
        client.put(key.as_bytes(), &value).await?;
    }
    let put_duration = start.elapsed();
    println!(
        "PUT: {} ops in {:.2}s = {:.0} ops/sec",
        ops,
        put_duration.as_secs_f64(),
        ops as f64 / put_duration.as_secs_f64()
    );

    // GET benchmark; evicted keys count as misses
    let start = Instant::now();
    let mut misses = 0usize;
    for i in 0..ops {
        let key = format!("bench_key_{}", i);
        if client.get(key.as_bytes()).await.is_err() {
            misses += 1;
        }
    }
    let get_duration = start.elapsed();
    println!(
        "GET: {} ops in {:.2}s = {:.0} ops/sec ({} misses)",
        ops,
        get_duration.as_secs_f64(),
        ops as f64 / get_duration.as_secs_f64(),
        misses
    );

    // DELETE benchmark
    let start = Instant::now();
    for i in 0..ops {
        let key = format!("bench_key_{}", i);
        let _ = client.delete(key.as_bytes()).await?;
    }
    let delete_duration = start.elapsed();
    println!(
        "DELETE: {} ops in {:.2}s = {:.0} ops/sec",
        ops,
        delete_duration.as_secs_f64(),
        ops as f64 / delete_duration.as_secs_f64()
    );

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level)),
        )
        .init();

    let client = TcpCacheClient::connect(TcpClientConfig {
        server_addr: args.server_addr.clone(),
        request_timeout: Duration::from_secs(args.timeout_secs),
    })
    .await?;

    match &args.command {
        Commands::Get { key } => cmd_get(&client, key).await?,
        Commands::Put { key, value } => cmd_put(&client, key, value).await?,
        Commands::Delete { key } => cmd_delete(&client, key).await?,
        Commands::Stats => cmd_stats(&client).await?,
        Commands::Repl => cmd_repl(&client).await?,
        Commands::Bench { ops, value_size } => cmd_bench(&client, *ops, *value_size).await?,
    }

    Ok(())
}
