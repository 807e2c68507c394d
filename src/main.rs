//! huddle chat server
//!
//! Usage:
//!   huddle server                              # in-memory store on 127.0.0.1:4433
//!   huddle server --port 5000 --store log.jsonl

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use huddle::server::{ChatServer, ServerConfig};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_usage();
        return Ok(());
    }

    match args[1].as_str() {
        "server" => run_server(&args).await?,
        "help" | "--help" | "-h" => print_usage(),
        _ => {
            eprintln!("Unknown command: {}", args[1]);
            print_usage();
        }
    }

    Ok(())
}

fn print_usage() {
    println!("huddle - presence and message fan-out over QUIC");
    println!();
    println!("USAGE:");
    println!("    huddle server [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("    --port <PORT>        Port to listen on (default: 4433)");
    println!("    --max-conn <NUM>     Maximum connections (default: 1000)");
    println!("    --grace-secs <SECS>  Reconnect grace period (default: 60)");
    println!("    --store <PATH>       Append-only message log (default: in memory)");
    println!();
    println!("EXAMPLES:");
    println!("    huddle server --port 5000");
    println!("    RUST_LOG=huddle=debug huddle server --store messages.jsonl");
}

/// Value following `flag`, parsed
fn parse_flag<T: std::str::FromStr>(args: &[String], flag: &str) -> Option<T> {
    args.windows(2)
        .find(|pair| pair[0] == flag)
        .and_then(|pair| pair[1].parse().ok())
}

fn parse_port(args: &[String]) -> u16 {
    parse_flag(args, "--port").unwrap_or(4433)
}

fn build_config(args: &[String]) -> ServerConfig {
    let mut config = ServerConfig::default();
    config.bind_addr = SocketAddr::from(([0, 0, 0, 0], parse_port(args)));
    if let Some(max) = parse_flag(args, "--max-conn") {
        config.max_connections = max;
    }
    if let Some(secs) = parse_flag::<u64>(args, "--grace-secs") {
        config.coordinator.grace_period = Duration::from_secs(secs);
    }
    config.store_path = parse_flag::<PathBuf>(args, "--store");
    config
}

async fn run_server(args: &[String]) -> Result<()> {
    let config = build_config(args);

    info!("Configuration:");
    info!("  - Bind address: {}", config.bind_addr);
    info!("  - Max connections: {}", config.max_connections);
    info!("  - Grace period: {:?}", config.coordinator.grace_period);
    match &config.store_path {
        Some(path) => info!("  - Message log: {}", path.display()),
        None => info!("  - Message log: in memory"),
    }

    let store_label = config
        .store_path
        .as_ref()
        .map_or_else(|| "in-memory store".to_string(), |p| p.display().to_string());
    let mut server = ChatServer::from_config(config)
        .await
        .with_context(|| format!("failed to open {}", store_label))?;

    if let Err(e) = server.run().await {
        error!("Server error: {}", e);
        return Err(e).context("server stopped");
    }

    Ok(())
}
