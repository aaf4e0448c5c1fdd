//! CaskDB load balancer binary.

use caskdb_balancer::{start_balancer, Balancer, BalancerConfig};
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Least-connections load balancer for a pool of CaskDB servers.
#[derive(Parser)]
#[command(name = "caskdb-lb")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Port to listen on
    #[arg(short, long, default_value_t = 8090)]
    port: u16,

    /// Backend address, repeatable (host:port)
    #[arg(short, long = "backend", required = true)]
    backends: Vec<String>,

    /// Request timeout in seconds
    #[arg(long, default_value_t = 3)]
    timeout_sec: u64,

    /// Seconds between health probes
    #[arg(long, default_value_t = 10)]
    health_interval_sec: u64,

    /// Reach backends over HTTPS
    #[arg(long)]
    https: bool,

    /// Add an lb-from header naming the chosen backend
    #[arg(long)]
    trace: bool,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = BalancerConfig {
        backends: cli.backends,
        scheme: if cli.https { "https" } else { "http" }.to_owned(),
        health_interval: Duration::from_secs(cli.health_interval_sec),
        request_timeout: Duration::from_secs(cli.timeout_sec),
        trace: cli.trace,
    };
    let balancer = Arc::new(Balancer::new(config)?);

    // First probe up front so traffic can flow before the first tick.
    balancer.probe_all().await;

    let addr = SocketAddr::from(([0, 0, 0, 0], cli.port));
    start_balancer(addr, balancer).await?;

    Ok(())
}
