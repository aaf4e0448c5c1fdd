//! CaskDB HTTP server binary.

use caskdb_server::start_server;
use caskdb_core::{Config, Db};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// HTTP front end for the CaskDB storage engine.
#[derive(Parser)]
#[command(name = "caskdb-server")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Port to listen on
    #[arg(short, long, default_value_t = 8083)]
    port: u16,

    /// Path to the database directory
    #[arg(short, long, default_value = "./data")]
    dir: PathBuf,

    /// Maximum segment file size in bytes before rotation
    #[arg(long, default_value_t = 4 * 1024 * 1024)]
    segment_size: u64,

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

    let config = Config::default().max_segment_size(cli.segment_size);
    let db = Arc::new(Db::open_with_config(&cli.dir, config)?);

    let addr = SocketAddr::from(([0, 0, 0, 0], cli.port));
    start_server(addr, db).await?;

    Ok(())
}
