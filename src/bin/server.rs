//! Tidesync reference collection server
//!
//! Run with: tidesync-server --port 3001

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use parking_lot::RwLock;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tidesync::remote::Collection;
use tidesync::server::CollectionServer;
use tidesync::Entity;

#[derive(Parser, Debug)]
#[command(name = "tidesync-server")]
#[command(about = "In-memory REST collection for tidesync clients")]
#[command(version)]
struct Args {
    /// Address to bind
    #[arg(long, env = "TIDESYNC_HOST", default_value = "127.0.0.1")]
    host: String,

    /// Port to listen on
    #[arg(long, env = "TIDESYNC_PORT", default_value = "3001")]
    port: u16,

    /// Collection path
    #[arg(long, env = "TIDESYNC_COLLECTION_PATH", default_value = "/todos")]
    path: String,

    /// JSON file with initial items
    #[arg(long)]
    seed: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(false),
        )
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let items: Vec<Entity> = match args.seed {
        Some(ref path) => {
            let path = shellexpand::tilde(path).to_string();
            let raw = std::fs::read_to_string(&path)?;
            serde_json::from_str(&raw)?
        }
        None => Vec::new(),
    };
    tracing::info!("Seeded collection with {} items", items.len());

    let collection = Arc::new(RwLock::new(Collection::with_items(items)));
    let server = CollectionServer::with_collection(collection, args.path);

    let addr: SocketAddr = format!("{}:{}", args.host, args.port).parse()?;
    server.serve(addr).await?;

    Ok(())
}
