//! Tripline server binary.
//!
//! # Usage
//!
//! ```bash
//! # Development: in-memory storage, self-signed cert, ephemeral session key
//! tripline-server --bind 0.0.0.0:4433
//!
//! # Production: durable storage, TLS, and the login service's public key
//! tripline-server --bind 0.0.0.0:4433 --cert cert.pem --key key.pem \
//!     --db tripline.redb --session-key 9f3a...
//! ```

use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};
use tripline_core::{SessionKey, SessionVerifier};
use tripline_server::{
    DriverConfig, MemoryStorage, RedbStorage, Server, ServerRuntimeConfig, Storage,
};

/// Tripline chat server
#[derive(Parser, Debug)]
#[command(name = "tripline-server")]
#[command(about = "Real-time trip chat server")]
#[command(version)]
struct Args {
    /// Address to bind to
    #[arg(short, long, default_value = "0.0.0.0:4433")]
    bind: String,

    /// Path to TLS certificate (PEM format)
    #[arg(short, long)]
    cert: Option<String>,

    /// Path to TLS private key (PEM format)
    #[arg(short, long)]
    key: Option<String>,

    /// Path to the redb database; in-memory storage when omitted
    #[arg(long)]
    db: Option<std::path::PathBuf>,

    /// Hex-encoded Ed25519 public key for verifying session credentials
    #[arg(long)]
    session_key: Option<String>,

    /// Maximum concurrent connections
    #[arg(long, default_value = "10000")]
    max_connections: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    tracing::info!("Tripline server starting");
    tracing::info!("Binding to {}", args.bind);

    if args.cert.is_none() || args.key.is_none() {
        tracing::warn!("No TLS certificate provided - using self-signed certificate");
        tracing::warn!("This is NOT suitable for production use!");
    }

    let verifier = resolve_session_verifier(args.session_key.as_deref())?;

    let config = ServerRuntimeConfig {
        bind_address: args.bind,
        cert_path: args.cert,
        key_path: args.key,
        driver: DriverConfig { max_connections: args.max_connections, ..Default::default() },
    };

    match args.db {
        Some(path) => {
            tracing::info!("Using redb storage at {}", path.display());
            let storage = RedbStorage::open(path)?;
            run(config, storage, verifier).await
        },
        None => {
            tracing::warn!("No --db path provided - using in-memory storage");
            run(config, MemoryStorage::new(), verifier).await
        },
    }
}

async fn run<S: Storage>(
    config: ServerRuntimeConfig,
    storage: S,
    verifier: SessionVerifier,
) -> Result<(), Box<dyn std::error::Error>> {
    let server = Server::bind(config, storage, verifier)?;

    tracing::info!("Server listening on {}", server.local_addr()?);

    server.run().await?;

    Ok(())
}

/// Load the session verifying key, or generate an ephemeral pair for
/// development (credentials from any previous run become invalid).
fn resolve_session_verifier(
    hex_key: Option<&str>,
) -> Result<SessionVerifier, Box<dyn std::error::Error>> {
    match hex_key {
        Some(hex_key) => {
            let bytes = hex::decode(hex_key)?;
            let bytes: [u8; 32] = bytes
                .as_slice()
                .try_into()
                .map_err(|_| "session key must be 32 hex-encoded bytes")?;
            Ok(SessionVerifier::from_bytes(&bytes)?)
        },
        None => {
            let mut seed = [0u8; 32];
            getrandom::fill(&mut seed)?;
            let key = SessionKey::from_seed(seed);

            tracing::warn!("No --session-key provided - generated an ephemeral key");
            tracing::warn!(
                "Issue development credentials with signing seed {}",
                hex::encode(seed)
            );

            Ok(key.verifier())
        },
    }
}
