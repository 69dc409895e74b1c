//! quarry-world-server binary
//!
//! Starts the world service: binds the listener, connects the durable
//! store, and runs until SIGINT.
//!
//! ## Configuration (environment / flags)
//!
//! | Key                        | Default               | Description                      |
//! |----------------------------|-----------------------|----------------------------------|
//! | `QUARRY_BIND_ADDR`         | `0.0.0.0:8780`        | Listener address                 |
//! | `QUARRY_ALLOWED_ORIGINS`   | *(empty)*             | Comma-separated origin patterns  |
//! | `QUARRY_STORE_URL`         | *(unset)*             | Postgres endpoint; unset = local |
//! | `QUARRY_STORE_SERVICE_KEY` | *(unset)*             | Store credential override        |
//! | `QUARRY_PUBLIC_URL`        | `ws://localhost:8780` | Advertised endpoint              |
//! | `QUARRY_REGION`            | `local`               | Region tag                       |
//! | `QUARRY_INSTANCE_ID`       | `quarry-world-1`      | Stable instance id               |
//! | `QUARRY_JWT_ISSUER`        | `quarry`              | Required `iss` claim             |
//! | `QUARRY_JWT_AUDIENCE`      | `quarry-world`        | Required `aud` claim             |
//! | `QUARRY_ALLOW_UNSIGNED`    | `false`               | Display-name-only admission      |

use anyhow::Result;
use clap::Parser;
use quarry_world::store::{MemStore, PgStore, Store};
use quarry_world::types::ServerConfig;
use quarry_world::Server;
use std::sync::Arc;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "quarry-world-server", about = "Quarry World Service", version)]
struct Args {
    /// Listener bind address
    #[arg(long, env = "QUARRY_BIND_ADDR", default_value = "0.0.0.0:8780")]
    bind_addr: String,

    /// Allowed Origin patterns (comma-separated; `*.domain` wildcards)
    #[arg(long, env = "QUARRY_ALLOWED_ORIGINS", value_delimiter = ',', num_args = 0..)]
    allowed_origins: Vec<String>,

    /// Store endpoint (Postgres URL). When unset the server runs in local
    /// mode against an in-memory store.
    #[arg(long, env = "QUARRY_STORE_URL")]
    store_url: Option<String>,

    /// Store service key (overrides the password in the endpoint URL)
    #[arg(long, env = "QUARRY_STORE_SERVICE_KEY")]
    store_service_key: Option<String>,

    /// Endpoint advertised in session rows
    #[arg(long, env = "QUARRY_PUBLIC_URL", default_value = "ws://localhost:8780")]
    public_url: String,

    /// Region tag
    #[arg(long, env = "QUARRY_REGION", default_value = "local")]
    region: String,

    /// Stable instance id (must survive restarts for crash recovery)
    #[arg(long, env = "QUARRY_INSTANCE_ID", default_value = "quarry-world-1")]
    instance_id: String,

    /// Required issuer claim on signed credentials
    #[arg(long, env = "QUARRY_JWT_ISSUER", default_value = "quarry")]
    jwt_issuer: String,

    /// Required audience claim on signed credentials
    #[arg(long, env = "QUARRY_JWT_AUDIENCE", default_value = "quarry-world")]
    jwt_audience: String,

    /// Accept unsigned short-lived tokens (display-name-only admission)
    #[arg(long, env = "QUARRY_ALLOW_UNSIGNED")]
    allow_unsigned: bool,
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // Initialise logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("quarry_world=info".parse()?),
        )
        .init();

    let args = Args::parse();

    let mut allow_unsigned = args.allow_unsigned;
    let store: Arc<dyn Store> = match &args.store_url {
        Some(url) => {
            let store = PgStore::connect(url, args.store_service_key.as_deref()).await?;
            store.migrate().await?;
            Arc::new(store)
        }
        None => {
            log::info!("No store endpoint configured; running in local mode");
            if !allow_unsigned {
                log::warn!("Local mode has no signing keys; enabling unsigned tokens");
                allow_unsigned = true;
            }
            Arc::new(MemStore::new())
        }
    };

    let config = ServerConfig {
        bind_addr: args.bind_addr,
        allowed_origins: args
            .allowed_origins
            .into_iter()
            .filter(|p| !p.is_empty())
            .collect(),
        public_url: args.public_url,
        region: args.region,
        instance_id: args.instance_id,
        jwt_issuer: args.jwt_issuer,
        jwt_audience: args.jwt_audience,
        allow_unsigned_tokens: allow_unsigned,
        ..Default::default()
    };

    log::info!(
        "Starting quarry-world-server (bind={}, instance='{}', region='{}')",
        config.bind_addr,
        config.instance_id,
        config.region,
    );

    let server = Arc::new(Server::new(config, store));

    let mut runner = {
        let server = server.clone();
        tokio::spawn(async move { server.run().await })
    };

    tokio::select! {
        result = &mut runner => result?,
        _ = tokio::signal::ctrl_c() => {
            log::info!("SIGINT received; shutting down");
            server.trigger_shutdown();
            runner.await?
        }
    }
}
