use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use arcana_gateway::store::GatewayStore;
use arcana_gateway::{Gateway, GatewayConfig, HttpState, MemoryStore};

#[derive(Debug, Parser)]
#[command(name = "arcana-gateway", about = "LLM request gateway")]
struct Args {
    /// Path to the TOML configuration file.
    config: PathBuf,

    /// Address to listen on.
    #[arg(long, default_value = "127.0.0.1:8080")]
    listen: String,

    /// Persist gateway state to this sqlite database.
    #[arg(long, conflicts_with = "redis")]
    sqlite: Option<PathBuf>,

    /// Persist gateway state to this redis instance.
    #[arg(long)]
    redis: Option<String>,

    /// Key prefix when using redis.
    #[arg(long, requires = "redis")]
    redis_prefix: Option<String>,

    /// Enable the /admin endpoints with this shared token.
    #[arg(long)]
    admin_token: Option<String>,

    /// Emit logs as JSON lines.
    #[arg(long)]
    json_logs: bool,
}

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let args = Args::parse();
    init_tracing(args.json_logs);

    let config = GatewayConfig::load(&args.config)?;
    let store = open_store(&args).await?;

    let mut gateway = Gateway::new(config, store);
    gateway.connect_configured_providers()?;

    let mut state = HttpState::new(Arc::new(gateway));
    if let Some(token) = args.admin_token {
        state = state.with_admin_token(token);
    }

    let app = arcana_gateway::router(state);
    let listener = tokio::net::TcpListener::bind(&args.listen).await?;
    tracing::info!(listen = %args.listen, "arcana-gateway listening");
    axum::serve(listener, app).await?;
    Ok(())
}

fn init_tracing(json_logs: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json_logs {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn open_store(args: &Args) -> Result<Arc<dyn GatewayStore>, BoxError> {
    if let Some(_redis_url) = args.redis.as_ref() {
        #[cfg(feature = "store-redis")]
        {
            let mut store = arcana_gateway::RedisStore::new(_redis_url)?;
            if let Some(prefix) = args.redis_prefix.as_ref() {
                store = store.with_prefix(prefix.clone());
            }
            store.ping().await?;
            return Ok(Arc::new(store));
        }
        #[cfg(not(feature = "store-redis"))]
        {
            return Err("redis store requires `--features store-redis`".into());
        }
    }

    if let Some(_sqlite_path) = args.sqlite.as_ref() {
        #[cfg(feature = "store-sqlite")]
        {
            let store = arcana_gateway::SqliteStore::new(_sqlite_path);
            store.init().await?;
            return Ok(Arc::new(store));
        }
        #[cfg(not(feature = "store-sqlite"))]
        {
            return Err("sqlite store requires `--features store-sqlite`".into());
        }
    }

    tracing::warn!("no durable store configured; quotas and cache reset on restart");
    Ok(Arc::new(MemoryStore::new()))
}
