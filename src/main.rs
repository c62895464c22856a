use std::net::SocketAddr;

use anyhow::{Context, Result};
use referral_commission_engine::{
    AppState, CommissionStore, Config, MemoryStore, PgStore, init_router,
};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();

    let config = Config::from_env().context("Failed to load configuration")?;

    if config.database_url.is_some() {
        let store = PgStore::connect(&config).await?;
        serve(store, config).await
    } else {
        warn!("DATABASE_URL is not set, keeping referral state in memory");
        serve(MemoryStore::default(), config).await
    }
}

async fn serve<S: CommissionStore>(store: S, config: Config) -> Result<()> {
    let addr: SocketAddr = ([0, 0, 0, 0], config.server_port).into();
    let listener = TcpListener::bind(addr).await?;
    let app = init_router(AppState::new(store, config));

    info!(%addr, "listening");
    axum::serve(listener, app).await?;
    Ok(())
}
