use anyhow::Context;
use ridesafe_backend::build_app;
use ridesafe_backend::config::BackendConfig;
use ridesafe_backend::persistence::{Datastore, PgStore};
use tracing::{info, warn};

// ─── Main ─────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ridesafe_backend=info,socketioxide=warn".into()),
        )
        .init();

    info!("🚑 RideSafe dispatch backend starting...");
    let config = BackendConfig::from_env();

    // A configured database that cannot be reached is fatal
    let store = match &config.database_url {
        Some(url) => Datastore::Postgres(PgStore::connect(url).await.context("connecting to DATABASE_URL")?),
        None => {
            warn!("DATABASE_URL not set, alerts and presence are kept in memory only");
            Datastore::memory()
        }
    };
    info!(
        "Datastore: {}, dispatch radius {} m, presence freshness {} s",
        store.kind(),
        config.dispatch_radius_m,
        config.presence_freshness_ms / 1000
    );

    let (app, _io) = build_app(&config, store);

    let addr = format!("0.0.0.0:{}", config.port);
    info!("🚀 Listening on {addr}");
    let listener = tokio::net::TcpListener::bind(&addr).await.with_context(|| format!("binding {addr}"))?;
    axum::serve(listener, app).await?;
    Ok(())
}
