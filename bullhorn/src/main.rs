use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use bullhorn::api::{self, AppState};
use bullhorn::audit::AuditRecorder;
use bullhorn::config::{Args, Config};
use bullhorn::dispatch::Dispatcher;
use bullhorn::import::Importer;
use bullhorn::provider::HttpSmsProvider;
use bullhorn::reconcile::Reconciler;
use bullhorn::store::memory::InMemoryStore;
use bullhorn::store::Store;

#[cfg(feature = "postgres")]
async fn open_store(database_url: Option<&str>) -> anyhow::Result<Arc<dyn Store>> {
    match database_url {
        Some(url) => {
            let pool = sqlx::postgres::PgPoolOptions::new()
                .max_connections(10)
                .connect(url)
                .await
                .context("failed to connect to postgres")?;
            let store = bullhorn::store::postgres::PostgresStore::new(pool);
            store
                .ensure_schema()
                .await
                .context("failed to apply schema")?;
            info!("connected to postgres");
            Ok(Arc::new(store))
        }
        None => {
            warn!("no database_url configured; using in-memory store, data will not survive restarts");
            Ok(Arc::new(InMemoryStore::new()))
        }
    }
}

#[cfg(not(feature = "postgres"))]
async fn open_store(database_url: Option<&str>) -> anyhow::Result<Arc<dyn Store>> {
    if database_url.is_some() {
        anyhow::bail!("database_url is set but this build has no postgres support");
    }
    warn!("using in-memory store, data will not survive restarts");
    Ok(Arc::new(InMemoryStore::new()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("bullhorn=info,tower_http=info")),
        )
        .init();

    let args = Args::parse();
    let config = Config::load(&args).context("invalid configuration")?;

    if args.validate {
        println!("configuration OK");
        return Ok(());
    }

    let store = open_store(config.database_url.as_deref()).await?;
    let provider = Arc::new(
        HttpSmsProvider::new(config.provider.clone()).context("invalid provider configuration")?,
    );

    let audit = AuditRecorder::new(store.clone());
    let dispatcher = Arc::new(Dispatcher::new(
        store.clone(),
        provider,
        audit.clone(),
        config.dispatch.clone(),
    ));
    let shutdown = CancellationToken::new();

    let state = AppState {
        store: store.clone(),
        dispatcher,
        reconciler: Reconciler::new(store.clone()),
        importer: Importer::new(store, audit.clone()),
        audit,
        shutdown: shutdown.clone(),
    };

    let app = api::router(state);
    let bind = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    info!(%bind, "listening");

    let shutdown_signal = {
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for shutdown signal");
                return;
            }
            info!("shutdown signal received, stopping dispatches");
            shutdown.cancel();
        }
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .context("server error")?;

    info!("shut down cleanly");
    Ok(())
}
