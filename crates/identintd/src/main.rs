use anyhow::{Context, Result};
use identint_core::OnnxBackend;
use identint_store::AsyncStore;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

mod admin;
mod config;
mod engine;
mod error;
mod recognition;
mod routes;
mod session;
mod upload;
mod views;

#[cfg(test)]
mod testing;

use config::Config;
use routes::AppState;
use session::SessionStore;

/// How often expired sessions and their temporary uploads are swept.
const SWEEP_INTERVAL: Duration = Duration::from_secs(300);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "identintd starting");

    let config = Config::from_env();
    tracing::info!(?config, "configuration loaded");

    for dir in [config.temp_dir(), config.student_photo_dir()] {
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("cannot create {}", dir.display()))?;
    }

    let store = AsyncStore::open(&config.db_path)
        .await
        .with_context(|| format!("cannot open database {}", config.db_path.display()))?;

    let backend = OnnxBackend::load(&config.model_dir)
        .with_context(|| format!("cannot load models from {}", config.model_dir.display()))?;
    let engine = engine::spawn_engine(backend)?;

    let sessions = Arc::new(SessionStore::new(config.session_ttl));
    let config = Arc::new(config);
    spawn_session_sweeper(Arc::clone(&sessions), Arc::clone(&config));

    let state = AppState { config: Arc::clone(&config), store, engine, sessions };
    let app = routes::router(state);

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("cannot bind {}", config.bind))?;
    tracing::info!(addr = %config.bind, "identintd ready");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("identintd shutting down");
        })
        .await?;

    Ok(())
}

/// Periodically drop idle sessions and delete the uploads they left behind.
fn spawn_session_sweeper(sessions: Arc<SessionStore>, config: Arc<Config>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            ticker.tick().await;
            let stale = sessions.purge_expired();
            if stale.is_empty() {
                continue;
            }
            tracing::debug!(uploads = stale.len(), "purging expired sessions");
            for path in stale {
                upload::remove_media(&config.media_dir, &path).await;
            }
        }
    });
}
