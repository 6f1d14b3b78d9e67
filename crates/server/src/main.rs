mod auth;
mod commands;
mod config;
mod friendcode;
mod friends;
mod metrics;
mod registry;
mod router;
mod state;
mod transport;
mod util;

use crate::auth::{AccessVerifier, DenyAllVerifier, StaticTokenVerifier};
use crate::config::StoreBackend;
use crate::state::AppState;
use flock_storage::{MemoryStore, NewUser, RelationStore, StorageError};
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::runtime::Builder;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .init();

    let config_path = env::var("FLOCK_CONFIG").unwrap_or_else(|_| "flock.toml".to_string());
    let config =
        config::load_configuration(&PathBuf::from(config_path)).expect("configuration");

    let runtime = Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("tokio runtime");

    runtime.block_on(async move {
        let store: Arc<dyn RelationStore> = match config.store {
            StoreBackend::Postgres => {
                let dsn = config.postgres_dsn.as_deref().expect("postgres dsn");
                let store = flock_storage::connect(dsn).await.expect("postgres connect");
                store.migrate().await.expect("postgres migrate");
                info!("postgres store ready");
                Arc::new(store)
            }
            StoreBackend::Memory => {
                let store = MemoryStore::new();
                seed_users(&store, &config.tokens).await.expect("seed users");
                info!("memory store ready");
                Arc::new(store)
            }
        };

        let verifier: Box<dyn AccessVerifier> = if config.tokens.is_empty() {
            warn!("no tokens configured, every authentication will be refused");
            Box::new(DenyAllVerifier)
        } else {
            Box::new(StaticTokenVerifier::new(&config.tokens))
        };

        let state = AppState::new(config, store, verifier);
        if let Some(metrics_bind) = state.config.metrics_bind.clone() {
            let metrics_state = state.clone();
            tokio::spawn(async move {
                if let Err(err) = transport::serve_metrics(metrics_state, metrics_bind).await {
                    warn!(error = %err, "metrics listener failed");
                }
            });
        }
        transport::serve(state).await.expect("server loop");
    });
}

/// The memory backend starts empty, so configured token holders get accounts
/// up front. Development convenience only.
async fn seed_users(
    store: &MemoryStore,
    tokens: &[config::TokenEntry],
) -> Result<(), StorageError> {
    for entry in tokens {
        store
            .create_user(&NewUser {
                user_id: entry.user_id.clone(),
                username: entry.user_id.clone(),
                display_name: None,
            })
            .await?;
        info!(user = %entry.user_id, "seeded development user");
    }
    Ok(())
}
