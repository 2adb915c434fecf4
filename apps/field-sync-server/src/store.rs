use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use field_store::{FieldStore, InMemoryFieldStore};
use tracing::{info, warn};

use crate::config::{AppConfig, StoreBackend};
use crate::store_postgres::PostgresFieldStore;
use crate::store_redis::RedisFieldStore;

pub type StoreHandle = Arc<dyn FieldStore>;

/// Builds the configured backend. A shared backend that is missing its URL
/// or cannot be reached is a startup error: a process-local table would let
/// two instances grant the same field.
pub async fn build_store(cfg: &AppConfig) -> Result<StoreHandle> {
    let store: StoreHandle = match cfg.store_backend {
        StoreBackend::InMemory => {
            warn!("using the in-memory field store; locks are local to this process");
            InMemoryFieldStore::new()
        }
        StoreBackend::Redis => {
            let url = cfg
                .redis_url
                .as_deref()
                .ok_or_else(|| anyhow!("FIELD_STORE_BACKEND=redis but REDIS_URL is not set"))?;
            let store = RedisFieldStore::connect(url)
                .await
                .context("connecting the redis field store")?;
            Arc::new(store)
        }
        StoreBackend::Postgres => {
            let url = cfg.database_url.as_deref().ok_or_else(|| {
                anyhow!("FIELD_STORE_BACKEND=postgres but DATABASE_URL is not set")
            })?;
            let store = PostgresFieldStore::connect(url)
                .await
                .context("connecting the postgres field store")?;
            Arc::new(store)
        }
    };
    info!(backend = store.backend(), "field store ready");
    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_only_when_chosen() {
        let cfg = AppConfig::default();
        assert_eq!(build_store(&cfg).await.unwrap().backend(), "memory");
    }

    #[tokio::test]
    async fn shared_backend_without_url_fails_startup() {
        for (backend, var) in [
            (StoreBackend::Redis, "REDIS_URL"),
            (StoreBackend::Postgres, "DATABASE_URL"),
        ] {
            let cfg = AppConfig {
                store_backend: backend,
                ..AppConfig::default()
            };
            let err = build_store(&cfg).await.err().expect("startup should fail");
            assert!(err.to_string().contains(var), "{err}");
        }
    }
}
