use std::net::SocketAddr;

use anyhow::{bail, Result};
use field_sync_proto::DEFAULT_LOCK_TTL_MS;

use crate::telemetry::DEFAULT_LOG_FILTER;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub log_filter: String,
    pub store_backend: StoreBackend,
    pub redis_url: Option<String>,
    pub database_url: Option<String>,
    pub lock_ttl_ms: u64,
}

/// `RUST_LOG`, or the crate default when unset.
pub fn log_filter_from_env() -> String {
    std::env::var("RUST_LOG").unwrap_or_else(|_| DEFAULT_LOG_FILTER.into())
}

impl AppConfig {
    /// Fails on an unrecognised `FIELD_STORE_BACKEND`.
    pub fn from_env() -> Result<Self> {
        let bind_addr: SocketAddr = std::env::var("FIELD_SYNC_ADDR")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 8090)));
        let log_filter = log_filter_from_env();
        let store_backend = StoreBackend::from_env()?;
        let redis_url = std::env::var("REDIS_URL").ok();
        let database_url = std::env::var("DATABASE_URL").ok();
        let lock_ttl_ms = std::env::var("FIELD_LOCK_TTL_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|ttl: &u64| *ttl > 0)
            .unwrap_or(DEFAULT_LOCK_TTL_MS);
        Ok(Self {
            bind_addr,
            log_filter,
            store_backend,
            redis_url,
            database_url,
            lock_ttl_ms,
        })
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8090)),
            log_filter: "info".into(),
            store_backend: StoreBackend::InMemory,
            redis_url: None,
            database_url: None,
            lock_ttl_ms: DEFAULT_LOCK_TTL_MS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    InMemory,
    Redis,
    Postgres,
}

impl StoreBackend {
    fn from_env() -> Result<Self> {
        match std::env::var("FIELD_STORE_BACKEND") {
            Ok(raw) => Self::parse(&raw),
            Err(_) => Ok(StoreBackend::InMemory),
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "memory" | "in-memory" | "inmemory" => Ok(StoreBackend::InMemory),
            "redis" => Ok(StoreBackend::Redis),
            "postgres" | "pg" => Ok(StoreBackend::Postgres),
            other => bail!("unknown FIELD_STORE_BACKEND {other:?} (expected memory, redis or postgres)"),
        }
    }
}
