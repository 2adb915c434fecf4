use std::sync::Arc;
use std::time::Instant;

use field_store::{Clock, FieldStore, SystemClock};

use crate::feed::DeltaFeed;
use crate::lease::LeaseManager;
use crate::writer::FieldValueWriter;

#[derive(Clone)]
pub struct AppState {
    start: Instant,
    backend: &'static str,
    leases: LeaseManager,
    writer: FieldValueWriter,
    feed: DeltaFeed,
}

impl AppState {
    pub fn new(store: Arc<dyn FieldStore>, ttl_ms: u64) -> Self {
        Self::with_clock(store, Arc::new(SystemClock), ttl_ms)
    }

    pub fn with_clock(store: Arc<dyn FieldStore>, clock: Arc<dyn Clock>, ttl_ms: u64) -> Self {
        let leases = LeaseManager::new(store.clone(), clock.clone(), ttl_ms);
        Self {
            start: Instant::now(),
            backend: store.backend(),
            writer: FieldValueWriter::new(store.clone(), clock.clone(), ttl_ms),
            feed: DeltaFeed::new(store, clock, leases.clone()),
            leases,
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start.elapsed().as_secs()
    }

    pub fn backend(&self) -> &'static str {
        self.backend
    }

    pub fn leases(&self) -> &LeaseManager {
        &self.leases
    }

    pub fn writer(&self) -> &FieldValueWriter {
        &self.writer
    }

    pub fn feed(&self) -> &DeltaFeed {
        &self.feed
    }
}
