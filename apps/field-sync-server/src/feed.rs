use std::sync::Arc;

use chrono::{DateTime, Utc};
use field_store::{Clock, FieldRecord, FieldStore, StoreError};
use field_sync_proto::{FieldLockInfo, FieldUpdates};

use crate::lease::LeaseManager;
use crate::metrics;

/// Pull-based change feed keyed by an `updated_at` watermark. Each poll also
/// sweeps expired leases of the session, so idle clients still contribute
/// to lease reclamation.
#[derive(Clone)]
pub struct DeltaFeed {
    store: Arc<dyn FieldStore>,
    clock: Arc<dyn Clock>,
    leases: LeaseManager,
}

impl DeltaFeed {
    pub fn new(store: Arc<dyn FieldStore>, clock: Arc<dyn Clock>, leases: LeaseManager) -> Self {
        Self {
            store,
            clock,
            leases,
        }
    }

    /// Returns every row of the session with `updated_at >= since`.
    ///
    /// `last_update` is the cursor for the next call: one past the newest
    /// returned row, or `since` itself when nothing changed. The cursor never
    /// passes the current millisecond, so a row written later in the same
    /// millisecond is still picked up by the next poll.
    pub async fn poll(&self, session_code: &str, since: u64) -> Result<FieldUpdates, StoreError> {
        self.leases.sweep_expired(session_code).await?;
        let rows = self.store.changed_since(session_code, since).await?;
        metrics::POLLS.inc();
        metrics::DELTA_ROWS.inc_by(rows.len() as u64);
        Ok(build_updates(rows, since, self.clock.now_ms()))
    }
}

fn build_updates(rows: Vec<FieldRecord>, since: u64, now_ms: u64) -> FieldUpdates {
    let mut updates = FieldUpdates::empty(since);
    updates.timestamp = millis_to_datetime(now_ms);
    for row in rows {
        let cursor = row.updated_at_ms.saturating_add(1).min(now_ms);
        updates.last_update = updates.last_update.max(cursor);
        updates.fields.insert(
            row.field_id.clone(),
            FieldLockInfo {
                locked_by: row.locked_by,
                locked_at: row.lease_at_ms.and_then(millis_to_datetime),
                user_id: row.owner_user_id,
            },
        );
        updates.values.insert(row.field_id, row.value);
    }
    updates
}

fn millis_to_datetime(ms: u64) -> Option<DateTime<Utc>> {
    i64::try_from(ms)
        .ok()
        .and_then(DateTime::<Utc>::from_timestamp_millis)
}
