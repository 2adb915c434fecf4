use std::sync::Arc;

use field_store::{update_row, Clock, FieldKey, FieldRecord, FieldStore, StoreError};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    Written { updated_at_ms: u64 },
    Denied { holder: String },
}

/// Upserts field values. Lock ownership is checked again on every write,
/// independently of any earlier acquire, and the writer's lease is kept.
#[derive(Clone)]
pub struct FieldValueWriter {
    store: Arc<dyn FieldStore>,
    clock: Arc<dyn Clock>,
    ttl_ms: u64,
}

impl FieldValueWriter {
    pub fn new(store: Arc<dyn FieldStore>, clock: Arc<dyn Clock>, ttl_ms: u64) -> Self {
        Self {
            store,
            clock,
            ttl_ms,
        }
    }

    pub async fn write(
        &self,
        key: &FieldKey,
        value: &str,
        client_id: &str,
    ) -> Result<WriteOutcome, StoreError> {
        let now = self.clock.now_ms();
        let ttl = self.ttl_ms;
        let outcome = update_row(self.store.as_ref(), key, |row| {
            let mut next = match row {
                None => FieldRecord::new(key, client_id, now),
                Some(row) => {
                    if row.live_holder(now, ttl).is_some_and(|h| h != client_id) {
                        return None;
                    }
                    if row.lease_expired(now, ttl) {
                        row.clone().without_lease()
                    } else {
                        row.clone()
                    }
                }
            };
            next.value = value.to_string();
            next.owner_user_id = client_id.to_string();
            Some(next.touched(now))
        })
        .await?;

        match outcome.current {
            Some(row) if outcome.applied => {
                debug!(
                    field = %key,
                    client = %client_id,
                    bytes = value.len(),
                    "field value written"
                );
                Ok(WriteOutcome::Written {
                    updated_at_ms: row.updated_at_ms,
                })
            }
            current => Ok(WriteOutcome::Denied {
                holder: current.and_then(|row| row.locked_by).unwrap_or_default(),
            }),
        }
    }
}
