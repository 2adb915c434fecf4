//! Lease Manager: acquire/release/steal-on-expiry over the field row store.
//!
//! A lease is live while `now - lease_at < ttl`. There is no renewal call;
//! a holder keeps the field only until somebody else asks after the TTL.
//! Expired leases are cleared lazily by [`LeaseManager::sweep_expired`],
//! which every acquire and every delta poll runs first.

use std::sync::Arc;

use field_store::{update_row, Clock, FieldKey, FieldRecord, FieldStore, StoreError};
use tracing::debug;

use crate::metrics;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseDecision {
    Granted {
        /// The caller already held the lease; its timestamp was refreshed.
        reentered: bool,
        /// Holder of the expired lease that was taken over, if any.
        reclaimed_from: Option<String>,
    },
    Denied {
        holder: String,
    },
}

impl LeaseDecision {
    pub fn granted(&self) -> bool {
        matches!(self, LeaseDecision::Granted { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released,
    /// The caller did not hold the lease; nothing changed.
    NotHolder,
}

#[derive(Clone)]
pub struct LeaseManager {
    store: Arc<dyn FieldStore>,
    clock: Arc<dyn Clock>,
    ttl_ms: u64,
}

impl LeaseManager {
    pub fn new(store: Arc<dyn FieldStore>, clock: Arc<dyn Clock>, ttl_ms: u64) -> Self {
        Self {
            store,
            clock,
            ttl_ms,
        }
    }

    pub fn ttl_ms(&self) -> u64 {
        self.ttl_ms
    }

    /// Clears every lease of the session whose age reached the TTL. Each row
    /// is re-checked inside its own CAS, so a lease refreshed in between is
    /// left alone. Returns the number of leases cleared.
    ///
    /// Cleared rows are stamped one millisecond before `now`. A feed cursor
    /// issued at `now` is at most `now`, so the stamp stays visible to any
    /// cursor issued before the sweep and behind the one issued with it.
    pub async fn sweep_expired(&self, session_code: &str) -> Result<usize, StoreError> {
        let now = self.clock.now_ms();
        let stamp = now.saturating_sub(1);
        let ttl = self.ttl_ms;
        let leased = self.store.leased_rows(session_code).await?;
        let mut reclaimed = 0;
        for row in leased.iter().filter(|row| row.lease_expired(now, ttl)) {
            let outcome = update_row(self.store.as_ref(), &row.key(), |current| {
                let current = current?;
                current
                    .lease_expired(now, ttl)
                    .then(|| current.clone().without_lease().touched(stamp))
            })
            .await?;
            if outcome.applied {
                reclaimed += 1;
                debug!(
                    session = %session_code,
                    field = %row.field_id,
                    holder = ?row.locked_by,
                    "cleared expired field lease"
                );
            }
        }
        if reclaimed > 0 {
            metrics::LEASES_RECLAIMED.inc_by(reclaimed as u64);
        }
        Ok(reclaimed)
    }

    pub async fn acquire(
        &self,
        key: &FieldKey,
        client_id: &str,
    ) -> Result<LeaseDecision, StoreError> {
        self.sweep_expired(&key.session_code).await?;

        let now = self.clock.now_ms();
        let ttl = self.ttl_ms;
        let outcome = update_row(self.store.as_ref(), key, |row| match row {
            None => Some(FieldRecord::new(key, client_id, now).with_lease(client_id, now)),
            Some(row) => match row.live_holder(now, ttl) {
                Some(holder) if holder != client_id => None,
                _ => Some(row.clone().with_lease(client_id, now).touched(now)),
            },
        })
        .await?;

        if !outcome.applied {
            let holder = outcome
                .current
                .and_then(|row| row.locked_by)
                .unwrap_or_default();
            debug!(field = %key, client = %client_id, %holder, "field lease denied");
            return Ok(LeaseDecision::Denied { holder });
        }

        let previous_holder = outcome.previous.and_then(|row| row.locked_by);
        let reentered = previous_holder.as_deref() == Some(client_id);
        let reclaimed_from = previous_holder.filter(|holder| holder != client_id);
        debug!(
            field = %key,
            client = %client_id,
            reentered,
            reclaimed_from = ?reclaimed_from,
            "field lease granted"
        );
        Ok(LeaseDecision::Granted {
            reentered,
            reclaimed_from,
        })
    }

    pub async fn release(
        &self,
        key: &FieldKey,
        client_id: &str,
    ) -> Result<ReleaseOutcome, StoreError> {
        let now = self.clock.now_ms();
        let outcome = update_row(self.store.as_ref(), key, |row| {
            let row = row?;
            (row.locked_by.as_deref() == Some(client_id))
                .then(|| row.clone().without_lease().touched(now))
        })
        .await?;
        if outcome.applied {
            debug!(field = %key, client = %client_id, "field lease released");
            Ok(ReleaseOutcome::Released)
        } else {
            Ok(ReleaseOutcome::NotHolder)
        }
    }
}
