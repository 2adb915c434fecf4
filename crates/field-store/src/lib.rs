//! Row storage for collaboratively edited session fields.
//!
//! The only coordination primitive is an atomic compare-and-swap on a single
//! row, keyed by its revision. Lease and value rules live in the server and
//! are expressed as [`update_row`] decisions on top of this trait, so any
//! backend that can do a per-row CAS and an ordered range scan qualifies.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::trace;

pub mod clock;
pub mod memory;

pub use clock::{Clock, ManualClock, SystemClock};
pub use memory::InMemoryFieldStore;

/// Upper bound on optimistic retries before a row update gives up.
pub const MAX_CAS_ATTEMPTS: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FieldKey {
    pub session_code: String,
    pub field_id: String,
}

impl FieldKey {
    pub fn new(session_code: impl Into<String>, field_id: impl Into<String>) -> Self {
        Self {
            session_code: session_code.into(),
            field_id: field_id.into(),
        }
    }
}

impl fmt::Display for FieldKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.session_code, self.field_id)
    }
}

/// Persisted state of one field. `locked_by` and `lease_at_ms` are either
/// both set or both empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldRecord {
    pub session_code: String,
    pub field_id: String,
    pub value: String,
    pub locked_by: Option<String>,
    pub lease_at_ms: Option<u64>,
    pub updated_at_ms: u64,
    pub owner_user_id: String,
    pub revision: u64,
}

impl FieldRecord {
    /// Fresh row with an empty value. The revision is assigned on write.
    pub fn new(key: &FieldKey, owner_user_id: &str, now_ms: u64) -> Self {
        Self {
            session_code: key.session_code.clone(),
            field_id: key.field_id.clone(),
            value: String::new(),
            locked_by: None,
            lease_at_ms: None,
            updated_at_ms: now_ms,
            owner_user_id: owner_user_id.to_string(),
            revision: 0,
        }
    }

    pub fn key(&self) -> FieldKey {
        FieldKey::new(self.session_code.clone(), self.field_id.clone())
    }

    pub fn lease_age_ms(&self, now_ms: u64) -> Option<u64> {
        self.lease_at_ms.map(|at| now_ms.saturating_sub(at))
    }

    /// Holder of a lease that is still inside its TTL.
    pub fn live_holder(&self, now_ms: u64, ttl_ms: u64) -> Option<&str> {
        match (self.locked_by.as_deref(), self.lease_age_ms(now_ms)) {
            (Some(holder), Some(age)) if age < ttl_ms => Some(holder),
            _ => None,
        }
    }

    pub fn lease_expired(&self, now_ms: u64, ttl_ms: u64) -> bool {
        self.lease_age_ms(now_ms).is_some_and(|age| age >= ttl_ms)
    }

    pub fn with_lease(mut self, holder: &str, now_ms: u64) -> Self {
        self.locked_by = Some(holder.to_string());
        self.lease_at_ms = Some(now_ms);
        self
    }

    pub fn without_lease(mut self) -> Self {
        self.locked_by = None;
        self.lease_at_ms = None;
        self
    }

    pub fn touched(mut self, now_ms: u64) -> Self {
        self.updated_at_ms = self.updated_at_ms.max(now_ms);
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store error: {0}")]
    Backend(String),
    #[error("row {0} kept changing during update")]
    Contention(String),
    #[error("corrupt row {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

#[async_trait]
pub trait FieldStore: Send + Sync {
    /// Short backend name for logs and readiness output.
    fn backend(&self) -> &'static str;

    async fn load(&self, key: &FieldKey) -> Result<Option<FieldRecord>, StoreError>;

    /// Atomically replace the row identified by `next` iff its stored revision
    /// equals `expected_revision` (`None`: the row must not exist yet).
    /// Returns `false` without writing when another writer got there first.
    async fn compare_and_swap(
        &self,
        expected_revision: Option<u64>,
        next: &FieldRecord,
    ) -> Result<bool, StoreError>;

    async fn session_rows(&self, session_code: &str) -> Result<Vec<FieldRecord>, StoreError>;

    /// Rows with `updated_at_ms >= since_ms`, oldest first.
    async fn changed_since(
        &self,
        session_code: &str,
        since_ms: u64,
    ) -> Result<Vec<FieldRecord>, StoreError>;

    /// Rows currently carrying a lease, expired or not. Defaults to filtering
    /// the whole session; backends can override with an indexed lookup.
    async fn leased_rows(&self, session_code: &str) -> Result<Vec<FieldRecord>, StoreError> {
        let rows = self.session_rows(session_code).await?;
        Ok(rows.into_iter().filter(|r| r.locked_by.is_some()).collect())
    }
}

/// Outcome of [`update_row`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowUpdate {
    pub previous: Option<FieldRecord>,
    pub current: Option<FieldRecord>,
    pub applied: bool,
}

/// Read-decide-write on one row as a single atomic unit.
///
/// `decide` sees the current row (if any) and returns the row to store, or
/// `None` to leave it untouched. On a CAS conflict the row is re-read and
/// `decide` runs again. The revision is assigned here and `updated_at_ms`
/// never moves backwards.
pub async fn update_row<F>(
    store: &dyn FieldStore,
    key: &FieldKey,
    mut decide: F,
) -> Result<RowUpdate, StoreError>
where
    F: FnMut(Option<&FieldRecord>) -> Option<FieldRecord> + Send,
{
    for attempt in 1..=MAX_CAS_ATTEMPTS {
        let previous = store.load(key).await?;
        let Some(mut next) = decide(previous.as_ref()) else {
            return Ok(RowUpdate {
                current: previous.clone(),
                previous,
                applied: false,
            });
        };
        let expected = previous.as_ref().map(|p| p.revision);
        next.session_code = key.session_code.clone();
        next.field_id = key.field_id.clone();
        next.revision = expected.map_or(1, |rev| rev + 1);
        if let Some(prev) = &previous {
            next.updated_at_ms = next.updated_at_ms.max(prev.updated_at_ms);
        }
        if store.compare_and_swap(expected, &next).await? {
            return Ok(RowUpdate {
                previous,
                current: Some(next),
                applied: true,
            });
        }
        trace!(%key, attempt, "field row changed underneath; retrying");
    }
    Err(StoreError::Contention(key.to_string()))
}
