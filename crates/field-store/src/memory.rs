use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::{FieldKey, FieldRecord, FieldStore, StoreError};

/// In-memory adapter for tests and single-node deployments.
#[derive(Default)]
pub struct InMemoryFieldStore {
    rows: Mutex<HashMap<FieldKey, FieldRecord>>,
}

impl InMemoryFieldStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl FieldStore for InMemoryFieldStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn load(&self, key: &FieldKey) -> Result<Option<FieldRecord>, StoreError> {
        Ok(self.rows.lock().await.get(key).cloned())
    }

    async fn compare_and_swap(
        &self,
        expected_revision: Option<u64>,
        next: &FieldRecord,
    ) -> Result<bool, StoreError> {
        let mut guard = self.rows.lock().await;
        let key = next.key();
        let current = guard.get(&key).map(|row| row.revision);
        if current != expected_revision {
            return Ok(false);
        }
        guard.insert(key, next.clone());
        Ok(true)
    }

    async fn session_rows(&self, session_code: &str) -> Result<Vec<FieldRecord>, StoreError> {
        let guard = self.rows.lock().await;
        let mut rows: Vec<FieldRecord> = guard
            .values()
            .filter(|row| row.session_code == session_code)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.field_id.cmp(&b.field_id));
        Ok(rows)
    }

    async fn changed_since(
        &self,
        session_code: &str,
        since_ms: u64,
    ) -> Result<Vec<FieldRecord>, StoreError> {
        let guard = self.rows.lock().await;
        let mut rows: Vec<FieldRecord> = guard
            .values()
            .filter(|row| row.session_code == session_code && row.updated_at_ms >= since_ms)
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            a.updated_at_ms
                .cmp(&b.updated_at_ms)
                .then_with(|| a.field_id.cmp(&b.field_id))
        });
        Ok(rows)
    }
}
