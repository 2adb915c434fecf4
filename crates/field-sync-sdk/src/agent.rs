use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use field_sync_proto::{FieldLockInfo, FieldUpdates, LockRequest, UpdateRequest};
use rand::distributions::Alphanumeric;
use rand::Rng;
use thiserror::Error;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, warn};

use crate::poller::{self, PollerConfig, PollerHandle};
use crate::{ClientError, FieldSyncApi};

/// Where one field sits in the local edit cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FieldPhase {
    #[default]
    View,
    RequestingLock,
    Editing,
    Saving,
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("field is locked by another user: {0}")]
    Locked(String),
    #[error("write rejected: {0}")]
    WriteRejected(String),
    #[error("field {field} is in {actual:?}, expected {expected:?}")]
    InvalidState {
        field: String,
        actual: FieldPhase,
        expected: FieldPhase,
    },
    #[error(transparent)]
    Transport(#[from] ClientError),
}

/// Snapshot of one field as a UI would render it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldView {
    pub phase: FieldPhase,
    /// The local draft while editing, otherwise the last server value.
    pub value: String,
    pub committed: String,
    pub lock: Option<FieldLockInfo>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default)]
struct FieldSlot {
    phase: FieldPhase,
    committed: String,
    draft: String,
    lock: Option<FieldLockInfo>,
    error: Option<String>,
}

impl FieldSlot {
    fn view(&self) -> FieldView {
        let value = match self.phase {
            FieldPhase::Editing | FieldPhase::Saving => self.draft.clone(),
            FieldPhase::View | FieldPhase::RequestingLock => self.committed.clone(),
        };
        FieldView {
            phase: self.phase,
            value,
            committed: self.committed.clone(),
            lock: self.lock.clone(),
            error: self.error.clone(),
        }
    }
}

#[derive(Debug, Default)]
struct SyncState {
    fields: HashMap<String, FieldSlot>,
    watermark: u64,
}

struct SyncInner<A> {
    api: A,
    session_code: String,
    client_id: String,
    state: Mutex<SyncState>,
    nudge: Notify,
}

/// Per-session client agent: one edit state machine per field and one
/// shared watermark for the delta feed.
pub struct SessionSync<A> {
    inner: Arc<SyncInner<A>>,
}

impl<A> Clone for SessionSync<A> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// `user_<unix millis>_<9 random chars>`, stable for the agent's lifetime.
pub fn generate_client_id() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(9)
        .map(|c| char::from(c).to_ascii_lowercase())
        .collect();
    format!("user_{millis}_{suffix}")
}

fn expect_phase(
    field_id: &str,
    slot: &FieldSlot,
    expected: FieldPhase,
) -> Result<(), SyncError> {
    if slot.phase == expected {
        Ok(())
    } else {
        Err(SyncError::InvalidState {
            field: field_id.to_string(),
            actual: slot.phase,
            expected,
        })
    }
}

impl<A: FieldSyncApi + 'static> SessionSync<A> {
    pub fn new(api: A, session_code: impl Into<String>) -> Self {
        Self::with_client_id(api, session_code, generate_client_id())
    }

    pub fn with_client_id(
        api: A,
        session_code: impl Into<String>,
        client_id: impl Into<String>,
    ) -> Self {
        Self {
            inner: Arc::new(SyncInner {
                api,
                session_code: session_code.into(),
                client_id: client_id.into(),
                state: Mutex::new(SyncState::default()),
                nudge: Notify::new(),
            }),
        }
    }

    pub fn session_code(&self) -> &str {
        &self.inner.session_code
    }

    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    pub fn api(&self) -> &A {
        &self.inner.api
    }

    pub async fn watermark(&self) -> u64 {
        self.inner.state.lock().await.watermark
    }

    pub async fn field(&self, field_id: &str) -> FieldView {
        let state = self.inner.state.lock().await;
        state
            .fields
            .get(field_id)
            .map(FieldSlot::view)
            .unwrap_or_default()
    }

    pub async fn is_locked_by_other(&self, field_id: &str) -> bool {
        let state = self.inner.state.lock().await;
        state
            .fields
            .get(field_id)
            .and_then(|slot| slot.lock.as_ref())
            .and_then(|lock| lock.locked_by.as_deref())
            .is_some_and(|holder| holder != self.inner.client_id)
    }

    pub async fn is_locked_by_me(&self, field_id: &str) -> bool {
        let state = self.inner.state.lock().await;
        state
            .fields
            .get(field_id)
            .and_then(|slot| slot.lock.as_ref())
            .and_then(|lock| lock.locked_by.as_deref())
            .is_some_and(|holder| holder == self.inner.client_id)
    }

    fn lock_request(&self, field_id: &str) -> LockRequest {
        LockRequest::new(
            self.inner.session_code.as_str(),
            field_id,
            self.inner.client_id.as_str(),
        )
    }

    /// VIEW -> REQUESTING_LOCK -> EDITING, or back to VIEW when the lease is
    /// denied or the request never reached the server.
    pub async fn begin_edit(&self, field_id: &str) -> Result<(), SyncError> {
        {
            let mut state = self.inner.state.lock().await;
            let slot = state.fields.entry(field_id.to_string()).or_default();
            expect_phase(field_id, slot, FieldPhase::View)?;
            slot.phase = FieldPhase::RequestingLock;
        }

        let result = self.inner.api.lock(&self.lock_request(field_id)).await;

        let mut state = self.inner.state.lock().await;
        let slot = state.fields.entry(field_id.to_string()).or_default();
        match result {
            Ok(ack) if ack.success => {
                slot.phase = FieldPhase::Editing;
                slot.draft = slot.committed.clone();
                slot.error = None;
                let user_id = slot
                    .lock
                    .as_ref()
                    .map(|lock| lock.user_id.clone())
                    .unwrap_or_default();
                slot.lock = Some(FieldLockInfo {
                    locked_by: Some(self.inner.client_id.clone()),
                    locked_at: None,
                    user_id,
                });
                debug!(field = %field_id, "field lock granted");
                Ok(())
            }
            Ok(ack) => {
                slot.phase = FieldPhase::View;
                Err(SyncError::Locked(ack.message))
            }
            Err(err) => {
                slot.phase = FieldPhase::View;
                warn!(field = %field_id, error = %err, "lock request failed");
                Err(err.into())
            }
        }
    }

    pub async fn set_draft(&self, field_id: &str, text: impl Into<String>) -> Result<(), SyncError> {
        let mut state = self.inner.state.lock().await;
        let slot = state.fields.entry(field_id.to_string()).or_default();
        expect_phase(field_id, slot, FieldPhase::Editing)?;
        slot.draft = text.into();
        Ok(())
    }

    /// EDITING -> SAVING -> VIEW. A failed write leaves the field in EDITING
    /// with the draft intact and the error attached.
    pub async fn save(&self, field_id: &str) -> Result<(), SyncError> {
        let value = {
            let mut state = self.inner.state.lock().await;
            let slot = state.fields.entry(field_id.to_string()).or_default();
            expect_phase(field_id, slot, FieldPhase::Editing)?;
            slot.phase = FieldPhase::Saving;
            slot.draft.clone()
        };

        let req = UpdateRequest::new(
            self.inner.session_code.as_str(),
            field_id,
            value.as_str(),
            self.inner.client_id.as_str(),
        );
        let result = self.inner.api.update(&req).await;

        let failure = match result {
            Ok(ack) if ack.success => None,
            Ok(ack) => Some(SyncError::WriteRejected(ack.message)),
            Err(err) => Some(SyncError::Transport(err)),
        };
        if let Some(err) = failure {
            let mut state = self.inner.state.lock().await;
            let slot = state.fields.entry(field_id.to_string()).or_default();
            slot.phase = FieldPhase::Editing;
            slot.error = Some(err.to_string());
            warn!(field = %field_id, error = %err, "field save failed");
            return Err(err);
        }

        self.release(field_id).await;

        {
            let mut state = self.inner.state.lock().await;
            let slot = state.fields.entry(field_id.to_string()).or_default();
            slot.phase = FieldPhase::View;
            slot.committed = value;
            slot.draft.clear();
            slot.error = None;
            slot.lock = Some(FieldLockInfo {
                locked_by: None,
                locked_at: None,
                user_id: self.inner.client_id.clone(),
            });
        }
        self.inner.nudge.notify_one();
        Ok(())
    }

    /// EDITING -> VIEW, discarding the draft.
    pub async fn cancel(&self, field_id: &str) -> Result<(), SyncError> {
        {
            let mut state = self.inner.state.lock().await;
            let slot = state.fields.entry(field_id.to_string()).or_default();
            expect_phase(field_id, slot, FieldPhase::Editing)?;
            slot.phase = FieldPhase::View;
            slot.draft.clear();
            slot.error = None;
            if let Some(lock) = slot.lock.as_mut() {
                lock.locked_by = None;
                lock.locked_at = None;
            }
        }
        self.release(field_id).await;
        Ok(())
    }

    /// Fire-and-forget unlock; the lease TTL covers a lost request.
    async fn release(&self, field_id: &str) {
        if let Err(err) = self.inner.api.unlock(&self.lock_request(field_id)).await {
            warn!(field = %field_id, error = %err, "unlock request failed");
        }
    }

    /// Releases every field this agent holds a lease on. Meant for
    /// shutdown; drafts are dropped.
    pub async fn release_all(&self) -> usize {
        let held: Vec<String> = {
            let mut state = self.inner.state.lock().await;
            state
                .fields
                .iter_mut()
                .filter(|(_, slot)| matches!(slot.phase, FieldPhase::Editing | FieldPhase::Saving))
                .map(|(field_id, slot)| {
                    slot.phase = FieldPhase::View;
                    slot.draft.clear();
                    slot.lock = None;
                    field_id.clone()
                })
                .collect()
        };
        for field_id in &held {
            self.release(field_id).await;
        }
        held.len()
    }

    /// Merges one delta. Fields the user is working on keep their local
    /// state; the watermark advances regardless.
    pub async fn apply_updates(&self, updates: FieldUpdates) -> usize {
        let mut state = self.inner.state.lock().await;
        let mut merged = 0;
        let FieldUpdates {
            fields,
            mut values,
            last_update,
            ..
        } = updates;
        for (field_id, info) in fields {
            let slot = state.fields.entry(field_id.clone()).or_default();
            if slot.phase != FieldPhase::View {
                continue;
            }
            if let Some(value) = values.remove(&field_id) {
                slot.committed = value;
            }
            slot.lock = Some(info);
            merged += 1;
        }
        state.watermark = state.watermark.max(last_update);
        merged
    }

    /// One round trip to the delta feed. Returns how many fields the server
    /// reported as changed.
    pub async fn poll_once(&self) -> Result<usize, ClientError> {
        let since = self.watermark().await;
        let updates = self
            .inner
            .api
            .updates(&self.inner.session_code, since)
            .await?;
        let changed = updates.fields.len();
        self.apply_updates(updates).await;
        Ok(changed)
    }

    /// Wakes the poller so it polls now instead of after its current delay.
    pub fn nudge(&self) {
        self.inner.nudge.notify_one();
    }

    pub(crate) async fn nudged(&self) {
        self.inner.nudge.notified().await
    }

    pub fn spawn_poller(&self, config: PollerConfig) -> PollerHandle {
        poller::spawn(self.clone(), config)
    }
}
