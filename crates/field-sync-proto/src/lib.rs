//! Wire definitions for the collaborative field lock API.
//! Shared by the server routes and the client SDK so both sides agree on
//! field names without pulling in the runtime of either.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lease lifetime used when nothing else is configured.
pub const DEFAULT_LOCK_TTL_MS: u64 = 30_000;

pub const MSG_FIELD_LOCKED: &str = "Field locked";
pub const MSG_LOCKED_BY_OTHER: &str = "Field is locked by another user";
pub const MSG_LOCK_FAILED: &str = "Failed to lock field";
pub const MSG_FIELD_UNLOCKED: &str = "Field unlocked";
pub const MSG_UNLOCK_DESPITE_ERROR: &str = "Unlock attempted despite error";
pub const MSG_FIELD_UPDATED: &str = "Field updated";
pub const MSG_UPDATE_FAILED: &str = "Failed to update field";
pub const MSG_MISSING_FIELDS: &str = "Missing required fields";

/// Body of `POST /fields/lock` and `POST /fields/unlock`.
///
/// Every member is optional on the wire so that a client omitting one gets
/// the protocol's 400 answer instead of a deserializer rejection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

impl LockRequest {
    pub fn new(
        session_code: impl Into<String>,
        field_id: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            session_code: Some(session_code.into()),
            field_id: Some(field_id.into()),
            user_id: Some(user_id.into()),
        }
    }

    /// Returns `(session_code, field_id, user_id)` when all three are present
    /// and non-blank.
    pub fn required(&self) -> Option<(&str, &str, &str)> {
        Some((
            non_blank(&self.session_code)?,
            non_blank(&self.field_id)?,
            non_blank(&self.user_id)?,
        ))
    }
}

/// Body of `POST /fields/update`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

impl UpdateRequest {
    pub fn new(
        session_code: impl Into<String>,
        field_id: impl Into<String>,
        value: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            session_code: Some(session_code.into()),
            field_id: Some(field_id.into()),
            value: Some(value.into()),
            user_id: Some(user_id.into()),
        }
    }

    pub fn required(&self) -> Option<(&str, &str, &str)> {
        Some((
            non_blank(&self.session_code)?,
            non_blank(&self.field_id)?,
            non_blank(&self.user_id)?,
        ))
    }
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.trim().is_empty())
}

/// Answer of the lock, unlock and update calls. Contention is reported with
/// `success = false`, never with an error status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldAck {
    pub success: bool,
    pub message: String,
}

impl FieldAck {
    pub fn ok(message: &str) -> Self {
        Self {
            success: true,
            message: message.to_string(),
        }
    }

    pub fn rejected(message: &str) -> Self {
        Self {
            success: false,
            message: message.to_string(),
        }
    }
}

/// Lock information for one field as seen by the delta feed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldLockInfo {
    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    /// Last writer of the value.
    pub user_id: String,
}

/// Answer of `GET /fields/{sessionCode}/updates`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldUpdates {
    #[serde(default)]
    pub fields: BTreeMap<String, FieldLockInfo>,
    #[serde(default)]
    pub values: BTreeMap<String, String>,
    /// Cursor to pass as `since` on the next poll.
    pub last_update: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl FieldUpdates {
    pub fn empty(since: u64) -> Self {
        Self {
            last_update: since,
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty() && self.values.is_empty()
    }
}

/// Parses the `since` query value. Accepts plain unix millis and the legacy
/// `"<millis>:<seq>"` form; anything else reads as 0.
pub fn parse_since(raw: Option<&str>) -> u64 {
    raw.and_then(|s| s.split(':').next())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn lock_request_requires_all_members() {
        let full: LockRequest = serde_json::from_value(json!({
            "sessionCode": "ABC123",
            "fieldId": "activityName",
            "userId": "user-a"
        }))
        .unwrap();
        assert_eq!(full.required(), Some(("ABC123", "activityName", "user-a")));

        let missing: LockRequest =
            serde_json::from_value(json!({ "sessionCode": "ABC123", "fieldId": "x" })).unwrap();
        assert_eq!(missing.required(), None);

        let blank: LockRequest = serde_json::from_value(json!({
            "sessionCode": "ABC123",
            "fieldId": "  ",
            "userId": "user-a"
        }))
        .unwrap();
        assert_eq!(blank.required(), None);
    }

    #[test]
    fn update_request_tolerates_missing_value() {
        let req: UpdateRequest = serde_json::from_value(json!({
            "sessionCode": "ABC123",
            "fieldId": "activityName",
            "userId": "user-a"
        }))
        .unwrap();
        assert!(req.required().is_some());
        assert_eq!(req.value, None);
    }

    #[test]
    fn updates_serialize_camel_case() {
        let mut updates = FieldUpdates::empty(10);
        updates.fields.insert(
            "activityName".into(),
            FieldLockInfo {
                locked_by: Some("user-a".into()),
                locked_at: None,
                user_id: "user-a".into(),
            },
        );
        let value = serde_json::to_value(&updates).unwrap();
        assert_eq!(value["lastUpdate"], 10);
        assert_eq!(value["fields"]["activityName"]["lockedBy"], "user-a");
        assert!(value.get("timestamp").is_none());
    }

    #[test]
    fn since_parsing() {
        assert_eq!(parse_since(None), 0);
        assert_eq!(parse_since(Some("1700000000000")), 1_700_000_000_000);
        assert_eq!(parse_since(Some("1700:1")), 1700);
        assert_eq!(parse_since(Some("garbage")), 0);
        assert_eq!(parse_since(Some("-5")), 0);
    }
}
