//! The shared-state record mirrored onto external backends.
//!
//! Distributed tools coordinate through this record. Depending on the
//! backend's capabilities it is stored as a single JSON custom field,
//! as multiple typed fields, or inside a marker comment -- the contract
//! is identical in all three modes: a reader reconstructs the same
//! record whichever storage the writer used.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Marker prefixing shared-state comments so readers can find the
/// latest one.
pub const COMMENT_MARKER: &str = "<!-- bosun:shared-state -->";

/// How a backend stores the shared-state record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SharedStateMode {
    /// One JSON custom field.
    #[default]
    Json,
    /// Multiple typed custom fields.
    Fields,
    /// Marker comment plus labels only.
    Comments,
}

/// Per-task coordination record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SharedState {
    #[serde(default)]
    pub owner_id: Option<String>,
    #[serde(default)]
    pub attempt_token: Option<Uuid>,
    #[serde(default)]
    pub attempt_started: Option<DateTime<Utc>>,
    #[serde(default)]
    pub heartbeat: Option<DateTime<Utc>>,
    #[serde(default)]
    pub retry_count: i64,
    #[serde(default)]
    pub ignore_reason: Option<String>,
}

impl SharedState {
    // ---- single JSON field mode ----

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("shared state serializes")
    }

    pub fn from_json(raw: &str) -> Option<Self> {
        serde_json::from_str(raw).ok()
    }

    // ---- multiple typed fields mode ----

    /// Flatten into field-name -> string-value pairs. Unset fields are
    /// omitted so typed backends can clear them.
    pub fn to_fields(&self) -> HashMap<String, String> {
        let mut fields = HashMap::new();
        if let Some(owner) = &self.owner_id {
            fields.insert("ownerId".to_string(), owner.clone());
        }
        if let Some(token) = self.attempt_token {
            fields.insert("attemptToken".to_string(), token.to_string());
        }
        if let Some(started) = self.attempt_started {
            fields.insert("attemptStarted".to_string(), started.to_rfc3339());
        }
        if let Some(heartbeat) = self.heartbeat {
            fields.insert("heartbeat".to_string(), heartbeat.to_rfc3339());
        }
        fields.insert("retryCount".to_string(), self.retry_count.to_string());
        if let Some(reason) = &self.ignore_reason {
            fields.insert("ignoreReason".to_string(), reason.clone());
        }
        fields
    }

    /// Reconstruct from typed fields. Missing or unparseable fields
    /// fall back to their defaults rather than failing the whole read.
    pub fn from_fields(fields: &HashMap<String, String>) -> Self {
        Self {
            owner_id: fields.get("ownerId").cloned(),
            attempt_token: fields
                .get("attemptToken")
                .and_then(|t| Uuid::parse_str(t).ok()),
            attempt_started: fields
                .get("attemptStarted")
                .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
                .map(|t| t.with_timezone(&Utc)),
            heartbeat: fields
                .get("heartbeat")
                .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
                .map(|t| t.with_timezone(&Utc)),
            retry_count: fields
                .get("retryCount")
                .and_then(|c| c.parse().ok())
                .unwrap_or(0),
            ignore_reason: fields.get("ignoreReason").cloned(),
        }
    }

    // ---- comment mode ----

    /// Render as a marker comment body.
    pub fn to_comment(&self) -> String {
        format!("{COMMENT_MARKER}\n```json\n{}\n```", self.to_json())
    }

    /// Extract from a comment body previously produced by
    /// [`Self::to_comment`].
    pub fn from_comment(body: &str) -> Option<Self> {
        if !body.contains(COMMENT_MARKER) {
            return None;
        }
        let json = body
            .split("```json")
            .nth(1)?
            .split("```")
            .next()?
            .trim();
        Self::from_json(json)
    }
}
