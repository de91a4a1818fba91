#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use ulid::Ulid;

pub type DateTimeUtc = OffsetDateTime;

/// The fixed slot budget of a detail record (`para_1`..`para_10`).
pub const DETAIL_SLOT_COUNT: usize = 10;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Request,
    Monitor,
}

impl EntityKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Monitor => "monitor",
        }
    }
}

impl Display for EntityKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum TrackError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("{entity} {id} not found")]
    NotFound { entity: EntityKind, id: i64 },
    #[error("details already attached to {entity} {id}")]
    DetailConflict { entity: EntityKind, id: i64 },
    #[error("{entity} {id} is terminal ({status})")]
    InvalidTransition {
        entity: EntityKind,
        id: i64,
        status: String,
    },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RequestId(pub i64);

impl Display for RequestId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct MonitorId(pub i64);

impl Display for MonitorId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Open,
    Completed,
    Error,
}

impl RequestStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "open" => Some(Self::Open),
            "completed" => Some(Self::Completed),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Open)
    }
}

impl Display for RequestStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MonitorStatus {
    Open,
    Resolved,
    Failed,
    Expired,
    Cancelled,
}

impl MonitorStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Resolved => "resolved",
            Self::Failed => "failed",
            Self::Expired => "expired",
            Self::Cancelled => "cancelled",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "open" => Some(Self::Open),
            "resolved" => Some(Self::Resolved),
            "failed" => Some(Self::Failed),
            "expired" => Some(Self::Expired),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Open)
    }
}

impl Display for MonitorStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current-state row of a tracked request.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RequestRecord {
    pub request_id: RequestId,
    pub created_at: DateTimeUtc,
    pub case_id: Option<String>,
    pub order_id: i64,
    pub account_number: String,
    pub status: RequestStatus,
    pub status_changed_at: DateTimeUtc,
    pub status_description: Option<String>,
}

/// A request as handed to the store for creation; the store assigns the id.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RequestDraft {
    pub created_at: DateTimeUtc,
    pub case_id: Option<String>,
    pub order_id: i64,
    pub account_number: String,
    pub status: RequestStatus,
    pub status_changed_at: DateTimeUtc,
    pub status_description: Option<String>,
}

/// Current-state row of a case monitor.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct MonitorRecord {
    pub monitor_id: MonitorId,
    pub created_at: DateTimeUtc,
    pub case_id: String,
    pub request_id: Option<RequestId>,
    pub order_id: i64,
    pub account_number: String,
    pub status: MonitorStatus,
    pub status_changed_at: DateTimeUtc,
    pub status_description: Option<String>,
    pub last_checked_at: Option<DateTimeUtc>,
    pub next_check_at: DateTimeUtc,
    pub expire_at: DateTimeUtc,
    pub poll_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct MonitorDraft {
    pub created_at: DateTimeUtc,
    pub case_id: String,
    pub request_id: Option<RequestId>,
    pub order_id: i64,
    pub account_number: String,
    pub status: MonitorStatus,
    pub status_changed_at: DateTimeUtc,
    pub status_description: Option<String>,
    pub last_checked_at: Option<DateTimeUtc>,
    pub next_check_at: DateTimeUtc,
    pub expire_at: DateTimeUtc,
    pub poll_count: u32,
}

/// Immutable audit snapshot written alongside every request mutation.
///
/// `prev_entry_hash` chains entries of the same request; the first entry
/// carries `None`.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RequestHistoryEntry {
    pub entry_id: Ulid,
    pub recorded_at: DateTimeUtc,
    pub snapshot: RequestRecord,
    pub snapshot_hash: String,
    pub prev_entry_hash: Option<String>,
    pub entry_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct MonitorHistoryEntry {
    pub entry_id: Ulid,
    pub recorded_at: DateTimeUtc,
    pub snapshot: MonitorRecord,
    pub snapshot_hash: String,
    pub prev_entry_hash: Option<String>,
    pub entry_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RequestHistoryRow {
    pub entry_seq: i64,
    pub entry: RequestHistoryEntry,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct MonitorHistoryRow {
    pub entry_seq: i64,
    pub entry: MonitorHistoryEntry,
}

/// Write-once attachment of up to [`DETAIL_SLOT_COUNT`] named string slots.
///
/// Slot names are fixed (`para_1`..`para_10`); an absent slot is distinct
/// from an empty string.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct DetailRecord {
    slots: BTreeMap<String, String>,
}

impl DetailRecord {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a record from `(slot_name, value)` pairs.
    ///
    /// # Errors
    /// Returns [`TrackError::Validation`] on an unknown slot name or a
    /// duplicate slot.
    pub fn from_pairs<I>(pairs: I) -> Result<Self, TrackError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut record = Self::new();
        for (name, value) in pairs {
            record.set(&name, value)?;
        }
        Ok(record)
    }

    /// Set one slot value.
    ///
    /// # Errors
    /// Returns [`TrackError::Validation`] on an unknown slot name or a
    /// duplicate slot.
    pub fn set(&mut self, name: &str, value: String) -> Result<(), TrackError> {
        if detail_slot_index(name).is_none() {
            return Err(TrackError::Validation(format!(
                "unknown detail slot '{name}'; valid slots are para_1..para_{DETAIL_SLOT_COUNT}"
            )));
        }
        if self.slots.contains_key(name) {
            return Err(TrackError::Validation(format!(
                "detail slot '{name}' set twice"
            )));
        }
        self.slots.insert(name.to_string(), value);
        Ok(())
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.slots.get(name).map(String::as_str)
    }

    /// Value of slot `index` (1-based), if set.
    #[must_use]
    pub fn slot(&self, index: usize) -> Option<&str> {
        detail_slot_name(index).and_then(|name| self.get(&name))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.slots
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }
}

/// Name of the 1-based detail slot `index`, or `None` when out of range.
#[must_use]
pub fn detail_slot_name(index: usize) -> Option<String> {
    if (1..=DETAIL_SLOT_COUNT).contains(&index) {
        Some(format!("para_{index}"))
    } else {
        None
    }
}

/// 1-based slot index for a slot name, or `None` when the name is unknown.
#[must_use]
pub fn detail_slot_index(name: &str) -> Option<usize> {
    let raw = name.strip_prefix("para_")?;
    let index: usize = raw.parse().ok()?;
    if (1..=DETAIL_SLOT_COUNT).contains(&index) && raw == index.to_string() {
        Some(index)
    } else {
        None
    }
}

#[must_use]
pub fn now_utc() -> DateTimeUtc {
    OffsetDateTime::now_utc()
}

#[must_use]
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Hash a JSON value with stable `serde_json` serialization + SHA-256.
///
/// # Errors
/// Returns an error if JSON serialization fails.
pub fn hash_json(value: &Value) -> Result<String> {
    let bytes = serde_json::to_vec(value)?;
    Ok(hash_bytes(&bytes))
}

/// Ensure a string field is non-empty after trimming.
///
/// # Errors
/// Returns [`TrackError::Validation`] when the provided value is
/// empty/whitespace.
pub fn ensure_non_empty(field_name: &str, value: &str) -> Result<(), TrackError> {
    if value.trim().is_empty() {
        return Err(TrackError::Validation(format!(
            "{field_name} MUST be non-empty"
        )));
    }
    Ok(())
}

/// Compute a deterministic hash of a request snapshot.
///
/// # Errors
/// Returns an error if the snapshot cannot be serialized.
pub fn compute_request_snapshot_hash(snapshot: &RequestRecord) -> Result<String> {
    let value = serde_json::to_value(snapshot)?;
    hash_json(&value)
}

/// Compute a deterministic hash of a monitor snapshot.
///
/// # Errors
/// Returns an error if the snapshot cannot be serialized.
pub fn compute_monitor_snapshot_hash(snapshot: &MonitorRecord) -> Result<String> {
    let value = serde_json::to_value(snapshot)?;
    hash_json(&value)
}

/// Compute the hash of one history entry from its chain material.
///
/// # Errors
/// Returns an error if the material cannot be serialized.
pub fn compute_entry_hash(
    entry_id: Ulid,
    recorded_at_rfc3339: &str,
    snapshot_hash: &str,
    prev_entry_hash: Option<&str>,
) -> Result<String> {
    let material = serde_json::json!({
        "entry_id": entry_id.to_string(),
        "recorded_at": recorded_at_rfc3339,
        "snapshot_hash": snapshot_hash,
        "prev_entry_hash": prev_entry_hash,
    });
    hash_json(&material)
}

/// Format a timestamp as RFC3339.
///
/// # Errors
/// Returns an error when the timestamp cannot be represented.
pub fn format_rfc3339(value: DateTimeUtc) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| anyhow!("invalid datetime format: {err}"))
}

/// Parse an RFC3339 timestamp.
///
/// # Errors
/// Returns an error when the input is not valid RFC3339.
pub fn parse_rfc3339(value: &str) -> Result<DateTimeUtc> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| anyhow!("invalid RFC3339 datetime: {err}"))
}

#[cfg(test)]
mod tests {
    use super::{
        compute_entry_hash, detail_slot_index, detail_slot_name, ensure_non_empty, DetailRecord,
        MonitorStatus, RequestStatus, TrackError, DETAIL_SLOT_COUNT,
    };
    use ulid::Ulid;

    #[test]
    fn status_text_round_trips() {
        for status in [
            RequestStatus::Open,
            RequestStatus::Completed,
            RequestStatus::Error,
        ] {
            assert_eq!(RequestStatus::parse(status.as_str()), Some(status));
        }
        for status in [
            MonitorStatus::Open,
            MonitorStatus::Resolved,
            MonitorStatus::Failed,
            MonitorStatus::Expired,
            MonitorStatus::Cancelled,
        ] {
            assert_eq!(MonitorStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(RequestStatus::parse("bogus"), None);
        assert_eq!(MonitorStatus::parse("bogus"), None);
    }

    #[test]
    fn only_open_is_non_terminal() {
        assert!(!MonitorStatus::Open.is_terminal());
        assert!(MonitorStatus::Resolved.is_terminal());
        assert!(MonitorStatus::Failed.is_terminal());
        assert!(MonitorStatus::Expired.is_terminal());
        assert!(MonitorStatus::Cancelled.is_terminal());
    }

    #[test]
    fn detail_slot_names_are_fixed() {
        assert_eq!(detail_slot_name(1).as_deref(), Some("para_1"));
        assert_eq!(
            detail_slot_name(DETAIL_SLOT_COUNT).as_deref(),
            Some("para_10")
        );
        assert_eq!(detail_slot_name(0), None);
        assert_eq!(detail_slot_name(11), None);

        assert_eq!(detail_slot_index("para_3"), Some(3));
        assert_eq!(detail_slot_index("para_10"), Some(10));
        assert_eq!(detail_slot_index("para_11"), None);
        assert_eq!(detail_slot_index("para_01"), None);
        assert_eq!(detail_slot_index("other"), None);
    }

    #[test]
    fn detail_record_rejects_unknown_and_duplicate_slots() {
        let mut record = DetailRecord::new();
        assert!(record.set("para_1", "a".to_string()).is_ok());
        assert!(matches!(
            record.set("para_1", "b".to_string()),
            Err(TrackError::Validation(_))
        ));
        assert!(matches!(
            record.set("para_99", "c".to_string()),
            Err(TrackError::Validation(_))
        ));
        assert_eq!(record.get("para_1"), Some("a"));
        assert_eq!(record.len(), 1);
    }

    #[test]
    fn detail_record_keeps_empty_string_distinct_from_absent() {
        let record = DetailRecord::from_pairs(vec![("para_2".to_string(), String::new())]);
        assert!(record.is_ok());
        let record = record.unwrap_or_else(|_| unreachable!());
        assert_eq!(record.get("para_2"), Some(""));
        assert_eq!(record.get("para_3"), None);
    }

    #[test]
    fn ensure_non_empty_rejects_whitespace() {
        assert!(ensure_non_empty("account_num", "AC-1").is_ok());
        assert!(matches!(
            ensure_non_empty("account_num", "   "),
            Err(TrackError::Validation(_))
        ));
    }

    #[test]
    fn entry_hash_is_stable_and_chain_sensitive() {
        let entry_id = Ulid::nil();
        let first = compute_entry_hash(entry_id, "2026-03-01T00:00:00Z", "snap", None);
        let second = compute_entry_hash(entry_id, "2026-03-01T00:00:00Z", "snap", None);
        let chained = compute_entry_hash(entry_id, "2026-03-01T00:00:00Z", "snap", Some("prev"));
        assert!(first.is_ok());
        assert!(second.is_ok());
        assert!(chained.is_ok());
        let first = first.unwrap_or_else(|_| unreachable!());
        let second = second.unwrap_or_else(|_| unreachable!());
        let chained = chained.unwrap_or_else(|_| unreachable!());
        assert_eq!(first, second);
        assert_ne!(first, chained);
    }
}
