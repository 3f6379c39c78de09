//! Sync tracking document (`sync_tracking.json`).
//!
//! Maps case/folder names to their last sync outcome so repeat runs can skip
//! work that is already done. The document is always read whole, mutated in
//! memory and written back whole.

use crate::fs::{FileSystem, FsError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::warn;

/// File name of the tracking document inside a folder workspace.
pub const TRACKING_FILE: &str = "sync_tracking.json";

#[derive(Debug, Error)]
pub enum TrackingError {
    #[error("Filesystem error: {0}")]
    Fs(#[from] FsError),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, TrackingError>;

/// Last sync outcome for one case or folder.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncRecord {
    /// Seconds since epoch of the last successful sync (0 if never)
    pub last_synced_timestamp: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_synced_iso: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempted_iso: Option<String>,
    pub sync_successful: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_mode: Option<String>,
}

/// Summary of one completion sync run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncSession {
    pub timestamp: String,
    pub sync_mode: String,
    pub total_cases: usize,
    pub synced_cases: usize,
    pub failed_cases: usize,
}

/// The whole tracking document.
///
/// Records sit at the top level next to `sync_sessions` and `last_sync_mode`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SyncTracking {
    #[serde(default)]
    pub sync_sessions: Vec<SyncSession>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync_mode: Option<String>,
    #[serde(flatten)]
    pub records: BTreeMap<String, SyncRecord>,
}

impl SyncTracking {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&SyncRecord> {
        self.records.get(name)
    }

    /// Seconds timestamp of the last success for `name`, 0 if none.
    pub fn last_synced(&self, name: &str) -> f64 {
        self.records
            .get(name)
            .map(|r| r.last_synced_timestamp)
            .unwrap_or(0.0)
    }

    /// Record a successful sync at `now`.
    pub fn record_success(&mut self, name: &str, mode: &str, now: DateTime<Utc>) {
        self.records.insert(
            name.to_string(),
            SyncRecord {
                last_synced_timestamp: epoch_seconds(now),
                last_synced_iso: Some(now.to_rfc3339()),
                last_attempted_iso: None,
                sync_successful: true,
                sync_mode: Some(mode.to_string()),
            },
        );
    }

    /// Record a failed attempt, keeping the previous success timestamp.
    pub fn record_failure(&mut self, name: &str, mode: &str, now: DateTime<Utc>) {
        let previous = self.last_synced(name);
        self.records.insert(
            name.to_string(),
            SyncRecord {
                last_synced_timestamp: previous,
                last_synced_iso: None,
                last_attempted_iso: Some(now.to_rfc3339()),
                sync_successful: false,
                sync_mode: Some(mode.to_string()),
            },
        );
    }

    /// Append a session summary and remember its mode.
    pub fn push_session(&mut self, session: SyncSession) {
        self.last_sync_mode = Some(session.sync_mode.clone());
        self.sync_sessions.push(session);
    }

    /// Load from `path`. A missing or corrupt document yields an empty one.
    pub async fn load<F>(fs: &F, path: &str) -> Self
    where
        F: FileSystem + ?Sized,
    {
        match Self::try_load(fs, path).await {
            Ok(tracking) => tracking,
            Err(e) => {
                warn!("Error loading sync tracking from {}: {}", path, e);
                Self::new()
            }
        }
    }

    async fn try_load<F>(fs: &F, path: &str) -> Result<Self>
    where
        F: FileSystem + ?Sized,
    {
        if !fs.exists(path).await? {
            return Ok(Self::new());
        }
        let bytes = fs.read(path).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Rewrite the whole document at `path`.
    pub async fn save<F>(&self, fs: &F, path: &str) -> Result<()>
    where
        F: FileSystem + ?Sized,
    {
        let contents = serde_json::to_vec_pretty(self)?;
        fs.write(path, &contents).await?;
        Ok(())
    }
}

/// Seconds since epoch with sub-second precision.
pub fn epoch_seconds(ts: DateTime<Utc>) -> f64 {
    ts.timestamp_millis() as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::InMemoryFs;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn test_failure_keeps_previous_success_timestamp() {
        let mut tracking = SyncTracking::new();
        tracking.record_success("case_a", "s3", at(1_000));
        tracking.record_failure("case_a", "mount", at(2_000));

        let record = tracking.get("case_a").unwrap();
        assert!(!record.sync_successful);
        assert_eq!(record.last_synced_timestamp, 1_000.0);
        assert!(record.last_attempted_iso.is_some());
        assert_eq!(record.sync_mode.as_deref(), Some("mount"));
    }

    #[test]
    fn test_first_failure_has_zero_timestamp() {
        let mut tracking = SyncTracking::new();
        tracking.record_failure("case_b", "s3", at(5));
        assert_eq!(tracking.last_synced("case_b"), 0.0);
    }

    #[test]
    fn test_document_shape_keeps_records_at_top_level() {
        let mut tracking = SyncTracking::new();
        tracking.record_success("case_a", "s3", at(10));
        tracking.push_session(SyncSession {
            timestamp: at(10).to_rfc3339(),
            sync_mode: "s3".into(),
            total_cases: 1,
            synced_cases: 1,
            failed_cases: 0,
        });

        let value = serde_json::to_value(&tracking).unwrap();
        assert_eq!(value["case_a"]["sync_successful"], true);
        assert_eq!(value["case_a"]["last_synced_timestamp"], 10.0);
        assert_eq!(value["last_sync_mode"], "s3");
        assert_eq!(value["sync_sessions"][0]["synced_cases"], 1);
    }

    #[test]
    fn test_reads_document_written_by_older_tooling() {
        let json = r#"{
            "case_a": {
                "last_synced_timestamp": 1700000000.5,
                "last_synced_iso": "2023-11-14T22:13:20.500000",
                "sync_successful": true,
                "sync_mode": "s3"
            },
            "sync_sessions": [],
            "last_sync_mode": "s3"
        }"#;
        let tracking: SyncTracking = serde_json::from_str(json).unwrap();
        assert_eq!(tracking.last_synced("case_a"), 1_700_000_000.5);
        assert_eq!(tracking.records.len(), 1);
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let fs = InMemoryFs::new();
        let mut tracking = SyncTracking::new();
        tracking.record_success("user1", "mount", at(42));
        tracking.save(&fs, "user1/sync_tracking.json").await.unwrap();

        let loaded = SyncTracking::load(&fs, "user1/sync_tracking.json").await;
        assert_eq!(loaded, tracking);
    }

    #[tokio::test]
    async fn test_missing_or_corrupt_loads_empty() {
        let fs = InMemoryFs::new();
        assert_eq!(SyncTracking::load(&fs, "nope.json").await, SyncTracking::new());

        fs.write("bad.json", b"{not json").await.unwrap();
        assert_eq!(SyncTracking::load(&fs, "bad.json").await, SyncTracking::new());
    }
}
