//! Sync progress snapshot domain types
//!
//! A [`SyncState`] is the unit published by the progress coordinator use
//! case: one point-in-time summary of a running (or finished) sync session,
//! aggregating the counters the transfer pool and delta fetcher report.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::newtypes::HashedAccountId;

/// Coarse-grained phase of a sync run, published alongside the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// No sync in progress
    Idle,
    /// Fetching the full delta (first sync for this account/drive)
    InitialDeltaSync,
    /// Fetching an incremental delta from a stored token
    IncrementalDeltaSync,
    /// Reconciling and transferring files
    Running,
    /// Finished successfully
    Completed,
    /// Finished with an unrecoverable error
    Failed,
    /// Cooperatively paused (cancellation requested mid-run)
    Paused,
}

impl Default for SyncStatus {
    fn default() -> Self {
        SyncStatus::Idle
    }
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SyncStatus::Idle => "idle",
            SyncStatus::InitialDeltaSync => "initial_delta_sync",
            SyncStatus::IncrementalDeltaSync => "incremental_delta_sync",
            SyncStatus::Running => "running",
            SyncStatus::Completed => "completed",
            SyncStatus::Failed => "failed",
            SyncStatus::Paused => "paused",
        };
        write!(f, "{}", s)
    }
}

/// A single sampled snapshot of sync progress for one account.
///
/// Published at most every 100ms by the progress coordinator; readers
/// always see the latest value (last-value retention), never a backlog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncState {
    pub hashed_account_id: HashedAccountId,
    pub status: SyncStatus,
    pub total_files: u64,
    pub completed_files: u64,
    pub total_bytes: u64,
    pub completed_bytes: u64,
    pub files_uploading: u32,
    pub files_downloading: u32,
    pub files_deleted: u64,
    pub conflicts_detected: u64,
    /// Rolling throughput in megabytes/second
    pub throughput_mbps: f64,
    /// Estimated seconds remaining; omitted below 0.01 MB/s throughput
    pub eta_seconds: Option<u64>,
    pub current_folder: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl SyncState {
    /// Creates an idle snapshot for an account with all counters zeroed.
    pub fn idle(hashed_account_id: HashedAccountId) -> Self {
        Self {
            hashed_account_id,
            status: SyncStatus::Idle,
            total_files: 0,
            completed_files: 0,
            total_bytes: 0,
            completed_bytes: 0,
            files_uploading: 0,
            files_downloading: 0,
            files_deleted: 0,
            conflicts_detected: 0,
            throughput_mbps: 0.0,
            eta_seconds: None,
            current_folder: None,
            timestamp: Utc::now(),
        }
    }
}
