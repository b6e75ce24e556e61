//! Progress coordinator use case
//!
//! Aggregates per-account sync counters (files/bytes in flight and
//! completed) into a [`SyncState`] snapshot and publishes it on a
//! `tokio::sync::watch` channel: single writer (the orchestrator and the
//! transfer pool call the update methods), many readers (CLI, IPC, daemon),
//! each always observing the latest snapshot rather than a backlog.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::watch;

use crate::domain::newtypes::HashedAccountId;
use crate::domain::progress::{SyncState, SyncStatus};

/// Minimum interval between published samples.
const PUBLISH_INTERVAL: Duration = Duration::from_millis(100);

/// Number of recent completed-bytes samples kept for the rolling throughput
/// rate.
const SAMPLE_WINDOW: usize = 10;

/// Throughput below this is treated as "no meaningful progress" for ETA
/// purposes; `eta_seconds` is omitted rather than reporting a huge number.
const MIN_THROUGHPUT_MBPS: f64 = 0.01;

struct Inner {
    state: SyncState,
    samples: VecDeque<(Instant, u64)>,
    last_published: Instant,
}

/// Publishes sampled [`SyncState`] snapshots for one account's sync run.
pub struct ProgressCoordinator {
    tx: watch::Sender<SyncState>,
    inner: Mutex<Inner>,
}

impl ProgressCoordinator {
    /// Creates a coordinator in the `Idle` state along with a receiver
    /// subscribed to it.
    pub fn new(hashed_account_id: HashedAccountId) -> (Self, watch::Receiver<SyncState>) {
        let initial = SyncState::idle(hashed_account_id);
        let (tx, rx) = watch::channel(initial.clone());
        let coordinator = Self {
            tx,
            inner: Mutex::new(Inner {
                state: initial,
                samples: VecDeque::with_capacity(SAMPLE_WINDOW),
                // Back-dated so the very first publish is never throttled.
                last_published: Instant::now() - PUBLISH_INTERVAL,
            }),
        };
        (coordinator, rx)
    }

    /// Subscribes an additional reader to the current state.
    pub fn subscribe(&self) -> watch::Receiver<SyncState> {
        self.tx.subscribe()
    }

    /// Updates the coarse-grained phase. Always publishes immediately,
    /// bypassing the sample throttle, since phase transitions are rare and
    /// readers should see them without delay.
    pub fn set_status(&self, status: SyncStatus) {
        self.mutate(|s| s.status = status);
        self.publish(true);
    }

    /// Sets the planned work size once the reconciler has classified all
    /// paths for this run.
    pub fn set_totals(&self, total_files: u64, total_bytes: u64) {
        self.mutate(|s| {
            s.total_files = total_files;
            s.total_bytes = total_bytes;
        });
        self.publish(false);
    }

    /// Records the folder currently being scanned or transferred, for
    /// progress UIs that show a path.
    pub fn set_current_folder(&self, folder: Option<String>) {
        self.mutate(|s| s.current_folder = folder);
        self.publish(false);
    }

    /// Marks one more file as actively uploading.
    pub fn start_upload(&self) {
        self.mutate(|s| s.files_uploading += 1);
        self.publish(false);
    }

    /// Marks one more file as actively downloading.
    pub fn start_download(&self) {
        self.mutate(|s| s.files_downloading += 1);
        self.publish(false);
    }

    /// Records a completed upload of `size_bytes`, updating the rolling
    /// throughput/ETA.
    pub fn finish_upload(&self, size_bytes: u64) {
        self.mutate(|s| {
            s.files_uploading = s.files_uploading.saturating_sub(1);
            s.completed_files += 1;
            s.completed_bytes += size_bytes;
        });
        self.record_sample();
        self.publish(false);
    }

    /// Records a completed download of `size_bytes`, updating the rolling
    /// throughput/ETA.
    pub fn finish_download(&self, size_bytes: u64) {
        self.mutate(|s| {
            s.files_downloading = s.files_downloading.saturating_sub(1);
            s.completed_files += 1;
            s.completed_bytes += size_bytes;
        });
        self.record_sample();
        self.publish(false);
    }

    /// Records a local or remote deletion.
    pub fn record_deleted(&self) {
        self.mutate(|s| s.files_deleted += 1);
        self.publish(false);
    }

    /// Records a newly detected conflict.
    pub fn record_conflict(&self) {
        self.mutate(|s| s.conflicts_detected += 1);
        self.publish(false);
    }

    /// Marks the run as finished with the given terminal status
    /// (`Completed`, `Failed`, or `Paused`), forcing a final publish so
    /// readers never observe a stale in-progress snapshot.
    pub fn finish(&self, status: SyncStatus) {
        self.mutate(|s| s.status = status);
        self.publish(true);
    }

    fn mutate(&self, f: impl FnOnce(&mut SyncState)) {
        let mut inner = self.inner.lock().unwrap();
        f(&mut inner.state);
        inner.state.timestamp = Utc::now();
    }

    fn record_sample(&self) {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        let completed_bytes = inner.state.completed_bytes;
        let total_bytes = inner.state.total_bytes;

        inner.samples.push_back((now, completed_bytes));
        if inner.samples.len() > SAMPLE_WINDOW {
            inner.samples.pop_front();
        }

        let (throughput_mbps, eta_seconds) =
            throughput_and_eta(&inner.samples, total_bytes, completed_bytes);
        inner.state.throughput_mbps = throughput_mbps;
        inner.state.eta_seconds = eta_seconds;
    }

    fn publish(&self, force: bool) {
        let snapshot = {
            let mut inner = self.inner.lock().unwrap();
            let now = Instant::now();
            if !force && now.duration_since(inner.last_published) < PUBLISH_INTERVAL {
                return;
            }
            inner.last_published = now;
            inner.state.clone()
        };
        // A closed channel means every receiver was dropped; nothing to do.
        let _ = self.tx.send(snapshot);
    }
}

/// Computes the rolling throughput (MB/s) across the oldest and newest
/// sample in the window, plus the ETA derived from it.
fn throughput_and_eta(
    samples: &VecDeque<(Instant, u64)>,
    total_bytes: u64,
    completed_bytes: u64,
) -> (f64, Option<u64>) {
    let (Some(&(t0, b0)), Some(&(t1, b1))) = (samples.front(), samples.back()) else {
        return (0.0, None);
    };

    let elapsed = t1.duration_since(t0).as_secs_f64();
    if elapsed <= 0.0 {
        return (0.0, None);
    }

    let bytes_delta = b1.saturating_sub(b0) as f64;
    let throughput_mbps = (bytes_delta / elapsed) / 1_000_000.0;

    if throughput_mbps < MIN_THROUGHPUT_MBPS {
        return (throughput_mbps, None);
    }

    let remaining = total_bytes.saturating_sub(completed_bytes) as f64;
    let eta_seconds = remaining / (throughput_mbps * 1_000_000.0);
    (throughput_mbps, Some(eta_seconds.round() as u64))
}
