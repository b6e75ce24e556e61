//! Reconciliation engine
//!
//! Classifies every path known to an account — from the local scanner and
//! from the state store — into exactly one sync action: upload, download,
//! conflict, delete-local, delete-remote, or no-op. This is the decision
//! engine that sits between delta ingest / local scanning and the transfer
//! pool; it never performs I/O itself.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};

use onedrive_sync_core::domain::sync_item::{ItemState, SyncItem};

/// A significant cTag-vs-mtime mismatch beyond this threshold is treated as
/// a genuine remote change even when the cTag itself was not recorded.
const SIGNIFICANT_TIME_DIFF: Duration = Duration::seconds(3600);

/// Local modification-time slop below this is not considered a local change
/// (clock skew / filesystem mtime granularity).
const LOCAL_CHANGE_THRESHOLD: Duration = Duration::seconds(1);

/// On first sync, a local file whose mtime is within this tolerance of the
/// remote's reported mtime is assumed to already be the same content and is
/// adopted rather than re-transferred.
const FIRST_SYNC_TOLERANCE: Duration = Duration::seconds(60);

/// A snapshot of one file or directory as seen by the local scanner.
#[derive(Debug, Clone)]
pub struct LocalEntry {
    pub relative_path: String,
    pub size_bytes: u64,
    pub modified: DateTime<Utc>,
    pub is_directory: bool,
}

/// One path slated for a particular sync action.
#[derive(Debug, Clone)]
pub struct ReconcileAction {
    pub relative_path: String,
    pub size_bytes: u64,
}

impl ReconcileAction {
    fn from_local(entry: &LocalEntry) -> Self {
        Self {
            relative_path: entry.relative_path.clone(),
            size_bytes: entry.size_bytes,
        }
    }

    fn from_item(path: &str, item: &SyncItem) -> Self {
        Self {
            relative_path: path.to_string(),
            size_bytes: item.size_bytes(),
        }
    }
}

/// Aggregate counters over a reconciliation pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReconcileSummary {
    pub total_files: u64,
    pub total_bytes: u64,
    pub upload_bytes: u64,
    pub download_bytes: u64,
}

/// Output of a reconciliation pass: one action list per direction, plus
/// summary counters over the whole set.
#[derive(Debug, Clone, Default)]
pub struct ReconcilePlan {
    pub uploads: Vec<ReconcileAction>,
    pub downloads: Vec<ReconcileAction>,
    pub delete_local: Vec<ReconcileAction>,
    pub delete_remote: Vec<ReconcileAction>,
    pub conflicts: Vec<ReconcileAction>,
    pub summary: ReconcileSummary,
}

/// Diffs a local scanner snapshot against the state store's before/after
/// records for one account and produces a reconciliation plan.
///
/// - `local`: the scanner's current view of the sync root (`L`).
/// - `previous`: state-store records as they stood before this sync cycle's
///   delta was applied — supplies the "existing" cTag/mtime baseline.
/// - `current`: state-store records after the delta was applied — the
///   "remote view" (`R`), read off `S` post-apply since there is no
///   separate remote snapshot.
///
/// Both `previous` and `current` are keyed by relative path, matching `local`.
pub struct Reconciler;

impl Reconciler {
    pub fn reconcile(
        local: &HashMap<String, LocalEntry>,
        previous: &HashMap<String, SyncItem>,
        current: &HashMap<String, SyncItem>,
    ) -> ReconcilePlan {
        let mut uploads = Vec::new();
        let mut downloads: HashMap<String, ReconcileAction> = HashMap::new();
        let mut delete_local = Vec::new();
        let mut delete_remote = Vec::new();
        let mut conflicts: HashMap<String, ReconcileAction> = HashMap::new();

        // --- Upload detection: every path the scanner reports locally ---
        for (path, entry) in local {
            if entry.is_directory {
                continue;
            }

            match current.get(path) {
                Some(item)
                    if matches!(item.state(), ItemState::PendingUpload)
                        || matches!(item.state(), ItemState::Failed(_)) =>
                {
                    uploads.push(ReconcileAction::from_local(entry));
                }
                Some(item) => {
                    if has_local_changed(entry, item) {
                        uploads.push(ReconcileAction::from_local(entry));
                    }
                    // Unchanged: no-op.
                }
                None => {
                    // Path known only to the scanner: brand new local file.
                    uploads.push(ReconcileAction::from_local(entry));
                }
            }
        }

        // --- Download detection & conflict, for every path the state store
        // currently carries ---
        for (path, item) in current {
            if item.is_directory() {
                continue;
            }

            let local_entry = local.get(path);

            match previous.get(path) {
                Some(existing) => {
                    // Known path: had a record before this delta.
                    let remote_changed = remote_changed(existing, item);

                    if remote_changed {
                        let local_changed = match local_entry {
                            Some(entry) => has_local_changed(entry, existing),
                            None => false,
                        };

                        if local_changed {
                            conflicts
                                .entry(path.clone())
                                .or_insert_with(|| ReconcileAction::from_item(path, item));
                        } else {
                            downloads
                                .entry(path.clone())
                                .or_insert_with(|| ReconcileAction::from_item(path, item));
                        }
                    }
                    // Neither side changed: no-op.
                }
                None => {
                    // First-sync path: no prior record to compare against.
                    match local_entry {
                        None => {
                            downloads
                                .entry(path.clone())
                                .or_insert_with(|| ReconcileAction::from_item(path, item));
                        }
                        Some(entry) => {
                            let size_matches = entry.size_bytes == item.size_bytes();
                            let within_tolerance = item
                                .last_modified_remote()
                                .map(|remote_mtime| {
                                    (entry.modified - remote_mtime).abs() <= FIRST_SYNC_TOLERANCE
                                })
                                .unwrap_or(false);

                            if !(size_matches && within_tolerance) {
                                conflicts
                                    .entry(path.clone())
                                    .or_insert_with(|| ReconcileAction::from_item(path, item));
                            }
                            // Else: adopted as Synced without transfer by the caller.
                        }
                    }
                }
            }
        }

        // --- Deletion detection ---
        let mut seen_paths: HashSet<&str> = HashSet::new();
        for path in previous.keys().chain(current.keys()) {
            seen_paths.insert(path.as_str());
        }

        for path in seen_paths {
            let still_local = local.contains_key(path);
            let prev = previous.get(path);
            let curr = current.get(path);

            // Remote-to-local: was Synced, the current state store no longer
            // carries it (the delta tombstoned it), and the file still sits
            // on disk.
            let was_synced = prev.map(|p| matches!(p.state(), ItemState::Synced)).unwrap_or(false);
            if was_synced && curr.is_none() && still_local {
                if let Some(p) = prev {
                    delete_local.push(ReconcileAction::from_item(path, p));
                }
                continue;
            }

            // Local-to-remote: a previously-synced item with a remote
            // counterpart whose local file has disappeared.
            let had_remote_counterpart = curr
                .or(prev)
                .map(|item| item.remote_id().is_some())
                .unwrap_or(false);
            let was_or_is_synced = curr
                .map(|item| matches!(item.state(), ItemState::Synced))
                .unwrap_or(was_synced);

            if had_remote_counterpart && was_or_is_synced && !still_local {
                if let Some(item) = curr.or(prev) {
                    delete_remote.push(ReconcileAction::from_item(path, item));
                }
            }
        }

        // --- Tie-break & filter ---
        let delete_remote_paths: HashSet<&str> =
            delete_remote.iter().map(|a| a.relative_path.as_str()).collect();
        let conflict_paths: HashSet<&str> = conflicts.keys().map(|s| s.as_str()).collect();

        uploads.retain(|action| {
            !delete_remote_paths.contains(action.relative_path.as_str())
                && !conflict_paths.contains(action.relative_path.as_str())
        });

        let downloads: Vec<ReconcileAction> = downloads.into_values().collect();
        let conflicts: Vec<ReconcileAction> = conflicts.into_values().collect();

        let summary = summarize(&uploads, &downloads, &delete_local, &delete_remote, &conflicts);

        ReconcilePlan {
            uploads,
            downloads,
            delete_local,
            delete_remote,
            conflicts,
            summary,
        }
    }
}

/// Remote-changed predicate for a known path: cTag mismatch plus a
/// corroborating signal (cTag was actually recorded, a large mtime skew, or
/// a size change), or an item permanently treated as remote-changed because
/// it is tracked sync-only.
fn remote_changed(existing: &SyncItem, remote: &SyncItem) -> bool {
    if matches!(existing.state(), ItemState::SyncOnly) {
        return true;
    }

    if existing.c_tag() == remote.c_tag() {
        return false;
    }

    let ctag_was_recorded = existing.c_tag().is_some();
    let time_diff_significant = match (existing.last_modified_remote(), remote.last_modified_remote())
    {
        (Some(a), Some(b)) => (a - b).abs() > SIGNIFICANT_TIME_DIFF,
        _ => false,
    };
    let size_differs = existing.size_bytes() != remote.size_bytes();

    ctag_was_recorded || time_diff_significant || size_differs
}

/// Local-changed predicate: the scanner's entry differs from the stored
/// baseline by more than clock-skew slop, or by size.
fn has_local_changed(entry: &LocalEntry, stored: &SyncItem) -> bool {
    if let (Some(stored_hash), Some(local_hash)) = (stored.content_hash(), stored.local_hash()) {
        if stored_hash != local_hash {
            return true;
        }
    }

    let time_diff_significant = stored
        .last_modified_local()
        .map(|stored_mtime| (entry.modified - stored_mtime).abs() > LOCAL_CHANGE_THRESHOLD)
        .unwrap_or(true);

    time_diff_significant || entry.size_bytes != stored.size_bytes()
}

fn summarize(
    uploads: &[ReconcileAction],
    downloads: &[ReconcileAction],
    delete_local: &[ReconcileAction],
    delete_remote: &[ReconcileAction],
    conflicts: &[ReconcileAction],
) -> ReconcileSummary {
    let upload_bytes: u64 = uploads.iter().map(|a| a.size_bytes).sum();
    let download_bytes: u64 = downloads.iter().map(|a| a.size_bytes).sum();
    let total_files = (uploads.len()
        + downloads.len()
        + delete_local.len()
        + delete_remote.len()
        + conflicts.len()) as u64;
    let total_bytes = upload_bytes
        + download_bytes
        + delete_local.iter().map(|a| a.size_bytes).sum::<u64>()
        + delete_remote.iter().map(|a| a.size_bytes).sum::<u64>()
        + conflicts.iter().map(|a| a.size_bytes).sum::<u64>();

    ReconcileSummary {
        total_files,
        total_bytes,
        upload_bytes,
        download_bytes,
    }
}
