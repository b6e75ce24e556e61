//! Conflict resolution scheduler
//!
//! Applies resolution strategies by flipping bookkeeping only:
//! - `KeepLocal`: queue the item for upload
//! - `KeepRemote`: queue the item for download
//! - `KeepBoth`: queue the original item for download, and schedule a
//!   renamed sibling item for upload
//! - `Manual`: no scheduling action; the caller decides later
//!
//! No upload, download, or filesystem I/O happens here. The next
//! TransferPool phase picks up whatever state this leaves behind exactly
//! like any other pending item.

use std::sync::Arc;

use tracing::{debug, info, warn};

use onedrive_sync_core::{
    domain::{
        conflict::{Conflict, Resolution, ResolutionSource},
        sync_item::SyncItem,
    },
    ports::state_repository::IStateRepository,
};

use crate::{error::ConflictError, namer::ConflictNamer};

/// Result of a batch resolution operation
#[derive(Debug, Clone)]
pub struct BatchResult {
    pub resolved: u32,
    pub failed: u32,
    pub errors: Vec<String>,
}

/// Schedules conflict resolutions by updating item/conflict state
pub struct ConflictResolver {
    state_repository: Arc<dyn IStateRepository>,
}

impl ConflictResolver {
    pub fn new(state_repository: Arc<dyn IStateRepository>) -> Self {
        Self { state_repository }
    }

    /// Apply a resolution to a conflict
    ///
    /// Flips the item's state to `PendingUpload`/`PendingDownload` (and, for
    /// `KeepBoth`, schedules an additional renamed sibling item) and marks
    /// the conflict resolved. The actual transfer happens in a later sync
    /// session's transfer phase, not here.
    pub async fn apply_resolution(
        &self,
        conflict: Conflict,
        resolution: Resolution,
        source: ResolutionSource,
        item: &SyncItem,
    ) -> Result<Conflict, ConflictError> {
        info!(
            conflict_id = %conflict.id(),
            resolution = %resolution,
            path = %item.local_path(),
            "Scheduling conflict resolution"
        );

        if conflict.is_resolved() {
            return Err(ConflictError::AlreadyResolved(conflict.id().to_string()));
        }

        let mut updated_item = item.clone();
        match &resolution {
            Resolution::KeepLocal => {
                updated_item
                    .queue_upload()
                    .map_err(|e| ConflictError::ResolutionFailed(format!("state transition: {e}")))?;
            }
            Resolution::KeepRemote => {
                updated_item
                    .queue_download()
                    .map_err(|e| ConflictError::ResolutionFailed(format!("state transition: {e}")))?;
            }
            Resolution::KeepBoth => {
                let sibling = Self::make_conflict_sibling(item)?;
                self.state_repository
                    .save_item(&sibling)
                    .await
                    .map_err(|e| ConflictError::ResolutionFailed(format!("save sibling item: {e}")))?;
                updated_item
                    .queue_download()
                    .map_err(|e| ConflictError::ResolutionFailed(format!("state transition: {e}")))?;
            }
            Resolution::Manual => {
                debug!("Manual resolution - no scheduling action");
            }
        }

        // Resolve the conflict entity
        let resolved = conflict.resolve(resolution, source);

        // Persist the resolved conflict
        self.state_repository
            .save_conflict(&resolved)
            .await
            .map_err(|e| ConflictError::ResolutionFailed(format!("save conflict: {e}")))?;

        self.state_repository
            .save_item(&updated_item)
            .await
            .map_err(|e| ConflictError::ResolutionFailed(format!("save item: {e}")))?;

        info!(
            conflict_id = %resolved.id(),
            "Conflict resolution scheduled"
        );

        Ok(resolved)
    }

    /// Builds the renamed sibling item for `KeepBoth`: same account and
    /// remote parent as `item`, with a conflict-copy name, queued for
    /// upload once the next sync session picks it up. Nothing is written
    /// to disk or to the cloud here - the sibling doesn't exist yet as a
    /// local file, the TransferPool is responsible for materializing it.
    fn make_conflict_sibling(item: &SyncItem) -> Result<SyncItem, ConflictError> {
        let original_name = item
            .local_path()
            .as_path()
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unknown");
        let conflict_name = ConflictNamer::generate(original_name);

        let parent_dir = item
            .local_path()
            .as_path()
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| item.local_path().as_path().clone());
        let sibling_local_path =
            onedrive_sync_core::domain::newtypes::SyncPath::new(parent_dir.join(&conflict_name))
                .map_err(|e| ConflictError::ResolutionFailed(format!("sibling local path: {e}")))?;

        let sibling_remote_path = item
            .remote_path()
            .parent()
            .unwrap_or_else(|| item.remote_path().clone())
            .join(&conflict_name)
            .map_err(|e| ConflictError::ResolutionFailed(format!("remote sibling path: {e}")))?;

        let sibling = SyncItem::new(
            *item.hashed_account_id(),
            sibling_local_path,
            sibling_remote_path,
            item.is_directory(),
        )
        .map_err(|e| ConflictError::ResolutionFailed(format!("create sibling item: {e}")))?;

        Ok(sibling)
    }

    /// Resolve multiple conflicts with the same strategy
    pub async fn resolve_batch(
        &self,
        conflicts: Vec<(Conflict, SyncItem)>,
        resolution: Resolution,
        source: ResolutionSource,
    ) -> BatchResult {
        let mut result = BatchResult {
            resolved: 0,
            failed: 0,
            errors: Vec::new(),
        };

        for (conflict, item) in conflicts {
            match self
                .apply_resolution(conflict, resolution.clone(), source.clone(), &item)
                .await
            {
                Ok(_) => result.resolved += 1,
                Err(e) => {
                    warn!(error = %e, "Batch resolution failed for item");
                    result.failed += 1;
                    result.errors.push(e.to_string());
                }
            }
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::Utc;
    use onedrive_sync_core::domain::newtypes::{
        AccountId, FileHash, HashedAccountId, RemoteId, RemotePath, SyncPath, UniqueId,
    };
    use onedrive_sync_core::domain::{Account, AuditEntry, SyncSession, VersionInfo};
    use onedrive_sync_core::ports::state_repository::ItemFilter;

    use super::*;

    /// Minimal in-memory repository stub covering only what the resolver
    /// touches: item and conflict storage.
    #[derive(Default)]
    struct StubRepo {
        items: Mutex<HashMap<UniqueId, SyncItem>>,
        conflicts: Mutex<HashMap<onedrive_sync_core::domain::newtypes::ConflictId, Conflict>>,
    }

    #[async_trait]
    impl IStateRepository for StubRepo {
        async fn save_item(&self, item: &SyncItem) -> anyhow::Result<()> {
            self.items.lock().unwrap().insert(*item.id(), item.clone());
            Ok(())
        }
        async fn get_item(&self, id: &UniqueId) -> anyhow::Result<Option<SyncItem>> {
            Ok(self.items.lock().unwrap().get(id).cloned())
        }
        async fn get_item_by_path(&self, _path: &SyncPath) -> anyhow::Result<Option<SyncItem>> {
            unimplemented!()
        }
        async fn get_item_by_remote_id(
            &self,
            _remote_id: &RemoteId,
        ) -> anyhow::Result<Option<SyncItem>> {
            unimplemented!()
        }
        async fn query_items(&self, _filter: &ItemFilter) -> anyhow::Result<Vec<SyncItem>> {
            unimplemented!()
        }
        async fn delete_item(&self, _id: &UniqueId) -> anyhow::Result<()> {
            unimplemented!()
        }
        async fn count_items_by_state(
            &self,
            _account_id: &AccountId,
        ) -> anyhow::Result<HashMap<String, u64>> {
            unimplemented!()
        }
        async fn save_account(&self, _account: &Account) -> anyhow::Result<()> {
            unimplemented!()
        }
        async fn get_account(&self, _id: &AccountId) -> anyhow::Result<Option<Account>> {
            unimplemented!()
        }
        async fn get_default_account(&self) -> anyhow::Result<Option<Account>> {
            unimplemented!()
        }
        async fn save_session(&self, _session: &SyncSession) -> anyhow::Result<()> {
            unimplemented!()
        }
        async fn get_session(
            &self,
            _id: &onedrive_sync_core::domain::newtypes::SessionId,
        ) -> anyhow::Result<Option<SyncSession>> {
            unimplemented!()
        }
        async fn save_audit(&self, _entry: &AuditEntry) -> anyhow::Result<()> {
            unimplemented!()
        }
        async fn get_audit_trail(&self, _item_id: &UniqueId) -> anyhow::Result<Vec<AuditEntry>> {
            unimplemented!()
        }
        async fn get_audit_since(
            &self,
            _since: chrono::DateTime<Utc>,
            _limit: u32,
        ) -> anyhow::Result<Vec<AuditEntry>> {
            unimplemented!()
        }
        async fn save_conflict(&self, conflict: &Conflict) -> anyhow::Result<()> {
            self.conflicts
                .lock()
                .unwrap()
                .insert(*conflict.id(), conflict.clone());
            Ok(())
        }
        async fn get_unresolved_conflicts(&self) -> anyhow::Result<Vec<Conflict>> {
            unimplemented!()
        }
        async fn get_conflict_by_id(
            &self,
            id: &onedrive_sync_core::domain::newtypes::ConflictId,
        ) -> anyhow::Result<Option<Conflict>> {
            Ok(self.conflicts.lock().unwrap().get(id).cloned())
        }
        async fn save_debug_log(
            &self,
            _entry: &onedrive_sync_core::domain::DebugLogEntry,
        ) -> anyhow::Result<()> {
            unimplemented!()
        }
        async fn get_debug_logs(
            &self,
            _hashed_account_id: &HashedAccountId,
            _limit: u32,
        ) -> anyhow::Result<Vec<onedrive_sync_core::domain::DebugLogEntry>> {
            unimplemented!()
        }
        async fn apply_delta_page(
            &self,
            _hashed_account_id: &HashedAccountId,
            _items: &[SyncItem],
            _new_delta_token: Option<&onedrive_sync_core::domain::newtypes::DeltaToken>,
        ) -> anyhow::Result<()> {
            unimplemented!()
        }
    }

    fn test_item() -> SyncItem {
        SyncItem::new(
            HashedAccountId::from_plain("test@example.com"),
            SyncPath::new("/sync/Documents/report.docx".into()).unwrap(),
            RemotePath::new("/Documents/report.docx".to_string()).unwrap(),
            false,
        )
        .unwrap()
    }

    fn test_conflict(item: &SyncItem) -> Conflict {
        let local = VersionInfo::new(
            FileHash::new("AAAAAAAAAAAAAAAAAAAAAAAAAAA=".to_string()).unwrap(),
            1024,
            Utc::now(),
        );
        let remote = VersionInfo::new(
            FileHash::new("BBBBBBBBBBBBBBBBBBBBBBBBBBB=".to_string()).unwrap(),
            2048,
            Utc::now(),
        );
        Conflict::new(*item.hashed_account_id(), *item.id(), local, remote)
    }

    #[tokio::test]
    async fn test_keep_local_queues_upload_without_io() {
        let repo = Arc::new(StubRepo::default());
        let resolver = ConflictResolver::new(repo.clone());
        let item = test_item();
        let conflict = test_conflict(&item);

        let resolved = resolver
            .apply_resolution(
                conflict,
                Resolution::KeepLocal,
                ResolutionSource::User,
                &item,
            )
            .await
            .unwrap();

        assert!(resolved.is_resolved());
        let saved = repo.items.lock().unwrap().get(item.id()).cloned().unwrap();
        assert_eq!(*saved.state(), onedrive_sync_core::domain::sync_item::ItemState::PendingUpload);
    }

    #[tokio::test]
    async fn test_keep_remote_queues_download() {
        let repo = Arc::new(StubRepo::default());
        let resolver = ConflictResolver::new(repo.clone());
        let item = test_item();
        let conflict = test_conflict(&item);

        resolver
            .apply_resolution(
                conflict,
                Resolution::KeepRemote,
                ResolutionSource::User,
                &item,
            )
            .await
            .unwrap();

        let saved = repo.items.lock().unwrap().get(item.id()).cloned().unwrap();
        assert_eq!(*saved.state(), onedrive_sync_core::domain::sync_item::ItemState::PendingDownload);
    }

    #[tokio::test]
    async fn test_keep_both_schedules_renamed_sibling() {
        let repo = Arc::new(StubRepo::default());
        let resolver = ConflictResolver::new(repo.clone());
        let item = test_item();
        let conflict = test_conflict(&item);

        resolver
            .apply_resolution(
                conflict,
                Resolution::KeepBoth,
                ResolutionSource::User,
                &item,
            )
            .await
            .unwrap();

        let items = repo.items.lock().unwrap();
        assert_eq!(items.len(), 2);
        let original = items.get(item.id()).unwrap();
        assert_eq!(*original.state(), onedrive_sync_core::domain::sync_item::ItemState::PendingDownload);

        let sibling = items
            .values()
            .find(|i| i.id() != item.id())
            .expect("sibling item should exist");
        assert_eq!(*sibling.state(), onedrive_sync_core::domain::sync_item::ItemState::PendingUpload);
        assert!(sibling
            .local_path()
            .as_path()
            .to_string_lossy()
            .contains("conflicted copy"));
    }

    #[tokio::test]
    async fn test_already_resolved_is_rejected() {
        let repo = Arc::new(StubRepo::default());
        let resolver = ConflictResolver::new(repo);
        let item = test_item();
        let conflict = test_conflict(&item).resolve(Resolution::KeepLocal, ResolutionSource::User);

        let err = resolver
            .apply_resolution(
                conflict,
                Resolution::KeepRemote,
                ResolutionSource::User,
                &item,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, ConflictError::AlreadyResolved(_)));
    }
}
