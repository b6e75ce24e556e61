//! Bounded-parallelism transfer pool
//!
//! Executes the upload and download legs of a reconciliation plan with
//! concurrency capped at `Account::max_parallel_transfers()`, one semaphore
//! permit per in-flight transfer. Mirrors how `lnxdrive-fuse`'s
//! `HydrationManager` bounds concurrent hydrations: a shared `Semaphore`,
//! each transfer spawned as its own task over owned `Arc` clones (the pool
//! itself is never `'static`-borrowed by the caller).
//!
//! Uploads and downloads are two independent entry points rather than one
//! pool that interleaves both; the caller is responsible for running all
//! uploads to completion before starting downloads.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use onedrive_sync_core::domain::newtypes::{
    FileHash, HashedAccountId, RemoteId, RemotePath, SyncPath,
};
use onedrive_sync_core::domain::sync_item::{ItemState, SyncItem};
use onedrive_sync_core::ports::cloud_provider::ICloudProvider;
use onedrive_sync_core::ports::local_filesystem::ILocalFileSystem;
use onedrive_sync_core::ports::state_repository::IStateRepository;
use onedrive_sync_core::usecases::ProgressCoordinator;

use crate::engine::{split_remote_path, with_retry};

/// One path queued for transfer, paired with whatever record the caller
/// already holds for it.
///
/// For uploads, `existing` is `None` for a brand-new local file with no
/// `SyncItem` yet. For downloads, `existing` is always `Some`: the
/// reconciler only classifies paths the state store already carries a
/// record for as downloads.
pub struct TransferJob {
    pub relative_path: String,
    pub existing: Option<SyncItem>,
}

/// Outcome of one queued transfer.
pub struct TransferOutcome {
    pub relative_path: String,
    pub bytes: u64,
    pub error: Option<String>,
}

/// Executes uploads and downloads with concurrency bounded by a semaphore
/// sized from `Account::max_parallel_transfers()`.
pub struct TransferPool {
    cloud_provider: Arc<dyn ICloudProvider + Send + Sync>,
    state_repository: Arc<dyn IStateRepository + Send + Sync>,
    local_filesystem: Arc<dyn ILocalFileSystem + Send + Sync>,
    semaphore: Arc<Semaphore>,
    large_file_threshold: u64,
}

impl TransferPool {
    pub fn new(
        cloud_provider: Arc<dyn ICloudProvider + Send + Sync>,
        state_repository: Arc<dyn IStateRepository + Send + Sync>,
        local_filesystem: Arc<dyn ILocalFileSystem + Send + Sync>,
        max_parallel: u32,
        large_file_threshold: u64,
    ) -> Self {
        Self {
            cloud_provider,
            state_repository,
            local_filesystem,
            semaphore: Arc::new(Semaphore::new(max_parallel.max(1) as usize)),
            large_file_threshold,
        }
    }

    /// Uploads every job, at most `max_parallel` active at once.
    pub async fn run_uploads(
        &self,
        jobs: Vec<TransferJob>,
        sync_root: &SyncPath,
        hashed_account_id: HashedAccountId,
        progress: &ProgressCoordinator,
        cancel: &CancellationToken,
    ) -> Vec<TransferOutcome> {
        let mut set: JoinSet<TransferOutcome> = JoinSet::new();

        for job in jobs {
            if cancel.is_cancelled() {
                break;
            }
            let permit = Arc::clone(&self.semaphore);
            let cloud_provider = Arc::clone(&self.cloud_provider);
            let state_repository = Arc::clone(&self.state_repository);
            let local_filesystem = Arc::clone(&self.local_filesystem);
            let sync_root = sync_root.clone();
            let large_file_threshold = self.large_file_threshold;

            progress.start_upload();
            set.spawn(async move {
                let _permit = permit.acquire_owned().await;
                let relative_path = job.relative_path.clone();
                match upload_one(
                    &cloud_provider,
                    &state_repository,
                    &local_filesystem,
                    &sync_root,
                    hashed_account_id,
                    large_file_threshold,
                    job,
                )
                .await
                {
                    Ok(bytes) => TransferOutcome {
                        relative_path,
                        bytes,
                        error: None,
                    },
                    Err(err) => TransferOutcome {
                        relative_path,
                        bytes: 0,
                        error: Some(format!("{err:#}")),
                    },
                }
            });
        }

        let mut outcomes = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(outcome) => {
                    if let Some(ref err) = outcome.error {
                        warn!(path = %outcome.relative_path, %err, "Upload failed");
                    } else {
                        progress.finish_upload(outcome.bytes);
                    }
                    outcomes.push(outcome);
                }
                Err(join_err) => warn!(%join_err, "Upload task panicked"),
            }
        }
        outcomes
    }

    /// Downloads every job, at most `max_parallel` active at once. Callers
    /// must not invoke this before `run_uploads` for the same cycle has
    /// finished: a download landing first could overwrite a local file that
    /// was due to be uploaded.
    pub async fn run_downloads(
        &self,
        jobs: Vec<TransferJob>,
        sync_root: &SyncPath,
        progress: &ProgressCoordinator,
        cancel: &CancellationToken,
    ) -> Vec<TransferOutcome> {
        let mut set: JoinSet<TransferOutcome> = JoinSet::new();

        for job in jobs {
            if cancel.is_cancelled() {
                break;
            }
            let permit = Arc::clone(&self.semaphore);
            let cloud_provider = Arc::clone(&self.cloud_provider);
            let state_repository = Arc::clone(&self.state_repository);
            let local_filesystem = Arc::clone(&self.local_filesystem);
            let sync_root = sync_root.clone();

            progress.start_download();
            set.spawn(async move {
                let _permit = permit.acquire_owned().await;
                let relative_path = job.relative_path.clone();
                match download_one(
                    &cloud_provider,
                    &state_repository,
                    &local_filesystem,
                    &sync_root,
                    job,
                )
                .await
                {
                    Ok(bytes) => TransferOutcome {
                        relative_path,
                        bytes,
                        error: None,
                    },
                    Err(err) => TransferOutcome {
                        relative_path,
                        bytes: 0,
                        error: Some(format!("{err:#}")),
                    },
                }
            });
        }

        let mut outcomes = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(outcome) => {
                    if let Some(ref err) = outcome.error {
                        warn!(path = %outcome.relative_path, %err, "Download failed");
                    } else {
                        progress.finish_download(outcome.bytes);
                    }
                    outcomes.push(outcome);
                }
                Err(join_err) => warn!(%join_err, "Download task panicked"),
            }
        }
        outcomes
    }
}

/// Advances `item` to `Uploading` from whatever state it is in, tolerating
/// the states a reconciled upload path can actually arrive in.
fn advance_to_uploading(item: &mut SyncItem) -> Result<()> {
    if !matches!(item.state(), ItemState::Uploading) {
        if !matches!(item.state(), ItemState::PendingUpload | ItemState::Failed(_)) {
            item.queue_upload()
                .map_err(|e| anyhow::anyhow!("Failed to queue upload: {e}"))?;
        }
        item.start_uploading()
            .map_err(|e| anyhow::anyhow!("Failed to start uploading: {e}"))?;
    }
    Ok(())
}

/// Advances `item` to `Downloading` from whatever state it is in.
fn advance_to_downloading(item: &mut SyncItem) -> Result<()> {
    if !matches!(item.state(), ItemState::Downloading) {
        if !matches!(item.state(), ItemState::PendingDownload | ItemState::Failed(_)) {
            item.queue_download()
                .map_err(|e| anyhow::anyhow!("Failed to queue download: {e}"))?;
        }
        item.start_downloading()
            .map_err(|e| anyhow::anyhow!("Failed to start downloading: {e}"))?;
    }
    Ok(())
}

async fn upload_one(
    cloud_provider: &Arc<dyn ICloudProvider + Send + Sync>,
    state_repository: &Arc<dyn IStateRepository + Send + Sync>,
    local_filesystem: &Arc<dyn ILocalFileSystem + Send + Sync>,
    sync_root: &SyncPath,
    hashed_account_id: HashedAccountId,
    large_file_threshold: u64,
    job: TransferJob,
) -> Result<u64> {
    let local_path = SyncPath::new(sync_root.as_path().join(&job.relative_path))
        .context("Failed to construct local path for upload")?;

    let data = local_filesystem
        .read_file(&local_path)
        .await
        .context("Failed to read local file for upload")?;

    let remote_path_str = format!("/{}", job.relative_path).replace('\\', "/");
    let (parent_remote_path, file_name) = split_remote_path(&remote_path_str)?;

    let delta_item = if data.len() as u64 > large_file_threshold {
        with_retry("upload_file_session", || {
            let parent = parent_remote_path.clone();
            let name = file_name.clone();
            let d = data.clone();
            let provider = Arc::clone(cloud_provider);
            async move { provider.upload_file_session(&parent, &name, &d, None).await }
        })
        .await
        .context("Failed to upload large file")?
    } else {
        with_retry("upload_file", || {
            let parent = parent_remote_path.clone();
            let name = file_name.clone();
            let d = data.clone();
            let provider = Arc::clone(cloud_provider);
            async move { provider.upload_file(&parent, &name, &d, None).await }
        })
        .await
        .context("Failed to upload file")?
    };

    let remote_id =
        RemoteId::new(delta_item.id.clone()).context("Invalid remote ID in upload response")?;
    let remote_path =
        RemotePath::new(remote_path_str).context("Failed to construct remote path")?;
    let content_hash = delta_item
        .hash
        .as_ref()
        .and_then(|h| FileHash::new(h.clone()).ok());
    let size = delta_item.size.unwrap_or(data.len() as u64);
    let remote_modified = delta_item.modified.unwrap_or_else(Utc::now);

    let mut item = match job.existing {
        Some(mut existing) => {
            existing.set_remote_id(remote_id);
            existing.update_remote_path(remote_path);
            existing.set_size_bytes(size);
            if let Some(hash) = content_hash {
                existing.set_content_hash(hash);
            }
            existing.set_last_modified_remote(remote_modified);
            existing
        }
        None => {
            let mut fresh =
                SyncItem::new_file(hashed_account_id, local_path.clone(), remote_path, size, None)?;
            fresh.set_remote_id(remote_id);
            if let Some(hash) = content_hash {
                fresh.set_content_hash(hash);
            }
            fresh.set_last_modified_remote(remote_modified);
            fresh
        }
    };

    advance_to_uploading(&mut item)?;
    item.complete_sync()?;
    item.set_last_modified_local(Utc::now());

    if let Ok(local_hash) = local_filesystem.compute_hash(&local_path).await {
        item.set_local_hash(local_hash);
    }

    state_repository
        .save_item(&item)
        .await
        .context("Failed to persist uploaded item")?;

    Ok(size)
}

async fn download_one(
    cloud_provider: &Arc<dyn ICloudProvider + Send + Sync>,
    state_repository: &Arc<dyn IStateRepository + Send + Sync>,
    local_filesystem: &Arc<dyn ILocalFileSystem + Send + Sync>,
    sync_root: &SyncPath,
    job: TransferJob,
) -> Result<u64> {
    let mut item = job
        .existing
        .context("Download job is missing its SyncItem")?;
    let remote_id = item
        .remote_id()
        .context("Item has no remote ID to download")?
        .clone();

    let data = with_retry("download_file", || {
        let rid = remote_id.clone();
        let provider = Arc::clone(cloud_provider);
        async move { provider.download_file(&rid).await }
    })
    .await
    .context("Failed to download file")?;

    let local_path = SyncPath::new(sync_root.as_path().join(&job.relative_path))
        .context("Failed to construct local path for download")?;

    local_filesystem
        .write_file(&local_path, &data)
        .await
        .context("Failed to write downloaded file")?;

    advance_to_downloading(&mut item)?;
    item.complete_sync()?;
    item.set_last_modified_local(Utc::now());

    if let Ok(local_hash) = local_filesystem.compute_hash(&local_path).await {
        item.set_local_hash(local_hash);
    }

    let size = data.len() as u64;
    state_repository
        .save_item(&item)
        .await
        .context("Failed to persist downloaded item")?;

    Ok(size)
}
