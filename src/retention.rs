//! Retention sweep: deletes expired fragment files and index rows.
//!
//! Runs on a fixed interval, one purge job per camera with bounded
//! concurrency. Deletion operates directly on the filesystem tree and the
//! index table using the same folder/file key scheme the fragment writer
//! uses; the extra fragment length on the cutoff keeps the newest file
//! that may still be partially inside the retention window.

use crate::frame_source::FrameSource;
use crate::index_store::IndexStore;
use crate::model::{FragmentKey, SECONDS_PER_DAY};
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Periodic purge of expired archive data.
pub struct RetentionSweeper {
    source: Arc<FrameSource>,
    store: Arc<IndexStore>,
    storage_root: PathBuf,
    fragment_length: Duration,
    workers: usize,
}

impl RetentionSweeper {
    /// Create a sweeper over the shared camera states and index store.
    pub fn new(
        source: Arc<FrameSource>,
        store: Arc<IndexStore>,
        storage_root: PathBuf,
        fragment_length: Duration,
        workers: usize,
    ) -> Self {
        Self {
            source,
            store,
            storage_root,
            fragment_length,
            workers: workers.max(1),
        }
    }

    /// Sweep once per fragment length until cancelled.
    pub async fn run(self, cancel: CancellationToken) {
        info!("Retention sweep started");

        let mut ticker = tokio::time::interval(self.fragment_length);
        // Skip the immediate first tick; there is nothing to purge that
        // could not wait one fragment length.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Retention sweep stopped");
                    return;
                }
                _ = ticker.tick() => self.sweep().await,
            }
        }
    }

    /// Purge every known camera with bounded concurrency.
    async fn sweep(&self) {
        debug!("Running archive purge");

        let cameras = self.source.camera_states();
        futures::stream::iter(cameras)
            .for_each_concurrent(self.workers, |(camera_id, state)| async move {
                self.purge_camera(&camera_id, state.retention_days).await;
            })
            .await;
    }

    async fn purge_camera(&self, camera_id: &str, retention_days: u32) {
        if retention_days == 0 {
            if let Err(e) = self.store.delete_camera(camera_id).await {
                error!(camera_id = %camera_id, error = %e, "Failed to delete camera index rows");
            }

            let dir = self.storage_root.join(camera_id);
            match fs::remove_dir_all(&dir).await {
                Ok(()) => info!(camera_id = %camera_id, "Removed camera archive"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    error!(camera_id = %camera_id, error = %e, "Failed to remove camera archive")
                }
            }

            self.source.forget_camera(camera_id);
            return;
        }

        let cutoff = cutoff_key(
            chrono::Utc::now().timestamp_millis(),
            retention_days,
            self.fragment_length,
        );

        if let Err(e) = self.store.delete_before(camera_id, cutoff).await {
            error!(camera_id = %camera_id, error = %e, "Failed to delete expired index rows");
        }

        if let Err(e) = remove_files_before(&self.storage_root.join(camera_id), cutoff).await {
            error!(camera_id = %camera_id, error = %e, "Failed to remove expired fragment files");
        }
    }
}

/// Cutoff key for a retention window ending now: everything at or before
/// it is expired. One fragment length is added back so a file spanning
/// the boundary survives.
fn cutoff_key(now_ms: i64, retention_days: u32, fragment_length: Duration) -> FragmentKey {
    let cutoff_ms = now_ms - i64::from(retention_days) * SECONDS_PER_DAY * 1000
        + fragment_length.as_millis() as i64;
    let cutoff_secs = cutoff_ms / 1000;

    FragmentKey {
        folder: cutoff_secs / SECONDS_PER_DAY,
        file: cutoff_secs % SECONDS_PER_DAY,
    }
}

/// Walk a camera's archive tree and delete day folders strictly older
/// than the cutoff, plus fragment files at or before it within the
/// cutoff's own day folder. Unparseable entries are skipped.
async fn remove_files_before(camera_dir: &Path, cutoff: FragmentKey) -> std::io::Result<()> {
    let mut folders = match fs::read_dir(camera_dir).await {
        Ok(folders) => folders,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };

    while let Some(entry) = folders.next_entry().await? {
        if !entry.file_type().await?.is_dir() {
            continue;
        }

        let Some(folder_num) = entry.file_name().to_str().and_then(|s| s.parse::<i64>().ok())
        else {
            continue;
        };

        if folder_num < cutoff.folder {
            match fs::remove_dir_all(entry.path()).await {
                Ok(()) => info!(path = %entry.path().display(), "Removed expired day folder"),
                Err(e) => warn!(path = %entry.path().display(), error = %e, "Failed to remove day folder"),
            }
        } else if folder_num == cutoff.folder {
            remove_fragments_before(&entry.path(), cutoff.file).await?;
        }
    }

    Ok(())
}

async fn remove_fragments_before(day_dir: &Path, cutoff_file: i64) -> std::io::Result<()> {
    let mut files = fs::read_dir(day_dir).await?;

    while let Some(entry) = files.next_entry().await? {
        let path = entry.path();
        let Some(file_num) = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.parse::<i64>().ok())
        else {
            continue;
        };

        if file_num <= cutoff_file {
            match fs::remove_file(&path).await {
                Ok(()) => debug!(path = %path.display(), "Removed expired fragment"),
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove fragment"),
            }
        }
    }

    Ok(())
}
