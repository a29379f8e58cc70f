//! Fragment file writer for one camera.
//!
//! Consumes frames from the camera's frame queue and appends their
//! payloads to time-bucketed fragment files under
//! `<storage_root>/<camera_id>/<day_folder>/<bucket_start>.bin`. Every
//! fragment starts at a keyframe: rotation is only ever considered when a
//! keyframe arrives, so no frame payload is split across files and every
//! file is independently decodable from byte 0.
//!
//! For each keyframe the writer emits a [`KeyframeEntry`] carrying the
//! byte offset the keyframe starts at and the number of playable frames
//! written before it; closing a fragment emits a [`FragmentFinalized`]
//! with the definitive playable total. Both hand-offs are non-blocking:
//! the index is soft state and must never stall file writes.

use crate::model::{Frame, FragmentFinalized, FragmentKey, IndexRecord, KeyframeEntry};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Errors that can occur while writing fragment files.
#[derive(Debug, Error)]
pub enum WriterError {
    #[error("failed to create directory {path}: {source}")]
    CreateDir { path: PathBuf, source: std::io::Error },

    #[error("failed to create fragment file {path}: {source}")]
    CreateFile { path: PathBuf, source: std::io::Error },

    #[error("failed to write frame to {path}: {source}")]
    WriteFrame { path: PathBuf, source: std::io::Error },
}

/// The currently open fragment file and its byte/frame accounting.
struct OpenFragment {
    file: File,
    path: PathBuf,
    key: FragmentKey,
    /// Next write position == bytes written so far
    offset: i64,
    /// Playable frames written to this fragment so far
    playable_frames: i64,
    opened_at: Instant,
}

/// Writes one camera's frames into rotated fragment files.
pub struct FragmentWriter {
    camera_id: String,
    storage_root: PathBuf,
    fragment_length: Duration,
    fragment_secs: i64,
    index_tx: mpsc::Sender<IndexRecord>,
    current: Option<OpenFragment>,
}

impl FragmentWriter {
    /// Create a writer for one camera. No file is opened until the first
    /// retained keyframe arrives.
    pub fn new(
        camera_id: String,
        storage_root: PathBuf,
        fragment_length: Duration,
        index_tx: mpsc::Sender<IndexRecord>,
    ) -> Self {
        let fragment_secs = (fragment_length.as_secs() as i64).max(1);

        Self {
            camera_id,
            storage_root,
            fragment_length,
            fragment_secs,
            index_tx,
            current: None,
        }
    }

    /// Consume frames until cancellation or queue closure. Errors on
    /// individual frames are logged and processing continues; the open
    /// fragment is finalized on the way out.
    pub async fn run(mut self, mut frames: mpsc::Receiver<Frame>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(camera_id = %self.camera_id, "Fragment writer stopping");
                    break;
                }
                frame = frames.recv() => match frame {
                    Some(frame) => {
                        if let Err(e) = self.process_frame(frame).await {
                            error!(camera_id = %self.camera_id, error = %e, "Error processing frame");
                            metrics::counter!("archive.frames.errors").increment(1);
                        }
                    }
                    None => {
                        info!(camera_id = %self.camera_id, "Frame queue closed");
                        break;
                    }
                },
            }
        }

        self.finalize_current().await;
    }

    /// Process a single frame: open/rotate the fragment as needed, append
    /// the payload, and emit index records for keyframes.
    pub async fn process_frame(&mut self, frame: Frame) -> Result<(), WriterError> {
        if frame.payload.is_empty() {
            return Ok(());
        }

        let key = FragmentKey::from_timestamp(frame.timestamp_ms, self.fragment_secs);

        let needs_new_fragment = match &self.current {
            None => {
                // Frames before the first retained keyframe can never be
                // seeked to; drop them.
                if !frame.is_keyframe {
                    trace!(
                        camera_id = %self.camera_id,
                        timestamp_ms = frame.timestamp_ms,
                        "Discarding frame before first keyframe"
                    );
                    metrics::counter!("archive.frames.discarded").increment(1);
                    return Ok(());
                }
                true
            }
            Some(open) => frame.is_keyframe && self.should_rotate(open, key),
        };

        if needs_new_fragment {
            self.finalize_current().await;
            self.open_fragment(&frame, key).await?;
        }

        let Some(open) = self.current.as_mut() else {
            return Ok(());
        };

        let written = frame.payload.len() as i64;
        let offset_before = open.offset;
        let frames_before = open.playable_frames;
        let fragment_key = open.key;

        open.file
            .write_all(&frame.payload)
            .await
            .map_err(|source| WriterError::WriteFrame { path: open.path.clone(), source })?;

        open.offset += written;
        if frame.is_video {
            open.playable_frames += 1;
        }

        metrics::counter!("archive.bytes.written").increment(written as u64);

        if frame.is_keyframe {
            self.emit(IndexRecord::Keyframe(KeyframeEntry {
                camera_id: self.camera_id.clone(),
                key: fragment_key,
                timestamp_ms: frame.timestamp_ms,
                byte_offset: offset_before,
                frames_before,
            }));
        }

        Ok(())
    }

    /// Rotation is due when the keyframe's bucket differs from the open
    /// fragment's, or the fragment has been open for the nominal length.
    /// Keyframe cadence is irregular, so the elapsed check catches the
    /// first keyframe at or past the threshold.
    fn should_rotate(&self, open: &OpenFragment, key: FragmentKey) -> bool {
        open.key != key || open.opened_at.elapsed() >= self.fragment_length
    }

    async fn open_fragment(&mut self, frame: &Frame, key: FragmentKey) -> Result<(), WriterError> {
        let dir = self
            .storage_root
            .join(&frame.camera_id)
            .join(key.folder.to_string());

        fs::create_dir_all(&dir)
            .await
            .map_err(|source| WriterError::CreateDir { path: dir.clone(), source })?;

        let path = dir.join(key.file_name());
        let file = File::create(&path)
            .await
            .map_err(|source| WriterError::CreateFile { path: path.clone(), source })?;

        info!(
            camera_id = %self.camera_id,
            path = %path.display(),
            "Created fragment file"
        );
        metrics::counter!("archive.fragments.created").increment(1);

        self.current = Some(OpenFragment {
            file,
            path,
            key,
            offset: 0,
            playable_frames: 0,
            opened_at: Instant::now(),
        });

        Ok(())
    }

    /// Close the open fragment, emitting its finalization record with the
    /// definitive playable-frame total.
    async fn finalize_current(&mut self) {
        let Some(mut open) = self.current.take() else {
            return;
        };

        self.emit(IndexRecord::Finalized(FragmentFinalized {
            camera_id: self.camera_id.clone(),
            key: open.key,
            total_frames: open.playable_frames,
        }));

        if let Err(e) = open.file.flush().await {
            warn!(
                camera_id = %self.camera_id,
                path = %open.path.display(),
                error = %e,
                "Failed to flush fragment file on close"
            );
        }

        debug!(
            camera_id = %self.camera_id,
            path = %open.path.display(),
            bytes = open.offset,
            playable_frames = open.playable_frames,
            "Closed fragment file"
        );
        metrics::counter!("archive.fragments.finalized").increment(1);
    }

    /// Non-blocking handoff to the index batch writer. A full queue drops
    /// the record with a warning; the keyframe index tolerates bounded
    /// gaps, stalled file writes do not.
    fn emit(&self, record: IndexRecord) {
        match self.index_tx.try_send(record) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(camera_id = %self.camera_id, "Index queue full, dropping record");
                metrics::counter!("archive.index.records_dropped").increment(1);
            }
            Err(TrySendError::Closed(_)) => {
                debug!(camera_id = %self.camera_id, "Index queue closed, record discarded");
            }
        }
    }
}
