//! Per-camera archive pipeline.
//!
//! Wires one camera's frame source registration, fragment writer and
//! index batch writer together and owns their lifecycle. Teardown order
//! matters: the topic is unregistered first so the source stops writing
//! into a queue that is about to close, then the queues close by sender
//! drop and both tasks drain and stop.

use crate::config::ArchiveConfig;
use crate::fragment_writer::FragmentWriter;
use crate::frame_source::{FrameSource, SourceError};
use crate::index_writer::{IndexBatchWriter, IndexSink};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Archive pipeline for a single camera.
pub struct ArchivePipeline {
    camera_id: String,
    topic: String,
}

impl ArchivePipeline {
    /// Create a pipeline for one camera consuming the given frame topic.
    pub fn new(camera_id: String, topic: String) -> Self {
        Self { camera_id, topic }
    }

    /// Run until cancelled: register with the frame source, run the two
    /// writer tasks, and on cancellation unregister, drain and stop.
    pub async fn run<S: IndexSink + 'static>(
        self,
        source: Arc<FrameSource>,
        sink: Arc<S>,
        config: &ArchiveConfig,
        cancel: CancellationToken,
    ) -> Result<(), SourceError> {
        let (frame_tx, frame_rx) = mpsc::channel(config.frame_queue_capacity);
        let (index_tx, index_rx) = mpsc::channel(config.index_queue_capacity);

        // The registry owns the only frame sender; unregistering later is
        // what closes the frame queue.
        source.register(&self.topic, frame_tx)?;

        let writer = FragmentWriter::new(
            self.camera_id.clone(),
            config.storage_root.clone(),
            config.fragment_length(),
            index_tx,
        );
        let batcher = IndexBatchWriter::new(
            self.camera_id.clone(),
            config.index_batch_size,
            config.index_flush_interval(),
        );

        let writer_handle = tokio::spawn(writer.run(frame_rx, cancel.clone()));
        let batcher_handle = tokio::spawn(batcher.run(sink, index_rx, cancel.clone()));

        info!(camera_id = %self.camera_id, topic = %self.topic, "Archive pipeline started");

        cancel.cancelled().await;

        if let Err(e) = source.unregister(&self.topic) {
            warn!(camera_id = %self.camera_id, error = %e, "Failed to unregister frame topic");
        }

        if let Err(e) = writer_handle.await {
            error!(camera_id = %self.camera_id, error = %e, "Fragment writer task panicked");
        }
        if let Err(e) = batcher_handle.await {
            error!(camera_id = %self.camera_id, error = %e, "Index batch writer task panicked");
        }

        info!(camera_id = %self.camera_id, "Archive pipeline stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KafkaConfig;
    use crate::index_store::FragmentIndexUpdate;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::path::PathBuf;

    struct NullSink;

    #[async_trait]
    impl IndexSink for NullSink {
        async fn apply(&self, _camera_id: &str, _updates: &[FragmentIndexUpdate]) -> Result<()> {
            Ok(())
        }
    }

    fn test_source() -> Arc<FrameSource> {
        let kafka = KafkaConfig {
            bootstrap_servers: "localhost:9092".to_string(),
            consumer_group: "archive-manager-test".to_string(),
            cameras_topic: "mediaserver.cameras".to_string(),
            stream_suffix: "_main".to_string(),
            ssl_enabled: false,
            ssl_ca_location: None,
            sasl_username: None,
            sasl_password: None,
            auto_offset_reset: "latest".to_string(),
            session_timeout_ms: 30000,
            metadata_timeout_secs: 10,
        };
        Arc::new(FrameSource::new(&kafka).unwrap())
    }

    fn test_archive_config(root: PathBuf) -> ArchiveConfig {
        ArchiveConfig {
            storage_root: root,
            fragment_length_secs: 300,
            frame_queue_capacity: 8,
            index_queue_capacity: 8,
            index_batch_size: 50,
            index_flush_interval_secs: 5,
            controller_interval_secs: 5,
            retention_workers: 2,
        }
    }

    #[tokio::test]
    async fn test_pipeline_registers_and_releases_topic() {
        let source = test_source();
        let root = tempfile::TempDir::new().unwrap();
        let config = test_archive_config(root.path().to_path_buf());
        let cancel = CancellationToken::new();

        let pipeline = ArchivePipeline::new("cam1".to_string(), "cam1_main".to_string());
        let handle = tokio::spawn({
            let source = source.clone();
            let cancel = cancel.clone();
            async move { pipeline.run(source, Arc::new(NullSink), &config, cancel).await }
        });

        // Wait until the pipeline has claimed its topic.
        while !source.registered_topics().contains(&"cam1_main".to_string()) {
            tokio::task::yield_now().await;
        }

        cancel.cancel();
        handle.await.unwrap().unwrap();

        // After shutdown the topic is free again.
        let (tx2, _rx2) = mpsc::channel(1);
        assert!(source.register("cam1_main", tx2).is_ok());
    }
}
