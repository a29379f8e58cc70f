//! Per-camera archive lifecycle controller.
//!
//! Periodically reconciles the camera state map against the set of
//! running pipelines: cameras that are on with a nonzero retention get a
//! pipeline, cameras that turn off or lose retention get theirs cancelled
//! and awaited.

use crate::config::{ArchiveConfig, KafkaConfig};
use crate::frame_source::FrameSource;
use crate::index_writer::IndexSink;
use crate::pipeline::ArchivePipeline;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

struct PipelineHandle {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Starts and stops archive pipelines to match reported camera state.
pub struct CameraController<S: IndexSink + 'static> {
    source: Arc<FrameSource>,
    sink: Arc<S>,
    archive: ArchiveConfig,
    kafka: KafkaConfig,
    pipelines: HashMap<String, PipelineHandle>,
}

impl<S: IndexSink + 'static> CameraController<S> {
    /// Create a controller over the shared frame source and index sink.
    pub fn new(source: Arc<FrameSource>, sink: Arc<S>, archive: ArchiveConfig, kafka: KafkaConfig) -> Self {
        Self {
            source,
            sink,
            archive,
            kafka,
            pipelines: HashMap::new(),
        }
    }

    /// Reconcile on a fixed interval until cancelled, then tear down
    /// every running pipeline.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!("Camera controller started");

        let mut ticker = tokio::time::interval(self.archive.controller_interval());

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.reconcile(&cancel).await,
            }
        }

        self.shutdown_all().await;
        info!("Camera controller stopped");
    }

    /// Bring the running pipelines in line with the camera state map.
    async fn reconcile(&mut self, parent: &CancellationToken) {
        // Reap pipelines that ended on their own (e.g. a failed topic
        // registration) so a later state change can restart them.
        self.pipelines.retain(|camera_id, p| {
            if p.handle.is_finished() {
                debug!(camera_id = %camera_id, "Reaping finished pipeline");
                false
            } else {
                true
            }
        });

        for (camera_id, state) in self.source.camera_states() {
            let running = self.pipelines.contains_key(&camera_id);

            if state.wants_archive() && !running {
                self.start_pipeline(&camera_id, parent);
            } else if !state.wants_archive() && running {
                self.stop_pipeline(&camera_id).await;
                self.source.forget_camera(&camera_id);
            }
        }

        metrics::gauge!("archive.pipelines.running").set(self.pipelines.len() as f64);
    }

    fn start_pipeline(&mut self, camera_id: &str, parent: &CancellationToken) {
        let topic = self.kafka.frame_topic(camera_id);
        let pipeline = ArchivePipeline::new(camera_id.to_string(), topic);
        let cancel = parent.child_token();

        let handle = tokio::spawn({
            let source = self.source.clone();
            let sink = self.sink.clone();
            let config = self.archive.clone();
            let cancel = cancel.clone();
            let camera_id = camera_id.to_string();
            async move {
                if let Err(e) = pipeline.run(source, sink, &config, cancel).await {
                    error!(camera_id = %camera_id, error = %e, "Archive pipeline failed");
                }
            }
        });

        info!(camera_id = %camera_id, "Archive enabled for camera");
        self.pipelines.insert(camera_id.to_string(), PipelineHandle { cancel, handle });
    }

    async fn stop_pipeline(&mut self, camera_id: &str) {
        let Some(pipeline) = self.pipelines.remove(camera_id) else {
            return;
        };

        pipeline.cancel.cancel();
        if let Err(e) = pipeline.handle.await {
            error!(camera_id = %camera_id, error = %e, "Pipeline task panicked");
        }

        info!(camera_id = %camera_id, "Archive disabled for camera");
    }

    async fn shutdown_all(&mut self) {
        let cameras: Vec<String> = self.pipelines.keys().cloned().collect();
        for camera_id in cameras {
            self.stop_pipeline(&camera_id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index_store::FragmentIndexUpdate;
    use anyhow::Result;
    use async_trait::async_trait;

    struct NullSink;

    #[async_trait]
    impl IndexSink for NullSink {
        async fn apply(&self, _camera_id: &str, _updates: &[FragmentIndexUpdate]) -> Result<()> {
            Ok(())
        }
    }

    fn test_kafka_config() -> KafkaConfig {
        KafkaConfig {
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
        }
    }

    #[tokio::test]
    async fn test_reconcile_starts_and_stops_pipelines() {
        let kafka = test_kafka_config();
        let source = Arc::new(FrameSource::new(&kafka).unwrap());
        let root = tempfile::TempDir::new().unwrap();
        let archive = ArchiveConfig {
            storage_root: root.path().to_path_buf(),
            fragment_length_secs: 300,
            frame_queue_capacity: 8,
            index_queue_capacity: 8,
            index_batch_size: 50,
            index_flush_interval_secs: 5,
            controller_interval_secs: 5,
            retention_workers: 2,
        };

        let mut controller =
            CameraController::new(source.clone(), Arc::new(NullSink), archive, kafka);
        let parent = CancellationToken::new();

        source.apply_camera_event(
            br#"{"camera_id": "cam1", "status": "on", "archive_retention_days": 7}"#,
        );
        controller.reconcile(&parent).await;
        assert!(controller.pipelines.contains_key("cam1"));

        // Wait for the pipeline to register before flipping it off
        while !source.registered_topics().contains(&"cam1_main".to_string()) {
            tokio::task::yield_now().await;
        }

        source.apply_camera_event(br#"{"camera_id": "cam1", "status": "off"}"#);
        controller.reconcile(&parent).await;
        assert!(controller.pipelines.is_empty());
        assert!(source.registered_topics().is_empty());
        // Torn-down cameras are forgotten entirely
        assert!(source.camera_states().is_empty());

        controller.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_shutdown_stops_all_pipelines() {
        let kafka = test_kafka_config();
        let source = Arc::new(FrameSource::new(&kafka).unwrap());
        let root = tempfile::TempDir::new().unwrap();
        let archive = ArchiveConfig {
            storage_root: root.path().to_path_buf(),
            fragment_length_secs: 300,
            frame_queue_capacity: 8,
            index_queue_capacity: 8,
            index_batch_size: 50,
            index_flush_interval_secs: 5,
            controller_interval_secs: 5,
            retention_workers: 2,
        };

        let mut controller =
            CameraController::new(source.clone(), Arc::new(NullSink), archive, kafka);
        let parent = CancellationToken::new();

        source.apply_camera_event(
            br#"{"camera_id": "cam1", "status": "on", "archive_retention_days": 7}"#,
        );
        source.apply_camera_event(
            br#"{"camera_id": "cam2", "status": "on", "archive_retention_days": 7}"#,
        );
        controller.reconcile(&parent).await;
        assert_eq!(controller.pipelines.len(), 2);

        controller.shutdown_all().await;
        assert!(controller.pipelines.is_empty());
    }
}
