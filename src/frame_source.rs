//! Kafka frame source shared by every camera pipeline.
//!
//! One consumer subscribes to the camera-state topic plus one frame topic
//! per archived camera. Frame topics are registered and unregistered at
//! runtime through an explicit topic registry owned by this source and
//! injected into pipelines, never a process-global map. Delivery into a
//! camera's frame queue is a blocking handoff: if a fragment writer falls
//! behind, consumption for that camera stalls rather than dropping
//! frames.

use crate::config::KafkaConfig;
use crate::model::{CameraState, CameraStatus, Frame};
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::RwLock;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Headers, Message};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Record header carrying the keyframe flag.
const KEYFRAME_HEADER: &str = "key_frame";

/// Record key marking playable video frames.
const VIDEO_FRAME_KEY: &[u8] = b"video";

/// Errors that can occur in the frame source
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Failed to create consumer: {0}")]
    CreationError(String),

    #[error("Failed to subscribe to topics: {0}")]
    SubscriptionError(String),

    #[error("Topic {0} is already registered")]
    TopicRegistered(String),

    #[error("Topic {0} is not registered")]
    TopicNotRegistered(String),

    #[error("Camera state topic {topic} is unavailable: {message}")]
    TopicUnavailable { topic: String, message: String },
}

/// Camera state event received on the camera-state topic
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraStatusEvent {
    /// Camera identifier
    pub camera_id: String,
    /// Current camera status
    pub status: CameraStatus,
    /// Archive retention in days; 0 disables archiving
    #[serde(default)]
    pub archive_retention_days: u32,
}

/// Kafka consumer that routes frames to registered camera pipelines and
/// tracks camera state events.
pub struct FrameSource {
    consumer: StreamConsumer,
    cameras_topic: String,
    /// topic -> frame sink for that camera's pipeline
    registry: RwLock<HashMap<String, mpsc::Sender<Frame>>>,
    /// camera id -> latest reported state
    states: RwLock<HashMap<String, CameraState>>,
}

impl FrameSource {
    /// Create the consumer and subscribe to the camera-state topic.
    pub fn new(config: &KafkaConfig) -> Result<Self, SourceError> {
        let mut client_config = ClientConfig::new();

        client_config
            .set("bootstrap.servers", &config.bootstrap_servers)
            .set("group.id", &config.consumer_group)
            .set("auto.offset.reset", &config.auto_offset_reset)
            .set("enable.auto.commit", "true")
            .set("session.timeout.ms", config.session_timeout_ms.to_string());

        // Configure SSL if enabled
        if config.ssl_enabled {
            client_config.set("security.protocol", "SASL_SSL");
            if let Some(ref ca_location) = config.ssl_ca_location {
                client_config.set("ssl.ca.location", ca_location);
            }
        }

        // Configure SASL if credentials provided
        if let (Some(ref username), Some(ref password)) =
            (&config.sasl_username, &config.sasl_password)
        {
            client_config
                .set("sasl.mechanisms", "PLAIN")
                .set("sasl.username", username)
                .set("sasl.password", password);
        }

        let consumer: StreamConsumer = client_config
            .create()
            .map_err(|e| SourceError::CreationError(e.to_string()))?;

        consumer
            .subscribe(&[&config.cameras_topic])
            .map_err(|e| SourceError::SubscriptionError(e.to_string()))?;

        info!(topic = %config.cameras_topic, "Subscribed to camera state topic");

        Ok(Self {
            consumer,
            cameras_topic: config.cameras_topic.clone(),
            registry: RwLock::new(HashMap::new()),
            states: RwLock::new(HashMap::new()),
        })
    }

    /// Verify the camera-state topic is reachable, with a bounded wait.
    /// Called once at startup; failure is fatal.
    pub fn verify_camera_topic(&self, timeout: Duration) -> Result<(), SourceError> {
        let metadata = self
            .consumer
            .fetch_metadata(Some(&self.cameras_topic), timeout)
            .map_err(|e| SourceError::TopicUnavailable {
                topic: self.cameras_topic.clone(),
                message: e.to_string(),
            })?;

        let known = metadata
            .topics()
            .iter()
            .any(|t| t.name() == self.cameras_topic && t.error().is_none());

        if !known {
            return Err(SourceError::TopicUnavailable {
                topic: self.cameras_topic.clone(),
                message: "topic missing from broker metadata".to_string(),
            });
        }

        info!(topic = %self.cameras_topic, "Camera state topic exists and is accessible");
        Ok(())
    }

    /// Register a frame sink for a topic and start consuming it.
    pub fn register(&self, topic: &str, sink: mpsc::Sender<Frame>) -> Result<(), SourceError> {
        {
            let mut registry = self.registry.write();
            if registry.contains_key(topic) {
                return Err(SourceError::TopicRegistered(topic.to_string()));
            }
            registry.insert(topic.to_string(), sink);
        }

        self.resubscribe()?;
        info!(topic = %topic, "Registered frame topic");
        Ok(())
    }

    /// Drop a topic's frame sink and stop consuming it. Dropping the sink
    /// closes the pipeline's frame queue, so unregistering doubles as the
    /// queue-close signal.
    pub fn unregister(&self, topic: &str) -> Result<(), SourceError> {
        {
            let mut registry = self.registry.write();
            if registry.remove(topic).is_none() {
                return Err(SourceError::TopicNotRegistered(topic.to_string()));
            }
        }

        self.resubscribe()?;
        info!(topic = %topic, "Unregistered frame topic");
        Ok(())
    }

    /// Currently registered frame topics.
    pub fn registered_topics(&self) -> Vec<String> {
        self.registry.read().keys().cloned().collect()
    }

    /// Snapshot of the latest known camera states.
    pub fn camera_states(&self) -> Vec<(String, CameraState)> {
        self.states
            .read()
            .iter()
            .map(|(id, state)| (id.clone(), *state))
            .collect()
    }

    /// Forget a camera's state entirely (after its archive is torn down).
    pub fn forget_camera(&self, camera_id: &str) {
        self.states.write().remove(camera_id);
    }

    /// Rebuild the consumer subscription from the camera-state topic plus
    /// every registered frame topic.
    fn resubscribe(&self) -> Result<(), SourceError> {
        let topics: Vec<String> = {
            let registry = self.registry.read();
            std::iter::once(self.cameras_topic.clone())
                .chain(registry.keys().cloned())
                .collect()
        };
        let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();

        self.consumer
            .subscribe(&topic_refs)
            .map_err(|e| SourceError::SubscriptionError(e.to_string()))
    }

    /// Consume until cancellation, dispatching camera state events and
    /// frames.
    #[instrument(skip(self, cancel))]
    pub async fn run(&self, cancel: CancellationToken) {
        info!("Frame source consumer started");

        let stream = self.consumer.stream();
        tokio::pin!(stream);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Frame source consumer stopping");
                    break;
                }
                message = stream.next() => match message {
                    Some(Ok(message)) => self.dispatch(&message).await,
                    Some(Err(e)) => {
                        error!(error = %e, "Kafka consumer error");
                        metrics::counter!("archive.kafka.errors").increment(1);
                    }
                    None => {
                        warn!("Kafka message stream ended");
                        break;
                    }
                },
            }
        }
    }

    async fn dispatch(&self, message: &BorrowedMessage<'_>) {
        if message.topic() == self.cameras_topic {
            self.apply_camera_event(message.payload().unwrap_or_default());
            return;
        }

        // Clone the sink out of the registry so the lock is not held
        // across the blocking handoff.
        let sink = self.registry.read().get(message.topic()).cloned();

        let Some(sink) = sink else {
            warn!(topic = %message.topic(), "Received message for unknown topic");
            return;
        };

        let frame = frame_from_parts(
            message.topic(),
            message.key(),
            &header_map(message),
            message
                .timestamp()
                .to_millis()
                .unwrap_or_else(|| chrono::Utc::now().timestamp_millis()),
            message.payload().unwrap_or_default(),
        );

        metrics::counter!("archive.frames.received").increment(1);

        // Blocking handoff: backpressure from a slow fragment writer
        // stalls consumption for this camera instead of losing frames.
        if sink.send(frame).await.is_err() {
            warn!(topic = %message.topic(), "Frame sink closed, frame discarded");
        }
    }

    /// Decode and apply one camera state event.
    pub(crate) fn apply_camera_event(&self, payload: &[u8]) {
        let event: CameraStatusEvent = match serde_json::from_slice(payload) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "Failed to decode camera state event");
                return;
            }
        };

        debug!(
            camera_id = %event.camera_id,
            status = ?event.status,
            retention_days = event.archive_retention_days,
            "Camera state update"
        );

        self.states.write().insert(
            event.camera_id,
            CameraState {
                status: event.status,
                retention_days: event.archive_retention_days,
            },
        );
    }
}

/// Collect record headers into a map.
fn header_map(message: &BorrowedMessage<'_>) -> HashMap<String, String> {
    let mut headers = HashMap::new();
    if let Some(h) = message.headers() {
        for header in h.iter() {
            if let Some(value) = header.value {
                if let Ok(v) = String::from_utf8(value.to_vec()) {
                    headers.insert(header.key.to_string(), v);
                }
            }
        }
    }
    headers
}

/// Build a [`Frame`] from the transport-level parts of one record. The
/// camera id is the topic prefix before the stream suffix; the keyframe
/// and playable flags come from the record header and key the broker
/// owns.
fn frame_from_parts(
    topic: &str,
    key: Option<&[u8]>,
    headers: &HashMap<String, String>,
    timestamp_ms: i64,
    payload: &[u8],
) -> Frame {
    Frame {
        camera_id: topic.split('_').next().unwrap_or(topic).to_string(),
        timestamp_ms,
        payload: Bytes::copy_from_slice(payload),
        is_keyframe: headers.get(KEYFRAME_HEADER).map(|v| v == "1").unwrap_or(false),
        is_video: key == Some(VIDEO_FRAME_KEY),
    }
}
