//! MediaServer Archive Manager
//!
//! Archives continuous per-camera frame streams to disk as time-bucketed
//! binary fragment files and maintains a seek-capable keyframe index in
//! PostgreSQL. Frames arrive over Kafka as opaque payloads tagged with a
//! keyframe flag; every fragment file begins at a keyframe so a player
//! can open any file and decode from byte 0, seeking within it via the
//! indexed byte offsets.
//!
//! ## Architecture
//!
//! ```text
//! Kafka Topics                 Filesystem                PostgreSQL
//! ┌───────────────┐           ┌────────────────┐       ┌────────────────┐
//! │ cam1_main ... │           │ <root>/<cam>/  │       │ iframe_byte_   │
//! │ camera states │           │   <day>/       │       │ offsets        │
//! └───────────────┘           │   <bucket>.bin │       └────────────────┘
//!         │                   └────────────────┘               ▲
//!         ▼                           ▲                        │
//! ┌───────────────┐   frames  ┌───────────────┐  index  ┌───────────────┐
//! │ Frame Source  │──────────▶│ Fragment      │────────▶│ Index Batch   │
//! │ (topic        │  (bounded,│ Writer        │ (bounded│ Writer        │
//! │  registry)    │  blocking)│ (per camera)  │  lossy) │ (per camera)  │
//! └───────────────┘           └───────────────┘         └───────────────┘
//!         ▲                           ▲                        ▲
//!         │        ┌──────────────────┴────────────────────────┘
//!         │        │ one pipeline per archived camera
//! ┌───────┴────────┴──┐           ┌─────────────────┐
//! │ Camera Controller │           │ Retention Sweep │
//! └───────────────────┘           └─────────────────┘
//! ```
//!
//! Each archived camera runs an independent pipeline of two tasks joined
//! by bounded queues. The frame handoff blocks (frames are never silently
//! dropped past ingestion); the index handoff drops on overflow (the
//! index is soft state and must not stall file writes).

pub mod api;
pub mod config;
pub mod controller;
pub mod fragment_writer;
pub mod frame_source;
pub mod index_store;
pub mod index_writer;
pub mod model;
pub mod pipeline;
pub mod retention;

pub use config::Config;
pub use controller::CameraController;
pub use fragment_writer::{FragmentWriter, WriterError};
pub use frame_source::{CameraStatusEvent, FrameSource, SourceError};
pub use index_store::{FragmentIndexUpdate, IframeIndex, IndexStore};
pub use index_writer::{IndexBatchWriter, IndexSink};
pub use model::{CameraState, CameraStatus, Frame, FragmentKey, IndexRecord};
pub use pipeline::ArchivePipeline;
pub use retention::RetentionSweeper;
