//! Shared data types for the archive pipeline.
//!
//! Frames flow from the broker into a per-camera [`FragmentWriter`], which
//! emits [`IndexRecord`]s toward the per-camera index batch writer. The
//! time-bucket arithmetic that names fragment files lives here so the
//! writer, the index store and the retention sweep all agree on it.
//!
//! [`FragmentWriter`]: crate::fragment_writer::FragmentWriter

use bytes::Bytes;

/// Seconds in a day; day folders are numbered `timestamp_secs / 86_400`.
pub const SECONDS_PER_DAY: i64 = 86_400;

/// A single frame handed off by the frame source.
///
/// The payload is an opaque byte blob; the pipeline never parses codec
/// structure. Timestamps are epoch milliseconds and arrive non-decreasing
/// per camera (an input invariant owned by the broker, not re-verified
/// here).
#[derive(Debug, Clone)]
pub struct Frame {
    /// Camera identifier
    pub camera_id: String,
    /// Capture timestamp in milliseconds since epoch
    pub timestamp_ms: i64,
    /// Opaque frame payload
    pub payload: Bytes,
    /// True if this frame can be decoded independently
    pub is_keyframe: bool,
    /// True if this frame counts toward the playable-frame tally
    pub is_video: bool,
}

/// Identity of one fragment file: `<storage_root>/<camera>/<folder>/<file>.bin`.
///
/// `folder` is the day number since epoch, `file` the bucket-start second
/// of day. Ordering is chronological, which retention relies on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FragmentKey {
    /// Day folder: `timestamp_secs / 86_400`
    pub folder: i64,
    /// Bucket start second of day: `sod - sod % fragment_secs`
    pub file: i64,
}

impl FragmentKey {
    /// Compute the fragment key containing `timestamp_ms` for the given
    /// nominal fragment length in seconds.
    pub fn from_timestamp(timestamp_ms: i64, fragment_secs: i64) -> Self {
        let secs = timestamp_ms / 1000;
        let second_of_day = secs % SECONDS_PER_DAY;

        Self {
            folder: secs / SECONDS_PER_DAY,
            file: second_of_day - second_of_day % fragment_secs,
        }
    }

    /// File name of the fragment inside its day folder.
    pub fn file_name(&self) -> String {
        format!("{}.bin", self.file)
    }
}

/// Index entry for one keyframe, produced in fragment-file order.
///
/// `byte_offset` points at the keyframe's first byte within its fragment
/// file; `frames_before` counts the playable frames written strictly
/// before it. The first keyframe of every fragment carries (0, 0).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyframeEntry {
    pub camera_id: String,
    pub key: FragmentKey,
    pub timestamp_ms: i64,
    pub byte_offset: i64,
    pub frames_before: i64,
}

/// Produced exactly once when a fragment closes, carrying the definitive
/// playable-frame total. Until it arrives, any persisted total for the
/// fragment is only a lower bound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentFinalized {
    pub camera_id: String,
    pub key: FragmentKey,
    pub total_frames: i64,
}

/// One item on the index-entry queue between the fragment writer and the
/// index batch writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexRecord {
    Keyframe(KeyframeEntry),
    Finalized(FragmentFinalized),
}

impl IndexRecord {
    /// Fragment this record belongs to.
    pub fn key(&self) -> FragmentKey {
        match self {
            IndexRecord::Keyframe(entry) => entry.key,
            IndexRecord::Finalized(done) => done.key,
        }
    }
}

/// Camera power/archive state as reported on the camera-state topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CameraStatus {
    On,
    Off,
}

/// Latest known state of one camera, kept by the frame source and read
/// by the lifecycle controller and the retention sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CameraState {
    pub status: CameraStatus,
    pub retention_days: u32,
}

impl CameraState {
    /// Whether this camera should have a running archive pipeline.
    pub fn wants_archive(&self) -> bool {
        self.status == CameraStatus::On && self.retention_days > 0
    }
}
