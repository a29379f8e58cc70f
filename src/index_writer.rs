//! Batched, transactional persistence of keyframe index records.
//!
//! One `IndexBatchWriter` runs per archived camera. It buffers records
//! from the fragment writer and flushes them on whichever comes first: a
//! full batch or the periodic timer. A flush groups the buffer by
//! fragment, applies every group in one transaction through the
//! [`IndexSink`], and clears the buffer only after a successful commit —
//! a failed flush keeps the buffer intact so the same records are retried
//! on the next trigger.

use crate::index_store::{FragmentIndexUpdate, IframeIndex, IndexStore};
use crate::model::IndexRecord;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Persistence seam for flushed index batches.
#[async_trait]
pub trait IndexSink: Send + Sync {
    /// Apply one camera's grouped updates atomically: all groups commit
    /// or none do.
    async fn apply(&self, camera_id: &str, updates: &[FragmentIndexUpdate]) -> Result<()>;
}

#[async_trait]
impl IndexSink for IndexStore {
    async fn apply(&self, camera_id: &str, updates: &[FragmentIndexUpdate]) -> Result<()> {
        self.apply_updates(camera_id, updates).await
    }
}

/// Group buffered records by fragment, preserving arrival order both
/// across groups (first appearance) and within each group's entry list.
///
/// Only finalization records establish a total candidate; a keyframe
/// entry's preceding-frame count is a point-in-time value, not a fragment
/// total.
pub fn group_records(batch: &[IndexRecord]) -> Vec<FragmentIndexUpdate> {
    let mut order = Vec::new();
    let mut groups: HashMap<_, FragmentIndexUpdate> = HashMap::new();

    for record in batch {
        let key = record.key();
        let update = groups.entry(key).or_insert_with(|| {
            order.push(key);
            FragmentIndexUpdate { key, entries: Vec::new(), total_packets: 0 }
        });

        match record {
            IndexRecord::Keyframe(entry) => update.entries.push(IframeIndex {
                timestamp_ms: entry.timestamp_ms,
                byte_offset: entry.byte_offset,
            }),
            IndexRecord::Finalized(done) => {
                update.total_packets = update.total_packets.max(done.total_frames);
            }
        }
    }

    order.into_iter().filter_map(|key| groups.remove(&key)).collect()
}

/// Buffers index records for one camera and flushes them in batches.
pub struct IndexBatchWriter {
    camera_id: String,
    batch_size: usize,
    flush_interval: Duration,
    batch: Vec<IndexRecord>,
}

impl IndexBatchWriter {
    /// Create a batch writer for one camera.
    pub fn new(camera_id: String, batch_size: usize, flush_interval: Duration) -> Self {
        Self {
            camera_id,
            batch_size,
            batch: Vec::with_capacity(batch_size),
            flush_interval,
        }
    }

    /// Consume index records until cancellation or queue closure, then
    /// drain whatever is still queued and flush one last time.
    pub async fn run<S: IndexSink>(
        mut self,
        sink: Arc<S>,
        mut records: mpsc::Receiver<IndexRecord>,
        cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(self.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(camera_id = %self.camera_id, "Index batch writer stopping");
                    break;
                }
                record = records.recv() => match record {
                    Some(record) => self.enqueue(record, sink.as_ref()).await,
                    None => {
                        info!(camera_id = %self.camera_id, "Index record queue closed");
                        break;
                    }
                },
                _ = ticker.tick() => {
                    if !self.batch.is_empty() {
                        self.flush(sink.as_ref()).await;
                    }
                }
            }
        }

        // Pick up records that were queued but not yet received, then
        // flush the remainder best-effort.
        while let Ok(record) = records.try_recv() {
            self.batch.push(record);
        }
        self.flush(sink.as_ref()).await;
    }

    /// Buffer one record, flushing immediately once the batch is full.
    async fn enqueue<S: IndexSink + ?Sized>(&mut self, record: IndexRecord, sink: &S) {
        self.batch.push(record);

        if self.batch.len() >= self.batch_size {
            self.flush(sink).await;
        }
    }

    /// Flush the buffer through the sink. On failure the buffer is kept
    /// as-is; the same records are retried on the next trigger.
    async fn flush<S: IndexSink + ?Sized>(&mut self, sink: &S) {
        if self.batch.is_empty() {
            return;
        }

        let updates = group_records(&self.batch);

        match sink.apply(&self.camera_id, &updates).await {
            Ok(()) => {
                debug!(
                    camera_id = %self.camera_id,
                    records = self.batch.len(),
                    groups = updates.len(),
                    "Flushed index batch"
                );
                metrics::counter!("archive.index.records_flushed")
                    .increment(self.batch.len() as u64);

                self.batch.clear();
                // Bound memory after a long outage inflated the buffer
                if self.batch.capacity() > self.batch_size * 4 {
                    self.batch = Vec::with_capacity(self.batch_size);
                }
            }
            Err(e) => {
                error!(
                    camera_id = %self.camera_id,
                    records = self.batch.len(),
                    error = %e,
                    "Failed to flush index batch, will retry"
                );
                metrics::counter!("archive.index.flush_failures").increment(1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FragmentFinalized, FragmentKey, KeyframeEntry};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct FakeSink {
        applies: Mutex<Vec<Vec<FragmentIndexUpdate>>>,
        failures_left: AtomicUsize,
    }

    impl FakeSink {
        fn new() -> Self {
            Self { applies: Mutex::new(Vec::new()), failures_left: AtomicUsize::new(0) }
        }

        fn failing(times: usize) -> Self {
            Self { applies: Mutex::new(Vec::new()), failures_left: AtomicUsize::new(times) }
        }

        fn applies(&self) -> Vec<Vec<FragmentIndexUpdate>> {
            self.applies.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl IndexSink for FakeSink {
        async fn apply(&self, _camera_id: &str, updates: &[FragmentIndexUpdate]) -> Result<()> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                anyhow::bail!("simulated flush failure");
            }
            self.applies.lock().unwrap().push(updates.to_vec());
            Ok(())
        }
    }

    fn keyframe(key: FragmentKey, timestamp_ms: i64, byte_offset: i64) -> IndexRecord {
        IndexRecord::Keyframe(KeyframeEntry {
            camera_id: "cam1".to_string(),
            key,
            timestamp_ms,
            byte_offset,
            frames_before: 0,
        })
    }

    fn finalized(key: FragmentKey, total_frames: i64) -> IndexRecord {
        IndexRecord::Finalized(FragmentFinalized {
            camera_id: "cam1".to_string(),
            key,
            total_frames,
        })
    }

    #[test]
    fn test_group_records_partitions_by_key() {
        let a = FragmentKey { folder: 1, file: 0 };
        let b = FragmentKey { folder: 1, file: 300 };

        let updates = group_records(&[
            keyframe(a, 1_000, 0),
            keyframe(a, 2_000, 150),
            finalized(a, 7),
            keyframe(b, 301_000, 0),
        ]);

        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0].key, a);
        assert_eq!(updates[0].entries.len(), 2);
        assert_eq!(updates[0].total_packets, 7);
        assert_eq!(updates[1].key, b);
        assert_eq!(updates[1].entries, vec![IframeIndex { timestamp_ms: 301_000, byte_offset: 0 }]);
        assert_eq!(updates[1].total_packets, 0);
    }

    #[test]
    fn test_group_records_preserves_arrival_order() {
        let a = FragmentKey { folder: 2, file: 600 };
        let b = FragmentKey { folder: 2, file: 900 };

        let updates = group_records(&[
            keyframe(b, 10_000, 0),
            keyframe(a, 11_000, 0),
            keyframe(b, 12_000, 512),
        ]);

        assert_eq!(updates[0].key, b);
        assert_eq!(updates[0].entries[1].byte_offset, 512);
        assert_eq!(updates[1].key, a);
    }

    #[test]
    fn test_keyframe_counts_never_establish_total() {
        let key = FragmentKey { folder: 0, file: 0 };
        let mut entry = KeyframeEntry {
            camera_id: "cam1".to_string(),
            key,
            timestamp_ms: 5_000,
            byte_offset: 2_048,
            frames_before: 120,
        };

        let updates = group_records(&[IndexRecord::Keyframe(entry.clone())]);
        assert_eq!(updates[0].total_packets, 0);

        // Regardless of flush order of finalization vs. keyframe entries,
        // the total is the maximum finalization value seen.
        entry.frames_before = 500;
        let updates = group_records(&[
            finalized(key, 130),
            IndexRecord::Keyframe(entry),
            finalized(key, 90),
        ]);
        assert_eq!(updates[0].total_packets, 130);
    }

    #[tokio::test]
    async fn test_batch_size_triggers_flush() {
        let sink = FakeSink::new();
        let key = FragmentKey { folder: 0, file: 0 };
        let mut writer = IndexBatchWriter::new("cam1".to_string(), 3, Duration::from_secs(5));

        writer.enqueue(keyframe(key, 1_000, 0), &sink).await;
        writer.enqueue(keyframe(key, 2_000, 100), &sink).await;
        assert!(sink.applies().is_empty());

        writer.enqueue(finalized(key, 2), &sink).await;

        let applies = sink.applies();
        assert_eq!(applies.len(), 1);
        assert_eq!(applies[0][0].entries.len(), 2);
        assert_eq!(applies[0][0].total_packets, 2);
        assert!(writer.batch.is_empty());
    }

    #[tokio::test]
    async fn test_failed_flush_keeps_buffer_and_retries_same_records() {
        let sink = FakeSink::failing(1);
        let key = FragmentKey { folder: 0, file: 0 };
        let mut writer = IndexBatchWriter::new("cam1".to_string(), 2, Duration::from_secs(5));

        writer.enqueue(keyframe(key, 1_000, 0), &sink).await;
        writer.enqueue(keyframe(key, 2_000, 100), &sink).await;

        // First flush failed; nothing applied, nothing lost.
        assert!(sink.applies().is_empty());
        assert_eq!(writer.batch.len(), 2);

        writer.enqueue(finalized(key, 2), &sink).await;

        let applies = sink.applies();
        assert_eq!(applies.len(), 1);
        // The retry carries the original records plus the new one.
        assert_eq!(applies[0][0].entries.len(), 2);
        assert_eq!(applies[0][0].total_packets, 2);
        assert!(writer.batch.is_empty());
    }

    #[tokio::test]
    async fn test_double_flush_produces_identical_updates() {
        // Flushing the same records twice must hand the sink identical
        // groups; convergence in the store then rests on the monotonic
        // insert-if-absent merge.
        let key = FragmentKey { folder: 3, file: 1_200 };
        let records =
            vec![keyframe(key, 1_000, 0), keyframe(key, 3_000, 4_096), finalized(key, 58)];

        let first = group_records(&records);
        let second = group_records(&records);
        assert_eq!(first, second);
        assert_eq!(first[0].total_packets, 58);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_flush_and_shutdown_drain() {
        let sink = Arc::new(FakeSink::new());
        let key = FragmentKey { folder: 0, file: 0 };
        let (tx, rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();

        let writer = IndexBatchWriter::new("cam1".to_string(), 50, Duration::from_secs(5));
        let handle = tokio::spawn(writer.run(sink.clone(), rx, cancel.clone()));

        tx.send(keyframe(key, 1_000, 0)).await.unwrap();
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(sink.applies().len(), 1);

        // Records still queued at shutdown are drained and flushed.
        tx.send(finalized(key, 9)).await.unwrap();
        cancel.cancel();
        handle.await.unwrap();

        let applies = sink.applies();
        assert_eq!(applies.len(), 2);
        assert_eq!(applies[1][0].total_packets, 9);
    }
}
