//! PostgreSQL-backed keyframe index store.
//!
//! One row per (camera, day folder, fragment file) holds the ordered list
//! of keyframe positions plus the playable-frame total for the fragment.
//! The upsert appends only positions not already present and only raises
//! the total, so retried flushes converge instead of duplicating.

use crate::config::DatabaseConfig;
use crate::model::FragmentKey;
use anyhow::{bail, Context, Result};
use sqlx::postgres::{PgHasArrayType, PgPool, PgPoolOptions, PgTypeInfo};
use tracing::{debug, info, instrument};

/// Table holding the persisted index rows. Fixed at compile time so every
/// statement stays fully parameterized.
pub const INDEX_TABLE: &str = "iframe_byte_offsets";

/// Name of the composite SQL type backing one keyframe position.
pub const INDEX_ENTRY_TYPE: &str = "iframe_index";

/// One keyframe position as stored in the `iframe_indexes` array column.
/// Field order matches the composite type declaration in the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "iframe_index")]
pub struct IframeIndex {
    /// Keyframe timestamp in milliseconds since epoch
    pub timestamp_ms: i64,
    /// Byte offset of the keyframe's first byte within its fragment file
    pub byte_offset: i64,
}

impl PgHasArrayType for IframeIndex {
    fn array_type_info() -> PgTypeInfo {
        PgTypeInfo::with_name("_iframe_index")
    }
}

/// One fragment's worth of buffered index state, ready for upsert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentIndexUpdate {
    /// Fragment the update applies to
    pub key: FragmentKey,
    /// Keyframe positions in fragment-file order
    pub entries: Vec<IframeIndex>,
    /// Highest playable-frame total observed; 0 until a finalization
    /// record has been seen for the fragment
    pub total_packets: i64,
}

/// Keyframe index store backed by PostgreSQL.
pub struct IndexStore {
    pool: PgPool,
}

impl IndexStore {
    /// Create a new index store with connection pool
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.connect_timeout())
            .idle_timeout(Some(config.idle_timeout()))
            .connect(&config.url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        info!("Connected to PostgreSQL database");

        Ok(Self { pool })
    }

    /// Verify the index table and its composite entry type exist.
    ///
    /// The schema is owned by the platform's provisioning, not by this
    /// service; a missing table is a fatal startup error.
    pub async fn verify_schema(&self) -> Result<()> {
        let table_exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM information_schema.tables WHERE table_name = $1
            )
            "#,
        )
        .bind(INDEX_TABLE)
        .fetch_one(&self.pool)
        .await
        .context("Failed to check index table existence")?;

        if !table_exists {
            bail!("required table {INDEX_TABLE} does not exist");
        }

        let type_exists: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM pg_type WHERE typname = $1)")
                .bind(INDEX_ENTRY_TYPE)
                .fetch_one(&self.pool)
                .await
                .context("Failed to check index entry type existence")?;

        if !type_exists {
            bail!("required composite type {INDEX_ENTRY_TYPE} does not exist");
        }

        info!(table = INDEX_TABLE, "Index table exists and is accessible");
        Ok(())
    }

    /// Apply one flush batch for a camera inside a single transaction.
    ///
    /// Either every fragment's upsert commits or none does. The merge is
    /// monotonic: positions already present in the stored array are not
    /// appended again, and `total_packets` never decreases.
    #[instrument(skip(self, updates), fields(camera_id = %camera_id, groups = updates.len()))]
    pub async fn apply_updates(
        &self,
        camera_id: &str,
        updates: &[FragmentIndexUpdate],
    ) -> Result<()> {
        if updates.is_empty() {
            return Ok(());
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to begin transaction")?;

        for update in updates {
            sqlx::query(
                r#"
                INSERT INTO iframe_byte_offsets AS idx
                    (camera_id, folder, file, iframe_indexes, total_packets)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (camera_id, folder, file) DO UPDATE SET
                    iframe_indexes = idx.iframe_indexes || (
                        SELECT COALESCE(array_agg(u.entry ORDER BY u.ord), '{}'::iframe_index[])
                        FROM unnest(EXCLUDED.iframe_indexes) WITH ORDINALITY AS u(entry, ord)
                        WHERE NOT (u.entry = ANY (idx.iframe_indexes))
                    ),
                    total_packets = GREATEST(idx.total_packets, EXCLUDED.total_packets)
                "#,
            )
            .bind(camera_id)
            .bind(update.key.folder)
            .bind(update.key.file)
            .bind(&update.entries)
            .bind(update.total_packets)
            .execute(&mut *tx)
            .await
            .with_context(|| {
                format!(
                    "Failed to upsert index row for folder={} file={}",
                    update.key.folder, update.key.file
                )
            })?;
        }

        tx.commit().await.context("Failed to commit transaction")?;

        debug!(
            camera_id = %camera_id,
            groups = updates.len(),
            "Applied index updates"
        );

        Ok(())
    }

    /// Delete every index row for a camera. Used when retention drops to
    /// zero and the camera's archive is discarded wholesale.
    #[instrument(skip(self))]
    pub async fn delete_camera(&self, camera_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM iframe_byte_offsets WHERE camera_id = $1")
            .bind(camera_id)
            .execute(&self.pool)
            .await
            .context("Failed to delete camera index rows")?;

        Ok(result.rows_affected())
    }

    /// Delete index rows at or before the cutoff key for a camera.
    #[instrument(skip(self))]
    pub async fn delete_before(&self, camera_id: &str, cutoff: FragmentKey) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM iframe_byte_offsets
            WHERE camera_id = $1
              AND (folder < $2 OR (folder = $2 AND file <= $3))
            "#,
        )
        .bind(camera_id)
        .bind(cutoff.folder)
        .bind(cutoff.file)
        .execute(&self.pool)
        .await
        .context("Failed to delete expired index rows")?;

        let deleted = result.rows_affected();
        if deleted > 0 {
            info!(camera_id = %camera_id, deleted = deleted, "Deleted expired index rows");
        }

        Ok(deleted)
    }

    /// Get the connection pool (for readiness checks)
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fragment_index_update_fields() {
        let update = FragmentIndexUpdate {
            key: FragmentKey { folder: 20_000, file: 600 },
            entries: vec![
                IframeIndex { timestamp_ms: 1_728_000_000_000, byte_offset: 0 },
                IframeIndex { timestamp_ms: 1_728_000_002_000, byte_offset: 4_096 },
            ],
            total_packets: 0,
        };

        assert_eq!(update.entries.len(), 2);
        assert_eq!(update.entries[0].byte_offset, 0);
        assert_eq!(update.key.file_name(), "600.bin");
    }
}
