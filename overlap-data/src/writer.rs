//! Replay-idempotent SQLite sink for merged geo-frames.
//!
//! Rows are keyed by `(scene_token, data_name)` and inserted with
//! `INSERT OR IGNORE`, so re-running a batch after an interrupted session
//! never duplicates rows and the reported insert count only covers rows that
//! were actually new.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use geo::Geometry;
use rusqlite::{Connection, params_from_iter};

use overlap_core::{
    BatchWriter, FailureTracker, GeoFrame, GeoRecord, SceneToken, WriteError,
};

use crate::sqlite::SqliteStoreError;

/// Batch writer inserting merged rows into a `scene_overlaps` table.
///
/// # Examples
/// ```
/// use overlap_data::SqliteBatchWriter;
///
/// let writer = SqliteBatchWriter::open_in_memory()?;
/// assert_eq!(writer.inserted_count()?, 0);
/// # Ok::<(), overlap_data::SqliteStoreError>(())
/// ```
#[derive(Debug)]
pub struct SqliteBatchWriter {
    connection: Connection,
}

impl SqliteBatchWriter {
    /// Open (and initialise) a destination database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, SqliteStoreError> {
        let connection =
            Connection::open(path.as_ref()).map_err(|source| SqliteStoreError::Open {
                path: path.as_ref().to_path_buf(),
                source,
            })?;
        Self::from_connection(connection)
    }

    /// Open an in-memory destination, used by tests.
    pub fn open_in_memory() -> Result<Self, SqliteStoreError> {
        let connection = Connection::open_in_memory().map_err(|source| SqliteStoreError::Open {
            path: PathBuf::from(":memory:"),
            source,
        })?;
        Self::from_connection(connection)
    }

    fn from_connection(connection: Connection) -> Result<Self, SqliteStoreError> {
        connection
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS scene_overlaps (
                    scene_token TEXT NOT NULL,
                    data_name TEXT NOT NULL,
                    event_id INTEGER NOT NULL,
                    city_id INTEGER NOT NULL,
                    timestamp INTEGER NOT NULL,
                    all_good INTEGER NOT NULL,
                    crs INTEGER NOT NULL,
                    geometry TEXT NOT NULL,
                    PRIMARY KEY (scene_token, data_name)
                );",
            )
            .map_err(SqliteStoreError::sqlite("initialise overlap schema"))?;
        Ok(Self { connection })
    }

    /// Number of overlap rows currently in the destination.
    pub fn inserted_count(&self) -> Result<usize, SqliteStoreError> {
        self.connection
            .query_row("SELECT COUNT(*) FROM scene_overlaps", [], |row| row.get(0))
            .map_err(SqliteStoreError::sqlite("count overlap rows"))
    }

    /// Subset of the given tokens already present in the destination.
    ///
    /// Backs a tracker's `check_tokens_exist` when the destination is
    /// reachable at work-set resolution time.
    pub fn existing_tokens(
        &self,
        tokens: &[SceneToken],
    ) -> Result<HashSet<SceneToken>, SqliteStoreError> {
        if tokens.is_empty() {
            return Ok(HashSet::new());
        }
        let placeholders = vec!["?"; tokens.len()].join(", ");
        let query = format!(
            "SELECT DISTINCT scene_token FROM scene_overlaps
             WHERE scene_token IN ({placeholders})"
        );
        let mut statement = self
            .connection
            .prepare(&query)
            .map_err(SqliteStoreError::sqlite("prepare existence query"))?;
        let mut rows = statement
            .query(params_from_iter(tokens.iter().map(SceneToken::as_str)))
            .map_err(SqliteStoreError::sqlite("run existence query"))?;

        let mut existing = HashSet::new();
        while let Some(row) = rows
            .next()
            .map_err(SqliteStoreError::sqlite("read existence row"))?
        {
            let token: String = row
                .get(0)
                .map_err(SqliteStoreError::sqlite("decode existence row"))?;
            existing.insert(SceneToken::new(token));
        }
        Ok(existing)
    }

    /// Read every persisted overlap row back, in insertion order.
    pub fn load_overlaps(&self) -> Result<Vec<GeoRecord>, SqliteStoreError> {
        let mut statement = self
            .connection
            .prepare(
                "SELECT scene_token, data_name, event_id, city_id, timestamp, all_good, geometry
                 FROM scene_overlaps ORDER BY rowid",
            )
            .map_err(SqliteStoreError::sqlite("prepare overlap query"))?;
        let mut rows = statement
            .query([])
            .map_err(SqliteStoreError::sqlite("run overlap query"))?;

        let mut records = Vec::new();
        while let Some(row) = rows
            .next()
            .map_err(SqliteStoreError::sqlite("read overlap row"))?
        {
            let scene_token: String = row
                .get(0)
                .map_err(SqliteStoreError::sqlite("decode overlap row"))?;
            let scene_token = SceneToken::new(scene_token);
            let geometry_json: String = row
                .get(6)
                .map_err(SqliteStoreError::sqlite("decode overlap row"))?;
            let geometry: Geometry<f64> = serde_json::from_str(&geometry_json).map_err(|source| {
                SqliteStoreError::ParseGeometry {
                    scene_token: scene_token.clone(),
                    source,
                }
            })?;
            records.push(GeoRecord {
                scene_token,
                data_name: row
                    .get(1)
                    .map_err(SqliteStoreError::sqlite("decode overlap row"))?,
                event_id: row
                    .get(2)
                    .map_err(SqliteStoreError::sqlite("decode overlap row"))?,
                city_id: row
                    .get(3)
                    .map_err(SqliteStoreError::sqlite("decode overlap row"))?,
                timestamp: row
                    .get(4)
                    .map_err(SqliteStoreError::sqlite("decode overlap row"))?,
                all_good: row
                    .get(5)
                    .map_err(SqliteStoreError::sqlite("decode overlap row"))?,
                geometry,
            });
        }
        Ok(records)
    }

    fn insert_chunk(
        &mut self,
        chunk: &[GeoRecord],
        crs_code: u32,
        batch_number: usize,
    ) -> Result<usize, SqliteStoreError> {
        let transaction = self
            .connection
            .transaction()
            .map_err(SqliteStoreError::sqlite("begin insert transaction"))?;
        let mut inserted = 0_usize;
        {
            let mut statement = transaction
                .prepare_cached(
                    "INSERT OR IGNORE INTO scene_overlaps (
                        scene_token, data_name, event_id, city_id, timestamp,
                        all_good, crs, geometry
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                )
                .map_err(SqliteStoreError::sqlite("prepare overlap insert"))?;
            for record in chunk {
                let geometry_json =
                    serde_json::to_string(&record.geometry).map_err(|source| {
                        SqliteStoreError::SerialiseGeometry {
                            scene_token: record.scene_token.clone(),
                            source,
                        }
                    })?;
                inserted += statement
                    .execute((
                        record.scene_token.as_str(),
                        record.data_name.as_str(),
                        record.event_id,
                        record.city_id,
                        record.timestamp,
                        record.all_good,
                        crs_code,
                        geometry_json,
                    ))
                    .map_err(SqliteStoreError::sqlite("insert overlap row"))?;
            }
        }
        transaction
            .commit()
            .map_err(SqliteStoreError::sqlite("commit insert transaction"))?;
        log::debug!(
            "batch {batch_number}: committed chunk of {} rows ({inserted} new)",
            chunk.len()
        );
        Ok(inserted)
    }
}

impl BatchWriter for SqliteBatchWriter {
    fn write_batch(
        &mut self,
        frame: &GeoFrame,
        batch_size: usize,
        _tracker: &mut dyn FailureTracker,
        batch_number: usize,
    ) -> Result<usize, WriteError> {
        let crs_code = frame.crs.epsg();
        let mut inserted = 0_usize;
        for chunk in frame.records.chunks(batch_size.max(1)) {
            inserted += self
                .insert_chunk(chunk, crs_code, batch_number)
                .map_err(|source| WriteError::new(batch_number, source))?;
        }
        Ok(inserted)
    }
}

#[cfg(test)]
#[expect(
    clippy::expect_used,
    reason = "tests should fail fast when setup breaks"
)]
mod tests {
    use super::*;
    use geo::Point;
    use overlap_core::test_support::MemoryTracker;
    use rstest::rstest;

    fn geo_record(scene: &str, data_name: &str) -> GeoRecord {
        GeoRecord {
            scene_token: SceneToken::new(scene),
            data_name: data_name.into(),
            event_id: 9,
            city_id: 2,
            timestamp: 1_700_000_000,
            all_good: true,
            geometry: Geometry::Point(Point::new(1.0, 2.0)),
        }
    }

    #[rstest]
    fn chunked_writes_report_new_rows_only() {
        let mut writer = SqliteBatchWriter::open_in_memory().expect("open writer");
        let mut tracker = MemoryTracker::default();
        let frame = GeoFrame::wgs84(vec![
            geo_record("scene_001", "cam_front"),
            geo_record("scene_002", "cam_rear"),
            geo_record("scene_003", "cam_front"),
        ]);

        let first = writer
            .write_batch(&frame, 2, &mut tracker, 1)
            .expect("first write");
        assert_eq!(first, 3);

        // Replaying the same frame is idempotent.
        let second = writer
            .write_batch(&frame, 2, &mut tracker, 2)
            .expect("second write");
        assert_eq!(second, 0);
        assert_eq!(writer.inserted_count().expect("count rows"), 3);
    }

    #[rstest]
    fn geometries_round_trip_through_storage() {
        let mut writer = SqliteBatchWriter::open_in_memory().expect("open writer");
        let mut tracker = MemoryTracker::default();
        let frame = GeoFrame::wgs84(vec![geo_record("scene_001", "cam_front")]);

        writer.write_batch(&frame, 10, &mut tracker, 1).expect("write");
        let stored = writer.load_overlaps().expect("load rows");

        assert_eq!(stored, frame.records);
    }

    #[rstest]
    fn existing_tokens_reports_the_stored_subset() {
        let mut writer = SqliteBatchWriter::open_in_memory().expect("open writer");
        let mut tracker = MemoryTracker::default();
        let frame = GeoFrame::wgs84(vec![geo_record("scene_001", "cam_front")]);
        writer.write_batch(&frame, 10, &mut tracker, 1).expect("write");

        let existing = writer
            .existing_tokens(&[SceneToken::new("scene_001"), SceneToken::new("scene_002")])
            .expect("existence query");

        assert_eq!(existing, HashSet::from([SceneToken::new("scene_001")]));
    }
}
