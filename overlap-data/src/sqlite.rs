//! SQLite-backed scene store implementing the manifest repository contract.
//!
//! The store holds two tables: `scene_metadata` keyed by scene token and
//! `dataset_bboxes` keyed by dataset name. Manifests are JSON arrays of
//! scene tokens read from disk; everything else is queried on demand per
//! batch.

use std::fs;
use std::path::{Path, PathBuf};

use rusqlite::{Connection, Error as SqliteError, params_from_iter};
use thiserror::Error;

use overlap_core::{
    BboxFrame, BboxRecord, ManifestRepository, MetadataRecord, RepositoryError, SceneToken,
};

/// Errors raised by the SQLite scene store and the overlap writer.
#[derive(Debug, Error)]
pub enum SqliteStoreError {
    /// Opening the SQLite database failed.
    #[error("failed to open SQLite database at {path}")]
    Open {
        /// Location of the database on disk.
        path: PathBuf,
        /// Source error returned by `rusqlite`.
        #[source]
        source: SqliteError,
    },
    /// The manifest file could not be read.
    #[error("failed to read manifest file at {path}")]
    ReadManifest {
        /// Location of the manifest on disk.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The manifest file was not a JSON array of scene tokens.
    #[error("failed to parse manifest file at {path}")]
    ParseManifest {
        /// Location of the manifest on disk.
        path: PathBuf,
        /// JSON decoding failure.
        #[source]
        source: serde_json::Error,
    },
    /// A merged geometry could not be serialised for storage.
    #[error("failed to serialise geometry for scene {scene_token}")]
    SerialiseGeometry {
        /// Token of the affected row.
        scene_token: SceneToken,
        /// JSON encoding failure.
        #[source]
        source: serde_json::Error,
    },
    /// A stored geometry payload could not be decoded.
    #[error("failed to parse stored geometry for scene {scene_token}")]
    ParseGeometry {
        /// Token of the affected row.
        scene_token: SceneToken,
        /// JSON decoding failure.
        #[source]
        source: serde_json::Error,
    },
    /// Generic SQLite failure, tagged with the operation that raised it.
    #[error("failed to {operation}")]
    Sqlite {
        /// Short description of the failed statement.
        operation: &'static str,
        /// Source error returned by `rusqlite`.
        #[source]
        source: SqliteError,
    },
}

impl SqliteStoreError {
    pub(crate) fn sqlite(operation: &'static str) -> impl FnOnce(SqliteError) -> Self {
        move |source| Self::Sqlite { operation, source }
    }
}

/// Read-only scene store backed by SQLite metadata and bbox tables.
///
/// # Examples
/// ```
/// use overlap_data::SqliteSceneStore;
///
/// let store = SqliteSceneStore::open_in_memory()?;
/// store.insert_bboxes(&[])?;
/// # Ok::<(), overlap_data::SqliteStoreError>(())
/// ```
#[derive(Debug)]
pub struct SqliteSceneStore {
    connection: Connection,
}

impl SqliteSceneStore {
    /// Open (and initialise) a scene store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, SqliteStoreError> {
        let connection =
            Connection::open(path.as_ref()).map_err(|source| SqliteStoreError::Open {
                path: path.as_ref().to_path_buf(),
                source,
            })?;
        Self::from_connection(connection)
    }

    /// Open an in-memory scene store, used by tests and tooling.
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
                "CREATE TABLE IF NOT EXISTS scene_metadata (
                    scene_token TEXT PRIMARY KEY,
                    data_name TEXT NOT NULL,
                    event_id INTEGER NOT NULL,
                    city_id INTEGER NOT NULL,
                    timestamp INTEGER NOT NULL
                );
                CREATE TABLE IF NOT EXISTS dataset_bboxes (
                    dataset_name TEXT PRIMARY KEY,
                    xmin REAL,
                    ymin REAL,
                    xmax REAL,
                    ymax REAL,
                    all_good INTEGER NOT NULL
                );",
            )
            .map_err(SqliteStoreError::sqlite("initialise scene store schema"))?;
        Ok(Self { connection })
    }

    /// Ingest metadata rows, replacing rows with the same scene token.
    pub fn insert_metadata(&self, rows: &[MetadataRecord]) -> Result<(), SqliteStoreError> {
        let mut statement = self
            .connection
            .prepare_cached(
                "INSERT OR REPLACE INTO scene_metadata (
                    scene_token, data_name, event_id, city_id, timestamp
                ) VALUES (?1, ?2, ?3, ?4, ?5)",
            )
            .map_err(SqliteStoreError::sqlite("prepare metadata insert"))?;
        for row in rows {
            statement
                .execute((
                    row.scene_token.as_str(),
                    row.data_name.as_str(),
                    row.event_id,
                    row.city_id,
                    row.timestamp,
                ))
                .map_err(SqliteStoreError::sqlite("insert metadata row"))?;
        }
        Ok(())
    }

    /// Ingest bounding-box rows, replacing rows with the same dataset name.
    pub fn insert_bboxes(&self, rows: &[BboxRecord]) -> Result<(), SqliteStoreError> {
        let mut statement = self
            .connection
            .prepare_cached(
                "INSERT OR REPLACE INTO dataset_bboxes (
                    dataset_name, xmin, ymin, xmax, ymax, all_good
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )
            .map_err(SqliteStoreError::sqlite("prepare bbox insert"))?;
        for row in rows {
            statement
                .execute((
                    row.dataset_name.as_str(),
                    row.xmin,
                    row.ymin,
                    row.xmax,
                    row.ymax,
                    row.all_good,
                ))
                .map_err(SqliteStoreError::sqlite("insert bbox row"))?;
        }
        Ok(())
    }

    fn query_metadata(
        &self,
        tokens: &[SceneToken],
    ) -> Result<Vec<MetadataRecord>, SqliteStoreError> {
        if tokens.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; tokens.len()].join(", ");
        let query = format!(
            "SELECT scene_token, data_name, event_id, city_id, timestamp
             FROM scene_metadata WHERE scene_token IN ({placeholders}) ORDER BY rowid"
        );
        let mut statement = self
            .connection
            .prepare(&query)
            .map_err(SqliteStoreError::sqlite("prepare metadata query"))?;
        let mut rows = statement
            .query(params_from_iter(tokens.iter().map(SceneToken::as_str)))
            .map_err(SqliteStoreError::sqlite("run metadata query"))?;

        let mut records = Vec::new();
        while let Some(row) = rows
            .next()
            .map_err(SqliteStoreError::sqlite("read metadata row"))?
        {
            let scene_token: String = row
                .get(0)
                .map_err(SqliteStoreError::sqlite("decode metadata row"))?;
            records.push(MetadataRecord {
                scene_token: SceneToken::new(scene_token),
                data_name: row
                    .get(1)
                    .map_err(SqliteStoreError::sqlite("decode metadata row"))?,
                event_id: row
                    .get(2)
                    .map_err(SqliteStoreError::sqlite("decode metadata row"))?,
                city_id: row
                    .get(3)
                    .map_err(SqliteStoreError::sqlite("decode metadata row"))?,
                timestamp: row
                    .get(4)
                    .map_err(SqliteStoreError::sqlite("decode metadata row"))?,
            });
        }
        Ok(records)
    }

    fn query_bboxes(&self, dataset_names: &[String]) -> Result<Vec<BboxRecord>, SqliteStoreError> {
        if dataset_names.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; dataset_names.len()].join(", ");
        let query = format!(
            "SELECT dataset_name, xmin, ymin, xmax, ymax, all_good
             FROM dataset_bboxes WHERE dataset_name IN ({placeholders}) ORDER BY rowid"
        );
        let mut statement = self
            .connection
            .prepare(&query)
            .map_err(SqliteStoreError::sqlite("prepare bbox query"))?;
        let mut rows = statement
            .query(params_from_iter(dataset_names.iter()))
            .map_err(SqliteStoreError::sqlite("run bbox query"))?;

        let mut records = Vec::new();
        while let Some(row) = rows
            .next()
            .map_err(SqliteStoreError::sqlite("read bbox row"))?
        {
            records.push(BboxRecord {
                dataset_name: row
                    .get(0)
                    .map_err(SqliteStoreError::sqlite("decode bbox row"))?,
                xmin: row
                    .get(1)
                    .map_err(SqliteStoreError::sqlite("decode bbox row"))?,
                ymin: row
                    .get(2)
                    .map_err(SqliteStoreError::sqlite("decode bbox row"))?,
                xmax: row
                    .get(3)
                    .map_err(SqliteStoreError::sqlite("decode bbox row"))?,
                ymax: row
                    .get(4)
                    .map_err(SqliteStoreError::sqlite("decode bbox row"))?,
                all_good: row
                    .get(5)
                    .map_err(SqliteStoreError::sqlite("decode bbox row"))?,
            });
        }
        Ok(records)
    }
}

/// Parse a JSON-array manifest file into scene tokens.
pub(crate) fn load_manifest_tokens(path: &Path) -> Result<Vec<SceneToken>, SqliteStoreError> {
    let payload = fs::read_to_string(path).map_err(|source| SqliteStoreError::ReadManifest {
        path: path.to_path_buf(),
        source,
    })?;
    let tokens: Vec<String> =
        serde_json::from_str(&payload).map_err(|source| SqliteStoreError::ParseManifest {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(tokens.into_iter().map(SceneToken::from).collect())
}

impl ManifestRepository for SqliteSceneStore {
    fn load_scene_ids(&self, manifest_path: &Path) -> Result<Vec<SceneToken>, RepositoryError> {
        load_manifest_tokens(manifest_path).map_err(|source| RepositoryError::Manifest {
            path: manifest_path.to_path_buf(),
            source: Box::new(source),
        })
    }

    fn fetch_metadata(
        &self,
        tokens: &[SceneToken],
    ) -> Result<Vec<MetadataRecord>, RepositoryError> {
        self.query_metadata(tokens)
            .map_err(|source| RepositoryError::FetchMetadata {
                token_count: tokens.len(),
                source: Box::new(source),
            })
    }

    fn fetch_bbox_geometries(
        &self,
        dataset_names: &[String],
    ) -> Result<BboxFrame, RepositoryError> {
        self.query_bboxes(dataset_names)
            .map(BboxFrame::Bounds)
            .map_err(|source| RepositoryError::FetchBbox {
                dataset_count: dataset_names.len(),
                source: Box::new(source),
            })
    }
}

#[cfg(test)]
#[expect(
    clippy::expect_used,
    reason = "tests should fail fast when setup breaks"
)]
mod tests {
    use super::*;
    use rstest::{fixture, rstest};

    fn metadata_row(scene: &str, data_name: &str) -> MetadataRecord {
        MetadataRecord {
            scene_token: SceneToken::new(scene),
            data_name: data_name.into(),
            event_id: 5,
            city_id: 1,
            timestamp: 1_700_000_000,
        }
    }

    #[fixture]
    fn seeded_store() -> SqliteSceneStore {
        let store = SqliteSceneStore::open_in_memory().expect("open store");
        store
            .insert_metadata(&[
                metadata_row("scene_001", "cam_front"),
                metadata_row("scene_002", "cam_rear"),
            ])
            .expect("seed metadata");
        store
            .insert_bboxes(&[BboxRecord {
                dataset_name: "cam_front".into(),
                xmin: Some(0.0),
                ymin: Some(0.0),
                xmax: Some(2.0),
                ymax: Some(2.0),
                all_good: true,
            }])
            .expect("seed bboxes");
        store
    }

    #[rstest]
    fn fetch_metadata_returns_the_requested_subset(seeded_store: SqliteSceneStore) {
        let rows = seeded_store
            .fetch_metadata(&[SceneToken::new("scene_002"), SceneToken::new("scene_404")])
            .expect("fetch metadata");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].scene_token, SceneToken::new("scene_002"));
    }

    #[rstest]
    fn fetch_metadata_with_no_tokens_is_empty(seeded_store: SqliteSceneStore) {
        let rows = seeded_store.fetch_metadata(&[]).expect("fetch metadata");
        assert!(rows.is_empty());
    }

    #[rstest]
    fn fetch_bboxes_preserves_nullable_coordinates(seeded_store: SqliteSceneStore) {
        seeded_store
            .insert_bboxes(&[BboxRecord {
                dataset_name: "radar_front".into(),
                xmin: None,
                ymin: None,
                xmax: None,
                ymax: None,
                all_good: false,
            }])
            .expect("seed nullable bbox");

        let frame = seeded_store
            .fetch_bbox_geometries(&["radar_front".into()])
            .expect("fetch bboxes");
        let BboxFrame::Bounds(rows) = frame else {
            panic!("scene store returns bounds frames");
        };
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].xmin, None);
        assert!(!rows[0].all_good);
    }

    #[rstest]
    fn manifest_files_are_json_token_arrays(seeded_store: SqliteSceneStore) {
        let dir = tempfile::tempdir().expect("create temp dir");
        let manifest_path = dir.path().join("manifest.json");
        std::fs::write(&manifest_path, r#"["scene_001", "scene_002"]"#)
            .expect("write manifest");

        let tokens = seeded_store
            .load_scene_ids(&manifest_path)
            .expect("load manifest");
        assert_eq!(
            tokens,
            vec![SceneToken::new("scene_001"), SceneToken::new("scene_002")]
        );
    }

    #[rstest]
    fn unreadable_manifests_surface_as_manifest_errors(seeded_store: SqliteSceneStore) {
        let error = seeded_store
            .load_scene_ids(Path::new("/nonexistent/manifest.json"))
            .expect_err("missing manifest should fail");
        assert!(matches!(error, RepositoryError::Manifest { .. }));
    }
}
