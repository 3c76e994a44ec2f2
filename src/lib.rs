//! Facade crate for the overlap-engine batch geodata pipeline.
//!
//! This crate re-exports the core domain types, the geometry builder, and
//! the batch runner, and exposes the SQLite-backed collaborator adapters
//! behind a feature flag.

#![forbid(unsafe_code)]

pub use overlap_core::{
    BatchWriter, BboxFrame, BboxRecord, CancelFlag, Crs, FailStage, FailureRecord, FailureTracker,
    FnWriter, GeoBboxRecord, GeoFrame, GeoRecord, GeometryError, ManifestRepository,
    MetadataRecord, OverlapAnalysisConfig, OverlapConfigError, OverlapRunError, ProgressSnapshot,
    RepositoryError, RunSummary, SceneToken, TrackerError, WriteError, ensure_bbox_geometries,
    merge_metadata_with_bboxes, run_overlap_analysis,
};

#[cfg(feature = "store-sqlite")]
pub use overlap_data::{FileFailureTracker, SqliteBatchWriter, SqliteSceneStore, SqliteStoreError};
