//! Core types and orchestration for the overlap-engine batch pipeline.
//!
//! Responsibilities:
//! - Define the records exchanged between the manifest store, the geometry
//!   builder, and the batch runner.
//! - Materialise bounding-box geometries into a normalised geodata frame.
//! - Drive the batched fetch, merge, write cycle with per-token failure
//!   bookkeeping and resumable checkpoints.
//!
//! Boundaries:
//! - Storage technology lives behind the [`ManifestRepository`],
//!   [`FailureTracker`], and [`BatchWriter`] traits (adapters live in
//!   `overlap-data`).
//! - No spatial analytics; this crate only constructs geometry and
//!   orchestrates the pipeline.
//!
//! Invariants:
//! - Merged frames always carry EPSG:4326.
//! - Batches execute strictly sequentially; the tracker is the single
//!   mutable shared resource.
//! - No ambient or environment state is read anywhere in the crate.

#![forbid(unsafe_code)]

mod config;
mod geometry;
mod record;
mod runner;
mod store;
pub mod test_support;
mod tracker;

pub use config::{OverlapAnalysisConfig, OverlapConfigError};
pub use geometry::{GeometryError, ensure_bbox_geometries, merge_metadata_with_bboxes};
pub use record::{
    BboxFrame, BboxRecord, Crs, FailStage, FailureRecord, GeoBboxRecord, GeoFrame, GeoRecord,
    MetadataRecord, ProgressSnapshot, RunSummary, SceneToken,
};
pub use runner::{
    BatchWriter, CancelFlag, FnWriter, OverlapRunError, WriteError, run_overlap_analysis,
};
pub use store::{ManifestRepository, RepositoryError};
pub use tracker::{FailureTracker, TrackerError};
