//! Data access trait for manifest and scene stores.
//!
//! The `ManifestRepository` trait is the read side of the pipeline: it
//! supplies the scene tokens of a run and the metadata and bounding-box rows
//! each batch joins together. Adapters for concrete storage live in
//! `overlap-data`.

use std::error::Error;
use std::path::{Path, PathBuf};

use thiserror::Error as ThisError;

use crate::record::{BboxFrame, MetadataRecord, SceneToken};

/// Errors surfaced by manifest and scene store adapters.
#[derive(Debug, ThisError)]
pub enum RepositoryError {
    /// The manifest could not be read or parsed.
    #[error("failed to load scene ids from manifest at {path}")]
    Manifest {
        /// Location of the unreadable manifest.
        path: PathBuf,
        /// Underlying adapter error.
        #[source]
        source: Box<dyn Error + Send + Sync>,
    },
    /// A metadata fetch failed for a batch of tokens.
    #[error("failed to fetch metadata for {token_count} scene tokens")]
    FetchMetadata {
        /// Number of tokens in the failed batch.
        token_count: usize,
        /// Underlying adapter error.
        #[source]
        source: Box<dyn Error + Send + Sync>,
    },
    /// A bounding-box fetch failed for a set of dataset names.
    #[error("failed to fetch bbox geometries for {dataset_count} datasets")]
    FetchBbox {
        /// Number of dataset names in the failed request.
        dataset_count: usize,
        /// Underlying adapter error.
        #[source]
        source: Box<dyn Error + Send + Sync>,
    },
}

/// Read access to scene tokens, metadata rows, and bounding-box rows.
///
/// `fetch_metadata` may return a strict subset of the requested tokens, or
/// nothing at all; the runner treats both as per-token `fetch_meta`
/// outcomes rather than fatal errors.
pub trait ManifestRepository {
    /// Load the ordered scene tokens of a manifest.
    fn load_scene_ids(&self, manifest_path: &Path) -> Result<Vec<SceneToken>, RepositoryError>;

    /// Fetch the metadata rows available for the given tokens.
    fn fetch_metadata(
        &self,
        tokens: &[SceneToken],
    ) -> Result<Vec<MetadataRecord>, RepositoryError>;

    /// Fetch the bounding-box rows for the given dataset names.
    fn fetch_bbox_geometries(
        &self,
        dataset_names: &[String],
    ) -> Result<BboxFrame, RepositoryError>;
}
