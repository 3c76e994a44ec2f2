//! Test-only, in-memory collaborator implementations used by unit and
//! integration tests.
//!
//! The repository performs linear scans and the tracker keeps everything in
//! plain vectors, so both are intended only for small fixtures.

use std::cell::Cell;
use std::collections::HashSet;
use std::path::Path;

use crate::record::{
    BboxFrame, BboxRecord, FailureRecord, MetadataRecord, ProgressSnapshot, SceneToken,
};
use crate::runner::{BatchWriter, WriteError};
use crate::store::{ManifestRepository, RepositoryError};
use crate::tracker::{FailureTracker, TrackerError};

/// In-memory `ManifestRepository` backed by fixture rows.
///
/// `load_scene_ids` ignores the manifest path and returns the seeded
/// tokens; fetches filter the seeded rows by the requested keys, preserving
/// seed order.
#[derive(Debug, Default)]
pub struct MemoryRepository {
    manifest: Vec<SceneToken>,
    metadata: Vec<MetadataRecord>,
    bboxes: Vec<BboxRecord>,
}

impl MemoryRepository {
    /// Create a repository from fixture rows.
    #[must_use]
    pub fn new(
        manifest: Vec<SceneToken>,
        metadata: Vec<MetadataRecord>,
        bboxes: Vec<BboxRecord>,
    ) -> Self {
        Self {
            manifest,
            metadata,
            bboxes,
        }
    }
}

impl ManifestRepository for MemoryRepository {
    fn load_scene_ids(&self, _manifest_path: &Path) -> Result<Vec<SceneToken>, RepositoryError> {
        Ok(self.manifest.clone())
    }

    fn fetch_metadata(
        &self,
        tokens: &[SceneToken],
    ) -> Result<Vec<MetadataRecord>, RepositoryError> {
        let requested: HashSet<&SceneToken> = tokens.iter().collect();
        Ok(self
            .metadata
            .iter()
            .filter(|row| requested.contains(&row.scene_token))
            .cloned()
            .collect())
    }

    fn fetch_bbox_geometries(
        &self,
        dataset_names: &[String],
    ) -> Result<BboxFrame, RepositoryError> {
        let requested: HashSet<&str> = dataset_names.iter().map(String::as_str).collect();
        Ok(BboxFrame::Bounds(
            self.bboxes
                .iter()
                .filter(|row| requested.contains(row.dataset_name.as_str()))
                .cloned()
                .collect(),
        ))
    }
}

/// In-memory `FailureTracker` that records every call for assertions.
#[derive(Debug, Default)]
pub struct MemoryTracker {
    /// Failure records saved during the run, in order.
    pub failed: Vec<FailureRecord>,
    /// Successful batches as `(batch_number, tokens)` pairs, in order.
    pub successes: Vec<(usize, Vec<SceneToken>)>,
    /// Progress snapshots saved during the run, in order.
    pub progress: Vec<ProgressSnapshot>,
    /// Number of times `finalize` ran.
    pub finalize_calls: usize,
    /// Tokens `load_failed_tokens` hands to retry runs.
    pub seeded_failed: Vec<SceneToken>,
    /// Tokens treated as already succeeded by `get_remaining_tokens`.
    pub succeeded_tokens: HashSet<SceneToken>,
    /// Tokens reported by `check_tokens_exist`.
    pub existing_tokens: HashSet<SceneToken>,
    /// Number of `get_remaining_tokens` calls observed.
    pub remaining_queries: Cell<usize>,
    /// Number of `check_tokens_exist` calls observed.
    pub existence_queries: Cell<usize>,
}

impl MemoryTracker {
    /// Create a tracker whose retry set is pre-seeded.
    #[must_use]
    pub fn with_failed_tokens(tokens: Vec<SceneToken>) -> Self {
        Self {
            seeded_failed: tokens,
            ..Self::default()
        }
    }

    /// Tokens of every failure recorded during the run.
    #[must_use]
    pub fn failed_tokens(&self) -> Vec<SceneToken> {
        self.failed
            .iter()
            .map(|record| record.scene_token.clone())
            .collect()
    }
}

impl FailureTracker for MemoryTracker {
    fn load_failed_tokens(&self) -> Result<Vec<SceneToken>, TrackerError> {
        Ok(self.seeded_failed.clone())
    }

    fn get_remaining_tokens(
        &self,
        all_tokens: &[SceneToken],
    ) -> Result<Vec<SceneToken>, TrackerError> {
        self.remaining_queries.set(self.remaining_queries.get() + 1);
        Ok(all_tokens
            .iter()
            .filter(|token| !self.succeeded_tokens.contains(token))
            .cloned()
            .collect())
    }

    fn check_tokens_exist(
        &self,
        tokens: &[SceneToken],
    ) -> Result<HashSet<SceneToken>, TrackerError> {
        self.existence_queries.set(self.existence_queries.get() + 1);
        Ok(tokens
            .iter()
            .filter(|token| self.existing_tokens.contains(token))
            .cloned()
            .collect())
    }

    fn save_failed_record(&mut self, record: FailureRecord) -> Result<(), TrackerError> {
        self.failed.push(record);
        Ok(())
    }

    fn save_successful_batch(
        &mut self,
        tokens: &[SceneToken],
        batch_number: usize,
    ) -> Result<(), TrackerError> {
        self.succeeded_tokens.extend(tokens.iter().cloned());
        self.successes.push((batch_number, tokens.to_vec()));
        Ok(())
    }

    fn save_progress(&mut self, snapshot: ProgressSnapshot) -> Result<(), TrackerError> {
        self.progress.push(snapshot);
        Ok(())
    }

    fn finalize(&mut self) -> Result<(), TrackerError> {
        self.finalize_calls += 1;
        Ok(())
    }
}

/// One observed writer invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriterCall {
    /// 1-indexed batch number passed to the writer.
    pub batch_number: usize,
    /// The `insert_batch_size` hint passed to the writer.
    pub batch_size: usize,
    /// Rows in the merged frame handed over.
    pub rows: usize,
}

/// `BatchWriter` that records invocations and reports every row written.
#[derive(Debug, Default)]
pub struct CountingWriter {
    /// Observed invocations, in order.
    pub calls: Vec<WriterCall>,
}

impl BatchWriter for CountingWriter {
    fn write_batch(
        &mut self,
        frame: &crate::record::GeoFrame,
        batch_size: usize,
        _tracker: &mut dyn FailureTracker,
        batch_number: usize,
    ) -> Result<usize, WriteError> {
        self.calls.push(WriterCall {
            batch_number,
            batch_size,
            rows: frame.len(),
        });
        Ok(frame.len())
    }
}
