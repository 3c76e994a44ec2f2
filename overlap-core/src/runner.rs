//! Batched fetch, merge, write orchestration with failure bookkeeping.
//!
//! The runner resolves the work set, partitions it into order-preserving
//! batches, and for each batch fetches metadata, joins it with bounding-box
//! geometries, and hands the merged frame to the writer. One bad record
//! never aborts the run: stage failures are recorded per token through the
//! tracker and the loop moves on. Execution is strictly batch-sequential;
//! the progress counters and checkpoint ordering depend on it.

use std::collections::HashSet;
use std::error::Error;
use std::fmt::Display;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, info, warn};
use thiserror::Error as ThisError;

use crate::config::OverlapAnalysisConfig;
use crate::geometry::merge_metadata_with_bboxes;
use crate::record::{FailStage, FailureRecord, GeoFrame, ProgressSnapshot, RunSummary, SceneToken};
use crate::store::ManifestRepository;
use crate::tracker::{FailureTracker, TrackerError};

/// Error raised when a batch writer rejects a merged frame.
#[derive(Debug, ThisError)]
#[error("failed to write merged batch {batch_number}")]
pub struct WriteError {
    batch_number: usize,
    #[source]
    source: Box<dyn Error + Send + Sync>,
}

impl WriteError {
    /// Wrap an underlying sink error with the batch it rejected.
    #[must_use]
    pub fn new(batch_number: usize, source: impl Error + Send + Sync + 'static) -> Self {
        Self {
            batch_number,
            source: Box::new(source),
        }
    }

    /// The 1-indexed batch the writer rejected.
    #[must_use]
    pub const fn batch_number(&self) -> usize {
        self.batch_number
    }
}

/// Storage sink for merged geo-frames.
///
/// `batch_size` is the `insert_batch_size` hint from the run configuration;
/// the tracker is passed through so writers with row-level visibility can
/// record their own failures. The return value is the number of rows
/// actually written, which feeds the `inserted_records` counter.
pub trait BatchWriter {
    /// Write one merged frame and report the rows inserted.
    fn write_batch(
        &mut self,
        frame: &GeoFrame,
        batch_size: usize,
        tracker: &mut dyn FailureTracker,
        batch_number: usize,
    ) -> Result<usize, WriteError>;
}

/// Adapter letting a plain closure serve as a [`BatchWriter`].
///
/// # Examples
/// ```
/// use overlap_core::test_support::MemoryTracker;
/// use overlap_core::{BatchWriter, FailureTracker, FnWriter, GeoFrame, WriteError};
///
/// let mut writer = FnWriter(
///     |frame: &GeoFrame, _size: usize, _tracker: &mut dyn FailureTracker, _batch: usize|
///         -> Result<usize, WriteError> { Ok(frame.len()) },
/// );
/// let mut tracker = MemoryTracker::default();
/// let written = writer.write_batch(&GeoFrame::wgs84(Vec::new()), 10, &mut tracker, 1)?;
/// assert_eq!(written, 0);
/// # Ok::<(), WriteError>(())
/// ```
#[derive(Debug)]
pub struct FnWriter<F>(pub F);

impl<F> BatchWriter for FnWriter<F>
where
    F: FnMut(&GeoFrame, usize, &mut dyn FailureTracker, usize) -> Result<usize, WriteError>,
{
    fn write_batch(
        &mut self,
        frame: &GeoFrame,
        batch_size: usize,
        tracker: &mut dyn FailureTracker,
        batch_number: usize,
    ) -> Result<usize, WriteError> {
        (self.0)(frame, batch_size, tracker, batch_number)
    }
}

/// Cooperative cancellation flag checked between batches.
///
/// Cancelling never skips finalisation: the tracker is still sealed and the
/// summary reports `interrupted = true`.
///
/// # Examples
/// ```
/// use overlap_core::CancelFlag;
///
/// let flag = CancelFlag::new();
/// assert!(!flag.is_cancelled());
/// flag.cancel();
/// assert!(flag.is_cancelled());
/// ```
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    /// Create a flag in the not-cancelled state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request that the run stops before the next batch.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Fatal errors of a pipeline run.
///
/// Batch-local stage failures never surface here; they are recorded through
/// the tracker. Only pre-batch setup errors and checkpoint persistence
/// failures are fatal.
#[derive(Debug, ThisError)]
pub enum OverlapRunError {
    /// The repository failed before any batch was formed.
    #[error(transparent)]
    Repository(#[from] crate::store::RepositoryError),
    /// The tracker could not persist or recover checkpoint state.
    #[error(transparent)]
    Tracker(#[from] TrackerError),
}

struct WorkSet {
    tokens: Vec<SceneToken>,
    total_scenes: usize,
}

enum BatchOutcome {
    /// The batch reached the writer; tokens are the ones present in the
    /// fetched metadata.
    Written {
        tokens: Vec<SceneToken>,
        metadata_rows: usize,
        inserted: usize,
    },
    /// A stage failed; every affected token was recorded and the batch is
    /// done.
    Skipped,
}

/// Run the batched overlap analysis end to end.
///
/// Resolves the work set (the failed set when `retry_failed` is on, the
/// manifest minus already-succeeded and already-present tokens otherwise),
/// processes it in order-preserving batches of `config.batch_size`, and
/// finalises the tracker exactly once on every path. The returned
/// [`RunSummary`] is authoritative for the run outcome; per-token failure
/// detail lives in the tracker.
///
/// # Examples
/// ```
/// use std::path::Path;
/// use overlap_core::test_support::{CountingWriter, MemoryRepository, MemoryTracker};
/// use overlap_core::{CancelFlag, OverlapAnalysisConfig, run_overlap_analysis};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let repo = MemoryRepository::default();
/// let config = OverlapAnalysisConfig::new(2, 10, "work", false)?;
/// let mut tracker = MemoryTracker::default();
/// let mut writer = CountingWriter::default();
///
/// let summary = run_overlap_analysis(
///     &repo,
///     Path::new("manifest.json"),
///     &config,
///     &mut tracker,
///     &mut writer,
///     &CancelFlag::new(),
/// )?;
/// assert_eq!(summary.total_scenes, 0);
/// assert_eq!(tracker.finalize_calls, 1);
/// # Ok(())
/// # }
/// ```
pub fn run_overlap_analysis<R, W>(
    repo: &R,
    manifest_path: &Path,
    config: &OverlapAnalysisConfig,
    tracker: &mut dyn FailureTracker,
    writer: &mut W,
    cancel: &CancelFlag,
) -> Result<RunSummary, OverlapRunError>
where
    R: ManifestRepository + ?Sized,
    W: BatchWriter + ?Sized,
{
    let outcome = resolve_work_set(repo, manifest_path, config, tracker)
        .and_then(|work_set| process_batches(repo, config, tracker, writer, cancel, &work_set));

    // The tracker is sealed on every path, including fatal checkpoint
    // errors raised mid-run.
    if let Err(finalize_error) = tracker.finalize() {
        return match outcome {
            Ok(_) => Err(OverlapRunError::Tracker(finalize_error)),
            Err(run_error) => {
                warn!("failure tracker finalisation also failed: {finalize_error}");
                Err(run_error)
            }
        };
    }

    outcome
}

fn resolve_work_set<R>(
    repo: &R,
    manifest_path: &Path,
    config: &OverlapAnalysisConfig,
    tracker: &mut dyn FailureTracker,
) -> Result<WorkSet, OverlapRunError>
where
    R: ManifestRepository + ?Sized,
{
    if config.retry_failed {
        let tokens = tracker.load_failed_tokens()?;
        info!("retrying {} previously failed scene tokens", tokens.len());
        let total_scenes = tokens.len();
        return Ok(WorkSet {
            tokens,
            total_scenes,
        });
    }

    let all_tokens = repo.load_scene_ids(manifest_path)?;
    let total_scenes = all_tokens.len();
    let remaining = tracker.get_remaining_tokens(&all_tokens)?;
    let existing = tracker.check_tokens_exist(&remaining)?;
    let tokens: Vec<SceneToken> = if existing.is_empty() {
        remaining
    } else {
        remaining
            .into_iter()
            .filter(|token| !existing.contains(token))
            .collect()
    };
    info!(
        "manifest holds {total_scenes} scene tokens, {} remaining after checkpoint filtering",
        tokens.len()
    );
    Ok(WorkSet {
        tokens,
        total_scenes,
    })
}

fn process_batches<R, W>(
    repo: &R,
    config: &OverlapAnalysisConfig,
    tracker: &mut dyn FailureTracker,
    writer: &mut W,
    cancel: &CancelFlag,
    work_set: &WorkSet,
) -> Result<RunSummary, OverlapRunError>
where
    R: ManifestRepository + ?Sized,
    W: BatchWriter + ?Sized,
{
    // A config built as a struct literal can bypass the validating
    // constructor with a zero batch size; chunking requires at least one.
    let batch_size = config.batch_size.max(1);
    let batch_count = work_set.tokens.len().div_ceil(batch_size);
    let mut processed_records = 0_usize;
    let mut inserted_records = 0_usize;
    let mut completed_batches = 0_usize;
    let mut interrupted = false;

    for (index, batch) in work_set.tokens.chunks(batch_size).enumerate() {
        if cancel.is_cancelled() {
            warn!("cancellation requested; stopping after {completed_batches}/{batch_count} batches");
            interrupted = true;
            break;
        }
        let batch_number = index + 1;
        debug!("processing batch {batch_number}/{batch_count} ({} tokens)", batch.len());

        if let BatchOutcome::Written {
            tokens,
            metadata_rows,
            inserted,
        } = process_batch(repo, config, tracker, writer, batch, batch_number)?
        {
            processed_records += metadata_rows;
            inserted_records += inserted;
            tracker.save_successful_batch(&tokens, batch_number)?;
            tracker.save_progress(ProgressSnapshot {
                total_scenes: work_set.total_scenes,
                processed_records,
                inserted_records,
                batch_number,
            })?;
        }
        completed_batches += 1;
    }

    info!(
        "run finished: {processed_records} records processed, {inserted_records} inserted, \
         {completed_batches}/{batch_count} batches"
    );
    Ok(RunSummary {
        total_scenes: work_set.total_scenes,
        processed_records,
        inserted_records,
        completed_batches,
        interrupted,
    })
}

fn process_batch<R, W>(
    repo: &R,
    config: &OverlapAnalysisConfig,
    tracker: &mut dyn FailureTracker,
    writer: &mut W,
    batch: &[SceneToken],
    batch_number: usize,
) -> Result<BatchOutcome, TrackerError>
where
    R: ManifestRepository + ?Sized,
    W: BatchWriter + ?Sized,
{
    let metadata = match repo.fetch_metadata(batch) {
        Ok(rows) => rows,
        Err(error) => {
            record_stage_failure(tracker, batch, batch_number, FailStage::FetchMeta, &error)?;
            return Ok(BatchOutcome::Skipped);
        }
    };
    if metadata.is_empty() {
        record_stage_failure(
            tracker,
            batch,
            batch_number,
            FailStage::FetchMeta,
            &"no metadata rows returned for the batch",
        )?;
        return Ok(BatchOutcome::Skipped);
    }

    // Tokens that reached the merge stage; tokens absent from the metadata
    // stay unmarked and remain in the work set of the next session.
    let mut seen_tokens = HashSet::new();
    let metadata_tokens: Vec<SceneToken> = metadata
        .iter()
        .filter(|row| seen_tokens.insert(&row.scene_token))
        .map(|row| row.scene_token.clone())
        .collect();
    if metadata_tokens.len() < batch.len() {
        debug!(
            "batch {batch_number}: metadata covers {}/{} requested tokens",
            metadata_tokens.len(),
            batch.len()
        );
    }

    let mut seen_datasets = HashSet::new();
    let dataset_names: Vec<String> = metadata
        .iter()
        .filter(|row| seen_datasets.insert(row.data_name.as_str()))
        .map(|row| row.data_name.clone())
        .collect();

    let bbox_frame = match repo.fetch_bbox_geometries(&dataset_names) {
        Ok(frame) => frame,
        Err(error) => {
            record_stage_failure(
                tracker,
                &metadata_tokens,
                batch_number,
                FailStage::FetchBbox,
                &error,
            )?;
            return Ok(BatchOutcome::Skipped);
        }
    };

    let merged = match merge_metadata_with_bboxes(&metadata, bbox_frame) {
        Ok(frame) => frame,
        Err(error) => {
            record_stage_failure(
                tracker,
                &metadata_tokens,
                batch_number,
                FailStage::Merge,
                &error,
            )?;
            return Ok(BatchOutcome::Skipped);
        }
    };
    if merged.len() < metadata.len() {
        debug!(
            "batch {batch_number}: {} metadata rows had no matching dataset geometry",
            metadata.len() - merged.len()
        );
    }

    let inserted = match writer.write_batch(
        &merged,
        config.insert_batch_size,
        &mut *tracker,
        batch_number,
    ) {
        Ok(count) => count,
        Err(error) => {
            record_stage_failure(
                tracker,
                &metadata_tokens,
                batch_number,
                FailStage::Write,
                &error,
            )?;
            return Ok(BatchOutcome::Skipped);
        }
    };

    Ok(BatchOutcome::Written {
        tokens: metadata_tokens,
        metadata_rows: metadata.len(),
        inserted,
    })
}

fn record_stage_failure(
    tracker: &mut dyn FailureTracker,
    tokens: &[SceneToken],
    batch_number: usize,
    fail_stage: FailStage,
    error: &dyn Display,
) -> Result<(), TrackerError> {
    let error_message = error.to_string();
    warn!(
        "batch {batch_number}: {fail_stage} failure for {} tokens: {error_message}",
        tokens.len()
    );
    for token in tokens {
        tracker.save_failed_record(FailureRecord {
            scene_token: token.clone(),
            error_message: error_message.clone(),
            batch_number,
            fail_stage,
        })?;
    }
    Ok(())
}
