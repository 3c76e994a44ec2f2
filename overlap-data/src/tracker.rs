//! File-backed failure tracker persisting JSON checkpoints.
//!
//! The tracker keeps three files under the run's work directory:
//! `failed_records.json`, `succeeded_tokens.json`, and `progress.json`,
//! plus a `run_complete.json` marker written at finalisation. Checkpoints
//! are rewritten after every mutation through a temp-file-and-rename, so a
//! crash mid-write never leaves a torn file behind. The layout is private
//! to this type; the runner only sees the trait.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use log::info;
use serde::Serialize;
use tempfile::NamedTempFile;

use overlap_core::{
    FailureRecord, FailureTracker, ProgressSnapshot, SceneToken, TrackerError,
};

const FAILED_FILE: &str = "failed_records.json";
const SUCCEEDED_FILE: &str = "succeeded_tokens.json";
const PROGRESS_FILE: &str = "progress.json";
const COMPLETE_FILE: &str = "run_complete.json";

/// Completion marker persisted by [`FileFailureTracker::finalize`].
#[derive(Debug, Serialize)]
struct RunCompleteMarker {
    finalized: bool,
    progress: Option<ProgressSnapshot>,
}

/// Failure tracker persisting its state as JSON files under `work_dir`.
///
/// Opening the same directory again resumes the previous session's state,
/// which is what makes interrupted runs restartable. The tracker has no
/// destination visibility, so `check_tokens_exist` always reports an empty
/// set; dedup against the destination is the writer's job.
///
/// # Examples
/// ```
/// use overlap_core::{FailureTracker, SceneToken};
/// use overlap_data::FileFailureTracker;
///
/// # fn main() -> Result<(), overlap_core::TrackerError> {
/// let dir = tempfile::tempdir().map_err(|e| overlap_core::TrackerError::new("create temp dir", e))?;
/// let mut tracker = FileFailureTracker::open(dir.path())?;
/// tracker.save_successful_batch(&[SceneToken::new("scene_001")], 1)?;
/// tracker.finalize()?;
///
/// let resumed = FileFailureTracker::open(dir.path())?;
/// let remaining = resumed.get_remaining_tokens(&[
///     SceneToken::new("scene_001"),
///     SceneToken::new("scene_002"),
/// ])?;
/// assert_eq!(remaining, vec![SceneToken::new("scene_002")]);
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct FileFailureTracker {
    work_dir: PathBuf,
    failed: Vec<FailureRecord>,
    succeeded: Vec<SceneToken>,
    succeeded_set: HashSet<SceneToken>,
    progress: Option<ProgressSnapshot>,
    finalized: bool,
}

impl FileFailureTracker {
    /// Open a tracker over `work_dir`, resuming any persisted state.
    pub fn open(work_dir: impl Into<PathBuf>) -> Result<Self, TrackerError> {
        let work_dir = work_dir.into();
        fs::create_dir_all(&work_dir)
            .map_err(|source| TrackerError::new("create work directory", source))?;

        let failed: Vec<FailureRecord> =
            load_json(&work_dir.join(FAILED_FILE), "load failed records")?.unwrap_or_default();
        let succeeded: Vec<SceneToken> =
            load_json(&work_dir.join(SUCCEEDED_FILE), "load succeeded tokens")?
                .unwrap_or_default();
        let progress: Option<ProgressSnapshot> =
            load_json(&work_dir.join(PROGRESS_FILE), "load progress")?;

        if !failed.is_empty() || !succeeded.is_empty() {
            info!(
                "resuming tracker state: {} failed records, {} succeeded tokens",
                failed.len(),
                succeeded.len()
            );
        }

        let succeeded_set = succeeded.iter().cloned().collect();
        Ok(Self {
            work_dir,
            failed,
            succeeded,
            succeeded_set,
            progress,
            finalized: false,
        })
    }

    /// Failure records accumulated so far, in insertion order.
    #[must_use]
    pub fn failed_records(&self) -> &[FailureRecord] {
        &self.failed
    }

    /// The most recent progress snapshot, if any was saved.
    #[must_use]
    pub const fn progress(&self) -> Option<ProgressSnapshot> {
        self.progress
    }

    /// Whether this session has been finalised.
    #[must_use]
    pub const fn is_finalized(&self) -> bool {
        self.finalized
    }

    fn persist_json<T: Serialize>(
        &self,
        file_name: &str,
        value: &T,
        operation: &'static str,
    ) -> Result<(), TrackerError> {
        let target = self.work_dir.join(file_name);
        let file = NamedTempFile::new_in(&self.work_dir)
            .map_err(|source| TrackerError::new(operation, source))?;
        serde_json::to_writer_pretty(file.as_file(), value)
            .map_err(|source| TrackerError::new(operation, source))?;
        file.persist(&target)
            .map_err(|source| TrackerError::new(operation, source))?;
        Ok(())
    }

    fn persist_failed(&self) -> Result<(), TrackerError> {
        self.persist_json(FAILED_FILE, &self.failed, "persist failed records")
    }

    fn persist_succeeded(&self) -> Result<(), TrackerError> {
        self.persist_json(SUCCEEDED_FILE, &self.succeeded, "persist succeeded tokens")
    }
}

fn load_json<T: serde::de::DeserializeOwned>(
    path: &Path,
    operation: &'static str,
) -> Result<Option<T>, TrackerError> {
    if !path.exists() {
        return Ok(None);
    }
    let payload = fs::read_to_string(path).map_err(|source| TrackerError::new(operation, source))?;
    let value = serde_json::from_str(&payload).map_err(|source| TrackerError::new(operation, source))?;
    Ok(Some(value))
}

impl FailureTracker for FileFailureTracker {
    fn load_failed_tokens(&self) -> Result<Vec<SceneToken>, TrackerError> {
        let mut seen = HashSet::new();
        Ok(self
            .failed
            .iter()
            .filter(|record| seen.insert(&record.scene_token))
            .map(|record| record.scene_token.clone())
            .collect())
    }

    fn get_remaining_tokens(
        &self,
        all_tokens: &[SceneToken],
    ) -> Result<Vec<SceneToken>, TrackerError> {
        Ok(all_tokens
            .iter()
            .filter(|token| !self.succeeded_set.contains(token))
            .cloned()
            .collect())
    }

    fn check_tokens_exist(
        &self,
        _tokens: &[SceneToken],
    ) -> Result<HashSet<SceneToken>, TrackerError> {
        // No destination visibility from the checkpoint directory.
        Ok(HashSet::new())
    }

    fn save_failed_record(&mut self, record: FailureRecord) -> Result<(), TrackerError> {
        self.failed.push(record);
        self.persist_failed()
    }

    fn save_successful_batch(
        &mut self,
        tokens: &[SceneToken],
        _batch_number: usize,
    ) -> Result<(), TrackerError> {
        for token in tokens {
            if self.succeeded_set.insert(token.clone()) {
                self.succeeded.push(token.clone());
            }
        }
        // A token that eventually succeeds leaves the retry set.
        let succeeded_set = &self.succeeded_set;
        let before = self.failed.len();
        self.failed
            .retain(|record| !succeeded_set.contains(&record.scene_token));
        self.persist_succeeded()?;
        if self.failed.len() != before {
            self.persist_failed()?;
        }
        Ok(())
    }

    fn save_progress(&mut self, snapshot: ProgressSnapshot) -> Result<(), TrackerError> {
        self.progress = Some(snapshot);
        self.persist_json(PROGRESS_FILE, &snapshot, "persist progress")
    }

    fn finalize(&mut self) -> Result<(), TrackerError> {
        if self.finalized {
            return Ok(());
        }
        self.persist_failed()?;
        self.persist_succeeded()?;
        if let Some(snapshot) = self.progress {
            self.persist_json(PROGRESS_FILE, &snapshot, "persist progress")?;
        }
        let marker = RunCompleteMarker {
            finalized: true,
            progress: self.progress,
        };
        self.persist_json(COMPLETE_FILE, &marker, "persist completion marker")?;
        self.finalized = true;
        Ok(())
    }
}

#[cfg(test)]
#[expect(
    clippy::expect_used,
    reason = "tests should fail fast when setup breaks"
)]
mod tests {
    use super::*;
    use overlap_core::FailStage;
    use rstest::{fixture, rstest};
    use tempfile::TempDir;

    fn failure(scene: &str, batch_number: usize) -> FailureRecord {
        FailureRecord {
            scene_token: SceneToken::new(scene),
            error_message: "no metadata rows returned".into(),
            batch_number,
            fail_stage: FailStage::FetchMeta,
        }
    }

    #[fixture]
    fn work_dir() -> TempDir {
        TempDir::new().expect("create temp work dir")
    }

    #[rstest]
    fn fresh_directories_start_empty(work_dir: TempDir) {
        let tracker = FileFailureTracker::open(work_dir.path()).expect("open tracker");
        assert!(tracker.failed_records().is_empty());
        assert!(tracker.load_failed_tokens().expect("load failed").is_empty());
        assert_eq!(tracker.progress(), None);
    }

    #[rstest]
    fn failures_survive_a_reopen(work_dir: TempDir) {
        {
            let mut tracker = FileFailureTracker::open(work_dir.path()).expect("open tracker");
            tracker
                .save_failed_record(failure("scene_001", 1))
                .expect("save failure");
            tracker
                .save_failed_record(failure("scene_001", 2))
                .expect("save repeat failure");
            tracker
                .save_failed_record(failure("scene_002", 2))
                .expect("save second failure");
        }

        let tracker = FileFailureTracker::open(work_dir.path()).expect("reopen tracker");
        assert_eq!(tracker.failed_records().len(), 3);
        // Retry sets are deduplicated in first-seen order.
        assert_eq!(
            tracker.load_failed_tokens().expect("load failed"),
            vec![SceneToken::new("scene_001"), SceneToken::new("scene_002")]
        );
    }

    #[rstest]
    fn later_success_removes_a_token_from_the_retry_set(work_dir: TempDir) {
        let mut tracker = FileFailureTracker::open(work_dir.path()).expect("open tracker");
        tracker
            .save_failed_record(failure("scene_001", 1))
            .expect("save failure");
        tracker
            .save_successful_batch(&[SceneToken::new("scene_001")], 2)
            .expect("save success");

        assert!(tracker.load_failed_tokens().expect("load failed").is_empty());

        let reopened = FileFailureTracker::open(work_dir.path()).expect("reopen tracker");
        assert!(reopened.failed_records().is_empty());
        assert_eq!(
            reopened
                .get_remaining_tokens(&[SceneToken::new("scene_001")])
                .expect("remaining"),
            Vec::new()
        );
    }

    #[rstest]
    fn progress_snapshots_survive_a_reopen(work_dir: TempDir) {
        let snapshot = ProgressSnapshot {
            total_scenes: 10,
            processed_records: 4,
            inserted_records: 4,
            batch_number: 2,
        };
        {
            let mut tracker = FileFailureTracker::open(work_dir.path()).expect("open tracker");
            tracker.save_progress(snapshot).expect("save progress");
        }

        let tracker = FileFailureTracker::open(work_dir.path()).expect("reopen tracker");
        assert_eq!(tracker.progress(), Some(snapshot));
    }

    #[rstest]
    fn finalize_is_idempotent_and_writes_the_marker(work_dir: TempDir) {
        let mut tracker = FileFailureTracker::open(work_dir.path()).expect("open tracker");
        tracker.finalize().expect("first finalize");
        tracker.finalize().expect("second finalize");

        assert!(tracker.is_finalized());
        assert!(work_dir.path().join("run_complete.json").exists());
    }

    #[rstest]
    fn existence_checks_are_unsupported(work_dir: TempDir) {
        let tracker = FileFailureTracker::open(work_dir.path()).expect("open tracker");
        let existing = tracker
            .check_tokens_exist(&[SceneToken::new("scene_001")])
            .expect("existence query");
        assert!(existing.is_empty());
    }
}
