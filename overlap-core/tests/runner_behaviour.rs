#![expect(
    clippy::expect_used,
    reason = "tests should fail fast when setup breaks"
)]

//! Behavioural coverage for the batch runner: batching, failure isolation,
//! checkpoint ordering, retry, and cancellation.

use std::collections::HashSet;
use std::io;
use std::path::Path;

use rstest::{fixture, rstest};

use overlap_core::test_support::{CountingWriter, MemoryRepository, MemoryTracker, WriterCall};
use overlap_core::{
    BboxFrame, BboxRecord, CancelFlag, FailStage, FailureRecord, FailureTracker, FnWriter,
    GeoFrame, ManifestRepository, MetadataRecord, OverlapAnalysisConfig, OverlapRunError,
    ProgressSnapshot, RepositoryError, RunSummary, SceneToken, TrackerError, WriteError,
    run_overlap_analysis,
};

fn token(name: &str) -> SceneToken {
    SceneToken::new(name)
}

fn metadata_row(scene: &str, data_name: &str) -> MetadataRecord {
    MetadataRecord {
        scene_token: token(scene),
        data_name: data_name.into(),
        event_id: 10,
        city_id: 3,
        timestamp: 1_700_000_000,
    }
}

fn bounds_row(dataset: &str) -> BboxRecord {
    BboxRecord {
        dataset_name: dataset.into(),
        xmin: Some(0.0),
        ymin: Some(0.0),
        xmax: Some(1.0),
        ymax: Some(1.0),
        all_good: true,
    }
}

#[fixture]
fn three_scene_repo() -> MemoryRepository {
    MemoryRepository::new(
        vec![token("scene_001"), token("scene_002"), token("scene_003")],
        vec![
            metadata_row("scene_001", "cam_front"),
            metadata_row("scene_002", "cam_rear"),
            metadata_row("scene_003", "cam_front"),
        ],
        vec![bounds_row("cam_front"), bounds_row("cam_rear")],
    )
}

#[fixture]
fn config() -> OverlapAnalysisConfig {
    OverlapAnalysisConfig::new(2, 10, "work", false).expect("valid configuration")
}

fn run(
    repo: &MemoryRepository,
    config: &OverlapAnalysisConfig,
    tracker: &mut MemoryTracker,
    writer: &mut CountingWriter,
) -> RunSummary {
    run_overlap_analysis(
        repo,
        Path::new("manifest.json"),
        config,
        tracker,
        writer,
        &CancelFlag::new(),
    )
    .expect("run should not raise a fatal error")
}

#[rstest]
fn three_tokens_split_into_two_ordered_batches(
    three_scene_repo: MemoryRepository,
    config: OverlapAnalysisConfig,
) {
    let mut tracker = MemoryTracker::default();
    let mut writer = CountingWriter::default();

    let summary = run(&three_scene_repo, &config, &mut tracker, &mut writer);

    assert_eq!(
        summary,
        RunSummary {
            total_scenes: 3,
            processed_records: 3,
            inserted_records: 3,
            completed_batches: 2,
            interrupted: false,
        }
    );
    assert_eq!(
        writer.calls,
        vec![
            WriterCall {
                batch_number: 1,
                batch_size: 10,
                rows: 2
            },
            WriterCall {
                batch_number: 2,
                batch_size: 10,
                rows: 1
            },
        ]
    );
    assert_eq!(
        tracker.successes,
        vec![
            (1, vec![token("scene_001"), token("scene_002")]),
            (2, vec![token("scene_003")]),
        ]
    );
    assert_eq!(tracker.finalize_calls, 1);
    assert!(tracker.failed.is_empty());
}

#[rstest]
fn progress_snapshots_accumulate_monotonically(
    three_scene_repo: MemoryRepository,
    config: OverlapAnalysisConfig,
) {
    let mut tracker = MemoryTracker::default();
    let mut writer = CountingWriter::default();

    run(&three_scene_repo, &config, &mut tracker, &mut writer);

    assert_eq!(tracker.progress.len(), 2);
    let first = tracker.progress[0];
    let second = tracker.progress[1];
    assert_eq!(first.total_scenes, 3);
    assert_eq!((first.processed_records, first.inserted_records), (2, 2));
    assert_eq!((second.processed_records, second.inserted_records), (3, 3));
    assert!(second.batch_number > first.batch_number);
}

#[rstest]
fn empty_metadata_fails_every_token_without_invoking_the_writer(
    config: OverlapAnalysisConfig,
) {
    let repo = MemoryRepository::new(
        vec![token("scene_001"), token("scene_002"), token("scene_003")],
        Vec::new(),
        vec![bounds_row("cam_front")],
    );
    let mut tracker = MemoryTracker::default();
    let mut writer = CountingWriter::default();

    let summary = run(&repo, &config, &mut tracker, &mut writer);

    assert_eq!(summary.processed_records, 0);
    assert_eq!(summary.inserted_records, 0);
    assert!(!summary.interrupted);
    assert!(writer.calls.is_empty());
    assert!(tracker.successes.is_empty());
    assert_eq!(tracker.failed.len(), 3);
    assert!(
        tracker
            .failed
            .iter()
            .all(|record| record.fail_stage == FailStage::FetchMeta)
    );
    assert_eq!(tracker.failed[0].batch_number, 1);
    assert_eq!(tracker.failed[2].batch_number, 2);
    assert_eq!(tracker.finalize_calls, 1);
}

#[rstest]
fn zero_batch_size_built_as_a_struct_literal_degrades_to_single_token_batches(
    three_scene_repo: MemoryRepository,
) {
    // Bypasses the validating constructor on purpose.
    let config = OverlapAnalysisConfig {
        batch_size: 0,
        insert_batch_size: 10,
        work_dir: "work".into(),
        retry_failed: false,
    };
    let mut tracker = MemoryTracker::default();
    let mut writer = CountingWriter::default();

    let summary = run(&three_scene_repo, &config, &mut tracker, &mut writer);

    assert_eq!(summary.completed_batches, 3);
    assert_eq!(summary.processed_records, 3);
    assert_eq!(summary.inserted_records, 3);
    assert!(writer.calls.iter().all(|call| call.rows == 1));
}

#[rstest]
fn retry_runs_use_exactly_the_failed_set(three_scene_repo: MemoryRepository) {
    let config = OverlapAnalysisConfig::new(2, 10, "work", true).expect("valid configuration");
    let mut tracker = MemoryTracker::with_failed_tokens(vec![token("scene_002")]);
    let mut writer = CountingWriter::default();

    let summary = run(&three_scene_repo, &config, &mut tracker, &mut writer);

    assert_eq!(summary.total_scenes, 1);
    assert_eq!(summary.processed_records, 1);
    assert_eq!(tracker.remaining_queries.get(), 0);
    assert_eq!(tracker.existence_queries.get(), 0);
    assert_eq!(tracker.successes, vec![(1, vec![token("scene_002")])]);
}

#[rstest]
fn resumed_runs_skip_succeeded_and_existing_tokens(
    three_scene_repo: MemoryRepository,
    config: OverlapAnalysisConfig,
) {
    let mut tracker = MemoryTracker {
        succeeded_tokens: HashSet::from([token("scene_001")]),
        existing_tokens: HashSet::from([token("scene_002")]),
        ..MemoryTracker::default()
    };
    let mut writer = CountingWriter::default();

    let summary = run(&three_scene_repo, &config, &mut tracker, &mut writer);

    // total_scenes still counts the whole manifest in the non-retry path.
    assert_eq!(summary.total_scenes, 3);
    assert_eq!(summary.processed_records, 1);
    assert_eq!(writer.calls.len(), 1);
    assert_eq!(writer.calls[0].rows, 1);
    assert_eq!(tracker.successes, vec![(1, vec![token("scene_003")])]);
}

#[rstest]
fn cancellation_between_batches_interrupts_but_still_finalises(
    three_scene_repo: MemoryRepository,
    config: OverlapAnalysisConfig,
) {
    let cancel = CancelFlag::new();
    let mut tracker = MemoryTracker::default();
    let writer_cancel = cancel.clone();
    let mut writer = FnWriter(
        move |frame: &GeoFrame,
              _batch_size: usize,
              _tracker: &mut dyn FailureTracker,
              _batch_number: usize|
              -> Result<usize, WriteError> {
            writer_cancel.cancel();
            Ok(frame.len())
        },
    );

    let summary = run_overlap_analysis(
        &three_scene_repo,
        Path::new("manifest.json"),
        &config,
        &mut tracker,
        &mut writer,
        &cancel,
    )
    .expect("cancellation is not an error");

    assert!(summary.interrupted);
    assert_eq!(summary.completed_batches, 1);
    assert_eq!(summary.processed_records, 2);
    assert_eq!(tracker.finalize_calls, 1);
}

#[rstest]
fn write_failures_are_recorded_per_token_and_do_not_abort_the_run(
    three_scene_repo: MemoryRepository,
    config: OverlapAnalysisConfig,
) {
    let mut tracker = MemoryTracker::default();
    let mut writer = FnWriter(
        |_frame: &GeoFrame,
         _batch_size: usize,
         _tracker: &mut dyn FailureTracker,
         batch_number: usize|
         -> Result<usize, WriteError> {
            Err(WriteError::new(
                batch_number,
                io::Error::other("destination unavailable"),
            ))
        },
    );

    let summary = run_overlap_analysis(
        &three_scene_repo,
        Path::new("manifest.json"),
        &config,
        &mut tracker,
        &mut writer,
        &CancelFlag::new(),
    )
    .expect("write failures stay batch-local");

    assert_eq!(summary.completed_batches, 2);
    assert_eq!(summary.processed_records, 0);
    assert_eq!(summary.inserted_records, 0);
    assert_eq!(tracker.failed.len(), 3);
    assert!(
        tracker
            .failed
            .iter()
            .all(|record| record.fail_stage == FailStage::Write)
    );
    assert_eq!(tracker.finalize_calls, 1);
}

/// Repository whose bbox fetch always fails.
struct BrokenBboxRepo {
    inner: MemoryRepository,
}

impl ManifestRepository for BrokenBboxRepo {
    fn load_scene_ids(&self, manifest_path: &Path) -> Result<Vec<SceneToken>, RepositoryError> {
        self.inner.load_scene_ids(manifest_path)
    }

    fn fetch_metadata(
        &self,
        tokens: &[SceneToken],
    ) -> Result<Vec<MetadataRecord>, RepositoryError> {
        self.inner.fetch_metadata(tokens)
    }

    fn fetch_bbox_geometries(
        &self,
        dataset_names: &[String],
    ) -> Result<BboxFrame, RepositoryError> {
        Err(RepositoryError::FetchBbox {
            dataset_count: dataset_names.len(),
            source: Box::new(io::Error::other("bbox store offline")),
        })
    }
}

#[rstest]
fn bbox_fetch_failures_use_the_fetch_bbox_stage(
    three_scene_repo: MemoryRepository,
    config: OverlapAnalysisConfig,
) {
    let repo = BrokenBboxRepo {
        inner: three_scene_repo,
    };
    let mut tracker = MemoryTracker::default();
    let mut writer = CountingWriter::default();

    let summary = run_overlap_analysis(
        &repo,
        Path::new("manifest.json"),
        &config,
        &mut tracker,
        &mut writer,
        &CancelFlag::new(),
    )
    .expect("bbox failures stay batch-local");

    assert_eq!(summary.completed_batches, 2);
    assert!(writer.calls.is_empty());
    assert_eq!(tracker.failed.len(), 3);
    assert!(
        tracker
            .failed
            .iter()
            .all(|record| record.fail_stage == FailStage::FetchBbox)
    );
}

#[rstest]
fn malformed_bbox_rows_fail_at_the_merge_stage(config: OverlapAnalysisConfig) {
    let repo = MemoryRepository::new(
        vec![token("scene_001")],
        vec![metadata_row("scene_001", "cam_front")],
        vec![BboxRecord {
            xmin: None,
            ..bounds_row("cam_front")
        }],
    );
    let mut tracker = MemoryTracker::default();
    let mut writer = CountingWriter::default();

    let summary = run(&repo, &config, &mut tracker, &mut writer);

    assert_eq!(summary.processed_records, 0);
    assert_eq!(tracker.failed.len(), 1);
    assert_eq!(tracker.failed[0].fail_stage, FailStage::Merge);
    assert!(writer.calls.is_empty());
}

#[rstest]
fn batch_failures_do_not_abort_later_batches(config: OverlapAnalysisConfig) {
    // Batch one has no metadata at all; batch two completes.
    let repo = MemoryRepository::new(
        vec![token("scene_001"), token("scene_002"), token("scene_003")],
        vec![metadata_row("scene_003", "cam_front")],
        vec![bounds_row("cam_front")],
    );
    let mut tracker = MemoryTracker::default();
    let mut writer = CountingWriter::default();

    let summary = run(&repo, &config, &mut tracker, &mut writer);

    assert_eq!(summary.processed_records, 1);
    assert_eq!(summary.inserted_records, 1);
    assert_eq!(tracker.failed.len(), 2);
    assert_eq!(tracker.successes, vec![(2, vec![token("scene_003")])]);
}

/// Tracker whose checkpoint writes always fail.
struct UnwritableTracker {
    inner: MemoryTracker,
}

impl FailureTracker for UnwritableTracker {
    fn load_failed_tokens(&self) -> Result<Vec<SceneToken>, TrackerError> {
        self.inner.load_failed_tokens()
    }

    fn get_remaining_tokens(
        &self,
        all_tokens: &[SceneToken],
    ) -> Result<Vec<SceneToken>, TrackerError> {
        self.inner.get_remaining_tokens(all_tokens)
    }

    fn check_tokens_exist(
        &self,
        tokens: &[SceneToken],
    ) -> Result<HashSet<SceneToken>, TrackerError> {
        self.inner.check_tokens_exist(tokens)
    }

    fn save_failed_record(&mut self, _record: FailureRecord) -> Result<(), TrackerError> {
        Err(TrackerError::message("persist failed records"))
    }

    fn save_successful_batch(
        &mut self,
        _tokens: &[SceneToken],
        _batch_number: usize,
    ) -> Result<(), TrackerError> {
        Err(TrackerError::message("persist succeeded tokens"))
    }

    fn save_progress(&mut self, _snapshot: ProgressSnapshot) -> Result<(), TrackerError> {
        Err(TrackerError::message("persist progress"))
    }

    fn finalize(&mut self) -> Result<(), TrackerError> {
        self.inner.finalize()
    }
}

#[rstest]
fn tracker_persistence_failures_are_fatal_but_the_tracker_is_still_sealed(
    three_scene_repo: MemoryRepository,
    config: OverlapAnalysisConfig,
) {
    let mut tracker = UnwritableTracker {
        inner: MemoryTracker::default(),
    };
    let mut writer = CountingWriter::default();

    let error = run_overlap_analysis(
        &three_scene_repo,
        Path::new("manifest.json"),
        &config,
        &mut tracker,
        &mut writer,
        &CancelFlag::new(),
    )
    .expect_err("checkpoint write failures are fatal");

    assert!(matches!(error, OverlapRunError::Tracker(_)));
    assert_eq!(tracker.inner.finalize_calls, 1);
    // The first batch reached the writer before its success checkpoint
    // failed; no further batch was attempted.
    assert_eq!(writer.calls.len(), 1);
}

/// Repository whose manifest never loads.
struct UnreadableManifestRepo;

impl ManifestRepository for UnreadableManifestRepo {
    fn load_scene_ids(&self, manifest_path: &Path) -> Result<Vec<SceneToken>, RepositoryError> {
        Err(RepositoryError::Manifest {
            path: manifest_path.to_path_buf(),
            source: Box::new(io::Error::new(io::ErrorKind::NotFound, "no manifest")),
        })
    }

    fn fetch_metadata(
        &self,
        _tokens: &[SceneToken],
    ) -> Result<Vec<MetadataRecord>, RepositoryError> {
        Ok(Vec::new())
    }

    fn fetch_bbox_geometries(
        &self,
        _dataset_names: &[String],
    ) -> Result<BboxFrame, RepositoryError> {
        Ok(BboxFrame::Bounds(Vec::new()))
    }
}

#[rstest]
fn unreadable_manifest_is_fatal_but_the_tracker_is_still_sealed(
    config: OverlapAnalysisConfig,
) {
    let mut tracker = MemoryTracker::default();
    let mut writer = CountingWriter::default();

    let error = run_overlap_analysis(
        &UnreadableManifestRepo,
        Path::new("missing.json"),
        &config,
        &mut tracker,
        &mut writer,
        &CancelFlag::new(),
    )
    .expect_err("setup errors propagate");

    assert!(matches!(error, OverlapRunError::Repository(_)));
    assert_eq!(tracker.finalize_calls, 1);
    assert!(writer.calls.is_empty());
}
