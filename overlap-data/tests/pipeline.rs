#![expect(
    clippy::expect_used,
    reason = "tests should fail fast when setup breaks"
)]

//! End-to-end pipeline coverage: seeded SQLite store, file-backed tracker,
//! and SQLite destination, across fresh, resumed, and retry sessions.

use std::fs;
use std::path::PathBuf;

use rstest::{fixture, rstest};
use tempfile::TempDir;

use overlap_core::{
    BboxRecord, CancelFlag, FailStage, FailureTracker, MetadataRecord, OverlapAnalysisConfig,
    SceneToken, run_overlap_analysis,
};
use overlap_data::{FileFailureTracker, SqliteBatchWriter, SqliteSceneStore};

struct PipelineFixture {
    _dir: TempDir,
    manifest_path: PathBuf,
    work_dir: PathBuf,
    destination_path: PathBuf,
}

fn metadata_row(scene: &str, data_name: &str) -> MetadataRecord {
    MetadataRecord {
        scene_token: SceneToken::new(scene),
        data_name: data_name.into(),
        event_id: 12,
        city_id: 4,
        timestamp: 1_700_000_000,
    }
}

fn bounds_row(dataset: &str, xmin: f64, ymax: f64) -> BboxRecord {
    BboxRecord {
        dataset_name: dataset.into(),
        xmin: Some(xmin),
        ymin: Some(0.0),
        xmax: Some(xmin + 1.0),
        ymax: Some(ymax),
        all_good: true,
    }
}

#[fixture]
fn pipeline() -> PipelineFixture {
    let dir = TempDir::new().expect("create temp dir");
    let manifest_path = dir.path().join("manifest.json");
    fs::write(
        &manifest_path,
        r#"["scene_001", "scene_002", "scene_003"]"#,
    )
    .expect("write manifest");
    let work_dir = dir.path().join("work");
    let destination_path = dir.path().join("overlaps.db");
    PipelineFixture {
        manifest_path,
        work_dir,
        destination_path,
        _dir: dir,
    }
}

fn seeded_store() -> SqliteSceneStore {
    let store = SqliteSceneStore::open_in_memory().expect("open scene store");
    store
        .insert_metadata(&[
            metadata_row("scene_001", "cam_front"),
            metadata_row("scene_002", "cam_rear"),
            metadata_row("scene_003", "cam_front"),
        ])
        .expect("seed metadata");
    store
        .insert_bboxes(&[
            bounds_row("cam_front", 0.0, 2.0),
            bounds_row("cam_rear", 5.0, 1.0),
        ])
        .expect("seed bboxes");
    store
}

#[rstest]
fn full_run_persists_every_merged_row(pipeline: PipelineFixture) {
    let store = seeded_store();
    let config =
        OverlapAnalysisConfig::new(2, 10, &pipeline.work_dir, false).expect("valid config");
    let mut tracker = FileFailureTracker::open(&pipeline.work_dir).expect("open tracker");
    let mut writer = SqliteBatchWriter::open(&pipeline.destination_path).expect("open writer");

    let summary = run_overlap_analysis(
        &store,
        &pipeline.manifest_path,
        &config,
        &mut tracker,
        &mut writer,
        &CancelFlag::new(),
    )
    .expect("run pipeline");

    assert_eq!(summary.total_scenes, 3);
    assert_eq!(summary.processed_records, 3);
    assert_eq!(summary.inserted_records, 3);
    assert!(!summary.interrupted);
    assert_eq!(writer.inserted_count().expect("count rows"), 3);
    assert!(tracker.is_finalized());

    let stored = writer.load_overlaps().expect("load overlaps");
    assert!(stored.iter().all(|record| record.all_good));
}

#[rstest]
fn resumed_runs_skip_succeeded_tokens_and_reinsert_nothing(pipeline: PipelineFixture) {
    let store = seeded_store();
    let config =
        OverlapAnalysisConfig::new(2, 10, &pipeline.work_dir, false).expect("valid config");

    {
        let mut tracker = FileFailureTracker::open(&pipeline.work_dir).expect("open tracker");
        let mut writer =
            SqliteBatchWriter::open(&pipeline.destination_path).expect("open writer");
        run_overlap_analysis(
            &store,
            &pipeline.manifest_path,
            &config,
            &mut tracker,
            &mut writer,
            &CancelFlag::new(),
        )
        .expect("first session");
    }

    // Second session against the same work directory and destination.
    let mut tracker = FileFailureTracker::open(&pipeline.work_dir).expect("reopen tracker");
    let mut writer = SqliteBatchWriter::open(&pipeline.destination_path).expect("reopen writer");
    let summary = run_overlap_analysis(
        &store,
        &pipeline.manifest_path,
        &config,
        &mut tracker,
        &mut writer,
        &CancelFlag::new(),
    )
    .expect("second session");

    assert_eq!(summary.total_scenes, 3);
    assert_eq!(summary.processed_records, 0);
    assert_eq!(summary.inserted_records, 0);
    assert_eq!(summary.completed_batches, 0);
    assert_eq!(writer.inserted_count().expect("count rows"), 3);
}

#[rstest]
fn retry_sessions_consume_exactly_the_failed_set(pipeline: PipelineFixture) {
    // First session runs against a store with no metadata at all, so every
    // token fails at the fetch_meta stage.
    let empty_store = SqliteSceneStore::open_in_memory().expect("open empty store");
    let config =
        OverlapAnalysisConfig::new(2, 10, &pipeline.work_dir, false).expect("valid config");
    {
        let mut tracker = FileFailureTracker::open(&pipeline.work_dir).expect("open tracker");
        let mut writer =
            SqliteBatchWriter::open(&pipeline.destination_path).expect("open writer");
        let summary = run_overlap_analysis(
            &empty_store,
            &pipeline.manifest_path,
            &config,
            &mut tracker,
            &mut writer,
            &CancelFlag::new(),
        )
        .expect("failing session");
        assert_eq!(summary.processed_records, 0);
        assert!(
            tracker
                .failed_records()
                .iter()
                .all(|record| record.fail_stage == FailStage::FetchMeta)
        );
    }

    // Retry session against the fully seeded store.
    let retry_config =
        OverlapAnalysisConfig::new(2, 10, &pipeline.work_dir, true).expect("valid config");
    let store = seeded_store();
    let mut tracker = FileFailureTracker::open(&pipeline.work_dir).expect("reopen tracker");
    assert_eq!(
        tracker.load_failed_tokens().expect("load failed").len(),
        3
    );
    let mut writer = SqliteBatchWriter::open(&pipeline.destination_path).expect("reopen writer");
    let summary = run_overlap_analysis(
        &store,
        &pipeline.manifest_path,
        &retry_config,
        &mut tracker,
        &mut writer,
        &CancelFlag::new(),
    )
    .expect("retry session");

    assert_eq!(summary.total_scenes, 3);
    assert_eq!(summary.processed_records, 3);
    assert_eq!(summary.inserted_records, 3);
    assert!(tracker.load_failed_tokens().expect("load failed").is_empty());
    assert_eq!(writer.inserted_count().expect("count rows"), 3);
}
