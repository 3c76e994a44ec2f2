//! Records exchanged between the manifest store, the geometry builder, and
//! the batch runner.
//!
//! These models stay close to the tabular shapes of the source stores: a
//! metadata row per scene, a bounding-box row per dataset, and the merged
//! geo-record the writer receives. Constructors validate nothing here;
//! validation belongs to the geometry builder and the configuration type.

use std::fmt;

use geo::Geometry;
use serde::{Deserialize, Serialize};

/// Opaque identifier of one source record in the manifest.
///
/// Uniqueness is defined by the external manifest and tracker, never derived
/// here.
///
/// # Examples
/// ```
/// use overlap_core::SceneToken;
///
/// let token = SceneToken::new("scene_001");
/// assert_eq!(token.as_str(), "scene_001");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SceneToken(String);

impl SceneToken {
    /// Wrap a raw token string.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// View the token as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SceneToken {
    fn from(token: &str) -> Self {
        Self::new(token)
    }
}

impl From<String> for SceneToken {
    fn from(token: String) -> Self {
        Self(token)
    }
}

impl fmt::Display for SceneToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One metadata row fetched for a scene token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataRecord {
    /// Token of the scene the row describes.
    pub scene_token: SceneToken,
    /// Join key into the bounding-box rows (`dataset_name` on that side).
    pub data_name: String,
    /// Identifier of the event the scene belongs to.
    pub event_id: i64,
    /// Identifier of the city the scene was captured in.
    pub city_id: i64,
    /// Capture timestamp as recorded by the source store.
    pub timestamp: i64,
}

/// One bounding-box row fetched for a dataset.
///
/// Coordinates are optional because the source columns are nullable; the
/// geometry builder rejects rows with missing coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BboxRecord {
    /// Join key matching `MetadataRecord::data_name`.
    pub dataset_name: String,
    /// Western edge of the box.
    pub xmin: Option<f64>,
    /// Southern edge of the box.
    pub ymin: Option<f64>,
    /// Eastern edge of the box.
    pub xmax: Option<f64>,
    /// Northern edge of the box.
    pub ymax: Option<f64>,
    /// Pass-through quality flag; carried, never recomputed.
    pub all_good: bool,
}

/// A bounding-box row whose geometry has already been materialised.
#[derive(Debug, Clone, PartialEq)]
pub struct GeoBboxRecord {
    /// Join key matching `MetadataRecord::data_name`.
    pub dataset_name: String,
    /// Pass-through quality flag; carried, never recomputed.
    pub all_good: bool,
    /// Materialised geometry for the dataset.
    pub geometry: Geometry<f64>,
}

/// The two tabular shapes the geometry builder accepts.
#[derive(Debug, Clone, PartialEq)]
pub enum BboxFrame {
    /// Rows carrying raw coordinate columns.
    Bounds(Vec<BboxRecord>),
    /// Rows that already carry a geometry.
    Geometric(Vec<GeoBboxRecord>),
}

impl BboxFrame {
    /// Number of rows in the frame.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Bounds(rows) => rows.len(),
            Self::Geometric(rows) => rows.len(),
        }
    }

    /// Whether the frame has no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Coordinate reference system tag for a [`GeoFrame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Crs {
    /// An EPSG-registered system identified by its code.
    Epsg(u32),
}

impl Crs {
    /// EPSG:4326, the only system merged frames are ever tagged with.
    pub const WGS84: Self = Self::Epsg(4326);

    /// The EPSG code of the system.
    #[must_use]
    pub const fn epsg(self) -> u32 {
        match self {
            Self::Epsg(code) => code,
        }
    }
}

impl fmt::Display for Crs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EPSG:{}", self.epsg())
    }
}

/// One merged row: metadata columns plus the quality flag and geometry.
#[derive(Debug, Clone, PartialEq)]
pub struct GeoRecord {
    /// Token of the scene the row describes.
    pub scene_token: SceneToken,
    /// Dataset the geometry was joined from.
    pub data_name: String,
    /// Identifier of the event the scene belongs to.
    pub event_id: i64,
    /// Identifier of the city the scene was captured in.
    pub city_id: i64,
    /// Capture timestamp as recorded by the source store.
    pub timestamp: i64,
    /// Quality flag carried through from the bounding-box row.
    pub all_good: bool,
    /// Materialised geometry in the frame's CRS.
    pub geometry: Geometry<f64>,
}

/// A normalised geodata table handed to the batch writer.
#[derive(Debug, Clone, PartialEq)]
pub struct GeoFrame {
    /// Coordinate reference system of every geometry in the frame.
    pub crs: Crs,
    /// Merged rows, in metadata order.
    pub records: Vec<GeoRecord>,
}

impl GeoFrame {
    /// Build a frame tagged with EPSG:4326.
    #[must_use]
    pub const fn wgs84(records: Vec<GeoRecord>) -> Self {
        Self {
            crs: Crs::WGS84,
            records,
        }
    }

    /// Number of rows in the frame.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the frame has no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Pipeline phase at which a token's processing could not complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailStage {
    /// Metadata fetch returned an error or no rows for the batch.
    FetchMeta,
    /// Bounding-box fetch failed for the batch's dataset names.
    FetchBbox,
    /// Geometry materialisation or the join failed.
    Merge,
    /// The batch writer rejected the merged frame.
    Write,
}

impl FailStage {
    /// Stable snake_case name used in checkpoints and logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::FetchMeta => "fetch_meta",
            Self::FetchBbox => "fetch_bbox",
            Self::Merge => "merge",
            Self::Write => "write",
        }
    }
}

impl fmt::Display for FailStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recorded per-token failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    /// Token whose processing failed.
    pub scene_token: SceneToken,
    /// Human-readable description of the underlying error.
    pub error_message: String,
    /// 1-indexed batch the token was processed in.
    pub batch_number: usize,
    /// Stage at which processing stopped.
    pub fail_stage: FailStage,
}

/// Progress counters checkpointed once per completed batch.
///
/// Counters are monotonically non-decreasing across a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    /// Size of the resolved work set for the run.
    pub total_scenes: usize,
    /// Metadata rows processed so far.
    pub processed_records: usize,
    /// Rows the writer reported inserted so far.
    pub inserted_records: usize,
    /// 1-indexed number of the batch the snapshot was taken after.
    pub batch_number: usize,
}

/// Authoritative outcome of one pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Size of the resolved work set for the run.
    pub total_scenes: usize,
    /// Metadata rows processed across all batches.
    pub processed_records: usize,
    /// Rows the writer reported inserted across all batches.
    pub inserted_records: usize,
    /// Batches consumed before the run ended.
    pub completed_batches: usize,
    /// Whether the run stopped before consuming every batch.
    pub interrupted: bool,
}

#[cfg(test)]
#[expect(
    clippy::expect_used,
    reason = "tests should fail fast when setup breaks"
)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(FailStage::FetchMeta, "fetch_meta")]
    #[case(FailStage::FetchBbox, "fetch_bbox")]
    #[case(FailStage::Merge, "merge")]
    #[case(FailStage::Write, "write")]
    fn fail_stage_names_are_stable(#[case] stage: FailStage, #[case] expected: &str) {
        assert_eq!(stage.as_str(), expected);
        let json = serde_json::to_string(&stage).expect("serialise stage");
        assert_eq!(json, format!("\"{expected}\""));
    }

    #[rstest]
    fn scene_token_round_trips_transparently() {
        let token = SceneToken::new("scene_001");
        let json = serde_json::to_string(&token).expect("serialise token");
        assert_eq!(json, "\"scene_001\"");
        let parsed: SceneToken = serde_json::from_str(&json).expect("parse token");
        assert_eq!(parsed, token);
    }

    #[rstest]
    fn wgs84_is_epsg_4326() {
        assert_eq!(Crs::WGS84.epsg(), 4326);
        assert_eq!(Crs::WGS84.to_string(), "EPSG:4326");
    }
}
