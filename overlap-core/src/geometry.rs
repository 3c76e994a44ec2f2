//! Deterministic geometry materialisation and the metadata/bbox join.
//!
//! Bounding-box rows become a [`Point`] when degenerate and an axis-aligned
//! rectangular [`Polygon`] otherwise. Rows that already carry a geometry pass
//! through unchanged; the owning frame is always tagged EPSG:4326. Everything
//! here is pure and side-effect free.

use std::collections::HashMap;

use geo::{Coord, Geometry, Point, Rect};
use thiserror::Error;

use crate::record::{BboxFrame, BboxRecord, GeoBboxRecord, GeoFrame, GeoRecord, MetadataRecord};

/// Errors raised while materialising bounding-box geometries.
#[derive(Debug, Error, PartialEq)]
pub enum GeometryError {
    /// A non-geometric row was missing one or more coordinate values.
    #[error("bbox row for dataset {dataset_name} is missing coordinate values")]
    MissingCoordinates {
        /// Dataset whose row could not be materialised.
        dataset_name: String,
    },
}

/// Materialise every row of a bounding-box frame into a geometry.
///
/// Geometric rows pass through unchanged, which makes the function a fixed
/// point on its own output. Bounds rows become a [`Point`] at
/// `(xmin, ymin)` when `xmin == xmax && ymin == ymax`, and the axis-aligned
/// rectangle `(xmin, ymin)-(xmax, ymax)` otherwise. Row order and the
/// non-geometry columns are preserved.
///
/// # Examples
/// ```
/// use geo::Geometry;
/// use overlap_core::{BboxFrame, BboxRecord, ensure_bbox_geometries};
///
/// let frame = BboxFrame::Bounds(vec![BboxRecord {
///     dataset_name: "cam_front".into(),
///     xmin: Some(3.0),
///     ymin: Some(4.0),
///     xmax: Some(3.0),
///     ymax: Some(4.0),
///     all_good: true,
/// }]);
/// let rows = ensure_bbox_geometries(frame)?;
/// assert!(matches!(rows[0].geometry, Geometry::Point(_)));
/// # Ok::<(), overlap_core::GeometryError>(())
/// ```
pub fn ensure_bbox_geometries(frame: BboxFrame) -> Result<Vec<GeoBboxRecord>, GeometryError> {
    match frame {
        BboxFrame::Geometric(rows) => Ok(rows),
        BboxFrame::Bounds(rows) => rows.into_iter().map(materialise_bounds).collect(),
    }
}

fn materialise_bounds(row: BboxRecord) -> Result<GeoBboxRecord, GeometryError> {
    let (Some(xmin), Some(ymin), Some(xmax), Some(ymax)) = (row.xmin, row.ymin, row.xmax, row.ymax)
    else {
        return Err(GeometryError::MissingCoordinates {
            dataset_name: row.dataset_name,
        });
    };

    let geometry = if xmin == xmax && ymin == ymax {
        Geometry::Point(Point::new(xmin, ymin))
    } else {
        let rect = Rect::new(Coord { x: xmin, y: ymin }, Coord { x: xmax, y: ymax });
        Geometry::Polygon(rect.to_polygon())
    };

    Ok(GeoBboxRecord {
        dataset_name: row.dataset_name,
        all_good: row.all_good,
        geometry,
    })
}

/// Join metadata rows with bounding-box geometries into a merged geo-frame.
///
/// The join is inner-style on `data_name == dataset_name`: metadata rows
/// without a matching dataset are silently dropped, so callers observe the
/// loss only through the row-count delta. Duplicate dataset rows resolve to
/// the first occurrence. A zero-match join yields an empty EPSG:4326 frame,
/// never an error.
///
/// # Examples
/// ```
/// use overlap_core::{
///     BboxFrame, BboxRecord, MetadataRecord, SceneToken, merge_metadata_with_bboxes,
/// };
///
/// let metadata = vec![MetadataRecord {
///     scene_token: SceneToken::new("scene_001"),
///     data_name: "cam_front".into(),
///     event_id: 7,
///     city_id: 1,
///     timestamp: 1_700_000_000,
/// }];
/// let frame = BboxFrame::Bounds(vec![BboxRecord {
///     dataset_name: "cam_front".into(),
///     xmin: Some(0.0),
///     ymin: Some(0.0),
///     xmax: Some(1.0),
///     ymax: Some(1.0),
///     all_good: true,
/// }]);
/// let merged = merge_metadata_with_bboxes(&metadata, frame)?;
/// assert_eq!(merged.crs.epsg(), 4326);
/// assert_eq!(merged.len(), 1);
/// # Ok::<(), overlap_core::GeometryError>(())
/// ```
pub fn merge_metadata_with_bboxes(
    metadata: &[MetadataRecord],
    frame: BboxFrame,
) -> Result<GeoFrame, GeometryError> {
    let geometries = ensure_bbox_geometries(frame)?;

    let mut by_dataset: HashMap<&str, &GeoBboxRecord> = HashMap::with_capacity(geometries.len());
    for row in &geometries {
        by_dataset.entry(row.dataset_name.as_str()).or_insert(row);
    }

    let records = metadata
        .iter()
        .filter_map(|meta| {
            by_dataset.get(meta.data_name.as_str()).map(|row| GeoRecord {
                scene_token: meta.scene_token.clone(),
                data_name: meta.data_name.clone(),
                event_id: meta.event_id,
                city_id: meta.city_id,
                timestamp: meta.timestamp,
                all_good: row.all_good,
                geometry: row.geometry.clone(),
            })
        })
        .collect();

    Ok(GeoFrame::wgs84(records))
}

#[cfg(test)]
#[expect(
    clippy::expect_used,
    reason = "tests should fail fast when setup breaks"
)]
mod tests {
    use super::*;
    use crate::record::SceneToken;
    use geo::BoundingRect;
    use proptest::prelude::*;
    use rstest::rstest;

    fn bounds_row(dataset: &str, xmin: f64, ymin: f64, xmax: f64, ymax: f64) -> BboxRecord {
        BboxRecord {
            dataset_name: dataset.into(),
            xmin: Some(xmin),
            ymin: Some(ymin),
            xmax: Some(xmax),
            ymax: Some(ymax),
            all_good: true,
        }
    }

    fn metadata_row(token: &str, data_name: &str) -> MetadataRecord {
        MetadataRecord {
            scene_token: SceneToken::new(token),
            data_name: data_name.into(),
            event_id: 1,
            city_id: 2,
            timestamp: 1_700_000_000,
        }
    }

    #[rstest]
    fn degenerate_bbox_becomes_a_point() {
        let frame = BboxFrame::Bounds(vec![bounds_row("lidar_top", 2.5, -1.0, 2.5, -1.0)]);
        let rows = ensure_bbox_geometries(frame).expect("materialise");
        match &rows[0].geometry {
            Geometry::Point(point) => {
                assert_eq!(point.x(), 2.5);
                assert_eq!(point.y(), -1.0);
            }
            other => panic!("expected point, got {other:?}"),
        }
    }

    #[rstest]
    fn well_formed_bbox_becomes_a_rectangle() {
        let frame = BboxFrame::Bounds(vec![bounds_row("cam_front", 0.0, 0.0, 4.0, 2.0)]);
        let rows = ensure_bbox_geometries(frame).expect("materialise");
        let Geometry::Polygon(polygon) = &rows[0].geometry else {
            panic!("expected polygon, got {:?}", rows[0].geometry);
        };
        // Closed exterior ring: four distinct vertices plus the repeated
        // closing coordinate.
        assert_eq!(polygon.exterior().0.len(), 5);
        let envelope = polygon.bounding_rect().expect("rectangle has an envelope");
        assert_eq!(envelope.min(), Coord { x: 0.0, y: 0.0 });
        assert_eq!(envelope.max(), Coord { x: 4.0, y: 2.0 });
    }

    #[rstest]
    fn missing_coordinates_are_rejected() {
        let frame = BboxFrame::Bounds(vec![BboxRecord {
            dataset_name: "radar_front".into(),
            xmin: Some(0.0),
            ymin: None,
            xmax: Some(1.0),
            ymax: Some(1.0),
            all_good: false,
        }]);
        let error = ensure_bbox_geometries(frame).expect_err("missing ymin should fail");
        assert_eq!(
            error,
            GeometryError::MissingCoordinates {
                dataset_name: "radar_front".into()
            }
        );
    }

    #[rstest]
    fn materialisation_is_idempotent_on_its_own_output() {
        let frame = BboxFrame::Bounds(vec![
            bounds_row("a", 0.0, 0.0, 1.0, 1.0),
            bounds_row("b", 5.0, 5.0, 5.0, 5.0),
        ]);
        let first = ensure_bbox_geometries(frame).expect("first pass");
        let second =
            ensure_bbox_geometries(BboxFrame::Geometric(first.clone())).expect("second pass");
        assert_eq!(first, second);
    }

    #[rstest]
    fn row_order_and_columns_are_preserved() {
        let frame = BboxFrame::Bounds(vec![
            bounds_row("b", 0.0, 0.0, 1.0, 1.0),
            BboxRecord {
                all_good: false,
                ..bounds_row("a", 2.0, 2.0, 3.0, 3.0)
            },
        ]);
        let rows = ensure_bbox_geometries(frame).expect("materialise");
        assert_eq!(rows[0].dataset_name, "b");
        assert_eq!(rows[1].dataset_name, "a");
        assert!(!rows[1].all_good);
    }

    #[rstest]
    fn merge_joins_on_data_name_and_drops_unmatched_rows() {
        let metadata = vec![
            metadata_row("scene_001", "cam_front"),
            metadata_row("scene_002", "cam_rear"),
            metadata_row("scene_003", "cam_front"),
        ];
        let frame = BboxFrame::Bounds(vec![bounds_row("cam_front", 0.0, 0.0, 1.0, 1.0)]);

        let merged = merge_metadata_with_bboxes(&metadata, frame).expect("merge");

        assert_eq!(merged.len(), 2);
        assert_eq!(merged.records[0].scene_token, SceneToken::new("scene_001"));
        assert_eq!(merged.records[1].scene_token, SceneToken::new("scene_003"));
        assert!(merged.records.iter().all(|r| r.data_name == "cam_front"));
    }

    #[rstest]
    fn merge_of_disjoint_key_sets_is_an_empty_wgs84_frame() {
        let metadata = vec![metadata_row("scene_001", "cam_front")];
        let frame = BboxFrame::Bounds(vec![bounds_row("lidar_top", 0.0, 0.0, 1.0, 1.0)]);

        let merged = merge_metadata_with_bboxes(&metadata, frame).expect("merge");

        assert!(merged.is_empty());
        assert_eq!(merged.crs, crate::record::Crs::WGS84);
    }

    #[rstest]
    fn merge_carries_the_quality_flag_through() {
        let metadata = vec![metadata_row("scene_001", "cam_front")];
        let frame = BboxFrame::Bounds(vec![BboxRecord {
            all_good: false,
            ..bounds_row("cam_front", 0.0, 0.0, 1.0, 1.0)
        }]);

        let merged = merge_metadata_with_bboxes(&metadata, frame).expect("merge");

        assert!(!merged.records[0].all_good);
    }

    #[rstest]
    fn merge_resolves_duplicate_datasets_to_the_first_row() {
        let metadata = vec![metadata_row("scene_001", "cam_front")];
        let frame = BboxFrame::Bounds(vec![
            bounds_row("cam_front", 0.0, 0.0, 1.0, 1.0),
            bounds_row("cam_front", 9.0, 9.0, 9.0, 9.0),
        ]);

        let merged = merge_metadata_with_bboxes(&metadata, frame).expect("merge");

        assert!(matches!(merged.records[0].geometry, Geometry::Polygon(_)));
    }

    proptest! {
        #[test]
        fn bounds_classify_as_point_or_envelope_preserving_polygon(
            xmin in -180.0_f64..180.0,
            ymin in -90.0_f64..90.0,
            width in 0.0_f64..10.0,
            height in 0.0_f64..10.0,
        ) {
            let xmax = xmin + width;
            let ymax = ymin + height;
            let frame = BboxFrame::Bounds(vec![bounds_row("d", xmin, ymin, xmax, ymax)]);
            let rows = ensure_bbox_geometries(frame).expect("materialise");

            if xmin == xmax && ymin == ymax {
                prop_assert!(matches!(rows[0].geometry, Geometry::Point(_)));
            } else {
                match &rows[0].geometry {
                    Geometry::Polygon(polygon) => {
                        let envelope = polygon.bounding_rect().expect("envelope");
                        prop_assert_eq!(envelope.min(), Coord { x: xmin, y: ymin });
                        prop_assert_eq!(envelope.max(), Coord { x: xmax, y: ymax });
                    }
                    other => prop_assert!(false, "expected polygon, got {:?}", other),
                }
            }
        }
    }
}
