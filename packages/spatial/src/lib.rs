#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! In-memory spatial index for zone attribution.
//!
//! Builds an R-tree over the bounding boxes of the current zone list and
//! answers point-in-zone lookups for the occupancy tracker and the density
//! estimator. The index is immutable; the engine rebuilds it whenever the
//! zone list changes, which is cheap at dashboard zone counts.

use flowtrack_zones_models::{LatLng, Zone};
use geo::{BoundingRect, Intersects, Point, Polygon};
use rstar::{AABB, RTree, RTreeObject};

/// A zone polygon stored in the R-tree with its list position.
struct ZoneEntry {
    /// Position of the zone in the source list; the overlap tie-break.
    list_index: usize,
    zone_id: String,
    envelope: AABB<[f64; 2]>,
    polygon: Polygon<f64>,
}

impl RTreeObject for ZoneEntry {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        self.envelope
    }
}

/// Pre-built spatial index over an ordered zone list.
///
/// Lookups are boundary-inclusive (the same containment predicate as
/// [`flowtrack_geometry::point_in_polygon`]). When zones overlap, the zone
/// that appears **earliest in the list** claims the point — the documented
/// tie-break, carried over from the first-match iteration order of the
/// original dashboard, not a correctness guarantee for overlapping zones.
pub struct ZoneIndex {
    tree: RTree<ZoneEntry>,
    indexed: usize,
}

impl ZoneIndex {
    /// Builds the index from an ordered zone slice.
    ///
    /// Zones with degenerate rings (fewer than 3 vertices) cannot contain
    /// anything and are skipped with a warning.
    #[must_use]
    pub fn build(zones: &[Zone]) -> Self {
        let mut entries = Vec::with_capacity(zones.len());

        for (list_index, zone) in zones.iter().enumerate() {
            let Some(polygon) = flowtrack_geometry::ring_to_polygon(&zone.vertices) else {
                log::warn!(
                    "Skipping degenerate zone {} ({} vertices) in spatial index",
                    zone.id,
                    zone.vertices.len()
                );
                continue;
            };

            let envelope = compute_envelope(&polygon);

            entries.push(ZoneEntry {
                list_index,
                zone_id: zone.id.clone(),
                envelope,
                polygon,
            });
        }

        let indexed = entries.len();
        Self {
            tree: RTree::bulk_load(entries),
            indexed,
        }
    }

    /// Number of zones actually indexed (degenerate zones excluded).
    #[must_use]
    pub const fn len(&self) -> usize {
        self.indexed
    }

    /// Whether the index contains no zones.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.indexed == 0
    }

    /// Returns the list index of the zone containing `point`, if any.
    ///
    /// The R-tree yields envelope candidates in arbitrary order, so among
    /// containing zones the smallest list index is selected to preserve the
    /// first-match-by-list-order contract.
    #[must_use]
    pub fn locate_index(&self, point: LatLng) -> Option<usize> {
        let needle = Point::new(point.lng, point.lat);
        let query_env = AABB::from_point([point.lng, point.lat]);

        self.tree
            .locate_in_envelope_intersecting(&query_env)
            .filter(|entry| entry.polygon.intersects(&needle))
            .map(|entry| entry.list_index)
            .min()
    }

    /// Returns the id of the zone containing `point`, if any.
    ///
    /// Same tie-break as [`Self::locate_index`].
    #[must_use]
    pub fn locate(&self, point: LatLng) -> Option<&str> {
        let needle = Point::new(point.lng, point.lat);
        let query_env = AABB::from_point([point.lng, point.lat]);

        self.tree
            .locate_in_envelope_intersecting(&query_env)
            .filter(|entry| entry.polygon.intersects(&needle))
            .min_by_key(|entry| entry.list_index)
            .map(|entry| entry.zone_id.as_str())
    }
}

/// Computes the bounding box envelope for a [`Polygon`].
fn compute_envelope(polygon: &Polygon<f64>) -> AABB<[f64; 2]> {
    polygon.bounding_rect().map_or_else(
        || AABB::from_point([0.0, 0.0]),
        |rect| AABB::from_corners([rect.min().x, rect.min().y], [rect.max().x, rect.max().y]),
    )
}
