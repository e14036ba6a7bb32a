#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Pure geodesic geometry for zone containment and area.
//!
//! Zones are simple polygons given as an *open* ring of lat/lng vertices
//! (first vertex not repeated, at least 3 points). These functions have no
//! side effects and no shared state, which keeps them exhaustively unit
//! testable.
//!
//! Coordinate convention: `geo` primitives are `(x, y)` = `(lng, lat)`.

use flowtrack_zones_models::LatLng;
use geo::{GeodesicArea, Intersects, LineString, Point, Polygon};

/// Converts an open vertex ring into a [`Polygon`].
///
/// Returns `None` for degenerate input (fewer than 3 vertices). The
/// exterior ring is closed automatically by `geo`.
#[must_use]
pub fn ring_to_polygon(vertices: &[LatLng]) -> Option<Polygon<f64>> {
    if vertices.len() < 3 {
        return None;
    }
    let exterior: LineString<f64> = vertices.iter().map(|v| (v.lng, v.lat)).collect();
    Some(Polygon::new(exterior, vec![]))
}

/// Boundary-inclusive point-in-polygon test.
///
/// A point exactly on an edge or vertex counts as inside (this uses the
/// `geo` intersection predicate rather than `Contains`, which excludes the
/// boundary). Degenerate rings (fewer than 3 vertices) contain nothing.
/// O(vertices) per call.
#[must_use]
pub fn point_in_polygon(point: LatLng, vertices: &[LatLng]) -> bool {
    let Some(polygon) = ring_to_polygon(vertices) else {
        return false;
    };
    polygon.intersects(&Point::new(point.lng, point.lat))
}

/// Geodesic polygon area in square meters, independent of winding order.
///
/// Computed on the WGS84 ellipsoid (Karney's algorithm via `geo`), not with
/// a planar shoelace, since the vertices are real-world geographic
/// coordinates. Takes the magnitude of the signed area, so clockwise and
/// counter-clockwise rings report the same enclosed area (the unsigned
/// variant in `geo` returns the complement of the globe for clockwise
/// rings). Degenerate input returns `0.0` without failing.
#[must_use]
pub fn polygon_area_m2(vertices: &[LatLng]) -> f64 {
    ring_to_polygon(vertices).map_or(0.0, |polygon| polygon.geodesic_area_signed().abs())
}

/// Meters per degree of latitude and longitude at `lat` degrees.
///
/// Standard series expansion on the WGS84 ellipsoid; good to well under
/// 0.1% at dashboard scales.
#[must_use]
pub fn meters_per_degree(lat: f64) -> (f64, f64) {
    let phi = lat.to_radians();
    let lat_m = 111_132.954 - 559.822 * (2.0 * phi).cos() + 1.175 * (4.0 * phi).cos();
    let lng_m = 111_412.84 * phi.cos() - 93.5 * (3.0 * phi).cos();
    (lat_m, lng_m)
}

/// Builds an axis-aligned square ring of side `side_m` meters centered on
/// `center`, in counter-clockwise vertex order.
///
/// Convenience for tests and the demo CLI; accuracy degrades near the
/// poles where a degree of longitude collapses.
#[must_use]
pub fn square_ring(center: LatLng, side_m: f64) -> Vec<LatLng> {
    let (lat_m, lng_m) = meters_per_degree(center.lat);
    let half_lat = side_m / 2.0 / lat_m;
    let half_lng = side_m / 2.0 / lng_m;
    vec![
        LatLng::new(center.lat - half_lat, center.lng - half_lng),
        LatLng::new(center.lat - half_lat, center.lng + half_lng),
        LatLng::new(center.lat + half_lat, center.lng + half_lng),
        LatLng::new(center.lat + half_lat, center.lng - half_lng),
    ]
}
