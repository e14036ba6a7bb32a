//! GeoJSON import and export for the zone catalog.
//!
//! Zones travel as a `FeatureCollection` of `Polygon` features: the
//! exterior ring carries the outline (GeoJSON closes rings, zone outlines
//! are open, so the repeated vertex is added on export and dropped on
//! import), the feature id carries the zone id, and `name`/`colorTag`
//! ride in the properties. Features that do not fit that shape are
//! skipped with a warning rather than failing the whole import.

use flowtrack_zones_models::{LatLng, Zone, palette_color};
use geojson::{Feature, FeatureCollection, GeoJson, Geometry, JsonObject, Value, feature::Id};

use crate::{ZoneStoreError, new_zone_id};

/// Renders zones as a GeoJSON `FeatureCollection` string.
///
/// Zones whose outline has fewer than three vertices cannot form a valid
/// polygon ring and are skipped with a warning.
#[must_use]
pub fn zones_to_geojson(zones: &[Zone]) -> String {
    let mut features = Vec::with_capacity(zones.len());
    for zone in zones {
        if zone.vertices.len() < 3 {
            log::warn!(
                "Skipping zone {id} in GeoJSON export: outline has fewer than 3 vertices",
                id = zone.id
            );
            continue;
        }
        features.push(feature_from_zone(zone));
    }
    GeoJson::FeatureCollection(FeatureCollection {
        bbox: None,
        features,
        foreign_members: None,
    })
    .to_string()
}

/// Parses zones out of a GeoJSON `FeatureCollection` string.
///
/// Each feature must be a `Polygon` with a non-empty string under
/// `name_property`; anything else is skipped with a warning. Areas are
/// recomputed from the imported outline rather than trusted from the
/// file, string feature ids are preserved, and missing ids or colors are
/// filled in (fresh id, palette color by position).
///
/// # Errors
///
/// * `ZoneStoreError::Geojson` if the payload is not parseable GeoJSON.
/// * `ZoneStoreError::NotAFeatureCollection` if it parses as a bare
///   geometry or single feature.
pub fn zones_from_geojson(raw: &str, name_property: &str) -> Result<Vec<Zone>, ZoneStoreError> {
    let parsed: GeoJson = raw.parse()?;
    let GeoJson::FeatureCollection(collection) = parsed else {
        return Err(ZoneStoreError::NotAFeatureCollection);
    };

    let mut zones = Vec::new();
    for (index, feature) in collection.features.into_iter().enumerate() {
        match zone_from_feature(feature, name_property, zones.len()) {
            Some(zone) => zones.push(zone),
            None => log::warn!("Skipping GeoJSON feature {index}: not a named polygon"),
        }
    }
    Ok(zones)
}

fn feature_from_zone(zone: &Zone) -> Feature {
    let mut ring: Vec<Vec<f64>> = zone
        .vertices
        .iter()
        .map(|vertex| vec![vertex.lng, vertex.lat])
        .collect();
    if let Some(first) = ring.first().cloned() {
        ring.push(first);
    }

    let mut properties = JsonObject::new();
    properties.insert(
        "name".to_string(),
        serde_json::Value::String(zone.name.clone()),
    );
    properties.insert(
        "colorTag".to_string(),
        serde_json::Value::String(zone.color_tag.clone()),
    );

    Feature {
        bbox: None,
        geometry: Some(Geometry::new(Value::Polygon(vec![ring]))),
        id: Some(Id::String(zone.id.clone())),
        properties: Some(properties),
        foreign_members: None,
    }
}

/// Converts one feature, or `None` when it is not a named polygon.
fn zone_from_feature(feature: Feature, name_property: &str, palette_index: usize) -> Option<Zone> {
    let Feature {
        geometry,
        id,
        properties,
        ..
    } = feature;

    let properties = properties?;
    let name = properties
        .get(name_property)
        .and_then(serde_json::Value::as_str)
        .map(str::trim)
        .filter(|name| !name.is_empty())?
        .to_string();

    let Value::Polygon(rings) = geometry?.value else {
        return None;
    };
    let vertices = open_ring(rings.first()?)?;

    let color_tag = properties
        .get("colorTag")
        .and_then(serde_json::Value::as_str)
        .map_or_else(|| palette_color(palette_index).to_string(), str::to_string);
    let id = match id {
        Some(Id::String(id)) => id,
        _ => new_zone_id(),
    };
    let area = flowtrack_geometry::polygon_area_m2(&vertices);

    Some(Zone {
        id,
        name,
        vertices,
        area,
        color_tag,
    })
}

/// Reads a GeoJSON ring as an open vertex list, dropping the closing
/// vertex when it repeats the first position exactly. Returns `None` for
/// malformed positions or rings that are too short to form a polygon.
fn open_ring(ring: &[Vec<f64>]) -> Option<Vec<LatLng>> {
    let mut vertices = ring
        .iter()
        .map(|position| {
            let lng = *position.first()?;
            let lat = *position.get(1)?;
            Some(LatLng::new(lat, lng))
        })
        .collect::<Option<Vec<_>>>()?;

    let closed = vertices.len() > 3
        && vertices.first().zip(vertices.last()).is_some_and(|(first, last)| {
            first.lat.to_bits() == last.lat.to_bits() && first.lng.to_bits() == last.lng.to_bits()
        });
    if closed {
        vertices.pop();
    }

    (vertices.len() >= 3).then_some(vertices)
}
