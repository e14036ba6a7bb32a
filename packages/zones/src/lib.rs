#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Zone catalog persisted as whole JSON documents.
//!
//! [`ZoneStore`] owns the ordered zone list for a process. Every mutation
//! serializes the full list and writes it under the versioned
//! `flowtrack_zones_v2` slot in one atomic store operation, so a concurrent
//! reader observes either the previous list or the next one, never a
//! partial write. Opening a store transparently migrates payloads written
//! by the legacy v1 schema. GeoJSON import/export lives in [`interchange`].

pub mod interchange;

use std::sync::Arc;

use flowtrack_storage::{KeyValueStore, StorageError};
use flowtrack_zones_models::{LatLng, Zone, palette_color};
use serde::Deserialize;
use thiserror::Error;

/// Storage slot holding the current zone list (JSON array of [`Zone`]).
pub const ZONES_KEY: &str = "flowtrack_zones_v2";

/// Storage slot used before the vertex-ring schema rename. Read once at
/// startup for migration, never written.
pub const LEGACY_ZONES_KEY: &str = "flowtrack_zones_v1";

/// Storage slot holding the latest persisted count snapshot. Listed here
/// with the other slots so the full storage layout is documented in one
/// place; the engine owns reads and writes of this slot.
pub const COUNTS_KEY: &str = "flowtrack_counts_v1";

/// Errors raised by the zone catalog.
#[derive(Debug, Error)]
pub enum ZoneStoreError {
    /// The underlying key-value store failed.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Encoding the zone list for persistence failed.
    #[error("Failed to encode zone payload: {0}")]
    Serde(#[from] serde_json::Error),

    /// A stored payload exists but does not decode as the schema its key
    /// promises. Surfaced instead of silently starting empty so a corrupt
    /// or future-versioned slot is never clobbered.
    #[error("Zone payload under {key} does not decode as its schema: {source}")]
    ZonePayloadVersion {
        key: &'static str,
        #[source]
        source: serde_json::Error,
    },

    /// A zone outline contains a `NaN` or infinite coordinate. Rejected up
    /// front: `serde_json` writes non-finite floats as `null`, which would
    /// poison the persisted slot for every later open.
    #[error("Zone outline for {zone} contains a non-finite coordinate")]
    NonFiniteOutline { zone: String },

    /// A GeoJSON payload could not be parsed at all.
    #[error("Failed to parse GeoJSON: {0}")]
    Geojson(#[from] geojson::Error),

    /// The parsed GeoJSON was valid but not a `FeatureCollection`.
    #[error("Expected a GeoJSON FeatureCollection")]
    NotAFeatureCollection,
}

/// Pre-rename zone schema: `vertices` was called `polygon` and `colorTag`
/// was an optional `color`. Stored areas are not trusted; migration
/// recomputes them.
#[derive(Debug, Deserialize)]
struct LegacyZone {
    id: String,
    name: String,
    polygon: Vec<LatLng>,
    #[serde(default)]
    color: Option<String>,
}

impl LegacyZone {
    fn into_zone(self, index: usize) -> Zone {
        let area = flowtrack_geometry::polygon_area_m2(&self.polygon);
        Zone {
            id: self.id,
            name: self.name,
            vertices: self.polygon,
            area,
            color_tag: self
                .color
                .unwrap_or_else(|| palette_color(index).to_string()),
        }
    }
}

/// Mints a fresh zone id. Random v4 UUIDs cannot collide within a session.
#[must_use]
pub fn new_zone_id() -> String {
    format!("zone-{}", uuid::Uuid::new_v4())
}

/// The ordered zone list and its persistence slot.
///
/// A process holds exactly one store per data directory; remote edits
/// arrive through [`ZoneStore::replace_all`] rather than concurrent
/// writers.
pub struct ZoneStore {
    storage: Arc<dyn KeyValueStore>,
    zones: Vec<Zone>,
}

// Manual impl: the storage handle is a trait object with no `Debug` bound.
impl std::fmt::Debug for ZoneStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZoneStore")
            .field("zones", &self.zones)
            .finish_non_exhaustive()
    }
}

impl ZoneStore {
    /// Opens the catalog from storage.
    ///
    /// Loads the v2 slot when present. When only a legacy v1 payload
    /// exists it is migrated in place: `polygon` becomes `vertices`,
    /// `color` becomes `colorTag`, areas are recomputed, and the result is
    /// persisted under the v2 key. An empty storage starts an empty
    /// catalog.
    ///
    /// # Errors
    ///
    /// * `ZoneStoreError::Storage` if the slot cannot be read or the
    ///   migrated list cannot be written.
    /// * `ZoneStoreError::ZonePayloadVersion` if a payload exists but does
    ///   not decode as its schema.
    pub fn open(storage: Arc<dyn KeyValueStore>) -> Result<Self, ZoneStoreError> {
        if let Some(raw) = storage.get(ZONES_KEY)? {
            let zones: Vec<Zone> = serde_json::from_str(&raw).map_err(|source| {
                ZoneStoreError::ZonePayloadVersion {
                    key: ZONES_KEY,
                    source,
                }
            })?;
            log::debug!("Loaded {} zones from {ZONES_KEY}", zones.len());
            return Ok(Self { storage, zones });
        }

        if let Some(raw) = storage.get(LEGACY_ZONES_KEY)? {
            let legacy: Vec<LegacyZone> = serde_json::from_str(&raw).map_err(|source| {
                ZoneStoreError::ZonePayloadVersion {
                    key: LEGACY_ZONES_KEY,
                    source,
                }
            })?;
            let zones = legacy
                .into_iter()
                .enumerate()
                .map(|(index, zone)| zone.into_zone(index))
                .collect();
            let store = Self { storage, zones };
            store.persist()?;
            log::info!(
                "Migrated {} zones from {LEGACY_ZONES_KEY} to {ZONES_KEY}",
                store.zones.len()
            );
            return Ok(store);
        }

        Ok(Self {
            storage,
            zones: Vec::new(),
        })
    }

    /// The zone list in persisted order. Stable across sessions; new zones
    /// append.
    #[must_use]
    pub fn list_zones(&self) -> &[Zone] {
        &self.zones
    }

    /// Creates a zone from an open vertex ring and persists the list.
    ///
    /// The id is freshly minted, the area comes from the geometry engine,
    /// and the fill color cycles through the shared palette by creation
    /// index. A ring with fewer than three vertices (or a collinear one)
    /// is kept with zero area and a warning rather than rejected, matching
    /// the permissive editor behavior. Non-finite coordinates are the
    /// exception: JSON cannot round-trip them, so they are refused.
    ///
    /// # Errors
    ///
    /// Returns `ZoneStoreError::NonFiniteOutline` if a vertex coordinate is
    /// `NaN` or infinite, or an error if the updated list cannot be encoded
    /// or written.
    pub fn create_zone(
        &mut self,
        name: &str,
        vertices: Vec<LatLng>,
    ) -> Result<Zone, ZoneStoreError> {
        if vertices.iter().any(|vertex| !vertex.is_finite()) {
            return Err(ZoneStoreError::NonFiniteOutline {
                zone: name.to_string(),
            });
        }
        let area = flowtrack_geometry::polygon_area_m2(&vertices);
        if area <= 0.0 {
            log::warn!("Zone {name} has a degenerate outline; storing it with zero area");
        }
        let zone = Zone {
            id: new_zone_id(),
            name: name.to_string(),
            vertices,
            area,
            color_tag: palette_color(self.zones.len()).to_string(),
        };
        self.zones.push(zone.clone());
        self.persist()?;
        Ok(zone)
    }

    /// Replaces a zone's outline, recomputing its area, and persists.
    ///
    /// Returns `false` (after a warning) when the id is unknown; editing a
    /// zone that a remote peer just deleted is expected traffic, not a
    /// fault.
    ///
    /// # Errors
    ///
    /// Returns `ZoneStoreError::NonFiniteOutline` if a vertex coordinate is
    /// `NaN` or infinite, or an error if the updated list cannot be encoded
    /// or written.
    pub fn update_zone_vertices(
        &mut self,
        id: &str,
        vertices: Vec<LatLng>,
    ) -> Result<bool, ZoneStoreError> {
        if vertices.iter().any(|vertex| !vertex.is_finite()) {
            return Err(ZoneStoreError::NonFiniteOutline {
                zone: id.to_string(),
            });
        }
        let Some(zone) = self.zones.iter_mut().find(|zone| zone.id == id) else {
            log::warn!("Ignoring vertex update for unknown zone {id}");
            return Ok(false);
        };
        zone.area = flowtrack_geometry::polygon_area_m2(&vertices);
        if zone.area <= 0.0 {
            log::warn!("Zone {id} outline became degenerate; area reset to zero");
        }
        zone.vertices = vertices;
        self.persist()?;
        Ok(true)
    }

    /// Renames a zone and persists. Returns `false` with a warning when
    /// the id is unknown.
    ///
    /// # Errors
    ///
    /// Returns an error if the updated list cannot be encoded or written.
    pub fn rename_zone(&mut self, id: &str, name: &str) -> Result<bool, ZoneStoreError> {
        let Some(zone) = self.zones.iter_mut().find(|zone| zone.id == id) else {
            log::warn!("Ignoring rename for unknown zone {id}");
            return Ok(false);
        };
        zone.name = name.to_string();
        self.persist()?;
        Ok(true)
    }

    /// Removes a zone and persists, returning the removed zone so callers
    /// can cascade (drop its count entry, announce the change). Unknown
    /// ids return `None` with a warning.
    ///
    /// # Errors
    ///
    /// Returns an error if the updated list cannot be encoded or written.
    pub fn delete_zone(&mut self, id: &str) -> Result<Option<Zone>, ZoneStoreError> {
        let Some(position) = self.zones.iter().position(|zone| zone.id == id) else {
            log::warn!("Ignoring delete for unknown zone {id}");
            return Ok(None);
        };
        let removed = self.zones.remove(position);
        self.persist()?;
        Ok(Some(removed))
    }

    /// Appends externally sourced zones (GeoJSON import), persisting once
    /// for the whole batch. Ids colliding with existing zones are
    /// reassigned so the catalog never holds duplicates, and zones with a
    /// non-finite vertex are skipped with a warning to keep the batch
    /// non-fatal. Returns how many zones were added.
    ///
    /// # Errors
    ///
    /// Returns an error if the updated list cannot be encoded or written.
    pub fn import_zones(&mut self, incoming: Vec<Zone>) -> Result<usize, ZoneStoreError> {
        let mut added = 0;
        for mut zone in incoming {
            if zone.vertices.iter().any(|vertex| !vertex.is_finite()) {
                log::warn!(
                    "Skipping imported zone {id}: non-finite vertex coordinate",
                    id = zone.id
                );
                continue;
            }
            if self.zones.iter().any(|existing| existing.id == zone.id) {
                let fresh = new_zone_id();
                log::warn!(
                    "Imported zone {id} collides with an existing id; assigned {fresh}",
                    id = zone.id
                );
                zone.id = fresh;
            }
            self.zones.push(zone);
            added += 1;
        }
        self.persist()?;
        Ok(added)
    }

    /// Adopts a remote peer's zone list wholesale.
    ///
    /// Used on the sync receive path: the payload was already persisted by
    /// the sender (both processes share the data directory), so this swaps
    /// the in-memory list without writing or re-announcing — the loop
    /// stops here.
    pub fn replace_all(&mut self, zones: Vec<Zone>) {
        self.zones = zones;
    }

    fn persist(&self) -> Result<(), ZoneStoreError> {
        let payload = serde_json::to_string(&self.zones)?;
        self.storage.set(ZONES_KEY, &payload)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use flowtrack_geometry::square_ring;
    use flowtrack_storage::MemoryStore;
    use flowtrack_zones_models::ZONE_COLOR_PALETTE;

    use super::*;

    const CENTER: LatLng = LatLng::new(13.6288, 79.4192);

    fn open_over(storage: &Arc<MemoryStore>) -> ZoneStore {
        ZoneStore::open(storage.clone()).unwrap()
    }

    #[test]
    fn creates_zones_with_palette_colors_and_fresh_ids() {
        let storage = Arc::new(MemoryStore::new());
        let mut store = open_over(&storage);

        let first = store
            .create_zone("North Gate", square_ring(CENTER, 100.0))
            .unwrap();
        let second = store
            .create_zone("Food Court", square_ring(CENTER, 50.0))
            .unwrap();

        assert!(first.id.starts_with("zone-"));
        assert_ne!(first.id, second.id);
        assert_eq!(first.color_tag, ZONE_COLOR_PALETTE[0]);
        assert_eq!(second.color_tag, ZONE_COLOR_PALETTE[1]);
        assert!(first.area > 9_000.0 && first.area < 11_000.0);
    }

    #[test]
    fn persists_across_reopen_in_list_order() {
        let storage = Arc::new(MemoryStore::new());
        let mut store = open_over(&storage);
        for name in ["Alpha", "Bravo", "Charlie"] {
            store.create_zone(name, square_ring(CENTER, 80.0)).unwrap();
        }

        let reopened = open_over(&storage);
        let names: Vec<&str> = reopened
            .list_zones()
            .iter()
            .map(|zone| zone.name.as_str())
            .collect();
        assert_eq!(names, ["Alpha", "Bravo", "Charlie"]);
        assert_eq!(reopened.list_zones(), store.list_zones());
    }

    #[test]
    fn updates_vertices_and_recomputes_area() {
        let storage = Arc::new(MemoryStore::new());
        let mut store = open_over(&storage);
        let zone = store
            .create_zone("Plaza", square_ring(CENTER, 100.0))
            .unwrap();

        assert!(
            store
                .update_zone_vertices(&zone.id, square_ring(CENTER, 200.0))
                .unwrap()
        );

        let updated = &store.list_zones()[0];
        let ratio = updated.area / zone.area;
        assert!(ratio > 3.9 && ratio < 4.1, "area ratio was {ratio}");
    }

    #[test]
    fn ignores_mutations_for_unknown_zones() {
        let storage = Arc::new(MemoryStore::new());
        let mut store = open_over(&storage);
        store
            .create_zone("Only", square_ring(CENTER, 60.0))
            .unwrap();

        assert!(
            !store
                .update_zone_vertices("zone-missing", square_ring(CENTER, 10.0))
                .unwrap()
        );
        assert!(!store.rename_zone("zone-missing", "Ghost").unwrap());
        assert!(store.delete_zone("zone-missing").unwrap().is_none());
        assert_eq!(store.list_zones().len(), 1);
    }

    #[test]
    fn delete_returns_the_removed_zone() {
        let storage = Arc::new(MemoryStore::new());
        let mut store = open_over(&storage);
        let doomed = store
            .create_zone("Doomed", square_ring(CENTER, 40.0))
            .unwrap();
        store.create_zone("Kept", square_ring(CENTER, 40.0)).unwrap();

        let removed = store.delete_zone(&doomed.id).unwrap();
        assert_eq!(removed.map(|zone| zone.name), Some("Doomed".to_string()));
        assert_eq!(store.list_zones().len(), 1);
        assert_eq!(open_over(&storage).list_zones().len(), 1);
    }

    #[test]
    fn rename_persists_the_new_name() {
        let storage = Arc::new(MemoryStore::new());
        let mut store = open_over(&storage);
        let zone = store
            .create_zone("Working Title", square_ring(CENTER, 40.0))
            .unwrap();

        assert!(store.rename_zone(&zone.id, "Main Stage").unwrap());
        assert_eq!(open_over(&storage).list_zones()[0].name, "Main Stage");
    }

    #[test]
    fn migrates_legacy_v1_payloads_on_open() {
        let storage = Arc::new(MemoryStore::new());
        let ring = square_ring(CENTER, 100.0);
        let legacy = serde_json::json!([
            { "id": "zone-aa", "name": "Gate A", "polygon": ring.clone(), "area": 1.0,
              "color": "#9C27B0" },
            { "id": "zone-bb", "name": "Gate B", "polygon": ring.clone(), "area": 1.0 }
        ]);
        storage.set(LEGACY_ZONES_KEY, &legacy.to_string()).unwrap();

        let store = open_over(&storage);
        let zones = store.list_zones();
        assert_eq!(zones.len(), 2);
        assert_eq!(zones[0].color_tag, "#9C27B0");
        assert_eq!(zones[1].color_tag, ZONE_COLOR_PALETTE[1]);
        assert_eq!(zones[0].vertices, ring);
        // Stored legacy areas are ignored in favor of recomputed ones.
        assert!((zones[0].area - 10_000.0).abs() / 10_000.0 < 0.01);
        // The migrated list is now the v2 payload of record, and the
        // recomputed areas parse back bit-for-bit on reopen.
        assert!(storage.get(ZONES_KEY).unwrap().is_some());
        assert_eq!(open_over(&storage).list_zones(), zones);
    }

    #[test]
    fn fails_closed_on_corrupt_v2_payloads() {
        let storage = Arc::new(MemoryStore::new());
        storage.set(ZONES_KEY, "{\"not\":\"a zone list\"}").unwrap();

        let err = ZoneStore::open(storage).unwrap_err();
        assert!(matches!(
            err,
            ZoneStoreError::ZonePayloadVersion { key: ZONES_KEY, .. }
        ));
    }

    #[test]
    fn debug_output_elides_the_storage_handle() {
        let storage = Arc::new(MemoryStore::new());
        let mut store = open_over(&storage);
        store.create_zone("Pit", square_ring(CENTER, 20.0)).unwrap();

        let rendered = format!("{store:?}");
        assert!(rendered.starts_with("ZoneStore"), "got: {rendered}");
        assert!(rendered.contains("Pit"));
        assert!(rendered.ends_with(".. }"), "got: {rendered}");
    }

    #[test]
    fn replace_all_swaps_memory_without_persisting() {
        let storage = Arc::new(MemoryStore::new());
        let mut store = open_over(&storage);
        store
            .create_zone("Durable", square_ring(CENTER, 70.0))
            .unwrap();

        store.replace_all(Vec::new());
        assert!(store.list_zones().is_empty());
        // The persisted payload still holds the zone written before.
        assert_eq!(open_over(&storage).list_zones().len(), 1);
    }

    #[test]
    fn rejects_non_finite_outlines_before_persisting() {
        let storage = Arc::new(MemoryStore::new());
        let mut store = open_over(&storage);
        let zone = store
            .create_zone("Good", square_ring(CENTER, 50.0))
            .unwrap();

        let mut bad_ring = square_ring(CENTER, 50.0);
        bad_ring[2] = LatLng::new(f64::NAN, 79.4192);

        let err = store.create_zone("Bad", bad_ring.clone()).unwrap_err();
        assert!(matches!(err, ZoneStoreError::NonFiniteOutline { .. }));
        let err = store
            .update_zone_vertices(&zone.id, bad_ring.clone())
            .unwrap_err();
        assert!(matches!(err, ZoneStoreError::NonFiniteOutline { .. }));

        let ghost = Zone {
            id: "zone-ghost".to_string(),
            name: "Ghost".to_string(),
            vertices: bad_ring,
            area: 0.0,
            color_tag: "#F44336".to_string(),
        };
        assert_eq!(store.import_zones(vec![ghost]).unwrap(), 0);

        // Nothing non-finite reached the slot: the catalog still reopens.
        let reopened = open_over(&storage);
        assert_eq!(reopened.list_zones().len(), 1);
        assert_eq!(reopened.list_zones()[0].vertices, zone.vertices);
    }

    #[test]
    fn import_reassigns_colliding_ids() {
        let storage = Arc::new(MemoryStore::new());
        let mut store = open_over(&storage);
        let existing = store
            .create_zone("Original", square_ring(CENTER, 30.0))
            .unwrap();

        let clash = Zone {
            id: existing.id.clone(),
            name: "Imported".to_string(),
            vertices: square_ring(CENTER, 30.0),
            area: existing.area,
            color_tag: existing.color_tag.clone(),
        };
        assert_eq!(store.import_zones(vec![clash]).unwrap(), 1);

        let zones = store.list_zones();
        assert_eq!(zones.len(), 2);
        assert_ne!(zones[0].id, zones[1].id);
        assert_eq!(open_over(&storage).list_zones().len(), 2);
    }
}
