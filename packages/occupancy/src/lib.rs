#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Per-entity zone membership and the shared occupancy count board.
//!
//! Every position update runs a containment test against the current
//! [`ZoneIndex`] (first match in zone list order). When an entity's zone
//! changes, the decrement of the zone it left and the increment of the
//! zone it entered are applied under a single [`CountBoard`] lock, so no
//! reader ever observes the half-applied crossing. Counts floor at zero;
//! decrementing a zone with no entry (it may have just been deleted) is a
//! no-op, not an error.
//!
//! The demo crowd driver lives in [`sim`].

pub mod sim;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use flowtrack_spatial::ZoneIndex;
use flowtrack_zones_models::{LatLng, Zone, ZoneCounts};

#[derive(Debug, Default)]
struct BoardState {
    counts: ZoneCounts,
    revision: u64,
}

/// Shared per-zone occupancy counts.
///
/// Cheaply cloneable handle around one mutex-guarded count map; clones
/// share state. Two writers feed it: incremental crossing events from the
/// tracker and wholesale replacement from the density estimator — the
/// latter supersedes, it does not merge. The revision increments on every
/// observable change so pollers can skip unchanged snapshots.
#[derive(Debug, Clone, Default)]
pub struct CountBoard {
    state: Arc<Mutex<BoardState>>,
}

impl CountBoard {
    /// Creates an empty board at revision zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies one zone-crossing event atomically.
    ///
    /// Decrements `from` (flooring at zero, skipping absent entries) and
    /// increments `to` under the same lock acquisition. Passing equal
    /// endpoints is a no-op and does not bump the revision.
    ///
    /// # Panics
    ///
    /// Panics if the `Mutex` is poisoned.
    pub fn apply_transition(&self, from: Option<&str>, to: Option<&str>) {
        if from == to {
            return;
        }
        let mut state = self.state();
        if let Some(zone_id) = from {
            if let Some(count) = state.counts.get_mut(zone_id) {
                *count = count.saturating_sub(1);
            }
        }
        if let Some(zone_id) = to {
            *state.counts.entry(zone_id.to_string()).or_insert(0) += 1;
        }
        state.revision += 1;
    }

    /// Replaces the whole count map (the estimation and remote-apply
    /// supersede path). Replacing with an identical map is a no-op and
    /// does not bump the revision, so replaying a change back at its
    /// originator settles instead of ping-ponging.
    ///
    /// # Panics
    ///
    /// Panics if the `Mutex` is poisoned.
    pub fn replace_all(&self, counts: ZoneCounts) {
        let mut state = self.state();
        if state.counts == counts {
            return;
        }
        state.counts = counts;
        state.revision += 1;
    }

    /// Drops a zone's entry after the zone itself is deleted. Returns
    /// whether an entry existed.
    ///
    /// # Panics
    ///
    /// Panics if the `Mutex` is poisoned.
    #[must_use]
    pub fn remove_zone(&self, zone_id: &str) -> bool {
        let mut state = self.state();
        let removed = state.counts.remove(zone_id).is_some();
        if removed {
            state.revision += 1;
        }
        removed
    }

    /// A point-in-time copy of the count map.
    ///
    /// # Panics
    ///
    /// Panics if the `Mutex` is poisoned.
    #[must_use]
    pub fn snapshot(&self) -> ZoneCounts {
        self.state().counts.clone()
    }

    /// The current revision. Increments on every observable change.
    ///
    /// # Panics
    ///
    /// Panics if the `Mutex` is poisoned.
    #[must_use]
    pub fn revision(&self) -> u64 {
        self.state().revision
    }

    fn state(&self) -> MutexGuard<'_, BoardState> {
        self.state.lock().expect("count board mutex poisoned")
    }
}

/// One tracked crowd member. Owned by a single process; peers learn about
/// occupancy through the count map, never through entities.
#[derive(Debug, Clone)]
pub struct TrackedEntity {
    pub id: String,
    pub position: LatLng,
    /// Derived: recomputed from the zone index on every position update.
    pub current_zone: Option<String>,
}

/// Zone-membership state machine over a set of tracked entities.
pub struct OccupancyTracker {
    index: ZoneIndex,
    entities: BTreeMap<String, TrackedEntity>,
    board: CountBoard,
}

impl OccupancyTracker {
    /// Creates a tracker with no zones and no entities, reporting
    /// crossings to `board`.
    #[must_use]
    pub fn new(board: CountBoard) -> Self {
        Self {
            index: ZoneIndex::build(&[]),
            entities: BTreeMap::new(),
            board,
        }
    }

    /// Swaps in a rebuilt index for the new zone list and re-evaluates
    /// every entity's membership against it, applying crossings for any
    /// entity whose zone changed (it may have been standing in a zone
    /// that was just deleted or redrawn).
    pub fn set_zones(&mut self, zones: &[Zone]) {
        self.index = ZoneIndex::build(zones);
        log::debug!("Zone index rebuilt over {} zones", zones.len());
        for entity in self.entities.values_mut() {
            let located = self.index.locate(entity.position).map(str::to_string);
            if entity.current_zone != located {
                self.board
                    .apply_transition(entity.current_zone.as_deref(), located.as_deref());
                entity.current_zone = located;
            }
        }
    }

    /// Records an entity's new position, registering the entity on first
    /// sight, and applies the crossing if its zone changed.
    pub fn update_position(&mut self, entity_id: &str, position: LatLng) {
        let located = self.index.locate(position).map(str::to_string);
        let entity = self
            .entities
            .entry(entity_id.to_string())
            .or_insert_with(|| TrackedEntity {
                id: entity_id.to_string(),
                position,
                current_zone: None,
            });
        entity.position = position;
        if entity.current_zone != located {
            log::debug!(
                "Entity {entity_id} zone changed: {:?} -> {located:?}",
                entity.current_zone
            );
            self.board
                .apply_transition(entity.current_zone.as_deref(), located.as_deref());
            entity.current_zone = located;
        }
    }

    /// Looks up one tracked entity.
    #[must_use]
    pub fn entity(&self, entity_id: &str) -> Option<&TrackedEntity> {
        self.entities.get(entity_id)
    }

    /// Iterates all tracked entities in id order.
    #[must_use]
    pub fn entities(&self) -> impl Iterator<Item = &TrackedEntity> {
        self.entities.values()
    }
}
