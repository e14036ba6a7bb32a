#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! The owned engine instance behind a FlowTrack process.
//!
//! [`CrowdEngine`] wires the zone store, the occupancy board, the
//! Monte-Carlo estimator, and the sync fabric into one explicitly
//! owned object with a clear lifecycle: `open` loads persisted state
//! and attaches to sync, mutations follow persist-then-broadcast order,
//! and dropping the engine stops every background task.
//!
//! Count changes are not broadcast inline. Crossings, estimation runs,
//! and remote applies all land on the shared [`CountBoard`]; a flush
//! task watches its revision and turns each observed change into one
//! persisted snapshot plus one broadcast, filtered to zones still in
//! the catalog, making count persistence fire-and-forget for callers.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use flowtrack_density::{DensityError, Estimate, EstimateConfig, estimate_distribution};
use flowtrack_occupancy::sim::{CrowdConfig, SimulatedCrowd};
use flowtrack_occupancy::{CountBoard, OccupancyTracker};
use flowtrack_storage::KeyValueStore;
use flowtrack_sync::{SyncBus, SyncError, SyncOptions, SyncPublisher};
use flowtrack_zones::{COUNTS_KEY, ZoneStore, ZoneStoreError};
use flowtrack_zones_models::{
    CountSnapshot, LatLng, RenderDirective, RiskBand, RiskThresholds, SyncMessage, ViewportBounds,
    Zone, ZoneCounts, density_per_100m2,
};
use rand::{SeedableRng, rngs::SmallRng};
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;

/// How often the flush task checks the count board for changes.
pub const DEFAULT_COUNT_FLUSH_INTERVAL: Duration = Duration::from_millis(250);

/// Engine-level failures. Component errors pass through unchanged.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Estimation was requested before any viewport was set.
    #[error("No sampling viewport is set")]
    BoundsUnavailable,

    /// Zone store failure (storage I/O or payload codec).
    #[error(transparent)]
    Zones(#[from] ZoneStoreError),

    /// Estimation failure; prior counts are left untouched.
    #[error(transparent)]
    Density(#[from] DensityError),

    /// No sync transport could be established.
    #[error(transparent)]
    Sync(#[from] SyncError),
}

/// Construction-time settings for [`CrowdEngine::open`].
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Density thresholds for risk classification.
    pub thresholds: RiskThresholds,
    /// Sync transport selection and topic.
    pub sync: SyncOptions,
    /// Estimation population and batching.
    pub estimate: EstimateConfig,
    /// Cadence of the count flush task.
    pub count_flush_interval: Duration,
    /// Seed for the estimator's sampler; `None` draws from entropy.
    pub seed: Option<u64>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            thresholds: RiskThresholds::default(),
            sync: SyncOptions::default(),
            estimate: EstimateConfig::default(),
            count_flush_interval: DEFAULT_COUNT_FLUSH_INTERVAL,
            seed: None,
        }
    }
}

/// One zone's standing in a [`CrowdSnapshot`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ZoneStatus {
    /// The zone itself.
    pub zone: Zone,
    /// Current people count.
    pub count: u64,
    /// People per 100 m².
    pub density: f64,
    /// Risk classification of `density`.
    pub risk: RiskBand,
}

/// A point-in-time view of every zone with its count, density, and
/// risk band. Sufficient for CSV export and dashboards without
/// re-deriving any engine logic.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CrowdSnapshot {
    /// When the snapshot was taken.
    pub timestamp: DateTime<Utc>,
    /// Per-zone standing, in persisted zone order.
    pub zones: Vec<ZoneStatus>,
}

/// The process's one engine instance.
///
/// Owns the zone store and occupancy tracker, publishes every local
/// mutation to peers, and applies peer broadcasts to its own
/// projections on a background task.
pub struct CrowdEngine {
    storage: Arc<dyn KeyValueStore>,
    store: Arc<Mutex<ZoneStore>>,
    board: CountBoard,
    tracker: Arc<Mutex<OccupancyTracker>>,
    publisher: SyncPublisher,
    published_revision: Arc<AtomicU64>,
    crowds: Vec<SimulatedCrowd>,
    viewport: Option<ViewportBounds>,
    thresholds: RiskThresholds,
    estimate_config: EstimateConfig,
    rng: SmallRng,
    apply_task: JoinHandle<()>,
    flush_task: JoinHandle<()>,
}

impl CrowdEngine {
    /// Opens an engine over `storage`: loads (migrating if necessary)
    /// the persisted zone list and the last count snapshot, connects to
    /// the sync fabric, and starts the remote-apply and count-flush
    /// tasks.
    ///
    /// An unreadable count snapshot is not fatal — counts are a
    /// projection and regenerate — so it degrades to an empty map with
    /// a logged warning.
    ///
    /// # Errors
    ///
    /// * [`EngineError::Zones`] if the zone slot cannot be read or
    ///   decoded.
    /// * [`EngineError::Sync`] if no sync transport is available.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime, or if a shared-state
    /// `Mutex` is poisoned.
    pub fn open(
        storage: Arc<dyn KeyValueStore>,
        options: EngineOptions,
    ) -> Result<Self, EngineError> {
        let store = ZoneStore::open(Arc::clone(&storage))?;
        let board = CountBoard::new();
        board.replace_all(load_counts(&*storage));
        let mut tracker = OccupancyTracker::new(board.clone());
        tracker.set_zones(store.list_zones());
        log::info!(
            "Crowd engine opened with {count} zones",
            count = store.list_zones().len()
        );

        let store = Arc::new(Mutex::new(store));
        let tracker = Arc::new(Mutex::new(tracker));
        let published_revision = Arc::new(AtomicU64::new(board.revision()));

        let bus = SyncBus::connect(&options.sync, Some(Arc::clone(&storage)))?;
        let publisher = bus.publisher();
        let apply_task = tokio::spawn(apply_remote(
            bus,
            Arc::clone(&store),
            board.clone(),
            Arc::clone(&tracker),
        ));
        let flush_task = tokio::spawn(run_flush(
            Arc::clone(&storage),
            publisher.clone(),
            Arc::clone(&store),
            board.clone(),
            Arc::clone(&published_revision),
            options.count_flush_interval,
        ));

        let rng = options
            .seed
            .map_or_else(SmallRng::from_entropy, SmallRng::seed_from_u64);
        Ok(Self {
            storage,
            store,
            board,
            tracker,
            publisher,
            published_revision,
            crowds: Vec::new(),
            viewport: None,
            thresholds: options.thresholds,
            estimate_config: options.estimate,
            rng,
            apply_task,
            flush_task,
        })
    }

    /// The current zone list, in persisted order.
    ///
    /// # Panics
    ///
    /// Panics if the zone store `Mutex` is poisoned.
    #[must_use]
    pub fn zones(&self) -> Vec<Zone> {
        self.store().list_zones().to_vec()
    }

    /// Creates a zone, persists the list, and broadcasts it.
    ///
    /// # Errors
    ///
    /// * [`EngineError::Zones`] if persisting the list fails.
    ///
    /// # Panics
    ///
    /// Panics if a shared-state `Mutex` is poisoned.
    pub fn create_zone(&mut self, name: &str, vertices: Vec<LatLng>) -> Result<Zone, EngineError> {
        let zone = self.store().create_zone(name, vertices)?;
        self.announce_zones();
        Ok(zone)
    }

    /// Redraws a zone's outline; area is recomputed. Returns `false`
    /// (without persisting or broadcasting) if `id` is unknown.
    ///
    /// # Errors
    ///
    /// * [`EngineError::Zones`] if persisting the list fails.
    ///
    /// # Panics
    ///
    /// Panics if a shared-state `Mutex` is poisoned.
    pub fn update_zone_vertices(
        &mut self,
        id: &str,
        vertices: Vec<LatLng>,
    ) -> Result<bool, EngineError> {
        let updated = self.store().update_zone_vertices(id, vertices)?;
        if updated {
            self.announce_zones();
        }
        Ok(updated)
    }

    /// Renames a zone. Returns `false` if `id` is unknown.
    ///
    /// # Errors
    ///
    /// * [`EngineError::Zones`] if persisting the list fails.
    ///
    /// # Panics
    ///
    /// Panics if a shared-state `Mutex` is poisoned.
    pub fn rename_zone(&mut self, id: &str, name: &str) -> Result<bool, EngineError> {
        let renamed = self.store().rename_zone(id, name)?;
        if renamed {
            self.announce_zones();
        }
        Ok(renamed)
    }

    /// Deletes a zone and cascades: its count entry is dropped, members
    /// are re-evaluated, and the shrunken list is broadcast. The next
    /// count flush carries a map without the deleted id, so no later
    /// broadcast references it.
    ///
    /// # Errors
    ///
    /// * [`EngineError::Zones`] if persisting the list fails.
    ///
    /// # Panics
    ///
    /// Panics if a shared-state `Mutex` is poisoned.
    pub fn delete_zone(&mut self, id: &str) -> Result<Option<Zone>, EngineError> {
        let removed = self.store().delete_zone(id)?;
        if let Some(zone) = &removed {
            if self.board.remove_zone(&zone.id) {
                log::debug!("Dropped count entry for deleted zone {id}", id = zone.id);
            }
            self.announce_zones();
        }
        Ok(removed)
    }

    /// Appends imported zones (id collisions re-minted by the store),
    /// persists, and broadcasts.
    ///
    /// # Errors
    ///
    /// * [`EngineError::Zones`] if persisting the list fails.
    ///
    /// # Panics
    ///
    /// Panics if a shared-state `Mutex` is poisoned.
    pub fn import_zones(&mut self, zones: Vec<Zone>) -> Result<usize, EngineError> {
        let added = self.store().import_zones(zones)?;
        if added > 0 {
            self.announce_zones();
        }
        Ok(added)
    }

    /// Reports an entity's position (real or simulated), applying the
    /// crossing if its zone changed.
    ///
    /// # Panics
    ///
    /// Panics if the tracker `Mutex` is poisoned.
    pub fn update_position(&mut self, entity_id: &str, position: LatLng) {
        self.tracker
            .lock()
            .expect("occupancy tracker mutex poisoned")
            .update_position(entity_id, position);
    }

    /// Spawns `config.size` simulated entities feeding this engine's
    /// tracker. Repeated spawns extend the crowd; ids continue from the
    /// entities already tracked.
    pub fn spawn_crowd(&mut self, config: CrowdConfig) {
        self.crowds
            .push(SimulatedCrowd::start(Arc::clone(&self.tracker), config));
    }

    /// Stops every simulated entity. Their last known counts remain on
    /// the board.
    pub fn stop_crowds(&mut self) {
        for crowd in &mut self.crowds {
            crowd.stop();
        }
        self.crowds.clear();
    }

    /// Sets the sampling viewport for subsequent estimation runs.
    pub fn set_viewport(&mut self, bounds: ViewportBounds) {
        self.viewport = Some(bounds);
    }

    /// The bounding rectangle of every zone vertex, or `None` when no
    /// zone exists. A headless caller can feed this to
    /// [`Self::set_viewport`] in place of a map's visible bounds.
    ///
    /// # Panics
    ///
    /// Panics if the zone store `Mutex` is poisoned.
    #[must_use]
    pub fn zone_extent(&self) -> Option<ViewportBounds> {
        let store = self.store();
        let mut vertices = store.list_zones().iter().flat_map(|zone| &zone.vertices);
        let first = *vertices.next()?;
        let mut south_west = first;
        let mut north_east = first;
        for vertex in vertices {
            south_west.lat = south_west.lat.min(vertex.lat);
            south_west.lng = south_west.lng.min(vertex.lng);
            north_east.lat = north_east.lat.max(vertex.lat);
            north_east.lng = north_east.lng.max(vertex.lng);
        }
        Some(ViewportBounds::new(south_west, north_east))
    }

    /// Runs one Monte-Carlo estimation over the configured viewport and
    /// replaces the count board wholesale with the result. Persistence
    /// and broadcast of the new counts follow via the flush task.
    ///
    /// # Errors
    ///
    /// * [`EngineError::BoundsUnavailable`] if no viewport is set.
    /// * [`EngineError::Density`] if the run produced no usable samples;
    ///   prior counts are left untouched.
    ///
    /// # Panics
    ///
    /// Panics if a shared-state `Mutex` is poisoned.
    pub async fn estimate(&mut self) -> Result<Estimate, EngineError> {
        let bounds = self.viewport.ok_or(EngineError::BoundsUnavailable)?;
        let zones = self.zones();
        let estimate =
            estimate_distribution(&zones, bounds, &self.estimate_config, &mut self.rng).await?;
        self.board.replace_all(estimate.counts.clone());
        log::info!(
            "Estimated distribution over {count} zones from {hits} sample hits",
            count = zones.len(),
            hits = estimate.samples_inside
        );
        Ok(estimate)
    }

    /// Captures the current per-zone standing.
    ///
    /// # Panics
    ///
    /// Panics if a shared-state `Mutex` is poisoned.
    #[must_use]
    pub fn snapshot(&self) -> CrowdSnapshot {
        let counts = self.board.snapshot();
        let zones = self
            .zones()
            .into_iter()
            .map(|zone| {
                let count = counts.get(&zone.id).copied().unwrap_or(0);
                let density = density_per_100m2(count, zone.area);
                let risk = self.thresholds.classify(density);
                ZoneStatus {
                    zone,
                    count,
                    density,
                    risk,
                }
            })
            .collect();
        CrowdSnapshot {
            timestamp: Utc::now(),
            zones,
        }
    }

    /// Per-zone drawing instructions for a map layer, derived from the
    /// current counts and the configured thresholds.
    ///
    /// # Panics
    ///
    /// Panics if a shared-state `Mutex` is poisoned.
    #[must_use]
    pub fn render_directives(&self) -> Vec<RenderDirective> {
        let counts = self.board.snapshot();
        self.zones()
            .iter()
            .map(|zone| {
                let count = counts.get(&zone.id).copied().unwrap_or(0);
                RenderDirective::for_zone(zone, count, &self.thresholds)
            })
            .collect()
    }

    /// Stops crowds and background tasks, then flushes any count change
    /// the flush task had not yet covered. Dropping the engine without
    /// calling this still stops everything, but skips the final flush.
    ///
    /// # Panics
    ///
    /// Panics if the count board `Mutex` is poisoned.
    pub fn shutdown(mut self) {
        self.stop_crowds();
        self.apply_task.abort();
        self.flush_task.abort();
        flush_once(
            &*self.storage,
            &self.publisher,
            &self.store,
            &self.board,
            &self.published_revision,
        );
        log::info!("Crowd engine shut down");
    }

    fn store(&self) -> MutexGuard<'_, ZoneStore> {
        self.store.lock().expect("zone store mutex poisoned")
    }

    /// Rebuilds membership against the current list and broadcasts it.
    /// Called after every successful zone mutation, keeping the
    /// mutation → persist → broadcast order.
    fn announce_zones(&self) {
        let zones = self.store().list_zones().to_vec();
        self.tracker
            .lock()
            .expect("occupancy tracker mutex poisoned")
            .set_zones(&zones);
        let count = zones.len();
        let reach = self.publisher.publish(&SyncMessage::ZonesUpdated { zones });
        log::debug!("Broadcast {count} zones to {reach} subscribers");
    }
}

impl Drop for CrowdEngine {
    fn drop(&mut self) {
        for crowd in &mut self.crowds {
            crowd.stop();
        }
        self.apply_task.abort();
        self.flush_task.abort();
    }
}

/// Reads the persisted count snapshot, degrading to an empty map when
/// the slot is missing or unreadable.
fn load_counts(storage: &dyn KeyValueStore) -> ZoneCounts {
    match storage.get(COUNTS_KEY) {
        Ok(Some(payload)) => match serde_json::from_str::<CountSnapshot>(&payload) {
            Ok(snapshot) => snapshot.counts,
            Err(err) => {
                log::warn!(
                    "Count snapshot under {COUNTS_KEY} does not decode, starting empty: {err}"
                );
                ZoneCounts::new()
            }
        },
        Ok(None) => ZoneCounts::new(),
        Err(err) => {
            log::warn!("Failed to read count snapshot, starting empty: {err}");
            ZoneCounts::new()
        }
    }
}

/// Applies peer broadcasts to this engine's projections. Full-state
/// replacement, no merging. The channel transport never hands an
/// engine its own messages back; watcher echoes of its own persisted
/// writes can still arrive, and applying state identical to the local
/// copy is a no-op.
async fn apply_remote(
    mut bus: SyncBus,
    store: Arc<Mutex<ZoneStore>>,
    board: CountBoard,
    tracker: Arc<Mutex<OccupancyTracker>>,
) {
    while let Some(message) = bus.recv().await {
        match message {
            SyncMessage::ZonesUpdated { zones } => {
                {
                    let mut store = store.lock().expect("zone store mutex poisoned");
                    if store.list_zones() == zones.as_slice() {
                        continue;
                    }
                    store.replace_all(zones.clone());
                }
                tracker
                    .lock()
                    .expect("occupancy tracker mutex poisoned")
                    .set_zones(&zones);
                log::debug!("Applied remote zone list ({count} zones)", count = zones.len());
            }
            SyncMessage::CountsUpdated { counts } => {
                board.replace_all(counts);
            }
        }
    }
    log::debug!("Sync apply loop ended");
}

/// Periodically turns count-board changes into a persisted snapshot
/// plus one broadcast.
async fn run_flush(
    storage: Arc<dyn KeyValueStore>,
    publisher: SyncPublisher,
    store: Arc<Mutex<ZoneStore>>,
    board: CountBoard,
    published_revision: Arc<AtomicU64>,
    period: Duration,
) {
    let mut interval = tokio::time::interval(period);
    loop {
        interval.tick().await;
        flush_once(&*storage, &publisher, &store, &board, &published_revision);
    }
}

/// Persists and broadcasts the count map if its revision moved past
/// what was already published. Entries for zones no longer in the
/// catalog are dropped from the outgoing map, so a deleted zone's id
/// never reaches a later snapshot or broadcast however the delete
/// interleaves with crossings. Failures are logged and retried on the
/// next flush, never surfaced — count publication is fire-and-forget.
fn flush_once(
    storage: &dyn KeyValueStore,
    publisher: &SyncPublisher,
    store: &Mutex<ZoneStore>,
    board: &CountBoard,
    published_revision: &AtomicU64,
) {
    // Revision before snapshot: a crossing landing between the two reads
    // re-flushes next time instead of being missed.
    let revision = board.revision();
    if revision == published_revision.load(Ordering::Acquire) {
        return;
    }
    let live: BTreeSet<String> = {
        let store = store.lock().expect("zone store mutex poisoned");
        store
            .list_zones()
            .iter()
            .map(|zone| zone.id.clone())
            .collect()
    };
    let mut counts = board.snapshot();
    counts.retain(|zone_id, _| live.contains(zone_id));
    let snapshot = CountSnapshot::now(counts.clone());
    let payload = match serde_json::to_string(&snapshot) {
        Ok(payload) => payload,
        Err(err) => {
            log::warn!("Failed to encode count snapshot: {err}");
            return;
        }
    };
    if let Err(err) = storage.set(COUNTS_KEY, &payload) {
        log::warn!("Failed to persist count snapshot: {err}");
        return;
    }
    let reach = publisher.publish(&SyncMessage::CountsUpdated { counts });
    log::debug!("Published count revision {revision} to {reach} subscribers");
    published_revision.store(revision, Ordering::Release);
}
