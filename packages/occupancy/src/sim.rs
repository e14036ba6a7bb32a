//! Simulated crowd driver for demos and load exercises.
//!
//! Spawns entities uniformly jittered around a center point, then
//! random-walks each one on its own timer the way handheld trackers
//! report: small independent steps, one containment re-check per step.
//! The walk deliberately ignores zone boundaries — entities wander in and
//! out, which is exactly the traffic the occupancy tracker exists to
//! observe.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use flowtrack_zones_models::{DEFAULT_MAP_CENTER, LatLng};
use rand::{Rng, RngCore, SeedableRng, rngs::SmallRng};
use tokio::task::JoinHandle;

use crate::OccupancyTracker;

/// Entities spawned when no size is given; mirrors the dashboard's demo
/// default.
pub const DEFAULT_CROWD_SIZE: usize = 6;

/// Default per-entity tick period in milliseconds.
pub const DEFAULT_TICK_MS: u64 = 2_500;

/// Spawn scatter around the center, degrees per axis.
const SPAWN_JITTER_DEG: f64 = 0.001;

/// Random-walk step bound, degrees per axis per tick.
const STEP_JITTER_DEG: f64 = 0.000_25;

/// How a [`SimulatedCrowd`] is spawned.
#[derive(Debug, Clone, Copy)]
pub struct CrowdConfig {
    pub size: usize,
    pub center: LatLng,
    pub tick: Duration,
    /// Seed for deterministic walks; `None` draws from entropy.
    pub seed: Option<u64>,
}

impl Default for CrowdConfig {
    fn default() -> Self {
        Self {
            size: DEFAULT_CROWD_SIZE,
            center: DEFAULT_MAP_CENTER,
            tick: Duration::from_millis(DEFAULT_TICK_MS),
            seed: None,
        }
    }
}

/// A set of independently ticking simulated entities.
///
/// Dropping the crowd (or calling [`SimulatedCrowd::stop`]) aborts every
/// tick task. Counts are left exactly as last observed; a stopped crowd
/// does not march its entities out of their zones.
pub struct SimulatedCrowd {
    handles: Vec<JoinHandle<()>>,
}

impl SimulatedCrowd {
    /// Spawns `config.size` entities and starts their tick tasks on the
    /// current Tokio runtime.
    ///
    /// Entity ids continue from the tracker's current population
    /// (`sim-0`, `sim-1`, ...), so repeated spawns extend the crowd
    /// rather than recycling ids.
    ///
    /// # Panics
    ///
    /// Panics if the tracker `Mutex` is poisoned.
    #[must_use]
    pub fn start(tracker: Arc<Mutex<OccupancyTracker>>, config: CrowdConfig) -> Self {
        let mut seeder = config
            .seed
            .map_or_else(SmallRng::from_entropy, SmallRng::seed_from_u64);
        let base = tracker
            .lock()
            .expect("occupancy tracker mutex poisoned")
            .entities()
            .count();

        let mut handles = Vec::with_capacity(config.size);
        for offset in 0..config.size {
            let entity_id = format!("sim-{}", base + offset);
            let spawn = LatLng::new(
                config.center.lat + seeder.gen_range(-SPAWN_JITTER_DEG..SPAWN_JITTER_DEG),
                config.center.lng + seeder.gen_range(-SPAWN_JITTER_DEG..SPAWN_JITTER_DEG),
            );
            let mut rng = SmallRng::seed_from_u64(seeder.next_u64());
            let tracker = Arc::clone(&tracker);
            let tick = config.tick;

            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(tick);
                let mut position = spawn;
                loop {
                    ticker.tick().await;
                    position = LatLng::new(
                        position.lat + rng.gen_range(-STEP_JITTER_DEG..STEP_JITTER_DEG),
                        position.lng + rng.gen_range(-STEP_JITTER_DEG..STEP_JITTER_DEG),
                    );
                    tracker
                        .lock()
                        .expect("occupancy tracker mutex poisoned")
                        .update_position(&entity_id, position);
                }
            }));
        }

        log::info!("Simulated crowd started: {} entities", config.size);
        Self { handles }
    }

    /// Aborts every tick task. Idempotent.
    pub fn stop(&mut self) {
        if self.handles.is_empty() {
            return;
        }
        for handle in self.handles.drain(..) {
            handle.abort();
        }
        log::info!("Simulated crowd stopped");
    }

    /// Whether any tick tasks are still attached.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.handles.is_empty()
    }
}

impl Drop for SimulatedCrowd {
    fn drop(&mut self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use flowtrack_geometry::square_ring;
    use flowtrack_zones_models::Zone;

    use super::*;
    use crate::CountBoard;

    fn venue_zone(side_m: f64) -> Zone {
        let vertices = square_ring(DEFAULT_MAP_CENTER, side_m);
        let area = flowtrack_geometry::polygon_area_m2(&vertices);
        Zone {
            id: "zone-venue".to_string(),
            name: "Venue".to_string(),
            vertices,
            area,
            color_tag: "#F44336".to_string(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn crowd_settles_into_an_enclosing_zone() {
        let board = CountBoard::new();
        let mut tracker = OccupancyTracker::new(board.clone());
        // Large enough that jittered spawns plus the short walk stay
        // comfortably inside.
        tracker.set_zones(std::slice::from_ref(&venue_zone(4_000.0)));
        let tracker = Arc::new(Mutex::new(tracker));

        let mut crowd = SimulatedCrowd::start(
            Arc::clone(&tracker),
            CrowdConfig {
                size: 6,
                tick: Duration::from_millis(50),
                seed: Some(42),
                ..CrowdConfig::default()
            },
        );
        assert!(crowd.is_running());

        tokio::time::sleep(Duration::from_millis(500)).await;

        assert_eq!(board.snapshot().get("zone-venue"), Some(&6));
        let guard = tracker.lock().unwrap();
        assert_eq!(guard.entities().count(), 6);
        assert!(guard.entity("sim-0").is_some());
        drop(guard);

        crowd.stop();
        assert!(!crowd.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_spawns_extend_entity_ids() {
        let board = CountBoard::new();
        let tracker = Arc::new(Mutex::new(OccupancyTracker::new(board)));

        let config = CrowdConfig {
            size: 2,
            tick: Duration::from_millis(50),
            seed: Some(7),
            ..CrowdConfig::default()
        };
        let _first = SimulatedCrowd::start(Arc::clone(&tracker), config);
        tokio::time::sleep(Duration::from_millis(60)).await;
        let _second = SimulatedCrowd::start(Arc::clone(&tracker), config);
        tokio::time::sleep(Duration::from_millis(60)).await;

        let guard = tracker.lock().unwrap();
        let ids: Vec<&str> = guard.entities().map(|entity| entity.id.as_str()).collect();
        assert_eq!(ids, ["sim-0", "sim-1", "sim-2", "sim-3"]);
    }
}
