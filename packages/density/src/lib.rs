#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Monte-Carlo crowd-distribution estimation.
//!
//! Draws uniform sample points over the viewport and buckets each into
//! the first zone containing it. Hit counts are then rescaled by hit
//! share to the target population: the crowd is assumed to be inside
//! zones, distributed the way the samples landed. Sampling runs in
//! batches with a cooperative yield between them so the host loop stays
//! live during large runs.

use std::collections::BTreeMap;

use flowtrack_spatial::ZoneIndex;
use flowtrack_zones_models::{LatLng, ViewportBounds, Zone, ZoneCounts};
use rand::{Rng, rngs::SmallRng};
use thiserror::Error;

/// Sample population assumed when the caller does not name one.
pub const DEFAULT_SAMPLE_POPULATION: u64 = 25_000;

/// Samples drawn between cooperative yields.
pub const DEFAULT_SAMPLE_BATCH: u64 = 2_000;

/// Estimation failures. Both leave the caller's prior counts untouched.
#[derive(Debug, Error)]
pub enum DensityError {
    /// Not one sampled point landed inside a zone (or there were no
    /// zones, or no samples). Zooming the viewport in is the usual fix.
    #[error("No sampled points fell inside any zone")]
    NoSamplesInZone,

    /// The sampling rectangle has zero or negative span on an axis, or
    /// a non-finite corner coordinate.
    #[error("Viewport bounds enclose no sampling area")]
    DegenerateBounds,
}

/// Tuning for one estimation run.
#[derive(Debug, Clone, Copy)]
pub struct EstimateConfig {
    /// Crowd size to distribute among the zones.
    pub total_population: u64,
    /// Samples drawn per batch before yielding.
    pub batch_size: u64,
}

impl Default for EstimateConfig {
    fn default() -> Self {
        Self {
            total_population: DEFAULT_SAMPLE_POPULATION,
            batch_size: DEFAULT_SAMPLE_BATCH,
        }
    }
}

/// The outcome of one estimation run.
#[derive(Debug, Clone)]
pub struct Estimate {
    /// Estimated people per zone. Every zone has an entry, zeros
    /// included, so stale counts cannot survive a replacement.
    pub counts: ZoneCounts,
    /// The sampled points that landed inside a zone, for heat overlays.
    pub heat_points: Vec<LatLng>,
    /// Raw number of samples that hit any zone.
    pub samples_inside: u64,
}

/// Estimates how `config.total_population` people are spread across
/// `zones` by sampling `bounds` uniformly.
///
/// Zone attribution is first-match in list order, the same tie-break the
/// occupancy tracker uses, so overlapping zones bias the same way in
/// both. A seeded `rng` makes the run reproducible.
///
/// # Errors
///
/// * [`DensityError::DegenerateBounds`] if `bounds` spans no area.
/// * [`DensityError::NoSamplesInZone`] if no sample landed in any zone;
///   nothing is written anywhere on this path.
pub async fn estimate_distribution(
    zones: &[Zone],
    bounds: ViewportBounds,
    config: &EstimateConfig,
    rng: &mut SmallRng,
) -> Result<Estimate, DensityError> {
    if bounds.is_degenerate() {
        return Err(DensityError::DegenerateBounds);
    }
    if zones.is_empty() {
        log::debug!("Estimation requested with no zones defined");
        return Err(DensityError::NoSamplesInZone);
    }

    let index = ZoneIndex::build(zones);
    let mut hits: BTreeMap<String, u64> =
        zones.iter().map(|zone| (zone.id.clone(), 0)).collect();
    let mut heat_points = Vec::new();

    // A zero batch would never advance the loop.
    let batch_size = config.batch_size.max(1);
    let mut processed = 0_u64;
    while processed < config.total_population {
        let take = batch_size.min(config.total_population - processed);
        for _ in 0..take {
            let point = sample_point(bounds, rng);
            if let Some(zone_id) = index.locate(point) {
                if let Some(count) = hits.get_mut(zone_id) {
                    *count += 1;
                }
                heat_points.push(point);
            }
        }
        processed += take;
        log::debug!(
            "Sampled {processed}/{total} viewport points",
            total = config.total_population
        );
        tokio::task::yield_now().await;
    }

    let samples_inside: u64 = hits.values().sum();
    if samples_inside == 0 {
        return Err(DensityError::NoSamplesInZone);
    }

    let counts: ZoneCounts = hits
        .into_iter()
        .map(|(zone_id, zone_hits)| {
            (
                zone_id,
                rescale(zone_hits, samples_inside, config.total_population),
            )
        })
        .collect();

    Ok(Estimate {
        counts,
        heat_points,
        samples_inside,
    })
}

/// Rounds `hits / samples_inside * total_population`. The share is in
/// `[0, 1]`, so the result cannot exceed the population.
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
fn rescale(hits: u64, samples_inside: u64, total_population: u64) -> u64 {
    let share = hits as f64 / samples_inside as f64;
    (share * total_population as f64).round() as u64
}

fn sample_point(bounds: ViewportBounds, rng: &mut SmallRng) -> LatLng {
    LatLng::new(
        rng.gen_range(bounds.south_west.lat..bounds.north_east.lat),
        rng.gen_range(bounds.south_west.lng..bounds.north_east.lng),
    )
}
