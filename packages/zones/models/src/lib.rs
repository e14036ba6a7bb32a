#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Zone, count, and risk types for the `FlowTrack` crowd core.
//!
//! These are the wire and persisted shapes shared by the zone store, the
//! occupancy tracker, the density estimator, and the sync transport. Field
//! names serialize in `camelCase` to stay byte-compatible with the payloads
//! the dashboard already reads and writes.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A WGS84 coordinate in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatLng {
    /// Latitude in degrees, positive north.
    pub lat: f64,
    /// Longitude in degrees, positive east.
    pub lng: f64,
}

impl LatLng {
    /// Creates a coordinate from latitude and longitude in degrees.
    #[must_use]
    pub const fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    /// Whether both coordinates are finite (neither `NaN` nor infinite).
    #[must_use]
    pub fn is_finite(&self) -> bool {
        self.lat.is_finite() && self.lng.is_finite()
    }
}

/// A user-drawn monitored area: a simple polygon over geographic
/// coordinates.
///
/// `vertices` is an open ring (first vertex is not repeated at the end,
/// at least 3 points, non-self-intersecting). `area` is the unsigned
/// geodesic area in square meters and is recomputed by the zone store
/// whenever the vertices change; it is never negative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Zone {
    /// Opaque zone identifier, unique within a session.
    pub id: String,
    /// Human-readable zone name.
    pub name: String,
    /// Open polygon ring (first != last, >= 3 points).
    pub vertices: Vec<LatLng>,
    /// Unsigned geodesic area in square meters.
    pub area: f64,
    /// Display color assigned from [`ZONE_COLOR_PALETTE`].
    pub color_tag: String,
}

/// Shared people count per zone, keyed by zone id.
///
/// Two writers feed this map: incremental zone-crossing events and full
/// Monte-Carlo re-estimation. An estimation result always supersedes the
/// incremental counts wholesale (full replace, never a merge).
pub type ZoneCounts = BTreeMap<String, u64>;

/// The persisted form of the shared count map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CountSnapshot {
    /// When the counts were captured.
    pub timestamp: DateTime<Utc>,
    /// People count per zone id.
    pub counts: ZoneCounts,
}

impl CountSnapshot {
    /// Captures a snapshot of `counts` stamped with the current time.
    #[must_use]
    pub fn now(counts: ZoneCounts) -> Self {
        Self {
            timestamp: Utc::now(),
            counts,
        }
    }
}

/// A rectangular sampling viewport in geographic coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewportBounds {
    /// South-west corner (minimum latitude and longitude).
    pub south_west: LatLng,
    /// North-east corner (maximum latitude and longitude).
    pub north_east: LatLng,
}

impl ViewportBounds {
    /// Creates bounds from the south-west and north-east corners.
    #[must_use]
    pub const fn new(south_west: LatLng, north_east: LatLng) -> Self {
        Self {
            south_west,
            north_east,
        }
    }

    /// Latitude span in degrees (zero or negative means degenerate bounds).
    #[must_use]
    pub fn lat_span(&self) -> f64 {
        self.north_east.lat - self.south_west.lat
    }

    /// Longitude span in degrees (zero or negative means degenerate bounds).
    #[must_use]
    pub fn lng_span(&self) -> f64 {
        self.north_east.lng - self.south_west.lng
    }

    /// Whether the bounds fail to enclose a usable sampling area.
    ///
    /// True for zero or negative spans and for any non-finite corner
    /// coordinate; a `NaN` span compares false against zero, so the
    /// corners are checked explicitly.
    #[must_use]
    pub fn is_degenerate(&self) -> bool {
        !self.south_west.is_finite()
            || !self.north_east.is_finite()
            || self.lat_span() <= 0.0
            || self.lng_span() <= 0.0
    }

    /// Whether `point` lies inside the bounds (edges inclusive).
    #[must_use]
    pub fn contains(&self, point: LatLng) -> bool {
        point.lat >= self.south_west.lat
            && point.lat <= self.north_east.lat
            && point.lng >= self.south_west.lng
            && point.lng <= self.north_east.lng
    }
}

/// Cross-process sync message: a full-state replacement broadcast.
///
/// Receivers must treat each message as authoritative and replace their
/// local projection entirely; there is no merging and no ordering guarantee
/// across processes (last broadcast wins).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SyncMessage {
    /// The full zone list changed.
    #[serde(rename = "zones-updated")]
    ZonesUpdated {
        /// The complete, ordered zone list.
        zones: Vec<Zone>,
    },
    /// The full count map changed.
    #[serde(rename = "counts-updated")]
    CountsUpdated {
        /// The complete count map.
        counts: ZoneCounts,
    },
}

/// Crowd-density risk classification for a zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskBand {
    /// Density below the low threshold.
    Low,
    /// Density at or above the low threshold, below the medium threshold.
    Medium,
    /// Density at or above the medium threshold.
    High,
}

impl RiskBand {
    /// The dashboard's display color for this band.
    #[must_use]
    pub const fn color(self) -> &'static str {
        match self {
            Self::Low => "#2ecc71",
            Self::Medium => "#f1c40f",
            Self::High => "#e74c3c",
        }
    }
}

impl std::fmt::Display for RiskBand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
        }
    }
}

/// Density thresholds (people per 100 m²) separating the risk bands.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskThresholds {
    /// Densities below this are [`RiskBand::Low`].
    pub low: f64,
    /// Densities below this (and at or above `low`) are [`RiskBand::Medium`].
    pub medium: f64,
}

impl Default for RiskThresholds {
    fn default() -> Self {
        Self {
            low: 0.5,
            medium: 1.0,
        }
    }
}

impl RiskThresholds {
    /// Classifies a density (people per 100 m²) into a risk band.
    #[must_use]
    pub fn classify(&self, density: f64) -> RiskBand {
        if density < self.low {
            RiskBand::Low
        } else if density < self.medium {
            RiskBand::Medium
        } else {
            RiskBand::High
        }
    }
}

/// Density normalization: people per 100 m².
///
/// Zones with a degenerate (non-positive) area report zero density rather
/// than dividing by zero.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn density_per_100m2(count: u64, area_m2: f64) -> f64 {
    if area_m2 <= 0.0 {
        return 0.0;
    }
    count as f64 / (area_m2 / 100.0)
}

/// Density at which the heat-overlay opacity saturates.
pub const RISK_DENSITY_MAX: f64 = 2.0;

/// Per-zone drawing instruction for the map layer.
///
/// The core derives fill color and opacity from density; the actual draw
/// call belongs to the rendering collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderDirective {
    /// The zone's polygon ring.
    pub vertices: Vec<LatLng>,
    /// Fill color hex string from the zone's risk band.
    pub fill_color: String,
    /// Fill opacity in `[0.12, 0.7]`, scaled by density.
    pub fill_opacity: f64,
}

impl RenderDirective {
    /// Derives the directive for `zone` given its current people count.
    #[must_use]
    pub fn for_zone(zone: &Zone, count: u64, thresholds: &RiskThresholds) -> Self {
        let density = density_per_100m2(count, zone.area);
        let band = thresholds.classify(density);
        let opacity = (density / RISK_DENSITY_MAX * 0.7).clamp(0.12, 0.7);
        Self {
            vertices: zone.vertices.clone(),
            fill_color: band.color().to_string(),
            fill_opacity: opacity,
        }
    }
}

/// Zone display colors, assigned round-robin by creation index.
pub const ZONE_COLOR_PALETTE: [&str; 6] = [
    "#F44336", "#2196F3", "#4CAF50", "#FFC107", "#9C27B0", "#FF5722",
];

/// Returns the palette color for the `index`-th created zone.
#[must_use]
pub const fn palette_color(index: usize) -> &'static str {
    ZONE_COLOR_PALETTE[index % ZONE_COLOR_PALETTE.len()]
}

/// Default viewport center, the venue the dashboard ships configured for.
/// Simulated crowds and demo zones spawn around this point unless told
/// otherwise.
pub const DEFAULT_MAP_CENTER: LatLng = LatLng::new(13.6288, 79.4192);
