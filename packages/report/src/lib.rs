#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! CSV crowd report derived from an engine snapshot.
//!
//! The engine already computes every per-zone figure; this crate only
//! formats a [`CrowdSnapshot`] into the dashboard's downloadable
//! report, so the numbers here can never drift from what the engine
//! shows.

use std::fs::File;
use std::io::{self, Write};
use std::path::Path;

use flowtrack_engine::CrowdSnapshot;
use thiserror::Error;

/// Default file name for an exported crowd report.
pub const DEFAULT_REPORT_FILE: &str = "crowd_report.csv";

/// Column headers, in row order. Area is square meters, density is
/// people per 100 m².
const HEADER: [&str; 5] = ["ZoneId", "ZoneName", "Count", "AreaM2", "Density"];

/// Errors that can occur while writing a report.
#[derive(Debug, Error)]
pub enum ReportError {
    /// CSV serialization failed.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// An I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Writes `snapshot` as CSV: one row per zone, in the snapshot's zone
/// order, with the count, area in m² (2 decimals), and density in
/// people per 100 m² (3 decimals). Fields are quoted only when they
/// need to be.
///
/// # Errors
///
/// * [`ReportError::Csv`] if a record cannot be serialized.
/// * [`ReportError::Io`] if flushing to `writer` fails.
pub fn write_csv<W: Write>(snapshot: &CrowdSnapshot, writer: W) -> Result<(), ReportError> {
    let mut csv_writer = csv::Writer::from_writer(writer);
    csv_writer.write_record(HEADER)?;
    for status in &snapshot.zones {
        let count = status.count.to_string();
        let area = format!("{:.2}", status.zone.area);
        let density = format!("{:.3}", status.density);
        csv_writer.write_record([
            status.zone.id.as_str(),
            status.zone.name.as_str(),
            count.as_str(),
            area.as_str(),
            density.as_str(),
        ])?;
    }
    csv_writer.flush()?;
    Ok(())
}

/// Writes the report to `path`, creating or truncating the file.
///
/// # Errors
///
/// * [`ReportError::Io`] if the file cannot be created or written.
/// * [`ReportError::Csv`] if a record cannot be serialized.
pub fn write_csv_file(snapshot: &CrowdSnapshot, path: &Path) -> Result<(), ReportError> {
    let file = File::create(path)?;
    write_csv(snapshot, file)
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use flowtrack_engine::ZoneStatus;
    use flowtrack_zones_models::{LatLng, RiskBand, Zone};

    use super::*;

    fn status(id: &str, name: &str, count: u64, area: f64) -> ZoneStatus {
        let density = f64::from(u32::try_from(count).unwrap()) / (area / 100.0);
        ZoneStatus {
            zone: Zone {
                id: id.to_string(),
                name: name.to_string(),
                vertices: vec![
                    LatLng::new(13.628, 79.419),
                    LatLng::new(13.629, 79.419),
                    LatLng::new(13.629, 79.420),
                ],
                area,
                color_tag: "#3498db".to_string(),
            },
            count,
            density,
            risk: RiskBand::Low,
        }
    }

    fn render(snapshot: &CrowdSnapshot) -> String {
        let mut buffer = Vec::new();
        write_csv(snapshot, &mut buffer).unwrap();
        String::from_utf8(buffer).unwrap()
    }

    #[test]
    fn report_matches_the_published_column_contract() {
        let snapshot = CrowdSnapshot {
            timestamp: Utc::now(),
            zones: vec![
                status("zone-a", "North pen", 12, 2_500.0),
                status("zone-b", "South pen", 0, 900.0),
            ],
        };

        assert_eq!(
            render(&snapshot),
            "ZoneId,ZoneName,Count,AreaM2,Density\n\
             zone-a,North pen,12,2500.00,0.480\n\
             zone-b,South pen,0,900.00,0.000\n"
        );
    }

    #[test]
    fn names_containing_commas_are_quoted() {
        let snapshot = CrowdSnapshot {
            timestamp: Utc::now(),
            zones: vec![status("zone-a", "Pit, east side", 3, 900.0)],
        };

        assert_eq!(
            render(&snapshot),
            "ZoneId,ZoneName,Count,AreaM2,Density\n\
             zone-a,\"Pit, east side\",3,900.00,0.333\n"
        );
    }

    #[test]
    fn an_empty_snapshot_still_carries_the_header() {
        let snapshot = CrowdSnapshot {
            timestamp: Utc::now(),
            zones: Vec::new(),
        };

        assert_eq!(render(&snapshot), "ZoneId,ZoneName,Count,AreaM2,Density\n");
    }

    #[test]
    fn report_file_lands_on_disk() {
        let dir = std::env::temp_dir().join("flowtrack_report_file");
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(DEFAULT_REPORT_FILE);

        let snapshot = CrowdSnapshot {
            timestamp: Utc::now(),
            zones: vec![status("zone-a", "North pen", 5, 1_000.0)],
        };
        write_csv_file(&snapshot, &path).unwrap();

        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.starts_with("ZoneId,ZoneName,Count,AreaM2,Density\n"));
        assert!(written.contains("zone-a,North pen,5,1000.00,0.500\n"));

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
