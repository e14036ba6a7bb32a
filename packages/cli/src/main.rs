#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Headless FlowTrack binary.
//!
//! ```text
//! flowtrack zones
//! flowtrack create "North pen" --side 150
//! flowtrack rename <id> "South pen"
//! flowtrack delete <id>
//! flowtrack import zones.geojson
//! flowtrack export --out zones.geojson
//! flowtrack simulate --size 6 --duration 30
//! flowtrack estimate --population 25000 --csv crowd_report.csv
//! flowtrack report
//! flowtrack demo
//! ```
//!
//! State persists under `--data-dir`. Engines in one process sharing a
//! `--topic` converge over the in-process broadcast; separate processes
//! pointed at the same `--data-dir` converge when run with
//! `--storage-watch`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use flowtrack_engine::{CrowdEngine, CrowdSnapshot, EngineOptions};
use flowtrack_geometry::square_ring;
use flowtrack_occupancy::sim::CrowdConfig;
use flowtrack_report::DEFAULT_REPORT_FILE;
use flowtrack_storage::{FileStore, KeyValueStore};
use flowtrack_sync::{DEFAULT_TOPIC, SyncOptions, TransportPreference};
use flowtrack_zones::interchange::{zones_from_geojson, zones_to_geojson};
use flowtrack_zones_models::{DEFAULT_MAP_CENTER, LatLng};

/// Where the zone and count slots live when `--data-dir` is not given.
const DEFAULT_DATA_DIR: &str = "flowtrack-data";

#[derive(Parser)]
#[command(
    name = "flowtrack",
    about = "Crowd-safety zones, live occupancy, and density estimation"
)]
struct Cli {
    /// Directory holding the persisted zone and count slots
    #[arg(long, default_value = DEFAULT_DATA_DIR)]
    data_dir: PathBuf,
    /// Sync topic shared by engines in this process
    #[arg(long, default_value = DEFAULT_TOPIC)]
    topic: String,
    /// Sync through storage polling instead of the in-process topic,
    /// so separate processes sharing --data-dir converge
    #[arg(long)]
    storage_watch: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List zones with their live counts, densities, and risk bands
    Zones,
    /// Create a square zone centered on a point
    Create {
        /// Zone name
        name: String,
        /// Center as "lat,lng" (defaults to the venue center)
        #[arg(long)]
        center: Option<String>,
        /// Side length in meters
        #[arg(long, default_value = "200")]
        side: f64,
    },
    /// Rename a zone
    Rename {
        /// Zone id (see `flowtrack zones`)
        id: String,
        /// New name
        name: String,
    },
    /// Delete a zone and drop its count entry
    Delete {
        /// Zone id
        id: String,
    },
    /// Import zones from a GeoJSON `FeatureCollection`
    Import {
        /// Path to the GeoJSON file
        file: PathBuf,
        /// Feature property holding the zone name
        #[arg(long, default_value = "name")]
        name_property: String,
    },
    /// Export the zone catalog as GeoJSON
    Export {
        /// Output path (stdout when omitted)
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Walk a simulated crowd through the zones for a while
    Simulate {
        /// Number of simulated attendees
        #[arg(long, default_value = "6")]
        size: usize,
        /// Seconds to run
        #[arg(long, default_value = "30")]
        duration: u64,
        /// Spawn cluster center as "lat,lng"
        #[arg(long)]
        center: Option<String>,
    },
    /// Distribute an expected crowd over the zones by viewport sampling
    Estimate {
        /// Crowd size to distribute
        #[arg(long, default_value = "25000")]
        population: u64,
        /// Also write the resulting standing as a CSV report
        #[arg(long)]
        csv: Option<PathBuf>,
    },
    /// Write the current standing as a CSV crowd report
    Report {
        /// Output path
        #[arg(long, default_value = DEFAULT_REPORT_FILE)]
        out: PathBuf,
    },
    /// Seed demo zones, simulate a crowd, estimate, and write a report
    Demo,
}

#[allow(clippy::too_many_lines)]
#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    pretty_env_logger::init();
    let cli = Cli::parse();

    let storage: Arc<dyn KeyValueStore> = Arc::new(FileStore::open(&cli.data_dir)?);
    let preference = if cli.storage_watch {
        TransportPreference::StorageWatch
    } else {
        TransportPreference::Auto
    };
    let mut options = EngineOptions {
        sync: SyncOptions {
            topic: cli.topic,
            preference,
            ..SyncOptions::default()
        },
        ..EngineOptions::default()
    };
    if let Commands::Estimate { population, .. } = &cli.command {
        options.estimate.total_population = *population;
    }
    let mut engine = CrowdEngine::open(storage, options)?;

    match cli.command {
        Commands::Zones => print_snapshot(&engine.snapshot()),
        Commands::Create { name, center, side } => {
            let center = parse_center(center.as_deref())?;
            let zone = engine.create_zone(&name, square_ring(center, side))?;
            println!(
                "Created zone {} ({:.2} m2): {}",
                zone.id, zone.area, zone.name
            );
        }
        Commands::Rename { id, name } => {
            if engine.rename_zone(&id, &name)? {
                println!("Renamed zone {id} to {name}");
            } else {
                eprintln!("Zone not found: {id}");
                std::process::exit(1);
            }
        }
        Commands::Delete { id } => {
            if let Some(zone) = engine.delete_zone(&id)? {
                println!("Deleted zone {}: {}", zone.id, zone.name);
            } else {
                eprintln!("Zone not found: {id}");
                std::process::exit(1);
            }
        }
        Commands::Import {
            file,
            name_property,
        } => {
            let raw = std::fs::read_to_string(&file)?;
            let zones = zones_from_geojson(&raw, &name_property)?;
            let added = engine.import_zones(zones)?;
            println!("Imported {added} zone(s) from {}", file.display());
        }
        Commands::Export { out } => {
            let zones = engine.zones();
            let json = zones_to_geojson(&zones);
            match out {
                Some(path) => {
                    std::fs::write(&path, &json)?;
                    println!("Exported {} zone(s) to {}", zones.len(), path.display());
                }
                None => println!("{json}"),
            }
        }
        Commands::Simulate {
            size,
            duration,
            center,
        } => {
            if engine.zones().is_empty() {
                eprintln!("No zones defined; create or import some first.");
                std::process::exit(1);
            }
            let center = parse_center(center.as_deref())?;
            engine.spawn_crowd(CrowdConfig {
                size,
                center,
                ..CrowdConfig::default()
            });
            println!("Simulating {size} attendee(s) for {duration}s...");
            tokio::time::sleep(Duration::from_secs(duration)).await;
            engine.stop_crowds();
            print_snapshot(&engine.snapshot());
        }
        Commands::Estimate { population, csv } => {
            run_estimate(&mut engine).await?;
            println!("Estimated standing for a crowd of {population}:");
            let snapshot = engine.snapshot();
            print_snapshot(&snapshot);
            if let Some(path) = csv {
                flowtrack_report::write_csv_file(&snapshot, &path)?;
                println!("\nWrote {}", path.display());
            }
        }
        Commands::Report { out } => {
            flowtrack_report::write_csv_file(&engine.snapshot(), &out)?;
            println!("Wrote {}", out.display());
        }
        Commands::Demo => {
            if engine.zones().is_empty() {
                engine.create_zone("Stage pit", square_ring(DEFAULT_MAP_CENTER, 120.0))?;
                let offset = LatLng::new(DEFAULT_MAP_CENTER.lat + 0.003, DEFAULT_MAP_CENTER.lng);
                engine.create_zone("Food court", square_ring(offset, 180.0))?;
                engine.create_zone("Grounds", square_ring(DEFAULT_MAP_CENTER, 1_200.0))?;
                println!("Seeded {} demo zones", engine.zones().len());
            }

            engine.spawn_crowd(CrowdConfig {
                size: 6,
                ..CrowdConfig::default()
            });
            println!("Walking 6 simulated attendees for 10s...");
            tokio::time::sleep(Duration::from_secs(10)).await;
            engine.stop_crowds();
            print_snapshot(&engine.snapshot());

            run_estimate(&mut engine).await?;
            println!("\nAfter estimating a crowd of 25,000:");
            let snapshot = engine.snapshot();
            print_snapshot(&snapshot);
            flowtrack_report::write_csv_file(&snapshot, Path::new(DEFAULT_REPORT_FILE))?;
            println!("\nWrote {DEFAULT_REPORT_FILE}");
        }
    }

    engine.shutdown();
    Ok(())
}

/// Runs one estimation over the bounding box of every stored zone, the
/// headless stand-in for a map's visible bounds.
async fn run_estimate(engine: &mut CrowdEngine) -> Result<(), Box<dyn std::error::Error>> {
    let extent = engine
        .zone_extent()
        .ok_or("No zones defined; create or import some first.")?;
    engine.set_viewport(extent);
    let estimate = engine.estimate().await?;
    println!(
        "Distributed the crowd using {} sample hit(s)",
        estimate.samples_inside
    );
    Ok(())
}

/// Parses `"lat,lng"`, defaulting to the venue center when absent.
/// Rejects non-finite coordinates ("nan", "inf", overflowing literals)
/// before they reach the store or the sampler.
fn parse_center(raw: Option<&str>) -> Result<LatLng, Box<dyn std::error::Error>> {
    let Some(raw) = raw else {
        return Ok(DEFAULT_MAP_CENTER);
    };
    let (lat, lng) = raw
        .split_once(',')
        .ok_or_else(|| format!("Expected \"lat,lng\", got: {raw}"))?;
    let center = LatLng::new(lat.trim().parse()?, lng.trim().parse()?);
    if !center.is_finite() {
        return Err(format!("Coordinates must be finite, got: {raw}").into());
    }
    Ok(center)
}

fn print_snapshot(snapshot: &CrowdSnapshot) {
    if snapshot.zones.is_empty() {
        println!("No zones defined.");
        return;
    }

    println!(
        "{:<42} {:>12} {:>7} {:>9} {:<7} NAME",
        "ID", "AREA M2", "COUNT", "DENSITY", "RISK"
    );
    println!("{}", "-".repeat(100));
    for status in &snapshot.zones {
        println!(
            "{:<42} {:>12.2} {:>7} {:>9.3} {:<7} {}",
            status.zone.id,
            status.zone.area,
            status.count,
            status.density,
            status.risk,
            status.zone.name
        );
    }
    println!("\n{} zone(s)", snapshot.zones.len());
}
