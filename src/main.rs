// LMA source locator - main entry point

use std::collections::{BTreeMap, BTreeSet};

use clap::Parser;
use tracing::{error, info, warn};

use lma_locate::config::Config;
use lma_locate::geodesy::Geodetic;
use lma_locate::locate::locate_epoch;
use lma_locate::LmaError;
use lma_locate::output::{CsvOutput, JsonOutput, OutputHandler};
use lma_locate::propagation::LineOfSight;
use lma_locate::station::{Station, StationRegistry};
use lma_locate::station_file::{Frame, StationFile};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::parse();
    init_logging(config.verbose);

    let mut registry = match &config.locations {
        Some(path) => StationRegistry::load(path)?,
        None => StationRegistry::new(),
    };

    let mut stations = open_stations(&config);
    if stations.is_empty() {
        return Err("no readable station files".into());
    }

    let mut outputs: Vec<Box<dyn OutputHandler>> = Vec::new();
    for path in &config.write_csv {
        outputs.push(Box::new(CsvOutput::create(path)?));
        info!("Writing CSV to {}", path.display());
    }
    for path in &config.write_json {
        outputs.push(Box::new(JsonOutput::create(path)?));
        info!("Writing JSON to {}", path.display());
    }
    if outputs.is_empty() {
        warn!("No outputs specified! Use --write-csv or --write-json");
    }

    let epochs: BTreeSet<i64> = stations.iter().flat_map(|s| s.epochs()).collect();
    let (Some(start), Some(end)) = (epochs.first(), epochs.last()) else {
        warn!("no dated frames in any file");
        return Ok(());
    };
    info!(
        "Locating {} epochs ({} to {}) from {} files",
        epochs.len(),
        start,
        end,
        stations.len()
    );

    let model = LineOfSight::new();
    let locate_config = config.locate_config();
    let mut total = 0;

    for &epoch in &epochs {
        let frames = gather_frames(&mut stations, epoch, config.thin_ns)?;
        if frames.len() <= locate_config.min_stations {
            continue;
        }
        let Some(center) = config.center.or_else(|| phase_center(&registry, &frames)) else {
            warn!("epoch {}: no phase center, no station positions known", epoch);
            continue;
        };

        match locate_epoch(epoch, &frames, &mut registry, &model, center, &locate_config) {
            Ok(result) => {
                for fix in &result.fixes {
                    for output in outputs.iter_mut() {
                        output.handle_fix(fix);
                    }
                }
                total += result.fixes.len();
            }
            Err(e) if e.is_format() => error!("epoch {}: {}", epoch, e),
            Err(e) => return Err(e.into()),
        }
    }

    for output in outputs.iter_mut() {
        output.flush();
    }
    info!("Located {} sources", total);

    if let Some(path) = &config.save_locations {
        registry.save(path)?;
        info!("Saved {} stations to {}", registry.len(), path.display());
    }
    Ok(())
}

fn open_stations(config: &Config) -> Vec<StationFile> {
    let mode = config.capture_mode();
    config
        .files
        .iter()
        .filter_map(|path| match StationFile::open(path, mode) {
            Ok(station) => {
                info!(
                    "{}: v{}, {} frames from epoch {:?}",
                    path.display(),
                    station.version(),
                    station.frame_count(),
                    station.start_epoch()
                );
                Some(station)
            }
            Err(e) => {
                error!("Skipping {}: {}", path.display(), e);
                None
            }
        })
        .collect()
}

/// Reads every station's frame for `epoch`. Malformed frames are skipped.
fn gather_frames(
    stations: &mut [StationFile],
    epoch: i64,
    thin_ns: Option<f64>,
) -> Result<BTreeMap<char, Frame>, LmaError> {
    let mut frames = BTreeMap::new();
    for station in stations.iter_mut() {
        let Some(index) = station.frame_for_epoch(epoch) else {
            continue;
        };
        let mut frame = match station.read_frame(index) {
            Ok(frame) => frame,
            Err(e) if e.is_format() => {
                warn!("epoch {}: skipping frame {}: {}", epoch, index, e);
                continue;
            }
            Err(e) => return Err(e),
        };
        if frame.packets.is_empty() {
            continue;
        }
        if let Some(window) = thin_ns {
            frame.decimate(window);
        }
        frames.entry(frame.station_id).or_insert(frame);
    }
    Ok(frames)
}

/// Centroid of the known stations and of stations placed only by their frames.
fn phase_center(registry: &StationRegistry, frames: &BTreeMap<char, Frame>) -> Option<Geodetic> {
    let mut known = registry.clone();
    for (&id, frame) in frames {
        match frame.location {
            Some(location) if known.get(id).is_none() => {
                known.insert(Station::new(id, location));
            }
            _ => {}
        }
    }
    known.centroid()
}

/// Initialize logging based on verbosity level
fn init_logging(verbose: bool) {
    let subscriber = tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(false)
        .with_level(true);

    if verbose {
        subscriber
            .with_max_level(tracing::Level::DEBUG)
            .init();
        info!("Verbose logging enabled (DEBUG level)");
    } else {
        subscriber
            .with_max_level(tracing::Level::INFO)
            .init();
    }
}
