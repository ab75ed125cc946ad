// Epoch locator
//
// Ties one epoch together: correlate the stations' frames, build and rank a
// solution per candidate, fit each one and keep the fixes that pass the
// acceptance gate.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

use crate::constants::{
    DEFAULT_MIN_STATIONS, DEFAULT_WINDOW_NS, MAX_FIX_DISPLACEMENT_M, MAX_FIX_RMS_NS, SOLVER_MAX_ITERATIONS,
};
use crate::correlate::CorrelationEngine;
use crate::error::{LmaError, Result};
use crate::geodesy::{vincenty, Cartesian, Geodetic};
use crate::propagation::{Located, PropagationModel, TrialLocation};
use crate::solution::{Solution, SolutionBuilder};
use crate::solver::{self, PARAMS};
use crate::station::{ReconciliationWarning, StationRegistry};
use crate::station_file::Frame;

/// Tunables for correlation and the acceptance gate.
#[derive(Debug, Clone, PartialEq)]
pub struct LocateConfig {
    /// Largest gap between neighbouring peaks of a candidate (ns)
    pub window_ns: f64,
    /// Candidates need more distinct stations than this
    pub min_stations: usize,
    /// Fixes must stay closer than this to the phase center (m)
    pub max_displacement_m: f64,
    /// Fixes must have a smaller RMS residual than this (ns)
    pub max_rms_ns: f64,
    pub max_iterations: usize,
}

impl Default for LocateConfig {
    fn default() -> Self {
        LocateConfig {
            window_ns: DEFAULT_WINDOW_NS,
            min_stations: DEFAULT_MIN_STATIONS,
            max_displacement_m: MAX_FIX_DISPLACEMENT_M,
            max_rms_ns: MAX_FIX_RMS_NS,
            max_iterations: SOLVER_MAX_ITERATIONS,
        }
    }
}

/// An accepted source location.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Fix {
    pub epoch: i64,
    /// Source time in ns into the epoch second
    pub time_ns: f64,
    pub lat: f64,
    pub lon: f64,
    pub alt_m: f64,
    pub rms_ns: f64,
    pub stations: usize,
    pub quality: f64,
    pub station_ids: String,
    #[serde(skip)]
    pub position: Cartesian,
}

impl Fix {
    /// UTC time of the source, if the epoch is representable.
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        let secs = self.epoch + (self.time_ns / 1e9).floor() as i64;
        let nanos = self.time_ns.rem_euclid(1e9) as u32;
        DateTime::from_timestamp(secs, nanos)
    }
}

impl Located for Fix {
    fn cartesian(&self) -> Cartesian {
        self.position
    }

    fn geodetic(&self) -> Geodetic {
        Geodetic::new(self.lat, self.lon, self.alt_m)
    }
}

/// Why a solution did not become a fix.
#[derive(Debug, Clone, PartialEq)]
pub enum RejectReason {
    TooFewStations(usize),
    NotConverged,
    /// Fix moved this far from its starting point (m)
    Displacement(f64),
    /// RMS residual of the fit (ns)
    Rms(f64),
    GeodesicOutOfRange,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::TooFewStations(n) => write!(f, "only {} stations", n),
            RejectReason::NotConverged => write!(f, "solver did not converge"),
            RejectReason::Displacement(d) => write!(f, "moved {:.0} m from the initial guess", d),
            RejectReason::Rms(rms) => write!(f, "rms {:.0} ns", rms),
            RejectReason::GeodesicOutOfRange => write!(f, "displacement could not be evaluated"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FitOutcome {
    Accepted(Fix),
    Rejected(RejectReason),
}

/// Result of locating one epoch.
#[derive(Debug, Clone, Default)]
pub struct EpochResult {
    pub epoch: i64,
    pub candidates: usize,
    pub fixes: Vec<Fix>,
    pub rejected: Vec<RejectReason>,
    pub warnings: Vec<ReconciliationWarning>,
}

/// Fits one solution and applies the acceptance gate.
///
/// # Returns
/// * `Ok(FitOutcome::Accepted)` for a fix that passed the gate
/// * `Ok(FitOutcome::Rejected)` for expected failures
/// * `Err(LmaError::Solver)` if the model produced non-finite residuals
pub fn fit_solution(
    solution: &Solution,
    model: &dyn PropagationModel,
    epoch: i64,
    config: &LocateConfig,
) -> Result<FitOutcome> {
    if solution.len() < PARAMS {
        return Ok(FitOutcome::Rejected(RejectReason::TooFewStations(solution.len())));
    }

    let start = solution.trial.position;
    let fit = solver::solve_with_limit(
        |p: &[f64; PARAMS]| solution.residuals_at(model, p[0], &Cartesian::new(p[1], p[2], p[3])),
        [solution.trial_ns, start.x, start.y, start.z],
        config.max_iterations,
    )?;
    if !fit.success {
        return Ok(FitOutcome::Rejected(RejectReason::NotConverged));
    }

    let (x, y, z) = fit.position();
    let position = Cartesian::new(x, y, z);
    let geodetic = position.to_geodetic();
    let initial = solution.trial.geodetic();

    let displacement = match vincenty(initial.lat, initial.lon, geodetic.lat, geodetic.lon) {
        Ok(d) => d,
        Err(LmaError::GeodesicOutOfRange) => {
            return Ok(FitOutcome::Rejected(RejectReason::GeodesicOutOfRange));
        }
        Err(e) => return Err(e),
    };
    if displacement >= config.max_displacement_m {
        return Ok(FitOutcome::Rejected(RejectReason::Displacement(displacement)));
    }
    if fit.rms_ns >= config.max_rms_ns {
        return Ok(FitOutcome::Rejected(RejectReason::Rms(fit.rms_ns)));
    }

    Ok(FitOutcome::Accepted(Fix {
        epoch,
        time_ns: fit.time_ns(),
        lat: geodetic.lat,
        lon: geodetic.lon,
        alt_m: geodetic.alt,
        rms_ns: fit.rms_ns,
        stations: solution.len(),
        quality: solution.quality,
        station_ids: solution.station_ids(),
        position,
    }))
}

/// Locates every candidate source in one epoch.
///
/// # Arguments
/// * `epoch` - Epoch second the frames belong to
/// * `frames` - Station id -> that station's frame for the epoch
/// * `registry` - Station positions, updated from the frames' GPS positions
/// * `model` - Propagation model
/// * `center` - Phase center used to align stations and start each fit
/// * `config` - Correlation and gate settings
pub fn locate_epoch(
    epoch: i64,
    frames: &BTreeMap<char, Frame>,
    registry: &mut StationRegistry,
    model: &dyn PropagationModel,
    center: Geodetic,
    config: &LocateConfig,
) -> Result<EpochResult> {
    let center = TrialLocation::from_geodetic(center);
    let engine = CorrelationEngine::new(center, model, config.window_ns, config.min_stations);
    let correlation = engine.correlate(frames, registry);

    let solutions = SolutionBuilder::new(registry, model).build_all(
        &correlation.peaks,
        &correlation.candidates,
        center,
    );

    let mut result = EpochResult {
        epoch,
        candidates: correlation.candidates.len(),
        warnings: correlation.warnings,
        ..Default::default()
    };
    for solution in &solutions {
        match fit_solution(solution, model, epoch, config)? {
            FitOutcome::Accepted(fix) => result.fixes.push(fix),
            FitOutcome::Rejected(reason) => {
                debug!(epoch, stations = %solution.station_ids(), "rejected fit: {}", reason);
                result.rejected.push(reason);
            }
        }
    }

    info!(
        "epoch {}: {} stations, {} candidates, {} fixes, {} rejected",
        epoch,
        frames.len(),
        result.candidates,
        result.fixes.len(),
        result.rejected.len()
    );
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::C_NS;
    use crate::correlate::PeakRecord;
    use crate::propagation::LineOfSight;
    use crate::raw::DataPacket;
    use crate::station::Station;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    const EPOCH: i64 = 1_686_776_851;
    const SOURCE_NS: f64 = 400_000.0;

    fn stations() -> Vec<Station> {
        [
            ('A', 34.00, -107.00, 1800.0),
            ('B', 34.15, -107.00, 2400.0),
            ('C', 33.88, -107.10, 1500.0),
            ('D', 34.05, -106.82, 3200.0),
            ('E', 33.95, -107.18, 2100.0),
            ('F', 34.10, -107.15, 2700.0),
        ]
        .iter()
        .map(|&(id, lat, lon, alt)| Station::new(id, Geodetic::new(lat, lon, alt)))
        .collect()
    }

    fn center() -> Geodetic {
        Geodetic::new(34.0, -107.0, 3000.0)
    }

    fn source() -> Geodetic {
        Geodetic::new(34.03, -107.02, 6000.0)
    }

    fn packet(arrival_ns: f64, power_dbm: f64) -> DataPacket {
        DataPacket {
            window: (arrival_ns / 80_000.0) as u32,
            ticks: 0,
            above_threshold: 2,
            max_amplitude: 0,
            arrival_ns,
            power_dbm,
        }
    }

    /// Frames hearing `source` at every station, plus some clutter.
    fn frames(noise: &mut dyn FnMut() -> f64) -> BTreeMap<char, Frame> {
        let source = source().to_cartesian();
        stations()
            .into_iter()
            .map(|station| {
                let arrival = SOURCE_NS + source.distance(&station.cartesian) / C_NS + noise();
                let mut packets = vec![packet(arrival, -40.0)];
                match station.id {
                    // Lone peak far from everything else
                    'A' => packets.push(packet(900_000.0, -30.0)),
                    // Weaker echo inside the candidate
                    'B' => packets.push(packet(arrival + 2_000.0, -70.0)),
                    _ => {}
                }
                packets.sort_by(|a, b| a.arrival_ns.total_cmp(&b.arrival_ns));
                let frame = Frame {
                    station_id: station.id,
                    network_id: None,
                    version: 12,
                    phase_offset: 0,
                    epoch: Some(EPOCH),
                    location: Some(station.geodetic),
                    packets,
                };
                (station.id, frame)
            })
            .collect()
    }

    fn check_fix(fix: &Fix, max_error_m: f64) {
        let error = fix.position.distance(&source().to_cartesian());
        assert!(error < max_error_m, "Position error too large: {} meters", error);
        assert!(fix.rms_ns < 200.0, "rms {}", fix.rms_ns);
        assert_eq!(fix.stations, 6);
        assert_eq!(fix.epoch, EPOCH);
    }

    #[test]
    fn test_locate_exact_arrivals() {
        let mut registry = StationRegistry::new();
        let frames = frames(&mut || 0.0);
        let result =
            locate_epoch(EPOCH, &frames, &mut registry, &LineOfSight::new(), center(), &LocateConfig::default())
                .unwrap();

        assert_eq!(registry.len(), 6);
        assert_eq!(result.candidates, 1);
        assert_eq!(result.fixes.len(), 1);
        let fix = &result.fixes[0];
        check_fix(fix, 1.0);
        assert!((fix.time_ns - SOURCE_NS).abs() < 0.01);
        assert!((fix.alt_m - 6000.0).abs() < 1.0);
    }

    #[test]
    fn test_locate_noisy_arrivals() {
        let mut rng = StdRng::seed_from_u64(42);
        let frames = frames(&mut || rng.gen_range(-50.0..50.0));
        let mut registry = StationRegistry::new();
        for station in stations() {
            registry.insert(station);
        }

        let result =
            locate_epoch(EPOCH, &frames, &mut registry, &LineOfSight::new(), center(), &LocateConfig::default())
                .unwrap();
        assert!(result.warnings.is_empty());
        assert_eq!(result.fixes.len(), 1);
        check_fix(&result.fixes[0], 500.0);
    }

    fn solution_for(arrivals: &[f64]) -> Solution {
        let mut registry = StationRegistry::new();
        let peaks: Vec<PeakRecord> = stations()
            .into_iter()
            .zip(arrivals)
            .map(|(station, &arrival_ns)| {
                let peak = PeakRecord { source_ns: arrival_ns, station: station.id, arrival_ns, power_dbm: -50.0 };
                registry.insert(station);
                peak
            })
            .collect();
        let model = LineOfSight::new();
        SolutionBuilder::new(&registry, &model).build(&peaks, TrialLocation::from_geodetic(center()))
    }

    fn exact_arrivals() -> Vec<f64> {
        let source = source().to_cartesian();
        stations()
            .iter()
            .map(|s| SOURCE_NS + source.distance(&s.cartesian) / C_NS)
            .collect()
    }

    #[test]
    fn test_gate_rejects_high_rms() {
        let mut arrivals = exact_arrivals();
        arrivals[2] += 30_000.0;
        arrivals[4] -= 25_000.0;
        let solution = solution_for(&arrivals);
        let outcome = fit_solution(&solution, &LineOfSight::new(), EPOCH, &LocateConfig::default()).unwrap();
        assert!(matches!(outcome, FitOutcome::Rejected(RejectReason::Rms(rms)) if rms > 10_000.0), "{:?}", outcome);
    }

    #[test]
    fn test_gate_rejects_displacement() {
        let solution = solution_for(&exact_arrivals());
        let config = LocateConfig { max_displacement_m: 1_000.0, ..Default::default() };
        let outcome = fit_solution(&solution, &LineOfSight::new(), EPOCH, &config).unwrap();
        assert!(matches!(outcome, FitOutcome::Rejected(RejectReason::Displacement(d)) if d > 1_000.0));

        let config = LocateConfig { max_rms_ns: 0.0, ..Default::default() };
        let outcome = fit_solution(&solution, &LineOfSight::new(), EPOCH, &config).unwrap();
        assert!(matches!(outcome, FitOutcome::Rejected(RejectReason::Rms(_))));
    }

    #[test]
    fn test_too_few_stations() {
        let solution = solution_for(&exact_arrivals()[..3]);
        let outcome = fit_solution(&solution, &LineOfSight::new(), EPOCH, &LocateConfig::default()).unwrap();
        assert_eq!(outcome, FitOutcome::Rejected(RejectReason::TooFewStations(3)));
    }

    #[test]
    fn test_non_finite_model_is_an_error() {
        let solution = solution_for(&exact_arrivals());
        let broken = |_: &Cartesian, _: &Cartesian| f64::NAN;
        let err = fit_solution(&solution, &broken, EPOCH, &LocateConfig::default()).unwrap_err();
        assert!(matches!(err, LmaError::Solver(_)));
    }

    #[test]
    fn test_fix_timestamp() {
        let solution = solution_for(&exact_arrivals());
        let outcome = fit_solution(&solution, &LineOfSight::new(), EPOCH, &LocateConfig::default()).unwrap();
        let mut fix = match outcome {
            FitOutcome::Accepted(fix) => fix,
            other => panic!("expected a fix, got {:?}", other),
        };
        fix.time_ns = 250_000_000.0;
        let ts = fix.timestamp().unwrap();
        assert_eq!(ts.timestamp(), EPOCH);
        assert_eq!(ts.timestamp_subsec_nanos(), 250_000_000);
        assert_eq!(fix.geodetic().lat, fix.lat);
    }
}
