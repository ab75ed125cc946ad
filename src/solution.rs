// Per-candidate solutions
//
// A candidate may hold several peaks from the same station. A solution keeps
// one peak per station, evaluates timing residuals against a trial source and
// scores itself so candidates can be tried best first.

use std::collections::HashMap;

use tracing::debug;

use crate::constants::RMS_TIMING_NS;
use crate::correlate::{Candidate, PeakRecord};
use crate::propagation::{Located, PropagationModel, TrialLocation};
use crate::station::{Station, StationRegistry};

/// One peak per station from a candidate, with a trial source and its score.
#[derive(Debug, Clone)]
pub struct Solution {
    pub peaks: Vec<PeakRecord>,
    /// Station of each entry in `peaks`
    pub stations: Vec<Station>,
    pub trial_ns: f64,
    pub trial: TrialLocation,
    /// Residuals at the trial source (ns)
    pub residuals: Vec<f64>,
    pub quality: f64,
}

impl Solution {
    pub fn len(&self) -> usize {
        self.peaks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peaks.is_empty()
    }

    /// Observed minus expected arrival time at every station (ns).
    pub fn residuals_at(&self, model: &dyn PropagationModel, time_ns: f64, source: &dyn Located) -> Vec<f64> {
        self.peaks
            .iter()
            .zip(&self.stations)
            .map(|(peak, station)| peak.arrival_ns - (time_ns + model.travel_time_ns(source, station)))
            .collect()
    }

    /// Station ids in selection order.
    pub fn station_ids(&self) -> String {
        self.peaks.iter().map(|p| p.station).collect()
    }
}

/// Keeps the first peak, then the strongest peak of every other station.
///
/// Equal powers keep the earlier peak. The first peak's station is never
/// represented twice.
pub fn select_peaks(peaks: &[PeakRecord]) -> Vec<PeakRecord> {
    let Some((first, rest)) = peaks.split_first() else {
        return Vec::new();
    };

    let mut selected = vec![*first];
    let mut slots: HashMap<char, usize> = HashMap::new();
    for peak in rest.iter().filter(|p| p.station != first.station) {
        match slots.get(&peak.station) {
            Some(&slot) => {
                if peak.power_dbm > selected[slot].power_dbm {
                    selected[slot] = *peak;
                }
            }
            None => {
                slots.insert(peak.station, selected.len());
                selected.push(*peak);
            }
        }
    }
    selected
}

/// Ranking score: station count over the 5th smallest absolute residual,
/// scaled by the expected timing error.
///
/// With fewer than five residuals twice the largest one stands in for the
/// 5th smallest.
pub fn quality(residuals: &[f64]) -> f64 {
    if residuals.is_empty() {
        return 0.0;
    }
    let mut abs: Vec<f64> = residuals.iter().map(|r| r.abs()).collect();
    abs.sort_by(f64::total_cmp);
    let r5 = match abs.get(4) {
        Some(&r) => r,
        None => 2.0 * abs[abs.len() - 1],
    };
    residuals.len() as f64 / r5 * RMS_TIMING_NS
}

/// Builds ranked solutions for the candidates of one epoch.
pub struct SolutionBuilder<'a> {
    registry: &'a StationRegistry,
    model: &'a dyn PropagationModel,
}

impl<'a> SolutionBuilder<'a> {
    pub fn new(registry: &'a StationRegistry, model: &'a dyn PropagationModel) -> Self {
        SolutionBuilder { registry, model }
    }

    /// Builds the solution for one candidate, starting at the phase center.
    ///
    /// Peaks from stations missing from the registry are dropped.
    pub fn build(&self, peaks: &[PeakRecord], center: TrialLocation) -> Solution {
        let (peaks, stations): (Vec<PeakRecord>, Vec<Station>) = select_peaks(peaks)
            .into_iter()
            .filter_map(|peak| self.registry.get(peak.station).map(|s| (peak, s.clone())))
            .unzip();

        let trial_ns = peaks.first().map_or(0.0, |p| p.source_ns);
        let mut solution = Solution {
            peaks,
            stations,
            trial_ns,
            trial: center,
            residuals: Vec::new(),
            quality: 0.0,
        };
        solution.residuals = solution.residuals_at(self.model, trial_ns, &center);
        solution.quality = quality(&solution.residuals);
        solution
    }

    /// Builds every candidate's solution, best quality first.
    pub fn build_all(&self, stream: &[PeakRecord], candidates: &[Candidate], center: TrialLocation) -> Vec<Solution> {
        let mut solutions: Vec<Solution> = candidates
            .iter()
            .map(|c| self.build(c.peaks(stream), center))
            .collect();
        solutions.sort_by(|a, b| b.quality.total_cmp(&a.quality));
        debug!("built {} solutions", solutions.len());
        solutions
    }
}
