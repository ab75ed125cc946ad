// Cross-station peak correlation
//
// Merges one epoch's frames from every station into a single stream ordered
// by estimated source time, then finds runs of near-simultaneous peaks heard
// by enough distinct stations to be worth locating.

use std::collections::{BTreeMap, HashSet};
use std::ops::RangeInclusive;

use tracing::{debug, warn};

use crate::propagation::{Located, PropagationModel, TrialLocation};
use crate::station::{ReconciliationWarning, StationRegistry};
use crate::station_file::Frame;

/// One peak in the merged stream.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PeakRecord {
    /// Arrival time moved back to the phase center (ns)
    pub source_ns: f64,
    pub station: char,
    /// Arrival time corrected by the station delay (ns)
    pub arrival_ns: f64,
    pub power_dbm: f64,
}

/// Inclusive index range into the merged stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    pub start: usize,
    pub end: usize,
}

impl Candidate {
    pub fn len(&self) -> usize {
        self.end - self.start + 1
    }

    pub fn range(&self) -> RangeInclusive<usize> {
        self.start..=self.end
    }

    pub fn peaks<'a>(&self, stream: &'a [PeakRecord]) -> &'a [PeakRecord] {
        &stream[self.range()]
    }
}

/// Everything correlation produced for one epoch.
#[derive(Debug, Clone, Default)]
pub struct Correlation {
    pub peaks: Vec<PeakRecord>,
    pub candidates: Vec<Candidate>,
    pub warnings: Vec<ReconciliationWarning>,
}

/// Per-epoch correlation settings.
pub struct CorrelationEngine<'a> {
    pub center: TrialLocation,
    pub model: &'a dyn PropagationModel,
    pub window_ns: f64,
    pub min_stations: usize,
}

impl<'a> CorrelationEngine<'a> {
    pub fn new(
        center: TrialLocation,
        model: &'a dyn PropagationModel,
        window_ns: f64,
        min_stations: usize,
    ) -> Self {
        CorrelationEngine { center, model, window_ns, min_stations }
    }

    /// Reconciles positions, merges the frames and clusters the result.
    pub fn correlate(
        &self,
        frames: &BTreeMap<char, Frame>,
        registry: &mut StationRegistry,
    ) -> Correlation {
        let warnings = reconcile_stations(frames, registry);
        let peaks = merge_peaks(frames, registry, self.model, &self.center);
        let candidates = find_candidates(&peaks, self.window_ns, self.min_stations);
        debug!(
            "correlated {} peaks from {} stations into {} candidates",
            peaks.len(),
            frames.len(),
            candidates.len()
        );
        Correlation { peaks, candidates, warnings }
    }
}

/// Checks each frame's reported position against the registry.
///
/// Stations the registry does not know yet are added. Stations that neither
/// the registry nor their own frame can place are logged and left out.
pub fn reconcile_stations(
    frames: &BTreeMap<char, Frame>,
    registry: &mut StationRegistry,
) -> Vec<ReconciliationWarning> {
    let mut warnings = Vec::new();
    for (&id, frame) in frames {
        match frame.location {
            Some(reported) => warnings.extend(registry.reconcile(id, reported)),
            None if registry.get(id).is_none() => {
                warn!(station = %id, "no known position, skipping {} peaks", frame.packets.len());
            }
            None => {}
        }
    }
    warnings
}

/// Builds the merged stream, sorted by estimated source time.
///
/// Frames of stations missing from the registry are skipped.
pub fn merge_peaks(
    frames: &BTreeMap<char, Frame>,
    registry: &StationRegistry,
    model: &dyn PropagationModel,
    center: &dyn Located,
) -> Vec<PeakRecord> {
    let total: usize = frames.values().map(|f| f.packets.len()).sum();
    let mut peaks = Vec::with_capacity(total);

    for (&id, frame) in frames {
        let Some(station) = registry.get(id) else {
            continue;
        };
        let travel_ns = model.travel_time_ns(center, station);
        peaks.extend(frame.packets.iter().map(|packet| {
            let arrival_ns = packet.arrival_ns - station.delay_ns;
            PeakRecord {
                source_ns: arrival_ns - travel_ns,
                station: id,
                arrival_ns,
                power_dbm: packet.power_dbm,
            }
        }));
    }

    peaks.sort_by(|a, b| a.source_ns.total_cmp(&b.source_ns));
    peaks
}

/// Finds runs of peaks whose successive gaps are all below `window_ns`.
///
/// A run becomes a candidate when it holds more than `min_stations` peaks
/// from more than `min_stations` distinct stations and starts after the end
/// of the previous candidate. The cursor moves one peak at a time.
///
/// # Arguments
/// * `peaks` - Merged stream, sorted by source time
/// * `window_ns` - Largest gap between neighbouring peaks of a run
/// * `min_stations` - Candidates need strictly more distinct stations than this
///
/// # Returns
/// Candidate ranges in stream order, never overlapping
pub fn find_candidates(peaks: &[PeakRecord], window_ns: f64, min_stations: usize) -> Vec<Candidate> {
    let mut candidates = Vec::new();
    let mut last_end: Option<usize> = None;
    let mut run_end = 0;
    let mut stations = HashSet::new();

    let mut i = 0;
    while i < peaks.len() {
        // A run started inside the previous one ends where that one did
        if run_end < i {
            run_end = i;
        }
        while run_end + 1 < peaks.len()
            && peaks[run_end + 1].source_ns - peaks[run_end].source_ns < window_ns
        {
            run_end += 1;
        }

        if last_end.map_or(true, |end| i > end) {
            let qualifies = run_end - i + 1 > min_stations && {
                stations.clear();
                stations.extend(peaks[i..=run_end].iter().map(|p| p.station));
                stations.len() > min_stations
            };
            if qualifies {
                candidates.push(Candidate { start: i, end: run_end });
                last_end = Some(run_end);
            } else {
                // Later starts in this run see a subset of its peaks and stations
                i = run_end + 1;
                continue;
            }
        }
        i += 1;
    }

    candidates
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geodesy::Geodetic;
    use crate::propagation::LineOfSight;
    use crate::raw::DataPacket;
    use crate::station::Station;

    const W: f64 = 80_000.0;
    const K: usize = 5;

    fn peak(source_ns: f64, station: char) -> PeakRecord {
        PeakRecord { source_ns, station, arrival_ns: source_ns, power_dbm: -60.0 }
    }

    /// One peak per station, `spacing` ns apart, starting at `t0`.
    fn group(t0: f64, spacing: f64, ids: &str) -> Vec<PeakRecord> {
        ids.chars()
            .enumerate()
            .map(|(i, id)| peak(t0 + i as f64 * spacing, id))
            .collect()
    }

    fn packet(arrival_ns: f64, power_dbm: f64) -> DataPacket {
        DataPacket {
            window: (arrival_ns / 80_000.0) as u32,
            ticks: 0,
            above_threshold: 1,
            max_amplitude: 0,
            arrival_ns,
            power_dbm,
        }
    }

    fn frame(id: char, location: Option<Geodetic>, packets: Vec<DataPacket>) -> Frame {
        Frame {
            station_id: id,
            network_id: None,
            version: 12,
            phase_offset: 0,
            epoch: Some(1_686_776_851),
            location,
            packets,
        }
    }

    #[test]
    fn test_single_group_single_candidate() {
        let peaks = group(1_000_000.0, 1_000.0, "ABCDEF");
        let candidates = find_candidates(&peaks, W, K);
        assert_eq!(candidates, vec![Candidate { start: 0, end: 5 }]);
        assert_eq!(candidates[0].len(), 6);
    }

    #[test]
    fn test_separated_groups_two_candidates() {
        let mut peaks = group(1_000_000.0, 1_000.0, "ABCDEF");
        peaks.extend(group(1_200_000.0, 1_000.0, "FEDCBAG"));
        let candidates = find_candidates(&peaks, W, K);
        assert_eq!(
            candidates,
            vec![Candidate { start: 0, end: 5 }, Candidate { start: 6, end: 12 }]
        );
    }

    #[test]
    fn test_too_few_stations() {
        // Five stations is not more than five
        let peaks = group(0.0, 1_000.0, "ABCDE");
        assert!(find_candidates(&peaks, W, K).is_empty());

        // Six peaks, but only five distinct stations
        let peaks = group(0.0, 1_000.0, "ABCDEA");
        assert!(find_candidates(&peaks, W, K).is_empty());
    }

    #[test]
    fn test_run_chains_through_gaps_below_window() {
        // Neighbours are 60 us apart, the run spans 300 us in total
        let peaks = group(0.0, 60_000.0, "ABCDEF");
        assert_eq!(find_candidates(&peaks, W, K), vec![Candidate { start: 0, end: 5 }]);

        // A gap of exactly one window breaks the run
        let peaks = group(0.0, W, "ABCDEF");
        assert!(find_candidates(&peaks, W, K).is_empty());
    }

    #[test]
    fn test_failed_run_followed_by_good_run() {
        let mut peaks = group(0.0, 1_000.0, "AAAAAAAAB");
        peaks.extend(group(500_000.0, 1_000.0, "ABCDEF"));
        assert_eq!(find_candidates(&peaks, W, K), vec![Candidate { start: 9, end: 14 }]);
    }

    #[test]
    fn test_empty_stream() {
        assert!(find_candidates(&[], W, K).is_empty());
    }

    #[test]
    fn test_merge_sorts_by_source_time() {
        let center = Geodetic::new(34.0, -107.0, 2000.0);
        let near = Station::new('N', center);
        let far = Station::new('F', Geodetic::new(34.3, -107.0, 2000.0)).with_delay(100.0);
        let mut registry = StationRegistry::new();
        registry.insert(near.clone());
        registry.insert(far.clone());

        let model = LineOfSight::new();
        let far_travel = model.travel_time_ns(&center, &far);
        assert!(far_travel > 100_000.0);

        let mut frames = BTreeMap::new();
        frames.insert('N', frame('N', None, vec![packet(2_000_000.0, -50.0), packet(1_000_000.0, -40.0)]));
        frames.insert('F', frame('F', None, vec![packet(1_050_000.0 + far_travel, -45.0)]));

        let peaks = merge_peaks(&frames, &registry, &model, &center);
        assert_eq!(peaks.len(), 3);
        assert!(peaks.windows(2).all(|w| w[0].source_ns <= w[1].source_ns));

        assert_eq!(peaks[0].station, 'N');
        assert!((peaks[0].source_ns - 1_000_000.0).abs() < 1e-3);
        assert_eq!(peaks[1].station, 'F');
        assert!((peaks[1].source_ns - 1_049_900.0).abs() < 1e-3);
        assert!((peaks[1].arrival_ns - (1_049_900.0 + far_travel)).abs() < 1e-3);
        assert_eq!(peaks[2].power_dbm, -50.0);
    }

    #[test]
    fn test_reconcile_adds_reported_and_skips_unknown() {
        let mut registry = StationRegistry::new();
        registry.insert(Station::new('A', Geodetic::new(34.0, -107.0, 2000.0)));

        let mut frames = BTreeMap::new();
        // Known, reported 1 km away
        frames.insert('A', frame('A', Some(Geodetic::new(34.009, -107.0, 2000.0)), vec![]));
        // Unknown, reported
        frames.insert('B', frame('B', Some(Geodetic::new(34.1, -107.0, 2000.0)), vec![]));
        // Unknown, not reported
        frames.insert('C', frame('C', None, vec![packet(1_000.0, -50.0)]));

        let warnings = reconcile_stations(&frames, &mut registry);
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].station_id, 'A');
        assert!(registry.get('B').is_some());
        assert!(registry.get('C').is_none());

        let peaks = merge_peaks(&frames, &registry, &LineOfSight::new(), &Geodetic::new(34.0, -107.0, 0.0));
        assert!(peaks.is_empty());
    }

    #[test]
    fn test_engine_end_to_end() {
        let center = Geodetic::new(34.0, -107.0, 2000.0);
        let mut registry = StationRegistry::new();
        let mut frames = BTreeMap::new();
        for (i, id) in "ABCDEF".chars().enumerate() {
            let location = Geodetic::new(34.0 + 0.01 * i as f64, -107.0, 2000.0);
            let travel = LineOfSight::new().travel_time_ns(&center, &location);
            frames.insert(id, frame(id, Some(location), vec![packet(500_000.0 + travel, -50.0)]));
        }

        let model = LineOfSight::new();
        let engine = CorrelationEngine::new(TrialLocation::from_geodetic(center), &model, W, K);
        let correlation = engine.correlate(&frames, &mut registry);
        assert!(correlation.warnings.is_empty());
        assert_eq!(registry.len(), 6);
        assert_eq!(correlation.candidates, vec![Candidate { start: 0, end: 5 }]);
        for p in correlation.candidates[0].peaks(&correlation.peaks) {
            assert!((p.source_ns - 500_000.0).abs() < 1e-3);
        }
    }
}
