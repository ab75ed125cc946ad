// Signal propagation between a source and a station

use crate::constants::C_NS;
use crate::geodesy::{Cartesian, Geodetic};

/// Anything with a position: stations, trial locations, fixes.
pub trait Located {
    fn cartesian(&self) -> Cartesian;

    fn geodetic(&self) -> Geodetic {
        self.cartesian().to_geodetic()
    }
}

impl Located for Cartesian {
    fn cartesian(&self) -> Cartesian {
        *self
    }
}

impl Located for Geodetic {
    fn cartesian(&self) -> Cartesian {
        self.to_cartesian()
    }

    fn geodetic(&self) -> Geodetic {
        *self
    }
}

/// A trial source position, such as a phase center or a solver iterate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrialLocation {
    pub position: Cartesian,
}

impl TrialLocation {
    pub fn from_geodetic(geodetic: Geodetic) -> Self {
        TrialLocation { position: geodetic.to_cartesian() }
    }

    pub fn from_xyz(x: f64, y: f64, z: f64) -> Self {
        TrialLocation { position: Cartesian::new(x, y, z) }
    }
}

impl Located for TrialLocation {
    fn cartesian(&self) -> Cartesian {
        self.position
    }
}

/// Expected travel time of a signal from a source to a station.
pub trait PropagationModel {
    fn travel_time_ns(&self, source: &dyn Located, station: &dyn Located) -> f64;
}

/// Straight-line propagation at a constant speed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LineOfSight {
    /// Speed in m/ns
    speed: f64,
}

impl LineOfSight {
    /// Propagation at the vacuum speed of light.
    pub fn new() -> Self {
        LineOfSight { speed: C_NS }
    }

    /// Propagation through a medium with the given refractive index.
    pub fn with_index(index: f64) -> Self {
        LineOfSight { speed: C_NS / index }
    }
}

impl Default for LineOfSight {
    fn default() -> Self {
        Self::new()
    }
}

impl PropagationModel for LineOfSight {
    fn travel_time_ns(&self, source: &dyn Located, station: &dyn Located) -> f64 {
        source.cartesian().distance(&station.cartesian()) / self.speed
    }
}

impl<F> PropagationModel for F
where
    F: Fn(&Cartesian, &Cartesian) -> f64,
{
    fn travel_time_ns(&self, source: &dyn Located, station: &dyn Located) -> f64 {
        self(&source.cartesian(), &station.cartesian())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_of_sight_travel_time() {
        let a = TrialLocation::from_xyz(0.0, 0.0, 6_371_000.0);
        let b = Cartesian::new(0.0, 299_792.458, 6_371_000.0);
        let t = LineOfSight::new().travel_time_ns(&a, &b);
        assert!((t - 1_000_000.0).abs() < 1e-6);

        let slow = LineOfSight::with_index(1.0003).travel_time_ns(&a, &b);
        assert!((slow - 1_000_300.0).abs() < 1e-6);
    }

    #[test]
    fn test_closure_model() {
        let model = |_: &Cartesian, _: &Cartesian| 42.0;
        let a = Geodetic::new(34.0, -107.0, 0.0);
        assert_eq!(model.travel_time_ns(&a, &a), 42.0);
    }

    #[test]
    fn test_geodetic_round_trips_through_located() {
        let g = Geodetic::new(34.0, -107.0, 1500.0);
        let trial = TrialLocation::from_geodetic(g);
        let back = trial.geodetic();
        assert!((back.lat - g.lat).abs() < 1e-9);
        assert!((back.alt - g.alt).abs() < 1e-3);
    }
}
