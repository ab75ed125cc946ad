// Station registry
//
// Stations are keyed by their single-letter id. The registry is filled from a
// location file, from GPS positions reported in the raw data, or both; when
// both are present they are checked against each other.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::constants::RECONCILE_TOLERANCE_M;
use crate::error::Result;
use crate::geodesy::{Cartesian, Geodetic};
use crate::propagation::Located;

/// One LMA station.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Station {
    pub id: char,
    pub geodetic: Geodetic,
    pub cartesian: Cartesian,
    /// Cable and receiver delay subtracted from every arrival time (ns)
    #[serde(default)]
    pub delay_ns: f64,
}

impl Station {
    pub fn new(id: char, geodetic: Geodetic) -> Self {
        Station {
            id,
            geodetic,
            cartesian: geodetic.to_cartesian(),
            delay_ns: 0.0,
        }
    }

    pub fn with_delay(mut self, delay_ns: f64) -> Self {
        self.delay_ns = delay_ns;
        self
    }
}

impl Located for Station {
    fn cartesian(&self) -> Cartesian {
        self.cartesian
    }

    fn geodetic(&self) -> Geodetic {
        self.geodetic
    }
}

/// A registry position that disagrees with the one a station reported.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconciliationWarning {
    pub station_id: char,
    pub registered: Geodetic,
    pub reported: Geodetic,
    /// Surface distance between the two, `None` if it could not be evaluated
    pub distance_m: Option<f64>,
}

/// Station id -> station.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StationRegistry {
    stations: BTreeMap<char, Station>,
}

impl StationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a registry saved with [`StationRegistry::save`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let registry: StationRegistry = serde_json::from_reader(BufReader::new(file))?;
        info!("loaded {} stations from {}", registry.len(), path.as_ref().display());
        Ok(registry)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        self.write_to(File::create(path.as_ref())?)
    }

    /// Writes the registry as pretty JSON. Fails if the final flush fails.
    pub fn write_to<W: Write>(&self, writer: W) -> Result<()> {
        let mut writer = BufWriter::new(writer);
        serde_json::to_writer_pretty(&mut writer, self)?;
        writer.flush()?;
        Ok(())
    }

    pub fn get(&self, id: char) -> Option<&Station> {
        self.stations.get(&id)
    }

    pub fn insert(&mut self, station: Station) -> Option<Station> {
        self.stations.insert(station.id, station)
    }

    pub fn len(&self) -> usize {
        self.stations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stations.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Station> {
        self.stations.values()
    }

    /// Mean position of all stations, a reasonable default phase center.
    pub fn centroid(&self) -> Option<Geodetic> {
        if self.stations.is_empty() {
            return None;
        }
        let n = self.stations.len() as f64;
        let (x, y, z) = self.stations.values().fold((0.0, 0.0, 0.0), |acc, s| {
            (acc.0 + s.cartesian.x, acc.1 + s.cartesian.y, acc.2 + s.cartesian.z)
        });
        Some(Cartesian::new(x / n, y / n, z / n).to_geodetic())
    }

    /// Checks a reported position against the registry.
    ///
    /// Unknown stations are added at the reported position. Known stations
    /// keep their registered position; a disagreement of more than 10 m is
    /// logged and returned.
    pub fn reconcile(&mut self, id: char, reported: Geodetic) -> Option<ReconciliationWarning> {
        let Some(station) = self.stations.get(&id) else {
            self.insert(Station::new(id, reported));
            return None;
        };

        let distance_m = station.geodetic.surface_distance(&reported).ok();
        let agrees = matches!(distance_m, Some(d) if d <= RECONCILE_TOLERANCE_M);
        if agrees {
            return None;
        }

        warn!(
            station = %id,
            distance_m = ?distance_m,
            "station position disagrees with GPS: registered {:.6},{:.6} reported {:.6},{:.6}",
            station.geodetic.lat,
            station.geodetic.lon,
            reported.lat,
            reported.lon
        );
        Some(ReconciliationWarning {
            station_id: id,
            registered: station.geodetic,
            reported,
            distance_m,
        })
    }
}
