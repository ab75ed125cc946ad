use std::path::PathBuf;

use clap::Parser;

use crate::constants::{DEFAULT_MIN_STATIONS, DEFAULT_WINDOW_NS};
use crate::geodesy::Geodetic;
use crate::locate::LocateConfig;
use crate::station_file::CaptureMode;

/// LMA source locator configuration
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Raw station data files.
    #[arg(required = true, value_name = "FILE")]
    pub files: Vec<PathBuf>,

    /// Load station locations and delays from a JSON file.
    #[arg(long, value_name = "FILE")]
    pub locations: Option<PathBuf>,

    /// Save the station locations known at the end of the run.
    #[arg(long, value_name = "FILE")]
    pub save_locations: Option<PathBuf>,

    /// Input files were decimated; do not trust their trigger counts.
    #[arg(long, default_value_t = false)]
    pub decimated: bool,

    /// Keep only the strongest peak in each slice of this many ns per station.
    #[arg(long, value_name = "NS")]
    pub thin_ns: Option<f64>,

    /// Largest gap between neighbouring peaks of one source (ns).
    #[arg(long, default_value_t = DEFAULT_WINDOW_NS)]
    pub window_ns: f64,

    /// Sources need more distinct stations than this.
    #[arg(long, default_value_t = DEFAULT_MIN_STATIONS)]
    pub min_stations: usize,

    /// Phase center; defaults to the centroid of the known stations.
    #[arg(long, value_name = "LAT,LON,ALT", value_parser = parse_center)]
    pub center: Option<Geodetic>,

    /// Write fixes in CSV format to a local file.
    #[arg(long, value_name = "FILE")]
    pub write_csv: Vec<PathBuf>,

    /// Write fixes as JSON lines to a local file.
    #[arg(long, value_name = "FILE")]
    pub write_json: Vec<PathBuf>,

    /// Verbose logging (DEBUG level)
    #[arg(long, short, default_value_t = false)]
    pub verbose: bool,
}

impl Config {
    pub fn capture_mode(&self) -> CaptureMode {
        if self.decimated {
            CaptureMode::Decimated
        } else {
            CaptureMode::Raw
        }
    }

    pub fn locate_config(&self) -> LocateConfig {
        LocateConfig {
            window_ns: self.window_ns,
            min_stations: self.min_stations,
            ..Default::default()
        }
    }
}

/// Parses `LAT,LON,ALT` (degrees, degrees, meters).
pub fn parse_center(s: &str) -> Result<Geodetic, String> {
    let parts: Vec<&str> = s.split(',').map(str::trim).collect();
    let [lat, lon, alt] = parts.as_slice() else {
        return Err(format!("expected LAT,LON,ALT, got '{}'", s));
    };
    let parse = |v: &str| v.parse::<f64>().map_err(|e| format!("'{}': {}", v, e));
    let center = Geodetic::new(parse(*lat)?, parse(*lon)?, parse(*alt)?);
    if !(-90.0..=90.0).contains(&center.lat) || !(-180.0..=180.0).contains(&center.lon) {
        return Err(format!("'{}' is not a valid position", s));
    }
    Ok(center)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::try_parse_from(["lma-locate", "a.dat", "b.dat"]).unwrap();
        assert_eq!(config.files.len(), 2);
        assert_eq!(config.capture_mode(), CaptureMode::Raw);
        assert!(config.center.is_none());
        assert_eq!(config.locate_config(), LocateConfig::default());
    }

    #[test]
    fn test_flags() {
        let config = Config::try_parse_from([
            "lma-locate",
            "--decimated",
            "--window-ns",
            "10000",
            "--min-stations",
            "6",
            "--center",
            "34.0, -107.0, 3000",
            "--write-csv",
            "out.csv",
            "a.dat",
        ])
        .unwrap();
        assert_eq!(config.capture_mode(), CaptureMode::Decimated);
        assert_eq!(config.center, Some(Geodetic::new(34.0, -107.0, 3000.0)));
        assert_eq!(config.write_csv, vec![PathBuf::from("out.csv")]);

        let locate = config.locate_config();
        assert_eq!(locate.window_ns, 10_000.0);
        assert_eq!(locate.min_stations, 6);
    }

    #[test]
    fn test_files_required() {
        assert!(Config::try_parse_from(["lma-locate"]).is_err());
    }

    #[test]
    fn test_parse_center_errors() {
        assert!(parse_center("34.0,-107.0").is_err());
        assert!(parse_center("north,-107.0,0").is_err());
        assert!(parse_center("95.0,-107.0,0").is_err());
    }
}
