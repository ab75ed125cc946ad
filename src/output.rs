// Fix output handlers
//
// CSV: epoch,time_ns,lat,lon,alt_m,rms_ns,stations,quality
// JSON: one object per line with the same fields, plus station ids and UTC time

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;

use chrono::SecondsFormat;
use tracing::error;

use crate::locate::Fix;

pub const CSV_HEADER: &str = "epoch,time_ns,lat,lon,alt_m,rms_ns,stations,quality";

/// Trait for output handlers
pub trait OutputHandler {
    /// Handle a newly accepted fix
    fn handle_fix(&mut self, fix: &Fix);

    fn flush(&mut self) {}
}

fn open_append(path: &Path) -> io::Result<(BufWriter<File>, bool)> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let empty = file.metadata()?.len() == 0;
    Ok((BufWriter::new(file), empty))
}

/// CSV format output
pub struct CsvOutput<W: Write = BufWriter<File>> {
    writer: W,
}

impl CsvOutput {
    /// Appends to `path`, writing the header if the file is new.
    pub fn create(path: impl AsRef<Path>) -> io::Result<Self> {
        let (writer, empty) = open_append(path.as_ref())?;
        let mut output = CsvOutput { writer };
        if empty {
            writeln!(output.writer, "{}", CSV_HEADER)?;
        }
        Ok(output)
    }
}

impl<W: Write> CsvOutput<W> {
    pub fn from_writer(writer: W) -> Self {
        CsvOutput { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    pub fn format_line(fix: &Fix) -> String {
        format!(
            "{},{:.1},{:.6},{:.6},{:.1},{:.1},{},{:.3}",
            fix.epoch, fix.time_ns, fix.lat, fix.lon, fix.alt_m, fix.rms_ns, fix.stations, fix.quality
        )
    }
}

impl<W: Write> OutputHandler for CsvOutput<W> {
    fn handle_fix(&mut self, fix: &Fix) {
        if let Err(e) = writeln!(self.writer, "{}", Self::format_line(fix)) {
            error!("Failed to write CSV: {}", e);
        }
    }

    fn flush(&mut self) {
        if let Err(e) = self.writer.flush() {
            error!("Failed to flush CSV: {}", e);
        }
    }
}

/// JSON lines output
pub struct JsonOutput<W: Write = BufWriter<File>> {
    writer: W,
}

impl JsonOutput {
    pub fn create(path: impl AsRef<Path>) -> io::Result<Self> {
        let (writer, _) = open_append(path.as_ref())?;
        Ok(JsonOutput { writer })
    }
}

impl<W: Write> JsonOutput<W> {
    pub fn from_writer(writer: W) -> Self {
        JsonOutput { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    pub fn format_json(fix: &Fix) -> serde_json::Result<String> {
        let mut value = serde_json::to_value(fix)?;
        if let (Some(map), Some(ts)) = (value.as_object_mut(), fix.timestamp()) {
            map.insert(
                "utc".to_string(),
                ts.to_rfc3339_opts(SecondsFormat::Nanos, true).into(),
            );
        }
        serde_json::to_string(&value)
    }
}

impl<W: Write> OutputHandler for JsonOutput<W> {
    fn handle_fix(&mut self, fix: &Fix) {
        let line = match Self::format_json(fix) {
            Ok(line) => line,
            Err(e) => {
                error!("Failed to encode fix: {}", e);
                return;
            }
        };
        if let Err(e) = writeln!(self.writer, "{}", line) {
            error!("Failed to write JSON: {}", e);
        }
    }

    fn flush(&mut self) {
        if let Err(e) = self.writer.flush() {
            error!("Failed to flush JSON: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geodesy::Geodetic;

    fn fix() -> Fix {
        let geodetic = Geodetic::new(34.03, -107.02, 6000.0);
        Fix {
            epoch: 1_686_776_851,
            time_ns: 400_123.5,
            lat: geodetic.lat,
            lon: geodetic.lon,
            alt_m: geodetic.alt,
            rms_ns: 12.5,
            stations: 6,
            quality: 3.5,
            station_ids: "ABCDEF".to_string(),
            position: geodetic.to_cartesian(),
        }
    }

    #[test]
    fn test_csv_line() {
        let mut output = CsvOutput::from_writer(Vec::new());
        output.handle_fix(&fix());
        let text = String::from_utf8(output.into_inner()).unwrap();
        assert_eq!(text, "1686776851,400123.5,34.030000,-107.020000,6000.0,12.5,6,3.500\n");
    }

    #[test]
    fn test_csv_file_header_written_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fixes.csv");
        for _ in 0..2 {
            let mut output = CsvOutput::create(&path).unwrap();
            output.handle_fix(&fix());
            output.flush();
        }
        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], CSV_HEADER);
        assert_eq!(lines[1], lines[2]);
    }

    #[test]
    fn test_json_line() {
        let mut output = JsonOutput::from_writer(Vec::new());
        output.handle_fix(&fix());
        let text = String::from_utf8(output.into_inner()).unwrap();
        assert!(text.ends_with('\n'));

        let value: serde_json::Value = serde_json::from_str(text.trim_end()).unwrap();
        assert_eq!(value["epoch"], 1_686_776_851);
        assert_eq!(value["stations"], 6);
        assert_eq!(value["station_ids"], "ABCDEF");
        assert_eq!(value["utc"], "2023-06-14T21:07:31.000400123Z");
        assert!(value.get("position").is_none());
    }
}
