// Station raw file access
//
// A raw file is a sequence of one-second frames: data records followed by the
// status record that closes them. The file starts with a status record whose
// data lives in the previous file. There is no external index, so frame
// boundaries are rebuilt from the records themselves.

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{BufReader, ErrorKind, Read, Seek, SeekFrom};
use std::path::Path;

use tracing::debug;

use crate::constants::{DATA_SIZE, PROBE_STRIDE};
use crate::error::{LmaError, Result};
use crate::geodesy::Geodetic;
use crate::raw::{decode_data, decode_status, has_sync, peek_version, status_size, DataPacket, GpsState, StatusPacket};

/// Read granularity of the forward scan.
const SCAN_CHUNK: usize = 1 << 20;

/// How the file was captured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureMode {
    /// Straight from the station: trigger counts match the data.
    Raw,
    /// Thinned after capture: trigger counts no longer match the data.
    Decimated,
}

/// Location of one status record.
#[derive(Debug, Clone)]
pub struct Boundary {
    pub offset: u64,
    pub status: StatusPacket,
    /// GPS telemetry accumulated up to and including this record
    pub gps: GpsState,
}

/// One station's data for one epoch second.
#[derive(Debug, Clone)]
pub struct Frame {
    pub station_id: char,
    pub network_id: Option<char>,
    pub version: u8,
    pub phase_offset: i32,
    pub epoch: Option<i64>,
    /// Position reported by the station's GPS, if a full cycle was seen
    pub location: Option<Geodetic>,
    pub packets: Vec<DataPacket>,
}

impl Frame {
    /// Keeps only the strongest peak in each `window_ns` slice of the second.
    pub fn decimate(&mut self, window_ns: f64) {
        if window_ns <= 0.0 || self.packets.is_empty() {
            return;
        }
        let mut strongest: BTreeMap<i64, DataPacket> = BTreeMap::new();
        for packet in self.packets.drain(..) {
            let bucket = (packet.arrival_ns / window_ns).floor() as i64;
            strongest
                .entry(bucket)
                .and_modify(|kept| {
                    if packet.power_dbm > kept.power_dbm {
                        *kept = packet;
                    }
                })
                .or_insert(packet);
        }
        self.packets = strongest.into_values().collect();
    }
}

/// Random access to the frames of one station file.
pub struct StationFile<R = BufReader<File>> {
    reader: R,
    version: u8,
    status_size: usize,
    mode: CaptureMode,
    boundaries: Vec<Boundary>,
    epochs: HashMap<i64, usize>,
}

impl StationFile {
    /// Opens and indexes a raw file.
    pub fn open(path: impl AsRef<Path>, mode: CaptureMode) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let station = StationFile::from_reader(BufReader::new(file), mode)?;
        debug!(
            "indexed {}: v{} {} frames",
            path.as_ref().display(),
            station.version,
            station.boundaries.len()
        );
        Ok(station)
    }
}

impl<R: Read + Seek> StationFile<R> {
    /// Indexes a raw stream. Raw captures are scanned backward from the end
    /// using the trigger counts, decimated ones forward by probing.
    pub fn from_reader(mut reader: R, mode: CaptureMode) -> Result<Self> {
        let size = reader.seek(SeekFrom::End(0))?;

        let mut head = [0u8; 2];
        read_at(&mut reader, 0, &mut head)?;
        let version = peek_version(&head)?;
        let status_size = status_size(version);

        let located = match mode {
            CaptureMode::Raw => scan_backward(&mut reader, size, version, status_size)?,
            CaptureMode::Decimated => scan_forward(&mut reader, size, version, status_size)?,
        };

        let mut gps = GpsState::new();
        let mut epochs = HashMap::with_capacity(located.len());
        let mut boundaries = Vec::with_capacity(located.len());
        for (index, (offset, status)) in located.into_iter().enumerate() {
            gps = gps.advance(&status);
            if let Some(epoch) = status.epoch() {
                epochs.insert(epoch, index);
            }
            boundaries.push(Boundary { offset, status, gps });
        }

        Ok(StationFile {
            reader,
            version,
            status_size,
            mode,
            boundaries,
            epochs,
        })
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn status_size(&self) -> usize {
        self.status_size
    }

    /// Number of status records, including the leading one.
    pub fn frame_count(&self) -> usize {
        self.boundaries.len()
    }

    pub fn boundaries(&self) -> &[Boundary] {
        &self.boundaries
    }

    pub fn status(&self, index: usize) -> Option<&StatusPacket> {
        self.boundaries.get(index).map(|b| &b.status)
    }

    /// Epoch of the first frame that carries data.
    pub fn start_epoch(&self) -> Option<i64> {
        self.boundaries.iter().skip(1).find_map(|b| b.status.epoch())
    }

    /// Epochs of the frames that carry data, in file order.
    pub fn epochs(&self) -> impl Iterator<Item = i64> + '_ {
        self.boundaries.iter().skip(1).filter_map(|b| b.status.epoch())
    }

    pub fn frame_for_epoch(&self, epoch: i64) -> Option<usize> {
        self.epochs.get(&epoch).copied()
    }

    /// Reads and decodes frame `index`.
    ///
    /// Frame 0 is the leading status record and has no data. Any malformed
    /// record or a short read fails the whole frame.
    pub fn read_frame(&mut self, index: usize) -> Result<Frame> {
        let count = self.boundaries.len();
        let boundary = self.boundaries.get(index).ok_or(LmaError::FrameOutOfRange { index, count })?;
        let status = &boundary.status;
        let mut frame = Frame {
            station_id: status.station_id,
            network_id: status.network_id,
            version: status.version,
            phase_offset: status.phase_offset,
            epoch: status.epoch(),
            location: boundary.gps.position(),
            packets: Vec::new(),
        };
        if index == 0 {
            return Ok(frame);
        }

        let start = self.boundaries[index - 1].offset + self.status_size as u64;
        let end = boundary.offset;
        let range = end
            .checked_sub(start)
            .ok_or_else(|| LmaError::format(format!("frame {} ends before it starts", index)))?
            as usize;

        let n_packets = match self.mode {
            CaptureMode::Raw => {
                let n = status.trigger_count as usize;
                if n * DATA_SIZE != range {
                    return Err(LmaError::format(format!(
                        "frame {}: {} triggers do not fill the {} bytes before its status",
                        index, n, range
                    )));
                }
                n
            }
            CaptureMode::Decimated => {
                if range % DATA_SIZE != 0 {
                    return Err(LmaError::format(format!(
                        "frame {}: {} bytes is not a whole number of data records",
                        index, range
                    )));
                }
                range / DATA_SIZE
            }
        };

        let mut bytes = vec![0u8; n_packets * DATA_SIZE];
        read_at(&mut self.reader, start, &mut bytes)?;

        let (version, phase_offset) = (status.version, status.phase_offset);
        frame.packets = bytes
            .chunks_exact(DATA_SIZE)
            .map(|record| decode_data(record, version, phase_offset))
            .collect::<Result<Vec<_>>>()?;
        Ok(frame)
    }
}

fn read_at<R: Read + Seek>(reader: &mut R, offset: u64, buf: &mut [u8]) -> Result<()> {
    reader.seek(SeekFrom::Start(offset))?;
    reader.read_exact(buf).map_err(|e| match e.kind() {
        ErrorKind::UnexpectedEof => LmaError::format(format!("short read of {} bytes at {}", buf.len(), offset)),
        _ => LmaError::Io(e),
    })
}

/// Walks from the end of the file to the start, hopping over each frame's
/// data using the trigger count of the status record that closes it.
fn scan_backward<R: Read + Seek>(
    reader: &mut R,
    size: u64,
    version: u8,
    status_size: usize,
) -> Result<Vec<(u64, StatusPacket)>> {
    let record = status_size as u64;
    let mut buf = vec![0u8; status_size];
    let mut located = Vec::new();
    let mut end = size;

    loop {
        let offset = end.checked_sub(record).ok_or_else(|| {
            LmaError::format(format!("no room for a status record before byte {}", end))
        })?;
        read_at(reader, offset, &mut buf)?;
        let status = decode_status(&buf)?;
        if status.version != version {
            return Err(LmaError::format(format!(
                "status at {} is v{}, file is v{}",
                offset, status.version, version
            )));
        }
        let skip = status.trigger_count as u64 * DATA_SIZE as u64;
        located.push((offset, status));

        if offset == 0 {
            break;
        }
        end = offset.checked_sub(skip).ok_or_else(|| {
            LmaError::format(format!("frame data before status at {} starts before the file", offset))
        })?;
    }

    located.reverse();
    Ok(located)
}

/// Buffered view of the file for the forward scan.
struct ScanWindow {
    chunk: Vec<u8>,
    start: u64,
    size: u64,
    len: usize,
}

impl ScanWindow {
    fn new(size: u64, len: usize) -> Self {
        ScanWindow { chunk: Vec::new(), start: 0, size, len }
    }

    /// The `len` bytes at `pos`, or `None` past the end of the file.
    fn at<R: Read + Seek>(&mut self, reader: &mut R, pos: u64) -> Result<Option<&[u8]>> {
        let len = self.len as u64;
        if pos + len > self.size {
            return Ok(None);
        }
        if pos < self.start || pos + len > self.start + self.chunk.len() as u64 {
            let read = (self.size - pos).min(SCAN_CHUNK.max(self.len) as u64) as usize;
            self.chunk.resize(read, 0);
            read_at(reader, pos, &mut self.chunk)?;
            self.start = pos;
        }
        let at = (pos - self.start) as usize;
        Ok(Some(&self.chunk[at..at + self.len]))
    }
}

/// Probes for status records from the start of the file, stepping a few bytes
/// at a time past anything that does not decode as one.
///
/// A candidate only counts when it starts a whole number of data records after
/// the previous status, and v10+ records must end in the sync word. Strong
/// peaks can otherwise line up into an all-negative run between records.
fn scan_forward<R: Read + Seek>(
    reader: &mut R,
    size: u64,
    version: u8,
    status_size: usize,
) -> Result<Vec<(u64, StatusPacket)>> {
    let mut window = ScanWindow::new(size, status_size);

    let first = window
        .at(reader, 0)?
        .ok_or_else(|| LmaError::format("file shorter than one status record"))?;
    let mut located = vec![(0u64, decode_status(first)?)];
    let mut data_start = status_size as u64;
    let mut pos = data_start;

    while let Some(bytes) = window.at(reader, pos)? {
        let aligned = (pos - data_start) % DATA_SIZE as u64 == 0;
        let found = if aligned { status_at(bytes, version)? } else { None };
        match found {
            Some(status) => {
                located.push((pos, status));
                pos += status_size as u64;
                data_start = pos;
            }
            None => pos += PROBE_STRIDE as u64,
        }
    }

    Ok(located)
}

fn status_at(bytes: &[u8], version: u8) -> Result<Option<StatusPacket>> {
    match decode_status(bytes) {
        Ok(status) if status.version == version && has_sync(bytes, version) => Ok(Some(status)),
        Ok(_) | Err(LmaError::Format(_)) | Err(LmaError::UnsupportedVersion(_)) => Ok(None),
        Err(e) => Err(e),
    }
}
