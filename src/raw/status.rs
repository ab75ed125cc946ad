// Status record decoding
//
// A status record closes each one-second frame. It carries the calendar time,
// the station id, the trigger count of the frame it closes, the sample clock
// phase offset and, from v10 on, one 16-bit slice of the GPS telemetry.

use chrono::NaiveDate;

use super::{format_for, read_words, status_size, write_words, StatusLayout};
use crate::constants::{ID_ASCII_OFFSET, STATUS_SIZE};
use crate::error::{LmaError, Result};

/// Sync word closing v10+ status records.
const SYNC: u16 = 0xaa55;

/// Decoded status record.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusPacket {
    pub version: u8,
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
    pub threshold: u8,
    pub fifo_status: u8,
    pub station_id: char,
    /// Only present from v12 on.
    pub network_id: Option<char>,
    /// Sample clock offset from 25 MHz, in ticks per second.
    pub phase_offset: i32,
    /// Number of data records in the frame this status closes.
    pub trigger_count: u32,
    /// 16-bit GPS telemetry slice selected by `second % 12` (v10+).
    pub gps_info: Option<u16>,
}

impl StatusPacket {
    /// Unix second of the calendar fields, `None` if they do not form a date.
    pub fn epoch(&self) -> Option<i64> {
        NaiveDate::from_ymd_opt(self.year as i32, self.month as u32, self.day as u32)?
            .and_hms_opt(self.hour as u32, self.minute as u32, self.second as u32)
            .map(|t| t.and_utc().timestamp())
    }

    /// Size of this record on disk.
    pub fn size(&self) -> usize {
        status_size(self.version)
    }

    /// Encodes the record back into its wire layout.
    ///
    /// Fails when a field does not fit the layout of `self.version`.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let layout = format_for(self.version)?.status;
        let year = (self.year as u32).checked_sub(2000).filter(|y| *y < 0x80);
        let year = year.ok_or_else(|| LmaError::format(format!("year {} not encodable", self.year)))?;
        let id = (self.station_id as u32)
            .checked_sub(ID_ASCII_OFFSET)
            .ok_or_else(|| LmaError::format(format!("station id {:?} not encodable", self.station_id)))?;
        let sign = if self.phase_offset >= 0 { 0x4000 } else { 0 };
        let magnitude = self.phase_offset.unsigned_abs();

        let w0 = 0x8000 | ((self.version as u32 & 0x3f) << 7) | year;
        let w2 = 0x8000
            | ((self.fifo_status as u32 & 0x07) << 12)
            | ((self.second as u32 & 0x3f) << 6)
            | (self.minute as u32 & 0x3f);
        let w3 = 0x8000
            | ((self.hour as u32 & 0x1f) << 9)
            | ((self.day as u32 & 0x1f) << 4)
            | (self.month as u32 & 0x0f);

        let words: Vec<u32> = match layout {
            StatusLayout::Legacy => {
                check_fits("station id", id, 0x7f)?;
                check_fits("phase offset", magnitude, 0x1f)?;
                check_fits("trigger count", self.trigger_count, 0x7f_ffff)?;
                let w1 = 0x8000 | sign | (magnitude << 9) | self.threshold as u32;
                let w4 = 0x8000 | (self.trigger_count >> 8);
                let w5 = 0x8000 | (id << 8) | (self.trigger_count & 0xff);
                vec![w0, w1, w2, w3, w4, w5]
            }
            StatusLayout::Gps | StatusLayout::GpsNetwork => {
                check_fits("station id", id, 0xff)?;
                check_fits("phase offset", magnitude, 0x7fff)?;
                check_fits("trigger count", self.trigger_count, 0x1_ffff)?;
                let gps = self.gps_info.unwrap_or(0) as u32;
                let network = match (layout, self.network_id) {
                    (StatusLayout::GpsNetwork, Some(n)) => {
                        let code = (n as u32).checked_sub(ID_ASCII_OFFSET).unwrap_or(u32::MAX);
                        check_fits("network id", code, 0xff)?;
                        code
                    }
                    _ => 0,
                };
                let w1 = 0x8000
                    | sign
                    | ((gps & 0x8000) >> 2)
                    | ((id & 0x80) << 5)
                    | (((self.trigger_count >> 15) & 0x3) << 10)
                    | self.threshold as u32;
                let w4 = 0x8000 | (self.trigger_count & 0x7fff);
                let w5 = 0x8000 | ((id & 0x7f) << 8) | network;
                let w6 = 0x8000 | magnitude;
                let w7 = 0x8000 | (gps & 0x7fff);
                vec![w0, w1, w2, w3, w4, w5, w6, w7, SYNC as u32]
            }
        };

        let words: Vec<u16> = words.into_iter().map(|w| w as u16).collect();
        Ok(write_words(&words))
    }
}

fn check_fits(field: &str, value: u32, max: u32) -> Result<()> {
    if value > max {
        return Err(LmaError::format(format!("{} {} exceeds {:#x}", field, value, max)));
    }
    Ok(())
}

/// Reads the version from the first status word.
///
/// The field is 6 bits wide (bits 7-12). Some firmware documentation gives
/// 7 bits; versions above 63 would be misread.
pub fn peek_version(bytes: &[u8]) -> Result<u8> {
    if bytes.len() < 2 {
        return Err(LmaError::format("truncated status record"));
    }
    let w0 = i16::from_le_bytes([bytes[0], bytes[1]]);
    if w0 >= 0 {
        return Err(LmaError::format(format!("status word 0 is not negative: {:#06x}", w0 as u16)));
    }
    Ok(((w0 as u16 >> 7) & 0x3f) as u8)
}

/// True if a v10+ record ends in the sync word. Legacy records carry none and
/// always pass.
pub fn has_sync(bytes: &[u8], version: u8) -> bool {
    if status_size(version) < STATUS_SIZE {
        return true;
    }
    bytes.len() >= STATUS_SIZE && u16::from_le_bytes([bytes[16], bytes[17]]) == SYNC
}

/// Decodes one status record from the start of `bytes`.
///
/// Every word must carry the sign bit. The record is 12 bytes before v10 and
/// 18 bytes after; trailing bytes are ignored.
pub fn decode_status(bytes: &[u8]) -> Result<StatusPacket> {
    let version = peek_version(bytes)?;
    let size = status_size(version);
    if bytes.len() < size {
        return Err(LmaError::format(format!(
            "truncated status record: {} of {} bytes",
            bytes.len(),
            size
        )));
    }

    let raw: [i16; STATUS_SIZE / 2] = read_words(&bytes[..size]);
    let n_words = size / 2;
    if let Some(pos) = raw[..n_words].iter().position(|w| *w >= 0) {
        return Err(LmaError::format(format!(
            "status word {} is not negative: {:#06x}",
            pos, raw[pos] as u16
        )));
    }

    let layout = format_for(version)?.status;
    let w = raw.map(|x| x as u16 as u32);

    let magnitude = match layout {
        StatusLayout::Legacy => (w[1] >> 9) & 0x1f,
        StatusLayout::Gps | StatusLayout::GpsNetwork => w[6] & 0x7fff,
    };
    let magnitude = magnitude as i32;
    let phase_offset = if w[1] & 0x4000 != 0 { magnitude } else { -magnitude };

    let (id_code, trigger_count, gps_info, network_code) = match layout {
        StatusLayout::Legacy => {
            let id = (w[5] >> 8) & 0x7f;
            let trig = ((w[4] & 0x7fff) << 8) | (w[5] & 0xff);
            (id, trig, None, None)
        }
        StatusLayout::Gps | StatusLayout::GpsNetwork => {
            let id = ((w[1] >> 5) & 0x80) | ((w[5] >> 8) & 0x7f);
            let trig = ((w[1] & 0x0c00) << 5) | (w[4] & 0x7fff);
            let gps = (w[7] & 0x7fff) | ((w[1] & 0x2000) << 2);
            let network = (layout == StatusLayout::GpsNetwork).then_some(w[5] & 0xff);
            (id, trig, Some(gps as u16), network)
        }
    };

    Ok(StatusPacket {
        version,
        year: (w[0] & 0x7f) as u16 + 2000,
        month: (w[3] & 0x0f) as u8,
        day: ((w[3] >> 4) & 0x1f) as u8,
        hour: ((w[3] >> 9) & 0x1f) as u8,
        minute: (w[2] & 0x3f) as u8,
        second: ((w[2] >> 6) & 0x3f) as u8,
        threshold: (w[1] & 0xff) as u8,
        fifo_status: ((w[2] >> 12) & 0x07) as u8,
        station_id: ascii_id(id_code)?,
        network_id: network_code.map(ascii_id).transpose()?,
        phase_offset,
        trigger_count,
        gps_info,
    })
}

fn ascii_id(code: u32) -> Result<char> {
    char::from_u32(code + ID_ASCII_OFFSET)
        .ok_or_else(|| LmaError::format(format!("invalid id code {}", code)))
}
