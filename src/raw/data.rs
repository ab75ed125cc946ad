// Data record decoding
//
// Each data record is one above-threshold peak: the window it fell in, the
// 25 MHz tick inside that window, how long the signal stayed above threshold
// and the peak amplitude code.

use super::{format_for, read_words, write_words, DataLayout};
use crate::constants::{DATA_SIZE, POWER_DBM_OFFSET, POWER_DBM_PER_CODE, SAMPLE_CLOCK_HZ};
use crate::error::{LmaError, Result};

/// One decoded peak.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DataPacket {
    pub window: u32,
    pub ticks: u16,
    pub above_threshold: u16,
    pub max_amplitude: u8,
    /// Arrival time in ns since the start of the epoch second.
    pub arrival_ns: f64,
    pub power_dbm: f64,
}

/// Raw fields of a data record, before the clock correction is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataFields {
    pub window: u32,
    pub ticks: u16,
    pub above_threshold: u16,
    pub max_amplitude: u8,
}

/// Sample period in ns for a station clock running `phase_offset` ticks fast.
pub fn sample_period_ns(phase_offset: i32) -> f64 {
    1e9 / (SAMPLE_CLOCK_HZ + phase_offset as f64)
}

/// Converts an amplitude code to dBm.
pub fn power_dbm(max_amplitude: u8) -> f64 {
    POWER_DBM_PER_CODE * max_amplitude as f64 + POWER_DBM_OFFSET
}

impl DataLayout {
    /// Extracts the fields of a record whose sign pattern was already checked.
    pub fn extract(&self, words: [u16; 3]) -> DataFields {
        let [w0, w1, w2] = words.map(|w| w as u32);

        let ticks = w0 & ((1 << self.tick_bits()) - 1);
        let window = match self {
            DataLayout::Legacy80us | DataLayout::Window80us => w1 & 0x3fff,
            DataLayout::Legacy10us | DataLayout::Window10us => (w1 & 0x3fff) | (((w0 >> 8) & 0x7) << 14),
        };
        let (above_high, max_amplitude) = if self.is_legacy() {
            ((w2 & 0x7f) << 4, (w2 >> 7) & 0xff)
        } else {
            ((w2 & 0x7f00) >> 4, w2 & 0xff)
        };

        DataFields {
            window,
            ticks: ticks as u16,
            above_threshold: (((w0 >> 11) & 0xf) | above_high) as u16,
            max_amplitude: max_amplitude as u8,
        }
    }

    /// Packs fields into a record. Fails if a field is wider than the layout.
    pub fn encode(&self, fields: &DataFields) -> Result<[u8; DATA_SIZE]> {
        let ticks = fields.ticks as u32;
        let window = fields.window;
        let above = fields.above_threshold as u32;
        let max = fields.max_amplitude as u32;

        if ticks >> self.tick_bits() != 0 {
            return Err(LmaError::format(format!("ticks {} too wide for {:?}", ticks, self)));
        }
        if window >> self.window_bits() != 0 {
            return Err(LmaError::format(format!("window {} too wide for {:?}", window, self)));
        }
        if above >> 11 != 0 {
            return Err(LmaError::format(format!("above-threshold {} too wide", above)));
        }

        let mut w0 = ticks | ((above & 0xf) << 11);
        if self.window_bits() > 14 {
            w0 |= (window >> 14) << 8;
        }
        let w1 = 0xc000 | (window & 0x3fff);
        let w2 = if self.is_legacy() {
            (max << 7) | (above >> 4)
        } else {
            ((above >> 4) << 8) | max
        };

        let bytes = write_words(&[w0 as u16, w1 as u16, w2 as u16]);
        let mut out = [0u8; DATA_SIZE];
        out.copy_from_slice(&bytes);
        Ok(out)
    }
}

/// Decodes one data record from the start of `bytes`.
///
/// The words must go (non-negative, negative, non-negative).
pub fn decode_data(bytes: &[u8], version: u8, phase_offset: i32) -> Result<DataPacket> {
    if bytes.len() < DATA_SIZE {
        return Err(LmaError::format(format!(
            "truncated data record: {} of {} bytes",
            bytes.len(),
            DATA_SIZE
        )));
    }
    let words: [i16; 3] = read_words(&bytes[..DATA_SIZE]);
    if words[0] < 0 || words[1] >= 0 || words[2] < 0 {
        return Err(LmaError::format(format!(
            "data record is not (+,-,+): {:04x} {:04x} {:04x}",
            words[0] as u16, words[1] as u16, words[2] as u16
        )));
    }

    let layout = format_for(version)?.data;
    let fields = layout.extract(words.map(|w| w as u16));

    let arrival_ns = fields.window as f64 * layout.window_ns()
        + (fields.ticks as f64 * sample_period_ns(phase_offset)).round();

    Ok(DataPacket {
        window: fields.window,
        ticks: fields.ticks,
        above_threshold: fields.above_threshold,
        max_amplitude: fields.max_amplitude,
        arrival_ns,
        power_dbm: power_dbm(fields.max_amplitude),
    })
}
