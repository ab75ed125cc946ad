// LMA raw packet decoding
//
// Raw files are streams of little-endian signed 16-bit words. Status records
// have every word negative, data records go (+, -, +).

pub mod data;
pub mod gps;
pub mod status;

use crate::constants::{LEGACY_STATUS_SIZE, STATUS_SIZE, WINDOW_10US_NS, WINDOW_80US_NS};
use crate::error::{LmaError, Result};

pub use data::{decode_data, DataPacket};
pub use gps::GpsState;
pub use status::{decode_status, has_sync, peek_version, StatusPacket};

/// Bit layout of a status record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusLayout {
    /// v8/9: 6 words, 7-bit id, 5-bit phase offset, no GPS telemetry
    Legacy,
    /// v10/11: 9 words, 8-bit id, 15-bit phase offset, GPS telemetry
    Gps,
    /// v12/13: v10/11 plus a network id
    GpsNetwork,
}

impl StatusLayout {
    pub fn words(&self) -> usize {
        self.size() / 2
    }

    pub fn size(&self) -> usize {
        match self {
            StatusLayout::Legacy => LEGACY_STATUS_SIZE,
            StatusLayout::Gps | StatusLayout::GpsNetwork => STATUS_SIZE,
        }
    }
}

/// Bit layout of a data record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataLayout {
    /// v8: 80 us windows, amplitude in the upper byte of word 2
    Legacy80us,
    /// v9: 10 us windows, amplitude in the upper byte of word 2
    Legacy10us,
    /// v10/12: 80 us windows
    Window80us,
    /// v11/13: 10 us windows, window index borrows 3 bits of word 0
    Window10us,
}

impl DataLayout {
    /// Window length in ns.
    pub fn window_ns(&self) -> f64 {
        match self {
            DataLayout::Legacy80us | DataLayout::Window80us => WINDOW_80US_NS,
            DataLayout::Legacy10us | DataLayout::Window10us => WINDOW_10US_NS,
        }
    }

    /// Width of the intra-window tick field.
    pub fn tick_bits(&self) -> u32 {
        match self {
            DataLayout::Legacy80us | DataLayout::Window80us => 11,
            DataLayout::Legacy10us | DataLayout::Window10us => 8,
        }
    }

    /// Width of the window index field.
    pub fn window_bits(&self) -> u32 {
        match self {
            DataLayout::Legacy80us | DataLayout::Window80us => 14,
            DataLayout::Legacy10us | DataLayout::Window10us => 17,
        }
    }

    fn is_legacy(&self) -> bool {
        matches!(self, DataLayout::Legacy80us | DataLayout::Legacy10us)
    }
}

/// One supported firmware format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Format {
    pub version: u8,
    pub status: StatusLayout,
    pub data: DataLayout,
}

const FORMATS: [Format; 6] = [
    Format { version: 8, status: StatusLayout::Legacy, data: DataLayout::Legacy80us },
    Format { version: 9, status: StatusLayout::Legacy, data: DataLayout::Legacy10us },
    Format { version: 10, status: StatusLayout::Gps, data: DataLayout::Window80us },
    Format { version: 11, status: StatusLayout::Gps, data: DataLayout::Window10us },
    Format { version: 12, status: StatusLayout::GpsNetwork, data: DataLayout::Window80us },
    Format { version: 13, status: StatusLayout::GpsNetwork, data: DataLayout::Window10us },
];

/// Looks up the format for a version number.
pub fn format_for(version: u8) -> Result<&'static Format> {
    FORMATS
        .iter()
        .find(|f| f.version == version)
        .ok_or(LmaError::UnsupportedVersion(version))
}

/// Status record size for a version, 12 bytes before v10 and 18 after.
pub fn status_size(version: u8) -> usize {
    if version >= 10 {
        STATUS_SIZE
    } else {
        LEGACY_STATUS_SIZE
    }
}

/// Reads up to `N` little-endian signed words; missing words stay zero.
pub(crate) fn read_words<const N: usize>(bytes: &[u8]) -> [i16; N] {
    let mut words = [0i16; N];
    for (w, pair) in words.iter_mut().zip(bytes.chunks_exact(2)) {
        *w = i16::from_le_bytes([pair[0], pair[1]]);
    }
    words
}

pub(crate) fn write_words(words: &[u16]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_le_bytes()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_table() {
        assert_eq!(format_for(8).unwrap().data, DataLayout::Legacy80us);
        assert_eq!(format_for(11).unwrap().status, StatusLayout::Gps);
        assert_eq!(format_for(13).unwrap().data, DataLayout::Window10us);
        assert!(matches!(format_for(7), Err(LmaError::UnsupportedVersion(7))));
        assert!(matches!(format_for(14), Err(LmaError::UnsupportedVersion(14))));
    }

    #[test]
    fn test_status_sizes_agree_with_layouts() {
        for f in FORMATS.iter() {
            assert_eq!(status_size(f.version), f.status.size());
        }
        assert_eq!(StatusLayout::Legacy.words(), 6);
        assert_eq!(StatusLayout::GpsNetwork.words(), 9);
    }

    #[test]
    fn test_read_words_little_endian() {
        let words: [i16; 2] = read_words(&[0x34, 0x12, 0x00, 0x80]);
        assert_eq!(words, [0x1234, i16::MIN]);
    }
}
