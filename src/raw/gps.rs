// GPS telemetry carried in status records
//
// Each status record carries 16 bits of GPS telemetry. Which field those bits
// belong to depends on `second % 12`, so a full fix takes twelve records.

use super::StatusPacket;
use crate::constants::GPS_DEGREES_PER_COUNT;
use crate::geodesy::Geodetic;

const LAT_HIGH: u16 = 1 << 0;
const LAT_LOW: u16 = 1 << 1;
const LON_HIGH: u16 = 1 << 2;
const LON_LOW: u16 = 1 << 3;
const ALT_HIGH: u16 = 1 << 4;
const ALT_LOW: u16 = 1 << 5;
const POSITION_MASK: u16 = LAT_HIGH | LAT_LOW | LON_HIGH | LON_LOW | ALT_HIGH | ALT_LOW;

/// Running GPS telemetry accumulated across successive status records.
///
/// Values are threaded explicitly: `state = state.advance(&status)`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GpsState {
    lat: u32,
    lon: u32,
    alt: u32,
    vel: u32,
    bearing: Option<u16>,
    satellites_tracked: Option<u8>,
    satellites_visible: Option<u8>,
    satellite_status: Option<u16>,
    temperature_c: Option<i32>,
    /// One bit per 12-second phase seen so far
    seen: u16,
}

fn set_high(word: u32, info: u16) -> u32 {
    ((info as u32) << 16) | (word & 0xffff)
}

fn set_low(word: u32, info: u16) -> u32 {
    (info as u32) | (word & 0xffff_0000)
}

impl GpsState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the state after folding in one status record.
    ///
    /// Records without telemetry (pre-v10) leave the state unchanged.
    pub fn advance(self, status: &StatusPacket) -> GpsState {
        let Some(info) = status.gps_info else {
            return self;
        };
        let phase = status.second % 12;
        let mut next = self;
        match phase {
            0 => next.lat = set_high(next.lat, info),
            1 => next.lat = set_low(next.lat, info),
            2 => next.lon = set_high(next.lon, info),
            3 => next.lon = set_low(next.lon, info),
            4 => next.alt = set_high(next.alt, info),
            5 => next.alt = set_low(next.alt, info),
            6 => next.vel = set_high(next.vel, info),
            7 => next.vel = set_low(next.vel, info),
            8 => next.bearing = Some(info),
            9 => {
                next.satellites_tracked = Some((info >> 8) as u8);
                next.satellites_visible = Some((info & 0xff) as u8);
            }
            10 => next.satellite_status = Some(info & 0x0fff),
            _ => next.temperature_c = Some((info >> 8) as i32 - 40),
        }
        next.seen |= 1 << phase;
        next
    }

    /// Position once both halves of latitude, longitude and altitude arrived.
    pub fn position(&self) -> Option<Geodetic> {
        if self.seen & POSITION_MASK != POSITION_MASK {
            return None;
        }
        Some(Geodetic::new(
            self.lat as i32 as f64 * GPS_DEGREES_PER_COUNT,
            self.lon as i32 as f64 * GPS_DEGREES_PER_COUNT,
            self.alt as i32 as f64 / 100.0,
        ))
    }

    /// Raw velocity word, once both halves arrived.
    pub fn velocity(&self) -> Option<u32> {
        (self.seen & 0xc0 == 0xc0).then_some(self.vel)
    }

    pub fn bearing(&self) -> Option<u16> {
        self.bearing
    }

    /// (tracked, visible) satellite counts.
    pub fn satellites(&self) -> Option<(u8, u8)> {
        self.satellites_tracked.zip(self.satellites_visible)
    }

    pub fn satellite_status(&self) -> Option<u16> {
        self.satellite_status
    }

    pub fn temperature_c(&self) -> Option<i32> {
        self.temperature_c
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::raw::status::tests::sample;

    /// The twelve 16-bit slices that spell out `position`, starting at second 0.
    pub(crate) fn telemetry_cycle(position: &Geodetic) -> [u16; 12] {
        let lat = (position.lat / GPS_DEGREES_PER_COUNT).round() as i32 as u32;
        let lon = (position.lon / GPS_DEGREES_PER_COUNT).round() as i32 as u32;
        let alt = (position.alt * 100.0).round() as i32 as u32;
        [
            (lat >> 16) as u16,
            lat as u16,
            (lon >> 16) as u16,
            lon as u16,
            (alt >> 16) as u16,
            alt as u16,
            0,
            250,
            271,
            (9 << 8) | 11,
            0x0123,
            (65 << 8) | 0x2a,
        ]
    }

    fn status_at(second: u8, info: u16) -> StatusPacket {
        let mut status = sample(10);
        status.second = second;
        status.gps_info = Some(info);
        status
    }

    #[test]
    fn test_full_cycle_yields_position() {
        let truth = Geodetic::new(34.0547, -106.9081, 1612.37);
        let cycle = telemetry_cycle(&truth);

        let mut state = GpsState::new();
        for (second, info) in cycle.iter().enumerate() {
            if second < 6 {
                assert!(state.position().is_none(), "position before second {}", second);
            }
            state = state.advance(&status_at(second as u8 + 24, *info));
        }

        let position = state.position().unwrap();
        assert!((position.lat - truth.lat).abs() < 1e-6);
        assert!((position.lon - truth.lon).abs() < 1e-6);
        assert!((position.alt - truth.alt).abs() < 0.01);
        assert_eq!(state.velocity(), Some(250));
        assert_eq!(state.bearing(), Some(271));
        assert_eq!(state.satellites(), Some((9, 11)));
        assert_eq!(state.satellite_status(), Some(0x0123));
        assert_eq!(state.temperature_c(), Some(25));
    }

    #[test]
    fn test_state_is_a_value() {
        let before = GpsState::new();
        let after = before.advance(&status_at(0, 0x1234));
        assert_eq!(before, GpsState::new());
        assert_ne!(before, after);
    }

    #[test]
    fn test_low_half_keeps_high_half() {
        let state = GpsState::new()
            .advance(&status_at(0, 0xffff))
            .advance(&status_at(1, 0x0001));
        assert_eq!(state.lat, 0xffff_0001);

        let state = state.advance(&status_at(12, 0x0002));
        assert_eq!(state.lat, 0x0002_0001);
    }

    #[test]
    fn test_legacy_status_leaves_state_alone() {
        let state = GpsState::new().advance(&status_at(0, 0x1234));
        assert_eq!(state.advance(&sample(8)), state);
    }
}
