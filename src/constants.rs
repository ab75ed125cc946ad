// Shared constants for decoding and locating

/// Speed of light in vacuum (m/ns).
pub const C_NS: f64 = 0.299792458;

/// Expected RMS timing error of a station (ns). Scales the quality score.
pub const RMS_TIMING_NS: f64 = 70.0;

/// Nominal station sample clock (Hz). The phase offset is added to this.
pub const SAMPLE_CLOCK_HZ: f64 = 25_000_000.0;

/// Window length of 80 us firmware (ns).
pub const WINDOW_80US_NS: f64 = 80_000.0;

/// Window length of 10 us firmware (ns).
pub const WINDOW_10US_NS: f64 = 10_000.0;

/// dBm per amplitude code.
pub const POWER_DBM_PER_CODE: f64 = 0.488;

/// Power of amplitude code zero (dBm).
pub const POWER_DBM_OFFSET: f64 = -111.0;

/// Size of a data record (bytes).
pub const DATA_SIZE: usize = 6;

/// Size of a legacy (v8/9) status record (bytes).
pub const LEGACY_STATUS_SIZE: usize = 12;

/// Size of a v10+ status record (bytes).
pub const STATUS_SIZE: usize = 18;

/// Stride used when probing for status records in decimated files (bytes).
pub const PROBE_STRIDE: usize = 3;

/// Station ids and network ids are stored offset by this much from ASCII.
pub const ID_ASCII_OFFSET: u32 = 64;

/// Scale of GPS latitude/longitude integers (degrees per count).
pub const GPS_DEGREES_PER_COUNT: f64 = 90.0 / 324_000_000.0;

/// Registry and frame positions further apart than this are reported (m).
pub const RECONCILE_TOLERANCE_M: f64 = 10.0;

/// Default clustering window (ns).
pub const DEFAULT_WINDOW_NS: f64 = 80_000.0;

/// Default minimum distinct station threshold.
pub const DEFAULT_MIN_STATIONS: usize = 5;

/// Fixes that moved further than this from their initial guess are dropped (m).
pub const MAX_FIX_DISPLACEMENT_M: f64 = 250_000.0;

/// Fixes with a larger RMS residual are dropped (ns).
pub const MAX_FIX_RMS_NS: f64 = 10_000.0;

/// Solver max iterations.
pub const SOLVER_MAX_ITERATIONS: usize = 165;
