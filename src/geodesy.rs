// Geodesy module - coordinate transformations and distance calculations
//
// Provides conversions between:
// - LLH (Latitude/Longitude/Height) in degrees and meters
// - ECEF (Earth-Centered Earth-Fixed) in meters
//
// Uses WGS84 ellipsoid model for Earth

use std::f64::consts::PI;

use serde::{Deserialize, Serialize};

use crate::error::{LmaError, Result};

/// Degrees to radians conversion factor
const DTOR: f64 = PI / 180.0;

/// Radians to degrees conversion factor
const RTOD: f64 = 180.0 / PI;

/// WGS84 ellipsoid semi-major axis (equatorial radius) in meters
const WGS84_A: f64 = 6378137.0;

/// WGS84 ellipsoid flattening factor
const WGS84_F: f64 = 1.0 / 298.257223563;

/// WGS84 ellipsoid semi-minor axis (polar radius) in meters
const WGS84_B: f64 = WGS84_A * (1.0 - WGS84_F);

/// WGS84 ellipsoid eccentricity squared
const WGS84_ECC_SQ: f64 = 1.0 - (WGS84_B * WGS84_B) / (WGS84_A * WGS84_A);

const VINCENTY_MAX_ITERATIONS: usize = 200;
const VINCENTY_CONVERGENCE: f64 = 1e-12;

#[inline]
fn wgs84_ep2_b() -> f64 {
    let a_sq = WGS84_A * WGS84_A;
    let b_sq = WGS84_B * WGS84_B;
    (a_sq - b_sq) / b_sq * WGS84_B
}

#[inline]
fn wgs84_e2_a() -> f64 {
    WGS84_ECC_SQ * WGS84_A
}

/// Latitude/longitude in degrees, altitude in meters above the ellipsoid.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Geodetic {
    pub lat: f64,
    pub lon: f64,
    pub alt: f64,
}

impl Geodetic {
    pub fn new(lat: f64, lon: f64, alt: f64) -> Self {
        Geodetic { lat, lon, alt }
    }

    pub fn to_cartesian(&self) -> Cartesian {
        let (x, y, z) = llh2ecef(self.lat, self.lon, self.alt);
        Cartesian { x, y, z }
    }

    /// Surface distance to `other`, ignoring altitude.
    pub fn surface_distance(&self, other: &Geodetic) -> Result<f64> {
        vincenty(self.lat, self.lon, other.lat, other.lon)
    }
}

/// ECEF coordinates in meters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Cartesian {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Cartesian {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Cartesian { x, y, z }
    }

    pub fn to_geodetic(&self) -> Geodetic {
        let (lat, lon, alt) = ecef2llh(self.x, self.y, self.z);
        Geodetic { lat, lon, alt }
    }

    pub fn as_tuple(&self) -> (f64, f64, f64) {
        (self.x, self.y, self.z)
    }

    pub fn distance(&self, other: &Cartesian) -> f64 {
        ecef_distance(self.as_tuple(), other.as_tuple())
    }
}

/// Converts from WGS84 lat/lon/height to ellipsoid-earth ECEF coordinates
///
/// # Arguments
/// * `lat` - Latitude in degrees
/// * `lon` - Longitude in degrees
/// * `alt` - Altitude in meters above WGS84 ellipsoid
///
/// # Returns
/// ECEF coordinates (x, y, z) in meters
pub fn llh2ecef(lat: f64, lon: f64, alt: f64) -> (f64, f64, f64) {
    let lat_rad = lat * DTOR;
    let lon_rad = lon * DTOR;

    let slat = lat_rad.sin();
    let slon = lon_rad.sin();
    let clat = lat_rad.cos();
    let clon = lon_rad.cos();

    // Radius of curvature in prime vertical
    let d = (1.0 - (slat * slat * WGS84_ECC_SQ)).sqrt();
    let rn = WGS84_A / d;

    let x = (rn + alt) * clat * clon;
    let y = (rn + alt) * clat * slon;
    let z = (rn * (1.0 - WGS84_ECC_SQ) + alt) * slat;

    (x, y, z)
}

/// Converts from ECEF to WGS84 lat/lon/height
///
/// Uses Bowring's closed-form approximation, good to well under a millimetre
/// near the surface.
///
/// # Returns
/// (latitude, longitude, altitude) where lat/lon are in degrees and altitude in meters
pub fn ecef2llh(x: f64, y: f64, z: f64) -> (f64, f64, f64) {
    let lon = y.atan2(x);

    let p = (x * x + y * y).sqrt();
    let th = (WGS84_A * z).atan2(WGS84_B * p);

    let sin_th = th.sin();
    let cos_th = th.cos();

    let lat = (z + wgs84_ep2_b() * sin_th * sin_th * sin_th)
        .atan2(p - wgs84_e2_a() * cos_th * cos_th * cos_th);

    let sin_lat = lat.sin();
    let cos_lat = lat.cos();
    let n = WGS84_A / (1.0 - WGS84_ECC_SQ * sin_lat * sin_lat).sqrt();
    let alt = p / cos_lat - n;

    (lat * RTOD, lon * RTOD, alt)
}

/// Returns straight-line (Euclidean) distance in meters between two ECEF points
#[inline]
pub fn ecef_distance(p0: (f64, f64, f64), p1: (f64, f64, f64)) -> f64 {
    let dx = p0.0 - p1.0;
    let dy = p0.1 - p1.1;
    let dz = p0.2 - p1.2;
    (dx * dx + dy * dy + dz * dz).sqrt()
}

/// Ellipsoidal surface distance in meters between two lat/lon points
/// (Vincenty inverse formula).
///
/// Fails with `GeodesicOutOfRange` when the iteration does not converge,
/// which happens for nearly antipodal points.
pub fn vincenty(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> Result<f64> {
    if lat1 == lat2 && lon1 == lon2 {
        return Ok(0.0);
    }
    if !(lat1.is_finite() && lon1.is_finite() && lat2.is_finite() && lon2.is_finite()) {
        return Err(LmaError::GeodesicOutOfRange);
    }

    let u1 = ((1.0 - WGS84_F) * (lat1 * DTOR).tan()).atan();
    let u2 = ((1.0 - WGS84_F) * (lat2 * DTOR).tan()).atan();
    let l = (lon2 - lon1) * DTOR;
    let mut lambda = l;

    let (sin_u1, cos_u1) = u1.sin_cos();
    let (sin_u2, cos_u2) = u2.sin_cos();

    for _ in 0..VINCENTY_MAX_ITERATIONS {
        let (sin_lambda, cos_lambda) = lambda.sin_cos();
        let sin_sigma = ((cos_u2 * sin_lambda).powi(2)
            + (cos_u1 * sin_u2 - sin_u1 * cos_u2 * cos_lambda).powi(2))
        .sqrt();
        if sin_sigma == 0.0 {
            return Ok(0.0);
        }
        let cos_sigma = sin_u1 * sin_u2 + cos_u1 * cos_u2 * cos_lambda;
        let sigma = sin_sigma.atan2(cos_sigma);
        let sin_alpha = cos_u1 * cos_u2 * sin_lambda / sin_sigma;
        let cos_sq_alpha = 1.0 - sin_alpha * sin_alpha;
        let cos_2sigma_m = if cos_sq_alpha == 0.0 {
            0.0
        } else {
            cos_sigma - 2.0 * sin_u1 * sin_u2 / cos_sq_alpha
        };

        let c = WGS84_F / 16.0 * cos_sq_alpha * (4.0 + WGS84_F * (4.0 - 3.0 * cos_sq_alpha));
        let lambda_prev = lambda;
        lambda = l
            + (1.0 - c)
                * WGS84_F
                * sin_alpha
                * (sigma
                    + c * sin_sigma
                        * (cos_2sigma_m + c * cos_sigma * (-1.0 + 2.0 * cos_2sigma_m * cos_2sigma_m)));

        if (lambda - lambda_prev).abs() < VINCENTY_CONVERGENCE {
            let u_sq = cos_sq_alpha * (WGS84_A * WGS84_A - WGS84_B * WGS84_B) / (WGS84_B * WGS84_B);
            let a = 1.0 + u_sq / 16384.0 * (4096.0 + u_sq * (-768.0 + u_sq * (320.0 - 175.0 * u_sq)));
            let b = u_sq / 1024.0 * (256.0 + u_sq * (-128.0 + u_sq * (74.0 - 47.0 * u_sq)));
            let delta_sigma = b
                * sin_sigma
                * (cos_2sigma_m
                    + b / 4.0
                        * (cos_sigma * (-1.0 + 2.0 * cos_2sigma_m * cos_2sigma_m)
                            - b / 6.0
                                * cos_2sigma_m
                                * (-3.0 + 4.0 * sin_sigma * sin_sigma)
                                * (-3.0 + 4.0 * cos_2sigma_m * cos_2sigma_m)));
            return Ok(WGS84_B * a * (sigma - delta_sigma));
        }
    }

    Err(LmaError::GeodesicOutOfRange)
}
