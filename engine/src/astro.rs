//! Astrometry helpers
//!
//! Angles are radians everywhere in the engine. Sexagesimal strings are only
//! produced for log output.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

pub const ARCSEC_PER_RADIAN: f64 = 180.0 * 3600.0 / PI;

const SECONDS_PER_JULIAN_YEAR: f64 = 365.25 * 86_400.0;

/// Position on the detector in binned pixels
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PixelPosition {
    pub x: f64,
    pub y: f64,
}

impl PixelPosition {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Equatorial position, radians
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SkyPosition {
    pub ra: f64,
    pub dec: f64,
}

impl SkyPosition {
    pub const fn new(ra: f64, dec: f64) -> Self {
        Self { ra, dec }
    }

    pub fn from_degrees(ra_deg: f64, dec_deg: f64) -> Self {
        Self {
            ra: ra_deg.to_radians(),
            dec: dec_deg.to_radians(),
        }
    }
}

impl std::fmt::Display for SkyPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", format_ra(self.ra), format_dec(self.dec))
    }
}

/// Apparent motion of a target: proper motion relative to a reference epoch
/// plus a non-sidereal tracking rate (solar-system objects).
///
/// RA components are on-sky rates (already multiplied by cos dec).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TargetMotion {
    pub epoch: DateTime<Utc>,
    #[serde(default)]
    pub pm_ra_arcsec_per_year: f64,
    #[serde(default)]
    pub pm_dec_arcsec_per_year: f64,
    #[serde(default)]
    pub ra_rate_arcsec_per_sec: f64,
    #[serde(default)]
    pub dec_rate_arcsec_per_sec: f64,
}

impl TargetMotion {
    /// Position of a target whose catalogue position is `base` at `self.epoch`
    pub fn position_at(&self, base: SkyPosition, at: DateTime<Utc>) -> SkyPosition {
        let elapsed_secs = (at - self.epoch).num_milliseconds() as f64 / 1000.0;
        let years = elapsed_secs / SECONDS_PER_JULIAN_YEAR;

        let on_sky_ra = self.pm_ra_arcsec_per_year * years + self.ra_rate_arcsec_per_sec * elapsed_secs;
        let dec_shift = self.pm_dec_arcsec_per_year * years + self.dec_rate_arcsec_per_sec * elapsed_secs;

        let cos_dec = base.dec.cos();
        let ra_shift = if cos_dec.abs() > 1e-12 { on_sky_ra / cos_dec } else { 0.0 };

        SkyPosition {
            ra: normalize_ra(base.ra + ra_shift / ARCSEC_PER_RADIAN),
            dec: (base.dec + dec_shift / ARCSEC_PER_RADIAN).clamp(-PI / 2.0, PI / 2.0),
        }
    }
}

/// Midpoint of an exposure, used to evaluate moving targets
pub fn exposure_midpoint(start: DateTime<Utc>, end: DateTime<Utc>) -> DateTime<Utc> {
    start + (end - start) / 2
}

/// Gnomonic (TAN) world coordinate solution from the pipeline's astrometric fit
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WcsSolution {
    /// Reference sky position, radians
    pub crval_ra: f64,
    pub crval_dec: f64,
    /// Reference pixel, binned pixels
    pub crpix_x: f64,
    pub crpix_y: f64,
    /// Linear transform, degrees per binned pixel: [[CD1_1, CD1_2], [CD2_1, CD2_2]]
    pub cd: [[f64; 2]; 2],
}

impl WcsSolution {
    /// Project a sky position onto the detector. `None` when the position is
    /// on the far hemisphere or the CD matrix is singular.
    pub fn sky_to_pixel(&self, sky: SkyPosition) -> Option<PixelPosition> {
        let (sin_d0, cos_d0) = self.crval_dec.sin_cos();
        let (sin_d, cos_d) = sky.dec.sin_cos();
        let d_ra = sky.ra - self.crval_ra;
        let cos_c = sin_d0 * sin_d + cos_d0 * cos_d * d_ra.cos();
        if cos_c <= 0.0 {
            return None;
        }

        let xi = (cos_d * d_ra.sin() / cos_c).to_degrees();
        let eta = ((cos_d0 * sin_d - sin_d0 * cos_d * d_ra.cos()) / cos_c).to_degrees();

        let [[a, b], [c, d]] = self.cd;
        let det = a * d - b * c;
        if det.abs() < f64::EPSILON * 1e-6 {
            return None;
        }
        let dx = (d * xi - b * eta) / det;
        let dy = (-c * xi + a * eta) / det;

        Some(PixelPosition::new(self.crpix_x + dx, self.crpix_y + dy))
    }

    /// Inverse projection: detector pixel to sky position
    pub fn pixel_to_sky(&self, pixel: PixelPosition) -> SkyPosition {
        let dx = pixel.x - self.crpix_x;
        let dy = pixel.y - self.crpix_y;
        let [[a, b], [c, d]] = self.cd;
        let xi = (a * dx + b * dy).to_radians();
        let eta = (c * dx + d * dy).to_radians();

        let (sin_d0, cos_d0) = self.crval_dec.sin_cos();
        let denom = cos_d0 - eta * sin_d0;
        let ra = self.crval_ra + xi.atan2(denom);
        let dec = (sin_d0 + eta * cos_d0).atan2((xi * xi + denom * denom).sqrt());

        SkyPosition::new(normalize_ra(ra), dec)
    }
}

/// Wrap RA into [0, 2π)
pub fn normalize_ra(ra: f64) -> f64 {
    let wrapped = ra % (2.0 * PI);
    if wrapped < 0.0 {
        wrapped + 2.0 * PI
    } else {
        wrapped
    }
}

/// Great-circle separation, arcseconds (haversine)
pub fn angular_separation_arcsec(a: SkyPosition, b: SkyPosition) -> f64 {
    let delta_ra = b.ra - a.ra;
    let delta_dec = b.dec - a.dec;

    let h = (delta_dec / 2.0).sin().powi(2) + a.dec.cos() * b.dec.cos() * (delta_ra / 2.0).sin().powi(2);
    let c = 2.0 * h.sqrt().asin();

    c * ARCSEC_PER_RADIAN
}

/// RA as `HH:MM:SS.ss`
pub fn format_ra(ra: f64) -> String {
    let total_secs = normalize_ra(ra).to_degrees() / 15.0 * 3600.0;
    let centis = (total_secs * 100.0).round() as i64 % (24 * 3600 * 100);
    let hours = centis / 360_000;
    let minutes = (centis / 6_000) % 60;
    let seconds = (centis % 6_000) as f64 / 100.0;
    format!("{:02}:{:02}:{:05.2}", hours, minutes, seconds)
}

/// Dec as `+DD:MM:SS.s`
pub fn format_dec(dec: f64) -> String {
    let sign = if dec < 0.0 { '-' } else { '+' };
    let total_secs = dec.abs().to_degrees() * 3600.0;
    let decis = (total_secs * 10.0).round() as i64;
    let degrees = decis / 36_000;
    let minutes = (decis / 600) % 60;
    let seconds = (decis % 600) as f64 / 10.0;
    format!("{}{:02}:{:02}:{:04.1}", sign, degrees, minutes, seconds)
}
