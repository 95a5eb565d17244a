// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::fmt;
use std::time::SystemTime;

use canonical_error::{invalid_argument_error, CanonicalError};

use crate::astro_util::{
    angular_separation, precess_j2000_to_jnow, precess_jnow_to_j2000,
};

/// Coordinate reference epoch. JNOW is the true equator/equinox of the current
/// instant (precession plus nutation applied relative to J2000.0).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Epoch {
    J2000,
    Jnow,
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Epoch::J2000 => write!(f, "J2000"),
            Epoch::Jnow => write!(f, "JNOW"),
        }
    }
}

/// An equatorial sky position. The epoch tag always travels with the
/// coordinate values; separations across mismatched epochs are refused rather
/// than silently computed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SkyPosition {
    // Right ascension in hours, [0, 24).
    pub ra_hours: f64,
    // Declination in degrees, [-90, 90].
    pub dec_deg: f64,
    pub epoch: Epoch,
}

impl SkyPosition {
    pub fn new(ra_hours: f64, dec_deg: f64, epoch: Epoch) -> Self {
        SkyPosition {
            ra_hours: normalize_ra_hours(ra_hours),
            dec_deg,
            epoch,
        }
    }

    pub fn from_radians(ra: f64, dec: f64, epoch: Epoch) -> Self {
        Self::new(ra.to_degrees() / 15.0, dec.to_degrees(), epoch)
    }

    pub fn ra_deg(&self) -> f64 {
        self.ra_hours * 15.0
    }

    pub fn ra_rad(&self) -> f64 {
        self.ra_deg().to_radians()
    }

    pub fn dec_rad(&self) -> f64 {
        self.dec_deg.to_radians()
    }

    /// Returns this position expressed in `epoch`, converting at the given
    /// instant. A no-op when the epoch already matches.
    pub fn to_epoch(&self, epoch: Epoch, time: &SystemTime) -> SkyPosition {
        if self.epoch == epoch {
            return *self;
        }
        let (ra, dec) = match epoch {
            Epoch::Jnow =>
                precess_j2000_to_jnow(self.ra_rad(), self.dec_rad(), time),
            Epoch::J2000 =>
                precess_jnow_to_j2000(self.ra_rad(), self.dec_rad(), time),
        };
        SkyPosition::from_radians(ra, dec, epoch)
    }

    /// Great-circle separation from `other`, in degrees. Both positions must
    /// carry the same epoch tag; convert explicitly first if they do not.
    pub fn separation_from(&self, other: &SkyPosition)
                           -> Result<f64, CanonicalError> {
        if self.epoch != other.epoch {
            return Err(invalid_argument_error(
                format!("epoch mismatch: {} vs {}",
                        self.epoch, other.epoch).as_str()));
        }
        Ok(angular_separation(self.ra_rad(), self.dec_rad(),
                              other.ra_rad(), other.dec_rad())
           .to_degrees())
    }

    /// Formats the right ascension as HH:MM:SS.S.
    pub fn format_ra_hms(&self) -> String {
        let total_ds = (self.ra_hours * 36000.0).round() as i64;
        // Carry 24:00:00.0 back to zero.
        let total_ds = total_ds.rem_euclid(24 * 36000);
        format!("{:02}:{:02}:{:02}.{}",
                total_ds / 36000,
                total_ds / 600 % 60,
                total_ds / 10 % 60,
                total_ds % 10)
    }

    /// Formats the declination as +DD:MM:SS.
    pub fn format_dec_dms(&self) -> String {
        let sign = if self.dec_deg < 0.0 { '-' } else { '+' };
        let total_sec = (self.dec_deg.abs() * 3600.0).round() as i64;
        format!("{}{:02}:{:02}:{:02}",
                sign,
                total_sec / 3600,
                total_sec / 60 % 60,
                total_sec % 60)
    }
}

impl fmt::Display for SkyPosition {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} {} ({})",
               self.format_ra_hms(), self.format_dec_dms(), self.epoch)
    }
}

fn normalize_ra_hours(ra_hours: f64) -> f64 {
    let ra = ra_hours.rem_euclid(24.0);
    // rem_euclid can yield 24.0 for tiny negative inputs.
    if ra >= 24.0 { 0.0 } else { ra }
}

// Splits a sexagesimal string on the separators used by humans and by LX200
// replies (colon, space, and the degree/minute punctuation).
fn sexagesimal_fields(s: &str) -> Vec<&str> {
    s.split(|c: char| matches!(c, ':' | ' ' | '*' | '\'' | 'h' | 'm' | 'd'))
        .filter(|f| !f.is_empty())
        .collect()
}

/// Parses "HH:MM:SS[.s]" (also "HH MM SS") into hours. Seconds and minutes
/// fields may be omitted.
pub fn parse_ra_hms(s: &str) -> Result<f64, CanonicalError> {
    let s = s.trim().trim_end_matches('s');
    let fields = sexagesimal_fields(s);
    if fields.is_empty() || fields.len() > 3 {
        return Err(invalid_argument_error(
            format!("malformed RA '{}'", s).as_str()));
    }
    let mut hours = 0.0;
    let mut scale = 1.0;
    for field in &fields {
        let value: f64 = field.parse().map_err(|_| invalid_argument_error(
            format!("malformed RA '{}'", s).as_str()))?;
        if value < 0.0 {
            return Err(invalid_argument_error(
                format!("negative RA '{}'", s).as_str()));
        }
        hours += value * scale;
        scale /= 60.0;
    }
    if hours >= 24.0 {
        return Err(invalid_argument_error(
            format!("RA '{}' out of range", s).as_str()));
    }
    Ok(hours)
}

/// Parses "+DD:MM:SS[.s]" (also "-DD*MM'SS" as in LX200 replies) into
/// degrees, sign aware including "-00".
pub fn parse_dec_dms(s: &str) -> Result<f64, CanonicalError> {
    let s = s.trim().trim_end_matches('s').trim_end_matches('"');
    let (negative, rest) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };
    let fields = sexagesimal_fields(rest);
    if fields.is_empty() || fields.len() > 3 {
        return Err(invalid_argument_error(
            format!("malformed declination '{}'", s).as_str()));
    }
    let mut degrees = 0.0;
    let mut scale = 1.0;
    for field in &fields {
        let value: f64 = field.parse().map_err(|_| invalid_argument_error(
            format!("malformed declination '{}'", s).as_str()))?;
        if value < 0.0 {
            return Err(invalid_argument_error(
                format!("malformed declination '{}'", s).as_str()));
        }
        degrees += value * scale;
        scale /= 60.0;
    }
    if degrees > 90.0 {
        return Err(invalid_argument_error(
            format!("declination '{}' out of range", s).as_str()));
    }
    Ok(if negative { -degrees } else { degrees })
}
