// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::{f64::consts::PI, time::SystemTime};

use astro::{
    angle::{anglr_sepr, limit_to_two_PI},
    nutation::nutation,
    time::{julian_day, mn_sidr, CalType, Date},
};
use chrono::{DateTime, Datelike, Timelike, Utc};

extern crate nalgebra as na;

/// Julian day of the J2000.0 reference epoch.
pub const J2000_JD: f64 = 2451545.0;

const ARCSEC: f64 = PI / (180.0 * 3600.0);

/// Convert ra/dec (radians) to x/y/z on unit sphere.
pub fn to_unit_vector(ra: f64, dec: f64) -> [f64; 3] {
    [
        (ra.cos() * dec.cos()), // x
        (ra.sin() * dec.cos()), // y
        dec.sin(),
    ] // z
}

/// Convert x/y/z on unit sphere to ra/dec (radians). The returned right
/// ascension is in [0, 2pi); at the poles it is zero rather than NaN.
pub fn from_unit_vector(v: &[f64; 3]) -> (f64, f64) {
    let x = v[0];
    let y = v[1];
    let z = v[2];
    let dec = z.clamp(-1.0, 1.0).asin();
    let mut ra = y.atan2(x);
    if ra < 0.0 {
        ra += 2.0 * PI;
    }
    (ra, dec)
}

/// Returns the separation, in radians, between the given celestial coordinates
/// (in radians).
pub fn angular_separation(
    p0_ra: f64,
    p0_dec: f64,
    p1_ra: f64,
    p1_dec: f64,
) -> f64 {
    anglr_sepr(p0_ra, p0_dec, p1_ra, p1_dec)
}

/// Julian day (UTC) corresponding to `time`, including the day fraction.
pub fn julian_day_from_system_time(time: &SystemTime) -> f64 {
    let dt_utc = DateTime::<Utc>::from(*time);
    let day_fraction =
        dt_utc.time().num_seconds_from_midnight() as f64 / 86400.0;
    let date = Date {
        year: dt_utc.date_naive().year() as i16,
        month: dt_utc.date_naive().month() as u8,
        decimal_day: dt_utc.date_naive().day() as f64 + day_fraction,
        cal_type: CalType::Gregorian,
    };
    julian_day(&date)
}

pub fn greenwich_mean_sidereal_time_from_system_time(time: &SystemTime) -> f64 {
    let dt_utc = DateTime::<Utc>::from(*time);
    let date = Date {
        year: dt_utc.date_naive().year() as i16,
        month: dt_utc.date_naive().month() as u8,
        decimal_day: dt_utc.date_naive().day() as f64,
        cal_type: CalType::Gregorian,
    };
    let jd = julian_day(&date);

    let utc_hours = dt_utc.time().num_seconds_from_midnight() as f64 / 3600.0;
    let gmst_hours =
        mn_sidr(jd).to_degrees() / 15.0 + utc_hours * 1.00273790935;

    limit_to_two_PI((gmst_hours * 15.0).to_radians())
}

/// Hour angle (radians, -pi..pi) of a JNOW right ascension `ra` (radians) for
/// an observer at `longitude` (radians, east positive). Negative means the
/// target is east of the meridian, still approaching it.
pub fn hour_angle(ra: f64, longitude: f64, time: &SystemTime) -> f64 {
    let gmst = greenwich_mean_sidereal_time_from_system_time(time);
    // Note that astro::coords::hr_angl_frm_observer_long() has a bug.
    // Fortunately the correct relation is trivial.
    let mut ha = limit_to_two_PI(gmst + longitude - ra);
    if ha > PI {
        ha -= 2.0 * PI;
    }
    ha
}

// Rotation matrices about the coordinate axes (frame rotation convention).
fn rot_x(angle: f64) -> na::Matrix3<f64> {
    let (s, c) = angle.sin_cos();
    na::Matrix3::new(1.0, 0.0, 0.0,
                     0.0, c, s,
                     0.0, -s, c)
}

fn rot_y(angle: f64) -> na::Matrix3<f64> {
    let (s, c) = angle.sin_cos();
    na::Matrix3::new(c, 0.0, -s,
                     0.0, 1.0, 0.0,
                     s, 0.0, c)
}

fn rot_z(angle: f64) -> na::Matrix3<f64> {
    let (s, c) = angle.sin_cos();
    na::Matrix3::new(c, s, 0.0,
                     -s, c, 0.0,
                     0.0, 0.0, 1.0)
}

/// IAU 1976 (Lieske) precession from the mean equator/equinox of J2000.0 to
/// the mean equator/equinox of `jd`. Multiplying a J2000 unit vector by the
/// returned matrix yields the mean-of-date vector.
pub fn precession_matrix(jd: f64) -> na::Matrix3<f64> {
    let t = (jd - J2000_JD) / 36525.0;
    let zeta =
        (2306.2181 * t + 0.30188 * t * t + 0.017998 * t * t * t) * ARCSEC;
    let z = (2306.2181 * t + 1.09468 * t * t + 0.018203 * t * t * t) * ARCSEC;
    let theta =
        (2004.3109 * t - 0.42665 * t * t - 0.041833 * t * t * t) * ARCSEC;

    rot_z(-z) * rot_y(theta) * rot_z(-zeta)
}

// Mean obliquity of the ecliptic (IAU 1980 expression), radians.
fn mean_obliquity(jd: f64) -> f64 {
    let t = (jd - J2000_JD) / 36525.0;
    (84381.448 - 46.8150 * t - 0.00059 * t * t + 0.001813 * t * t * t) * ARCSEC
}

/// Nutation rotation from the mean equator/equinox of `jd` to the true
/// equator/equinox of `jd`.
pub fn nutation_matrix(jd: f64) -> na::Matrix3<f64> {
    let (nut_in_long, nut_in_oblq) = nutation(jd);
    let mean_oblq = mean_obliquity(jd);
    rot_x(-(mean_oblq + nut_in_oblq)) * rot_z(-nut_in_long) * rot_x(mean_oblq)
}

fn j2000_to_jnow_matrix(time: &SystemTime) -> na::Matrix3<f64> {
    let jd = julian_day_from_system_time(time);
    nutation_matrix(jd) * precession_matrix(jd)
}

fn apply_rotation(m: &na::Matrix3<f64>, ra: f64, dec: f64) -> (f64, f64) {
    let v = to_unit_vector(ra, dec);
    let r = m * na::Vector3::new(v[0], v[1], v[2]);
    from_unit_vector(&[r[0], r[1], r[2]])
}

/// Reduce J2000.0 coordinates (radians) to the true equator/equinox of the
/// given instant (precession plus nutation). Safe at the celestial poles.
pub fn precess_j2000_to_jnow(ra: f64, dec: f64, time: &SystemTime)
                             -> (f64, f64) {
    apply_rotation(&j2000_to_jnow_matrix(time), ra, dec)
}

/// Inverse of precess_j2000_to_jnow(). The conversion matrix is orthonormal,
/// so the inverse is its transpose and a round trip reproduces the input to
/// machine precision.
pub fn precess_jnow_to_j2000(ra: f64, dec: f64, time: &SystemTime)
                             -> (f64, f64) {
    apply_rotation(&j2000_to_jnow_matrix(time).transpose(), ra, dec)
}

#[cfg(test)]
mod tests {
    extern crate approx;
    use std::time::Duration;

    use approx::assert_abs_diff_eq;
    use astro::angle::deg_frm_hms;
    use chrono::{FixedOffset, TimeZone};

    use super::*;

    fn system_time(dt: DateTime<FixedOffset>) -> SystemTime {
        SystemTime::UNIX_EPOCH
            .checked_add(Duration::from_secs_f64(
                dt.timestamp_millis() as f64 / 1000.0,
            ))
            .unwrap()
    }

    #[test]
    fn test_ra_dec_xyz() {
        let mut v = to_unit_vector(0.0, PI / 4.0);
        let (mut ra, mut dec) = from_unit_vector(&v);
        assert_abs_diff_eq!(ra, 0.0, epsilon = 0.001);
        assert_abs_diff_eq!(dec, PI / 4.0, epsilon = 0.001);

        v = to_unit_vector(3.0 * PI / 2.0, -PI / 3.0);
        (ra, dec) = from_unit_vector(&v);
        assert_abs_diff_eq!(ra, 3.0 * PI / 2.0, epsilon = 0.001);
        assert_abs_diff_eq!(dec, -PI / 3.0, epsilon = 0.001);

        // Exactly at the pole the right ascension is degenerate; we must get
        // a finite value, not NaN.
        v = to_unit_vector(1.0, PI / 2.0);
        (ra, dec) = from_unit_vector(&v);
        assert!(ra.is_finite());
        assert_abs_diff_eq!(dec, PI / 2.0, epsilon = 1e-9);
    }

    #[test]
    fn test_angular_separation() {
        let p0_ra = PI;
        let p0_dec = 0.0;
        let p1_ra = PI + 1.0;
        let p1_dec = 1.0;

        let sep = angular_separation(p0_ra, p0_dec, p1_ra, p1_dec);
        assert_abs_diff_eq!(sep, 1.27, epsilon = 0.01);

        // Symmetric, and zero for coincident positions.
        assert_abs_diff_eq!(
            sep,
            angular_separation(p1_ra, p1_dec, p0_ra, p0_dec),
            epsilon = 1e-12
        );
        assert_abs_diff_eq!(
            angular_separation(p0_ra, p0_dec, p0_ra, p0_dec),
            0.0,
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_precession_theta_persei() {
        // Meeus, "Astronomical Algorithms", example 21.b: theta Persei
        // (proper motion already applied) reduced from J2000.0 to
        // 2028 Nov 13.19 TD = JD 2462088.69.
        let ra = 41.054063_f64.to_radians();
        let dec = 49.227750_f64.to_radians();

        let m = precession_matrix(2462088.69);
        let (ra_new, dec_new) = apply_rotation(&m, ra, dec);
        assert_abs_diff_eq!(ra_new.to_degrees(), 41.547214, epsilon = 1e-5);
        assert_abs_diff_eq!(dec_new.to_degrees(), 49.348483, epsilon = 1e-5);
    }

    #[test]
    fn test_nutation_1987() {
        // Meeus example 22.a: 1987 April 10.0 TD.
        let (nut_in_long, nut_in_oblq) = nutation(2446895.5);
        assert_abs_diff_eq!(nut_in_long / ARCSEC, -3.788, epsilon = 0.5);
        assert_abs_diff_eq!(nut_in_oblq / ARCSEC, 9.443, epsilon = 0.5);
    }

    #[test]
    fn test_precession_round_trip() {
        let dt = FixedOffset::east_opt(0)
            .unwrap()
            .with_ymd_and_hms(2026, 8, 30, 4, 30, 0)
            .unwrap();
        let time = system_time(dt);

        for dec_deg in [-89.9999, -89.0, -45.0, 0.0, 30.0, 89.0, 89.9999] {
            for ra_hours in [0.0, 5.5, 12.0, 23.9] {
                let ra = (ra_hours * 15.0_f64).to_radians();
                let dec = dec_deg * PI / 180.0;
                let (ra_now, dec_now) = precess_j2000_to_jnow(ra, dec, &time);
                assert!(ra_now.is_finite() && dec_now.is_finite());
                assert!((0.0..2.0 * PI).contains(&ra_now));
                let (ra_back, dec_back) =
                    precess_jnow_to_j2000(ra_now, dec_now, &time);
                let err = angular_separation(ra, dec, ra_back, dec_back);
                assert!(err < ARCSEC, "round trip error {} rad", err);
            }
        }
    }

    #[test]
    fn test_precession_magnitude() {
        // Roughly 26 years past J2000 the total correction for an equatorial
        // target is on the order of 20 arcminutes, never more than a degree.
        let dt = FixedOffset::east_opt(0)
            .unwrap()
            .with_ymd_and_hms(2026, 1, 1, 0, 0, 0)
            .unwrap();
        let time = system_time(dt);
        let ra = deg_frm_hms(10, 0, 0.0).to_radians();
        let dec = 20.0_f64.to_radians();
        let (ra_now, dec_now) = precess_j2000_to_jnow(ra, dec, &time);
        let shift = angular_separation(ra, dec, ra_now, dec_now);
        assert!(shift > 60.0 * ARCSEC);
        assert!(shift < 3600.0 * ARCSEC);
    }

    #[test]
    fn test_hour_angle_mizar() {
        let mizar_ra = deg_frm_hms(13, 23, 55.5).to_radians();
        let dt = FixedOffset::west_opt(8 * 3600)
            .unwrap()
            .with_ymd_and_hms(2024, 3, 7, 23, 56, 0)
            .unwrap();
        let time = system_time(dt);
        let long = -122_f64.to_radians();

        // Expected value obtained from SkySafari.
        let ha = hour_angle(mizar_ra, long, &time);
        assert_abs_diff_eq!(
            ha,
            -deg_frm_hms(2, 29, 50.9).to_radians(),
            epsilon = 0.01
        );
    }
}
