// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

// Conversions between the three forms a celestial coordinate takes on its way
// from the plate solver to Stellarium:
//
// * Sexagesimal strings, as printed by astrometry.net: "H:M:S" for right
//   ascension and "D:M:S" for declination.
// * Radians.
// * The Stellarium Telescope Protocol's fixed point integers: right ascension
//   is an unsigned 32 bit value where 2^32 is the full circle (24 hours), and
//   declination is a signed 32 bit value where 2^30 is 90 degrees.

use std::f64::consts::PI;
use std::sync::LazyLock;

use chrono::{Local, TimeZone};
use log::debug;
use regex::Regex;

// Protocol value of 12 hours of right ascension.
const RA_HALF_CIRCLE: f64 = 2147483648.0;
// Protocol value of 90 degrees of declination.
const DEC_QUARTER_CIRCLE: f64 = 1073741824.0;

static HOUR_STR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[0-9]{1,3}:[0-9]{1,3}:[0-9]{1,3}$").unwrap()
});
static DEG_STR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^-?[0-9]{1,3}:[0-9]{1,3}:[0-9]{1,3}$").unwrap()
});

fn round6(x: f64) -> f64 {
    (x * 1_000_000.0).round() / 1_000_000.0
}

// Sums the three colon separated (unsigned) components of `s` into a single
// value of the leading unit.
fn sum_components(s: &str) -> Option<f64> {
    let mut parts = s.split(':').map(|p| p.parse::<f64>().ok());
    let units = parts.next()??;
    let minutes = parts.next()??;
    let seconds = parts.next()??;
    Some(units + minutes / 60.0 + seconds / 3600.0)
}

/// Converts an "H:M:S" right ascension string to radians, rounded to six
/// decimal places. Returns None if `h` is not of that form.
pub fn hour_str_to_rad(h: &str) -> Option<f64> {
    if !HOUR_STR_RE.is_match(h) {
        debug!("Malformed hour string: {}", h);
        return None;
    }
    let hours = sum_components(h)?;
    Some(round6((hours * 15.0 * PI) / 180.0))
}

/// Converts a "D:M:S" (optionally "-D:M:S") declination string to radians,
/// rounded to six decimal places. The sign applies to the whole angle, so
/// "-1:30:0" is -1.5 degrees. Returns None if `d` is not of that form.
pub fn deg_str_to_rad(d: &str) -> Option<f64> {
    if !DEG_STR_RE.is_match(d) {
        debug!("Malformed degree string: {}", d);
        return None;
    }
    let (negative, unsigned) = match d.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, d),
    };
    let mut degrees = sum_components(unsigned)?;
    if negative {
        degrees = -degrees;
    }
    Some(round6((degrees * PI) / 180.0))
}

/// Converts radians to hours of right ascension, rounded to six decimal
/// places and wrapped into 0..24.
pub fn rad_to_hour(rads: f64) -> f64 {
    let mut h = round6((rads * 180.0) / (15.0 * PI)).rem_euclid(24.0);
    // rem_euclid() can round up to the modulus for tiny negative inputs.
    if h >= 24.0 {
        h -= 24.0;
    }
    h
}

// Splits a non-negative `value` into whole units, whole minutes, and seconds
// rounded to `decimals` places. Seconds that round to 60 carry into the
// minutes; 60 minutes carry into the units.
fn split_sexagesimal(value: f64, decimals: i32) -> (i64, i64, f64) {
    let scale = 10_f64.powi(decimals);
    let mut units = value.floor();
    let minutes_f = (value - units) * 60.0;
    let mut minutes = minutes_f.floor();
    let mut seconds = ((minutes_f - minutes) * 60.0 * scale).round() / scale;
    if seconds >= 60.0 {
        seconds = 0.0;
        minutes += 1.0;
    }
    if minutes >= 60.0 {
        minutes = 0.0;
        units += 1.0;
    }
    (units as i64, minutes as i64, seconds)
}

/// Decomposes hours (0..24) into (hours, minutes, seconds), with seconds
/// rounded to `decimals` places. A carry into hour 24 wraps to hour 0.
pub fn hour_min_sec(hours: f64, decimals: i32) -> (i64, i64, f64) {
    let (h, m, s) = split_sexagesimal(hours, decimals);
    (h % 24, m, s)
}

/// Decomposes degrees into (negative, degrees, minutes, seconds) where the
/// magnitudes are of the absolute value and seconds are rounded to
/// `decimals` places. `negative` is false when the value rounds to zero.
pub fn deg_min_sec(degs: f64, decimals: i32) -> (bool, i64, i64, f64) {
    let (d, m, s) = split_sexagesimal(degs.abs(), decimals);
    let negative = degs < 0.0 && (d, m, s) != (0, 0, 0.0);
    (negative, d, m, s)
}

/// Formats hours as "H:M:S.s".
pub fn hour_to_hour_str(hours: f64) -> String {
    let (h, m, s) = hour_min_sec(hours, 1);
    format!("{}:{}:{:.1}", h, m, s)
}

/// Formats hours as "H:M:S" with whole seconds.
pub fn hour_to_hms_str(hours: f64) -> String {
    let (h, m, s) = hour_min_sec(hours, 0);
    format!("{}:{}:{:.0}", h, m, s)
}

/// Formats degrees as "D:M:S" with whole seconds; a negative angle is written
/// with a single leading '-', e.g. "-0:30:0".
pub fn deg_to_deg_str(deg: f64) -> String {
    let (negative, d, m, s) = deg_min_sec(deg, 0);
    let sign = if negative { "-" } else { "" };
    format!("{}{}:{}:{:.0}", sign, d, m, s)
}

/// Converts a right ascension and declination, in radians, to the Stellarium
/// Telescope Protocol's integer encoding. The fixed point values are truncated
/// rather than rounded, matching what existing clients have been sent.
pub fn rad_to_stellarium(ra: f64, dec: f64) -> (u32, i32) {
    let ra_h = rad_to_hour(ra);
    let dec_d = (dec * 180.0) / PI;

    debug!("(hours, degrees): ({:.6}, {:.6}) -> ({}, {})",
           ra_h, dec_d, hour_to_hour_str(ra_h), deg_to_deg_str(dec_d));

    let ra_int = (ra_h * (RA_HALF_CIRCLE / 12.0)) as u32;
    let dec_int = (dec_d * (DEC_QUARTER_CIRCLE / 90.0)) as i32;
    (ra_int, dec_int)
}

/// Converts Stellarium Telescope Protocol values to hours of right ascension
/// and degrees of declination.
pub fn stellarium_to_hour_deg(ra: u32, dec: i32) -> (f64, f64) {
    (ra as f64 * 12.0 / RA_HALF_CIRCLE, dec as f64 * 90.0 / DEC_QUARTER_CIRCLE)
}

/// Local time of day, "HH:MM:SS", of the given microseconds since the epoch.
pub fn time_of_day_str(micros: i64) -> String {
    let seconds = micros.div_euclid(1_000_000);
    match Local.timestamp_opt(seconds, 0).earliest() {
        Some(t) => t.format("%H:%M:%S").to_string(),
        None => {
            debug!("Timestamp out of range: {}", micros);
            "--:--:--".to_string()
        }
    }
}

/// Renders the coordinates and timestamp of a Stellarium Telescope Protocol
/// packet as ("H:M:S", "D:M:S", "HH:MM:SS").
pub fn stellarium_to_strings(ra: u32, dec: i32, micros: i64)
                             -> (String, String, String) {
    let (ra_h, dec_d) = stellarium_to_hour_deg(ra, dec);
    (hour_to_hms_str(ra_h), deg_to_deg_str(dec_d), time_of_day_str(micros))
}
