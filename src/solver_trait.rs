// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::path::Path;

use canonical_error::CanonicalError;
use log::debug;

use crate::coord_codec::{deg_str_to_rad, hour_str_to_rad};

// Image center as reported by the solver, e.g. ("12:30:45.6", "+45:10:20.1").
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FieldCenter {
    pub ra: String,   // H:M:S
    pub dec: String,  // D:M:S, with sign
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct SolveResult {
    // Radians.
    pub ra: f64,  // 0..2pi
    pub dec: f64,  // -pi/2..pi/2
}

// Drops the fractional part of the final component: "12:30:45.6" becomes
// "12:30:45".
fn truncate_fraction(s: &str) -> &str {
    match s.rfind('.') {
        Some(pos) => &s[..pos],
        None => s,
    }
}

impl FieldCenter {
    pub fn new(ra: &str, dec: &str) -> Self {
        FieldCenter{ra: ra.to_string(), dec: dec.to_string()}
    }

    /// Converts the solver's strings to radians at whole-second granularity.
    /// Returns None if either string is malformed.
    pub fn to_solve_result(&self) -> Option<SolveResult> {
        let ra_str = truncate_fraction(self.ra.trim());
        let dec_str = truncate_fraction(self.dec.trim());
        let dec_str = dec_str.strip_prefix('+').unwrap_or(dec_str);

        let ra = hour_str_to_rad(ra_str);
        let dec = deg_str_to_rad(dec_str);
        match (ra, dec) {
            (Some(ra), Some(dec)) => Some(SolveResult{ra, dec}),
            _ => {
                debug!("Could not convert field center ({}, {})",
                       self.ra, self.dec);
                None
            }
        }
    }
}

// If a FieldCenter is not returned, an error is returned:
//   FailedPrecondition: the solver could not be run.
//   Aborted: the solver exited with an error status.
//   Unavailable: the solver ran but did not find a solution.
pub trait PlateSolver {
    // Note: this is a blocking call, and typically takes several seconds.
    // Solver output files are written to `output_dir`.
    fn solve(&self, image_path: &Path, output_dir: &Path)
             -> Result<FieldCenter, CanonicalError>;
}
