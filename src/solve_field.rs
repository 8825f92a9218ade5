// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

// Runs the astrometry.net `solve-field` program on an image and extracts the
// solved field center from its output.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::LazyLock;

use canonical_error::{CanonicalError, aborted_error,
                      failed_precondition_error, unavailable_error};
use log::{info, warn};
use regex::Regex;

use crate::solver_trait::{FieldCenter, PlateSolver};

static FIELD_CENTER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?m)^Field center: \(RA H:M:S, Dec D:M:S\) = \((.*), (.*)\)\.").unwrap()
});

#[derive(Clone, Debug)]
pub struct SolveFieldConfig {
    pub solve_field_path: PathBuf,
}

impl Default for SolveFieldConfig {
    fn default() -> Self {
        SolveFieldConfig{
            solve_field_path: PathBuf::from("/usr/local/bin/solve-field"),
        }
    }
}

pub struct SolveField {
    config: SolveFieldConfig,
}

/// Finds the "Field center: (RA H:M:S, Dec D:M:S) = (<ra>, <dec>)." line of
/// solve-field's output.
pub fn parse_field_center(stdout: &str) -> Option<FieldCenter> {
    let captures = FIELD_CENTER_RE.captures(stdout)?;
    Some(FieldCenter::new(captures.get(1)?.as_str(), captures.get(2)?.as_str()))
}

impl SolveField {
    pub fn new(config: SolveFieldConfig) -> Self {
        SolveField{config}
    }

    // Arguments passed to solve-field, in order.
    pub fn command_args(&self, image_path: &Path, output_dir: &Path)
                        -> Vec<OsString> {
        let mut args: Vec<OsString> = [
            "--overwrite",
            "--downsample", "8",
            "--depth", "1-40",
            "--plot-scale", "0.25",
            "--scale-high=2",
            "--dir",
        ].iter().map(OsString::from).collect();
        args.push(output_dir.as_os_str().to_owned());
        args.push(image_path.as_os_str().to_owned());
        args
    }
}

impl PlateSolver for SolveField {
    fn solve(&self, image_path: &Path, output_dir: &Path)
             -> Result<FieldCenter, CanonicalError> {
        let args = self.command_args(image_path, output_dir);
        info!("{} {}", self.config.solve_field_path.display(),
              args.iter().map(|a| a.to_string_lossy())
              .collect::<Vec<_>>().join(" "));

        let output = match Command::new(&self.config.solve_field_path)
            .args(&args)
            .stdin(Stdio::null())
            .output() {
                Err(e) => {
                    return Err(failed_precondition_error(
                        format!("Could not run {:?}: {:?}",
                                self.config.solve_field_path, e).as_str()));
                },
                Ok(output) => output,
            };
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if !output.status.success() {
            warn!("{}", stdout);
            warn!("{}", stderr);
            warn!("Unable to solve {}", image_path.display());
            return Err(aborted_error(
                format!("solve-field exited with {}", output.status).as_str()));
        }
        match parse_field_center(&stdout) {
            Some(center) => {
                info!("Solved {} (RA, DEC) = ({}, {})",
                      image_path.display(), center.ra, center.dec);
                Ok(center)
            },
            None => {
                warn!("{}", stdout);
                warn!("{}", stderr);
                warn!("Unable to solve {}", image_path.display());
                Err(unavailable_error(
                    format!("No field center for {}",
                            image_path.display()).as_str()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use canonical_error::CanonicalErrorCode;

    use super::*;

    const TRANSCRIPT: &str = "\
Reading input file 1 of 1: \"/tmp/watch/img_0001.jpg\"...
Extracting sources...
Solving...
Field 1: solved with index index-4208.fits.
Field: /tmp/watch/img_0001.jpg
Field center: (RA,Dec) = (187.690000, 45.172250) deg.
Field center: (RA H:M:S, Dec D:M:S) = (12:30:45.6, +45:10:20.1).
Field size: 30.5 x 22.8 degrees
Field rotation angle: up is 12.3 degrees E of N
";

    #[test]
    fn test_parse_field_center() {
        assert_eq!(parse_field_center(TRANSCRIPT),
                   Some(FieldCenter::new("12:30:45.6", "+45:10:20.1")));
    }

    #[test]
    fn test_parse_field_center_missing() {
        assert!(parse_field_center("").is_none());
        assert!(parse_field_center(
            "Field center: (RA,Dec) = (187.690000, 45.172250) deg.\n")
                .is_none());
        // Must start a line.
        assert!(parse_field_center(
            "x Field center: (RA H:M:S, Dec D:M:S) = (1:2:3, 4:5:6).\n")
                .is_none());
    }

    #[test]
    fn test_transcript_to_solve_result() {
        let result = parse_field_center(TRANSCRIPT).unwrap()
            .to_solve_result().unwrap();
        assert!((result.ra - 3.276).abs() < 0.001);
        assert!((result.dec - 0.7884).abs() < 0.0001);
    }

    #[test]
    fn test_command_args() {
        let solver = SolveField::new(SolveFieldConfig::default());
        let args = solver.command_args(Path::new("/in/a.jpg"),
                                       Path::new("/out"));
        let args: Vec<String> =
            args.iter().map(|a| a.to_string_lossy().to_string()).collect();
        assert_eq!(args, [
            "--overwrite", "--downsample", "8", "--depth", "1-40",
            "--plot-scale", "0.25", "--scale-high=2", "--dir", "/out",
            "/in/a.jpg"]);
    }

    #[test]
    fn test_missing_solver() {
        let solver = SolveField::new(SolveFieldConfig{
            solve_field_path: PathBuf::from("/nonexistent/solve-field"),
        });
        let err = solver.solve(Path::new("a.jpg"), Path::new("."))
            .unwrap_err();
        assert!(err.code == CanonicalErrorCode::FailedPrecondition);
    }

    #[cfg(unix)]
    fn fake_solver(dir: &Path, body: &str) -> SolveField {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("solve-field");
        fs::write(&path, format!("#!/bin/sh\n{}", body)).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        SolveField::new(SolveFieldConfig{solve_field_path: path})
    }

    #[cfg(unix)]
    #[test]
    fn test_solve_subprocess() {
        let dir = tempfile::tempdir().unwrap();
        let solver = fake_solver(dir.path(), &format!(
            "cat <<'EOF'\n{}EOF\nexit 0\n", TRANSCRIPT));
        let center = solver.solve(Path::new("img.jpg"), dir.path()).unwrap();
        assert_eq!(center, FieldCenter::new("12:30:45.6", "+45:10:20.1"));
    }

    #[cfg(unix)]
    #[test]
    fn test_solve_subprocess_failures() {
        let dir = tempfile::tempdir().unwrap();
        let failing = fake_solver(dir.path(), "echo oops >&2\nexit 3\n");
        let err = failing.solve(Path::new("img.jpg"), dir.path()).unwrap_err();
        assert!(err.code == CanonicalErrorCode::Aborted);

        let other_dir = tempfile::tempdir().unwrap();
        let unsolved = fake_solver(other_dir.path(),
                                   "echo 'Did not solve.'\nexit 0\n");
        let err = unsolved.solve(Path::new("img.jpg"), dir.path()).unwrap_err();
        assert!(err.code == CanonicalErrorCode::Unavailable);
    }
}
