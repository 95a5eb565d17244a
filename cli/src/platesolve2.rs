// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use canonical_error::{
    internal_error, invalid_argument_error, not_found_error, CanonicalError,
};
use tempfile::TempDir;
use tokio::process::Command;

use platesync_elements::sky_position::{Epoch, SkyPosition};
use platesync_elements::solver_trait::{PlateSolution, SolveRequest, SolverTrait};

use crate::solver_process::{check_executable, run_engine, stage_image};

/// Adapter for PlateSolve2. The program takes its whole parameter list as a
/// single comma separated argument, works in radians, and writes a three line
/// .apm file next to the image.
pub struct PlateSolve2Solver {
    exec_path: PathBuf,
    // Maximum number of search regions to try before giving up.
    regions: u32,
}

impl PlateSolve2Solver {
    pub fn new(exec_path: impl Into<PathBuf>, regions: u32) -> Self {
        PlateSolve2Solver { exec_path: exec_path.into(), regions }
    }
}

#[async_trait]
impl SolverTrait for PlateSolve2Solver {
    async fn solve_image(&self, request: &SolveRequest)
                         -> Result<PlateSolution, CanonicalError> {
        check_executable(&self.exec_path, "platesolve2")?;
        let hint = request.hint.as_ref().ok_or_else(|| invalid_argument_error(
            "platesolve2 requires a position hint"))?;
        let fov = request.fov_estimate.ok_or_else(|| invalid_argument_error(
            "platesolve2 requires a field-of-view estimate"))?;
        let work_dir = TempDir::new().map_err(|e| internal_error(
            format!("cannot create scratch directory: {}", e).as_str()))?;
        let staged = stage_image(&request.image, work_dir.path())?;

        let mut command = Command::new(&self.exec_path);
        // ra,dec (radians), fov x,y (radians), region count, image path,
        // and a final 0 telling it to exit without waiting for a keypress.
        command.arg(format!("{:.6},{:.6},{:.6},{:.6},{},{},0",
                            hint.ra_rad(), hint.dec_rad(),
                            fov.0.to_radians(), fov.1.to_radians(),
                            self.regions, staged.display()));

        let timeout = request.timeout.unwrap_or_else(|| self.default_timeout());
        run_engine(command, "platesolve2", timeout).await?;

        let apm_path = staged.with_extension("apm");
        let apm = std::fs::read_to_string(&apm_path).map_err(
            |_| not_found_error("platesolve2 produced no solution file"))?;
        parse_platesolve2_apm(&apm, fov)
    }

    fn default_timeout(&self) -> Duration {
        Duration::from_secs(60)
    }
}

/// Parses a PlateSolve2 .apm file. Line 1 is "ra,dec,ratio" in radians,
/// line 2 is "scale,angle,...", line 3 states whether the solution is valid.
pub fn parse_platesolve2_apm(apm: &str, fov: (f64, f64))
                             -> Result<PlateSolution, CanonicalError> {
    let mut lines = apm.lines();
    let coords = lines.next();
    let scales = lines.next();
    let verdict = lines.next();
    let (coords, scales, verdict) = match (coords, scales, verdict) {
        (Some(c), Some(s), Some(v)) => (c, s, v),
        _ => return Err(invalid_argument_error(
            "truncated platesolve2 output")),
    };
    if !verdict.contains("Valid plate solution") {
        return Err(not_found_error("platesolve2 found no match"));
    }
    let parse_fields = |line: &str, count: usize|
                       -> Result<Vec<f64>, CanonicalError> {
        let fields: Vec<f64> = line.split(',')
            .take(count)
            .filter_map(|f| f.trim().parse().ok())
            .collect();
        if fields.len() < count {
            return Err(invalid_argument_error(
                format!("malformed platesolve2 output line '{}'",
                        line).as_str()));
        }
        Ok(fields)
    };
    let coords = parse_fields(coords, 2)?;
    let scales = parse_fields(scales, 2)?;
    Ok(PlateSolution {
        coord: SkyPosition::from_radians(coords[0], coords[1], Epoch::J2000),
        fov_x_deg: fov.0,
        fov_y_deg: fov.1,
        pixel_scale_arcsec: Some(scales[0]),
        rotation_deg: Some(scales[1]),
        matched_stars: None,
    })
}

#[cfg(test)]
mod tests {
    extern crate approx;
    use approx::assert_abs_diff_eq;
    use canonical_error::CanonicalErrorCode;

    use super::*;

    const SOLVED: &str = "\
3.268871,0.035822,1.0000
1.5432,181.12,0,0,407
Valid plate solution
";

    #[test]
    fn test_parse_solved() {
        let solution = parse_platesolve2_apm(SOLVED, (1.0, 0.75)).unwrap();
        assert_abs_diff_eq!(solution.coord.ra_rad(), 3.268871,
                            epsilon = 1e-6);
        assert_abs_diff_eq!(solution.coord.dec_rad(), 0.035822,
                            epsilon = 1e-6);
        assert_eq!(solution.coord.epoch, Epoch::J2000);
        assert_abs_diff_eq!(solution.pixel_scale_arcsec.unwrap(), 1.5432,
                            epsilon = 1e-6);
        assert_abs_diff_eq!(solution.rotation_deg.unwrap(), 181.12,
                            epsilon = 1e-6);
        assert_abs_diff_eq!(solution.fov_x_deg, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_parse_invalid_solution() {
        let apm = "0,0,0\n0,0,0,0,0\nInvalid plate solution\n";
        let err = parse_platesolve2_apm(apm, (1.0, 1.0)).unwrap_err();
        assert_eq!(err.code, CanonicalErrorCode::NotFound);
    }

    #[test]
    fn test_parse_truncated() {
        let err = parse_platesolve2_apm("3.2,0.03,1.0\n", (1.0, 1.0))
            .unwrap_err();
        assert_eq!(err.code, CanonicalErrorCode::InvalidArgument);
    }
}
