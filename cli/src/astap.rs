// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::collections::HashMap;
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

use crate::fits::FitsHeader;
use crate::solver_process::{check_executable, run_engine, stage_image};

/// Adapter for the ASTAP command line solver. ASTAP reports its result in a
/// small .ini file next to the requested output base name; PLTSOLVD=T is the
/// success flag.
pub struct AstapSolver {
    exec_path: PathBuf,
}

impl AstapSolver {
    pub fn new(exec_path: impl Into<PathBuf>) -> Self {
        AstapSolver { exec_path: exec_path.into() }
    }
}

#[async_trait]
impl SolverTrait for AstapSolver {
    async fn solve_image(&self, request: &SolveRequest)
                         -> Result<PlateSolution, CanonicalError> {
        check_executable(&self.exec_path, "astap")?;
        let hint = request.hint.as_ref().ok_or_else(|| invalid_argument_error(
            "astap requires a position hint"))?;
        let work_dir = TempDir::new().map_err(|e| internal_error(
            format!("cannot create scratch directory: {}", e).as_str()))?;
        let staged = stage_image(&request.image, work_dir.path())?;
        let out_base = work_dir.path().join("solution");

        let mut command = Command::new(&self.exec_path);
        command.arg("-f").arg(&staged)
            .arg("-ra").arg(format!("{:.6}", hint.ra_hours))
            // ASTAP wants the south polar distance, not the declination.
            .arg("-spd").arg(format!("{:.6}", hint.dec_deg + 90.0))
            .arg("-r").arg(format!("{:.2}",
                                   request.search_radius.unwrap_or(30.0)))
            .arg("-o").arg(&out_base);
        if let Some((_, fov_y)) = request.fov_estimate {
            // ASTAP takes the field height, degrees.
            command.arg("-fov").arg(format!("{:.4}", fov_y));
        }
        if let Some(downsample) = request.downsample {
            command.arg("-z").arg(downsample.to_string());
        }

        let timeout = request.timeout.unwrap_or_else(|| self.default_timeout());
        run_engine(command, "astap", timeout).await?;

        let ini_path = out_base.with_extension("ini");
        let ini = std::fs::read_to_string(&ini_path).map_err(
            |_| not_found_error("astap produced no solution file"))?;
        // Field extent comes from the solved scale times the image geometry.
        let dimensions = FitsHeader::read_from(&request.image).ok()
            .and_then(|header| header.binned_dimensions());
        parse_astap_ini(&ini, dimensions, request.fov_estimate)
    }

    fn default_timeout(&self) -> Duration {
        Duration::from_secs(60)
    }
}

/// Parses an ASTAP .ini result. `dimensions` (width, height in binned pixels)
/// lets us derive the field of view from the solved pixel scale; when the
/// image geometry is unknown we fall back to the caller's estimate.
pub fn parse_astap_ini(ini: &str, dimensions: Option<(u32, u32)>,
                       fov_estimate: Option<(f64, f64)>)
                       -> Result<PlateSolution, CanonicalError> {
    let mut fields = HashMap::new();
    for line in ini.lines() {
        if let Some((key, value)) = line.split_once('=') {
            fields.insert(key.trim(), value.trim());
        }
    }
    if fields.get("PLTSOLVD").copied() != Some("T") {
        let detail = fields.get("ERROR").copied()
            .unwrap_or("astap found no match");
        return Err(not_found_error(detail));
    }
    let float = |key: &str| -> Result<f64, CanonicalError> {
        fields.get(key)
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| invalid_argument_error(
                format!("missing or malformed {} in astap output",
                        key).as_str()))
    };
    let ra_deg = float("CRVAL1")?;
    let dec_deg = float("CRVAL2")?;
    // CDELT2 is degrees per pixel; some versions only write CDELT1.
    let cdelt_deg = float("CDELT2").or_else(|_| float("CDELT1"))?;
    let rotation_deg = float("CROTA2").or_else(|_| float("CROTA1")).ok();

    let (fov_x_deg, fov_y_deg) = match dimensions {
        Some((width, height)) =>
            (cdelt_deg.abs() * width as f64, cdelt_deg.abs() * height as f64),
        None => fov_estimate.unwrap_or((0.0, 0.0)),
    };
    Ok(PlateSolution {
        coord: SkyPosition::new(ra_deg / 15.0, dec_deg, Epoch::J2000),
        fov_x_deg,
        fov_y_deg,
        pixel_scale_arcsec: Some(cdelt_deg.abs() * 3600.0),
        rotation_deg,
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
PLTSOLVD=T
CRVAL1=187.277915
CRVAL2=2.052381
CDELT1=-0.000453572
CDELT2=0.000453572
CROTA1=181.121
CROTA2=181.121
CD1_1=-0.000453
CD1_2=0.000009
DIMENSIONS=2328 x 1760
";

    #[test]
    fn test_parse_solved() {
        let solution =
            parse_astap_ini(SOLVED, Some((2328, 1760)), None).unwrap();
        assert_abs_diff_eq!(solution.coord.ra_deg(), 187.277915,
                            epsilon = 1e-6);
        assert_abs_diff_eq!(solution.coord.dec_deg, 2.052381, epsilon = 1e-6);
        assert_abs_diff_eq!(solution.pixel_scale_arcsec.unwrap(),
                            0.000453572 * 3600.0, epsilon = 1e-6);
        assert_abs_diff_eq!(solution.fov_x_deg, 0.000453572 * 2328.0,
                            epsilon = 1e-6);
        assert_abs_diff_eq!(solution.rotation_deg.unwrap(), 181.121,
                            epsilon = 1e-6);
    }

    #[test]
    fn test_parse_solved_without_dimensions() {
        let solution =
            parse_astap_ini(SOLVED, None, Some((1.0, 0.75))).unwrap();
        assert_abs_diff_eq!(solution.fov_x_deg, 1.0, epsilon = 1e-9);
        assert_abs_diff_eq!(solution.fov_y_deg, 0.75, epsilon = 1e-9);
    }

    #[test]
    fn test_parse_unsolved() {
        let ini = "PLTSOLVD=F\nERROR=No solution found, insufficient stars.\n";
        let err = parse_astap_ini(ini, None, None).unwrap_err();
        assert_eq!(err.code, CanonicalErrorCode::NotFound);
        assert!(err.message.contains("insufficient stars"));
    }

    #[test]
    fn test_parse_malformed() {
        let ini = "PLTSOLVD=T\nCRVAL1=bogus\n";
        let err = parse_astap_ini(ini, None, None).unwrap_err();
        assert_eq!(err.code, CanonicalErrorCode::InvalidArgument);
    }
}
