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

/// Adapter for the Astrometry.net `solve-field` program. Success is signaled
/// by the `.solved` sidecar file; the solution itself is scraped from stdout.
pub struct SolveFieldSolver {
    exec_path: PathBuf,
}

impl SolveFieldSolver {
    pub fn new(exec_path: impl Into<PathBuf>) -> Self {
        SolveFieldSolver { exec_path: exec_path.into() }
    }
}

#[async_trait]
impl SolverTrait for SolveFieldSolver {
    async fn solve_image(&self, request: &SolveRequest)
                         -> Result<PlateSolution, CanonicalError> {
        check_executable(&self.exec_path, "solve-field")?;
        let work_dir = TempDir::new().map_err(|e| internal_error(
            format!("cannot create scratch directory: {}", e).as_str()))?;
        let staged = stage_image(&request.image, work_dir.path())?;

        let mut command = Command::new(&self.exec_path);
        command.arg("-O")
            .arg("--no-plots")
            .arg("--no-verify")
            .arg("--resort")
            .arg("--dir").arg(work_dir.path());
        if let Some(downsample) = request.downsample {
            command.arg("--downsample").arg(downsample.to_string());
        }
        if let Some(hint) = &request.hint {
            // solve-field takes the search center in degrees.
            command.arg("-3").arg(format!("{:.6}", hint.ra_deg()))
                .arg("-4").arg(format!("{:.6}", hint.dec_deg));
            let radius = request.search_radius.unwrap_or(30.0);
            command.arg("-5").arg(format!("{:.2}", radius));
        }
        if let Some(pixel_scale) = request.pixel_scale {
            command.arg("-u").arg("arcsecperpix")
                .arg("-L").arg(format!("{:.3}", pixel_scale * 0.8))
                .arg("-H").arg(format!("{:.3}", pixel_scale * 1.2));
        }
        command.arg(&staged);

        let timeout = request.timeout.unwrap_or_else(|| self.default_timeout());
        let stdout = run_engine(command, "solve-field", timeout).await?;

        // The .solved sidecar is the authoritative success flag; stdout alone
        // is not trustworthy across versions.
        let solved_marker = staged.with_extension("solved");
        if !solved_marker.is_file() {
            return Err(not_found_error("solve-field found no match"));
        }
        parse_solve_field_output(&stdout)
    }

    fn default_timeout(&self) -> Duration {
        Duration::from_secs(90)
    }
}

// Extracts "(a, b)" from the end of a line.
fn parse_paren_pair(line: &str) -> Option<(f64, f64)> {
    let open = line.rfind('(')?;
    let close = line[open..].find(')')? + open;
    let inner = &line[open + 1..close];
    let mut parts = inner.split(',');
    let a = parts.next()?.trim().parse().ok()?;
    let b = parts.next()?.trim().parse().ok()?;
    Some((a, b))
}

/// Parses the stdout of a successful solve-field run.
pub fn parse_solve_field_output(stdout: &str)
                                -> Result<PlateSolution, CanonicalError> {
    let mut center: Option<(f64, f64)> = None;
    let mut fov: Option<(f64, f64)> = None;
    let mut rotation: Option<f64> = None;
    let mut pixel_scale: Option<f64> = None;
    for line in stdout.lines() {
        if line.starts_with("Field center: (RA,Dec)") {
            center = parse_paren_pair(line);
        } else if let Some(rest) = line.strip_prefix("Field size:") {
            // "Field size: 76.07 x 57.49 arcminutes" (or degrees).
            let scale = if rest.contains("degrees") { 1.0 } else { 1.0 / 60.0 };
            let mut parts = rest.split_whitespace();
            let x: Option<f64> = parts.next().and_then(|t| t.parse().ok());
            parts.next(); // "x"
            let y: Option<f64> = parts.next().and_then(|t| t.parse().ok());
            if let (Some(x), Some(y)) = (x, y) {
                fov = Some((x * scale, y * scale));
            }
        } else if line.starts_with("Field rotation angle: up is ") {
            // "Field rotation angle: up is 1.12 degrees E of N"
            rotation = line.split_whitespace().nth(5)
                .and_then(|t| t.parse().ok());
        } else if let Some(at) = line.find("pixel scale ") {
            // "... pixel scale 1.633 arcsec/pix."
            pixel_scale = line[at + "pixel scale ".len()..]
                .split_whitespace().next()
                .and_then(|t| t.parse().ok());
        }
    }
    let (ra_deg, dec_deg) = center.ok_or_else(|| invalid_argument_error(
        "could not find field center in solve-field output"))?;
    let (fov_x_deg, fov_y_deg) = fov.ok_or_else(|| invalid_argument_error(
        "could not find field size in solve-field output"))?;
    Ok(PlateSolution {
        coord: SkyPosition::new(ra_deg / 15.0, dec_deg, Epoch::J2000),
        fov_x_deg,
        fov_y_deg,
        pixel_scale_arcsec: pixel_scale,
        rotation_deg: rotation,
        matched_stars: None,
    })
}
