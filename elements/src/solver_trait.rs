// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use canonical_error::CanonicalError;

use crate::sky_position::SkyPosition;

/// One plate solve attempt. Everything except the image path is a hint;
/// absent hints mean "let the engine auto-detect", which increases solve time
/// and the risk of failure. Individual engines ignore the hints they cannot
/// use.
#[derive(Debug, Clone, Default)]
pub struct SolveRequest {
    pub image: PathBuf,

    // Estimated image center (J2000).
    pub hint: Option<SkyPosition>,

    // Estimated horizontal/vertical field of view, degrees.
    pub fov_estimate: Option<(f64, f64)>,

    // Arcseconds per pixel.
    pub pixel_scale: Option<f64>,

    pub downsample: Option<u32>,

    // Search radius around `hint`, degrees.
    pub search_radius: Option<f64>,

    // Defaults to the engine's default_timeout().
    pub timeout: Option<Duration>,
}

/// The normalized result of a successful solve. Created once per attempt,
/// immutable.
#[derive(Debug, Clone)]
pub struct PlateSolution {
    // Solved image center, J2000.
    pub coord: SkyPosition,

    // Field dimensions, degrees.
    pub fov_x_deg: f64,
    pub fov_y_deg: f64,

    // Arcseconds per pixel, if the engine reports it.
    pub pixel_scale_arcsec: Option<f64>,

    // Position angle of the image Y axis, degrees east of north, if the
    // engine reports it.
    pub rotation_deg: Option<f64>,

    // Number of matched reference stars, if the engine reports it.
    pub matched_stars: Option<u32>,
}

// Uniform contract over the external solving engines. solve_image() never
// panics or propagates expected failure conditions; they come back as errors
// with these codes:
//   FailedPrecondition: the engine executable is not configured or not found.
//   DeadlineExceeded: the solve timeout was reached.
//   NotFound: the engine ran but found no match.
//   InvalidArgument: required hints are missing, or the engine output could
//     not be parsed.
// Only truly unexpected conditions (e.g. I/O errors staging the image file)
// surface with other codes.
#[async_trait]
pub trait SolverTrait {
    async fn solve_image(&self, request: &SolveRequest)
                         -> Result<PlateSolution, CanonicalError>;

    // Used when SolveRequest::timeout is None.
    fn default_timeout(&self) -> Duration;
}
