// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::path::{Path, PathBuf};

use canonical_error::{failed_precondition_error, CanonicalError};
use log::debug;
use serde::Deserialize;

/// A named settings profile, loaded from a TOML file. Everything is optional;
/// command line flags override whatever the profile supplies, and operations
/// report FailedPrecondition when a setting they require is absent from both.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Profile {
    // One of "solve-field", "astap", "platesolve2".
    pub solver: Option<String>,
    pub solve_field_path: Option<PathBuf>,
    pub astap_path: Option<PathBuf>,
    pub platesolve2_path: Option<PathBuf>,
    pub platesolve2_regions: Option<u32>,

    // host:port of the mount's LX200 TCP endpoint.
    pub mount_addr: Option<String>,
    // Shell-free capture command; "{}" is replaced by the output path.
    pub capture_command: Option<String>,

    // Unbinned arcseconds per pixel of the capture rig.
    pub pixel_scale: Option<f64>,
    pub downsample: Option<u32>,
    // Degrees around the pointing hint.
    pub search_radius: Option<f64>,
    pub solve_timeout_secs: Option<u64>,

    pub threshold_arcsec: Option<f64>,
    pub max_tries: Option<u32>,
    pub settle_timeout_secs: Option<u64>,
    pub max_sync_separation_deg: Option<f64>,

    // "ignore", "pause-before", or "pause-after".
    pub meridian_mode: Option<String>,
    pub meridian_window_minutes: Option<f64>,
    // Positive east.
    pub site_longitude_deg: Option<f64>,
}

impl Profile {
    /// Loads the profile named by `selector`: either a path to a TOML file,
    /// or a bare profile name resolved under ~/.config/platesync/.
    pub fn load(selector: &str) -> Result<Profile, CanonicalError> {
        let path = if selector.ends_with(".toml") || selector.contains('/') {
            PathBuf::from(selector)
        } else {
            let home = std::env::var_os("HOME").map(PathBuf::from)
                .ok_or_else(|| failed_precondition_error(
                    "HOME is not set; pass the profile as a file path"))?;
            home.join(".config").join("platesync")
                .join(format!("{}.toml", selector))
        };
        Self::load_path(&path)
    }

    pub fn load_path(path: &Path) -> Result<Profile, CanonicalError> {
        debug!("loading profile from {:?}", path);
        let text = std::fs::read_to_string(path).map_err(
            |e| failed_precondition_error(
                format!("cannot read profile {:?}: {}", path, e).as_str()))?;
        toml::from_str(&text).map_err(|e| failed_precondition_error(
            format!("malformed profile {:?}: {}", path, e).as_str()))
    }
}
