// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::path::PathBuf;

use async_trait::async_trait;
use canonical_error::CanonicalError;

// Boundary to the image acquisition collaborator. Each call produces a fresh
// exposure and returns the path of the image file written for it.
#[async_trait]
pub trait CaptureTrait {
    async fn capture_image(&mut self) -> Result<PathBuf, CanonicalError>;
}
