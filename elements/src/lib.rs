// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

pub mod astro_util;
pub mod capture_trait;
pub mod mount_trait;
pub mod sky_position;
pub mod solver_trait;
