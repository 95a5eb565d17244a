// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::path::PathBuf;

use canonical_error::{invalid_argument_error, CanonicalError};
use clap::ValueEnum;

use platesync_elements::solver_trait::SolverTrait;

use crate::astap::AstapSolver;
use crate::platesolve2::PlateSolve2Solver;
use crate::solve_field::SolveFieldSolver;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SolverKind {
    /// Astrometry.net solve-field.
    SolveField,
    /// ASTAP command line solver.
    Astap,
    /// PlateSolve2.
    #[value(name = "platesolve2")]
    PlateSolve2,
}

impl SolverKind {
    /// Parses a profile's solver name (same spellings as the command line).
    pub fn from_name(name: &str) -> Result<SolverKind, CanonicalError> {
        match name {
            "solve-field" => Ok(SolverKind::SolveField),
            "astap" => Ok(SolverKind::Astap),
            "platesolve2" => Ok(SolverKind::PlateSolve2),
            _ => Err(invalid_argument_error(
                format!("unknown solver '{}'; expected solve-field, astap, \
                         or platesolve2", name).as_str())),
        }
    }
}

/// Executable locations for the engines. A solver can always be constructed;
/// a missing path surfaces as FailedPrecondition when the engine is actually
/// invoked.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub solve_field_path: Option<PathBuf>,
    pub astap_path: Option<PathBuf>,
    pub platesolve2_path: Option<PathBuf>,
    pub platesolve2_regions: Option<u32>,
}

pub fn make_solver(kind: SolverKind, config: &EngineConfig)
                   -> Box<dyn SolverTrait + Send + Sync> {
    match kind {
        SolverKind::SolveField => Box::new(SolveFieldSolver::new(
            config.solve_field_path.clone().unwrap_or_default())),
        SolverKind::Astap => Box::new(AstapSolver::new(
            config.astap_path.clone().unwrap_or_default())),
        SolverKind::PlateSolve2 => Box::new(PlateSolve2Solver::new(
            config.platesolve2_path.clone().unwrap_or_default(),
            config.platesolve2_regions.unwrap_or(999))),
    }
}
