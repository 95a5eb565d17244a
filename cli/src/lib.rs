// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

pub mod astap;
pub mod capture;
pub mod config;
pub mod fits;
pub mod goto_engine;
pub mod lx200_mount;
pub mod platesolve2;
pub mod solve_field;
pub mod solver_process;
pub mod solver_select;
pub mod telescope;
