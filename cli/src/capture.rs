// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use canonical_error::{
    failed_precondition_error, internal_error, CanonicalError,
};
use log::info;
use tempfile::TempDir;
use tokio::process::Command;

use platesync_elements::capture_trait::CaptureTrait;

use crate::solver_process::run_engine;

/// Acquires images by running a user supplied capture command. A `{}` token
/// in the command is replaced with the output path; without one the path is
/// appended as the final argument. Outputs live in a scratch directory that
/// is removed when the backend is dropped.
#[derive(Debug)]
pub struct CommandCapture {
    command_template: String,
    work_dir: TempDir,
    exposure_count: u32,
    timeout: Duration,
}

impl CommandCapture {
    pub fn new(command_template: String, timeout: Duration)
               -> Result<Self, CanonicalError> {
        if command_template.trim().is_empty() {
            return Err(failed_precondition_error(
                "capture command not configured"));
        }
        let work_dir = TempDir::new().map_err(|e| internal_error(
            format!("cannot create scratch directory: {}", e).as_str()))?;
        Ok(CommandCapture {
            command_template,
            work_dir,
            exposure_count: 0,
            timeout,
        })
    }
}

#[async_trait]
impl CaptureTrait for CommandCapture {
    async fn capture_image(&mut self) -> Result<PathBuf, CanonicalError> {
        self.exposure_count += 1;
        let output = self.work_dir.path().join(
            format!("capture_{:04}.fits", self.exposure_count));

        let mut tokens = self.command_template.split_whitespace();
        // new() rejects empty templates, so there is a first token.
        let program = tokens.next().unwrap();
        let mut command = Command::new(program);
        let mut substituted = false;
        for token in tokens {
            if token == "{}" {
                command.arg(&output);
                substituted = true;
            } else {
                command.arg(token);
            }
        }
        if !substituted {
            command.arg(&output);
        }

        info!("capturing exposure {}", self.exposure_count);
        run_engine(command, "capture", self.timeout).await?;
        if !output.is_file() {
            return Err(internal_error(
                format!("capture command produced no file at {:?}",
                        output).as_str()));
        }
        Ok(output)
    }
}
