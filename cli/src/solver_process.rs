// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use canonical_error::{
    deadline_exceeded_error, failed_precondition_error, internal_error,
    invalid_argument_error, CanonicalError,
};
use log::{debug, warn};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

/// Verifies that the configured executable for `engine` exists before we try
/// to spawn it. A missing or empty path is a configuration problem, reported
/// as FailedPrecondition.
pub fn check_executable(exec_path: &Path, engine: &str)
                        -> Result<(), CanonicalError> {
    if exec_path.as_os_str().is_empty() || !exec_path.is_file() {
        return Err(failed_precondition_error(
            format!("{} executable not found at {:?}; check configuration",
                    engine, exec_path).as_str()));
    }
    Ok(())
}

/// Links or copies `image` into `dir` so that the sidecar files engines write
/// next to their input land in a scratch directory we own and clean up.
pub fn stage_image(image: &Path, dir: &Path) -> Result<PathBuf, CanonicalError> {
    let file_name = image.file_name().ok_or_else(|| invalid_argument_error(
        format!("image path {:?} has no file name", image).as_str()))?;
    let staged = dir.join(file_name);
    // Hard link is free; fall back to a copy across filesystems.
    if std::fs::hard_link(image, &staged).is_err() {
        std::fs::copy(image, &staged).map_err(|e| invalid_argument_error(
            format!("cannot read image file {:?}: {}", image, e).as_str()))?;
    }
    Ok(staged)
}

/// Runs an external engine to completion, relaying its stderr to our log at
/// warn level and its stdout at debug level. Returns the captured stdout.
///
/// If the process does not finish within `timeout` it is killed and
/// DeadlineExceeded is returned. A non-zero exit status is not an error here;
/// the engines signal "no match" through their output files, which the caller
/// inspects.
pub async fn run_engine(mut command: Command, engine: &str, timeout: Duration)
                        -> Result<String, CanonicalError> {
    debug!("running {}: {:?}", engine, command.as_std());
    command.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let mut child = command.spawn().map_err(|e| failed_precondition_error(
        format!("could not start {}: {}", engine, e).as_str()))?;

    let stderr = child.stderr.take();
    let engine_name = engine.to_string();
    let stderr_task = tokio::spawn(async move {
        if let Some(stderr) = stderr {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                warn!("{}: {}", engine_name, line);
            }
        }
    });

    let stdout = child.stdout.take();
    let run_to_completion = async move {
        let mut captured = String::new();
        if let Some(stdout) = stdout {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        debug!("{}: {}", engine, line);
                        captured.push_str(&line);
                        captured.push('\n');
                    }
                    Ok(None) => break,
                    Err(e) => {
                        return Err(internal_error(
                            format!("error reading {} output: {}",
                                    engine, e).as_str()));
                    }
                }
            }
        }
        let status = child.wait().await.map_err(|e| internal_error(
            format!("error waiting for {}: {}", engine, e).as_str()))?;
        Ok((captured, status))
    };

    match tokio::time::timeout(timeout, run_to_completion).await {
        Err(_) => {
            // Dropping the future drops the child, and kill_on_drop reaps it.
            Err(deadline_exceeded_error(
                format!("{} did not finish within {:.0?}",
                        engine, timeout).as_str()))
        }
        Ok(Err(e)) => Err(e),
        Ok(Ok((captured, status))) => {
            let _ = stderr_task.await;
            if !status.success() {
                debug!("{} exited with {}", engine, status);
            }
            Ok(captured)
        }
    }
}
