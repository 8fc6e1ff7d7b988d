//! Asynchronous utilities for use with Tokio.
//!
//! We pay a small complexity tax here so the pipeline itself can be written as
//! a plain stream of per-page futures.

use std::{pin::Pin, process::Output};

use crate::prelude::*;

pub mod blocking_iter_streams;

/// A type alias for a boxed future. This is used to make it easier to work with
/// with complex futures.
pub type BoxedFuture<Output> = Pin<Box<dyn Future<Output = Output> + Send>>;

/// Report any command failures, and include any error output.
///
/// The output of standard error and standard output will be logged at
/// appropriate levels. If `is_error_line` is given, a successful command whose
/// standard error contains a matching line is still treated as a failure.
pub fn check_for_command_failure(
    command_name: &str,
    output: &Output,
    is_error_line: Option<fn(&str) -> bool>,
) -> Result<()> {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    debug!(
        command_name = command_name,
        output = %stdout,
        "Standard output from command"
    );
    if !stderr.trim().is_empty() {
        warn!(
            command_name = command_name,
            output = %stderr,
            "Standard error from command",
        );
    }

    if output.status.success() {
        if let Some(is_error_line) = is_error_line
            && stderr.lines().any(is_error_line)
        {
            return Err(anyhow!(
                "{} printed error output:\n{}",
                command_name,
                stderr,
            ));
        }
        Ok(())
    } else if let Some(exit_code) = output.status.code() {
        Err(anyhow!(
            "{} failed with exit code {} and error output:\n{}",
            command_name,
            exit_code,
            stderr,
        ))
    } else {
        Err(anyhow!(
            "{} failed with error output:\n{}",
            command_name,
            stderr,
        ))
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::process::ExitStatusExt as _;
    use std::process::ExitStatus;

    use super::*;

    fn output(code: i32, stderr: &str) -> Output {
        Output {
            status: ExitStatus::from_raw(code << 8),
            stdout: vec![],
            stderr: stderr.as_bytes().to_vec(),
        }
    }

    #[test]
    fn reports_exit_codes() {
        assert!(check_for_command_failure("tool", &output(0, ""), None).is_ok());
        let err = check_for_command_failure("tool", &output(1, "bad input"), None)
            .unwrap_err()
            .to_string();
        assert!(err.contains("exit code 1"));
        assert!(err.contains("bad input"));
    }

    #[test]
    fn error_lines_fail_successful_commands() {
        let is_error: fn(&str) -> bool = |line| line.starts_with("Error");
        let out = output(0, "Warning: odd\nError: broken");
        assert!(check_for_command_failure("tool", &out, None).is_ok());
        assert!(check_for_command_failure("tool", &out, Some(is_error)).is_err());
    }
}
