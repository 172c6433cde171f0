// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! exec.rs
//!
//! Running the external DRBD utilities and turning their exit status into a `Result`.

use std::process::{Command, Output, Stdio};

use log::trace;

#[derive(Debug)]
pub struct CommandFailureInfo {
    pub command: String,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl std::fmt::Display for CommandFailureInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self.exit_code {
            Some(code) => write!(f, "Command [{}] failed with exit code {code}", self.command)?,
            None => write!(f, "Command [{}] was terminated by a signal", self.command)?,
        }
        if !self.stderr.trim().is_empty() {
            write!(f, ": {}", self.stderr.trim())?;
        }
        Ok(())
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ExecutionError {
    #[error("Failed to start execution of [{command}]: {err}")]
    ExecutionStart {
        command: String,
        err: std::io::Error,
    },

    #[error("{0}")]
    CommandFailure(Box<CommandFailureInfo>),

    #[error("Failed to parse output of [{command}]: {reason}")]
    ParseFailure { command: String, reason: String },
}

impl ExecutionError {
    /// The diagnostic text the external tool printed, if it got that far.
    pub fn stderr(&self) -> Option<&str> {
        match self {
            ExecutionError::CommandFailure(info) => Some(&info.stderr),
            _ => None,
        }
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self {
            ExecutionError::CommandFailure(info) => info.exit_code,
            _ => None,
        }
    }
}

pub fn command_to_string(command: &Command) -> String {
    std::iter::once(command.get_program())
        .chain(command.get_args())
        .map(|s| s.to_string_lossy().into_owned())
        .collect::<Vec<String>>()
        .join(" ")
}

pub fn output_to_exec_error(command: &Command, output: &Output) -> ExecutionError {
    ExecutionError::CommandFailure(Box::new(CommandFailureInfo {
        command: command_to_string(command),
        exit_code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    }))
}

/// Run `command` with stdin redirected from the null device and return its output, regardless
/// of the exit status. Only a failure to spawn the process is an error.
pub fn run(command: &mut Command) -> Result<Output, ExecutionError> {
    trace!("executing [{}]", command_to_string(command));
    command
        .stdin(Stdio::null())
        .output()
        .map_err(|err| ExecutionError::ExecutionStart {
            command: command_to_string(command),
            err,
        })
}

/// Run `command` and require a zero exit status.
pub fn execute(command: &mut Command) -> Result<Output, ExecutionError> {
    let output = run(command)?;

    if !output.status.success() {
        return Err(output_to_exec_error(command, &output));
    }

    Ok(output)
}

/// Convenience wrapper for a command given as a program and an argument list.
pub fn execute_args<I, S>(program: &str, args: I) -> Result<Output, ExecutionError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<std::ffi::OsStr>,
{
    execute(Command::new(program).args(args))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_carries_stderr() {
        let err = execute(Command::new("sh").args(["-c", "echo oops >&2; exit 3"])).unwrap_err();
        assert_eq!(err.exit_code(), Some(3));
        assert_eq!(err.stderr().map(str::trim), Some("oops"));
        assert!(err.to_string().contains("exit code 3"));
    }

    #[test]
    fn missing_program_is_start_error() {
        let err = execute_args("/nonexistent/drbdadm", ["status"]).unwrap_err();
        assert!(matches!(err, ExecutionError::ExecutionStart { .. }));
    }
}
