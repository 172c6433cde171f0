// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! error.rs
//!
//! Failures raised while reconciling a DRBD resource.
//!
//! `Storage`, `Volume` and `Resource` failures abort the remaining steps for one resource but
//! never the whole device manager pass. `Implementation` errors are defects and stop the pass.

use crate::exec::ExecutionError;

pub type Result<T> = std::result::Result<T, Error>;

type BoxedSource = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Operator facing description of a failure.
#[derive(thiserror::Error, Debug)]
#[error("{message}{}", .cause.as_ref().map(|c| format!(": {c}")).unwrap_or_default())]
pub struct Failure {
    /// Short "operations were aborted" note naming the resource.
    pub message: String,
    pub cause: Option<String>,
    pub correction: Option<String>,
    #[source]
    pub source: Option<BoxedSource>,
}

impl Failure {
    pub fn new(message: impl Into<String>) -> Self {
        Failure {
            message: message.into(),
            cause: None,
            correction: None,
            source: None,
        }
    }

    pub fn cause(mut self, cause: impl Into<String>) -> Self {
        self.cause = Some(cause.into());
        self
    }

    pub fn correction(mut self, correction: impl Into<String>) -> Self {
        self.correction = Some(correction.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<BoxedSource>) -> Self {
        self.source = Some(source.into());
        self
    }
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("storage failure: {0}")]
    Storage(Box<Failure>),

    #[error("volume failure: {0}")]
    Volume(Box<Failure>),

    #[error("resource failure: {0}")]
    Resource(Box<Failure>),

    #[error("the DRBD state tracker has not received the initial state yet")]
    NoInitialState,

    #[error("implementation error: {0}")]
    Implementation(String),
}

impl Error {
    pub fn storage(failure: Failure) -> Self {
        Error::Storage(Box::new(failure))
    }

    pub fn volume(failure: Failure) -> Self {
        Error::Volume(Box::new(failure))
    }

    pub fn resource(failure: Failure) -> Self {
        Error::Resource(Box::new(failure))
    }

    /// Wrap a failed external command as a resource level failure.
    pub fn resource_cmd(rsc_name: &str, cause: impl Into<String>, err: ExecutionError) -> Self {
        Error::resource(Failure::new(abort_msg(rsc_name)).cause(cause).with_source(err))
    }

    pub fn volume_cmd(
        rsc_name: &str,
        vlm_nr: u32,
        cause: impl Into<String>,
        err: ExecutionError,
    ) -> Self {
        Error::volume(
            Failure::new(abort_vlm_msg(rsc_name, vlm_nr))
                .cause(cause)
                .with_source(err),
        )
    }

    pub fn failure(&self) -> Option<&Failure> {
        match self {
            Error::Storage(f) | Error::Volume(f) | Error::Resource(f) => Some(f),
            _ => None,
        }
    }

    pub fn is_implementation(&self) -> bool {
        matches!(self, Error::Implementation(_))
    }
}

pub fn abort_msg(rsc_name: &str) -> String {
    format!("Operations on resource '{rsc_name}' were aborted")
}

pub fn abort_vlm_msg(rsc_name: &str, vlm_nr: u32) -> String {
    format!("Operations on volume {vlm_nr} of resource '{rsc_name}' were aborted")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_cause() {
        let err = Error::storage(Failure::new(abort_msg("r0")).cause("disk full"));
        assert_eq!(
            err.to_string(),
            "storage failure: Operations on resource 'r0' were aborted: disk full"
        );
    }

    #[test]
    fn source_chain_is_kept() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        let err = Error::volume(Failure::new(abort_vlm_msg("r0", 1)).with_source(io));
        let failure = err.failure().unwrap();
        assert!(std::error::Error::source(failure).is_some());
        assert!(failure.message.contains("volume 1"));
    }
}
