// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Error types shared across the simulator.
//!
//! Errors are grouped by outcome rather than by origin: configuration errors
//! abort startup with a process exit code, protocol errors travel back to the
//! peer as wire-level exceptions, and everything transient is logged where it
//! happens and retried by the owning loop.

use thiserror::Error;

/// Exit code a module returns to signal "do not restart me".
///
/// The supervisor honors this for child processes; `start` surfaces it for
/// in-process runners.
pub const EXIT_NO_RESTART: i32 = 101;

/// Configuration errors.
///
/// All of these are fatal at startup: the process exits with
/// [`EXIT_NO_RESTART`] before any runner has been started.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("XML parse error: {0}")]
    Xml(#[from] roxmltree::Error),

    #[error("root element of XML config file must be 'ot-sim'")]
    MissingRoot,

    #[error("missing required element '{element}' for module {module}")]
    MissingElement { module: String, element: String },

    #[error("invalid value '{value}' for '{field}': {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("invalid endpoint URL '{0}': only tcp:// endpoints are supported")]
    InvalidEndpoint(String),

    #[error("{0}")]
    Other(String),
}

impl ConfigError {
    pub fn invalid(field: &str, value: &str, reason: impl ToString) -> Self {
        ConfigError::InvalidValue {
            field: field.to_string(),
            value: value.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Runtime errors surfaced by module runners.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no registered runners")]
    NoRunners,

    #[error("starting {module}: {reason}")]
    StartFailed { module: String, reason: String },

    /// A module requested the process exit with a specific code. Code
    /// [`EXIT_NO_RESTART`] tells the supervisor not to relaunch.
    #[error("{message}")]
    Exit { code: i32, message: String },
}

impl RuntimeError {
    pub fn exit(code: i32, message: impl ToString) -> Self {
        RuntimeError::Exit {
            code,
            message: message.to_string(),
        }
    }

    /// The process exit code this error maps to.
    pub fn exit_code(&self) -> i32 {
        match self {
            RuntimeError::Exit { code, .. } => *code,
            RuntimeError::Config(_) => EXIT_NO_RESTART,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_errors_map_to_no_restart() {
        let err = RuntimeError::from(ConfigError::MissingRoot);
        assert_eq!(err.exit_code(), EXIT_NO_RESTART);
    }

    #[test]
    fn exit_error_keeps_requested_code() {
        let err = RuntimeError::exit(3, "bad state");
        assert_eq!(err.exit_code(), 3);
        assert_eq!(err.to_string(), "bad state");
    }
}
