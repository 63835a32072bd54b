//! Error types for the spectrograph engine
//!
//! Two layers:
//! - [`SubsystemError`]: the single error type every subsystem client call
//!   produces. Carries the device return code and diagnostic message.
//! - [`CommandError`]: what a command handler returns. Subsystem failures are
//!   wrapped exactly once with the call site's numeric code, so a failed DONE
//!   identifies where it went wrong from the code alone.
//!
//! Error codes are allocated per command as a base plus a small per-site
//! increment (see the `ERROR_BASE` constant in each command module).

use crate::subsystem::Subsystem;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Error code reported in DONE when a command stopped because ABORT was received
pub const ABORT_ERROR_CODE: i32 = 9000;

/// Error code reported in DONE when a handler panicked
pub const PANIC_ERROR_CODE: i32 = 9001;

/// Error code for malformed or unknown inbound commands
pub const UNKNOWN_COMMAND_ERROR_CODE: i32 = 9002;

/// Return code used for failures that never reached the device
pub const NO_DEVICE_RETURN_CODE: i32 = -1;

pub type SubsystemResult<T> = Result<T, SubsystemError>;
pub type CommandResult<T> = Result<T, CommandError>;

/// Failure of a single request/reply exchange with a subsystem
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SubsystemError {
    // =========================================================================
    // Device-reported failures
    // =========================================================================

    /// The subsystem answered with a failure flag or non-zero return code
    #[error("{subsystem} returned error {return_code}: {message}")]
    Device {
        subsystem: Subsystem,
        return_code: i32,
        message: String,
    },

    /// The subsystem answered, but the reply could not be interpreted
    #[error("{subsystem} sent a malformed reply: {message}")]
    MalformedReply {
        subsystem: Subsystem,
        message: String,
    },

    // =========================================================================
    // Transport failures
    // =========================================================================

    #[error("{subsystem} communication failed: {message}")]
    Communication {
        subsystem: Subsystem,
        message: String,
    },

    #[error("{subsystem} operation '{operation}' timed out after {timeout_secs:.1}s")]
    Timeout {
        subsystem: Subsystem,
        operation: String,
        timeout_secs: f64,
    },

    // =========================================================================
    // Caller errors
    // =========================================================================

    #[error("Invalid argument for {subsystem}: {message}")]
    InvalidArgument {
        subsystem: Subsystem,
        message: String,
    },
}

impl SubsystemError {
    pub fn device(subsystem: Subsystem, return_code: i32, message: impl Into<String>) -> Self {
        SubsystemError::Device {
            subsystem,
            return_code,
            message: message.into(),
        }
    }

    pub fn malformed_reply(subsystem: Subsystem, message: impl Into<String>) -> Self {
        SubsystemError::MalformedReply {
            subsystem,
            message: message.into(),
        }
    }

    pub fn communication(subsystem: Subsystem, message: impl Into<String>) -> Self {
        SubsystemError::Communication {
            subsystem,
            message: message.into(),
        }
    }

    pub fn timeout(subsystem: Subsystem, operation: impl Into<String>, timeout: Duration) -> Self {
        SubsystemError::Timeout {
            subsystem,
            operation: operation.into(),
            timeout_secs: timeout.as_secs_f64(),
        }
    }

    pub fn invalid_argument(subsystem: Subsystem, message: impl Into<String>) -> Self {
        SubsystemError::InvalidArgument {
            subsystem,
            message: message.into(),
        }
    }

    /// Subsystem that produced this error
    pub fn subsystem(&self) -> Subsystem {
        match self {
            SubsystemError::Device { subsystem, .. }
            | SubsystemError::MalformedReply { subsystem, .. }
            | SubsystemError::Communication { subsystem, .. }
            | SubsystemError::Timeout { subsystem, .. }
            | SubsystemError::InvalidArgument { subsystem, .. } => *subsystem,
        }
    }

    /// Return code reported by the device, or [`NO_DEVICE_RETURN_CODE`]
    /// when the failure happened before the device could answer.
    pub fn return_code(&self) -> i32 {
        match self {
            SubsystemError::Device { return_code, .. } => *return_code,
            _ => NO_DEVICE_RETURN_CODE,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, SubsystemError::Timeout { .. })
    }
}

/// Failure of a command, as reported in its DONE message
#[derive(Error, Debug, Clone)]
pub enum CommandError {
    /// A subsystem call failed at a known call site
    #[error("{context}: {source}")]
    Subsystem {
        code: i32,
        context: String,
        source: SubsystemError,
    },

    /// ABORT was observed at a checkpoint
    #[error("Command aborted")]
    Aborted,

    /// A convergence loop ran out of attempts
    #[error("{context}: too many attempts ({attempts} offsets issued, last distance {last_distance_arcsec:.3} arcsec)")]
    NotConverged {
        code: i32,
        context: String,
        attempts: u32,
        last_distance_arcsec: f64,
    },

    /// Local failure: bad parameter, missing configuration, unexpected data
    #[error("{message}")]
    Failed { code: i32, message: String },

    /// The handler panicked; converted at the dispatcher
    #[error("Internal panic during command execution: {0}")]
    Panicked(String),
}

impl CommandError {
    pub fn failed(code: i32, message: impl Into<String>) -> Self {
        CommandError::Failed {
            code,
            message: message.into(),
        }
    }

    pub fn subsystem(code: i32, context: impl Into<String>, source: SubsystemError) -> Self {
        CommandError::Subsystem {
            code,
            context: context.into(),
            source,
        }
    }

    pub fn not_converged(
        code: i32,
        context: impl Into<String>,
        attempts: u32,
        last_distance_arcsec: f64,
    ) -> Self {
        CommandError::NotConverged {
            code,
            context: context.into(),
            attempts,
            last_distance_arcsec,
        }
    }

    /// Numeric code reported in the DONE message. Never zero.
    pub fn code(&self) -> i32 {
        match self {
            CommandError::Subsystem { code, .. }
            | CommandError::NotConverged { code, .. }
            | CommandError::Failed { code, .. } => *code,
            CommandError::Aborted => ABORT_ERROR_CODE,
            CommandError::Panicked(_) => PANIC_ERROR_CODE,
        }
    }

    pub fn is_abort(&self) -> bool {
        matches!(self, CommandError::Aborted)
    }

    pub fn is_iteration_bound(&self) -> bool {
        matches!(self, CommandError::NotConverged { .. })
    }

    /// Device return code, when the failure came from a device reply
    pub fn device_return_code(&self) -> Option<i32> {
        match self {
            CommandError::Subsystem {
                source: SubsystemError::Device { return_code, .. },
                ..
            } => Some(*return_code),
            _ => None,
        }
    }
}

/// Wrap a subsystem failure with the call site's error code and context
pub trait ResultExt<T> {
    fn at_site(self, code: i32, context: &str) -> CommandResult<T>;
}

impl<T> ResultExt<T> for SubsystemResult<T> {
    fn at_site(self, code: i32, context: &str) -> CommandResult<T> {
        self.map_err(|source| CommandError::subsystem(code, context, source))
    }
}

/// Errors loading the instrument configuration file
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse configuration {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Errors reading or writing persisted key/value state
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Failed to access state file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Corrupt state file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}
