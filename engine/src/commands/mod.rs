//! Command handlers, one module per command type

pub mod abort;
pub mod acquire;
pub mod arc;
pub mod config;
pub mod day_calibrate;
pub mod get_status;
pub mod multrun;
pub mod twilight_calibrate;

use crate::command::Command;
use crate::error::CommandError;

/// A handler was given a command of another type
pub(crate) fn wrong_command(code: i32, expected: &str, command: &Command) -> CommandError {
    CommandError::failed(
        code,
        format!("{} handler cannot run {}", expected, command.command_type()),
    )
}
