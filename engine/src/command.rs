//! Commands, acknowledgements and outcomes
//!
//! One inbound [`Command`] produces zero or more [`Ack`] messages followed by
//! exactly one [`Done`]. Every message carries the command's correlation id.

use crate::acquisition::{AcquisitionMode, AcquisitionReport};
use crate::astro::{PixelPosition, TargetMotion};
use crate::calibration::CalibrationReport;
use crate::context::ExecutionContext;
use crate::error::CommandResult;
use crate::status::StatusSnapshot;
use crate::subsystem::DetectorStatus;
use crate::Binning;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A request from the ISS. Immutable once received.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub id: String,
    #[serde(flatten)]
    pub kind: CommandKind,
}

impl Command {
    pub fn new(id: impl Into<String>, kind: CommandKind) -> Self {
        Self {
            id: id.into(),
            kind,
        }
    }

    pub fn command_type(&self) -> CommandType {
        self.kind.command_type()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandKind {
    /// Move the slit, grism and rotation stages and set detector binning
    Config {
        name: String,
        binning: Binning,
        slit: String,
        grism: String,
        rotation: String,
    },
    /// Science exposures
    Multrun { exposure_ms: u64, count: u32 },
    /// Arc lamp calibration exposure
    Arc {
        exposure_ms: u64,
        #[serde(default)]
        lamp: Option<String>,
    },
    Acquire(AcquireParams),
    DayCalibrate { time_budget_ms: u64 },
    TwilightCalibrate { time_budget_ms: u64 },
    Abort,
    GetStatus {
        #[serde(default)]
        include_detector: bool,
    },
}

impl CommandKind {
    pub fn command_type(&self) -> CommandType {
        match self {
            CommandKind::Config { .. } => CommandType::Config,
            CommandKind::Multrun { .. } => CommandType::Multrun,
            CommandKind::Arc { .. } => CommandType::Arc,
            CommandKind::Acquire(_) => CommandType::Acquire,
            CommandKind::DayCalibrate { .. } => CommandType::DayCalibrate,
            CommandKind::TwilightCalibrate { .. } => CommandType::TwilightCalibrate,
            CommandKind::Abort => CommandType::Abort,
            CommandKind::GetStatus { .. } => CommandType::GetStatus,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquireParams {
    pub mode: AcquisitionMode,
    pub exposure_ms: u64,
    /// Detector pixel the target should end up on (binned pixels)
    pub target_pixel: PixelPosition,
    /// Target position, radians. Required in WCS mode.
    #[serde(default)]
    pub ra: Option<f64>,
    #[serde(default)]
    pub dec: Option<f64>,
    #[serde(default)]
    pub motion: Option<TargetMotion>,
    /// Acceptance radius; the configured default is used when absent
    #[serde(default)]
    pub threshold_arcsec: Option<f64>,
}

/// Command-type tag used as the registration key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CommandType {
    Config,
    Multrun,
    Arc,
    Acquire,
    DayCalibrate,
    TwilightCalibrate,
    Abort,
    GetStatus,
}

impl CommandType {
    pub fn name(&self) -> &'static str {
        match self {
            CommandType::Config => "CONFIG",
            CommandType::Multrun => "MULTRUN",
            CommandType::Arc => "ARC",
            CommandType::Acquire => "ACQUIRE",
            CommandType::DayCalibrate => "DAY_CALIBRATE",
            CommandType::TwilightCalibrate => "TWILIGHT_CALIBRATE",
            CommandType::Abort => "ABORT",
            CommandType::GetStatus => "GET_STATUS",
        }
    }

    /// Control commands run alongside the current command instead of
    /// replacing it, and never clear the abort flag.
    pub fn is_control(&self) -> bool {
        matches!(self, CommandType::Abort | CommandType::GetStatus)
    }
}

impl std::fmt::Display for CommandType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Interim acknowledgement: the next message for `id` is due within
/// `time_to_complete_ms`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ack {
    pub id: String,
    pub time_to_complete_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

/// Terminal outcome of a command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Done {
    pub id: String,
    pub successful: bool,
    pub error_code: i32,
    pub error_message: Option<String>,
    pub output: CommandOutput,
}

impl Done {
    pub fn success(id: impl Into<String>, output: CommandOutput) -> Self {
        Self {
            id: id.into(),
            successful: true,
            error_code: 0,
            error_message: None,
            output,
        }
    }

    pub fn failure(id: impl Into<String>, error_code: i32, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            successful: false,
            error_code,
            error_message: Some(message.into()),
            output: CommandOutput::None,
        }
    }
}

/// Outbound message stream for one command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Message {
    Ack(Ack),
    Done(Done),
}

impl Message {
    pub fn id(&self) -> &str {
        match self {
            Message::Ack(ack) => &ack.id,
            Message::Done(done) => &done.id,
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, Message::Done(_))
    }
}

/// Command-specific result fields of a successful DONE
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum CommandOutput {
    #[default]
    None,
    Config {
        config_id: i64,
    },
    Frames(FrameReport),
    Acquisition(AcquisitionReport),
    Calibration(CalibrationReport),
    Status(StatusReport),
}

/// Result of a MULTRUN or ARC: the last frame and its reduction
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FrameReport {
    pub filenames: Vec<String>,
    pub mean_counts: f64,
    pub peak_counts: f64,
    pub seeing_arcsec: Option<f64>,
    pub saturated: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub status: StatusSnapshot,
    pub detector: Option<DetectorStatus>,
}

/// Implementation of one command type.
///
/// Handlers are built per command by the [`Registry`](crate::registry::Registry)
/// with whatever capabilities they need (hardware coordination, calibration
/// history, configuration id counter).
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Time the caller should allow before the first ACK or the DONE.
    /// Pure; falls back to a conservative default when inputs are unknown.
    fn estimate_acknowledge_time(&self, command: &Command) -> Duration;

    /// Run the command. May send ACKs through `ctx`. Must check for abort
    /// before each hardware-affecting step and after each blocking call.
    async fn execute(&self, command: &Command, ctx: &ExecutionContext) -> CommandResult<CommandOutput>;
}
