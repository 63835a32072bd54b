//! Spectrograph Command Engine
//!
//! Executes instrument commands for a robotic spectrograph: staged
//! acknowledgements, abort propagation, guaranteed lamp and mirror cleanup,
//! closed-loop target acquisition and adaptive day/twilight calibration.
//!
//! ## Layout
//!
//! - [`subsystem`]: request/reply client traits for the detector, mechanism
//!   controller, ISS and data pipeline
//! - [`hardware`]: shared coordination primitives built on those clients
//! - [`acquisition`], [`calibration`], [`twilight`]: the control loops
//! - [`commands`], [`registry`], [`dispatcher`]: per-command handlers and
//!   the dispatch engine that turns one command into ACKs and one DONE

pub mod acquisition;
pub mod astro;
pub mod calibration;
pub mod command;
pub mod commands;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod fits;
pub mod hardware;
pub mod persistence;
pub mod registry;
pub mod sim;
pub mod status;
pub mod subsystem;
pub mod twilight;

#[cfg(test)]
pub(crate) mod testing;

pub use command::{Ack, Command, CommandHandler, CommandKind, CommandOutput, CommandType, Done, Message};
pub use config::InstrumentConfig;
pub use context::ExecutionContext;
pub use dispatcher::Dispatcher;
pub use error::{
    CommandError, CommandResult, ConfigError, ResultExt, StoreError, SubsystemError,
    SubsystemResult, ABORT_ERROR_CODE, PANIC_ERROR_CODE, UNKNOWN_COMMAND_ERROR_CODE,
};
pub use hardware::Hardware;
pub use registry::{Registry, Services};
pub use status::{InstrumentStatus, StatusSnapshot};

use serde::{Deserialize, Serialize};

/// Detector binning factors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Binning {
    pub x: u32,
    pub y: u32,
}

impl Binning {
    pub const fn new(x: u32, y: u32) -> Self {
        Self { x, y }
    }

    pub const fn square(factor: u32) -> Self {
        Self { x: factor, y: factor }
    }

    /// Number of unbinned pixels summed into one binned pixel
    pub fn area(&self) -> f64 {
        (self.x as f64) * (self.y as f64)
    }
}

impl Default for Binning {
    fn default() -> Self {
        Self::square(1)
    }
}

impl std::fmt::Display for Binning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.x, self.y)
    }
}

/// Kind of frame the detector is asked to take. Written into the
/// OBSTYPE header and used by the detector to name output files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FrameType {
    Bias,
    Dark,
    LampFlat,
    Arc,
    Exposure,
    Acquire,
    SkyFlat,
}

impl FrameType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FrameType::Bias => "BIAS",
            FrameType::Dark => "DARK",
            FrameType::LampFlat => "LAMP-FLAT",
            FrameType::Arc => "ARC",
            FrameType::Exposure => "EXPOSE",
            FrameType::Acquire => "ACQUIRE",
            FrameType::SkyFlat => "SKY-FLAT",
        }
    }

    /// Calibration frames are not science data and do not carry the
    /// scheduler's OBJECT name unchanged.
    pub fn is_calibration(&self) -> bool {
        matches!(
            self,
            FrameType::Bias | FrameType::Dark | FrameType::LampFlat | FrameType::Arc | FrameType::SkyFlat
        )
    }
}

impl std::fmt::Display for FrameType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
