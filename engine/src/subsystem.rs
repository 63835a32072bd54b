//! Subsystem Clients
//!
//! Request/reply interfaces to the four peers the engine talks to:
//! the detector controller, the mechanism controller, the upstream
//! scheduler (ISS) and the data-reduction pipeline (DP).
//!
//! Each client exposes a single `send(request)` call. The wire encoding of
//! each peer is the adapter's business; the engine only sees typed requests
//! and the common [`Reply`] envelope. Adapters report transport problems as
//! [`SubsystemError`]; device-level failures arrive as an unsuccessful reply
//! and are converted by [`Reply::into_result`].

use crate::astro::{PixelPosition, WcsSolution};
use crate::error::{SubsystemError, SubsystemResult};
use crate::fits::{HeaderCard, HeaderValue};
use crate::{Binning, FrameType};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// The four peers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Subsystem {
    Detector,
    Mechanism,
    Scheduler,
    Pipeline,
}

impl std::fmt::Display for Subsystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Subsystem::Detector => "detector",
            Subsystem::Mechanism => "mechanism controller",
            Subsystem::Scheduler => "ISS",
            Subsystem::Pipeline => "DP",
        })
    }
}

/// Reply envelope shared by every subsystem protocol.
///
/// `successful == false` or a non-zero `return_code` is a device failure;
/// `message` carries the device's diagnostic text in that case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply<P> {
    pub successful: bool,
    pub return_code: i32,
    pub message: Option<String>,
    pub payload: Option<P>,
}

impl<P> Reply<P> {
    pub fn ok(payload: P) -> Self {
        Self {
            successful: true,
            return_code: 0,
            message: None,
            payload: Some(payload),
        }
    }

    pub fn failed(return_code: i32, message: impl Into<String>) -> Self {
        Self {
            successful: false,
            return_code,
            message: Some(message.into()),
            payload: None,
        }
    }

    /// Convert to the payload, or to a [`SubsystemError`] carrying the
    /// device return code and message.
    pub fn into_result(self, subsystem: Subsystem) -> SubsystemResult<P> {
        if !self.successful || self.return_code != 0 {
            let message = self
                .message
                .unwrap_or_else(|| "no diagnostic message".to_string());
            // A failure flag with a zero code still has to surface as non-zero
            let return_code = if self.return_code == 0 { -1 } else { self.return_code };
            return Err(SubsystemError::device(subsystem, return_code, message));
        }
        self.payload.ok_or_else(|| {
            SubsystemError::malformed_reply(subsystem, "successful reply carried no payload")
        })
    }
}

// =============================================================================
// DETECTOR
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DetectorRequest {
    /// Set readout binning for subsequent exposures
    Configure { binning: Binning },
    /// Empty the detector's FITS header buffer
    ClearHeaders,
    /// Add or replace cards in the header buffer
    SetHeaders(Vec<HeaderCard>),
    /// Take `count` frames of `exposure_ms` each
    Multrun {
        exposure_ms: u64,
        count: u32,
        frame_type: FrameType,
    },
    /// Stop any exposure in progress
    Abort,
    Status,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DetectorPayload {
    Done,
    Filenames(Vec<String>),
    Status(DetectorStatus),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorStatus {
    pub temperature_c: f64,
    pub exposure_in_progress: bool,
    pub binning: Binning,
}

// =============================================================================
// MECHANISMS
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MechanismRequest {
    /// Start moving an actuator to a named position. Returns once the move
    /// has been accepted, not when it has finished.
    Move { actuator: String, position: String },
    /// Report the actuator's current named position
    Position { actuator: String },
    Lamp { lamp: String, on: bool },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MechanismPayload {
    Done,
    /// Current named position, or "moving" while in transit
    Position(String),
}

// =============================================================================
// SCHEDULER (ISS)
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SchedulerRequest {
    /// Telescope offset on sky from the nominal pointing. Absolute: replaces
    /// any previous RA/Dec offset.
    OffsetRaDec { ra_arcsec: f64, dec_arcsec: f64 },
    /// Telescope offset along the detector axes. Cumulative on the ISS side.
    OffsetXY { x_arcsec: f64, y_arcsec: f64 },
    FocusOffset { offset_mm: f64 },
    /// Fetch the ordered list of FITS cards the ISS wants in every frame
    FitsHeaders,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SchedulerPayload {
    Done,
    Headers(Vec<(String, Option<HeaderValue>)>),
}

// =============================================================================
// PIPELINE (DP)
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PipelineRequest {
    Reduce { filename: String, wcs_fit: bool },
    ReduceCalibration { filename: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PipelinePayload {
    Reduction(ReductionResult),
    Calibration(CalibrationReduction),
}

/// Photometric and astrometric results for one science or acquisition frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReductionResult {
    pub filename: String,
    pub mean_counts: f64,
    pub peak_counts: f64,
    pub seeing_arcsec: f64,
    pub sky_brightness: f64,
    pub saturated: bool,
    /// Centroid of the brightest source, in binned pixels
    pub brightest_object: Option<PixelPosition>,
    /// Present only when a WCS fit was requested and succeeded
    pub wcs: Option<WcsSolution>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationReduction {
    pub filename: String,
    pub mean_counts: f64,
    pub peak_counts: f64,
}

// =============================================================================
// CLIENT TRAITS
// =============================================================================

#[async_trait]
pub trait DetectorClient: Send + Sync {
    async fn send(&self, request: DetectorRequest) -> SubsystemResult<Reply<DetectorPayload>>;
}

#[async_trait]
pub trait MechanismClient: Send + Sync {
    async fn send(&self, request: MechanismRequest) -> SubsystemResult<Reply<MechanismPayload>>;
}

#[async_trait]
pub trait SchedulerClient: Send + Sync {
    async fn send(&self, request: SchedulerRequest) -> SubsystemResult<Reply<SchedulerPayload>>;
}

#[async_trait]
pub trait PipelineClient: Send + Sync {
    async fn send(&self, request: PipelineRequest) -> SubsystemResult<Reply<PipelinePayload>>;
}

pub type SharedDetector = Arc<dyn DetectorClient>;
pub type SharedMechanism = Arc<dyn MechanismClient>;
pub type SharedScheduler = Arc<dyn SchedulerClient>;
pub type SharedPipeline = Arc<dyn PipelineClient>;

/// Handles to every subsystem, passed around as one value
#[derive(Clone)]
pub struct Subsystems {
    pub detector: SharedDetector,
    pub mechanism: SharedMechanism,
    pub scheduler: SharedScheduler,
    pub pipeline: SharedPipeline,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_into_result_success() {
        let reply = Reply::ok(MechanismPayload::Position("in".into()));
        let payload = reply.into_result(Subsystem::Mechanism).unwrap();
        assert_eq!(payload, MechanismPayload::Position("in".into()));
    }

    #[test]
    fn test_reply_failure_carries_return_code() {
        let reply: Reply<DetectorPayload> = Reply::failed(17, "CCD not cooled");
        match reply.into_result(Subsystem::Detector) {
            Err(SubsystemError::Device { return_code, message, .. }) => {
                assert_eq!(return_code, 17);
                assert_eq!(message, "CCD not cooled");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_reply_failure_flag_with_zero_code_is_nonzero() {
        let reply: Reply<DetectorPayload> = Reply {
            successful: false,
            return_code: 0,
            message: None,
            payload: None,
        };
        let err = reply.into_result(Subsystem::Detector).unwrap_err();
        assert_ne!(err.return_code(), 0);
    }

    #[test]
    fn test_reply_without_payload_is_malformed() {
        let reply: Reply<PipelinePayload> = Reply {
            successful: true,
            return_code: 0,
            message: None,
            payload: None,
        };
        assert!(matches!(
            reply.into_result(Subsystem::Pipeline),
            Err(SubsystemError::MalformedReply { .. })
        ));
    }
}
