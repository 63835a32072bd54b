//! Acquisition Controller
//!
//! Brings a target onto a chosen detector pixel. Each iteration exposes one
//! frame, measures where the target landed (through the pipeline's WCS fit,
//! or the brightest-object centroid), and offsets the telescope by the
//! difference until the angular error is under the threshold or the offset
//! budget is used up.
//!
//! The ISS offset command is cumulative, so each iteration sends only the
//! newly measured delta. The running total is kept for the report.

use crate::astro::{exposure_midpoint, PixelPosition, SkyPosition, TargetMotion};
use crate::context::ExecutionContext;
use crate::error::{CommandError, CommandResult, ResultExt};
use crate::hardware::Hardware;
use crate::subsystem::ReductionResult;
use crate::{Binning, FrameType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

// Failure sites, shared with the ACQUIRE command
pub const ERROR_BASE: i32 = 1300;
pub const ERR_CONFIG_HEADERS: i32 = ERROR_BASE + 1;
pub const ERR_CONFIGURE: i32 = ERROR_BASE + 2;
pub const ERR_NO_PLATE_SCALE: i32 = ERROR_BASE + 3;
pub const ERR_NO_SKY_TARGET: i32 = ERROR_BASE + 4;
pub const ERR_EXPOSE: i32 = ERROR_BASE + 5;
pub const ERR_REDUCE: i32 = ERROR_BASE + 6;
pub const ERR_NO_WCS: i32 = ERROR_BASE + 7;
pub const ERR_PROJECTION: i32 = ERROR_BASE + 8;
pub const ERR_NO_OBJECT: i32 = ERROR_BASE + 9;
pub const ERR_OFFSET: i32 = ERROR_BASE + 10;
pub const ERR_TOO_MANY_ATTEMPTS: i32 = ERROR_BASE + 11;
pub const ERR_WRONG_COMMAND: i32 = ERROR_BASE + 12;
pub const ERR_ISS_HEADERS: i32 = ERROR_BASE + 13;
pub const ERR_FRAME_TYPE: i32 = ERROR_BASE + 14;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AcquisitionMode {
    /// Project the target's sky position through the frame's astrometric fit
    Wcs,
    /// Use the pipeline's brightest-object centroid
    Brightest,
}

/// Everything one acquisition needs, resolved from the command and configuration
#[derive(Debug, Clone)]
pub struct AcquisitionRequest {
    pub mode: AcquisitionMode,
    pub target_pixel: PixelPosition,
    pub sky_target: Option<SkyPosition>,
    pub motion: Option<TargetMotion>,
    pub threshold_arcsec: f64,
    pub exposure_ms: u64,
    pub binning: Binning,
    pub maximum_offset_count: u32,
    /// Time allowed per iteration on top of the exposure
    pub overhead: Duration,
}

/// Outcome of comparing one measured position with the target pixel
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PositionEvaluation {
    /// observed - target, binned pixels
    pub delta_x_px: f64,
    pub delta_y_px: f64,
    /// The same delta as an angle along each detector axis
    pub offset_x_arcsec: f64,
    pub offset_y_arcsec: f64,
    pub distance_arcsec: f64,
    pub converged: bool,
}

/// Compare an observed object pixel with the target pixel.
///
/// `plate_scale` is arcsec per binned pixel along x and y; the two axes are
/// scaled independently so non-square binning is handled.
pub fn evaluate_position(
    observed: PixelPosition,
    target: PixelPosition,
    plate_scale: (f64, f64),
    threshold_arcsec: f64,
) -> PositionEvaluation {
    let delta_x_px = observed.x - target.x;
    let delta_y_px = observed.y - target.y;
    let offset_x_arcsec = delta_x_px * plate_scale.0;
    let offset_y_arcsec = delta_y_px * plate_scale.1;
    let distance_arcsec = offset_x_arcsec.hypot(offset_y_arcsec);

    PositionEvaluation {
        delta_x_px,
        delta_y_px,
        offset_x_arcsec,
        offset_y_arcsec,
        distance_arcsec,
        converged: distance_arcsec < threshold_arcsec,
    }
}

/// Result fields of a successful acquisition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionReport {
    pub exposures: u32,
    pub offsets_issued: u32,
    /// Sum of all offsets sent, binned pixels
    pub total_offset_x_px: f64,
    pub total_offset_y_px: f64,
    pub final_distance_arcsec: f64,
    pub last_position: PixelPosition,
    pub last_filename: String,
}

/// Per-invocation loop state
#[derive(Debug, Default)]
struct AcquisitionState {
    exposures: u32,
    offsets_issued: u32,
    total_offset_x_px: f64,
    total_offset_y_px: f64,
}

/// Run the convergence loop. Detector binning and headers must already be set.
pub async fn acquire(
    hardware: &Hardware,
    ctx: &ExecutionContext,
    request: &AcquisitionRequest,
) -> CommandResult<AcquisitionReport> {
    let plate_scale = hardware.config().plate_scale(request.binning).ok_or_else(|| {
        CommandError::failed(
            ERR_NO_PLATE_SCALE,
            format!("No plate scale configured for binning {}", request.binning),
        )
    })?;
    if request.mode == AcquisitionMode::Wcs && request.sky_target.is_none() {
        return Err(CommandError::failed(
            ERR_NO_SKY_TARGET,
            "WCS acquisition needs a target RA and Dec",
        ));
    }

    tracing::info!(
        "Acquiring in {:?} mode onto pixel ({:.1}, {:.1}), threshold {:.2}\", at most {} offsets",
        request.mode,
        request.target_pixel.x,
        request.target_pixel.y,
        request.threshold_arcsec,
        request.maximum_offset_count
    );
    if let Some(sky) = request.sky_target {
        tracing::info!("Target position {}", sky);
    }

    let exposure = Duration::from_millis(request.exposure_ms);
    let mut state = AcquisitionState::default();
    ctx.status().begin_exposure_batch(0, request.exposure_ms);

    loop {
        ctx.check_abort()?;
        ctx.acknowledge(exposure + request.overhead);

        state.exposures += 1;
        let start = Utc::now();
        ctx.status().exposure_started(state.exposures, start);
        let filename = hardware
            .expose(request.exposure_ms, FrameType::Acquire)
            .await
            .at_site(ERR_EXPOSE, "Taking acquisition frame")?;
        let end = Utc::now();
        ctx.check_abort()?;

        ctx.acknowledge_with_filename(request.overhead, &filename);
        let reduction = hardware
            .reduce(&filename, request.mode == AcquisitionMode::Wcs)
            .await
            .at_site(ERR_REDUCE, "Reducing acquisition frame")?;
        ctx.check_abort()?;

        let observed = object_position(request, &reduction, start, end)?;
        let evaluation = evaluate_position(
            observed,
            request.target_pixel,
            plate_scale,
            request.threshold_arcsec,
        );
        tracing::info!(
            "Acquisition frame {} ({}): object at ({:.2}, {:.2}), delta ({:+.2}, {:+.2}) px, {:.3}\" from target",
            state.exposures,
            filename,
            observed.x,
            observed.y,
            evaluation.delta_x_px,
            evaluation.delta_y_px,
            evaluation.distance_arcsec
        );

        if evaluation.converged {
            tracing::info!(
                "Acquired within {:.3}\" after {} exposure(s), {} offset(s)",
                evaluation.distance_arcsec,
                state.exposures,
                state.offsets_issued
            );
            return Ok(AcquisitionReport {
                exposures: state.exposures,
                offsets_issued: state.offsets_issued,
                total_offset_x_px: state.total_offset_x_px,
                total_offset_y_px: state.total_offset_y_px,
                final_distance_arcsec: evaluation.distance_arcsec,
                last_position: observed,
                last_filename: filename,
            });
        }

        if state.offsets_issued >= request.maximum_offset_count {
            tracing::warn!(
                "Target still {:.3}\" away after {} offsets, giving up",
                evaluation.distance_arcsec,
                state.offsets_issued
            );
            return Err(CommandError::not_converged(
                ERR_TOO_MANY_ATTEMPTS,
                "Acquisition did not converge",
                state.offsets_issued,
                evaluation.distance_arcsec,
            ));
        }

        ctx.check_abort()?;
        hardware
            .offset_xy(evaluation.offset_x_arcsec, evaluation.offset_y_arcsec)
            .await
            .at_site(ERR_OFFSET, "Offsetting telescope")?;
        state.offsets_issued += 1;
        state.total_offset_x_px += evaluation.delta_x_px;
        state.total_offset_y_px += evaluation.delta_y_px;
    }
}

/// Where the target currently falls on the detector
fn object_position(
    request: &AcquisitionRequest,
    reduction: &ReductionResult,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> CommandResult<PixelPosition> {
    match request.mode {
        AcquisitionMode::Brightest => reduction.brightest_object.ok_or_else(|| {
            CommandError::failed(
                ERR_NO_OBJECT,
                format!("No object found in {}", reduction.filename),
            )
        }),
        AcquisitionMode::Wcs => {
            let wcs = reduction.wcs.as_ref().ok_or_else(|| {
                CommandError::failed(
                    ERR_NO_WCS,
                    format!("WCS fit failed for {}", reduction.filename),
                )
            })?;
            let base = request.sky_target.ok_or_else(|| {
                CommandError::failed(ERR_NO_SKY_TARGET, "WCS acquisition needs a target RA and Dec")
            })?;
            let sky = match &request.motion {
                Some(motion) => motion.position_at(base, exposure_midpoint(start, end)),
                None => base,
            };
            let pixel = wcs.sky_to_pixel(sky).ok_or_else(|| {
                CommandError::failed(
                    ERR_PROJECTION,
                    format!("Target {} does not project onto {}", sky, reduction.filename),
                )
            })?;
            tracing::debug!("Target {} at mid-exposure projects to ({:.2}, {:.2})", sky, pixel.x, pixel.y);
            Ok(pixel)
        }
    }
}
