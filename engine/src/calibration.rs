//! Day Calibration Scheduler
//!
//! Walks the configured calibration list in priority order and runs each
//! entry that is due, stopping at the deadline. A calibration's completion
//! time is persisted only once its whole batch of frames has been taken and
//! reduced.

use crate::config::{CalibrationType, DayCalibrationCandidate};
use crate::context::ExecutionContext;
use crate::error::{CommandError, CommandResult, ResultExt};
use crate::hardware::{release_calibration_hardware, Hardware, SharedHardware};
use crate::persistence::{day_calibration_key, CalibrationHistory};
use crate::FrameType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const ERROR_BASE: i32 = 1400;
pub const ERR_WRONG_COMMAND: i32 = ERROR_BASE + 1;
pub const ERR_CONFIG_HEADERS: i32 = ERROR_BASE + 2;
pub const ERR_CONFIGURE: i32 = ERROR_BASE + 3;
pub const ERR_FRAME_TYPE: i32 = ERROR_BASE + 4;
pub const ERR_MIRROR: i32 = ERROR_BASE + 5;
pub const ERR_LAMP: i32 = ERROR_BASE + 6;
pub const ERR_EXPOSE: i32 = ERROR_BASE + 7;
pub const ERR_REDUCE: i32 = ERROR_BASE + 8;
pub const ERR_PERSIST: i32 = ERROR_BASE + 9;

/// Scheduling verdict for one candidate
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CandidateDecision {
    Run,
    /// Completed less than `frequency` ago
    TooSoon { since_last: Duration },
    /// Overall deadline has passed; no later candidate can run either
    DeadlineExceeded,
    /// This candidate alone would overrun the deadline
    InsufficientTime { needed: Duration, remaining: Duration },
}

/// Decide whether a candidate runs now
pub fn evaluate_candidate(
    now: DateTime<Utc>,
    last_completed: Option<DateTime<Utc>>,
    frequency: Duration,
    deadline: DateTime<Utc>,
    predicted: Duration,
) -> CandidateDecision {
    if now > deadline {
        return CandidateDecision::DeadlineExceeded;
    }
    if let Some(last) = last_completed {
        let since_last = (now - last).to_std().unwrap_or(Duration::ZERO);
        if since_last < frequency {
            return CandidateDecision::TooSoon { since_last };
        }
    }
    let remaining = (deadline - now).to_std().unwrap_or(Duration::ZERO);
    if predicted > remaining {
        return CandidateDecision::InsufficientTime {
            needed: predicted,
            remaining,
        };
    }
    CandidateDecision::Run
}

/// `count` frames of `exposure` plus readout each
pub fn predicted_duration(count: u32, exposure: Duration, readout: Duration) -> Duration {
    (exposure + readout) * count
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    TooSoon,
    InsufficientTime,
    DeadlineExceeded,
    TooDark,
    TooBright,
    /// Frames were taken but not every one was inside the count band
    OutOfBand,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedCalibration {
    pub key: String,
    pub reason: SkipReason,
}

/// Result fields of a calibration run
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CalibrationReport {
    /// History keys of calibrations completed and persisted
    pub completed: Vec<String>,
    pub skipped: Vec<SkippedCalibration>,
    pub frames: u32,
    pub deadline_reached: bool,
}

impl CalibrationReport {
    pub(crate) fn skip(&mut self, key: String, reason: SkipReason) {
        tracing::info!("Skipping calibration {}: {:?}", key, reason);
        self.skipped.push(SkippedCalibration { key, reason });
    }
}

fn frame_type_for(calibration_type: CalibrationType) -> FrameType {
    match calibration_type {
        CalibrationType::Bias => FrameType::Bias,
        CalibrationType::Dark => FrameType::Dark,
        CalibrationType::Flat => FrameType::LampFlat,
    }
}

/// Run every due day calibration within `time_budget`
pub async fn run_day_calibration(
    hardware: &SharedHardware,
    history: &CalibrationHistory,
    ctx: &ExecutionContext,
    time_budget: Duration,
) -> CommandResult<CalibrationReport> {
    let config = hardware.config();
    let readout = config.detector.readout_overhead();
    let start = Utc::now();
    let deadline = start + chrono::Duration::from_std(time_budget).unwrap_or(chrono::Duration::zero());
    let mut report = CalibrationReport::default();

    tracing::info!(
        "Day calibration: {} candidates, budget {:.0}s",
        config.day_calibration.candidates.len(),
        time_budget.as_secs_f64()
    );

    let candidates = &config.day_calibration.candidates;
    for (index, candidate) in candidates.iter().enumerate() {
        ctx.check_abort()?;

        let key = day_calibration_key(candidate);
        let exposure = Duration::from_millis(candidate.effective_exposure_ms());
        let warmup = match candidate.calibration_type {
            CalibrationType::Flat => config.lamps.warmup(&flat_lamp(hardware, candidate)),
            _ => Duration::ZERO,
        };
        let predicted = predicted_duration(candidate.count, exposure, readout) + warmup;
        let now = Utc::now();

        match evaluate_candidate(
            now,
            history.last_completed(&key),
            Duration::from_millis(candidate.frequency_ms),
            deadline,
            predicted,
        ) {
            CandidateDecision::Run => {}
            CandidateDecision::DeadlineExceeded => {
                tracing::info!("Day calibration deadline reached, stopping");
                report.deadline_reached = true;
                for remaining in &candidates[index..] {
                    report.skip(day_calibration_key(remaining), SkipReason::DeadlineExceeded);
                }
                break;
            }
            CandidateDecision::TooSoon { .. } => {
                report.skip(key, SkipReason::TooSoon);
                continue;
            }
            CandidateDecision::InsufficientTime { .. } => {
                report.skip(key, SkipReason::InsufficientTime);
                continue;
            }
        }

        tracing::info!("Running day calibration {}", key);
        ctx.acknowledge(predicted + config.detector.reduction_overhead() * candidate.count);
        report.frames += run_day_candidate(hardware, ctx, candidate).await?;

        history
            .record_completion(&key, Utc::now())
            .map_err(|e| CommandError::failed(ERR_PERSIST, format!("Saving calibration history: {}", e)))?;
        report.completed.push(key);
    }

    tracing::info!(
        "Day calibration finished: {} completed, {} skipped, {} frames",
        report.completed.len(),
        report.skipped.len(),
        report.frames
    );
    Ok(report)
}

fn flat_lamp(hardware: &Hardware, candidate: &DayCalibrationCandidate) -> String {
    candidate
        .lamp
        .clone()
        .unwrap_or_else(|| hardware.config().lamps.flat_lamp.clone())
}

/// Configure, then take and reduce every frame of one candidate
async fn run_day_candidate(
    hardware: &SharedHardware,
    ctx: &ExecutionContext,
    candidate: &DayCalibrationCandidate,
) -> CommandResult<u32> {
    let frame_type = frame_type_for(candidate.calibration_type);

    hardware
        .configure_detector(candidate.binning)
        .await
        .at_site(ERR_CONFIGURE, "Configuring detector for calibration")?;
    ctx.check_abort()?;
    hardware
        .push_frame_type(frame_type)
        .await
        .at_site(ERR_FRAME_TYPE, "Setting calibration frame headers")?;
    ctx.check_abort()?;

    if candidate.calibration_type != CalibrationType::Flat {
        return take_frames(hardware, ctx, candidate, frame_type).await;
    }

    let lamp = flat_lamp(hardware, candidate);
    let mirror = hardware
        .mirror_in()
        .await
        .at_site(ERR_MIRROR, "Moving calibration mirror in")?;
    if let Err(e) = ctx.check_abort() {
        release_calibration_hardware(None, Some(mirror)).await;
        return Err(e);
    }
    let lamp_guard = match hardware.lamp_on(&lamp).await {
        Ok(guard) => guard,
        Err(e) => {
            release_calibration_hardware(None, Some(mirror)).await;
            return Err(CommandError::subsystem(ERR_LAMP, format!("Turning on lamp {}", lamp), e));
        }
    };

    let result = async {
        let warmup = hardware.config().lamps.warmup(&lamp);
        ctx.acknowledge(warmup + hardware.config().detector.readout_overhead());
        ctx.sleep(warmup).await?;
        take_frames(hardware, ctx, candidate, frame_type).await
    }
    .await;

    release_calibration_hardware(Some(lamp_guard), Some(mirror)).await;
    result
}

/// Expose and reduce `candidate.count` frames, one at a time so abort is
/// observed between frames.
async fn take_frames(
    hardware: &Hardware,
    ctx: &ExecutionContext,
    candidate: &DayCalibrationCandidate,
    frame_type: FrameType,
) -> CommandResult<u32> {
    let exposure_ms = candidate.effective_exposure_ms();
    let config = hardware.config();
    let per_frame = Duration::from_millis(exposure_ms)
        + config.detector.readout_overhead()
        + config.detector.reduction_overhead();

    ctx.status().begin_exposure_batch(candidate.count, exposure_ms);
    for number in 1..=candidate.count {
        ctx.check_abort()?;
        ctx.acknowledge(per_frame);
        ctx.status().exposure_started(number, Utc::now());

        let filename = hardware
            .expose(exposure_ms, frame_type)
            .await
            .at_site(ERR_EXPOSE, "Taking calibration frame")?;
        ctx.check_abort()?;

        ctx.acknowledge_with_filename(config.detector.reduction_overhead(), &filename);
        let reduction = hardware
            .reduce_calibration(&filename)
            .await
            .at_site(ERR_REDUCE, "Reducing calibration frame")?;
        tracing::info!(
            "{} frame {}/{} {}: mean {:.0}, peak {:.0}",
            frame_type,
            number,
            candidate.count,
            filename,
            reduction.mean_counts,
            reduction.peak_counts
        );
    }
    Ok(candidate.count)
}
