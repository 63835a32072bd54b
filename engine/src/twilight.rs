//! Twilight Flat Scheduler
//!
//! Sky flats taken while the sky brightness changes quickly. Each frame's
//! exposure is re-derived from the mean counts measured on the previous
//! frame, and candidates the sky can no longer serve are skipped without
//! spending a frame on them. Every candidate is repeated once per configured
//! telescope offset; the ISS offset is returned to (0, 0) on every exit path.

use crate::calibration::{evaluate_candidate, CalibrationReport, CandidateDecision, SkipReason};
use crate::config::{TwilightCalibrationCandidate, TwilightCalibrationConfig};
use crate::context::ExecutionContext;
use crate::error::{CommandError, CommandResult, ResultExt};
use crate::hardware::Hardware;
use crate::persistence::{twilight_calibration_key, CalibrationHistory};
use crate::{Binning, FrameType};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const ERROR_BASE: i32 = 1500;
pub const ERR_WRONG_COMMAND: i32 = ERROR_BASE + 1;
pub const ERR_CONFIG_HEADERS: i32 = ERROR_BASE + 2;
pub const ERR_CONFIGURE: i32 = ERROR_BASE + 3;
pub const ERR_FRAME_TYPE: i32 = ERROR_BASE + 4;
pub const ERR_OFFSET: i32 = ERROR_BASE + 5;
pub const ERR_EXPOSE: i32 = ERROR_BASE + 6;
pub const ERR_REDUCE: i32 = ERROR_BASE + 7;
pub const ERR_PERSIST: i32 = ERROR_BASE + 8;
pub const ERR_ISS_HEADERS: i32 = ERROR_BASE + 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SkyTrend {
    /// Evening twilight
    Darkening,
    /// Morning twilight
    Brightening,
}

/// Sunset side of the day from `sunset_after_hour` onwards, sunrise before it
pub fn sky_trend(local_hour: u32, sunset_after_hour: u32) -> SkyTrend {
    if local_hour >= sunset_after_hour {
        SkyTrend::Darkening
    } else {
        SkyTrend::Brightening
    }
}

/// Counts measured on one reduced sky flat
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SkyMeasurement {
    pub exposure_ms: u64,
    pub binning: Binning,
    pub mean_counts: f64,
}

/// Exposure that would bring the next frame to `best_mean_counts`.
///
/// Flux per pixel scales with binned pixel area, so going from 1x1 to 2x2
/// needs a quarter of the exposure.
pub fn optimal_exposure_ms(last: &SkyMeasurement, next_binning: Binning, best_mean_counts: f64) -> f64 {
    last.exposure_ms as f64 * (best_mean_counts / last.mean_counts)
        * (last.binning.area() / next_binning.area())
}

/// Clamp to `[min_ms, max_ms]`. A non-finite or negative optimum (zero counts
/// measured) means the sky gave nothing, so the longest exposure is used.
pub fn clamp_exposure(optimal_ms: f64, min_ms: u64, max_ms: u64) -> u64 {
    if !optimal_ms.is_finite() || optimal_ms < 0.0 {
        return max_ms;
    }
    (optimal_ms.round() as u64).clamp(min_ms, max_ms)
}

/// Mean counts expected on a frame of `exposure_ms` at `binning`
pub fn predict_counts(last: &SkyMeasurement, binning: Binning, exposure_ms: u64) -> f64 {
    if last.exposure_ms == 0 {
        return last.mean_counts;
    }
    last.mean_counts * (binning.area() / last.binning.area())
        * (exposure_ms as f64 / last.exposure_ms as f64)
}

/// What to do with the next frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FramePlan {
    Run {
        exposure_ms: u64,
        /// `None` for the first frame of the run
        predicted_counts: Option<f64>,
    },
    /// Under-exposed at the longest exposure and only getting darker
    SkipTooDark { predicted_counts: f64 },
    /// Over-exposed at the shortest exposure and only getting brighter
    SkipTooBright { predicted_counts: f64 },
}

impl FramePlan {
    pub fn skip_reason(&self) -> Option<SkipReason> {
        match self {
            FramePlan::Run { .. } => None,
            FramePlan::SkipTooDark { .. } => Some(SkipReason::TooDark),
            FramePlan::SkipTooBright { .. } => Some(SkipReason::TooBright),
        }
    }
}

/// Plan the next frame from the previous measurement, if any.
///
/// A prediction outside the count band is still taken when the sky is moving
/// towards the band; only a pinned exposure with the sky moving away skips.
pub fn plan_frame(
    config: &TwilightCalibrationConfig,
    last: Option<&SkyMeasurement>,
    binning: Binning,
    trend: SkyTrend,
) -> FramePlan {
    let Some(last) = last else {
        return FramePlan::Run {
            exposure_ms: config
                .initial_exposure_ms
                .clamp(config.min_exposure_ms, config.max_exposure_ms),
            predicted_counts: None,
        };
    };

    let optimal = optimal_exposure_ms(last, binning, config.best_mean_counts);
    let exposure_ms = clamp_exposure(optimal, config.min_exposure_ms, config.max_exposure_ms);
    let predicted_counts = predict_counts(last, binning, exposure_ms);

    if predicted_counts < config.min_mean_counts
        && exposure_ms == config.max_exposure_ms
        && trend == SkyTrend::Darkening
    {
        return FramePlan::SkipTooDark { predicted_counts };
    }
    if predicted_counts > config.max_mean_counts
        && exposure_ms == config.min_exposure_ms
        && trend == SkyTrend::Brightening
    {
        return FramePlan::SkipTooBright { predicted_counts };
    }
    FramePlan::Run {
        exposure_ms,
        predicted_counts: Some(predicted_counts),
    }
}

/// Result of running one candidate across every offset
struct CandidateOutcome {
    frames: u32,
    all_in_band: bool,
    /// Set when the sky ran out mid-candidate
    stopped: Option<SkipReason>,
}

/// Run every due twilight flat within `time_budget`.
///
/// `local_hour` picks the sky trend; the caller passes the site's local hour.
pub async fn run_twilight_calibration(
    hardware: &Hardware,
    history: &CalibrationHistory,
    ctx: &ExecutionContext,
    time_budget: Duration,
    local_hour: u32,
) -> CommandResult<CalibrationReport> {
    let config = &hardware.config().twilight_calibration;
    let trend = sky_trend(local_hour, config.sunset_after_hour);
    let mut report = CalibrationReport::default();
    let mut offset_sent = false;

    tracing::info!(
        "Twilight calibration: {} candidates, {} offsets, sky {:?}, budget {:.0}s",
        config.candidates.len(),
        config.offsets.len(),
        trend,
        time_budget.as_secs_f64()
    );

    let result = run_candidates(
        hardware,
        history,
        ctx,
        time_budget,
        trend,
        &mut report,
        &mut offset_sent,
    )
    .await;

    if offset_sent {
        if let Err(e) = hardware.offset_ra_dec(0.0, 0.0).await {
            tracing::warn!("Failed to reset telescope offset after twilight flats: {}", e);
        }
    }

    result?;
    tracing::info!(
        "Twilight calibration finished: {} completed, {} skipped, {} frames",
        report.completed.len(),
        report.skipped.len(),
        report.frames
    );
    Ok(report)
}

async fn run_candidates(
    hardware: &Hardware,
    history: &CalibrationHistory,
    ctx: &ExecutionContext,
    time_budget: Duration,
    trend: SkyTrend,
    report: &mut CalibrationReport,
    offset_sent: &mut bool,
) -> CommandResult<()> {
    let config = &hardware.config().twilight_calibration;
    let readout = hardware.config().detector.readout_overhead();
    let deadline = Utc::now() + chrono::Duration::from_std(time_budget).unwrap_or(chrono::Duration::zero());
    let mut last: Option<SkyMeasurement> = None;

    let candidates = &config.candidates;
    for (index, candidate) in candidates.iter().enumerate() {
        ctx.check_abort()?;

        let key = twilight_calibration_key(candidate);
        let plan = plan_frame(config, last.as_ref(), candidate.binning, trend);
        let planned_ms = match plan {
            FramePlan::Run { exposure_ms, .. } => exposure_ms,
            _ => config.min_exposure_ms,
        };
        let predicted = (Duration::from_millis(planned_ms) + readout) * config.offsets.len() as u32;

        match evaluate_candidate(
            Utc::now(),
            history.last_completed(&key),
            Duration::from_millis(candidate.frequency_ms),
            deadline,
            predicted,
        ) {
            CandidateDecision::Run => {}
            CandidateDecision::DeadlineExceeded => {
                tracing::info!("Twilight calibration deadline reached, stopping");
                report.deadline_reached = true;
                for remaining in &candidates[index..] {
                    report.skip(twilight_calibration_key(remaining), SkipReason::DeadlineExceeded);
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

        if let Some(reason) = plan.skip_reason() {
            tracing::info!("Sky out of range for {}: {:?}", key, plan);
            report.skip(key, reason);
            continue;
        }

        tracing::info!("Running twilight flat {}", key);
        ctx.acknowledge(predicted + hardware.config().detector.reduction_overhead() * config.offsets.len() as u32);
        let outcome = run_twilight_candidate(hardware, ctx, candidate, trend, &mut last, offset_sent).await?;
        report.frames += outcome.frames;

        if let Some(reason) = outcome.stopped {
            report.skip(key, reason);
        } else if !outcome.all_in_band {
            report.skip(key, SkipReason::OutOfBand);
        } else {
            history
                .record_completion(&key, Utc::now())
                .map_err(|e| CommandError::failed(ERR_PERSIST, format!("Saving calibration history: {}", e)))?;
            report.completed.push(key);
        }
    }
    Ok(())
}

async fn run_twilight_candidate(
    hardware: &Hardware,
    ctx: &ExecutionContext,
    candidate: &TwilightCalibrationCandidate,
    trend: SkyTrend,
    last: &mut Option<SkyMeasurement>,
    offset_sent: &mut bool,
) -> CommandResult<CandidateOutcome> {
    let config = &hardware.config().twilight_calibration;
    let detector = &hardware.config().detector;
    let mut outcome = CandidateOutcome {
        frames: 0,
        all_in_band: true,
        stopped: None,
    };

    hardware
        .configure_detector(candidate.binning)
        .await
        .at_site(ERR_CONFIGURE, "Configuring detector for twilight flat")?;
    ctx.check_abort()?;
    hardware
        .push_frame_type(FrameType::SkyFlat)
        .await
        .at_site(ERR_FRAME_TYPE, "Setting sky flat headers")?;

    let repeats = config.offsets.len() as u32;
    ctx.status().begin_exposure_batch(repeats, config.initial_exposure_ms);
    for (number, offset) in (1..).zip(config.offsets.iter()) {
        ctx.check_abort()?;

        let plan = plan_frame(config, last.as_ref(), candidate.binning, trend);
        let exposure_ms = match plan {
            FramePlan::Run { exposure_ms, .. } => exposure_ms,
            _ => {
                tracing::info!("Sky left the usable range after {} frames: {:?}", outcome.frames, plan);
                outcome.stopped = plan.skip_reason();
                break;
            }
        };

        *offset_sent = true;
        hardware
            .offset_ra_dec(offset.ra_arcsec, offset.dec_arcsec)
            .await
            .at_site(ERR_OFFSET, "Offsetting telescope for twilight flat")?;
        ctx.check_abort()?;

        ctx.acknowledge(Duration::from_millis(exposure_ms) + detector.readout_overhead() + detector.reduction_overhead());
        ctx.status().exposure_started(number, Utc::now());
        let filename = hardware
            .expose(exposure_ms, FrameType::SkyFlat)
            .await
            .at_site(ERR_EXPOSE, "Taking twilight flat")?;
        ctx.check_abort()?;

        ctx.acknowledge_with_filename(detector.reduction_overhead(), &filename);
        let reduction = hardware
            .reduce_calibration(&filename)
            .await
            .at_site(ERR_REDUCE, "Reducing twilight flat")?;
        outcome.frames += 1;

        let in_band = reduction.mean_counts >= config.min_mean_counts
            && reduction.mean_counts <= config.max_mean_counts;
        tracing::info!(
            "Twilight flat {}/{} {}: {}ms, mean {:.0}{}",
            number,
            repeats,
            filename,
            exposure_ms,
            reduction.mean_counts,
            if in_band { "" } else { " (outside band)" }
        );
        outcome.all_in_band &= in_band;
        *last = Some(SkyMeasurement {
            exposure_ms,
            binning: candidate.binning,
            mean_counts: reduction.mean_counts,
        });
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OffsetDescriptor;
    use crate::testing::{self, MockInstrument};

    fn measurement(exposure_ms: u64, binning: u32, mean_counts: f64) -> SkyMeasurement {
        SkyMeasurement {
            exposure_ms,
            binning: Binning::square(binning),
            mean_counts,
        }
    }

    fn twilight_config(candidates: Vec<TwilightCalibrationCandidate>) -> crate::InstrumentConfig {
        let mut config = testing::fast_config();
        config.twilight_calibration.candidates = candidates;
        config.twilight_calibration.offsets = vec![
            OffsetDescriptor { ra_arcsec: 0.0, dec_arcsec: 0.0 },
            OffsetDescriptor { ra_arcsec: 20.0, dec_arcsec: 20.0 },
        ];
        config
    }

    fn flat(binning: u32) -> TwilightCalibrationCandidate {
        TwilightCalibrationCandidate {
            binning: Binning::square(binning),
            frequency_ms: 0,
        }
    }

    #[test]
    fn test_sky_trend_from_local_hour() {
        assert_eq!(sky_trend(18, 12), SkyTrend::Darkening);
        assert_eq!(sky_trend(12, 12), SkyTrend::Darkening);
        assert_eq!(sky_trend(5, 12), SkyTrend::Brightening);
    }

    #[test]
    fn test_optimal_exposure_scales_with_counts_and_binning() {
        let last = measurement(2_000, 1, 10_000.0);
        assert_eq!(optimal_exposure_ms(&last, Binning::square(1), 25_000.0), 5_000.0);
        assert_eq!(optimal_exposure_ms(&last, Binning::square(2), 25_000.0), 1_250.0);
    }

    #[test]
    fn test_exposure_is_clamped() {
        assert_eq!(clamp_exposure(45_000.0, 1_000, 30_000), 30_000);
        assert_eq!(clamp_exposure(200.0, 1_000, 30_000), 1_000);
        assert_eq!(clamp_exposure(12_345.4, 1_000, 30_000), 12_345);
        assert_eq!(clamp_exposure(f64::INFINITY, 1_000, 30_000), 30_000);
        assert_eq!(clamp_exposure(f64::NAN, 1_000, 30_000), 30_000);
    }

    #[test]
    fn test_predicted_counts() {
        let last = measurement(1_000, 1, 10_000.0);
        assert_eq!(predict_counts(&last, Binning::square(2), 2_000), 80_000.0);
    }

    #[test]
    fn test_first_frame_uses_initial_exposure() {
        let config = TwilightCalibrationConfig::default();
        let plan = plan_frame(&config, None, Binning::square(1), SkyTrend::Darkening);
        assert_eq!(
            plan,
            FramePlan::Run {
                exposure_ms: 1_000,
                predicted_counts: None
            }
        );
    }

    #[test]
    fn test_too_dark_only_when_darkening() {
        let config = TwilightCalibrationConfig::default();
        let last = measurement(30_000, 1, 1_000.0);

        let evening = plan_frame(&config, Some(&last), Binning::square(1), SkyTrend::Darkening);
        assert!(matches!(evening, FramePlan::SkipTooDark { .. }));

        let morning = plan_frame(&config, Some(&last), Binning::square(1), SkyTrend::Brightening);
        assert!(matches!(morning, FramePlan::Run { exposure_ms: 30_000, .. }));
    }

    #[test]
    fn test_too_bright_only_when_brightening() {
        let config = TwilightCalibrationConfig::default();
        let last = measurement(1_000, 1, 60_000.0);

        let morning = plan_frame(&config, Some(&last), Binning::square(1), SkyTrend::Brightening);
        assert!(matches!(morning, FramePlan::SkipTooBright { .. }));

        let evening = plan_frame(&config, Some(&last), Binning::square(1), SkyTrend::Darkening);
        assert!(matches!(evening, FramePlan::Run { exposure_ms: 1_000, .. }));
    }

    #[tokio::test]
    async fn test_repeats_each_offset_and_resets_pointing() {
        let mock = MockInstrument::new();
        let hardware = mock.hardware(twilight_config(vec![flat(1), flat(2)]));
        let history = CalibrationHistory::in_memory();
        let (ctx, _status, _rx) = testing::context();

        let report = run_twilight_calibration(&hardware, &history, &ctx, Duration::from_secs(3600), 18)
            .await
            .unwrap();

        assert_eq!(report.frames, 4);
        assert_eq!(report.completed, vec!["twilight.flat.1x1", "twilight.flat.2x2"]);
        assert!(history.last_completed("twilight.flat.2x2").is_some());

        let exposures: Vec<u64> = mock.multruns().iter().map(|(ms, _, _)| *ms).collect();
        // 1000ms at 20000 counts -> 1250ms at 1x1, then a quarter of that at 2x2
        assert_eq!(exposures[..2], [1_000, 1_250]);
        assert_eq!(exposures[2], 1_000);
        assert!(mock.multruns().iter().all(|(_, _, t)| *t == FrameType::SkyFlat));

        assert_eq!(
            mock.offsets_ra_dec(),
            vec![(0.0, 0.0), (20.0, 20.0), (0.0, 0.0), (20.0, 20.0), (0.0, 0.0)]
        );
    }

    #[tokio::test]
    async fn test_out_of_band_frame_is_not_persisted() {
        let mock = MockInstrument::new();
        let hardware = mock.hardware(twilight_config(vec![flat(1)]));
        let history = CalibrationHistory::in_memory();
        let (ctx, _status, _rx) = testing::context();
        mock.push_calibration_counts(&[50_000.0]);

        let report = run_twilight_calibration(&hardware, &history, &ctx, Duration::from_secs(3600), 18)
            .await
            .unwrap();

        assert_eq!(report.frames, 2);
        assert!(report.completed.is_empty());
        assert_eq!(report.skipped[0].reason, SkipReason::OutOfBand);
        assert!(history.last_completed("twilight.flat.1x1").is_none());
    }

    #[tokio::test]
    async fn test_sky_too_dark_skips_remaining_candidate() {
        let mock = MockInstrument::new();
        let hardware = mock.hardware(twilight_config(vec![flat(1), flat(1)]));
        let history = CalibrationHistory::in_memory();
        let (ctx, _status, _rx) = testing::context();
        // Nearly empty first frame: the repeat pins at max and is still too dark
        mock.push_calibration_counts(&[10.0]);

        let report = run_twilight_calibration(&hardware, &history, &ctx, Duration::from_secs(3600), 19)
            .await
            .unwrap();

        assert!(report.completed.is_empty());
        assert_eq!(mock.multruns().len(), 1);
        assert_eq!(report.skipped.len(), 2);
        assert!(report.skipped.iter().all(|s| s.reason == SkipReason::TooDark));
    }

    #[tokio::test]
    async fn test_abort_still_resets_offset() {
        let mock = MockInstrument::new();
        let mut config = twilight_config(vec![flat(1)]);
        config.twilight_calibration.offsets = vec![OffsetDescriptor {
            ra_arcsec: 20.0,
            dec_arcsec: -10.0,
        }];
        let hardware = mock.hardware(config);
        let history = CalibrationHistory::in_memory();
        let (ctx, status, _rx) = testing::context();
        mock.on_multrun(move |_| status.request_abort());

        let err = run_twilight_calibration(&hardware, &history, &ctx, Duration::from_secs(3600), 18)
            .await
            .unwrap_err();

        assert!(err.is_abort());
        assert_eq!(mock.multruns().len(), 1);
        assert_eq!(mock.offsets_ra_dec(), vec![(20.0, -10.0), (0.0, 0.0)]);
        assert!(history.last_completed("twilight.flat.1x1").is_none());
    }

    #[tokio::test]
    async fn test_recent_flat_is_skipped_without_touching_telescope() {
        let mock = MockInstrument::new();
        let mut candidate = flat(1);
        candidate.frequency_ms = 86_400_000;
        let hardware = mock.hardware(twilight_config(vec![candidate.clone()]));
        let history = CalibrationHistory::in_memory();
        history
            .record_completion(&twilight_calibration_key(&candidate), Utc::now())
            .unwrap();
        let (ctx, _status, _rx) = testing::context();

        let report = run_twilight_calibration(&hardware, &history, &ctx, Duration::from_secs(3600), 18)
            .await
            .unwrap();

        assert_eq!(report.skipped[0].reason, SkipReason::TooSoon);
        assert!(mock.scheduler_requests().is_empty());
    }
}
