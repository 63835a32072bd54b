//! ARC: wavelength calibration frame with the arc lamp through the
//! calibration mirror

use super::wrong_command;
use crate::command::{Command, CommandHandler, CommandKind, CommandOutput, FrameReport};
use crate::context::ExecutionContext;
use crate::error::{CommandError, CommandResult, ResultExt};
use crate::hardware::{release_calibration_hardware, SharedHardware};
use crate::FrameType;
use async_trait::async_trait;
use chrono::Utc;
use std::time::Duration;

pub const ERROR_BASE: i32 = 1200;
pub const ERR_WRONG_COMMAND: i32 = ERROR_BASE + 1;
pub const ERR_CONFIG_HEADERS: i32 = ERROR_BASE + 2;
pub const ERR_FRAME_TYPE: i32 = ERROR_BASE + 3;
pub const ERR_MIRROR: i32 = ERROR_BASE + 4;
pub const ERR_LAMP: i32 = ERROR_BASE + 5;
pub const ERR_EXPOSE: i32 = ERROR_BASE + 6;
pub const ERR_REDUCE: i32 = ERROR_BASE + 7;
pub const ERR_ISS_HEADERS: i32 = ERROR_BASE + 8;

pub struct ArcHandler {
    hardware: SharedHardware,
}

impl ArcHandler {
    pub fn new(hardware: SharedHardware) -> Self {
        Self { hardware }
    }

    fn lamp_for(&self, requested: &Option<String>) -> String {
        requested
            .clone()
            .unwrap_or_else(|| self.hardware.config().lamps.arc_lamp.clone())
    }

    /// Lamp on, warm up, expose. The lamp and mirror are released by the caller.
    async fn expose_with_lamp(
        &self,
        ctx: &ExecutionContext,
        lamp: &str,
        exposure_ms: u64,
    ) -> CommandResult<String> {
        let config = self.hardware.config();
        let warmup = config.lamps.warmup(lamp);
        ctx.acknowledge(warmup + Duration::from_millis(exposure_ms) + config.detector.readout_overhead());
        ctx.sleep(warmup).await?;

        ctx.status().begin_exposure_batch(1, exposure_ms);
        ctx.status().exposure_started(1, Utc::now());
        let filename = self
            .hardware
            .expose(exposure_ms, FrameType::Arc)
            .await
            .at_site(ERR_EXPOSE, "Taking arc frame")?;
        ctx.check_abort()?;
        Ok(filename)
    }
}

#[async_trait]
impl CommandHandler for ArcHandler {
    fn estimate_acknowledge_time(&self, command: &Command) -> Duration {
        let config = self.hardware.config();
        let mirror_move = config.mechanisms.move_timeout(&config.mechanisms.mirror_actuator);
        match &command.kind {
            CommandKind::Arc { exposure_ms, lamp } => {
                mirror_move
                    + config.lamps.warmup(&self.lamp_for(lamp))
                    + Duration::from_millis(*exposure_ms)
                    + config.detector.readout_overhead()
            }
            _ => config.detector.default_acknowledge(),
        }
    }

    async fn execute(&self, command: &Command, ctx: &ExecutionContext) -> CommandResult<CommandOutput> {
        let CommandKind::Arc { exposure_ms, lamp } = &command.kind else {
            return Err(wrong_command(ERR_WRONG_COMMAND, "ARC", command));
        };
        let exposure_ms = *exposure_ms;
        let lamp = self.lamp_for(lamp);
        let hardware = &self.hardware;

        hardware
            .load_headers_from_config()
            .await
            .at_site(ERR_CONFIG_HEADERS, "Loading configured FITS headers")?;
        ctx.check_abort()?;
        hardware
            .load_headers_from_scheduler()
            .await
            .at_site(ERR_ISS_HEADERS, "Loading ISS FITS headers")?;
        ctx.check_abort()?;
        hardware
            .push_frame_type(FrameType::Arc)
            .await
            .at_site(ERR_FRAME_TYPE, "Setting arc frame headers")?;
        ctx.check_abort()?;

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

        let exposed = self.expose_with_lamp(ctx, &lamp, exposure_ms).await;
        release_calibration_hardware(Some(lamp_guard), Some(mirror)).await;
        let filename = exposed?;

        ctx.acknowledge_with_filename(hardware.config().detector.reduction_overhead(), &filename);
        let reduction = hardware
            .reduce_calibration(&filename)
            .await
            .at_site(ERR_REDUCE, "Reducing arc frame")?;
        tracing::info!(
            "Arc {} with lamp {}: mean {:.0}, peak {:.0}",
            filename,
            lamp,
            reduction.mean_counts,
            reduction.peak_counts
        );

        Ok(CommandOutput::Frames(FrameReport {
            filenames: vec![filename],
            mean_counts: reduction.mean_counts,
            peak_counts: reduction.peak_counts,
            seeing_arcsec: None,
            saturated: false,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fits::HeaderValue;
    use crate::testing::{self, MockInstrument};

    fn arc(lamp: Option<&str>) -> Command {
        Command::new(
            "a1",
            CommandKind::Arc {
                exposure_ms: 500,
                lamp: lamp.map(str::to_string),
            },
        )
    }

    #[tokio::test]
    async fn test_arc_cycles_lamp_and_mirror() {
        let mock = MockInstrument::new();
        mock.set_scheduler_headers(vec![("OBJECT".into(), Some(HeaderValue::from("M31")))]);
        let handler = ArcHandler::new(mock.hardware(testing::fast_config()));
        let (ctx, _status, _rx) = testing::context();

        let output = handler.execute(&arc(None), &ctx).await.unwrap();

        let CommandOutput::Frames(report) = output else {
            panic!("expected a frame report");
        };
        assert_eq!(report.filenames.len(), 1);
        assert_eq!(mock.multruns(), vec![(500, 1, FrameType::Arc)]);
        assert_eq!(mock.lamp_on_count("Xe"), 1);
        assert_eq!(mock.lamp_off_count("Xe"), 1);
        assert_eq!(mock.position("calibration_mirror").as_deref(), Some("out"));
        assert!(mock
            .pushed_headers()
            .iter()
            .any(|c| c.keyword == "OBJECT" && c.value == HeaderValue::from("M31-ARC")));
    }

    #[tokio::test]
    async fn test_exposure_failure_still_turns_lamp_off() {
        let mock = MockInstrument::new();
        mock.fail_next_multrun(9, "shutter stuck");
        let handler = ArcHandler::new(mock.hardware(testing::fast_config()));
        let (ctx, _status, _rx) = testing::context();

        let err = handler.execute(&arc(Some("Ne")), &ctx).await.unwrap_err();

        assert_eq!(err.code(), ERR_EXPOSE);
        assert_eq!(err.device_return_code(), Some(9));
        assert_eq!(mock.lamp_on_count("Ne"), 1);
        assert_eq!(mock.lamp_off_count("Ne"), 1);
        assert_eq!(mock.position("calibration_mirror").as_deref(), Some("out"));
        assert!(mock.pipeline_requests().is_empty());
    }

    #[tokio::test]
    async fn test_abort_during_exposure_turns_lamp_off_once() {
        let mock = MockInstrument::new();
        let handler = ArcHandler::new(mock.hardware(testing::fast_config()));
        let (ctx, status, _rx) = testing::context();
        mock.on_multrun(move |_| status.request_abort());

        let err = handler.execute(&arc(None), &ctx).await.unwrap_err();

        assert!(err.is_abort());
        assert_eq!(mock.lamp_off_count("Xe"), 1);
        assert!(!mock.lamp_is_on("Xe"));
    }

    #[tokio::test]
    async fn test_mirror_failure_leaves_lamp_alone() {
        let mock = MockInstrument::new();
        mock.fail_mechanism_move("calibration_mirror", 4, "limit switch");
        let handler = ArcHandler::new(mock.hardware(testing::fast_config()));
        let (ctx, _status, _rx) = testing::context();

        let err = handler.execute(&arc(None), &ctx).await.unwrap_err();

        assert_eq!(err.code(), ERR_MIRROR);
        assert_eq!(mock.lamp_on_count("Xe"), 0);
        assert!(mock.multruns().is_empty());
    }

    #[tokio::test]
    async fn test_abort_during_mirror_move_never_lights_lamp() {
        let mock = MockInstrument::new();
        let handler = ArcHandler::new(mock.hardware(testing::fast_config()));
        let (ctx, status, _rx) = testing::context();
        mock.on_move(move |actuator, position| {
            if actuator == "calibration_mirror" && position == "in" {
                status.request_abort();
            }
        });

        let err = handler.execute(&arc(None), &ctx).await.unwrap_err();

        assert!(err.is_abort());
        assert_eq!(mock.lamp_on_count("Xe"), 0);
        assert_eq!(mock.position("calibration_mirror").as_deref(), Some("out"));
        assert!(mock.multruns().is_empty());
    }

    #[tokio::test]
    async fn test_iss_header_failure_has_its_own_code() {
        let mock = MockInstrument::new();
        mock.set_scheduler_headers(vec![("AIRMASS".into(), None)]);
        let handler = ArcHandler::new(mock.hardware(testing::fast_config()));
        let (ctx, _status, _rx) = testing::context();

        let err = handler.execute(&arc(None), &ctx).await.unwrap_err();
        assert_eq!(err.code(), ERR_ISS_HEADERS);
        assert_ne!(ERR_ISS_HEADERS, ERR_CONFIG_HEADERS);
        assert_eq!(mock.lamp_on_count("Xe"), 0);
    }
}
