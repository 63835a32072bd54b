//! MULTRUN: science exposures through the current configuration

use super::wrong_command;
use crate::command::{Command, CommandHandler, CommandKind, CommandOutput, FrameReport};
use crate::context::ExecutionContext;
use crate::error::{CommandError, CommandResult, ResultExt};
use crate::hardware::SharedHardware;
use crate::FrameType;
use async_trait::async_trait;
use chrono::Utc;
use std::time::Duration;

pub const ERROR_BASE: i32 = 1100;
pub const ERR_WRONG_COMMAND: i32 = ERROR_BASE + 1;
pub const ERR_BAD_COUNT: i32 = ERROR_BASE + 2;
pub const ERR_CONFIG_HEADERS: i32 = ERROR_BASE + 3;
pub const ERR_FRAME_TYPE: i32 = ERROR_BASE + 4;
pub const ERR_EXPOSE: i32 = ERROR_BASE + 5;
pub const ERR_REDUCE: i32 = ERROR_BASE + 6;
pub const ERR_ISS_HEADERS: i32 = ERROR_BASE + 7;

pub struct MultrunHandler {
    hardware: SharedHardware,
}

impl MultrunHandler {
    pub fn new(hardware: SharedHardware) -> Self {
        Self { hardware }
    }

    fn per_frame(&self, exposure_ms: u64) -> Duration {
        let detector = &self.hardware.config().detector;
        Duration::from_millis(exposure_ms) + detector.readout_overhead() + detector.reduction_overhead()
    }
}

#[async_trait]
impl CommandHandler for MultrunHandler {
    fn estimate_acknowledge_time(&self, command: &Command) -> Duration {
        match &command.kind {
            CommandKind::Multrun { exposure_ms, count } => self.per_frame(*exposure_ms) * (*count).max(1),
            _ => self.hardware.config().detector.default_acknowledge(),
        }
    }

    async fn execute(&self, command: &Command, ctx: &ExecutionContext) -> CommandResult<CommandOutput> {
        let CommandKind::Multrun { exposure_ms, count } = command.kind else {
            return Err(wrong_command(ERR_WRONG_COMMAND, "MULTRUN", command));
        };
        if count == 0 {
            return Err(CommandError::failed(ERR_BAD_COUNT, "MULTRUN needs at least one frame"));
        }
        let hardware = &self.hardware;
        let detector = &hardware.config().detector;

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
            .push_frame_type(FrameType::Exposure)
            .await
            .at_site(ERR_FRAME_TYPE, "Setting frame type")?;

        let mut report = FrameReport::default();
        ctx.status().begin_exposure_batch(count, exposure_ms);
        for number in 1..=count {
            ctx.check_abort()?;
            ctx.acknowledge(self.per_frame(exposure_ms) - detector.reduction_overhead());
            ctx.status().exposure_started(number, Utc::now());
            let filename = hardware
                .expose(exposure_ms, FrameType::Exposure)
                .await
                .at_site(ERR_EXPOSE, "Taking exposure")?;
            ctx.check_abort()?;

            ctx.acknowledge_with_filename(detector.reduction_overhead(), &filename);
            let reduction = hardware
                .reduce(&filename, false)
                .await
                .at_site(ERR_REDUCE, "Reducing exposure")?;
            tracing::info!(
                "Frame {}/{} {}: mean {:.0}, peak {:.0}, seeing {:.2}\"{}",
                number,
                count,
                filename,
                reduction.mean_counts,
                reduction.peak_counts,
                reduction.seeing_arcsec,
                if reduction.saturated { ", saturated" } else { "" }
            );

            report.mean_counts = reduction.mean_counts;
            report.peak_counts = reduction.peak_counts;
            report.seeing_arcsec = Some(reduction.seeing_arcsec);
            report.saturated |= reduction.saturated;
            report.filenames.push(filename);
        }
        Ok(CommandOutput::Frames(report))
    }
}
