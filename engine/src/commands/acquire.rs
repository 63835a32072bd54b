//! ACQUIRE: put the target on the slit

use super::wrong_command;
use crate::acquisition::{
    acquire, AcquisitionRequest, ERR_CONFIGURE, ERR_CONFIG_HEADERS, ERR_FRAME_TYPE, ERR_ISS_HEADERS,
    ERR_NO_SKY_TARGET, ERR_WRONG_COMMAND,
};
use crate::astro::SkyPosition;
use crate::command::{AcquireParams, Command, CommandHandler, CommandKind, CommandOutput};
use crate::config::InstrumentConfig;
use crate::context::ExecutionContext;
use crate::error::{CommandError, CommandResult, ResultExt};
use crate::hardware::SharedHardware;
use crate::FrameType;
use async_trait::async_trait;
use std::time::Duration;

pub struct AcquireHandler {
    hardware: SharedHardware,
}

impl AcquireHandler {
    pub fn new(hardware: SharedHardware) -> Self {
        Self { hardware }
    }
}

/// Fill in what the command leaves to configuration
pub fn build_request(params: &AcquireParams, config: &InstrumentConfig) -> CommandResult<AcquisitionRequest> {
    let sky_target = match (params.ra, params.dec) {
        (Some(ra), Some(dec)) => Some(SkyPosition::new(ra, dec)),
        (None, None) => None,
        _ => {
            return Err(CommandError::failed(
                ERR_NO_SKY_TARGET,
                "RA and Dec must be given together",
            ))
        }
    };
    let acquisition = &config.acquisition;
    Ok(AcquisitionRequest {
        mode: params.mode,
        target_pixel: params.target_pixel,
        sky_target,
        motion: params.motion,
        threshold_arcsec: params
            .threshold_arcsec
            .unwrap_or(acquisition.default_threshold_arcsec),
        exposure_ms: params.exposure_ms,
        binning: acquisition.binning,
        maximum_offset_count: acquisition.maximum_offset_count,
        overhead: acquisition.overhead(),
    })
}

#[async_trait]
impl CommandHandler for AcquireHandler {
    fn estimate_acknowledge_time(&self, command: &Command) -> Duration {
        let config = self.hardware.config();
        match &command.kind {
            CommandKind::Acquire(params) => {
                Duration::from_millis(params.exposure_ms) + config.acquisition.overhead()
            }
            _ => config.detector.default_acknowledge(),
        }
    }

    async fn execute(&self, command: &Command, ctx: &ExecutionContext) -> CommandResult<CommandOutput> {
        let CommandKind::Acquire(params) = &command.kind else {
            return Err(wrong_command(ERR_WRONG_COMMAND, "ACQUIRE", command));
        };
        let request = build_request(params, self.hardware.config())?;
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
            .push_frame_type(FrameType::Acquire)
            .await
            .at_site(ERR_FRAME_TYPE, "Setting acquisition frame type")?;
        ctx.check_abort()?;
        hardware
            .configure_detector(request.binning)
            .await
            .at_site(ERR_CONFIGURE, "Setting acquisition binning")?;

        let report = acquire(hardware, ctx, &request).await?;
        Ok(CommandOutput::Acquisition(report))
    }
}
