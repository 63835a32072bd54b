//! TWILIGHT_CALIBRATE: sky flats while the sky brightness changes

use super::wrong_command;
use crate::command::{Command, CommandHandler, CommandKind, CommandOutput};
use crate::context::ExecutionContext;
use crate::error::{CommandResult, ResultExt};
use crate::hardware::SharedHardware;
use crate::persistence::CalibrationHistory;
use crate::twilight::{run_twilight_calibration, ERR_CONFIG_HEADERS, ERR_ISS_HEADERS, ERR_WRONG_COMMAND};
use async_trait::async_trait;
use chrono::Timelike;
use std::sync::Arc;
use std::time::Duration;

pub struct TwilightCalibrateHandler {
    hardware: SharedHardware,
    history: Arc<CalibrationHistory>,
}

impl TwilightCalibrateHandler {
    pub fn new(hardware: SharedHardware, history: Arc<CalibrationHistory>) -> Self {
        Self { hardware, history }
    }
}

#[async_trait]
impl CommandHandler for TwilightCalibrateHandler {
    fn estimate_acknowledge_time(&self, _command: &Command) -> Duration {
        self.hardware.config().detector.default_acknowledge()
    }

    async fn execute(&self, command: &Command, ctx: &ExecutionContext) -> CommandResult<CommandOutput> {
        let CommandKind::TwilightCalibrate { time_budget_ms } = command.kind else {
            return Err(wrong_command(ERR_WRONG_COMMAND, "TWILIGHT_CALIBRATE", command));
        };

        self.hardware
            .load_headers_from_config()
            .await
            .at_site(ERR_CONFIG_HEADERS, "Loading configured FITS headers")?;
        ctx.check_abort()?;
        self.hardware
            .load_headers_from_scheduler()
            .await
            .at_site(ERR_ISS_HEADERS, "Loading ISS FITS headers")?;
        ctx.check_abort()?;

        let local_hour = chrono::Local::now().hour();
        let report = run_twilight_calibration(
            &self.hardware,
            &self.history,
            ctx,
            Duration::from_millis(time_budget_ms),
            local_hour,
        )
        .await?;
        Ok(CommandOutput::Calibration(report))
    }
}
