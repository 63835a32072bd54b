//! DAY_CALIBRATE: biases, darks and lamp flats within a time budget

use super::wrong_command;
use crate::calibration::{run_day_calibration, ERR_CONFIG_HEADERS, ERR_WRONG_COMMAND};
use crate::command::{Command, CommandHandler, CommandKind, CommandOutput};
use crate::context::ExecutionContext;
use crate::error::{CommandResult, ResultExt};
use crate::hardware::SharedHardware;
use crate::persistence::CalibrationHistory;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

pub struct DayCalibrateHandler {
    hardware: SharedHardware,
    history: Arc<CalibrationHistory>,
}

impl DayCalibrateHandler {
    pub fn new(hardware: SharedHardware, history: Arc<CalibrationHistory>) -> Self {
        Self { hardware, history }
    }
}

#[async_trait]
impl CommandHandler for DayCalibrateHandler {
    /// First ACK follows as soon as a candidate is chosen
    fn estimate_acknowledge_time(&self, _command: &Command) -> Duration {
        self.hardware.config().detector.default_acknowledge()
    }

    async fn execute(&self, command: &Command, ctx: &ExecutionContext) -> CommandResult<CommandOutput> {
        let CommandKind::DayCalibrate { time_budget_ms } = command.kind else {
            return Err(wrong_command(ERR_WRONG_COMMAND, "DAY_CALIBRATE", command));
        };

        self.hardware
            .load_headers_from_config()
            .await
            .at_site(ERR_CONFIG_HEADERS, "Loading configured FITS headers")?;
        ctx.check_abort()?;

        let report = run_day_calibration(
            &self.hardware,
            &self.history,
            ctx,
            Duration::from_millis(time_budget_ms),
        )
        .await?;
        Ok(CommandOutput::Calibration(report))
    }
}
