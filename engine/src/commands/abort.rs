//! ABORT: stop the running command at its next checkpoint

use crate::command::{Command, CommandHandler, CommandOutput};
use crate::context::ExecutionContext;
use crate::error::CommandResult;
use crate::hardware::SharedHardware;
use crate::status::SharedStatus;
use async_trait::async_trait;
use std::time::Duration;

const ABORT_ACKNOWLEDGE: Duration = Duration::from_secs(10);

pub struct AbortHandler {
    hardware: SharedHardware,
    status: SharedStatus,
}

impl AbortHandler {
    pub fn new(hardware: SharedHardware, status: SharedStatus) -> Self {
        Self { hardware, status }
    }
}

#[async_trait]
impl CommandHandler for AbortHandler {
    fn estimate_acknowledge_time(&self, _command: &Command) -> Duration {
        ABORT_ACKNOWLEDGE
    }

    /// Raises the abort flag, then asks the detector to cut any exposure in
    /// progress short. The running command still cleans up on its own path.
    async fn execute(&self, _command: &Command, _ctx: &ExecutionContext) -> CommandResult<CommandOutput> {
        match self.status.current_command() {
            Some(current) => tracing::info!("Aborting {} ({})", current.name, current.id),
            None => tracing::info!("Abort requested with no command running"),
        }
        self.status.request_abort();

        if let Err(e) = self.hardware.abort_exposure().await {
            tracing::warn!("Detector abort failed: {}", e);
        }
        Ok(CommandOutput::None)
    }
}
