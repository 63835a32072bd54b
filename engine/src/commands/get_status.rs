//! GET_STATUS: snapshot of the instrument, safe to run beside any command

use crate::command::{Command, CommandHandler, CommandKind, CommandOutput, StatusReport};
use crate::context::ExecutionContext;
use crate::error::CommandResult;
use crate::hardware::SharedHardware;
use crate::status::SharedStatus;
use async_trait::async_trait;
use std::time::Duration;

const STATUS_ACKNOWLEDGE: Duration = Duration::from_secs(5);

pub struct GetStatusHandler {
    hardware: SharedHardware,
    status: SharedStatus,
}

impl GetStatusHandler {
    pub fn new(hardware: SharedHardware, status: SharedStatus) -> Self {
        Self { hardware, status }
    }
}

#[async_trait]
impl CommandHandler for GetStatusHandler {
    fn estimate_acknowledge_time(&self, _command: &Command) -> Duration {
        STATUS_ACKNOWLEDGE
    }

    async fn execute(&self, command: &Command, _ctx: &ExecutionContext) -> CommandResult<CommandOutput> {
        let include_detector = matches!(
            command.kind,
            CommandKind::GetStatus {
                include_detector: true
            }
        );

        let detector = if include_detector {
            match self.hardware.detector_status().await {
                Ok(status) => Some(status),
                Err(e) => {
                    tracing::warn!("Detector status unavailable: {}", e);
                    None
                }
            }
        } else {
            None
        };

        Ok(CommandOutput::Status(StatusReport {
            status: self.status.snapshot(),
            detector,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{self, MockInstrument};

    #[tokio::test]
    async fn test_status_reports_current_command_and_detector() {
        let mock = MockInstrument::new();
        let services = testing::services(&mock, testing::fast_config());
        services.status.begin_command("42", "MULTRUN");
        services.status.set_configuration(3, "blue");
        let handler = GetStatusHandler::new(services.hardware.clone(), services.status.clone());
        let (ctx, _rx) = testing::context_for(&services.status);

        let output = handler
            .execute(
                &Command::new("s", CommandKind::GetStatus { include_detector: true }),
                &ctx,
            )
            .await
            .unwrap();

        let CommandOutput::Status(report) = output else {
            panic!("expected a status report");
        };
        let current = report.status.current_command.unwrap();
        assert_eq!(current.id, "42");
        assert_eq!(report.status.configuration.id, 3);
        assert_eq!(report.detector.unwrap().temperature_c, -100.0);
    }

    #[tokio::test]
    async fn test_detector_is_only_queried_on_request() {
        let mock = MockInstrument::new();
        let services = testing::services(&mock, testing::fast_config());
        let handler = GetStatusHandler::new(services.hardware.clone(), services.status.clone());
        let (ctx, _rx) = testing::context_for(&services.status);

        let output = handler
            .execute(
                &Command::new("s", CommandKind::GetStatus { include_detector: false }),
                &ctx,
            )
            .await
            .unwrap();

        assert!(matches!(output, CommandOutput::Status(StatusReport { detector: None, .. })));
        assert!(mock.detector_requests().is_empty());
    }
}
