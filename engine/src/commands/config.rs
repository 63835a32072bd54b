//! CONFIG: slit, grism, rotation and binning

use super::wrong_command;
use crate::command::{Command, CommandHandler, CommandKind, CommandOutput};
use crate::context::ExecutionContext;
use crate::error::{CommandError, CommandResult, ResultExt};
use crate::hardware::SharedHardware;
use crate::persistence::ConfigIdCounter;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

pub const ERROR_BASE: i32 = 1000;
pub const ERR_WRONG_COMMAND: i32 = ERROR_BASE + 1;
pub const ERR_SLIT: i32 = ERROR_BASE + 2;
pub const ERR_GRISM: i32 = ERROR_BASE + 3;
pub const ERR_ROTATION: i32 = ERROR_BASE + 4;
pub const ERR_BINNING: i32 = ERROR_BASE + 5;
pub const ERR_FOCUS: i32 = ERROR_BASE + 6;
pub const ERR_CONFIG_ID: i32 = ERROR_BASE + 7;

pub struct ConfigHandler {
    hardware: SharedHardware,
    config_ids: Arc<ConfigIdCounter>,
}

impl ConfigHandler {
    pub fn new(hardware: SharedHardware, config_ids: Arc<ConfigIdCounter>) -> Self {
        Self {
            hardware,
            config_ids,
        }
    }
}

#[async_trait]
impl CommandHandler for ConfigHandler {
    /// Worst case: every stage runs to its move timeout
    fn estimate_acknowledge_time(&self, _command: &Command) -> Duration {
        let mechanisms = &self.hardware.config().mechanisms;
        [
            &mechanisms.slit_actuator,
            &mechanisms.grism_actuator,
            &mechanisms.rotation_actuator,
        ]
        .iter()
        .map(|actuator| mechanisms.move_timeout(actuator))
        .sum()
    }

    async fn execute(&self, command: &Command, ctx: &ExecutionContext) -> CommandResult<CommandOutput> {
        let CommandKind::Config {
            name,
            binning,
            slit,
            grism,
            rotation,
        } = &command.kind
        else {
            return Err(wrong_command(ERR_WRONG_COMMAND, "CONFIG", command));
        };
        let config = self.hardware.config();
        let mechanisms = &config.mechanisms;

        tracing::info!(
            "Configuration {}: slit {}, grism {}, rotation {}, binning {}",
            name,
            slit,
            grism,
            rotation,
            binning
        );

        let stages = [
            (&mechanisms.slit_actuator, slit, ERR_SLIT, "Moving slit"),
            (&mechanisms.grism_actuator, grism, ERR_GRISM, "Moving grism"),
            (&mechanisms.rotation_actuator, rotation, ERR_ROTATION, "Rotating grism"),
        ];
        for (actuator, position, code, context) in stages {
            ctx.check_abort()?;
            ctx.acknowledge(mechanisms.move_timeout(actuator));
            self.hardware
                .move_configured(actuator, position)
                .await
                .at_site(code, context)?;
        }

        ctx.check_abort()?;
        self.hardware
            .configure_detector(*binning)
            .await
            .at_site(ERR_BINNING, "Setting detector binning")?;
        ctx.check_abort()?;
        self.hardware
            .focus_offset(config.focus_offset_mm)
            .await
            .at_site(ERR_FOCUS, "Applying focus offset")?;

        let config_id = self
            .config_ids
            .next()
            .map_err(|e| CommandError::failed(ERR_CONFIG_ID, format!("Saving configuration id: {}", e)))?;
        ctx.status().set_configuration(config_id, name);
        tracing::info!("Configuration {} applied with id {}", name, config_id);

        Ok(CommandOutput::Config { config_id })
    }
}
