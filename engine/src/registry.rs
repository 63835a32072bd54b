//! Command registration table
//!
//! Maps each command type to the constructor of its handler. Built once at
//! startup and never mutated; handlers are constructed per command with the
//! capabilities they need taken from [`Services`].

use crate::command::{CommandHandler, CommandType};
use crate::commands::{
    abort::AbortHandler, acquire::AcquireHandler, arc::ArcHandler, config::ConfigHandler,
    day_calibrate::DayCalibrateHandler, get_status::GetStatusHandler, multrun::MultrunHandler,
    twilight_calibrate::TwilightCalibrateHandler,
};
use crate::hardware::SharedHardware;
use crate::persistence::{CalibrationHistory, ConfigIdCounter};
use crate::status::SharedStatus;
use std::collections::HashMap;
use std::sync::Arc;

/// Long-lived capabilities a handler may be given
#[derive(Clone)]
pub struct Services {
    pub hardware: SharedHardware,
    pub history: Arc<CalibrationHistory>,
    pub config_ids: Arc<ConfigIdCounter>,
    pub status: SharedStatus,
}

pub type HandlerConstructor = fn(&Services) -> Box<dyn CommandHandler>;

pub struct Registry {
    constructors: HashMap<CommandType, HandlerConstructor>,
}

impl Registry {
    /// Every command the instrument understands
    pub fn standard() -> Self {
        let mut constructors: HashMap<CommandType, HandlerConstructor> = HashMap::new();
        constructors.insert(CommandType::Config, |s| {
            Box::new(ConfigHandler::new(s.hardware.clone(), s.config_ids.clone()))
        });
        constructors.insert(CommandType::Multrun, |s| {
            Box::new(MultrunHandler::new(s.hardware.clone()))
        });
        constructors.insert(CommandType::Arc, |s| Box::new(ArcHandler::new(s.hardware.clone())));
        constructors.insert(CommandType::Acquire, |s| {
            Box::new(AcquireHandler::new(s.hardware.clone()))
        });
        constructors.insert(CommandType::DayCalibrate, |s| {
            Box::new(DayCalibrateHandler::new(s.hardware.clone(), s.history.clone()))
        });
        constructors.insert(CommandType::TwilightCalibrate, |s| {
            Box::new(TwilightCalibrateHandler::new(s.hardware.clone(), s.history.clone()))
        });
        constructors.insert(CommandType::Abort, |s| {
            Box::new(AbortHandler::new(s.hardware.clone(), s.status.clone()))
        });
        constructors.insert(CommandType::GetStatus, |s| {
            Box::new(GetStatusHandler::new(s.hardware.clone(), s.status.clone()))
        });
        Self { constructors }
    }

    /// An empty table; commands registered later with [`with`](Self::with)
    pub fn empty() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    /// Builder-style registration, replacing any existing entry
    pub fn with(mut self, command_type: CommandType, constructor: HandlerConstructor) -> Self {
        self.constructors.insert(command_type, constructor);
        self
    }

    pub fn create(&self, command_type: CommandType, services: &Services) -> Option<Box<dyn CommandHandler>> {
        self.constructors
            .get(&command_type)
            .map(|constructor| constructor(services))
    }

    pub fn contains(&self, command_type: CommandType) -> bool {
        self.constructors.contains_key(&command_type)
    }

    /// Registered command types in a stable order
    pub fn command_types(&self) -> Vec<CommandType> {
        let mut types: Vec<CommandType> = self.constructors.keys().copied().collect();
        types.sort();
        types
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_registry_covers_every_command() {
        let registry = Registry::standard();
        assert_eq!(
            registry.command_types(),
            vec![
                CommandType::Config,
                CommandType::Multrun,
                CommandType::Arc,
                CommandType::Acquire,
                CommandType::DayCalibrate,
                CommandType::TwilightCalibrate,
                CommandType::Abort,
                CommandType::GetStatus,
            ]
        );
    }

    #[test]
    fn test_empty_registry_creates_nothing() {
        let registry = Registry::empty();
        let mock = crate::testing::MockInstrument::new();
        let services = crate::testing::services(&mock, crate::testing::fast_config());
        assert!(registry.create(CommandType::Multrun, &services).is_none());
        assert!(!registry.contains(CommandType::Abort));
    }
}
