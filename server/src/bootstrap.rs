//! Wiring the engine together at startup

use anyhow::{bail, Context};
use spectrograph_engine::hardware::Hardware;
use spectrograph_engine::persistence::{CalibrationHistory, ConfigIdCounter};
use spectrograph_engine::sim::SimulatedInstrument;
use spectrograph_engine::subsystem::Subsystems;
use spectrograph_engine::{Dispatcher, InstrumentConfig, InstrumentStatus, Registry, Services};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

const DRAIN_POLL: Duration = Duration::from_millis(100);

/// Configuration file if given, defaults otherwise
pub fn load_config(path: Option<&Path>) -> anyhow::Result<InstrumentConfig> {
    match path {
        Some(path) => {
            let config = InstrumentConfig::load(path)
                .with_context(|| format!("Loading configuration {}", path.display()))?;
            tracing::info!("Loaded configuration from {}", path.display());
            Ok(config)
        }
        None => {
            tracing::warn!("No configuration file given, using built-in defaults");
            Ok(InstrumentConfig::default())
        }
    }
}

/// Dispatcher backed by the persisted state files named in the configuration
pub fn open_dispatcher(config: InstrumentConfig, simulate: bool) -> anyhow::Result<Dispatcher> {
    let config = Arc::new(config);
    let subsystems = subsystems(&config, simulate)?;

    let history_path = &config.state.calibration_history_path;
    let history = CalibrationHistory::open(history_path)
        .with_context(|| format!("Opening calibration history {}", history_path.display()))?;
    let config_id_path = &config.state.config_id_path;
    let config_ids = ConfigIdCounter::open(config_id_path)
        .with_context(|| format!("Opening configuration id counter {}", config_id_path.display()))?;
    tracing::info!("Last configuration id {}", config_ids.current());

    Ok(assemble(config, subsystems, history, config_ids))
}

fn subsystems(config: &Arc<InstrumentConfig>, simulate: bool) -> anyhow::Result<Subsystems> {
    if !simulate {
        bail!("No hardware subsystem adapters are built into this server; start it with --simulate");
    }
    tracing::info!(
        "Using simulated instrument (time scale {})",
        config.simulation.time_scale
    );
    Ok(SimulatedInstrument::new(config.clone()).subsystems())
}

fn assemble(
    config: Arc<InstrumentConfig>,
    subsystems: Subsystems,
    history: CalibrationHistory,
    config_ids: ConfigIdCounter,
) -> Dispatcher {
    let status = Arc::new(InstrumentStatus::with_config_id(config_ids.current()));
    let services = Services {
        hardware: Arc::new(Hardware::new(subsystems, config)),
        history: Arc::new(history),
        config_ids: Arc::new(config_ids),
        status,
    };
    Dispatcher::new(Registry::standard(), services)
}

/// Abort whatever is running and wait for it to finish.
///
/// Returns `false` if a command is still current after `timeout`, so the
/// caller can report that the hardware may not have been made safe.
pub async fn drain(status: &InstrumentStatus, timeout: Duration) -> bool {
    status.request_abort();
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        match status.current_command() {
            None => return true,
            Some(current) if tokio::time::Instant::now() >= deadline => {
                tracing::warn!(
                    "Command {} ({}) still running after {:?}",
                    current.name,
                    current.id,
                    timeout
                );
                return false;
            }
            Some(current) => {
                tracing::debug!("Waiting for {} ({}) to stop", current.name, current.id);
                tokio::time::sleep(DRAIN_POLL).await;
            }
        }
    }
}

/// Simulated instrument with state kept in memory
#[cfg(test)]
pub fn simulated_dispatcher(config: InstrumentConfig) -> Dispatcher {
    let config = Arc::new(config);
    let subsystems = SimulatedInstrument::new(config.clone()).subsystems();
    assemble(
        config,
        subsystems,
        CalibrationHistory::in_memory(),
        ConfigIdCounter::in_memory(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hardware_mode_is_refused() {
        let err = open_dispatcher(InstrumentConfig::default(), false).err().expect("hardware mode should be refused");
        assert!(err.to_string().contains("--simulate"));
    }

    #[test]
    fn test_status_starts_from_persisted_config_id() {
        let dir = std::env::temp_dir().join(format!("spectrograph-state-{}", uuid::Uuid::new_v4()));
        let mut config = InstrumentConfig::default();
        config.state.calibration_history_path = dir.join("history.json");
        config.state.config_id_path = dir.join("config_id.json");
        {
            let ids = ConfigIdCounter::open(&config.state.config_id_path).unwrap();
            ids.next().unwrap();
            ids.next().unwrap();
        }

        let dispatcher = open_dispatcher(config, true).unwrap();
        assert_eq!(dispatcher.status().configuration().id, 2);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn test_drain_waits_for_running_command() {
        let status = Arc::new(InstrumentStatus::new());
        let task_id = status.begin_command("7", "ARC");
        let runner = {
            let status = status.clone();
            tokio::spawn(async move {
                while !status.is_abort_requested() {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                tokio::time::sleep(Duration::from_millis(150)).await;
                status.end_command(task_id);
            })
        };

        assert!(drain(&status, Duration::from_secs(5)).await);
        assert!(status.current_command().is_none());
        runner.await.unwrap();
    }

    #[tokio::test]
    async fn test_drain_gives_up_after_timeout() {
        let status = InstrumentStatus::new();
        status.begin_command("8", "MULTRUN");

        assert!(!drain(&status, Duration::from_millis(250)).await);
        assert!(status.is_abort_requested());
        assert_eq!(status.current_command().unwrap().name, "MULTRUN");
    }

    #[tokio::test]
    async fn test_drain_with_nothing_running_returns_at_once() {
        let status = InstrumentStatus::new();
        assert!(drain(&status, Duration::ZERO).await);
    }

    #[test]
    fn test_missing_config_file_is_reported() {
        let err = load_config(Some(Path::new("/nonexistent/spectrograph.json"))).unwrap_err();
        assert!(format!("{:#}", err).contains("/nonexistent/spectrograph.json"));
    }
}
