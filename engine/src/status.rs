//! Shared instrument status
//!
//! The only cross-command mutable state. Each field group sits behind its
//! own lock, taken only for the duration of an update and never across an
//! `.await`. The abort flag is level-triggered. ABORT sets it and running
//! commands read it at their checkpoints. A new command clears it only when
//! nothing else is running.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

/// The command currently holding the instrument
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrentCommand {
    pub id: String,
    pub name: String,
    /// Identifies the executing task, so a finished task never clears a newer command
    pub task_id: Uuid,
    pub started: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigurationState {
    pub id: i64,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExposureState {
    /// Frames requested by the current batch
    pub count: u32,
    /// Frame currently being taken, starting at 1
    pub number: u32,
    pub start_time: Option<DateTime<Utc>>,
    pub length_ms: u64,
}

/// Point-in-time copy of the whole status, for GET_STATUS
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub current_command: Option<CurrentCommand>,
    pub configuration: ConfigurationState,
    pub exposure: ExposureState,
    pub abort_requested: bool,
}

#[derive(Debug, Default)]
pub struct InstrumentStatus {
    current: Mutex<Option<CurrentCommand>>,
    configuration: Mutex<ConfigurationState>,
    exposure: Mutex<ExposureState>,
    abort: AtomicBool,
}

pub type SharedStatus = Arc<InstrumentStatus>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // Status fields are plain values; recover them from a poisoned lock
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl InstrumentStatus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Status restored with the persisted configuration id
    pub fn with_config_id(config_id: i64) -> Self {
        let status = Self::default();
        lock(&status.configuration).id = config_id;
        status
    }

    // =========================================================================
    // Current command
    // =========================================================================

    /// Record `id`/`name` as the current command and return its task id.
    ///
    /// A pending abort is cleared only when no other command is still
    /// recorded, so an ABORT aimed at a running command is never dropped by
    /// the arrival of the next one.
    pub fn begin_command(&self, id: &str, name: &str) -> Uuid {
        let task_id = Uuid::new_v4();
        let mut current = lock(&self.current);
        if current.is_none() {
            self.clear_abort();
        }
        *current = Some(CurrentCommand {
            id: id.to_string(),
            name: name.to_string(),
            task_id,
            started: Utc::now(),
        });
        task_id
    }

    /// Clear the current command if it still belongs to `task_id`
    pub fn end_command(&self, task_id: Uuid) {
        let mut current = lock(&self.current);
        if current.as_ref().map(|c| c.task_id) == Some(task_id) {
            *current = None;
        }
    }

    pub fn current_command(&self) -> Option<CurrentCommand> {
        lock(&self.current).clone()
    }

    // =========================================================================
    // Abort
    // =========================================================================

    pub fn request_abort(&self) {
        self.abort.store(true, Ordering::SeqCst);
    }

    pub fn clear_abort(&self) {
        self.abort.store(false, Ordering::SeqCst);
    }

    pub fn is_abort_requested(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }

    // =========================================================================
    // Configuration
    // =========================================================================

    pub fn set_configuration(&self, id: i64, name: &str) {
        let mut configuration = lock(&self.configuration);
        configuration.id = id;
        configuration.name = Some(name.to_string());
    }

    pub fn configuration(&self) -> ConfigurationState {
        lock(&self.configuration).clone()
    }

    // =========================================================================
    // Exposure counters
    // =========================================================================

    pub fn begin_exposure_batch(&self, count: u32, length_ms: u64) {
        let mut exposure = lock(&self.exposure);
        exposure.count = count;
        exposure.number = 0;
        exposure.length_ms = length_ms;
        exposure.start_time = None;
    }

    pub fn exposure_started(&self, number: u32, at: DateTime<Utc>) {
        let mut exposure = lock(&self.exposure);
        exposure.number = number;
        exposure.start_time = Some(at);
    }

    pub fn exposure(&self) -> ExposureState {
        lock(&self.exposure).clone()
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            current_command: self.current_command(),
            configuration: self.configuration(),
            exposure: self.exposure(),
            abort_requested: self.is_abort_requested(),
        }
    }
}
