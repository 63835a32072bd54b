//! Scripted subsystem fakes for unit tests

use crate::command::{Ack, Message};
use crate::config::InstrumentConfig;
use crate::context::ExecutionContext;
use crate::error::SubsystemResult;
use crate::fits::{HeaderCard, HeaderValue};
use crate::hardware::{Hardware, SharedHardware};
use crate::persistence::{CalibrationHistory, ConfigIdCounter};
use crate::registry::Services;
use crate::status::{InstrumentStatus, SharedStatus};
use crate::subsystem::*;
use crate::FrameType;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

type MultrunHook = Arc<dyn Fn(u32) + Send + Sync>;
type MoveHook = Arc<dyn Fn(&str, &str) + Send + Sync>;

#[derive(Default)]
struct MockState {
    positions: HashMap<String, String>,
    pending_moves: HashMap<String, (String, u32)>,
    move_polls: HashMap<String, u32>,
    position_queries: HashMap<String, u32>,
    move_failures: HashMap<String, (i32, String)>,
    lamp_on: HashMap<String, u32>,
    lamp_off: HashMap<String, u32>,
    lamps: HashMap<String, bool>,
    headers: Vec<HeaderCard>,
    scheduler_headers: Vec<(String, Option<HeaderValue>)>,
    detector_requests: Vec<DetectorRequest>,
    scheduler_requests: Vec<SchedulerRequest>,
    pipeline_requests: Vec<PipelineRequest>,
    reductions: VecDeque<ReductionResult>,
    default_reduction: Option<ReductionResult>,
    calibration_counts: VecDeque<f64>,
    multrun_failures: VecDeque<(i32, String)>,
    reduction_failures: VecDeque<(i32, String)>,
    multrun_hook: Option<MultrunHook>,
    move_hook: Option<MoveHook>,
    multrun_count: u32,
    frame_counter: u32,
}

/// In-memory detector, mechanism controller, ISS and pipeline that record
/// every request and answer from a script.
#[derive(Clone, Default)]
pub struct MockInstrument {
    state: Arc<Mutex<MockState>>,
}

impl MockInstrument {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    pub fn subsystems(&self) -> Subsystems {
        Subsystems {
            detector: Arc::new(self.clone()),
            mechanism: Arc::new(self.clone()),
            scheduler: Arc::new(self.clone()),
            pipeline: Arc::new(self.clone()),
        }
    }

    pub fn hardware(&self, config: InstrumentConfig) -> SharedHardware {
        Arc::new(Hardware::new(self.subsystems(), Arc::new(config)))
    }

    // ----- scripting -----

    /// Position queries that report "moving" before a move completes
    pub fn set_move_polls(&self, actuator: &str, polls: u32) {
        self.state().move_polls.insert(actuator.into(), polls);
    }

    pub fn fail_mechanism_move(&self, actuator: &str, code: i32, message: &str) {
        self.state()
            .move_failures
            .insert(actuator.into(), (code, message.into()));
    }

    pub fn set_scheduler_headers(&self, headers: Vec<(String, Option<HeaderValue>)>) {
        self.state().scheduler_headers = headers;
    }

    pub fn push_reduction(&self, reduction: ReductionResult) {
        self.state().reductions.push_back(reduction);
    }

    pub fn set_default_reduction(&self, reduction: ReductionResult) {
        self.state().default_reduction = Some(reduction);
    }

    pub fn push_calibration_counts(&self, counts: &[f64]) {
        self.state().calibration_counts.extend(counts.iter().copied());
    }

    pub fn fail_next_multrun(&self, code: i32, message: &str) {
        self.state()
            .multrun_failures
            .push_back((code, message.into()));
    }

    pub fn fail_next_reduction(&self, code: i32, message: &str) {
        self.state()
            .reduction_failures
            .push_back((code, message.into()));
    }

    /// Called with the 1-based multrun number before each multrun is answered
    pub fn on_multrun(&self, hook: impl Fn(u32) + Send + Sync + 'static) {
        self.state().multrun_hook = Some(Arc::new(hook));
    }

    /// Called with actuator and target before each move is answered
    pub fn on_move(&self, hook: impl Fn(&str, &str) + Send + Sync + 'static) {
        self.state().move_hook = Some(Arc::new(hook));
    }

    // ----- inspection -----

    pub fn position(&self, actuator: &str) -> Option<String> {
        self.state().positions.get(actuator).cloned()
    }

    pub fn position_queries(&self, actuator: &str) -> u32 {
        self.state().position_queries.get(actuator).copied().unwrap_or(0)
    }

    pub fn lamp_is_on(&self, lamp: &str) -> bool {
        self.state().lamps.get(lamp).copied().unwrap_or(false)
    }

    pub fn lamp_on_count(&self, lamp: &str) -> u32 {
        self.state().lamp_on.get(lamp).copied().unwrap_or(0)
    }

    pub fn lamp_off_count(&self, lamp: &str) -> u32 {
        self.state().lamp_off.get(lamp).copied().unwrap_or(0)
    }

    pub fn pushed_headers(&self) -> Vec<HeaderCard> {
        self.state().headers.clone()
    }

    pub fn detector_requests(&self) -> Vec<DetectorRequest> {
        self.state().detector_requests.clone()
    }

    pub fn multruns(&self) -> Vec<(u64, u32, FrameType)> {
        self.state()
            .detector_requests
            .iter()
            .filter_map(|r| match r {
                DetectorRequest::Multrun {
                    exposure_ms,
                    count,
                    frame_type,
                } => Some((*exposure_ms, *count, *frame_type)),
                _ => None,
            })
            .collect()
    }

    pub fn scheduler_requests(&self) -> Vec<SchedulerRequest> {
        self.state().scheduler_requests.clone()
    }

    pub fn offsets_xy(&self) -> Vec<(f64, f64)> {
        self.scheduler_requests()
            .into_iter()
            .filter_map(|r| match r {
                SchedulerRequest::OffsetXY { x_arcsec, y_arcsec } => Some((x_arcsec, y_arcsec)),
                _ => None,
            })
            .collect()
    }

    pub fn offsets_ra_dec(&self) -> Vec<(f64, f64)> {
        self.scheduler_requests()
            .into_iter()
            .filter_map(|r| match r {
                SchedulerRequest::OffsetRaDec {
                    ra_arcsec,
                    dec_arcsec,
                } => Some((ra_arcsec, dec_arcsec)),
                _ => None,
            })
            .collect()
    }

    pub fn pipeline_requests(&self) -> Vec<PipelineRequest> {
        self.state().pipeline_requests.clone()
    }
}

/// Reduction result with a brightest object at `x`, `y`
pub fn reduction_at(x: f64, y: f64) -> ReductionResult {
    ReductionResult {
        filename: String::new(),
        mean_counts: 1_200.0,
        peak_counts: 18_000.0,
        seeing_arcsec: 1.1,
        sky_brightness: 19.5,
        saturated: false,
        brightest_object: Some(crate::astro::PixelPosition::new(x, y)),
        wcs: None,
    }
}

#[async_trait]
impl DetectorClient for MockInstrument {
    async fn send(&self, request: DetectorRequest) -> SubsystemResult<Reply<DetectorPayload>> {
        let hook = {
            let mut state = self.state();
            state.detector_requests.push(request.clone());
            if let DetectorRequest::Multrun { .. } = request {
                state.multrun_count += 1;
                state.multrun_hook.clone().map(|h| (h, state.multrun_count))
            } else {
                None
            }
        };
        if let Some((hook, number)) = hook {
            hook(number);
        }

        let mut state = self.state();
        let reply = match request {
            DetectorRequest::SetHeaders(cards) => {
                state.headers.extend(cards);
                Reply::ok(DetectorPayload::Done)
            }
            DetectorRequest::Multrun { count, .. } => match state.multrun_failures.pop_front() {
                Some((code, message)) => Reply::failed(code, message),
                None => {
                    let filenames = (0..count)
                        .map(|_| {
                            state.frame_counter += 1;
                            format!("frame_{:04}.fits", state.frame_counter)
                        })
                        .collect();
                    Reply::ok(DetectorPayload::Filenames(filenames))
                }
            },
            DetectorRequest::Status => Reply::ok(DetectorPayload::Status(DetectorStatus {
                temperature_c: -100.0,
                exposure_in_progress: false,
                binning: crate::Binning::square(1),
            })),
            _ => Reply::ok(DetectorPayload::Done),
        };
        Ok(reply)
    }
}

#[async_trait]
impl MechanismClient for MockInstrument {
    async fn send(&self, request: MechanismRequest) -> SubsystemResult<Reply<MechanismPayload>> {
        if let MechanismRequest::Move { actuator, position } = &request {
            let hook = self.state().move_hook.clone();
            if let Some(hook) = hook {
                hook(actuator, position);
            }
        }
        let mut state = self.state();
        let reply = match request {
            MechanismRequest::Move { actuator, position } => {
                if let Some((code, message)) = state.move_failures.get(&actuator).cloned() {
                    return Ok(Reply::failed(code, message));
                }
                let polls = state.move_polls.get(&actuator).copied().unwrap_or(0);
                if polls == 0 {
                    state.positions.insert(actuator, position);
                } else {
                    state.positions.insert(actuator.clone(), "moving".into());
                    state.pending_moves.insert(actuator, (position, polls));
                }
                Reply::ok(MechanismPayload::Done)
            }
            MechanismRequest::Position { actuator } => {
                *state.position_queries.entry(actuator.clone()).or_insert(0) += 1;
                if let Some((target, remaining)) = state.pending_moves.get_mut(&actuator) {
                    if *remaining == 0 {
                        let target = target.clone();
                        state.pending_moves.remove(&actuator);
                        state.positions.insert(actuator.clone(), target);
                    } else {
                        *remaining = remaining.saturating_sub(1);
                    }
                }
                let position = state
                    .positions
                    .get(&actuator)
                    .cloned()
                    .unwrap_or_else(|| "home".into());
                Reply::ok(MechanismPayload::Position(position))
            }
            MechanismRequest::Lamp { lamp, on } => {
                let counter = if on { &mut state.lamp_on } else { &mut state.lamp_off };
                *counter.entry(lamp.clone()).or_insert(0) += 1;
                state.lamps.insert(lamp, on);
                Reply::ok(MechanismPayload::Done)
            }
        };
        Ok(reply)
    }
}

#[async_trait]
impl SchedulerClient for MockInstrument {
    async fn send(&self, request: SchedulerRequest) -> SubsystemResult<Reply<SchedulerPayload>> {
        let mut state = self.state();
        state.scheduler_requests.push(request.clone());
        let reply = match request {
            SchedulerRequest::FitsHeaders => {
                Reply::ok(SchedulerPayload::Headers(state.scheduler_headers.clone()))
            }
            _ => Reply::ok(SchedulerPayload::Done),
        };
        Ok(reply)
    }
}

#[async_trait]
impl PipelineClient for MockInstrument {
    async fn send(&self, request: PipelineRequest) -> SubsystemResult<Reply<PipelinePayload>> {
        let mut state = self.state();
        state.pipeline_requests.push(request.clone());
        if let Some((code, message)) = state.reduction_failures.pop_front() {
            return Ok(Reply::failed(code, message));
        }
        let reply = match request {
            PipelineRequest::Reduce { filename, .. } => {
                let mut result = state
                    .reductions
                    .pop_front()
                    .or_else(|| state.default_reduction.clone())
                    .unwrap_or_else(|| ReductionResult {
                        brightest_object: None,
                        ..reduction_at(0.0, 0.0)
                    });
                result.filename = filename;
                Reply::ok(PipelinePayload::Reduction(result))
            }
            PipelineRequest::ReduceCalibration { filename } => {
                let mean_counts = state.calibration_counts.pop_front().unwrap_or(20_000.0);
                Reply::ok(PipelinePayload::Calibration(CalibrationReduction {
                    filename,
                    mean_counts,
                    peak_counts: mean_counts * 1.3,
                }))
            }
        };
        Ok(reply)
    }
}

/// Configuration with millisecond timings so tests run fast
pub fn fast_config() -> InstrumentConfig {
    let mut config = InstrumentConfig::default();
    config.mechanisms.poll_interval_ms = 1;
    config.mechanisms.default_move_timeout_ms = 1_000;
    config.lamps.default_warmup_ms = 1;
    config.acquisition.plate_scale.clear();
    config.acquisition.plate_scale.insert(1, 0.5);
    config.acquisition.plate_scale.insert(2, 1.0);
    config
}

/// Services over the mock with in-memory persistence
pub fn services(mock: &MockInstrument, config: InstrumentConfig) -> Services {
    Services {
        hardware: mock.hardware(config),
        history: Arc::new(CalibrationHistory::in_memory()),
        config_ids: Arc::new(ConfigIdCounter::in_memory()),
        status: Arc::new(InstrumentStatus::new()),
    }
}

/// Context over `status` plus the receiving end of its message channel
pub fn context_for(
    status: &SharedStatus,
) -> (ExecutionContext, mpsc::UnboundedReceiver<Message>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ExecutionContext::new("test", status.clone(), tx), rx)
}

/// Context plus the receiving end of its message channel
pub fn context() -> (ExecutionContext, SharedStatus, mpsc::UnboundedReceiver<Message>) {
    let status = Arc::new(InstrumentStatus::new());
    let (tx, rx) = mpsc::unbounded_channel();
    (ExecutionContext::new("test", status.clone(), tx), status, rx)
}

pub fn drain_acks(rx: &mut mpsc::UnboundedReceiver<Message>) -> Vec<Ack> {
    let mut acks = Vec::new();
    while let Ok(message) = rx.try_recv() {
        if let Message::Ack(ack) = message {
            acks.push(ack);
        }
    }
    acks
}
