//! Simulated instrument
//!
//! One object standing in for the detector, mechanism controller, ISS and
//! pipeline, so the server can run end to end without hardware. Moves take
//! time, lamps only light the detector through the calibration mirror, and
//! the brightest star shifts with every X/Y offset the ISS is sent.

use crate::astro::{PixelPosition, WcsSolution};
use crate::config::InstrumentConfig;
use crate::error::SubsystemResult;
use crate::fits::{HeaderList, HeaderValue};
use crate::subsystem::*;
use crate::{Binning, FrameType};
use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const SATURATION_COUNTS: f64 = 65_535.0;
const UNKNOWN_FRAME_CODE: i32 = 2;

#[derive(Debug, Clone, Copy)]
struct SimFrame {
    frame_type: FrameType,
    exposure_ms: u64,
    binning: Binning,
    lamp_lit: bool,
}

struct Move {
    target: String,
    arrival: Instant,
}

#[derive(Default)]
struct SimState {
    positions: HashMap<String, String>,
    moves: HashMap<String, Move>,
    lamps: HashMap<String, bool>,
    binning: Binning,
    headers: HeaderList,
    frames: HashMap<String, SimFrame>,
    frame_counter: u64,
    exposing: bool,
    /// Cumulative X/Y offset, arcsec
    offset_xy: (f64, f64),
    /// Current RA/Dec offset from nominal, arcsec
    offset_ra_dec: (f64, f64),
    focus_offset_mm: f64,
}

/// Simulated subsystems. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct SimulatedInstrument {
    config: Arc<InstrumentConfig>,
    state: Arc<Mutex<SimState>>,
}

impl SimulatedInstrument {
    pub fn new(config: Arc<InstrumentConfig>) -> Self {
        let mut state = SimState::default();
        let mechanisms = &config.mechanisms;
        state
            .positions
            .insert(mechanisms.mirror_actuator.clone(), mechanisms.mirror_out_position.clone());
        Self {
            config,
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn subsystems(&self) -> Subsystems {
        Subsystems {
            detector: Arc::new(self.clone()),
            mechanism: Arc::new(self.clone()),
            scheduler: Arc::new(self.clone()),
            pipeline: Arc::new(self.clone()),
        }
    }

    /// Value currently in the simulated detector's header buffer
    pub fn header(&self, keyword: &str) -> Option<HeaderValue> {
        self.state().headers.get(keyword).cloned()
    }

    /// Cumulative X/Y offset and absolute RA/Dec offset, arcsec
    pub fn telescope_offsets(&self) -> ((f64, f64), (f64, f64)) {
        let state = self.state();
        (state.offset_xy, state.offset_ra_dec)
    }

    pub fn focus_offset_mm(&self) -> f64 {
        self.state().focus_offset_mm
    }

    fn state(&self) -> std::sync::MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn scaled(&self, ms: u64) -> Duration {
        Duration::from_secs_f64(ms as f64 / 1000.0 * self.config.simulation.time_scale.max(0.0))
    }

    /// Arcsec per unbinned pixel
    fn unbinned_scale(&self) -> f64 {
        self.config
            .plate_scale(Binning::square(1))
            .map(|(x, _)| x)
            .unwrap_or(0.44)
    }

    fn jitter(&self, rng: &mut impl Rng, value: f64) -> f64 {
        let noise = self.config.simulation.noise_fraction;
        if noise <= 0.0 {
            return value;
        }
        value * (1.0 + rng.gen_range(-noise..noise))
    }

    /// Star centroid on the detector after the offsets applied so far
    fn star_position(&self, state: &SimState, binning: Binning) -> PixelPosition {
        let sim = &self.config.simulation;
        let scale = self.unbinned_scale();
        let x = sim.star_x - state.offset_xy.0 / scale;
        let y = sim.star_y - state.offset_xy.1 / scale;
        PixelPosition::new(x / binning.x as f64, y / binning.y as f64)
    }

    fn lamp_lit(&self, state: &SimState) -> bool {
        let mechanisms = &self.config.mechanisms;
        let mirror_in = state.positions.get(&mechanisms.mirror_actuator)
            == Some(&mechanisms.mirror_in_position);
        mirror_in && state.lamps.values().any(|on| *on)
    }

    fn mean_counts(&self, frame: &SimFrame) -> f64 {
        let sim = &self.config.simulation;
        let exposure = frame.exposure_ms as f64;
        let area = frame.binning.area();
        let signal = match frame.frame_type {
            FrameType::Bias => 0.0,
            FrameType::Dark => sim.dark_counts_per_ms * exposure * area,
            FrameType::LampFlat | FrameType::Arc if frame.lamp_lit => sim.lamp_counts_per_ms * exposure * area,
            FrameType::LampFlat | FrameType::Arc => sim.dark_counts_per_ms * exposure * area,
            FrameType::SkyFlat | FrameType::Exposure | FrameType::Acquire => {
                sim.sky_counts_per_ms * exposure * area
            }
        };
        sim.bias_level + signal
    }

    fn reduce(&self, filename: &str, wcs_fit: bool) -> Reply<PipelinePayload> {
        let state = self.state();
        let Some(frame) = state.frames.get(filename).copied() else {
            return Reply::failed(UNKNOWN_FRAME_CODE, format!("no such frame {}", filename));
        };
        let mut rng = rand::thread_rng();
        let mean_counts = self.jitter(&mut rng, self.mean_counts(&frame)).min(SATURATION_COUNTS);
        let on_sky = matches!(frame.frame_type, FrameType::Exposure | FrameType::Acquire);

        let (brightest_object, wcs) = if on_sky {
            let star = self.star_position(&state, frame.binning);
            let noise = self.config.simulation.noise_fraction;
            let centroid = PixelPosition::new(
                star.x + if noise > 0.0 { rng.gen_range(-0.05..0.05) } else { 0.0 },
                star.y + if noise > 0.0 { rng.gen_range(-0.05..0.05) } else { 0.0 },
            );
            let wcs = wcs_fit.then(|| {
                let sim = &self.config.simulation;
                let scale_deg = self.unbinned_scale() * frame.binning.x as f64 / 3600.0;
                WcsSolution {
                    crval_ra: sim.field_ra_deg.to_radians(),
                    crval_dec: sim.field_dec_deg.to_radians(),
                    crpix_x: star.x,
                    crpix_y: star.y,
                    cd: [[-scale_deg, 0.0], [0.0, scale_deg]],
                }
            });
            (Some(centroid), wcs)
        } else {
            (None, None)
        };

        let star_peak = if on_sky { 30_000.0 } else { 0.0 };
        let peak_counts = (mean_counts * 1.2 + star_peak).min(SATURATION_COUNTS);
        Reply::ok(PipelinePayload::Reduction(ReductionResult {
            filename: filename.to_string(),
            mean_counts,
            peak_counts,
            seeing_arcsec: rng.gen_range(0.8..1.6),
            sky_brightness: 20.5 - rng.gen_range(0.0..0.5),
            saturated: peak_counts >= SATURATION_COUNTS,
            brightest_object,
            wcs,
        }))
    }
}

#[async_trait]
impl DetectorClient for SimulatedInstrument {
    async fn send(&self, request: DetectorRequest) -> SubsystemResult<Reply<DetectorPayload>> {
        let reply = match request {
            DetectorRequest::Configure { binning } => {
                tracing::info!("[SIM] Detector binning {}", binning);
                self.state().binning = binning;
                Reply::ok(DetectorPayload::Done)
            }
            DetectorRequest::ClearHeaders => {
                self.state().headers = HeaderList::new();
                Reply::ok(DetectorPayload::Done)
            }
            DetectorRequest::SetHeaders(cards) => {
                let mut state = self.state();
                for card in cards {
                    state.headers.set(card);
                }
                Reply::ok(DetectorPayload::Done)
            }
            DetectorRequest::Multrun {
                exposure_ms,
                count,
                frame_type,
            } => {
                let mut filenames = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    self.state().exposing = true;
                    tokio::time::sleep(self.scaled(exposure_ms)).await;

                    let mut state = self.state();
                    state.exposing = false;
                    state.frame_counter += 1;
                    let filename = format!(
                        "sim_{}_{:05}_{}.fits",
                        Utc::now().format("%Y%m%d"),
                        state.frame_counter,
                        frame_type.as_str()
                    );
                    let frame = SimFrame {
                        frame_type,
                        exposure_ms,
                        binning: state.binning,
                        lamp_lit: self.lamp_lit(&state),
                    };
                    tracing::info!(
                        "[SIM] Wrote {} ({} cards, lamp lit: {})",
                        filename,
                        state.headers.len(),
                        frame.lamp_lit
                    );
                    state.frames.insert(filename.clone(), frame);
                    filenames.push(filename);
                }
                Reply::ok(DetectorPayload::Filenames(filenames))
            }
            DetectorRequest::Abort => {
                tracing::info!("[SIM] Detector abort");
                self.state().exposing = false;
                Reply::ok(DetectorPayload::Done)
            }
            DetectorRequest::Status => {
                let state = self.state();
                let temperature_c = -100.0 + rand::thread_rng().gen_range(-0.2..0.2);
                Reply::ok(DetectorPayload::Status(DetectorStatus {
                    temperature_c,
                    exposure_in_progress: state.exposing,
                    binning: state.binning,
                }))
            }
        };
        Ok(reply)
    }
}

#[async_trait]
impl MechanismClient for SimulatedInstrument {
    async fn send(&self, request: MechanismRequest) -> SubsystemResult<Reply<MechanismPayload>> {
        let mut state = self.state();
        let reply = match request {
            MechanismRequest::Move { actuator, position } => {
                tracing::info!("[SIM] Moving {} to {}", actuator, position);
                let arrival = Instant::now() + self.scaled(self.config.simulation.move_time_ms);
                state.positions.insert(actuator.clone(), "moving".to_string());
                state.moves.insert(
                    actuator,
                    Move {
                        target: position,
                        arrival,
                    },
                );
                Reply::ok(MechanismPayload::Done)
            }
            MechanismRequest::Position { actuator } => {
                if state
                    .moves
                    .get(&actuator)
                    .is_some_and(|m| Instant::now() >= m.arrival)
                {
                    if let Some(finished) = state.moves.remove(&actuator) {
                        state.positions.insert(actuator.clone(), finished.target);
                    }
                }
                let position = state
                    .positions
                    .get(&actuator)
                    .cloned()
                    .unwrap_or_else(|| "home".to_string());
                Reply::ok(MechanismPayload::Position(position))
            }
            MechanismRequest::Lamp { lamp, on } => {
                tracing::info!("[SIM] Lamp {} {}", lamp, if on { "on" } else { "off" });
                state.lamps.insert(lamp, on);
                Reply::ok(MechanismPayload::Done)
            }
        };
        Ok(reply)
    }
}

#[async_trait]
impl SchedulerClient for SimulatedInstrument {
    async fn send(&self, request: SchedulerRequest) -> SubsystemResult<Reply<SchedulerPayload>> {
        let mut state = self.state();
        let reply = match request {
            SchedulerRequest::OffsetRaDec {
                ra_arcsec,
                dec_arcsec,
            } => {
                state.offset_ra_dec = (ra_arcsec, dec_arcsec);
                Reply::ok(SchedulerPayload::Done)
            }
            SchedulerRequest::OffsetXY { x_arcsec, y_arcsec } => {
                state.offset_xy.0 += x_arcsec;
                state.offset_xy.1 += y_arcsec;
                tracing::debug!("[SIM] Telescope X/Y offset now {:?}", state.offset_xy);
                Reply::ok(SchedulerPayload::Done)
            }
            SchedulerRequest::FocusOffset { offset_mm } => {
                state.focus_offset_mm = offset_mm;
                Reply::ok(SchedulerPayload::Done)
            }
            SchedulerRequest::FitsHeaders => {
                let sim = &self.config.simulation;
                let headers: Vec<(String, Option<HeaderValue>)> = vec![
                    ("OBJECT".into(), Some("SIMULATED-FIELD".into())),
                    ("TELESCOP".into(), Some("SIMULATOR".into())),
                    ("RA".into(), Some(crate::astro::format_ra(sim.field_ra_deg.to_radians()).into())),
                    ("DEC".into(), Some(crate::astro::format_dec(sim.field_dec_deg.to_radians()).into())),
                    ("DATE-OBS".into(), Some(Utc::now().into())),
                ];
                Reply::ok(SchedulerPayload::Headers(headers))
            }
        };
        Ok(reply)
    }
}

#[async_trait]
impl PipelineClient for SimulatedInstrument {
    async fn send(&self, request: PipelineRequest) -> SubsystemResult<Reply<PipelinePayload>> {
        let reply = match request {
            PipelineRequest::Reduce { filename, wcs_fit } => self.reduce(&filename, wcs_fit),
            PipelineRequest::ReduceCalibration { filename } => match self.reduce(&filename, false) {
                Reply {
                    payload: Some(PipelinePayload::Reduction(result)),
                    ..
                } => Reply::ok(PipelinePayload::Calibration(CalibrationReduction {
                    filename: result.filename,
                    mean_counts: result.mean_counts,
                    peak_counts: result.peak_counts,
                })),
                failed => failed,
            },
        };
        Ok(reply)
    }
}
