//! Instrument configuration
//!
//! Named lookups consumed by the command handlers: plate scales, actuator
//! timeouts, lamp warm-up times, exposure limits, calibration tables.
//! Loaded once at startup from a JSON file; every section has defaults so a
//! partial file is enough.

use crate::error::ConfigError;
use crate::fits::HeaderCard;
use crate::Binning;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InstrumentConfig {
    /// Value of the INSTRUME header card
    pub instrument_name: String,
    /// Focus offset sent to the ISS after each CONFIG (mm)
    pub focus_offset_mm: f64,
    pub detector: DetectorConfig,
    pub mechanisms: MechanismConfig,
    pub lamps: LampConfig,
    pub fits: FitsConfig,
    pub acquisition: AcquisitionConfig,
    pub day_calibration: DayCalibrationConfig,
    pub twilight_calibration: TwilightCalibrationConfig,
    pub state: StateConfig,
    /// Behaviour of the built-in simulator, used with `--simulate`
    pub simulation: SimulationConfig,
}

impl Default for InstrumentConfig {
    fn default() -> Self {
        Self {
            instrument_name: "SPECTROGRAPH".to_string(),
            focus_offset_mm: 0.0,
            detector: DetectorConfig::default(),
            mechanisms: MechanismConfig::default(),
            lamps: LampConfig::default(),
            fits: FitsConfig::default(),
            acquisition: AcquisitionConfig::default(),
            day_calibration: DayCalibrationConfig::default(),
            twilight_calibration: TwilightCalibrationConfig::default(),
            state: StateConfig::default(),
            simulation: SimulationConfig::default(),
        }
    }
}

impl InstrumentConfig {
    /// Read and validate a configuration file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: InstrumentConfig =
            serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mechanisms.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "mechanisms.poll_interval_ms must be greater than zero".into(),
            ));
        }
        if self.acquisition.plate_scale.is_empty() {
            return Err(ConfigError::Invalid(
                "acquisition.plate_scale needs at least one binning entry".into(),
            ));
        }
        if let Some((factor, scale)) = self
            .acquisition
            .plate_scale
            .iter()
            .find(|(_, scale)| **scale <= 0.0)
        {
            return Err(ConfigError::Invalid(format!(
                "plate scale for binning {} must be positive, got {}",
                factor, scale
            )));
        }
        self.twilight_calibration.validate()
    }

    /// Plate scale (arcsec per binned pixel) along each axis
    pub fn plate_scale(&self, binning: Binning) -> Option<(f64, f64)> {
        let scales = &self.acquisition.plate_scale;
        Some((*scales.get(&binning.x)?, *scales.get(&binning.y)?))
    }
}

/// Detector timing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Readout time per frame (default: 5 seconds)
    pub readout_overhead_ms: u64,
    /// Time allowed for one pipeline reduction (default: 10 seconds)
    pub reduction_overhead_ms: u64,
    /// Acknowledge time when nothing better is known (default: 60 seconds)
    pub default_acknowledge_ms: u64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            readout_overhead_ms: 5_000,
            reduction_overhead_ms: 10_000,
            default_acknowledge_ms: 60_000,
        }
    }
}

impl DetectorConfig {
    pub fn readout_overhead(&self) -> Duration {
        Duration::from_millis(self.readout_overhead_ms)
    }

    pub fn reduction_overhead(&self) -> Duration {
        Duration::from_millis(self.reduction_overhead_ms)
    }

    pub fn default_acknowledge(&self) -> Duration {
        Duration::from_millis(self.default_acknowledge_ms)
    }
}

/// Actuator names, positions and move timeouts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MechanismConfig {
    /// Position polling interval while waiting for a move (default: 500ms)
    pub poll_interval_ms: u64,
    /// Move timeout for actuators without their own entry (default: 60 seconds)
    pub default_move_timeout_ms: u64,
    /// Per-actuator move timeouts
    pub move_timeouts_ms: BTreeMap<String, u64>,
    pub slit_actuator: String,
    pub grism_actuator: String,
    pub rotation_actuator: String,
    pub mirror_actuator: String,
    pub mirror_in_position: String,
    pub mirror_out_position: String,
}

impl Default for MechanismConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
            default_move_timeout_ms: 60_000,
            move_timeouts_ms: BTreeMap::new(),
            slit_actuator: "slit".to_string(),
            grism_actuator: "grism".to_string(),
            rotation_actuator: "grism_rotation".to_string(),
            mirror_actuator: "calibration_mirror".to_string(),
            mirror_in_position: "in".to_string(),
            mirror_out_position: "out".to_string(),
        }
    }
}

impl MechanismConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn move_timeout(&self, actuator: &str) -> Duration {
        let ms = self
            .move_timeouts_ms
            .get(actuator)
            .copied()
            .unwrap_or(self.default_move_timeout_ms);
        Duration::from_millis(ms)
    }
}

/// Calibration lamps
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LampConfig {
    /// Lamp used by ARC
    pub arc_lamp: String,
    /// Lamp used for day-calibration flats
    pub flat_lamp: String,
    /// Warm-up before exposing with a lamp, per lamp name
    pub warmup_ms: BTreeMap<String, u64>,
    /// Warm-up for lamps without their own entry (default: 2 seconds)
    pub default_warmup_ms: u64,
}

impl Default for LampConfig {
    fn default() -> Self {
        Self {
            arc_lamp: "Xe".to_string(),
            flat_lamp: "W".to_string(),
            warmup_ms: BTreeMap::new(),
            default_warmup_ms: 2_000,
        }
    }
}

impl LampConfig {
    pub fn warmup(&self, lamp: &str) -> Duration {
        Duration::from_millis(
            self.warmup_ms
                .get(lamp)
                .copied()
                .unwrap_or(self.default_warmup_ms),
        )
    }
}

/// Static FITS cards added to every frame
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FitsConfig {
    pub static_headers: Vec<HeaderCard>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    /// Arcsec per binned pixel, keyed by the binning factor of one axis
    pub plate_scale: BTreeMap<u32, f64>,
    /// Offsets allowed before giving up (default: 5)
    pub maximum_offset_count: u32,
    /// Added to each acquisition exposure when acknowledging (default: 30 seconds)
    pub overhead_ms: u64,
    /// Threshold used when the command does not give one (default: 1 arcsec)
    pub default_threshold_arcsec: f64,
    /// Binning for acquisition frames
    pub binning: Binning,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        let mut plate_scale = BTreeMap::new();
        plate_scale.insert(1, 0.44);
        plate_scale.insert(2, 0.88);
        Self {
            plate_scale,
            maximum_offset_count: 5,
            overhead_ms: 30_000,
            default_threshold_arcsec: 1.0,
            binning: Binning::square(1),
        }
    }
}

impl AcquisitionConfig {
    pub fn overhead(&self) -> Duration {
        Duration::from_millis(self.overhead_ms)
    }
}

/// Kind of day calibration frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CalibrationType {
    Bias,
    Dark,
    Flat,
}

impl CalibrationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CalibrationType::Bias => "bias",
            CalibrationType::Dark => "dark",
            CalibrationType::Flat => "flat",
        }
    }
}

/// One entry of the day calibration list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DayCalibrationCandidate {
    #[serde(rename = "type")]
    pub calibration_type: CalibrationType,
    pub binning: Binning,
    /// Ignored for bias frames
    #[serde(default)]
    pub exposure_ms: u64,
    pub count: u32,
    /// Minimum time between completed runs
    pub frequency_ms: u64,
    /// Lamp for flats; defaults to the configured flat lamp
    #[serde(default)]
    pub lamp: Option<String>,
}

impl DayCalibrationCandidate {
    /// Exposure length actually taken: bias frames are always zero length
    pub fn effective_exposure_ms(&self) -> u64 {
        match self.calibration_type {
            CalibrationType::Bias => 0,
            _ => self.exposure_ms,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DayCalibrationConfig {
    /// Candidates in priority order
    pub candidates: Vec<DayCalibrationCandidate>,
}

/// Fixed telescope offset applied between repeats of one twilight flat
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct OffsetDescriptor {
    pub ra_arcsec: f64,
    pub dec_arcsec: f64,
}

/// One entry of the twilight flat list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TwilightCalibrationCandidate {
    pub binning: Binning,
    pub frequency_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TwilightCalibrationConfig {
    pub min_exposure_ms: u64,
    pub max_exposure_ms: u64,
    /// Exposure of the first frame, before any counts have been measured
    pub initial_exposure_ms: u64,
    /// Acceptance band for the mean counts of one frame
    pub min_mean_counts: f64,
    pub best_mean_counts: f64,
    pub max_mean_counts: f64,
    /// Local hour from which the sky is assumed to be darkening (sunset)
    pub sunset_after_hour: u32,
    pub offsets: Vec<OffsetDescriptor>,
    /// Candidates in priority order
    pub candidates: Vec<TwilightCalibrationCandidate>,
}

impl Default for TwilightCalibrationConfig {
    fn default() -> Self {
        Self {
            min_exposure_ms: 1_000,
            max_exposure_ms: 30_000,
            initial_exposure_ms: 1_000,
            min_mean_counts: 5_000.0,
            best_mean_counts: 25_000.0,
            max_mean_counts: 45_000.0,
            sunset_after_hour: 12,
            offsets: vec![OffsetDescriptor::default()],
            candidates: Vec::new(),
        }
    }
}

impl TwilightCalibrationConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.min_exposure_ms > self.max_exposure_ms {
            return Err(ConfigError::Invalid(format!(
                "twilight min_exposure_ms {} exceeds max_exposure_ms {}",
                self.min_exposure_ms, self.max_exposure_ms
            )));
        }
        if !(self.min_mean_counts <= self.best_mean_counts
            && self.best_mean_counts <= self.max_mean_counts)
        {
            return Err(ConfigError::Invalid(
                "twilight mean counts must satisfy min <= best <= max".into(),
            ));
        }
        if self.offsets.is_empty() {
            return Err(ConfigError::Invalid(
                "twilight offsets need at least one entry".into(),
            ));
        }
        if self.sunset_after_hour > 23 {
            return Err(ConfigError::Invalid(format!(
                "sunset_after_hour {} is not an hour of the day",
                self.sunset_after_hour
            )));
        }
        Ok(())
    }
}

/// Where persisted state lives
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    pub calibration_history_path: PathBuf,
    pub config_id_path: PathBuf,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            calibration_history_path: PathBuf::from("state/calibration_history.json"),
            config_id_path: PathBuf::from("state/config_id.json"),
        }
    }
}

/// Simulated instrument and sky
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Wall-clock fraction of each simulated exposure or move actually slept
    pub time_scale: f64,
    pub move_time_ms: u64,
    /// Where the brightest star lands before any offset (1x1 pixels)
    pub star_x: f64,
    pub star_y: f64,
    /// Sky position the simulated astrometric fit maps onto the star
    pub field_ra_deg: f64,
    pub field_dec_deg: f64,
    pub bias_level: f64,
    /// Per unbinned pixel
    pub sky_counts_per_ms: f64,
    pub lamp_counts_per_ms: f64,
    pub dark_counts_per_ms: f64,
    /// Relative scatter on every measured count and centroid
    pub noise_fraction: f64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            time_scale: 0.01,
            move_time_ms: 2_000,
            star_x: 530.0,
            star_y: 240.0,
            field_ra_deg: 150.0,
            field_dec_deg: 30.0,
            bias_level: 1_000.0,
            sky_counts_per_ms: 20.0,
            lamp_counts_per_ms: 30.0,
            dark_counts_per_ms: 0.002,
            noise_fraction: 0.01,
        }
    }
}
