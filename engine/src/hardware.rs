//! Hardware Coordination Layer
//!
//! Shared building blocks over the subsystem clients: actuator moves with
//! timeout, lamp control with scoped guards, FITS header assembly, exposure,
//! reduction and telescope offsets. Every failure comes back as a
//! [`SubsystemError`]; callers attach their call-site code with
//! [`ResultExt::at_site`](crate::error::ResultExt::at_site).

use crate::config::InstrumentConfig;
use crate::error::{SubsystemError, SubsystemResult};
use crate::fits::{HeaderCard, HeaderList, HeaderValue, OBJECT_KEYWORD};
use crate::subsystem::{
    CalibrationReduction, DetectorPayload, DetectorRequest, DetectorStatus, MechanismPayload,
    MechanismRequest, PipelinePayload, PipelineRequest, ReductionResult, SchedulerPayload,
    SchedulerRequest, Subsystem, Subsystems,
};
use crate::{Binning, FrameType};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::time::sleep;

pub type SharedHardware = Arc<Hardware>;

/// Coordination layer shared by all command handlers
pub struct Hardware {
    subsystems: Subsystems,
    config: Arc<InstrumentConfig>,
    /// OBJECT value from the last scheduler header fetch
    object_name: Mutex<Option<String>>,
}

impl Hardware {
    pub fn new(subsystems: Subsystems, config: Arc<InstrumentConfig>) -> Self {
        Self {
            subsystems,
            config,
            object_name: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &InstrumentConfig {
        &self.config
    }

    // =========================================================================
    // MECHANISMS
    // =========================================================================

    async fn mechanism(&self, request: MechanismRequest) -> SubsystemResult<MechanismPayload> {
        self.subsystems
            .mechanism
            .send(request)
            .await?
            .into_result(Subsystem::Mechanism)
    }

    pub async fn actuator_position(&self, actuator: &str) -> SubsystemResult<String> {
        match self
            .mechanism(MechanismRequest::Position {
                actuator: actuator.to_string(),
            })
            .await?
        {
            MechanismPayload::Position(position) => Ok(position),
            other => Err(SubsystemError::malformed_reply(
                Subsystem::Mechanism,
                format!("expected a position for {}, got {:?}", actuator, other),
            )),
        }
    }

    /// Move an actuator and wait until it reports the target position.
    ///
    /// A device error at any point fails immediately. On timeout the position
    /// is queried once more so a move that finished at the deadline is not
    /// reported as failed, and the last known position ends up in the error.
    pub async fn move_actuator(
        &self,
        actuator: &str,
        position: &str,
        poll_interval: Duration,
        timeout: Duration,
    ) -> SubsystemResult<()> {
        tracing::info!("Moving {} to {}", actuator, position);
        self.mechanism(MechanismRequest::Move {
            actuator: actuator.to_string(),
            position: position.to_string(),
        })
        .await?;

        let start = Instant::now();
        loop {
            let current = self.actuator_position(actuator).await?;
            if current == position {
                tracing::info!(
                    "{} reached {} after {:.1}s",
                    actuator,
                    position,
                    start.elapsed().as_secs_f64()
                );
                return Ok(());
            }

            if start.elapsed() >= timeout {
                let last_known = match self.actuator_position(actuator).await {
                    Ok(last) if last == position => return Ok(()),
                    Ok(last) => last,
                    Err(e) => {
                        tracing::warn!("Final position query for {} failed: {}", actuator, e);
                        "unknown".to_string()
                    }
                };
                tracing::warn!(
                    "{} did not reach {} within {:.1}s (last position {})",
                    actuator,
                    position,
                    timeout.as_secs_f64(),
                    last_known
                );
                return Err(SubsystemError::timeout(
                    Subsystem::Mechanism,
                    format!("move {} to {} (last position {})", actuator, position, last_known),
                    timeout,
                ));
            }

            tracing::debug!("{} at {}, waiting for {}", actuator, current, position);
            sleep(poll_interval).await;
        }
    }

    /// [`move_actuator`](Self::move_actuator) with the configured poll interval and timeout
    pub async fn move_configured(&self, actuator: &str, position: &str) -> SubsystemResult<()> {
        let mechanisms = &self.config.mechanisms;
        self.move_actuator(
            actuator,
            position,
            mechanisms.poll_interval(),
            mechanisms.move_timeout(actuator),
        )
        .await
    }

    pub async fn set_lamp(&self, lamp: &str, on: bool) -> SubsystemResult<()> {
        tracing::info!("Turning lamp {} {}", lamp, if on { "on" } else { "off" });
        self.mechanism(MechanismRequest::Lamp {
            lamp: lamp.to_string(),
            on,
        })
        .await?;
        Ok(())
    }

    /// Turn a lamp on and return the guard that turns it off again
    pub async fn lamp_on(self: &Arc<Self>, lamp: &str) -> SubsystemResult<LampGuard> {
        self.set_lamp(lamp, true).await?;
        Ok(LampGuard {
            hardware: Arc::clone(self),
            lamp: lamp.to_string(),
            released: false,
        })
    }

    /// Put the calibration mirror in the beam and return the guard that takes it out
    pub async fn mirror_in(self: &Arc<Self>) -> SubsystemResult<MirrorGuard> {
        let mechanisms = &self.config.mechanisms;
        let guard = MirrorGuard {
            hardware: Arc::clone(self),
            released: false,
        };
        // The guard exists before the move so a timeout mid-move still
        // sends the mirror back out.
        self.move_configured(&mechanisms.mirror_actuator, &mechanisms.mirror_in_position)
            .await?;
        Ok(guard)
    }

    async fn mirror_out(&self) -> SubsystemResult<()> {
        let mechanisms = &self.config.mechanisms;
        self.move_configured(&mechanisms.mirror_actuator, &mechanisms.mirror_out_position)
            .await
    }

    // =========================================================================
    // DETECTOR AND FITS HEADERS
    // =========================================================================

    async fn detector(&self, request: DetectorRequest) -> SubsystemResult<DetectorPayload> {
        self.subsystems
            .detector
            .send(request)
            .await?
            .into_result(Subsystem::Detector)
    }

    pub async fn configure_detector(&self, binning: Binning) -> SubsystemResult<()> {
        tracing::info!("Configuring detector binning {}", binning);
        self.detector(DetectorRequest::Configure { binning }).await?;
        Ok(())
    }

    pub async fn clear_headers(&self) -> SubsystemResult<()> {
        self.detector(DetectorRequest::ClearHeaders).await?;
        Ok(())
    }

    /// Push one card. Rejects an empty keyword or a missing value.
    pub async fn push_header(&self, keyword: &str, value: Option<HeaderValue>) -> SubsystemResult<()> {
        let card = HeaderCard::try_new(keyword, value)?;
        self.detector(DetectorRequest::SetHeaders(vec![card])).await?;
        Ok(())
    }

    async fn push_cards(&self, cards: HeaderList) -> SubsystemResult<()> {
        if cards.is_empty() {
            return Ok(());
        }
        tracing::debug!("Pushing {} FITS cards", cards.len());
        self.detector(DetectorRequest::SetHeaders(cards.into_cards()))
            .await?;
        Ok(())
    }

    /// Clear the header buffer and push the static cards from configuration
    pub async fn load_headers_from_config(&self) -> SubsystemResult<()> {
        self.clear_headers().await?;

        let mut cards = HeaderList::new();
        cards.set(HeaderCard::try_new(
            "INSTRUME",
            Some(self.config.instrument_name.as_str().into()),
        )?);
        for card in &self.config.fits.static_headers {
            let mut validated = HeaderCard::try_new(&card.keyword, Some(card.value.clone()))?;
            validated.comment = card.comment.clone();
            cards.set(validated);
        }
        self.push_cards(cards).await
    }

    /// Fetch the scheduler's cards and push them. Caches and returns OBJECT.
    pub async fn load_headers_from_scheduler(&self) -> SubsystemResult<Option<String>> {
        let pairs = match self.scheduler(SchedulerRequest::FitsHeaders).await? {
            SchedulerPayload::Headers(pairs) => pairs,
            other => {
                return Err(SubsystemError::malformed_reply(
                    Subsystem::Scheduler,
                    format!("expected FITS headers, got {:?}", other),
                ))
            }
        };

        let mut cards = HeaderList::new();
        for (keyword, value) in pairs {
            cards.set(HeaderCard::try_new(&keyword, value)?);
        }
        let object = cards.object_name().map(str::to_string);
        self.push_cards(cards).await?;

        tracing::debug!("Scheduler OBJECT: {:?}", object);
        *self.lock_object_name() = object.clone();
        Ok(object)
    }

    /// OBJECT value from the last scheduler fetch
    pub fn cached_object_name(&self) -> Option<String> {
        self.lock_object_name().clone()
    }

    /// Push OBSTYPE, and for calibration frames rewrite OBJECT so they are not
    /// confused with the science frames of the same observation.
    pub async fn push_frame_type(&self, frame_type: FrameType) -> SubsystemResult<()> {
        let mut cards = HeaderList::new();
        cards.set(HeaderCard::try_new("OBSTYPE", Some(frame_type.as_str().into()))?);
        if frame_type.is_calibration() {
            let object = self
                .cached_object_name()
                .unwrap_or_else(|| "CALIBRATION".to_string());
            cards.set(HeaderCard::try_new(
                OBJECT_KEYWORD,
                Some(format!("{}-{}", object, frame_type.as_str()).into()),
            )?);
        }
        self.push_cards(cards).await
    }

    fn lock_object_name(&self) -> std::sync::MutexGuard<'_, Option<String>> {
        self.object_name
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Take `count` frames; returns the filenames in order
    pub async fn multrun(
        &self,
        exposure_ms: u64,
        count: u32,
        frame_type: FrameType,
    ) -> SubsystemResult<Vec<String>> {
        tracing::info!("Multrun: {} x {}ms {}", count, exposure_ms, frame_type);
        match self
            .detector(DetectorRequest::Multrun {
                exposure_ms,
                count,
                frame_type,
            })
            .await?
        {
            DetectorPayload::Filenames(filenames) if !filenames.is_empty() => Ok(filenames),
            other => Err(SubsystemError::malformed_reply(
                Subsystem::Detector,
                format!("expected filenames from multrun, got {:?}", other),
            )),
        }
    }

    /// Single-frame multrun
    pub async fn expose(&self, exposure_ms: u64, frame_type: FrameType) -> SubsystemResult<String> {
        let mut filenames = self.multrun(exposure_ms, 1, frame_type).await?;
        filenames.pop().ok_or_else(|| {
            SubsystemError::malformed_reply(Subsystem::Detector, "multrun returned no filename")
        })
    }

    pub async fn abort_exposure(&self) -> SubsystemResult<()> {
        self.detector(DetectorRequest::Abort).await?;
        Ok(())
    }

    pub async fn detector_status(&self) -> SubsystemResult<DetectorStatus> {
        match self.detector(DetectorRequest::Status).await? {
            DetectorPayload::Status(status) => Ok(status),
            other => Err(SubsystemError::malformed_reply(
                Subsystem::Detector,
                format!("expected detector status, got {:?}", other),
            )),
        }
    }

    // =========================================================================
    // SCHEDULER (ISS)
    // =========================================================================

    async fn scheduler(&self, request: SchedulerRequest) -> SubsystemResult<SchedulerPayload> {
        self.subsystems
            .scheduler
            .send(request)
            .await?
            .into_result(Subsystem::Scheduler)
    }

    /// Absolute telescope offset on sky; (0, 0) returns to the nominal pointing
    pub async fn offset_ra_dec(&self, ra_arcsec: f64, dec_arcsec: f64) -> SubsystemResult<()> {
        tracing::info!("Offsetting telescope RA {:+.2}\" Dec {:+.2}\"", ra_arcsec, dec_arcsec);
        self.scheduler(SchedulerRequest::OffsetRaDec {
            ra_arcsec,
            dec_arcsec,
        })
        .await?;
        Ok(())
    }

    /// Cumulative telescope offset along the detector axes
    pub async fn offset_xy(&self, x_arcsec: f64, y_arcsec: f64) -> SubsystemResult<()> {
        tracing::info!("Offsetting telescope X {:+.2}\" Y {:+.2}\"", x_arcsec, y_arcsec);
        self.scheduler(SchedulerRequest::OffsetXY { x_arcsec, y_arcsec })
            .await?;
        Ok(())
    }

    pub async fn focus_offset(&self, offset_mm: f64) -> SubsystemResult<()> {
        tracing::info!("Requesting focus offset {:.3}mm", offset_mm);
        self.scheduler(SchedulerRequest::FocusOffset { offset_mm })
            .await?;
        Ok(())
    }

    // =========================================================================
    // PIPELINE (DP)
    // =========================================================================

    async fn pipeline(&self, request: PipelineRequest) -> SubsystemResult<PipelinePayload> {
        self.subsystems
            .pipeline
            .send(request)
            .await?
            .into_result(Subsystem::Pipeline)
    }

    pub async fn reduce(&self, filename: &str, wcs_fit: bool) -> SubsystemResult<ReductionResult> {
        tracing::debug!("Reducing {} (wcs fit: {})", filename, wcs_fit);
        match self
            .pipeline(PipelineRequest::Reduce {
                filename: filename.to_string(),
                wcs_fit,
            })
            .await?
        {
            PipelinePayload::Reduction(result) => Ok(result),
            other => Err(SubsystemError::malformed_reply(
                Subsystem::Pipeline,
                format!("expected a reduction of {}, got {:?}", filename, other),
            )),
        }
    }

    pub async fn reduce_calibration(&self, filename: &str) -> SubsystemResult<CalibrationReduction> {
        tracing::debug!("Reducing calibration frame {}", filename);
        match self
            .pipeline(PipelineRequest::ReduceCalibration {
                filename: filename.to_string(),
            })
            .await?
        {
            PipelinePayload::Calibration(result) => Ok(result),
            other => Err(SubsystemError::malformed_reply(
                Subsystem::Pipeline,
                format!("expected a calibration reduction of {}, got {:?}", filename, other),
            )),
        }
    }
}

// =============================================================================
// SCOPED GUARDS
// =============================================================================

/// Holds a lamp on. Call [`release`](Self::release) on every exit path;
/// dropping an unreleased guard spawns a best-effort lamp-off.
#[must_use = "the lamp stays on until the guard is released"]
pub struct LampGuard {
    hardware: SharedHardware,
    lamp: String,
    released: bool,
}

impl LampGuard {
    pub fn lamp(&self) -> &str {
        &self.lamp
    }

    /// Turn the lamp off. Runs at most once per guard.
    pub async fn release(mut self) -> SubsystemResult<()> {
        self.released = true;
        self.hardware.set_lamp(&self.lamp, false).await
    }
}

impl Drop for LampGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        tracing::warn!("Lamp {} guard dropped without release, turning it off", self.lamp);
        let hardware = Arc::clone(&self.hardware);
        let lamp = std::mem::take(&mut self.lamp);
        spawn_cleanup(async move {
            if let Err(e) = hardware.set_lamp(&lamp, false).await {
                tracing::error!("Failed to turn lamp {} off: {}", lamp, e);
            }
        });
    }
}

/// Holds the calibration mirror in the beam
#[must_use = "the mirror stays in the beam until the guard is released"]
pub struct MirrorGuard {
    hardware: SharedHardware,
    released: bool,
}

impl MirrorGuard {
    /// Move the mirror out of the beam. Runs at most once per guard.
    pub async fn release(mut self) -> SubsystemResult<()> {
        self.released = true;
        self.hardware.mirror_out().await
    }
}

impl Drop for MirrorGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        tracing::warn!("Mirror guard dropped without release, moving mirror out");
        let hardware = Arc::clone(&self.hardware);
        spawn_cleanup(async move {
            if let Err(e) = hardware.mirror_out().await {
                tracing::error!("Failed to move calibration mirror out: {}", e);
            }
        });
    }
}

fn spawn_cleanup<F>(cleanup: F)
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(cleanup);
        }
        Err(_) => tracing::error!("No runtime available for hardware cleanup"),
    }
}

/// Release a lamp and a mirror in that order, logging cleanup failures.
/// Used on every exit path of lamp-based exposures; a cleanup error never
/// replaces the command's own result.
pub async fn release_calibration_hardware(lamp: Option<LampGuard>, mirror: Option<MirrorGuard>) {
    if let Some(lamp) = lamp {
        let name = lamp.lamp().to_string();
        if let Err(e) = lamp.release().await {
            tracing::warn!("Cleanup: failed to turn lamp {} off: {}", name, e);
        }
    }
    if let Some(mirror) = mirror {
        if let Err(e) = mirror.release().await {
            tracing::warn!("Cleanup: failed to move calibration mirror out: {}", e);
        }
    }
}
