//! One measurement session: detector initialization, capture, calibration,
//! manual fallback, user adjustment and saving.

use crate::calibrator::{Calibration, CalibrationError, Calibrator};
use crate::capture::{CancelToken, CaptureController, CaptureError, FrameSource, SharedFrameSource};
use crate::detector::{DetectorSelector, DetectorState};
use crate::fallback::{estimate_from_dp, rescale, AdjustError, BASELINE_DP_MM};
use crate::store::DpStore;
use crate::types::{Backend, MeasurementSet};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::Instrument;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("detector not ready ({0:?})")]
    NotReady(DetectorState),
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error(transparent)]
    Calibration(#[from] CalibrationError),
    #[error(transparent)]
    Adjust(#[from] AdjustError),
    #[error("no measurement to adjust or save")]
    NothingToSave,
}

/// Where a measurement set came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum MeasurementSource {
    Automatic { backend: Backend },
    Manual,
}

/// The current, not yet saved result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CurrentMeasurement {
    pub measurements: MeasurementSet,
    pub source: MeasurementSource,
    /// The user overrode the DP after estimation.
    pub adjusted: bool,
}

/// Snapshot accepted by the user.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedMeasurement {
    pub measurements: MeasurementSet,
    pub source: MeasurementSource,
    pub adjusted: bool,
    pub saved_at: DateTime<Utc>,
}

pub struct MeasurementSession {
    id: Uuid,
    selector: DetectorSelector,
    source: SharedFrameSource,
    capture: CaptureController,
    calibrator: Calibrator,
    store: Arc<dyn DpStore>,
    current: Option<CurrentMeasurement>,
    saved: Option<SavedMeasurement>,
}

impl MeasurementSession {
    pub fn new(
        selector: DetectorSelector,
        source: Box<dyn FrameSource>,
        capture: CaptureController,
        calibrator: Calibrator,
        store: Arc<dyn DpStore>,
    ) -> Self {
        let id = Uuid::new_v4();
        tracing::debug!(session = %id, "measurement session created");
        Self {
            id,
            selector,
            source: Arc::new(Mutex::new(source)),
            capture,
            calibrator,
            store,
            current: None,
            saved: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> &DetectorState {
        self.selector.state()
    }

    pub fn selector(&self) -> &DetectorSelector {
        &self.selector
    }

    pub fn current(&self) -> Option<&CurrentMeasurement> {
        self.current.as_ref()
    }

    pub fn saved(&self) -> Option<&SavedMeasurement> {
        self.saved.as_ref()
    }

    /// Bring up a landmark backend, or settle on manual fallback.
    pub async fn initialize(&mut self) -> DetectorState {
        let span = tracing::info_span!("initialize", session = %self.id);
        self.selector.initialize().instrument(span).await
    }

    /// Capture a sample and calibrate it.
    ///
    /// Rejected with `NotReady` unless a backend has been adopted; nothing is
    /// queued. A failed or cancelled capture leaves the previous result alone.
    pub async fn measure(&mut self, cancel: &CancelToken) -> Result<Calibration, SessionError> {
        let span = tracing::info_span!("measure", session = %self.id);
        let Some(detector) = self.selector.detector() else {
            return Err(SessionError::NotReady(self.selector.state().clone()));
        };

        let sample = self
            .capture
            .capture_sample(&self.source, &detector, cancel)
            .instrument(span.clone())
            .await?;

        let calibration = span.in_scope(|| self.calibrator.calibrate(&sample))?;
        self.current = Some(CurrentMeasurement {
            measurements: calibration.measurements,
            source: MeasurementSource::Automatic {
                backend: calibration.backend,
            },
            adjusted: false,
        });
        Ok(calibration)
    }

    /// Manual estimate from `dp_mm`, defaulting to the stored DP and then to
    /// the population baseline. Never fails.
    pub fn estimate_manual(&mut self, dp_mm: Option<f64>) -> MeasurementSet {
        let dp = dp_mm
            .or_else(|| self.store.load())
            .unwrap_or(BASELINE_DP_MM);
        let measurements = estimate_from_dp(dp);
        tracing::info!(session = %self.id, dp, "manual estimate");
        self.current = Some(CurrentMeasurement {
            measurements,
            source: MeasurementSource::Manual,
            adjusted: false,
        });
        measurements
    }

    /// Rescale the current result to a user-corrected DP.
    pub fn adjust(&mut self, new_dp: f64) -> Result<MeasurementSet, SessionError> {
        let current = self.current.as_mut().ok_or(SessionError::NothingToSave)?;
        let rescaled = rescale(&current.measurements, new_dp)?;
        tracing::info!(
            session = %self.id,
            from = current.measurements.dp,
            to = rescaled.dp,
            "measurement adjusted"
        );
        current.measurements = rescaled;
        current.adjusted = true;
        Ok(rescaled)
    }

    /// Accept the current result. The DP is persisted best-effort; a store
    /// failure is logged and does not fail the save.
    pub fn save(&mut self) -> Result<SavedMeasurement, SessionError> {
        let current = self.current.as_ref().ok_or(SessionError::NothingToSave)?;
        let saved = SavedMeasurement {
            measurements: current.measurements,
            source: current.source,
            adjusted: current.adjusted,
            saved_at: Utc::now(),
        };
        if let Err(e) = self.store.save(f64::from(saved.measurements.dp)) {
            tracing::warn!(session = %self.id, error = %e, "failed to persist dp");
        }
        tracing::info!(session = %self.id, dp = saved.measurements.dp, "measurement saved");
        self.saved = Some(saved.clone());
        Ok(saved)
    }

    /// Discard results and reset the detector so the next `initialize`
    /// starts from the top of the priority order.
    pub fn redo(&mut self) {
        tracing::info!(session = %self.id, "redo requested");
        self.current = None;
        self.saved = None;
        self.selector.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibrator::CalibrationConfig;
    use crate::capture::CaptureConfig;
    use crate::store::{MemoryDpStore, StoreError};
    use crate::test_support::{loaders, ScriptedLoader, ScriptedSource};
    use std::sync::atomic::Ordering;

    struct BrokenStore;

    impl DpStore for BrokenStore {
        fn load(&self) -> Option<f64> {
            None
        }

        fn save(&self, _dp_mm: f64) -> Result<(), StoreError> {
            Err(StoreError::InvalidDp(f64::NAN))
        }
    }

    fn session(loader_list: &[&Arc<ScriptedLoader>], store: Arc<dyn DpStore>) -> MeasurementSession {
        MeasurementSession::new(
            DetectorSelector::new(loaders(loader_list)),
            Box::new(ScriptedSource::new()),
            CaptureController::default(),
            Calibrator::with_embedded_tables(CalibrationConfig::default()).unwrap(),
            store,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_measure_before_initialize_is_rejected() {
        let mesh = ScriptedLoader::succeeding(Backend::Mesh);
        let mut s = session(&[&mesh], Arc::new(MemoryDpStore::new()));
        let err = s.measure(&CancelToken::new()).await.unwrap_err();
        assert!(matches!(err, SessionError::NotReady(DetectorState::Uninitialized)));
        assert_eq!(mesh.attempts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_measure_adjust_save() {
        let mesh = ScriptedLoader::succeeding(Backend::Mesh);
        let store = Arc::new(MemoryDpStore::new());
        let mut s = session(&[&mesh], store.clone());

        assert_eq!(s.initialize().await, DetectorState::Ready(Backend::Mesh));
        let calibration = s.measure(&CancelToken::new()).await.unwrap();
        assert_eq!(calibration.measurements.dp, 62);
        assert_eq!(calibration.frames, 5);

        let adjusted = s.adjust(64.0).unwrap();
        assert_eq!(adjusted.dp, 64);
        assert_eq!(adjusted.temple_width, 134);

        let saved = s.save().unwrap();
        assert_eq!(saved.source, MeasurementSource::Automatic { backend: Backend::Mesh });
        assert!(saved.adjusted);
        assert_eq!(store.load(), Some(64.0));
        assert_eq!(s.saved(), Some(&saved));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missed_face_keeps_previous_result() {
        let mesh = ScriptedLoader::with_script(Backend::Mesh, &[true, true, true, true, true, false]);
        let mut s = session(&[&mesh], Arc::new(MemoryDpStore::new()));
        s.initialize().await;

        let first = s.measure(&CancelToken::new()).await.unwrap();
        let err = s.measure(&CancelToken::new()).await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::Capture(CaptureError::NoFaceDetected { frame_index: 0 })
        ));
        assert_eq!(s.current().unwrap().measurements, first.measurements);
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_sample_fails_calibration() {
        let mesh = ScriptedLoader::succeeding(Backend::Mesh);
        let mut s = MeasurementSession::new(
            DetectorSelector::new(loaders(&[&mesh])),
            Box::new(ScriptedSource::new()),
            CaptureController::new(CaptureConfig {
                target_count: 2,
                minimum_viable: 1,
                ..CaptureConfig::default()
            }),
            Calibrator::with_embedded_tables(CalibrationConfig::default()).unwrap(),
            Arc::new(MemoryDpStore::new()),
        );
        s.initialize().await;

        let err = s.measure(&CancelToken::new()).await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::Calibration(CalibrationError::InsufficientFrames { got: 2, minimum: 3 })
        ));
        assert!(s.current().is_none());
    }

    #[tokio::test]
    async fn test_manual_fallback_uses_stored_dp() {
        let mesh = ScriptedLoader::failing(Backend::Mesh);
        let multibox = ScriptedLoader::failing(Backend::MultiBox);
        let point68 = ScriptedLoader::failing(Backend::Point68);
        let store = Arc::new(MemoryDpStore::with_value(66.0));
        let mut s = session(&[&mesh, &multibox, &point68], store.clone());

        assert_eq!(s.initialize().await, DetectorState::ManualFallback);
        assert!(matches!(
            s.measure(&CancelToken::new()).await,
            Err(SessionError::NotReady(DetectorState::ManualFallback))
        ));

        let m = s.estimate_manual(None);
        assert_eq!(m.dp, 66);
        assert_eq!(m.nose_length, None);
        assert_eq!(s.estimate_manual(Some(62.0)).face_width, 140);

        let saved = s.save().unwrap();
        assert_eq!(saved.source, MeasurementSource::Manual);
        assert_eq!(store.load(), Some(62.0));
    }

    #[test]
    fn test_manual_defaults_to_baseline() {
        let mut s = session(&[], Arc::new(MemoryDpStore::new()));
        assert_eq!(s.estimate_manual(None).dp, 62);
    }

    #[test]
    fn test_store_failure_does_not_fail_save() {
        let mut s = session(&[], Arc::new(BrokenStore));
        s.estimate_manual(Some(60.0));
        let saved = s.save().unwrap();
        assert_eq!(saved.measurements.dp, 60);
    }

    #[test]
    fn test_nothing_to_save_or_adjust() {
        let mut s = session(&[], Arc::new(MemoryDpStore::new()));
        assert!(matches!(s.save(), Err(SessionError::NothingToSave)));
        assert!(matches!(s.adjust(64.0), Err(SessionError::NothingToSave)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_redo_clears_and_reinitializes() {
        let mesh = ScriptedLoader::succeeding(Backend::Mesh);
        let mut s = session(&[&mesh], Arc::new(MemoryDpStore::new()));
        s.initialize().await;
        s.measure(&CancelToken::new()).await.unwrap();
        s.save().unwrap();

        s.redo();
        assert!(s.current().is_none());
        assert!(s.saved().is_none());
        assert_eq!(s.state(), &DetectorState::Uninitialized);

        assert_eq!(s.initialize().await, DetectorState::Ready(Backend::Mesh));
        assert_eq!(mesh.attempts.load(Ordering::SeqCst), 2);
    }
}
