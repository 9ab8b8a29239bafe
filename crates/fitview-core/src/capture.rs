//! Multi-frame capture: repeated frame + detect cycles building a sample.
//!
//! Cycles are strictly sequential. Each frame grab + detection runs on the
//! blocking pool and, like the inter-frame delay, is raced against
//! cancellation. A frame without a detected face aborts the whole sample.

use crate::detector::{DetectorError, LandmarkDetector};
use crate::types::{Backend, Frame, LandmarkSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

const DEFAULT_TARGET_FRAMES: usize = 5;
const DEFAULT_MINIMUM_FRAMES: usize = 3;
const DEFAULT_INTER_FRAME_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum FrameSourceError {
    #[error("frame source unavailable: {0}")]
    Unavailable(String),
}

/// Supplier of still frames, e.g. a live camera.
pub trait FrameSource: Send {
    fn next_frame(&mut self) -> Result<Frame, FrameSourceError>;
}

/// Frame source owned by a session and lent to each capture step.
pub type SharedFrameSource = Arc<Mutex<Box<dyn FrameSource>>>;

/// Adopted detector, lent to each capture step like the frame source.
pub type SharedDetector = Arc<Mutex<Box<dyn LandmarkDetector>>>;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("no face detected in frame {frame_index}")]
    NoFaceDetected { frame_index: usize },
    #[error("camera unavailable: {0}")]
    CaptureUnavailable(String),
    #[error("capture cancelled")]
    Cancelled,
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("invalid capture config: {0}")]
    InvalidConfig(String),
    #[error("{found} landmarks cannot join a {expected} sample")]
    MixedBackends { expected: Backend, found: Backend },
    #[error("capture worker failed: {0}")]
    Worker(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureConfig {
    /// Successful frames collected before a sample is complete.
    pub target_count: usize,
    /// Smallest sample worth calibrating; `target_count` may not be below it.
    pub minimum_viable: usize,
    pub inter_frame_delay: Duration,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            target_count: DEFAULT_TARGET_FRAMES,
            minimum_viable: DEFAULT_MINIMUM_FRAMES,
            inter_frame_delay: DEFAULT_INTER_FRAME_DELAY,
        }
    }
}

impl CaptureConfig {
    pub fn validate(&self) -> Result<(), CaptureError> {
        if self.minimum_viable == 0 {
            return Err(CaptureError::InvalidConfig(
                "minimum_viable must be at least 1".into(),
            ));
        }
        if self.target_count < self.minimum_viable {
            return Err(CaptureError::InvalidConfig(format!(
                "target_count {} is below minimum_viable {}",
                self.target_count, self.minimum_viable
            )));
        }
        Ok(())
    }
}

/// A frame together with the face detected in it.
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    pub frame: Frame,
    pub landmarks: LandmarkSet,
}

/// Frames with successful detections, all from the same backend.
#[derive(Debug, Clone, Default)]
pub struct CaptureSample {
    frames: Vec<CapturedFrame>,
}

impl CaptureSample {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, frame: Frame, landmarks: LandmarkSet) -> Result<(), CaptureError> {
        if let Some(expected) = self.backend() {
            if landmarks.backend() != expected {
                return Err(CaptureError::MixedBackends {
                    expected,
                    found: landmarks.backend(),
                });
            }
        }
        self.frames.push(CapturedFrame { frame, landmarks });
        Ok(())
    }

    /// Backend of the sample; `None` while empty.
    pub fn backend(&self) -> Option<Backend> {
        self.frames.first().map(|f| f.landmarks.backend())
    }

    pub fn frames(&self) -> &[CapturedFrame] {
        &self.frames
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn last(&self) -> Option<&CapturedFrame> {
        self.frames.last()
    }
}

/// Cloneable cancellation signal for an in-flight capture.
#[derive(Clone, Debug)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once [`cancel`](Self::cancel) has been called.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

/// Drives capture + detect cycles into a [`CaptureSample`].
#[derive(Debug, Clone, Default)]
pub struct CaptureController {
    config: CaptureConfig,
}

impl CaptureController {
    pub fn new(config: CaptureConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    /// Build a fresh sample of `target_count` detections.
    ///
    /// Fails with `NoFaceDetected` on the first frame without a face and with
    /// `CaptureUnavailable` when the source cannot produce a frame. On
    /// cancellation the partial sample is dropped immediately, even while a
    /// frame grab or detection is still running; that step finishes in the
    /// background and releases the source and detector when done.
    pub async fn capture_sample(
        &self,
        source: &SharedFrameSource,
        detector: &SharedDetector,
        cancel: &CancelToken,
    ) -> Result<CaptureSample, CaptureError> {
        self.config.validate()?;
        let target = self.config.target_count;
        let mut sample = CaptureSample::new();

        for frame_index in 0..target {
            if cancel.is_cancelled() {
                tracing::info!(captured = sample.len(), "capture cancelled; discarding partial sample");
                return Err(CaptureError::Cancelled);
            }

            let step = tokio::task::spawn_blocking({
                let source = Arc::clone(source);
                let detector = Arc::clone(detector);
                move || grab_and_detect(&source, &detector)
            });

            let (frame, found) = tokio::select! {
                joined = step => joined.map_err(|e| CaptureError::Worker(e.to_string()))??,
                _ = cancel.cancelled() => {
                    tracing::info!(captured = sample.len(), "capture cancelled mid-frame; discarding partial sample");
                    return Err(CaptureError::Cancelled);
                }
            };

            let Some(landmarks) = found else {
                tracing::warn!(frame = frame_index, "no face detected; aborting sample");
                return Err(CaptureError::NoFaceDetected { frame_index });
            };

            sample.push(frame, landmarks)?;
            tracing::debug!(frame = frame_index, captured = sample.len(), target, "frame captured");

            if sample.len() < target {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.inter_frame_delay) => {}
                    _ = cancel.cancelled() => {
                        tracing::info!(captured = sample.len(), "capture cancelled; discarding partial sample");
                        return Err(CaptureError::Cancelled);
                    }
                }
            }
        }

        tracing::info!(
            frames = sample.len(),
            backend = ?sample.backend(),
            "capture sample complete"
        );
        Ok(sample)
    }
}

/// One blocking frame + detect cycle.
fn grab_and_detect(
    source: &SharedFrameSource,
    detector: &SharedDetector,
) -> Result<(Frame, Option<LandmarkSet>), CaptureError> {
    let frame = {
        let mut source = source
            .lock()
            .map_err(|_| CaptureError::Worker("frame source lock poisoned".into()))?;
        source
            .next_frame()
            .map_err(|e| CaptureError::CaptureUnavailable(e.to_string()))?
    };
    let mut detector = detector
        .lock()
        .map_err(|_| CaptureError::Worker("detector lock poisoned".into()))?;
    let found = detector.detect(&frame)?;
    Ok((frame, found))
}
