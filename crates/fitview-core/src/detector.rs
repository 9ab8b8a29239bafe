//! Landmark detector adapter and backend selection.
//!
//! Every backend implements [`LandmarkDetector`]; the [`DetectorSelector`]
//! tries them once each, in [`Backend::PRIORITY`] order, and adopts the first
//! one that loads and passes its readiness check.

use crate::capture::SharedDetector;
use crate::types::{Backend, Frame, LandmarkCountError, LandmarkSet};
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}; place the ONNX models in the model directory")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("unexpected model output: {0}")]
    UnexpectedOutput(String),
    #[error("readiness check failed: {0}")]
    NotReady(String),
    #[error("{0} initialization aborted")]
    InitAborted(Backend),
    #[error(transparent)]
    LandmarkCount(#[from] LandmarkCountError),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// A facial landmark backend.
///
/// Zero faces is a normal outcome reported as `Ok(None)`; errors are reserved
/// for inference failures. Only the primary face is returned.
pub trait LandmarkDetector: Send {
    fn backend(&self) -> Backend;

    fn detect(&mut self, frame: &Frame) -> Result<Option<LandmarkSet>, DetectorError>;
}

/// Loads one backend: resources, single-face configuration and readiness check.
pub trait BackendLoader: Send + Sync {
    fn backend(&self) -> Backend;

    fn load(&self) -> Result<Box<dyn LandmarkDetector>, DetectorError>;
}

/// Detector lifecycle within one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DetectorState {
    Uninitialized,
    Initializing,
    Ready(Backend),
    /// Every backend failed to initialize.
    Failed,
    /// Detection unavailable; measurements come from a user-supplied DP.
    ManualFallback,
}

impl DetectorState {
    pub fn is_ready(&self) -> bool {
        matches!(self, DetectorState::Ready(_))
    }
}

/// A backend that failed to initialize, with the cause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendFailure {
    pub backend: Backend,
    pub reason: String,
}

/// Tries backends in priority order and owns the adopted detector.
pub struct DetectorSelector {
    loaders: Vec<Arc<dyn BackendLoader>>,
    state: DetectorState,
    detector: Option<SharedDetector>,
    failures: Vec<BackendFailure>,
}

impl DetectorSelector {
    /// Loaders are sorted into [`Backend::PRIORITY`] order.
    pub fn new(mut loaders: Vec<Arc<dyn BackendLoader>>) -> Self {
        loaders.sort_by_key(|l| priority_rank(l.backend()));
        Self {
            loaders,
            state: DetectorState::Uninitialized,
            detector: None,
            failures: Vec::new(),
        }
    }

    pub fn state(&self) -> &DetectorState {
        &self.state
    }

    /// Backends that failed during the last initialization.
    pub fn failures(&self) -> &[BackendFailure] {
        &self.failures
    }

    /// The adopted detector, once `Ready`.
    pub fn detector(&self) -> Option<SharedDetector> {
        self.detector.clone()
    }

    /// Try each backend once, adopting the first that initializes.
    ///
    /// Loading runs on the blocking pool. Calling this again within the same
    /// session returns the settled state without retrying any backend; use
    /// [`reset`](Self::reset) to start over.
    pub async fn initialize(&mut self) -> DetectorState {
        if self.state != DetectorState::Uninitialized {
            tracing::debug!(state = ?self.state, "detector already initialized for this session");
            return self.state.clone();
        }

        self.transition(DetectorState::Initializing);
        self.failures.clear();

        for loader in &self.loaders {
            let backend = loader.backend();
            tracing::info!(backend = %backend, "initializing landmark backend");

            let task_loader = Arc::clone(loader);
            let result = tokio::task::spawn_blocking(move || task_loader.load())
                .await
                .unwrap_or_else(|e| {
                    tracing::error!(backend = %backend, error = %e, "backend loader task failed");
                    Err(DetectorError::InitAborted(backend))
                });

            match result {
                Ok(detector) if detector.backend() == backend => {
                    tracing::info!(backend = %backend, "landmark backend adopted");
                    self.detector = Some(Arc::new(Mutex::new(detector)));
                    self.state = DetectorState::Ready(backend);
                    return self.state.clone();
                }
                Ok(detector) => {
                    let reason = format!("loader returned a {} detector", detector.backend());
                    tracing::warn!(backend = %backend, %reason, "backend initialization failed");
                    self.failures.push(BackendFailure { backend, reason });
                }
                Err(e) => {
                    tracing::warn!(backend = %backend, error = %e, "backend initialization failed; trying next");
                    self.failures.push(BackendFailure {
                        backend,
                        reason: e.to_string(),
                    });
                }
            }
        }

        self.transition(DetectorState::Failed);
        tracing::warn!(
            failed = self.failures.len(),
            "no landmark backend available; switching to manual fallback"
        );
        self.transition(DetectorState::ManualFallback);
        self.state.clone()
    }

    /// Drop the adopted detector so the next `initialize` starts from the top.
    pub fn reset(&mut self) {
        self.detector = None;
        self.failures.clear();
        self.transition(DetectorState::Uninitialized);
    }

    fn transition(&mut self, next: DetectorState) {
        tracing::debug!(from = ?self.state, to = ?next, "detector state");
        self.state = next;
    }
}

fn priority_rank(backend: Backend) -> usize {
    Backend::PRIORITY
        .iter()
        .position(|b| *b == backend)
        .unwrap_or(Backend::PRIORITY.len())
}
