//! fitview-core — Facial measurement estimation engine.
//!
//! Captures a short burst of frames, runs a facial landmark backend on each,
//! and converts the averaged pixel geometry to millimetres using the iris as
//! a reference. When no backend is available, measurements are estimated
//! from a user-supplied pupillary distance.

pub mod backends;
pub mod calibrator;
pub mod capture;
pub mod detector;
pub mod fallback;
pub mod landmarks;
pub mod session;
pub mod store;
pub mod types;

#[cfg(test)]
mod test_support;

use std::path::PathBuf;

pub use backends::{default_loaders, ModelPaths};
pub use calibrator::{calibrate, Calibration, CalibrationConfig, CalibrationError, Calibrator};
pub use capture::{
    CancelToken, CaptureConfig, CaptureController, CaptureError, CaptureSample, FrameSource,
    FrameSourceError, SharedDetector, SharedFrameSource,
};
pub use detector::{BackendLoader, DetectorError, DetectorSelector, DetectorState, LandmarkDetector};
pub use fallback::{estimate_from_dp, rescale, AdjustError};
pub use landmarks::{LandmarkTables, TableError};
pub use session::{MeasurementSession, MeasurementSource, SavedMeasurement, SessionError};
pub use store::{DpStore, JsonDpStore, MemoryDpStore, StoreError};
pub use types::{Backend, Frame, LandmarkSet, MeasurementSet, Point};

/// Default ONNX model directory: `$XDG_DATA_HOME/fitview/models`, falling
/// back to `~/.local/share/fitview/models`.
pub fn default_model_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("fitview")
        .join("models")
}
