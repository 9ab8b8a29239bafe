use fitview_core::{CalibrationConfig, CaptureConfig, ModelPaths};
use std::path::PathBuf;
use std::time::Duration;

/// CLI configuration, loaded from environment variables.
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// JSON file holding the last confirmed pupillary distance.
    pub store_path: PathBuf,
    /// Frames with a detected face per measurement.
    pub target_frames: usize,
    /// Smallest sample accepted for calibration.
    pub minimum_frames: usize,
    /// Delay between capture cycles.
    pub inter_frame_delay_ms: u64,
    /// Number of warmup frames to discard after opening the camera (AGC/AE stabilization).
    pub warmup_frames: usize,
    /// Optional directory of `<backend>.toml` landmark table overrides.
    pub landmark_tables: Option<PathBuf>,
}

impl Config {
    /// Load configuration from `FITVIEW_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let model_dir = std::env::var("FITVIEW_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| fitview_core::default_model_dir());

        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("fitview");

        let store_path = std::env::var("FITVIEW_STORE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("last_dp.json"));

        Self {
            camera_device: std::env::var("FITVIEW_CAMERA_DEVICE")
                .unwrap_or_else(|_| "/dev/video0".to_string()),
            model_dir,
            store_path,
            target_frames: env_usize("FITVIEW_TARGET_FRAMES", 5),
            minimum_frames: env_usize("FITVIEW_MINIMUM_FRAMES", 3),
            inter_frame_delay_ms: env_u64("FITVIEW_INTER_FRAME_DELAY_MS", 500),
            warmup_frames: env_usize("FITVIEW_WARMUP_FRAMES", 4),
            landmark_tables: std::env::var("FITVIEW_LANDMARK_TABLES").ok().map(PathBuf::from),
        }
    }

    pub fn model_paths(&self) -> ModelPaths {
        ModelPaths::in_dir(&self.model_dir)
    }

    pub fn capture_config(&self) -> CaptureConfig {
        CaptureConfig {
            target_count: self.target_frames,
            minimum_viable: self.minimum_frames,
            inter_frame_delay: Duration::from_millis(self.inter_frame_delay_ms),
        }
    }

    pub fn calibration_config(&self) -> CalibrationConfig {
        CalibrationConfig {
            minimum_frames: self.minimum_frames,
            ..CalibrationConfig::default()
        }
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
