mod config;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use config::Config;
use fitview_core::fallback::RECOMMENDED_DP_RANGE_MM;
use fitview_core::{
    default_loaders, estimate_from_dp, rescale, CancelToken, CaptureController, Calibrator,
    DetectorSelector, DetectorState, DpStore, JsonDpStore, LandmarkTables,
    MeasurementSession, MeasurementSet,
};
use fitview_hw::Camera;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "fitview", about = "Facial measurements for eyewear fitting")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Capture frames and measure the face
    Measure {
        /// Pupillary distance (mm) to use if automatic measurement is unavailable
        #[arg(long, value_parser = parse_dp)]
        dp: Option<f64>,
        /// Rescale the result to this pupillary distance (mm) before printing
        #[arg(long, value_parser = parse_dp)]
        adjust: Option<f64>,
        /// Remember the resulting pupillary distance
        #[arg(long)]
        save: bool,
    },
    /// Estimate measurements from a known pupillary distance
    Estimate {
        /// Pupillary distance in mm (defaults to the last saved value)
        #[arg(long, value_parser = parse_dp)]
        dp: Option<f64>,
        /// Remember the pupillary distance
        #[arg(long)]
        save: bool,
    },
    /// Rescale an existing measurement set to a new pupillary distance
    Rescale {
        #[arg(long)]
        dp: i32,
        #[arg(long)]
        face_width: i32,
        #[arg(long)]
        lens_height: i32,
        #[arg(long)]
        temple_width: i32,
        #[arg(long)]
        nose_length: Option<i32>,
        /// Target pupillary distance in mm
        #[arg(long)]
        new_dp: f64,
    },
    /// Try each landmark backend and report which one is used
    Backends,
    /// List video capture devices
    Devices,
}

fn parse_dp(s: &str) -> Result<f64, String> {
    let dp: f64 = s.parse().map_err(|e| format!("{e}"))?;
    if !RECOMMENDED_DP_RANGE_MM.contains(&dp) {
        return Err(format!(
            "pupillary distance must be between {} and {} mm",
            RECOMMENDED_DP_RANGE_MM.start(),
            RECOMMENDED_DP_RANGE_MM.end()
        ));
    }
    Ok(dp)
}

fn calibrator(config: &Config) -> Result<Calibrator> {
    let tables = match &config.landmark_tables {
        Some(dir) => LandmarkTables::load_dir(dir)
            .with_context(|| format!("loading landmark tables from {}", dir.display()))?,
        None => LandmarkTables::embedded()?.clone(),
    };
    Ok(Calibrator::new(config.calibration_config(), tables))
}

fn print_json(value: &serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Manual estimate without a camera: explicit DP, stored DP, then baseline.
fn estimate(store: &dyn DpStore, dp: Option<f64>, save: bool) -> Result<MeasurementSet> {
    let dp = dp
        .or_else(|| store.load())
        .unwrap_or(fitview_core::fallback::BASELINE_DP_MM);
    let measurements = estimate_from_dp(dp);
    if save {
        store.save(f64::from(measurements.dp))?;
    }
    Ok(measurements)
}

async fn measure(config: &Config, dp: Option<f64>, adjust: Option<f64>, save: bool) -> Result<()> {
    let store: Arc<dyn DpStore> = Arc::new(JsonDpStore::new(&config.store_path));

    let camera = match Camera::open(&config.camera_device) {
        Ok(camera) => camera,
        Err(e) => {
            tracing::warn!(device = %config.camera_device, error = %e, "camera unavailable; using manual estimate");
            let mut measurements = estimate(store.as_ref(), dp, false)?;
            if let Some(new_dp) = adjust {
                measurements = rescale(&measurements, new_dp)?;
            }
            if save {
                store.save(f64::from(measurements.dp))?;
            }
            return print_json(&serde_json::json!({
                "source": { "kind": "manual" },
                "adjusted": adjust.is_some(),
                "measurements": measurements,
            }));
        }
    };
    camera.warmup(config.warmup_frames)?;

    let capture = CaptureController::new(config.capture_config());
    let selector = DetectorSelector::new(default_loaders(&config.model_paths()));
    let mut session = MeasurementSession::new(
        selector,
        Box::new(camera),
        capture,
        calibrator(config)?,
        store,
    );

    let cancel = CancelToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupted, cancelling capture");
            ctrl_c.cancel();
        }
    });

    let mut calibration = None;
    match session.initialize().await {
        DetectorState::Ready(backend) => {
            tracing::info!(backend = backend.name(), "measuring");
            match session.measure(&cancel).await {
                Ok(c) => calibration = Some(c),
                Err(e) if cancel.is_cancelled() => bail!("measurement cancelled: {e}"),
                Err(e) => {
                    tracing::warn!(error = %e, "automatic measurement failed; using manual estimate");
                    session.estimate_manual(dp);
                }
            }
        }
        state => {
            for failure in session.selector().failures() {
                tracing::warn!(backend = failure.backend.name(), reason = %failure.reason, "backend unavailable");
            }
            tracing::warn!(?state, "no landmark backend; using manual estimate");
            session.estimate_manual(dp);
        }
    }

    if let Some(new_dp) = adjust {
        session.adjust(new_dp)?;
    }

    let current = if save {
        let saved = session.save()?;
        serde_json::to_value(saved)?
    } else {
        serde_json::to_value(session.current())?
    };

    print_json(&serde_json::json!({
        "session": session.id().to_string(),
        "result": current,
        "calibration": calibration,
    }))
}

async fn backends(config: &Config) -> Result<()> {
    let mut selector = DetectorSelector::new(default_loaders(&config.model_paths()));
    let state = selector.initialize().await;

    let failures: Vec<_> = selector
        .failures()
        .iter()
        .map(|f| serde_json::json!({ "backend": f.backend, "reason": f.reason }))
        .collect();
    let adopted = match state {
        DetectorState::Ready(backend) => Some(backend),
        _ => None,
    };
    print_json(&serde_json::json!({
        "modelDir": config.model_dir.display().to_string(),
        "adopted": adopted,
        "failures": failures,
    }))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::from_env();

    match cli.command {
        Commands::Measure { dp, adjust, save } => measure(&config, dp, adjust, save).await?,
        Commands::Estimate { dp, save } => {
            let store = JsonDpStore::new(&config.store_path);
            let measurements = estimate(&store, dp, save)?;
            print_json(&serde_json::to_value(measurements)?)?;
        }
        Commands::Rescale {
            dp,
            face_width,
            lens_height,
            temple_width,
            nose_length,
            new_dp,
        } => {
            let current = MeasurementSet {
                dp,
                face_width,
                lens_height,
                temple_width,
                nose_length,
            };
            print_json(&serde_json::to_value(rescale(&current, new_dp)?)?)?;
        }
        Commands::Backends => backends(&config).await?,
        Commands::Devices => {
            let devices = Camera::list_devices();
            if devices.is_empty() {
                println!("No video capture devices found");
            }
            for d in devices {
                println!("{}  {} ({}, {})", d.path, d.name, d.driver, d.bus);
            }
        }
    }

    Ok(())
}
