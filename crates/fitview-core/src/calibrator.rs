//! Pixel → millimetre calibration against the human iris.
//!
//! Per-frame raw distances are measured with the backend's landmark table,
//! averaged across the sample, and scaled by `12 mm / mean iris width`. The
//! result is a pure function of the sample and the table.

use crate::capture::CaptureSample;
use crate::landmarks::{LandmarkTable, LandmarkTables, TableError};
use crate::types::{round_mm, Backend, LandmarkSet, MeasurementSet};
use serde::Serialize;
use std::ops::RangeInclusive;
use thiserror::Error;

/// Average adult iris diameter; stable across the population.
pub const IRIS_DIAMETER_MM: f64 = 12.0;

const DEFAULT_MINIMUM_FRAMES: usize = 3;

#[derive(Debug, Error)]
pub enum CalibrationError {
    #[error("capture sample is empty")]
    EmptySample,
    #[error("sample has {got} frames, need at least {minimum}")]
    InsufficientFrames { got: usize, minimum: usize },
    #[error("degenerate scale: mean iris width {mean_iris_px} px")]
    DegenerateScale { mean_iris_px: f64 },
    #[error("non-finite {field} distance in sample")]
    NonFiniteDistance { field: &'static str },
    #[error("{found} landmarks in a {expected} sample")]
    MixedBackends { expected: Backend, found: Backend },
    #[error(transparent)]
    Table(#[from] TableError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationConfig {
    pub iris_diameter_mm: f64,
    /// Fewer frames than this are rejected rather than averaged.
    pub minimum_frames: usize,
    /// Expected face-width range; values outside only annotate the result.
    pub face_width_range_mm: RangeInclusive<f64>,
    /// Expected nose-length range; values outside only annotate the result.
    pub nose_length_range_mm: RangeInclusive<f64>,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            iris_diameter_mm: IRIS_DIAMETER_MM,
            minimum_frames: DEFAULT_MINIMUM_FRAMES,
            face_width_range_mm: 25.0..=35.0,
            nose_length_range_mm: 35.0..=45.0,
        }
    }
}

/// Raw distances of one frame (pixels) or their scaled mean (mm).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RawDistances {
    pub iris_width: f64,
    pub dp: f64,
    pub face_width: f64,
    pub lens_height: f64,
    pub temple_width: f64,
    pub nose_length: f64,
}

impl RawDistances {
    /// Measure one detection in a `width` × `height` frame.
    pub fn measure(
        table: &LandmarkTable,
        landmarks: &LandmarkSet,
        width: f64,
        height: f64,
    ) -> Result<Self, TableError> {
        let d = &table.distances;
        Ok(Self {
            iris_width: d.iris_width.measure(table, landmarks, width, height)?,
            dp: d.dp.measure(table, landmarks, width, height)?,
            face_width: d.face_width.measure(table, landmarks, width, height)?,
            lens_height: d.lens_height.measure(table, landmarks, width, height)?,
            temple_width: d.temple_width.measure(table, landmarks, width, height)?,
            nose_length: d.nose_length.measure(table, landmarks, width, height)?,
        })
    }

    fn fields(&self) -> [(&'static str, f64); 6] {
        [
            ("iris_width", self.iris_width),
            ("dp", self.dp),
            ("face_width", self.face_width),
            ("lens_height", self.lens_height),
            ("temple_width", self.temple_width),
            ("nose_length", self.nose_length),
        ]
    }

    fn map(&self, f: impl Fn(f64) -> f64) -> Self {
        Self {
            iris_width: f(self.iris_width),
            dp: f(self.dp),
            face_width: f(self.face_width),
            lens_height: f(self.lens_height),
            temple_width: f(self.temple_width),
            nose_length: f(self.nose_length),
        }
    }

    fn add(&mut self, other: &Self) {
        self.iris_width += other.iris_width;
        self.dp += other.dp;
        self.face_width += other.face_width;
        self.lens_height += other.lens_height;
        self.temple_width += other.temple_width;
        self.nose_length += other.nose_length;
    }

    fn first_non_finite(&self) -> Option<&'static str> {
        self.fields()
            .into_iter()
            .find(|(_, v)| !v.is_finite())
            .map(|(name, _)| name)
    }
}

/// Warning attached to a plausible-looking but suspicious calibration.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum PlausibilityFlag {
    FaceWidthOutOfRange { mm: f64 },
    NoseLengthOutOfRange { mm: f64 },
}

/// Result of calibrating one capture sample.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Calibration {
    pub measurements: MeasurementSet,
    pub backend: Backend,
    pub frames: usize,
    /// Millimetres per pixel.
    pub scale_mm_per_px: f64,
    /// Sample mean of the raw pixel distances.
    pub mean_pixels: RawDistances,
    pub flags: Vec<PlausibilityFlag>,
}

impl Calibration {
    /// The caller should offer manual review.
    pub fn is_low_confidence(&self) -> bool {
        !self.flags.is_empty()
    }
}

/// Converts capture samples into millimetre measurements.
#[derive(Debug, Clone)]
pub struct Calibrator {
    config: CalibrationConfig,
    tables: LandmarkTables,
}

impl Calibrator {
    pub fn new(config: CalibrationConfig, tables: LandmarkTables) -> Self {
        Self { config, tables }
    }

    /// Calibrator over the embedded landmark tables.
    pub fn with_embedded_tables(config: CalibrationConfig) -> Result<Self, TableError> {
        Ok(Self::new(config, LandmarkTables::embedded()?.clone()))
    }

    pub fn config(&self) -> &CalibrationConfig {
        &self.config
    }

    pub fn calibrate(&self, sample: &CaptureSample) -> Result<Calibration, CalibrationError> {
        let backend = sample.backend().ok_or(CalibrationError::EmptySample)?;
        let minimum = self.config.minimum_frames;
        if sample.len() < minimum {
            return Err(CalibrationError::InsufficientFrames {
                got: sample.len(),
                minimum,
            });
        }
        let table = self.tables.get(backend)?;

        let mut sum = RawDistances::default();
        for captured in sample.frames() {
            let found = captured.landmarks.backend();
            if found != backend {
                return Err(CalibrationError::MixedBackends {
                    expected: backend,
                    found,
                });
            }
            let raw = RawDistances::measure(
                table,
                &captured.landmarks,
                captured.frame.width() as f64,
                captured.frame.height() as f64,
            )?;
            tracing::trace!(frame = captured.frame.sequence(), ?raw, "raw distances");
            sum.add(&raw);
        }

        let n = sample.len() as f64;
        let mean = sum.map(|v| v / n);
        if let Some(field) = mean.first_non_finite() {
            return Err(CalibrationError::NonFiniteDistance { field });
        }

        let mean_iris_px = mean.iris_width;
        if mean_iris_px <= 0.0 {
            return Err(CalibrationError::DegenerateScale { mean_iris_px });
        }
        let scale = self.config.iris_diameter_mm / mean_iris_px;
        let mm = mean.map(|v| v * scale);
        if !scale.is_finite() || mm.first_non_finite().is_some() {
            return Err(CalibrationError::DegenerateScale { mean_iris_px });
        }

        let measurements = MeasurementSet {
            dp: round_mm(mm.dp),
            face_width: round_mm(mm.face_width),
            lens_height: round_mm(mm.lens_height),
            temple_width: round_mm(mm.temple_width),
            nose_length: Some(round_mm(mm.nose_length)),
        };

        let flags = self.plausibility(&mm);
        if !flags.is_empty() {
            tracing::warn!(
                ?flags,
                face_width_mm = mm.face_width,
                nose_length_mm = mm.nose_length,
                "calibration outside expected ranges; flagging for review"
            );
        }

        tracing::info!(
            backend = %backend,
            frames = sample.len(),
            scale_mm_per_px = scale,
            dp = measurements.dp,
            "calibration complete"
        );

        Ok(Calibration {
            measurements,
            backend,
            frames: sample.len(),
            scale_mm_per_px: scale,
            mean_pixels: mean,
            flags,
        })
    }

    fn plausibility(&self, mm: &RawDistances) -> Vec<PlausibilityFlag> {
        let mut flags = Vec::new();
        if !self.config.face_width_range_mm.contains(&mm.face_width) {
            flags.push(PlausibilityFlag::FaceWidthOutOfRange { mm: mm.face_width });
        }
        if !self.config.nose_length_range_mm.contains(&mm.nose_length) {
            flags.push(PlausibilityFlag::NoseLengthOutOfRange { mm: mm.nose_length });
        }
        flags
    }
}

/// Calibrate with the default configuration and embedded tables.
pub fn calibrate(sample: &CaptureSample) -> Result<Calibration, CalibrationError> {
    Calibrator::with_embedded_tables(CalibrationConfig::default())?.calibrate(sample)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{
        mesh_face, multibox_face, point68_face, test_frame, FaceGeometry, FRAME_H, FRAME_W,
    };
    use proptest::prelude::*;

    fn sample_of(faces: Vec<LandmarkSet>) -> CaptureSample {
        let mut sample = CaptureSample::new();
        for (i, lm) in faces.into_iter().enumerate() {
            sample.push(test_frame(i as u32), lm).unwrap();
        }
        sample
    }

    fn mesh_sample(g: &FaceGeometry, frames: usize) -> CaptureSample {
        sample_of((0..frames).map(|_| mesh_face(g, FRAME_W, FRAME_H)).collect())
    }

    #[test]
    fn test_mesh_calibration() {
        let result = calibrate(&mesh_sample(&FaceGeometry::default(), 5)).unwrap();
        assert_eq!(
            result.measurements,
            MeasurementSet {
                dp: 62,
                face_width: 30,
                lens_height: 35,
                temple_width: 130,
                nose_length: Some(40),
            }
        );
        assert!((result.scale_mm_per_px - 0.5).abs() < 1e-4);
        assert_eq!(result.frames, 5);
        assert!(!result.is_low_confidence());
    }

    #[test]
    fn test_averages_across_frames() {
        let near = FaceGeometry::default();
        let far = FaceGeometry {
            iris_px: 12.0,
            dp_px: 62.0,
            face_width_px: 30.0,
            lens_height_px: 35.0,
            temple_width_px: 130.0,
            nose_length_px: 40.0,
        };
        let sample = sample_of(vec![
            mesh_face(&near, FRAME_W, FRAME_H),
            mesh_face(&far, FRAME_W, FRAME_H),
            mesh_face(&far, FRAME_W, FRAME_H),
        ]);
        let result = calibrate(&sample).unwrap();
        // mean iris 16 px, mean dp 82.67 px → 62 mm
        assert!((result.mean_pixels.iris_width - 16.0).abs() < 1e-3);
        assert!((result.scale_mm_per_px - 0.75).abs() < 1e-4);
        assert_eq!(result.measurements.dp, 62);
        assert_eq!(result.measurements.temple_width, 130);
    }

    #[test]
    fn test_point68_derives_iris_from_eye_span() {
        let g = FaceGeometry::default();
        let sample = sample_of((0..3).map(|_| point68_face(&g, FRAME_W, FRAME_H)).collect());
        let result = calibrate(&sample).unwrap();
        // iris = eye span / 3 pins dp at 3 × 12 mm
        assert_eq!(result.measurements.dp, 36);
        assert_eq!(result.backend, Backend::Point68);
        // temple = 1.2 × jaw span; 60 px × 1.2 × (36 / 124)
        assert_eq!(result.measurements.temple_width, 21);
    }

    #[test]
    fn test_multibox_calibration() {
        let g = FaceGeometry::default();
        let sample = sample_of((0..3).map(|_| multibox_face(&g, FRAME_W, FRAME_H)).collect());
        let result = calibrate(&sample).unwrap();
        assert_eq!(result.measurements.dp, 36);
        assert_eq!(result.measurements.face_width, 17);
        assert_eq!(result.measurements.nose_length, Some(23));
    }

    #[test]
    fn test_zero_iris_is_degenerate() {
        let g = FaceGeometry {
            iris_px: 0.0,
            ..FaceGeometry::default()
        };
        let err = calibrate(&mesh_sample(&g, 5)).unwrap_err();
        assert!(matches!(err, CalibrationError::DegenerateScale { mean_iris_px } if mean_iris_px == 0.0));
    }

    #[test]
    fn test_empty_sample() {
        let err = calibrate(&CaptureSample::new()).unwrap_err();
        assert!(matches!(err, CalibrationError::EmptySample));
    }

    #[test]
    fn test_short_sample_is_rejected() {
        let err = calibrate(&mesh_sample(&FaceGeometry::default(), 2)).unwrap_err();
        assert!(matches!(err, CalibrationError::InsufficientFrames { got: 2, minimum: 3 }));

        let lenient = Calibrator::with_embedded_tables(CalibrationConfig {
            minimum_frames: 1,
            ..CalibrationConfig::default()
        })
        .unwrap();
        let result = lenient.calibrate(&mesh_sample(&FaceGeometry::default(), 1)).unwrap();
        assert_eq!(result.measurements.dp, 62);
    }

    #[test]
    fn test_nan_landmark_is_reported_not_rounded() {
        let g = FaceGeometry::default();
        let mut points = mesh_face(&g, FRAME_W, FRAME_H).points().to_vec();
        points[359].x = f32::NAN;
        let broken = LandmarkSet::new(Backend::Mesh, points).unwrap();
        let sample = sample_of(vec![
            mesh_face(&g, FRAME_W, FRAME_H),
            broken,
            mesh_face(&g, FRAME_W, FRAME_H),
        ]);

        let err = calibrate(&sample).unwrap_err();
        assert!(matches!(err, CalibrationError::NonFiniteDistance { field: "face_width" }));
    }

    #[test]
    fn test_implausible_values_flag_but_do_not_reject() {
        let g = FaceGeometry {
            face_width_px: 180.0,
            nose_length_px: 20.0,
            ..FaceGeometry::default()
        };
        let result = calibrate(&mesh_sample(&g, 3)).unwrap();
        assert!(result.is_low_confidence());
        assert_eq!(result.measurements.face_width, 90);
        assert_eq!(result.measurements.nose_length, Some(10));
        assert_eq!(result.flags.len(), 2);
        assert!(matches!(result.flags[0], PlausibilityFlag::FaceWidthOutOfRange { .. }));
        assert!(matches!(result.flags[1], PlausibilityFlag::NoseLengthOutOfRange { .. }));
    }

    #[test]
    fn test_custom_iris_reference() {
        let calibrator = Calibrator::with_embedded_tables(CalibrationConfig {
            iris_diameter_mm: 11.7,
            ..CalibrationConfig::default()
        })
        .unwrap();
        let result = calibrator.calibrate(&mesh_sample(&FaceGeometry::default(), 3)).unwrap();
        // 124 px × 11.7 / 24
        assert_eq!(result.measurements.dp, 60);
    }

    proptest! {
        #[test]
        fn prop_positive_iris_yields_non_negative_fields(
            iris in 1.0f64..80.0,
            dp in 0.0f64..300.0,
            face in 0.0f64..300.0,
            lens in 0.0f64..150.0,
            temple in 0.0f64..600.0,
            nose in 0.0f64..150.0,
            frames in 3usize..=5,
        ) {
            let g = FaceGeometry {
                iris_px: iris,
                dp_px: dp,
                face_width_px: face,
                lens_height_px: lens,
                temple_width_px: temple,
                nose_length_px: nose,
            };
            let sample = mesh_sample(&g, frames);
            let first = calibrate(&sample).unwrap();
            let m = first.measurements;
            prop_assert!(m.dp >= 0 && m.face_width >= 0 && m.lens_height >= 0 && m.temple_width >= 0);
            prop_assert!(m.nose_length.unwrap() >= 0);

            let second = calibrate(&sample).unwrap();
            prop_assert_eq!(first.measurements, second.measurements);
            prop_assert_eq!(first.scale_mm_per_px.to_bits(), second.scale_mm_per_px.to_bits());
        }
    }
}
