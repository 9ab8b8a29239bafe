//! 68-point face landmarks.
//!
//! SCRFD finds the face; a square crop (1.2× the box) is resized to 112×112
//! and a regressor outputs 136 values, (x, y) pairs normalized to the crop.
//! Loading runs the regressor once on an empty crop to confirm that layout.

use super::{open_session, output_names, square_tensor, Normalization, ScrfdDetector, SquareCrop};
use crate::detector::{DetectorError, LandmarkDetector};
use crate::types::{Backend, Frame, LandmarkSet, Point};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;

const LANDMARK68_INPUT_SIZE: u32 = 112;
const LANDMARK68_CROP_EXPAND: f32 = 1.2;
const LANDMARK68_POINTS: usize = 68;

pub struct Point68Detector {
    face_detector: ScrfdDetector,
    session: Session,
}

impl Point68Detector {
    pub fn load(scrfd_path: &Path, landmark_path: &Path) -> Result<Self, DetectorError> {
        let face_detector = ScrfdDetector::load(scrfd_path)?;
        let session = open_session(landmark_path)?;
        tracing::info!(
            path = %landmark_path.display(),
            outputs = ?output_names(&session),
            "loaded 68-point landmark model"
        );

        let mut detector = Self {
            face_detector,
            session,
        };
        let blank = RgbImage::new(LANDMARK68_INPUT_SIZE, LANDMARK68_INPUT_SIZE);
        let input = square_tensor(&blank, LANDMARK68_INPUT_SIZE, Normalization::UNIT);
        detector
            .infer(&input)
            .map_err(|e| DetectorError::NotReady(format!("68-point landmarks: {e}")))?;
        Ok(detector)
    }

    fn infer(&mut self, input: &Array4<f32>) -> Result<Vec<f32>, DetectorError> {
        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| DetectorError::InferenceFailed(format!("landmarks: {e}")))?;
        check_layout(data.len())?;
        Ok(data.to_vec())
    }
}

fn check_layout(len: usize) -> Result<(), DetectorError> {
    if len < LANDMARK68_POINTS * 2 {
        return Err(DetectorError::UnexpectedOutput(format!(
            "expected {} landmark values, got {len}",
            LANDMARK68_POINTS * 2
        )));
    }
    Ok(())
}

impl LandmarkDetector for Point68Detector {
    fn backend(&self) -> Backend {
        Backend::Point68
    }

    fn detect(&mut self, frame: &Frame) -> Result<Option<LandmarkSet>, DetectorError> {
        let faces = self.face_detector.detect_faces(frame.image())?;
        let Some(best) = faces.first() else {
            return Ok(None);
        };

        let crop = SquareCrop::around(&best.face, LANDMARK68_CROP_EXPAND, frame.width(), frame.height());
        let patch = crop.extract(frame.image(), LANDMARK68_INPUT_SIZE);
        let input = square_tensor(&patch, LANDMARK68_INPUT_SIZE, Normalization::UNIT);
        let data = self.infer(&input)?;

        Ok(Some(LandmarkSet::new(
            Backend::Point68,
            to_frame_points(&data, &crop, frame.width(), frame.height()),
        )?))
    }
}

fn to_frame_points(data: &[f32], crop: &SquareCrop, width: u32, height: u32) -> Vec<Point> {
    data.chunks_exact(2)
        .take(LANDMARK68_POINTS)
        .map(|p| {
            let (x, y) = crop.to_frame(p[0], p[1]);
            Point::new(x / width as f32, y / height as f32)
        })
        .collect()
}
