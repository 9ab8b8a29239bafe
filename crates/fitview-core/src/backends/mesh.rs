//! Dense face mesh: 478 landmarks including refined iris contours.
//!
//! Two stages. The multi-box detector finds the face, a square crop around it
//! (1.5× the box) is resized to 192×192, and the mesh model regresses 478
//! (x, y, z) points in crop pixels plus a face-presence logit.
//!
//! Loading runs the mesh model once on an empty crop and checks its output
//! layout, so an incompatible model fails at load instead of on every frame.

use super::{open_session, output_names, sigmoid, square_tensor, MultiBoxDetector, Normalization, SquareCrop};
use crate::detector::{DetectorError, LandmarkDetector};
use crate::types::{Backend, Frame, LandmarkSet, Point};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;

const MESH_INPUT_SIZE: u32 = 192;
const MESH_CROP_EXPAND: f32 = 1.5;
const MESH_POINTS: usize = 478;
const MESH_PRESENCE_THRESHOLD: f32 = 0.5;

pub struct MeshDetector {
    face_detector: MultiBoxDetector,
    session: Session,
    num_outputs: usize,
}

impl MeshDetector {
    pub fn load(detector_path: &Path, mesh_path: &Path) -> Result<Self, DetectorError> {
        let face_detector = MultiBoxDetector::load(detector_path)?;
        let session = open_session(mesh_path)?;
        let names = output_names(&session);
        tracing::info!(path = %mesh_path.display(), outputs = ?names, "loaded face mesh model");

        if names.is_empty() {
            return Err(DetectorError::UnexpectedOutput("face mesh model has no outputs".into()));
        }

        let mut detector = Self {
            face_detector,
            session,
            num_outputs: names.len(),
        };
        detector.verify_layout()?;
        Ok(detector)
    }

    fn verify_layout(&mut self) -> Result<(), DetectorError> {
        let blank = RgbImage::new(MESH_INPUT_SIZE, MESH_INPUT_SIZE);
        let input = square_tensor(&blank, MESH_INPUT_SIZE, Normalization::UNIT);
        self.infer(&input)
            .map_err(|e| DetectorError::NotReady(format!("face mesh: {e}")))?;
        tracing::debug!("face mesh output layout verified");
        Ok(())
    }

    fn infer(&mut self, input: &Array4<f32>) -> Result<MeshOutput, DetectorError> {
        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut tensors = Vec::with_capacity(self.num_outputs);
        for i in 0..self.num_outputs {
            let (_, data) = outputs[i]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("mesh output {i}: {e}")))?;
            tensors.push(data.to_vec());
        }
        MeshOutput::from_tensors(tensors)
    }
}

/// Mesh coordinates plus the optional face-presence logit.
#[derive(Debug, PartialEq)]
struct MeshOutput {
    coords: Vec<f32>,
    presence: Option<f32>,
}

impl MeshOutput {
    /// Outputs are told apart by size: coordinates vs. the presence scalar.
    fn from_tensors(tensors: Vec<Vec<f32>>) -> Result<Self, DetectorError> {
        let mut coords: Option<Vec<f32>> = None;
        let mut presence: Option<f32> = None;
        for data in tensors {
            if data.len() >= MESH_POINTS * 3 && coords.is_none() {
                coords = Some(data);
            } else if data.len() == 1 && presence.is_none() {
                presence = Some(data[0]);
            }
        }

        let coords = coords.ok_or_else(|| {
            DetectorError::UnexpectedOutput(format!("no output with {} coordinates", MESH_POINTS * 3))
        })?;
        Ok(Self { coords, presence })
    }
}

impl LandmarkDetector for MeshDetector {
    fn backend(&self) -> Backend {
        Backend::Mesh
    }

    fn detect(&mut self, frame: &Frame) -> Result<Option<LandmarkSet>, DetectorError> {
        let faces = self.face_detector.detect_faces(frame.image())?;
        let Some(best) = faces.first() else {
            return Ok(None);
        };

        let crop = SquareCrop::around(&best.face, MESH_CROP_EXPAND, frame.width(), frame.height());
        let patch = crop.extract(frame.image(), MESH_INPUT_SIZE);
        let input = square_tensor(&patch, MESH_INPUT_SIZE, Normalization::UNIT);
        let output = self.infer(&input)?;

        if let Some(logit) = output.presence {
            let p = sigmoid(logit);
            if p < MESH_PRESENCE_THRESHOLD {
                tracing::debug!(presence = p, "face mesh rejected crop");
                return Ok(None);
            }
        }

        Ok(Some(LandmarkSet::new(
            Backend::Mesh,
            to_frame_points(&output.coords, &crop, frame.width(), frame.height()),
        )?))
    }
}

/// Crop-pixel (x, y, z) triples → frame-normalized points. `z` keeps the
/// crop-pixel scale of `x`.
fn to_frame_points(coords: &[f32], crop: &SquareCrop, width: u32, height: u32) -> Vec<Point> {
    let size = MESH_INPUT_SIZE as f32;
    coords
        .chunks_exact(3)
        .take(MESH_POINTS)
        .map(|c| {
            let (x, y) = crop.to_frame(c[0] / size, c[1] / size);
            Point {
                x: x / width as f32,
                y: y / height as f32,
                z: c[2] / size,
            }
        })
        .collect()
}
