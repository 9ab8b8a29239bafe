//! ONNX Runtime landmark backends.
//!
//! - `multibox`: single-stage short-range face detector with 6 keypoints.
//! - `mesh`: multibox face box, then a 478-point face mesh on a square crop.
//! - `point68`: SCRFD face box, then a 68-point regressor on a square crop.
//!
//! Shared here: model paths, tensor preparation, crop geometry, NMS and the
//! loaders the [`DetectorSelector`](crate::detector::DetectorSelector) drives.

pub mod mesh;
pub mod multibox;
pub mod point68;
pub mod scrfd;

use crate::detector::{BackendLoader, DetectorError, LandmarkDetector};
use crate::types::{Backend, FaceBox, Frame};
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub use mesh::MeshDetector;
pub use multibox::MultiBoxDetector;
pub use point68::Point68Detector;
pub use scrfd::ScrfdDetector;

const READINESS_FRAME_WIDTH: u32 = 640;
const READINESS_FRAME_HEIGHT: u32 = 480;
/// Crops never exceed this multiple of the frame's larger side.
const MAX_CROP_FRAME_MULTIPLE: f32 = 2.0;

/// Locations of every model file the backends use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelPaths {
    /// Short-range multi-box face detector (also the mesh's first stage).
    pub face_detection: PathBuf,
    /// 478-point face mesh with refined iris.
    pub face_mesh: PathBuf,
    /// SCRFD face detector (the 68-point backend's first stage).
    pub scrfd: PathBuf,
    /// 68-point landmark regressor.
    pub landmark68: PathBuf,
}

impl ModelPaths {
    /// Standard file names under `dir`.
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            face_detection: dir.join("face_detection_short_range.onnx"),
            face_mesh: dir.join("face_landmark_478.onnx"),
            scrfd: dir.join("det_10g.onnx"),
            landmark68: dir.join("landmark_68.onnx"),
        }
    }
}

impl Default for ModelPaths {
    fn default() -> Self {
        Self::in_dir(crate::default_model_dir())
    }
}

/// Open an inference session, failing fast on a missing file.
pub(crate) fn open_session(path: &Path) -> Result<Session, DetectorError> {
    if !path.exists() {
        return Err(DetectorError::ModelNotFound(path.display().to_string()));
    }
    let session = Session::builder()?
        .with_intra_threads(2)?
        .commit_from_file(path)?;
    Ok(session)
}

pub(crate) fn output_names(session: &Session) -> Vec<String> {
    session
        .outputs()
        .iter()
        .map(|o| o.name().to_string())
        .collect()
}

/// Per-channel affine normalization `(p - mean) / std`.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Normalization {
    pub mean: f32,
    pub std: f32,
}

impl Normalization {
    /// Maps `[0, 255]` to `[-1, 1]`.
    pub const SYMMETRIC: Self = Self {
        mean: 127.5,
        std: 127.5,
    };
    /// Maps `[0, 255]` to `[0, 1]`.
    pub const UNIT: Self = Self {
        mean: 0.0,
        std: 255.0,
    };

    fn apply(self, p: u8) -> f32 {
        (p as f32 - self.mean) / self.std
    }
}

/// Metadata for coordinate de-mapping after letterbox resize.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Letterbox {
    pub scale: f32,
    pub pad_x: f32,
    pub pad_y: f32,
}

impl Letterbox {
    /// Fit `width` × `height` inside a square `input` canvas, centred.
    pub fn fit(width: u32, height: u32, input: usize) -> Self {
        let scale = (input as f32 / width as f32).min(input as f32 / height as f32);
        let new_w = (width as f32 * scale).round();
        let new_h = (height as f32 * scale).round();
        Self {
            scale,
            pad_x: (input as f32 - new_w) / 2.0,
            pad_y: (input as f32 - new_h) / 2.0,
        }
    }

    /// Letterboxed input pixel → original frame pixel.
    pub fn to_frame(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// Letterbox `image` into a `1×3×input×input` tensor. Padding is zero after
/// normalization.
pub(crate) fn letterbox_tensor(
    image: &RgbImage,
    input: usize,
    norm: Normalization,
) -> (Array4<f32>, Letterbox) {
    let letterbox = Letterbox::fit(image.width(), image.height(), input);
    let new_w = ((image.width() as f32 * letterbox.scale).round() as u32).clamp(1, input as u32);
    let new_h = ((image.height() as f32 * letterbox.scale).round() as u32).clamp(1, input as u32);
    let resized = imageops::resize(image, new_w, new_h, FilterType::Triangle);

    let pad_x = letterbox.pad_x.floor() as usize;
    let pad_y = letterbox.pad_y.floor() as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, input, input));
    for (x, y, pixel) in resized.enumerate_pixels() {
        let (tx, ty) = (x as usize + pad_x, y as usize + pad_y);
        if tx >= input || ty >= input {
            continue;
        }
        for c in 0..3 {
            tensor[[0, c, ty, tx]] = norm.apply(pixel[c]);
        }
    }
    (tensor, letterbox)
}

/// Resize `image` to exactly `size` × `size` and convert to NCHW.
pub(crate) fn square_tensor(image: &RgbImage, size: u32, norm: Normalization) -> Array4<f32> {
    let resized = if image.dimensions() == (size, size) {
        image.clone()
    } else {
        imageops::resize(image, size, size, FilterType::Triangle)
    };
    let side = size as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, side, side));
    for (x, y, pixel) in resized.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = norm.apply(pixel[c]);
        }
    }
    tensor
}

/// Square region around a face box, in frame pixels. May extend past the
/// frame; the outside is filled black.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SquareCrop {
    pub x0: i64,
    pub y0: i64,
    pub side: u32,
}

impl SquareCrop {
    /// Square of `max(w, h) × expand` centred on the box, capped at twice the
    /// larger frame side.
    pub fn around(face: &FaceBox, expand: f32, frame_width: u32, frame_height: u32) -> Self {
        let (cx, cy) = face.center();
        let limit = frame_width.max(frame_height).max(1) as f32 * MAX_CROP_FRAME_MULTIPLE;
        let side = (face.width.max(face.height) * expand)
            .round()
            .max(1.0)
            .min(limit);
        let bound = limit as i64;
        Self {
            x0: ((cx - side / 2.0).round() as i64).clamp(-bound, bound),
            y0: ((cy - side / 2.0).round() as i64).clamp(-bound, bound),
            side: side as u32,
        }
    }

    /// Cut the crop out of `image` and resize it to `size` × `size`.
    pub fn extract(&self, image: &RgbImage, size: u32) -> RgbImage {
        let mut canvas = RgbImage::new(self.side, self.side);
        imageops::overlay(&mut canvas, image, -self.x0, -self.y0);
        imageops::resize(&canvas, size, size, FilterType::Triangle)
    }

    /// Crop-relative `[0, 1]` coordinates → frame pixels.
    pub fn to_frame(&self, u: f32, v: f32) -> (f32, f32) {
        (
            self.x0 as f32 + u * self.side as f32,
            self.y0 as f32 + v * self.side as f32,
        )
    }
}

/// A face box with detector keypoints, both in frame pixels.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Detection {
    pub face: FaceBox,
    pub keypoints: Vec<(f32, f32)>,
}

/// Non-Maximum Suppression: remove overlapping detections, best first.
pub(crate) fn nms(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    detections.sort_by(|a, b| {
        b.face
            .confidence
            .partial_cmp(&a.face.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep: Vec<Detection> = Vec::new();
    for det in detections {
        if keep.iter().all(|k| iou(&k.face, &det.face) <= iou_threshold) {
            keep.push(det);
        }
    }
    keep
}

/// Intersection-over-Union between two boxes.
pub(crate) fn iou(a: &FaceBox, b: &FaceBox) -> f32 {
    let x1 = a.x.max(b.x);
    let y1 = a.y.max(b.y);
    let x2 = (a.x + a.width).min(b.x + b.width);
    let y2 = (a.y + a.height).min(b.y + b.height);

    let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let union = a.width * a.height + b.width * b.height - inter;
    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}

pub(crate) fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x.clamp(-100.0, 100.0)).exp())
}

/// Run one detection on a blank frame. Zero faces is the expected answer;
/// only an error fails the check. The two-stage backends never reach their
/// landmark model here, so they verify its output layout while loading.
pub(crate) fn readiness_check(detector: &mut dyn LandmarkDetector) -> Result<(), DetectorError> {
    let blank = Frame::new(
        RgbImage::new(READINESS_FRAME_WIDTH, READINESS_FRAME_HEIGHT),
        0,
    );
    match detector.detect(&blank) {
        Ok(_) => {
            tracing::debug!(backend = %detector.backend(), "readiness check passed");
            Ok(())
        }
        Err(e) => Err(DetectorError::NotReady(format!("{}: {e}", detector.backend()))),
    }
}

fn ready<D: LandmarkDetector + 'static>(mut detector: D) -> Result<Box<dyn LandmarkDetector>, DetectorError> {
    readiness_check(&mut detector)?;
    Ok(Box::new(detector))
}

pub struct MeshLoader {
    paths: ModelPaths,
}

impl BackendLoader for MeshLoader {
    fn backend(&self) -> Backend {
        Backend::Mesh
    }

    fn load(&self) -> Result<Box<dyn LandmarkDetector>, DetectorError> {
        ready(MeshDetector::load(
            &self.paths.face_detection,
            &self.paths.face_mesh,
        )?)
    }
}

pub struct MultiBoxLoader {
    paths: ModelPaths,
}

impl BackendLoader for MultiBoxLoader {
    fn backend(&self) -> Backend {
        Backend::MultiBox
    }

    fn load(&self) -> Result<Box<dyn LandmarkDetector>, DetectorError> {
        ready(MultiBoxDetector::load(&self.paths.face_detection)?)
    }
}

pub struct Point68Loader {
    paths: ModelPaths,
}

impl BackendLoader for Point68Loader {
    fn backend(&self) -> Backend {
        Backend::Point68
    }

    fn load(&self) -> Result<Box<dyn LandmarkDetector>, DetectorError> {
        ready(Point68Detector::load(&self.paths.scrfd, &self.paths.landmark68)?)
    }
}

/// One loader per backend, in priority order.
pub fn default_loaders(paths: &ModelPaths) -> Vec<Arc<dyn BackendLoader>> {
    vec![
        Arc::new(MeshLoader {
            paths: paths.clone(),
        }),
        Arc::new(MultiBoxLoader {
            paths: paths.clone(),
        }),
        Arc::new(Point68Loader {
            paths: paths.clone(),
        }),
    ]
}
