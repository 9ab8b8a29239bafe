use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;
use thiserror::Error;

/// Facial landmark backend. Index semantics differ per backend, so every
/// [`LandmarkSet`] carries the backend that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    /// Dense face mesh with refined iris points (478 landmarks).
    Mesh,
    /// Coarse multi-box keypoint detector (6 keypoints per face).
    #[serde(rename = "multibox")]
    MultiBox,
    /// 68-point face landmark model.
    Point68,
}

impl Backend {
    /// Initialization priority: first entry is tried first.
    pub const PRIORITY: [Backend; 3] = [Backend::Mesh, Backend::MultiBox, Backend::Point68];

    /// Number of landmarks every detection from this backend carries.
    pub fn point_count(self) -> usize {
        match self {
            Backend::Mesh => 478,
            Backend::MultiBox => 6,
            Backend::Point68 => 68,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Backend::Mesh => "mesh",
            Backend::MultiBox => "multibox",
            Backend::Point68 => "point68",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A landmark in normalized image-relative coordinates. `z` is unused by
/// the 2D backends and left at zero.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y, z: 0.0 }
    }
}

/// A captured RGB frame. Immutable once captured.
#[derive(Clone)]
pub struct Frame {
    image: RgbImage,
    sequence: u32,
    captured_at: Instant,
}

impl Frame {
    pub fn new(image: RgbImage, sequence: u32) -> Self {
        Self {
            image,
            sequence,
            captured_at: Instant::now(),
        }
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    pub fn captured_at(&self) -> Instant {
        self.captured_at
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width())
            .field("height", &self.height())
            .field("sequence", &self.sequence)
            .finish()
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{backend} produces {expected} landmarks, got {actual}")]
pub struct LandmarkCountError {
    pub backend: Backend,
    pub expected: usize,
    pub actual: usize,
}

/// Landmarks of a single detected face, tagged with the producing backend.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LandmarkSet {
    backend: Backend,
    points: Vec<Point>,
}

impl LandmarkSet {
    /// Build a landmark set; the point count must match the backend layout.
    pub fn new(backend: Backend, points: Vec<Point>) -> Result<Self, LandmarkCountError> {
        let expected = backend.point_count();
        if points.len() != expected {
            return Err(LandmarkCountError {
                backend,
                expected,
                actual: points.len(),
            });
        }
        Ok(Self { backend, points })
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    pub fn points(&self) -> &[Point] {
        &self.points
    }

    pub fn get(&self, index: usize) -> Option<&Point> {
        self.points.get(index)
    }
}

/// Face bounding box in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FaceBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

impl FaceBox {
    pub fn center(&self) -> (f32, f32) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }
}

/// Eyewear-fitting measurements in whole millimetres.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeasurementSet {
    /// Pupillary distance.
    pub dp: i32,
    pub face_width: i32,
    pub lens_height: i32,
    pub temple_width: i32,
    /// Not modelled by the manual fallback.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nose_length: Option<i32>,
}

/// Round a millimetre value to the nearest whole millimetre.
pub(crate) fn round_mm(value: f64) -> i32 {
    value.round() as i32
}
