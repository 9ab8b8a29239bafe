//! Synthetic faces and scripted collaborators for unit tests.

use crate::capture::{FrameSource, FrameSourceError, SharedDetector, SharedFrameSource};
use crate::detector::{BackendLoader, DetectorError, LandmarkDetector};
use crate::types::{Backend, Frame, LandmarkSet, Point};
use image::RgbImage;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub const FRAME_W: u32 = 640;
pub const FRAME_H: u32 = 480;

const CENTER_X: f64 = 0.5;
const EYE_Y: f64 = 0.4;

pub fn test_frame(sequence: u32) -> Frame {
    Frame::new(RgbImage::new(FRAME_W, FRAME_H), sequence)
}

/// Pixel distances a synthetic face is built to exhibit.
#[derive(Debug, Clone)]
pub struct FaceGeometry {
    pub iris_px: f64,
    pub dp_px: f64,
    pub face_width_px: f64,
    pub lens_height_px: f64,
    pub temple_width_px: f64,
    pub nose_length_px: f64,
}

impl Default for FaceGeometry {
    /// At 12 mm / 24 px = 0.5 mm/px: dp 62, face 30, lens 35, temple 130, nose 40.
    fn default() -> Self {
        Self {
            iris_px: 24.0,
            dp_px: 124.0,
            face_width_px: 60.0,
            lens_height_px: 70.0,
            temple_width_px: 260.0,
            nose_length_px: 80.0,
        }
    }
}

fn nx(offset_px: f64, width: u32) -> f32 {
    (CENTER_X + offset_px / width as f64) as f32
}

fn ny(offset_px: f64, height: u32) -> f32 {
    (EYE_Y + offset_px / height as f64) as f32
}

/// A 478-point mesh face laid out to match the embedded mesh table.
pub fn mesh_face(g: &FaceGeometry, width: u32, height: u32) -> LandmarkSet {
    let mut points = vec![Point::new(0.5, 0.5); Backend::Mesh.point_count()];
    let eye_y = ny(0.0, height);
    let mouth_y = ny(g.lens_height_px, height);
    let left = -g.dp_px / 2.0;
    let right = g.dp_px / 2.0;

    points[468] = Point::new(nx(left, width), eye_y);
    points[473] = Point::new(nx(right, width), eye_y);
    points[469] = Point::new(nx(left - g.iris_px / 2.0, width), eye_y);
    points[471] = Point::new(nx(left + g.iris_px / 2.0, width), eye_y);
    points[474] = Point::new(nx(right - g.iris_px / 2.0, width), eye_y);
    points[476] = Point::new(nx(right + g.iris_px / 2.0, width), eye_y);
    points[130] = Point::new(nx(-g.face_width_px / 2.0, width), eye_y);
    points[359] = Point::new(nx(g.face_width_px / 2.0, width), eye_y);
    points[234] = Point::new(nx(-g.temple_width_px / 2.0, width), eye_y);
    points[454] = Point::new(nx(g.temple_width_px / 2.0, width), eye_y);
    points[13] = Point::new(nx(0.0, width), mouth_y);
    points[1] = Point::new(nx(0.0, width), ny(g.lens_height_px - g.nose_length_px, height));

    LandmarkSet::new(Backend::Mesh, points).expect("mesh layout")
}

/// A 68-point face; iris and temple follow from the eye and jaw spans.
pub fn point68_face(g: &FaceGeometry, width: u32, height: u32) -> LandmarkSet {
    let mut points = vec![Point::new(0.5, 0.5); Backend::Point68.point_count()];
    let eye_y = ny(0.0, height);
    points[36] = Point::new(nx(-g.dp_px / 2.0, width), eye_y);
    points[45] = Point::new(nx(g.dp_px / 2.0, width), eye_y);
    points[0] = Point::new(nx(-g.face_width_px / 2.0, width), eye_y);
    points[16] = Point::new(nx(g.face_width_px / 2.0, width), eye_y);
    points[57] = Point::new(nx(0.0, width), ny(g.lens_height_px, height));
    points[30] = Point::new(nx(0.0, width), ny(g.lens_height_px - g.nose_length_px, height));
    LandmarkSet::new(Backend::Point68, points).expect("68-point layout")
}

/// A 6-keypoint multi-box face; iris and temple follow from the eye and ear spans.
pub fn multibox_face(g: &FaceGeometry, width: u32, height: u32) -> LandmarkSet {
    let eye_y = ny(0.0, height);
    let points = vec![
        Point::new(nx(-g.dp_px / 2.0, width), eye_y),
        Point::new(nx(g.dp_px / 2.0, width), eye_y),
        Point::new(nx(0.0, width), ny(g.lens_height_px - g.nose_length_px, height)),
        Point::new(nx(0.0, width), ny(g.lens_height_px, height)),
        Point::new(nx(-g.face_width_px / 2.0, width), eye_y),
        Point::new(nx(g.face_width_px / 2.0, width), eye_y),
    ];
    LandmarkSet::new(Backend::MultiBox, points).expect("multibox layout")
}

/// Detector that answers from a script of face / no-face outcomes, then
/// keeps finding faces.
pub struct ScriptedDetector {
    backend: Backend,
    script: VecDeque<bool>,
}

impl ScriptedDetector {
    pub fn always(backend: Backend) -> Self {
        Self::sequence(backend, &[])
    }

    pub fn sequence(backend: Backend, outcomes: &[bool]) -> Self {
        Self {
            backend,
            script: outcomes.iter().copied().collect(),
        }
    }

    pub fn face_for(backend: Backend) -> LandmarkSet {
        let g = FaceGeometry::default();
        match backend {
            Backend::Mesh => mesh_face(&g, FRAME_W, FRAME_H),
            Backend::MultiBox => multibox_face(&g, FRAME_W, FRAME_H),
            Backend::Point68 => point68_face(&g, FRAME_W, FRAME_H),
        }
    }
}

impl LandmarkDetector for ScriptedDetector {
    fn backend(&self) -> Backend {
        self.backend
    }

    fn detect(&mut self, _frame: &Frame) -> Result<Option<LandmarkSet>, DetectorError> {
        let found = self.script.pop_front().unwrap_or(true);
        Ok(found.then(|| Self::face_for(self.backend)))
    }
}

/// Frame source producing blank frames, optionally failing after `limit`.
/// Clones share the served-frame counter.
#[derive(Clone)]
pub struct ScriptedSource {
    served: Arc<AtomicU32>,
    limit: Option<u32>,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self {
            served: Arc::new(AtomicU32::new(0)),
            limit: None,
        }
    }

    pub fn failing_after(limit: u32) -> Self {
        Self {
            limit: Some(limit),
            ..Self::new()
        }
    }

    pub fn frames_served(&self) -> u32 {
        self.served.load(Ordering::SeqCst)
    }
}

impl FrameSource for ScriptedSource {
    fn next_frame(&mut self) -> Result<Frame, FrameSourceError> {
        let served = self.served.load(Ordering::SeqCst);
        if self.limit.is_some_and(|limit| served >= limit) {
            return Err(FrameSourceError::Unavailable("camera closed".into()));
        }
        self.served.fetch_add(1, Ordering::SeqCst);
        Ok(test_frame(served))
    }
}

pub fn shared_source(source: impl FrameSource + 'static) -> SharedFrameSource {
    let boxed: Box<dyn FrameSource> = Box::new(source);
    Arc::new(Mutex::new(boxed))
}

pub fn shared_detector(detector: impl LandmarkDetector + 'static) -> SharedDetector {
    let boxed: Box<dyn LandmarkDetector> = Box::new(detector);
    Arc::new(Mutex::new(boxed))
}

enum LoaderMode {
    Succeed(Vec<bool>),
    Fail,
    Panic,
}

/// Loader with a fixed outcome that counts its attempts.
pub struct ScriptedLoader {
    backend: Backend,
    mode: LoaderMode,
    pub attempts: AtomicUsize,
}

impl ScriptedLoader {
    pub fn succeeding(backend: Backend) -> Arc<Self> {
        Self::with_script(backend, &[])
    }

    /// Succeeds with a detector following `outcomes`.
    pub fn with_script(backend: Backend, outcomes: &[bool]) -> Arc<Self> {
        Arc::new(Self {
            backend,
            mode: LoaderMode::Succeed(outcomes.to_vec()),
            attempts: AtomicUsize::new(0),
        })
    }

    pub fn failing(backend: Backend) -> Arc<Self> {
        Arc::new(Self {
            backend,
            mode: LoaderMode::Fail,
            attempts: AtomicUsize::new(0),
        })
    }

    pub fn panicking(backend: Backend) -> Arc<Self> {
        Arc::new(Self {
            backend,
            mode: LoaderMode::Panic,
            attempts: AtomicUsize::new(0),
        })
    }
}

impl BackendLoader for ScriptedLoader {
    fn backend(&self) -> Backend {
        self.backend
    }

    fn load(&self) -> Result<Box<dyn LandmarkDetector>, DetectorError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        match &self.mode {
            LoaderMode::Succeed(script) => {
                Ok(Box::new(ScriptedDetector::sequence(self.backend, script)))
            }
            LoaderMode::Fail => Err(DetectorError::ModelNotFound(format!(
                "{}.onnx",
                self.backend
            ))),
            LoaderMode::Panic => panic!("{} loader exploded", self.backend),
        }
    }
}

pub fn loaders(list: &[&Arc<ScriptedLoader>]) -> Vec<Arc<dyn BackendLoader>> {
    list.iter()
        .map(|l| Arc::clone(l) as Arc<dyn BackendLoader>)
        .collect()
}
