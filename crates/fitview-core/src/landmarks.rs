//! Per-backend landmark tables.
//!
//! Maps named facial keypoints to backend-specific landmark indices and
//! describes how each raw pixel distance is measured from them. Default
//! tables are embedded at compile time from `contrib/landmarks/*.toml` and
//! can be replaced from a directory at runtime.

use crate::types::{Backend, LandmarkSet, Point};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::OnceLock;
use thiserror::Error;

const MESH_TABLE: &str = include_str!("../../../contrib/landmarks/mesh.toml");
const MULTIBOX_TABLE: &str = include_str!("../../../contrib/landmarks/multibox.toml");
const POINT68_TABLE: &str = include_str!("../../../contrib/landmarks/point68.toml");

static EMBEDDED: OnceLock<Result<LandmarkTables, TableError>> = OnceLock::new();

#[derive(Debug, Error, Clone, PartialEq)]
pub enum TableError {
    #[error("bad landmark table {name}: {reason}")]
    Parse { name: String, reason: String },
    #[error("failed to read landmark table {path}: {reason}")]
    Io { path: String, reason: String },
    #[error("no landmark table for backend {0}")]
    MissingTable(Backend),
    #[error("table {file} declares backend {declared}")]
    BackendMismatch { file: String, declared: Backend },
    #[error("{backend} table has no index for keypoint {keypoint:?}")]
    MissingKeypoint { backend: Backend, keypoint: Keypoint },
    #[error("{backend} keypoint {keypoint:?} maps to index {index}, beyond {count} landmarks")]
    IndexOutOfRange {
        backend: Backend,
        keypoint: Keypoint,
        index: usize,
        count: usize,
    },
    #[error("{backend} table has an empty mean span")]
    EmptyMean { backend: Backend },
    #[error("{backend} table has non-positive scale factor {factor}")]
    BadFactor { backend: Backend, factor: f64 },
}

/// Named facial keypoints. Left/right are in image space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Keypoint {
    LeftIrisInner,
    LeftIrisOuter,
    RightIrisInner,
    RightIrisOuter,
    LeftPupil,
    RightPupil,
    LeftEyeOuter,
    RightEyeOuter,
    MouthCenter,
    LeftTemple,
    RightTemple,
    NoseTip,
    LeftFaceEdge,
    RightFaceEdge,
}

/// Keypoint → landmark index for one backend. Absent entries are keypoints
/// the backend does not model.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KeypointIndices {
    pub left_iris_inner: Option<usize>,
    pub left_iris_outer: Option<usize>,
    pub right_iris_inner: Option<usize>,
    pub right_iris_outer: Option<usize>,
    pub left_pupil: Option<usize>,
    pub right_pupil: Option<usize>,
    pub left_eye_outer: Option<usize>,
    pub right_eye_outer: Option<usize>,
    pub mouth_center: Option<usize>,
    pub left_temple: Option<usize>,
    pub right_temple: Option<usize>,
    pub nose_tip: Option<usize>,
    pub left_face_edge: Option<usize>,
    pub right_face_edge: Option<usize>,
}

impl KeypointIndices {
    pub fn index(&self, keypoint: Keypoint) -> Option<usize> {
        match keypoint {
            Keypoint::LeftIrisInner => self.left_iris_inner,
            Keypoint::LeftIrisOuter => self.left_iris_outer,
            Keypoint::RightIrisInner => self.right_iris_inner,
            Keypoint::RightIrisOuter => self.right_iris_outer,
            Keypoint::LeftPupil => self.left_pupil,
            Keypoint::RightPupil => self.right_pupil,
            Keypoint::LeftEyeOuter => self.left_eye_outer,
            Keypoint::RightEyeOuter => self.right_eye_outer,
            Keypoint::MouthCenter => self.mouth_center,
            Keypoint::LeftTemple => self.left_temple,
            Keypoint::RightTemple => self.right_temple,
            Keypoint::NoseTip => self.nose_tip,
            Keypoint::LeftFaceEdge => self.left_face_edge,
            Keypoint::RightFaceEdge => self.right_face_edge,
        }
    }
}

/// How one raw distance is measured, in frame pixels.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Span {
    /// `|Δx| · width`
    Horizontal([Keypoint; 2]),
    /// `|Δy| · height`
    Vertical([Keypoint; 2]),
    /// Straight-line distance in pixel space.
    Euclidean([Keypoint; 2]),
    /// `|mean(y_a, y_b) − y_to| · height`
    VerticalFromMidpoint { from: [Keypoint; 2], to: Keypoint },
    /// Arithmetic mean of several spans.
    Mean(Vec<Span>),
    /// Another span multiplied by a fixed ratio.
    Scaled { span: Box<Span>, factor: f64 },
}

impl Span {
    /// Measure this span on one detection in a `width` × `height` frame.
    pub fn measure(
        &self,
        table: &LandmarkTable,
        landmarks: &LandmarkSet,
        width: f64,
        height: f64,
    ) -> Result<f64, TableError> {
        let point = |kp: Keypoint| table.point(landmarks, kp);
        match self {
            Span::Horizontal([a, b]) => {
                Ok((point(*b)?.x as f64 - point(*a)?.x as f64).abs() * width)
            }
            Span::Vertical([a, b]) => {
                Ok((point(*b)?.y as f64 - point(*a)?.y as f64).abs() * height)
            }
            Span::Euclidean([a, b]) => {
                let (pa, pb) = (point(*a)?, point(*b)?);
                let dx = (pb.x as f64 - pa.x as f64) * width;
                let dy = (pb.y as f64 - pa.y as f64) * height;
                Ok((dx * dx + dy * dy).sqrt())
            }
            Span::VerticalFromMidpoint { from: [a, b], to } => {
                let mid_y = (point(*a)?.y as f64 + point(*b)?.y as f64) / 2.0;
                Ok((mid_y - point(*to)?.y as f64).abs() * height)
            }
            Span::Mean(spans) => {
                if spans.is_empty() {
                    return Err(TableError::EmptyMean {
                        backend: table.backend,
                    });
                }
                let mut sum = 0.0;
                for span in spans {
                    sum += span.measure(table, landmarks, width, height)?;
                }
                Ok(sum / spans.len() as f64)
            }
            Span::Scaled { span, factor } => {
                Ok(span.measure(table, landmarks, width, height)? * factor)
            }
        }
    }

    fn validate(&self, table: &LandmarkTable) -> Result<(), TableError> {
        match self {
            Span::Horizontal(kps) | Span::Vertical(kps) | Span::Euclidean(kps) => {
                kps.iter().try_for_each(|kp| table.resolve(*kp).map(|_| ()))
            }
            Span::VerticalFromMidpoint { from, to } => {
                from.iter()
                    .chain(std::iter::once(to))
                    .try_for_each(|kp| table.resolve(*kp).map(|_| ()))
            }
            Span::Mean(spans) => {
                if spans.is_empty() {
                    return Err(TableError::EmptyMean {
                        backend: table.backend,
                    });
                }
                spans.iter().try_for_each(|s| s.validate(table))
            }
            Span::Scaled { span, factor } => {
                if !factor.is_finite() || *factor <= 0.0 {
                    return Err(TableError::BadFactor {
                        backend: table.backend,
                        factor: *factor,
                    });
                }
                span.validate(table)
            }
        }
    }
}

/// The spans for every raw distance the calibrator averages.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DistanceSpans {
    pub iris_width: Span,
    pub dp: Span,
    pub face_width: Span,
    pub lens_height: Span,
    pub temple_width: Span,
    pub nose_length: Span,
}

/// Landmark table for one backend.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LandmarkTable {
    pub backend: Backend,
    pub keypoints: KeypointIndices,
    pub distances: DistanceSpans,
}

impl LandmarkTable {
    /// Parse and validate a table from TOML source.
    pub fn from_toml(name: &str, src: &str) -> Result<Self, TableError> {
        let table: LandmarkTable = toml::from_str(src).map_err(|e| TableError::Parse {
            name: name.to_string(),
            reason: e.to_string(),
        })?;
        table.validate()?;
        Ok(table)
    }

    /// Resolve a keypoint to a landmark index valid for this backend.
    pub fn resolve(&self, keypoint: Keypoint) -> Result<usize, TableError> {
        let index = self
            .keypoints
            .index(keypoint)
            .ok_or(TableError::MissingKeypoint {
                backend: self.backend,
                keypoint,
            })?;
        let count = self.backend.point_count();
        if index >= count {
            return Err(TableError::IndexOutOfRange {
                backend: self.backend,
                keypoint,
                index,
                count,
            });
        }
        Ok(index)
    }

    fn point<'a>(&self, landmarks: &'a LandmarkSet, keypoint: Keypoint) -> Result<&'a Point, TableError> {
        let index = self.resolve(keypoint)?;
        landmarks.get(index).ok_or(TableError::IndexOutOfRange {
            backend: landmarks.backend(),
            keypoint,
            index,
            count: landmarks.points().len(),
        })
    }

    fn validate(&self) -> Result<(), TableError> {
        let d = &self.distances;
        for span in [
            &d.iris_width,
            &d.dp,
            &d.face_width,
            &d.lens_height,
            &d.temple_width,
            &d.nose_length,
        ] {
            span.validate(self)?;
        }
        Ok(())
    }
}

/// One table per backend.
#[derive(Debug, Clone)]
pub struct LandmarkTables {
    tables: BTreeMap<Backend, LandmarkTable>,
}

impl LandmarkTables {
    /// The compile-time embedded default tables, parsed once.
    pub fn embedded() -> Result<&'static LandmarkTables, TableError> {
        EMBEDDED
            .get_or_init(|| {
                Self::from_sources([
                    ("mesh.toml", MESH_TABLE),
                    ("multibox.toml", MULTIBOX_TABLE),
                    ("point68.toml", POINT68_TABLE),
                ])
            })
            .as_ref()
            .map_err(Clone::clone)
    }

    fn from_sources<'a>(
        sources: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Result<Self, TableError> {
        let mut tables = BTreeMap::new();
        for (name, src) in sources {
            let table = LandmarkTable::from_toml(name, src)?;
            tables.insert(table.backend, table);
        }
        for backend in Backend::PRIORITY {
            if !tables.contains_key(&backend) {
                return Err(TableError::MissingTable(backend));
            }
        }
        Ok(Self { tables })
    }

    /// Load `<backend>.toml` overrides from `dir`; backends without a file
    /// keep the embedded table.
    pub fn load_dir(dir: &Path) -> Result<Self, TableError> {
        let mut tables = Self::embedded()?.clone();
        for backend in Backend::PRIORITY {
            let path = dir.join(format!("{}.toml", backend.name()));
            if !path.exists() {
                continue;
            }
            let src = std::fs::read_to_string(&path).map_err(|e| TableError::Io {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
            let table = LandmarkTable::from_toml(&path.display().to_string(), &src)?;
            if table.backend != backend {
                return Err(TableError::BackendMismatch {
                    file: path.display().to_string(),
                    declared: table.backend,
                });
            }
            tracing::info!(backend = %backend, path = %path.display(), "landmark table override loaded");
            tables.tables.insert(backend, table);
        }
        Ok(tables)
    }

    pub fn get(&self, backend: Backend) -> Result<&LandmarkTable, TableError> {
        self.tables
            .get(&backend)
            .ok_or(TableError::MissingTable(backend))
    }
}
