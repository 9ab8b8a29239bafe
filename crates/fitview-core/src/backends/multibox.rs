//! Short-range multi-box face detector (BlazeFace-style SSD).
//!
//! 128×128 input in [-1, 1], 896 fixed-size anchors over strides 8 and 16,
//! 16 regressors per anchor (box + 6 keypoints) and one score logit.

use super::{letterbox_tensor, nms, open_session, output_names, sigmoid, Detection, Letterbox, Normalization};
use crate::detector::{DetectorError, LandmarkDetector};
use crate::types::{Backend, FaceBox, Frame, LandmarkSet, Point};
use image::RgbImage;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;

const INPUT_SIZE: usize = 128;
const NUM_ANCHORS: usize = 896;
const NUM_KEYPOINTS: usize = 6;
const REGRESSORS_PER_ANCHOR: usize = 4 + NUM_KEYPOINTS * 2;
/// (stride, anchors per cell); layers sharing a stride are merged.
const ANCHOR_LAYERS: [(usize, usize); 2] = [(8, 2), (16, 6)];
const SCORE_THRESHOLD: f32 = 0.5;
const NMS_THRESHOLD: f32 = 0.3;

#[derive(Debug, Clone, Copy, PartialEq)]
struct Anchor {
    cx: f32,
    cy: f32,
}

fn generate_anchors() -> Vec<Anchor> {
    let mut anchors = Vec::with_capacity(NUM_ANCHORS);
    for (stride, per_cell) in ANCHOR_LAYERS {
        let grid = INPUT_SIZE / stride;
        for row in 0..grid {
            for col in 0..grid {
                let anchor = Anchor {
                    cx: (col as f32 + 0.5) / grid as f32,
                    cy: (row as f32 + 0.5) / grid as f32,
                };
                anchors.extend(std::iter::repeat(anchor).take(per_cell));
            }
        }
    }
    anchors
}

pub struct MultiBoxDetector {
    session: Session,
    anchors: Vec<Anchor>,
    regressors_idx: usize,
    scores_idx: usize,
}

impl MultiBoxDetector {
    pub fn load(model_path: &Path) -> Result<Self, DetectorError> {
        let session = open_session(model_path)?;
        let names = output_names(&session);
        tracing::info!(path = %model_path.display(), outputs = ?names, "loaded multi-box face model");

        if names.len() < 2 {
            return Err(DetectorError::UnexpectedOutput(format!(
                "multi-box model requires 2 outputs (regressors, scores), got {}",
                names.len()
            )));
        }
        let (regressors_idx, scores_idx) = discover_output_indices(&names);

        Ok(Self {
            session,
            anchors: generate_anchors(),
            regressors_idx,
            scores_idx,
        })
    }

    /// All faces in `image`, best first, in frame pixels.
    pub(crate) fn detect_faces(&mut self, image: &RgbImage) -> Result<Vec<Detection>, DetectorError> {
        let (input, letterbox) = letterbox_tensor(image, INPUT_SIZE, Normalization::SYMMETRIC);
        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, regressors) = outputs[self.regressors_idx]
            .try_extract_tensor::<f32>()
            .map_err(|e| DetectorError::InferenceFailed(format!("regressors: {e}")))?;
        let (_, scores) = outputs[self.scores_idx]
            .try_extract_tensor::<f32>()
            .map_err(|e| DetectorError::InferenceFailed(format!("scores: {e}")))?;

        if regressors.len() < NUM_ANCHORS * REGRESSORS_PER_ANCHOR || scores.len() < NUM_ANCHORS {
            return Err(DetectorError::UnexpectedOutput(format!(
                "expected {NUM_ANCHORS}x{REGRESSORS_PER_ANCHOR} regressors and {NUM_ANCHORS} scores, got {} and {}",
                regressors.len(),
                scores.len()
            )));
        }

        let detections = decode(regressors, scores, &self.anchors, &letterbox, SCORE_THRESHOLD);
        Ok(nms(detections, NMS_THRESHOLD))
    }
}

impl LandmarkDetector for MultiBoxDetector {
    fn backend(&self) -> Backend {
        Backend::MultiBox
    }

    fn detect(&mut self, frame: &Frame) -> Result<Option<LandmarkSet>, DetectorError> {
        let faces = self.detect_faces(frame.image())?;
        let Some(best) = faces.into_iter().next() else {
            return Ok(None);
        };
        let (w, h) = (frame.width() as f32, frame.height() as f32);
        let points = best
            .keypoints
            .iter()
            .map(|&(x, y)| Point::new(x / w, y / h))
            .collect();
        Ok(Some(LandmarkSet::new(Backend::MultiBox, points)?))
    }
}

/// Find (regressors, scores) by name, falling back to positional order.
fn discover_output_indices(names: &[String]) -> (usize, usize) {
    let find = |needle: &str| names.iter().position(|n| n.to_lowercase().contains(needle));
    match (find("regressor"), find("classificator").or_else(|| find("score"))) {
        (Some(r), Some(s)) if r != s => (r, s),
        _ => {
            tracing::info!(?names, "multi-box output names not recognized, using positional mapping [0]=regressors, [1]=scores");
            (0, 1)
        }
    }
}

/// Decode anchors scoring above `threshold` into frame-space detections.
fn decode(
    regressors: &[f32],
    scores: &[f32],
    anchors: &[Anchor],
    letterbox: &Letterbox,
    threshold: f32,
) -> Vec<Detection> {
    let size = INPUT_SIZE as f32;
    let mut detections = Vec::new();

    for (idx, anchor) in anchors.iter().enumerate() {
        let score = sigmoid(scores.get(idx).copied().unwrap_or(f32::MIN));
        if score < threshold {
            continue;
        }
        let Some(raw) = regressors.get(idx * REGRESSORS_PER_ANCHOR..(idx + 1) * REGRESSORS_PER_ANCHOR) else {
            continue;
        };

        // Offsets are in input pixels relative to the anchor centre.
        let cx = raw[0] + anchor.cx * size;
        let cy = raw[1] + anchor.cy * size;
        let (x1, y1) = letterbox.to_frame(cx - raw[2] / 2.0, cy - raw[3] / 2.0);
        let (x2, y2) = letterbox.to_frame(cx + raw[2] / 2.0, cy + raw[3] / 2.0);

        let keypoints = (0..NUM_KEYPOINTS)
            .map(|k| {
                letterbox.to_frame(
                    raw[4 + k * 2] + anchor.cx * size,
                    raw[5 + k * 2] + anchor.cy * size,
                )
            })
            .collect();

        detections.push(Detection {
            face: FaceBox {
                x: x1,
                y: y1,
                width: x2 - x1,
                height: y2 - y1,
                confidence: score,
            },
            keypoints,
        });
    }
    detections
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_anchor_layout() {
        let anchors = generate_anchors();
        assert_eq!(anchors.len(), NUM_ANCHORS);
        // stride 8: 16x16 grid, two anchors per cell
        assert_eq!(anchors[0], Anchor { cx: 0.5 / 16.0, cy: 0.5 / 16.0 });
        assert_eq!(anchors[0], anchors[1]);
        assert_eq!(anchors[2].cx, 1.5 / 16.0);
        // stride 16 starts after 512 anchors: 8x8 grid, six per cell
        assert_eq!(anchors[512], Anchor { cx: 0.5 / 8.0, cy: 0.5 / 8.0 });
        assert_eq!(anchors[518].cx, 1.5 / 8.0);
    }

    #[test]
    fn test_decode_maps_to_frame_space() {
        let anchors = generate_anchors();
        let mut regressors = vec![0.0f32; NUM_ANCHORS * REGRESSORS_PER_ANCHOR];
        let mut scores = vec![-10.0f32; NUM_ANCHORS];

        // anchor 512 centre is (8, 8) in input pixels
        scores[512] = 5.0;
        let raw = &mut regressors[512 * REGRESSORS_PER_ANCHOR..513 * REGRESSORS_PER_ANCHOR];
        raw[0] = 2.0; // cx offset
        raw[2] = 8.0; // width
        raw[3] = 4.0; // height
        raw[4] = -2.0; // first keypoint x offset

        // 256x128 frame letterboxed into 128: scale 0.5, pad_y 32
        let letterbox = Letterbox::fit(256, 128, INPUT_SIZE);
        let dets = decode(&regressors, &scores, &anchors, &letterbox, SCORE_THRESHOLD);

        assert_eq!(dets.len(), 1);
        let d = &dets[0];
        // box centre (10, 8) input → (20, -48) frame
        assert!((d.face.x - 12.0).abs() < 1e-4, "x {}", d.face.x);
        assert!((d.face.width - 16.0).abs() < 1e-4);
        assert!((d.face.height - 8.0).abs() < 1e-4);
        assert_eq!(d.keypoints.len(), NUM_KEYPOINTS);
        assert!((d.keypoints[0].0 - 12.0).abs() < 1e-4);
        assert!(d.face.confidence > 0.99);
    }

    #[test]
    fn test_decode_skips_low_scores() {
        let anchors = generate_anchors();
        let regressors = vec![0.0f32; NUM_ANCHORS * REGRESSORS_PER_ANCHOR];
        let scores = vec![0.0f32; NUM_ANCHORS]; // sigmoid(0) = 0.5
        let letterbox = Letterbox::fit(128, 128, INPUT_SIZE);
        assert_eq!(decode(&regressors, &scores, &anchors, &letterbox, 0.6).len(), 0);
    }

    #[test]
    fn test_discover_output_indices() {
        let named: Vec<String> = ["classificators", "regressors"].iter().map(|s| s.to_string()).collect();
        assert_eq!(discover_output_indices(&named), (1, 0));

        let generic: Vec<String> = ["Identity", "Identity_1"].iter().map(|s| s.to_string()).collect();
        assert_eq!(discover_output_indices(&generic), (0, 1));
    }
}
