//! Manual estimation from a user-supplied pupillary distance, and
//! proportional rescaling of an existing measurement set.

use crate::types::{round_mm, MeasurementSet};
use std::ops::RangeInclusive;
use thiserror::Error;

/// Average adult pupillary distance the ratios are calibrated against.
pub const BASELINE_DP_MM: f64 = 62.0;

/// Range callers should clamp manual DP input to before estimating.
pub const RECOMMENDED_DP_RANGE_MM: RangeInclusive<f64> = 50.0..=80.0;

const FACE_WIDTH_RATIO: f64 = 140.0 / BASELINE_DP_MM;
const LENS_HEIGHT_RATIO: f64 = 35.0 / BASELINE_DP_MM;
const TEMPLE_WIDTH_RATIO: f64 = 130.0 / BASELINE_DP_MM;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum AdjustError {
    #[error("cannot rescale a measurement set whose dp is 0")]
    ZeroDp,
    #[error("invalid target dp {0}")]
    InvalidDp(f64),
}

/// Approximate a full measurement set from `dp_mm` alone.
///
/// Never fails; degenerate input yields degenerate (but finite) output.
/// Nose length is not modelled and left empty.
pub fn estimate_from_dp(dp_mm: f64) -> MeasurementSet {
    if !RECOMMENDED_DP_RANGE_MM.contains(&dp_mm) {
        tracing::debug!(dp_mm, "manual dp outside the recommended range");
    }
    MeasurementSet {
        dp: round_mm(dp_mm),
        face_width: round_mm(dp_mm * FACE_WIDTH_RATIO),
        lens_height: round_mm(dp_mm * LENS_HEIGHT_RATIO),
        temple_width: round_mm(dp_mm * TEMPLE_WIDTH_RATIO),
        nose_length: None,
    }
}

/// Scale every field of `current` by `new_dp / current.dp`.
pub fn rescale(current: &MeasurementSet, new_dp: f64) -> Result<MeasurementSet, AdjustError> {
    if current.dp == 0 {
        return Err(AdjustError::ZeroDp);
    }
    if !new_dp.is_finite() || new_dp < 0.0 {
        return Err(AdjustError::InvalidDp(new_dp));
    }
    let ratio = new_dp / f64::from(current.dp);
    let scale = |v: i32| round_mm(f64::from(v) * ratio);
    Ok(MeasurementSet {
        dp: round_mm(new_dp),
        face_width: scale(current.face_width),
        lens_height: scale(current.lens_height),
        temple_width: scale(current.temple_width),
        nose_length: current.nose_length.map(scale),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn baseline() -> MeasurementSet {
        MeasurementSet {
            dp: 62,
            face_width: 140,
            lens_height: 35,
            temple_width: 130,
            nose_length: None,
        }
    }

    #[test]
    fn test_baseline_estimate() {
        assert_eq!(estimate_from_dp(62.0), baseline());
    }

    #[test]
    fn test_estimate_scales_with_dp() {
        let m = estimate_from_dp(70.0);
        assert_eq!(m.dp, 70);
        assert_eq!(m.face_width, 158);
        assert_eq!(m.lens_height, 40);
        assert_eq!(m.temple_width, 147);
    }

    #[test]
    fn test_estimate_never_fails_on_degenerate_input() {
        let zero = estimate_from_dp(0.0);
        assert_eq!(zero.face_width, 0);
        assert_eq!(zero.temple_width, 0);
        let nan = estimate_from_dp(f64::NAN);
        assert_eq!(nan.dp, 0);
    }

    #[test]
    fn test_rescale_to_74() {
        let m = rescale(&baseline(), 74.0).unwrap();
        assert_eq!(m.dp, 74);
        assert_eq!(m.face_width, 167);
        assert_eq!(m.lens_height, 42);
        assert_eq!(m.temple_width, 155);
        assert_eq!(m.nose_length, None);
    }

    #[test]
    fn test_rescale_carries_nose_length() {
        let current = MeasurementSet {
            nose_length: Some(40),
            ..baseline()
        };
        let m = rescale(&current, 31.0).unwrap();
        assert_eq!(m.nose_length, Some(20));
        assert_eq!(m.face_width, 70);
    }

    #[test]
    fn test_rescale_rejects_zero_dp() {
        let current = MeasurementSet {
            dp: 0,
            ..baseline()
        };
        assert_eq!(rescale(&current, 64.0), Err(AdjustError::ZeroDp));
    }

    #[test]
    fn test_rescale_rejects_non_finite_target() {
        assert!(matches!(
            rescale(&baseline(), f64::INFINITY),
            Err(AdjustError::InvalidDp(_))
        ));
    }
}
