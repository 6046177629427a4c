//! Detection-to-track matching primitives.
//!
//! The cost of pairing a track with a detection is the error a
//! loosely-coupled detection factor would have at the track's predicted
//! pose, expressed in the sensor frame and weighted by the tier's matching
//! noise. Each track independently picks its cheapest detection; ties
//! across tracks resolve greedily (first come wins) through the `claimed`
//! mask.

use crate::core::se3::{self, Pose3};
use crate::core::types::Detection;

/// Matching error of one detection against a predicted pose in the sensor
/// frame: `0.5 · ‖Σ^{-1/2} · Log(Z⁻¹ · X̂⁻¹P̂)‖²`.
pub fn matching_error(detection: &Detection, predicted_sensor: &Pose3, variances: &[f64; 6]) -> f64 {
    let residual = se3::log(&se3::between(&detection.pose, predicted_sensor));
    let mut error = 0.0;
    for i in 0..6 {
        error += residual[i] * residual[i] / variances[i];
    }
    0.5 * error
}

/// Cheapest detection for a track under the given matching noise.
///
/// Detections already claimed by an earlier track are skipped when a
/// `claimed` mask is supplied; the wide fallback matcher passes `None` and
/// considers everything.
pub fn best_detection(
    detections: &[Detection],
    predicted_sensor: &Pose3,
    variances: &[f64; 6],
    claimed: Option<&[bool]>,
) -> Option<(usize, f64)> {
    let mut best: Option<(usize, f64)> = None;
    for (index, detection) in detections.iter().enumerate() {
        if let Some(mask) = claimed {
            if mask[index] {
                continue;
            }
        }
        let error = matching_error(detection, predicted_sensor, variances);
        if best.map_or(true, |(_, e)| error < e) {
            best = Some((index, error));
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Vector3;

    const LOOSE: [f64; 6] = [1e-1, 1e-1, 1e-1, 1.0, 1.0, 1.0];
    const WIDE: [f64; 6] = [10.0, 10.0, 10.0, 100.0, 100.0, 100.0];

    fn detection_at(x: f64, y: f64) -> Detection {
        Detection::new(
            se3::from_rpy_xyz(0.0, 0.0, 0.0, x, y, 0.0),
            Vector3::new(4.0, 2.0, 1.5),
        )
    }

    #[test]
    fn test_error_is_zero_at_exact_prediction() {
        let detection = detection_at(5.0, 1.0);
        let error = matching_error(&detection, &detection.pose, &LOOSE);
        assert_relative_eq!(error, 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_error_scales_with_offset() {
        let detection = detection_at(5.0, 0.0);
        let near = matching_error(&detection, &detection_at(5.5, 0.0).pose, &LOOSE);
        let far = matching_error(&detection, &detection_at(8.0, 0.0).pose, &LOOSE);
        assert!(near < far);
        // Half a meter under unit variance: 0.5 * 0.25.
        assert_relative_eq!(near, 0.125, epsilon = 1e-9);
    }

    #[test]
    fn test_picks_cheapest_detection() {
        let detections = vec![detection_at(2.0, 0.0), detection_at(5.0, 0.0)];
        let predicted = detection_at(4.6, 0.0).pose;
        let (index, _) = best_detection(&detections, &predicted, &LOOSE, None).unwrap();
        assert_eq!(index, 1);
    }

    #[test]
    fn test_claimed_detection_is_skipped() {
        let detections = vec![detection_at(2.0, 0.0), detection_at(5.0, 0.0)];
        let predicted = detection_at(4.6, 0.0).pose;
        let claimed = vec![false, true];
        let (index, _) = best_detection(&detections, &predicted, &LOOSE, Some(&claimed)).unwrap();
        assert_eq!(index, 0);
    }

    #[test]
    fn test_wide_noise_accepts_distant_reacquisition() {
        let detections = vec![detection_at(12.0, 0.0)];
        let predicted = detection_at(5.0, 0.0).pose;
        let (_, loose_error) = best_detection(&detections, &predicted, &LOOSE, None).unwrap();
        let (_, wide_error) = best_detection(&detections, &predicted, &WIDE, None).unwrap();
        assert!(loose_error > 4.0, "loose gate must reject: {loose_error}");
        assert!(wide_error < 4.0, "fallback gate must accept: {wide_error}");
    }

    #[test]
    fn test_empty_detections_yield_none() {
        assert!(best_detection(&[], &Pose3::identity(), &LOOSE, None).is_none());
    }
}
