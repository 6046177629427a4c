//! Shared harness for the end-to-end scenarios: a deterministic synthetic
//! world feeding registration poses and scripted detections into the
//! estimator.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use nalgebra::Vector3;

use gati_slam::core::se3::{self, Pose3};
use gati_slam::{Detection, DetectionSource, EstimatorConfig, PointCloud3, ScanInput};

/// Reference configuration used by the scenarios: 0.5 m key-frame gate and
/// a strict angular velocity-consistency tolerance.
pub fn reference_config() -> EstimatorConfig {
    let mut config = EstimatorConfig::default();
    // Just under the 0.5 m scan stride, so a refined key-pose a hair short
    // of the stride still promotes.
    config.keyframe.add_distance_threshold = 0.45;
    config.keyframe.add_angle_threshold = 0.2;
    config.tracking.angular_velocity_consistency_variance = 1e-6;
    config
}

/// A small wall-like feature cloud so the map export has something to write.
pub fn feature_cloud() -> PointCloud3 {
    let mut cloud = PointCloud3::new();
    for i in 0..10 {
        cloud.push(2.0, i as f32 * 0.2, 0.5);
    }
    cloud
}

/// Scan input at `t` seconds with the given registered pose.
pub fn scan_at(t: u64, registered_pose: Pose3) -> ScanInput {
    ScanInput {
        timestamp_us: t * 1_000_000,
        registered_pose,
        registration_refined: true,
        is_degenerate: false,
        corner_cloud: feature_cloud(),
        surf_cloud: feature_cloud(),
        raw_cloud: Arc::new(feature_cloud()),
    }
}

/// A detection box facing `yaw` at `(x, y)` in the sensor frame.
pub fn box_at(x: f64, y: f64, yaw: f64) -> Detection {
    let mut detection = Detection::new(
        se3::from_rpy_xyz(0.0, 0.0, yaw, x, y, 0.0),
        Vector3::new(4.0, 2.0, 1.5),
    );
    detection.score = 0.9;
    detection
}

/// Detector returning one pre-scripted frame per scan; `None` frames model
/// an RPC failure, exhausted scripts keep failing.
pub struct ScriptedDetector {
    frames: Mutex<VecDeque<Option<Vec<Detection>>>>,
}

impl ScriptedDetector {
    pub fn new(frames: Vec<Option<Vec<Detection>>>) -> Arc<Self> {
        Arc::new(Self {
            frames: Mutex::new(frames.into()),
        })
    }
}

impl DetectionSource for ScriptedDetector {
    fn detect(&self, _cloud: &PointCloud3) -> Option<Vec<Detection>> {
        self.frames
            .lock()
            .expect("detector script mutex")
            .pop_front()
            .unwrap_or(None)
    }
}

/// Ego pose driving straight along +x, 0.5 m per scan, first scan at 0.5 m.
pub fn straight_pose(t: u64) -> Pose3 {
    se3::from_rpy_xyz(0.0, 0.0, 0.0, 0.5 * (t + 1) as f64, 0.0, 0.0)
}
