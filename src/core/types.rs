//! Core data types shared across the estimator.

use std::sync::Arc;

use nalgebra::{Matrix6, Vector3};

use crate::core::se3::Pose3;

/// Identifier of a variable node in the smoother. Monotonically increasing,
/// never reused.
pub type NodeKey = u64;

/// A 3D point cloud in struct-of-arrays layout.
#[derive(Debug, Clone, Default)]
pub struct PointCloud3 {
    /// X coordinates in meters.
    pub xs: Vec<f32>,
    /// Y coordinates in meters.
    pub ys: Vec<f32>,
    /// Z coordinates in meters.
    pub zs: Vec<f32>,
}

impl PointCloud3 {
    /// Create an empty cloud.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty cloud with reserved capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            xs: Vec::with_capacity(capacity),
            ys: Vec::with_capacity(capacity),
            zs: Vec::with_capacity(capacity),
        }
    }

    /// Append a point.
    #[inline]
    pub fn push(&mut self, x: f32, y: f32, z: f32) {
        self.xs.push(x);
        self.ys.push(y);
        self.zs.push(z);
    }

    /// Number of points.
    #[inline]
    pub fn len(&self) -> usize {
        self.xs.len()
    }

    /// Whether the cloud holds no points.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.xs.is_empty()
    }

    /// Iterate points as `(x, y, z)` tuples.
    pub fn iter(&self) -> impl Iterator<Item = (f32, f32, f32)> + '_ {
        self.xs
            .iter()
            .zip(self.ys.iter())
            .zip(self.zs.iter())
            .map(|((&x, &y), &z)| (x, y, z))
    }

    /// Cloud transformed into the frame given by `pose`.
    pub fn transform(&self, pose: &Pose3) -> PointCloud3 {
        let mut out = PointCloud3::with_capacity(self.len());
        for (x, y, z) in self.iter() {
            let p = pose * nalgebra::Point3::new(x as f64, y as f64, z as f64);
            out.push(p.x as f32, p.y as f32, p.z as f32);
        }
        out
    }

    /// Append all points of `other`.
    pub fn extend(&mut self, other: &PointCloud3) {
        self.xs.extend_from_slice(&other.xs);
        self.ys.extend_from_slice(&other.ys);
        self.zs.extend_from_slice(&other.zs);
    }
}

/// An oriented bounding-box detection as the external detector reports it.
#[derive(Debug, Clone)]
pub struct Detection {
    /// Box pose (sensor frame on input, world frame on outputs).
    pub pose: Pose3,
    /// Box extents in meters.
    pub dimensions: Vector3<f64>,
    /// Detector confidence.
    pub score: f64,
    /// Detector class label.
    pub label: u32,
}

impl Detection {
    /// Create a detection from a pose and box extents.
    pub fn new(pose: Pose3, dimensions: Vector3<f64>) -> Self {
        Self {
            pose,
            dimensions,
            score: 0.0,
            label: 0,
        }
    }

    /// Same detection with its pose replaced.
    pub fn with_pose(&self, pose: Pose3) -> Self {
        Self {
            pose,
            ..self.clone()
        }
    }
}

/// Per-scan input to the joint estimator.
///
/// The scan-to-map registration loop is an external collaborator: it hands
/// over the registered pose (or the IMU/odometry prior when features were
/// insufficient) together with the flags describing how it got there.
#[derive(Debug, Clone)]
pub struct ScanInput {
    /// Scan timestamp in microseconds.
    pub timestamp_us: u64,
    /// Ego pose from scan-to-map registration (world frame).
    pub registered_pose: Pose3,
    /// False when registration was skipped and `registered_pose` is the
    /// propagated prior.
    pub registration_refined: bool,
    /// Registration hit a degenerate direction; the odometry covariance is
    /// marked in the output.
    pub is_degenerate: bool,
    /// Corner feature cloud in sensor frame.
    pub corner_cloud: PointCloud3,
    /// Surface feature cloud in sensor frame.
    pub surf_cloud: PointCloud3,
    /// Deskewed raw cloud handed to the detector.
    pub raw_cloud: Arc<PointCloud3>,
}

/// A timestamped GNSS fix with its 6x6 covariance.
#[derive(Debug, Clone)]
pub struct GnssSample {
    /// Sample timestamp in microseconds.
    pub timestamp_us: u64,
    /// Position in the odometry frame.
    pub position: Vector3<f64>,
    /// Full pose covariance; only the positional diagonal is gated on.
    pub covariance: Matrix6<f64>,
}

/// A loop-closure constraint between two ego key-poses, produced by the
/// (external) ICP registrar and drained by the orchestrator.
#[derive(Debug, Clone)]
pub struct LoopConstraint {
    /// Key-pose index of the newer end.
    pub from_index: usize,
    /// Key-pose index of the older end.
    pub to_index: usize,
    /// Measured relative pose `from⁻¹ · to`.
    pub relative: Pose3,
    /// Isotropic variance derived from the ICP fitness score.
    pub variance: f64,
}

/// A loop-closure hint naming two scan times; the worker resolves them to
/// key-pose indices before calling the registrar.
#[derive(Debug, Clone, Copy)]
pub struct LoopHint {
    /// Timestamp of the current (newer) scan, microseconds.
    pub timestamp_cur_us: u64,
    /// Timestamp of the revisited scan, microseconds.
    pub timestamp_prev_us: u64,
}

/// An ego key-pose as cached outside the smoother.
#[derive(Debug, Clone)]
pub struct KeyPose {
    /// Dense index in the key-pose history (also the map-tile id).
    pub index: usize,
    /// Variable key in the smoother.
    pub node: NodeKey,
    /// Current pose estimate.
    pub pose: Pose3,
    /// Key-frame timestamp in microseconds.
    pub timestamp_us: u64,
}

/// Current and creation-time error of a factor, for diagnostics.
#[derive(Debug, Clone, Copy)]
pub struct FactorErrors {
    /// Error at the latest smoother estimate.
    pub current: f64,
    /// Error at the values the factor was created with.
    pub initial: f64,
}

/// Per-scan state of one tracked object, as published to consumers.
#[derive(Debug, Clone)]
pub struct ObjectState {
    /// Scan timestamp in microseconds.
    pub timestamp_us: u64,
    /// Raw detection this state was matched to.
    pub detection: Detection,
    /// Estimated box in the world frame.
    pub bounding_box: Detection,
    /// Estimated object pose.
    pub pose: Pose3,
    /// Estimated velocity (SE(3) element; its log is the per-second twist).
    pub velocity: Pose3,
    /// Graph-level track identifier, unique per registration.
    pub object_index: u64,
    /// User-facing MOT identifier, stable across re-acquisition.
    pub tracking_index: u64,
    /// Scans since the last association.
    pub lost_count: i32,
    /// Detector confidence of the matched detection.
    pub confidence: f64,
    /// Whether the detection factor at this step sits in the ego partition.
    pub is_tightly_coupled: bool,
    /// True only on the registration step.
    pub is_first: bool,
    /// Detection-factor errors, when a detection factor exists at this step.
    pub detection_error: Option<FactorErrors>,
    /// Motion-factor errors, when a motion factor exists at this step.
    pub motion_error: Option<FactorErrors>,
}

/// Per-scan processing diagnosis.
#[derive(Debug, Clone, Copy, Default)]
pub struct Diagnosis {
    /// Scan timestamp in microseconds.
    pub timestamp_us: u64,
    /// Number of detections the detector returned.
    pub num_detections: usize,
    /// Wall time spent processing this scan, milliseconds.
    pub processing_ms: f64,
    /// Number of tightly-coupled objects at this scan.
    pub num_tightly_coupled: usize,
}

/// Result of processing one scan.
#[derive(Debug, Clone)]
pub struct ScanResult {
    /// Ego pose after the joint update (world frame).
    pub pose: Pose3,
    /// Ego motion since the previous processed scan.
    pub incremental: Pose3,
    /// Degenerate-registration flag carried through from the input.
    pub is_degenerate: bool,
    /// Whether this scan was promoted to a key-frame.
    pub keyframe_added: bool,
    /// States of all active tracks at this scan.
    pub objects: Vec<ObjectState>,
    /// Processing diagnosis.
    pub diagnosis: Diagnosis,
}
