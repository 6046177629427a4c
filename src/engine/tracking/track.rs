//! Per-track state for moving objects.

use std::collections::VecDeque;

use nalgebra::Vector6;

use crate::core::se3::{self, Pose3};
use crate::core::types::{Detection, NodeKey};
use crate::engine::graph::smoother::{FactorId, Values};

/// One tracked moving object.
///
/// The factor graph owns the factors; a track keeps only opaque handles to
/// its latest detection and motion factor for diagnostic error reporting.
#[derive(Debug, Clone)]
pub struct ObjectTrack {
    /// Current pose estimate (world frame).
    pub pose: Pose3,
    /// Current velocity estimate (SE(3); its log is the per-second twist).
    pub velocity: Pose3,
    /// Pose variable at the current step.
    pub pose_node: NodeKey,
    /// Velocity variable at the current step.
    pub velocity_node: NodeKey,
    /// Graph-level identifier, unique per registration.
    pub object_index: u64,
    /// User-facing MOT identifier, stable across re-acquisition.
    pub tracking_index: u64,
    /// Scans since the last association; `i32::MAX` marks a tombstone.
    pub lost_count: i32,
    /// Coupling score; saturates at `pre_loose_steps + 1`, may go negative
    /// after demotions.
    pub track_score: i32,
    /// Timestamp of the current step, microseconds.
    pub timestamp_us: u64,
    /// Estimated bounding box in the world frame.
    pub bounding_box: Detection,
    /// Raw detection matched at the current step.
    pub detection: Detection,
    /// Confidence of the matched detection.
    pub confidence: f64,
    /// Whether the current detection factor sits in the ego partition.
    pub is_tightly_coupled: bool,
    /// True only on the registration step.
    pub is_first: bool,
    /// Number of associated steps so far; drives the early-window gates.
    pub active_steps: u32,
    /// Recent velocity nodes for the temporal consistency test.
    pub velocity_history: VecDeque<NodeKey>,
    /// Handle of the detection factor at the current step.
    pub detection_factor: Option<FactorId>,
    /// Handle of the motion factor at the current step.
    pub motion_factor: Option<FactorId>,
    /// Detection-factor error at creation time.
    pub initial_detection_error: f64,
    /// Motion-factor error at creation time.
    pub initial_motion_error: f64,
}

impl ObjectTrack {
    /// Register a fresh track from an unclaimed detection.
    pub fn register(
        object_index: u64,
        tracking_index: u64,
        pose: Pose3,
        pose_node: NodeKey,
        velocity_node: NodeKey,
        detection: Detection,
        timestamp_us: u64,
    ) -> Self {
        let confidence = detection.score;
        let bounding_box = detection.with_pose(pose);
        Self {
            pose,
            velocity: Pose3::identity(),
            pose_node,
            velocity_node,
            object_index,
            tracking_index,
            lost_count: 0,
            track_score: 0,
            timestamp_us,
            bounding_box,
            detection,
            confidence,
            is_tightly_coupled: false,
            is_first: true,
            active_steps: 0,
            velocity_history: VecDeque::new(),
            detection_factor: None,
            motion_factor: None,
            initial_detection_error: 0.0,
            initial_motion_error: 0.0,
        }
    }

    /// Whether the track has exceeded its lost budget and no longer gets
    /// variables or factors.
    pub fn is_retired(&self, lost_steps: i32) -> bool {
        self.lost_count > lost_steps
    }

    /// Mark a re-acquired track so the next propagation silently drops it;
    /// the detection is redirected to a fresh registration sharing this
    /// track's `tracking_index`.
    pub fn tombstone(&mut self) {
        self.lost_count = i32::MAX;
    }

    /// Remember the previous step's velocity node, keeping at most `window`
    /// entries.
    pub fn push_velocity_node(&mut self, node: NodeKey, window: usize) {
        self.velocity_history.push_back(node);
        while self.velocity_history.len() > window {
            self.velocity_history.pop_front();
        }
    }

    /// Temporal consistency test: mean Mahalanobis deviation of the last
    /// `window` velocity estimates from their mean, against a diagonal
    /// tolerance. Passes iff the mean error is below one.
    pub fn velocity_is_consistent(
        &self,
        window: usize,
        estimates: &Values,
        angular_variance: f64,
        linear_variance: f64,
    ) -> bool {
        if self.velocity_history.len() < window {
            return false;
        }

        let mut twists: Vec<Vector6<f64>> = Vec::with_capacity(window);
        for node in self.velocity_history.iter().rev().take(window) {
            match estimates.get(*node) {
                Some(velocity) => twists.push(se3::log(velocity)),
                None => return false,
            }
        }

        let mean = twists.iter().sum::<Vector6<f64>>() / window as f64;
        let mut error = 0.0;
        for twist in &twists {
            let d = twist - mean;
            for i in 0..3 {
                error += d[i] * d[i] / angular_variance;
            }
            for i in 3..6 {
                error += d[i] * d[i] / linear_variance;
            }
        }
        error /= window as f64;

        error < 1.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::se3::Tangent;
    use nalgebra::Vector3;

    fn dummy_detection() -> Detection {
        Detection::new(Pose3::identity(), Vector3::new(4.0, 2.0, 1.5))
    }

    fn track_with_history(nodes: &[NodeKey]) -> ObjectTrack {
        let mut track = ObjectTrack::register(0, 0, Pose3::identity(), 10, 11, dummy_detection(), 0);
        for node in nodes {
            track.push_velocity_node(*node, nodes.len());
        }
        track
    }

    #[test]
    fn test_registration_state() {
        let track = ObjectTrack::register(3, 1, Pose3::identity(), 10, 11, dummy_detection(), 5);
        assert!(track.is_first);
        assert_eq!(track.track_score, 0);
        assert_eq!(track.lost_count, 0);
        assert!(track.motion_factor.is_none());
    }

    #[test]
    fn test_history_is_bounded() {
        let mut track = ObjectTrack::register(0, 0, Pose3::identity(), 10, 11, dummy_detection(), 0);
        for node in 0..10u64 {
            track.push_velocity_node(node, 3);
        }
        assert_eq!(track.velocity_history.len(), 3);
        assert_eq!(track.velocity_history.front(), Some(&7));
    }

    #[test]
    fn test_consistency_requires_full_window() {
        let track = track_with_history(&[1, 2]);
        let values = Values::new();
        assert!(!track.velocity_is_consistent(3, &values, 1e-4, 1e-2));
    }

    #[test]
    fn test_constant_velocities_are_consistent() {
        let track = track_with_history(&[1, 2, 3]);
        let mut values = Values::new();
        let velocity = se3::exp(&Tangent::new(0.0, 0.0, 0.0, 0.5, 0.0, 0.0));
        for node in 1..=3 {
            values.insert(node, velocity);
        }
        assert!(track.velocity_is_consistent(3, &values, 1e-4, 1e-2));
    }

    #[test]
    fn test_varying_heading_rate_is_inconsistent() {
        let track = track_with_history(&[1, 2, 3]);
        let mut values = Values::new();
        for (node, yaw_rate) in [(1u64, 0.00), (2, 0.05), (3, -0.05)] {
            values.insert(
                node,
                se3::exp(&Tangent::new(0.0, 0.0, yaw_rate, 0.5, 0.0, 0.0)),
            );
        }
        assert!(!track.velocity_is_consistent(3, &values, 1e-4, 1e-2));
    }

    #[test]
    fn test_tombstone_retires_immediately() {
        let mut track = ObjectTrack::register(0, 0, Pose3::identity(), 10, 11, dummy_detection(), 0);
        track.tombstone();
        assert!(track.is_retired(3));
    }
}
