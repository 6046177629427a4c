//! Estimation-result export.
//!
//! Rebuilds the robot trajectory and every per-object trajectory from the
//! *current* smoother estimate, so a save after a loop closure reflects the
//! corrected history. Serializable with serde; the save helper writes JSON.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::core::se3::{self, Pose3};
use crate::core::types::KeyPose;
use crate::engine::graph::smoother::Values;
use crate::engine::tracking::track::ObjectTrack;
use crate::engine::tracking::TrackCounters;
use crate::error::Result;

/// A timestamped 6D pose in a serializable layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoseRecord {
    /// Timestamp, microseconds.
    pub timestamp_us: u64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub roll: f64,
    pub pitch: f64,
    pub yaw: f64,
}

impl PoseRecord {
    /// Flatten a pose.
    pub fn from_pose(timestamp_us: u64, pose: &Pose3) -> Self {
        let t = pose.translation.vector;
        let (roll, pitch, yaw) = se3::rpy(pose);
        Self {
            timestamp_us,
            x: t.x,
            y: t.y,
            z: t.z,
            roll,
            pitch,
            yaw,
        }
    }
}

/// One step of a tracked object's state stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectStateRecord {
    /// Timestamp, microseconds.
    pub timestamp_us: u64,
    /// Smoothed object pose.
    pub pose: PoseRecord,
    /// Smoothed velocity (SE(3) in tangent, as a pose record).
    pub velocity: PoseRecord,
    /// Graph-level identifier.
    pub object_index: u64,
    /// Scans since the last association.
    pub lost_count: i32,
    /// Matched detection confidence.
    pub confidence: f64,
    /// Whether the step was tightly coupled.
    pub is_tightly_coupled: bool,
}

/// Everything the save-estimation-result service returns.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EstimationResult {
    /// Ego key-pose trajectory.
    pub robot_trajectory: Vec<PoseRecord>,
    /// Pose trajectory per `object_index`.
    pub object_trajectories: Vec<Vec<PoseRecord>>,
    /// Velocity trajectory per `object_index`.
    pub object_velocities: Vec<Vec<PoseRecord>>,
    /// Pose trajectory per `tracking_index`.
    pub tracking_object_trajectories: Vec<Vec<PoseRecord>>,
    /// Velocity trajectory per `tracking_index`.
    pub tracking_object_velocities: Vec<Vec<PoseRecord>>,
    /// Per-step tight-coupling flags per `object_index`.
    pub object_flags: Vec<Vec<bool>>,
    /// Per-step tight-coupling flags per `tracking_index`.
    pub tracking_object_flags: Vec<Vec<bool>>,
    /// Full state stream per `tracking_index`.
    pub tracking_object_states: Vec<Vec<ObjectStateRecord>>,
}

impl EstimationResult {
    /// Assemble the export from the cached history and the current
    /// smoother estimate. Lost steps never joined the optimization and are
    /// skipped.
    pub fn build(
        key_poses: &[KeyPose],
        steps: &[BTreeMap<u64, ObjectTrack>],
        estimates: &Values,
        counters: TrackCounters,
    ) -> Self {
        let mut result = EstimationResult {
            robot_trajectory: key_poses
                .iter()
                .map(|kp| PoseRecord::from_pose(kp.timestamp_us, &kp.pose))
                .collect(),
            object_trajectories: vec![Vec::new(); counters.registered as usize],
            object_velocities: vec![Vec::new(); counters.registered as usize],
            tracking_object_trajectories: vec![Vec::new(); counters.tracking as usize],
            tracking_object_velocities: vec![Vec::new(); counters.tracking as usize],
            object_flags: vec![Vec::new(); counters.registered as usize],
            tracking_object_flags: vec![Vec::new(); counters.tracking as usize],
            tracking_object_states: vec![Vec::new(); counters.tracking as usize],
        };

        for step in steps {
            for track in step.values() {
                if track.lost_count > 0 {
                    continue;
                }
                let (Some(pose), Some(velocity)) = (
                    estimates.get(track.pose_node),
                    estimates.get(track.velocity_node),
                ) else {
                    continue;
                };
                let pose_record = PoseRecord::from_pose(track.timestamp_us, pose);
                let velocity_record = PoseRecord::from_pose(track.timestamp_us, velocity);
                let object = track.object_index as usize;
                let tracking = track.tracking_index as usize;

                result.object_trajectories[object].push(pose_record.clone());
                result.object_velocities[object].push(velocity_record.clone());
                result.tracking_object_trajectories[tracking].push(pose_record.clone());
                result.tracking_object_velocities[tracking].push(velocity_record.clone());
                result.object_flags[object].push(track.is_tightly_coupled);
                result.tracking_object_flags[tracking].push(track.is_tightly_coupled);
                result.tracking_object_states[tracking].push(ObjectStateRecord {
                    timestamp_us: track.timestamp_us,
                    pose: pose_record,
                    velocity: velocity_record,
                    object_index: track.object_index,
                    lost_count: track.lost_count,
                    confidence: track.confidence,
                    is_tightly_coupled: track.is_tightly_coupled,
                });
            }
        }
        result
    }

    /// Write the result as JSON.
    pub fn save(&self, path: &Path) -> Result<()> {
        let out = BufWriter::new(File::create(path)?);
        serde_json::to_writer(out, self)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Detection;
    use nalgebra::Vector3;

    fn seeded_history() -> (Vec<BTreeMap<u64, ObjectTrack>>, Values, TrackCounters) {
        let detection = Detection::new(Pose3::identity(), Vector3::new(4.0, 2.0, 1.5));
        let mut counters = TrackCounters::default();
        let object = counters.next_object();
        let tracking = counters.next_tracking();

        let mut track = ObjectTrack::register(
            object,
            tracking,
            se3::from_rpy_xyz(0.0, 0.0, 0.0, 5.0, 0.0, 0.0),
            10,
            11,
            detection,
            1_000_000,
        );
        track.is_tightly_coupled = true;

        let mut lost = track.clone();
        lost.lost_count = 1;
        lost.pose_node = 12;
        lost.velocity_node = 13;

        let mut estimates = Values::new();
        estimates.insert(10, track.pose);
        estimates.insert(11, Pose3::identity());

        let mut first = BTreeMap::new();
        first.insert(object, track);
        let mut second = BTreeMap::new();
        second.insert(object, lost);
        (vec![first, second], estimates, counters)
    }

    #[test]
    fn test_build_skips_lost_steps() {
        let (steps, estimates, counters) = seeded_history();
        let result = EstimationResult::build(&[], &steps, &estimates, counters);
        assert_eq!(result.object_trajectories.len(), 1);
        assert_eq!(result.object_trajectories[0].len(), 1);
        assert_eq!(result.tracking_object_states[0].len(), 1);
        assert_eq!(result.object_flags[0], vec![true]);
        assert_eq!(result.object_trajectories[0][0].x, 5.0);
    }

    #[test]
    fn test_save_round_trips_json() {
        let (steps, estimates, counters) = seeded_history();
        let result = EstimationResult::build(&[], &steps, &estimates, counters);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("estimation.json");
        result.save(&path).unwrap();

        let back: EstimationResult =
            serde_json::from_reader(File::open(&path).unwrap()).unwrap();
        assert_eq!(back.tracking_object_trajectories[0].len(), 1);
        assert_eq!(back.tracking_object_states[0][0].object_index, 0);
    }
}
