//! Constant-velocity roll-forward of active tracks.

use std::collections::BTreeMap;

use crate::core::se3;
use crate::engine::graph::smoother::FactorBuffer;
use crate::engine::tracking::track::ObjectTrack;
use crate::engine::NodeAllocator;

/// Sentinel node for steps where a lost track contributes no variables.
pub const NO_NODE: u64 = u64::MAX;

/// Rolls every active track forward by the scan interval and allocates the
/// step's variable nodes.
#[derive(Debug, Clone)]
pub struct Propagator {
    /// Retirement threshold (`L_max`).
    pub lost_steps: i32,
    /// Velocity-history window (`W`).
    pub velocity_window: usize,
}

impl Propagator {
    /// Advance the per-scan track table by one step.
    ///
    /// Tracks past their lost budget are dropped from the new step. Tracks
    /// associated at the previous step get fresh pose/velocity nodes with
    /// their predicted values staged into `values` (the ego-side buffer; the
    /// coupling machine moves them to the loose buffer when it decides so).
    /// Lost-but-not-retired tracks coast without variables.
    pub fn propagate(
        &self,
        steps: &mut Vec<BTreeMap<u64, ObjectTrack>>,
        dt: f64,
        timestamp_us: u64,
        nodes: &mut NodeAllocator,
        values: &mut FactorBuffer,
    ) {
        // First scan with tracking enabled: just open the table.
        let Some(previous) = steps.last() else {
            steps.push(BTreeMap::new());
            return;
        };

        let mut next = BTreeMap::new();
        for (object_index, prev) in previous {
            if prev.is_retired(self.lost_steps) {
                continue;
            }

            let mut track = prev.clone();
            track.pose = se3::step(&prev.pose, &prev.velocity, dt);
            track.is_first = false;
            track.timestamp_us = timestamp_us;

            if prev.lost_count == 0 {
                track.pose_node = nodes.allocate();
                track.velocity_node = nodes.allocate();
                values.insert_value(track.pose_node, track.pose);
                values.insert_value(track.velocity_node, track.velocity);
                track.push_velocity_node(prev.velocity_node, self.velocity_window);
            } else {
                track.pose_node = NO_NODE;
                track.velocity_node = NO_NODE;
            }

            next.insert(*object_index, track);
        }
        steps.push(next);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::se3::{Pose3, Tangent};
    use crate::core::types::Detection;
    use approx::assert_relative_eq;
    use nalgebra::Vector3;

    fn propagator() -> Propagator {
        Propagator {
            lost_steps: 3,
            velocity_window: 3,
        }
    }

    fn seeded_steps(lost_count: i32) -> Vec<BTreeMap<u64, ObjectTrack>> {
        let detection = Detection::new(Pose3::identity(), Vector3::new(4.0, 2.0, 1.5));
        let mut track = ObjectTrack::register(0, 0, Pose3::identity(), 4, 5, detection, 0);
        track.velocity = se3::exp(&Tangent::new(0.0, 0.0, 0.0, 0.5, 0.0, 0.0));
        track.lost_count = lost_count;
        let mut step = BTreeMap::new();
        step.insert(0, track);
        vec![step]
    }

    #[test]
    fn test_first_invocation_opens_table() {
        let mut steps = Vec::new();
        let mut nodes = NodeAllocator::new();
        let mut values = FactorBuffer::new();
        propagator().propagate(&mut steps, 1.0, 0, &mut nodes, &mut values);
        assert_eq!(steps.len(), 1);
        assert!(steps[0].is_empty());
    }

    #[test]
    fn test_active_track_gets_nodes_and_prediction() {
        let mut steps = seeded_steps(0);
        let mut nodes = NodeAllocator::new();
        nodes.allocate(); // pretend the ego key consumed node 0
        let mut values = FactorBuffer::new();
        propagator().propagate(&mut steps, 1.0, 1_000_000, &mut nodes, &mut values);

        let track = &steps[1][&0];
        assert!(!track.is_first);
        assert_relative_eq!(track.pose.translation.x, 0.5, epsilon = 1e-9);
        assert_ne!(track.pose_node, NO_NODE);
        assert!(values.staged_value(track.pose_node).is_some());
        assert!(values.staged_value(track.velocity_node).is_some());
        // The previous velocity node joined the consistency window.
        assert_eq!(track.velocity_history.back(), Some(&5));
    }

    #[test]
    fn test_lost_track_coasts_without_variables() {
        let mut steps = seeded_steps(1);
        let mut nodes = NodeAllocator::new();
        let mut values = FactorBuffer::new();
        propagator().propagate(&mut steps, 1.0, 1_000_000, &mut nodes, &mut values);

        let track = &steps[1][&0];
        assert_eq!(track.pose_node, NO_NODE);
        assert!(values.is_empty());
        // Still predicted forward so a late re-acquisition can match it.
        assert_relative_eq!(track.pose.translation.x, 0.5, epsilon = 1e-9);
    }

    #[test]
    fn test_retired_track_is_dropped() {
        let mut steps = seeded_steps(4);
        let mut nodes = NodeAllocator::new();
        let mut values = FactorBuffer::new();
        propagator().propagate(&mut steps, 1.0, 1_000_000, &mut nodes, &mut values);
        assert!(steps[1].is_empty());
    }
}
