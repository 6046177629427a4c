//! Ego-side pipeline: key-frame acceptance, odometry/GNSS/loop factor
//! staging, and the cached key-pose history with its correction pass.

use std::collections::VecDeque;

use nalgebra::Vector3;

use crate::config::{GnssConfig, KeyframeConfig, NoiseConfig};
use crate::core::se3::{self, Pose3};
use crate::core::types::{GnssSample, KeyPose, LoopConstraint, NodeKey};
use crate::engine::graph::factors::{BetweenFactor, GnssFactor, PriorFactor};
use crate::engine::graph::smoother::{FactorBuffer, Values};
use crate::engine::NodeAllocator;

/// Ego pipeline adapter.
///
/// Consumes scan-registration output, decides key-frame promotion and
/// stages ego-side factors. The GNSS queue and the loop-closure queue are
/// filled by their producers and drained here, under the orchestrator's
/// lock, at the next scan.
pub struct EgoPipeline {
    keyframe: KeyframeConfig,
    gnss: GnssConfig,
    noise: NoiseConfig,
    key_poses: Vec<KeyPose>,
    gnss_queue: VecDeque<GnssSample>,
    loop_queue: Vec<LoopConstraint>,
    last_gnss: Option<Vector3<f64>>,
}

impl EgoPipeline {
    /// Create an empty pipeline.
    pub fn new(keyframe: KeyframeConfig, gnss: GnssConfig, noise: NoiseConfig) -> Self {
        Self {
            keyframe,
            gnss,
            noise,
            key_poses: Vec::new(),
            gnss_queue: VecDeque::new(),
            loop_queue: Vec::new(),
            last_gnss: None,
        }
    }

    /// Cached key-pose history.
    pub fn key_poses(&self) -> &[KeyPose] {
        &self.key_poses
    }

    /// Latest accepted key-pose.
    pub fn latest(&self) -> Option<&KeyPose> {
        self.key_poses.last()
    }

    /// Queue a GNSS sample (producer side).
    pub fn push_gnss(&mut self, sample: GnssSample) {
        self.gnss_queue.push_back(sample);
    }

    /// Queue a loop-closure constraint (worker side).
    pub fn push_loop_constraint(&mut self, constraint: LoopConstraint) {
        self.loop_queue.push(constraint);
    }

    /// Pending loop constraints not yet folded in.
    pub fn pending_loops(&self) -> usize {
        self.loop_queue.len()
    }

    /// Key-frame gate: Euclidean translation or any Euler-angle component
    /// past its threshold relative to the last key-pose. The first scan is
    /// always a key-frame.
    pub fn should_add_keyframe(&self, pose: &Pose3) -> bool {
        let Some(last) = self.key_poses.last() else {
            return true;
        };
        let delta = se3::between(&last.pose, pose);
        let (roll, pitch, yaw) = se3::rpy(&delta);
        delta.translation.vector.norm() >= self.keyframe.add_distance_threshold
            || roll.abs() >= self.keyframe.add_angle_threshold
            || pitch.abs() >= self.keyframe.add_angle_threshold
            || yaw.abs() >= self.keyframe.add_angle_threshold
    }

    /// Promote this scan to a key-frame: allocate its node, stage the prior
    /// (first key) or the odometry between-factor, and record the key-pose.
    pub fn stage_keyframe(
        &mut self,
        pose: Pose3,
        timestamp_us: u64,
        nodes: &mut NodeAllocator,
        buffer: &mut FactorBuffer,
    ) -> NodeKey {
        let node = nodes.allocate();
        match self.key_poses.last() {
            Some(last) => {
                let measurement = se3::between(&last.pose, &pose);
                buffer.add_factor(Box::new(BetweenFactor::odometry(
                    last.node,
                    node,
                    measurement,
                    &self.noise.odometry_between,
                )));
            }
            None => {
                buffer.add_factor(Box::new(PriorFactor::new(
                    node,
                    pose,
                    &self.noise.prior_odometry,
                )));
            }
        }
        buffer.insert_value(node, pose);
        self.key_poses.push(KeyPose {
            index: self.key_poses.len(),
            node,
            pose,
            timestamp_us,
        });
        node
    }

    /// Drain the GNSS queue by time and stage at most one position factor
    /// on the latest key. Returns true when a factor was added (a
    /// discontinuous event for the smoother).
    pub fn stage_gnss(
        &mut self,
        scan_time_us: u64,
        pose_covariance_xy: Option<(f64, f64)>,
        buffer: &mut FactorBuffer,
    ) -> bool {
        if self.gnss_queue.is_empty() {
            return false;
        }
        let Some(latest) = self.key_poses.last() else {
            return false;
        };
        // Wait for the system to settle before trusting absolute fixes.
        let first = &self.key_poses[0];
        if (latest.pose.translation.vector - first.pose.translation.vector).norm()
            < self.gnss.min_spacing_m
        {
            return false;
        }
        if let Some((var_x, var_y)) = pose_covariance_xy {
            if var_x < self.gnss.pose_cov_threshold && var_y < self.gnss.pose_cov_threshold {
                return false;
            }
        }

        let window_us = (self.gnss.time_window_s * 1e6) as u64;
        while let Some(sample) = self.gnss_queue.front() {
            if sample.timestamp_us + window_us < scan_time_us {
                self.gnss_queue.pop_front();
                continue;
            }
            if sample.timestamp_us > scan_time_us + window_us {
                break;
            }
            let sample = self
                .gnss_queue
                .pop_front()
                .expect("front checked just above");

            let noise_x = sample.covariance[(0, 0)];
            let noise_y = sample.covariance[(1, 1)];
            let mut noise_z = sample.covariance[(2, 2)];
            if noise_x > self.gnss.cov_threshold || noise_y > self.gnss.cov_threshold {
                continue;
            }

            let mut position = sample.position;
            if !self.gnss.use_elevation {
                position.z = latest.pose.translation.z;
                noise_z = 0.01;
            }
            // A (0,0) fix is an uninitialized receiver, not a measurement.
            if position.x.abs() < 1e-6 && position.y.abs() < 1e-6 {
                continue;
            }
            if let Some(last) = self.last_gnss {
                if (position - last).norm() < self.gnss.min_spacing_m {
                    continue;
                }
            }
            self.last_gnss = Some(position);

            buffer.add_factor(Box::new(GnssFactor::new(
                latest.node,
                position,
                &Vector3::new(noise_x.max(1.0), noise_y.max(1.0), noise_z.max(1.0)),
            )));
            log::info!("gnss factor staged on key {}", latest.index);
            return true;
        }
        false
    }

    /// Drain queued loop constraints into between-factors. Returns true
    /// when any constraint was staged.
    pub fn stage_loop_constraints(&mut self, buffer: &mut FactorBuffer) -> bool {
        if self.loop_queue.is_empty() {
            return false;
        }
        let mut staged = false;
        for constraint in self.loop_queue.drain(..) {
            let (Some(from), Some(to)) = (
                self.key_poses.get(constraint.from_index),
                self.key_poses.get(constraint.to_index),
            ) else {
                log::warn!(
                    "loop constraint {} -> {} outside key-pose history, dropped",
                    constraint.from_index,
                    constraint.to_index
                );
                continue;
            };
            buffer.add_factor(Box::new(BetweenFactor::loop_closure(
                from.node,
                to.node,
                constraint.relative,
                &[constraint.variance; 6],
            )));
            staged = true;
        }
        staged
    }

    /// Rewrite every cached key-pose from the smoother estimate after a
    /// discontinuous event re-shuffled the trajectory.
    pub fn correct_poses(&mut self, estimates: &Values) {
        for key_pose in &mut self.key_poses {
            if let Some(pose) = estimates.get(key_pose.node) {
                key_pose.pose = *pose;
            }
        }
    }

    /// Overwrite the latest key-pose with its post-update estimate.
    pub fn refresh_latest(&mut self, estimates: &Values) {
        if let Some(key_pose) = self.key_poses.last_mut() {
            if let Some(pose) = estimates.get(key_pose.node) {
                key_pose.pose = *pose;
            }
        }
    }
}
