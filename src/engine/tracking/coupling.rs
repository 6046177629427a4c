//! Coupling state machine.
//!
//! Runs once per scan after propagation. Each track is associated against
//! the detections under its tier's matching noise, then classified: freshly
//! registered and low-score tracks stay loosely coupled, a track whose
//! score has saturated is evaluated for tight coupling and promoted only if
//! both the spatial and the temporal consistency tests pass. The partition
//! choice is the whole point: loose factors must never enter the ego
//! partition (noisy detections would corrupt odometry) and tight factors
//! must never land in the loose partition (the observed rigidity would stop
//! pinning the ego pose).

use std::collections::BTreeMap;

use crate::config::{NoiseConfig, TrackingConfig};
use crate::core::se3::Pose3;
use crate::core::types::{Detection, NodeKey};
use crate::engine::graph::factors::{
    ConstantVelocityFactor, Factor, LooseDetectionFactor, PriorFactor, StablePoseFactor,
    TightDetectionFactor,
};
use crate::engine::graph::smoother::{FactorBuffer, Values};
use crate::engine::tracking::association::best_detection;
use crate::engine::tracking::track::ObjectTrack;
use crate::engine::tracking::TrackCounters;
use crate::engine::NodeAllocator;

/// Position of a factor inside one of this scan's staging buffers; the
/// orchestrator resolves it to a smoother handle once both buffers are
/// submitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StagedHandle {
    /// Index into the ego buffer.
    Ego(usize),
    /// Index into the loose buffer.
    Loose(usize),
}

/// Factor handles staged for one track during this scan.
#[derive(Debug, Clone, Copy, Default)]
pub struct StagedHandles {
    /// Detection factor of this step.
    pub detection: Option<StagedHandle>,
    /// Stable-pose motion factor of this step.
    pub motion: Option<StagedHandle>,
}

/// What the state machine did this scan.
#[derive(Debug, Default)]
pub struct CouplingOutcome {
    /// At least one track was promoted to tight coupling.
    pub any_tight: bool,
    /// Number of tightly-coupled tracks at this scan.
    pub tight_count: usize,
    /// Per-track staged factor positions, by `object_index`.
    pub handles: BTreeMap<u64, StagedHandles>,
}

/// The per-scan coupling classifier.
pub struct CouplingMachine<'a> {
    /// Tracking gates and windows.
    pub tracking: &'a TrackingConfig,
    /// Factor and matcher noises.
    pub noise: &'a NoiseConfig,
}

impl<'a> CouplingMachine<'a> {
    /// Associate detections, classify every track and stage the scan's
    /// detection, motion and velocity factors into the right partitions.
    #[allow(clippy::too_many_arguments)]
    pub fn run(
        &self,
        steps: &mut Vec<BTreeMap<u64, ObjectTrack>>,
        detections: &[Detection],
        ego_key: NodeKey,
        ego_pose: &Pose3,
        dt: f64,
        timestamp_us: u64,
        estimates: &Values,
        counters: &mut TrackCounters,
        nodes: &mut NodeAllocator,
        ego_buffer: &mut FactorBuffer,
        loose_buffer: &mut FactorBuffer,
    ) -> CouplingOutcome {
        let mut outcome = CouplingOutcome::default();
        let Some(current) = steps.last_mut() else {
            return outcome;
        };

        if detections.is_empty() {
            // Detector unavailable or genuinely nothing in view: every
            // active track coasts. The score survives; only an association
            // miss resets it.
            for track in current.values_mut() {
                track.lost_count = track.lost_count.saturating_add(1);
                track.confidence = 0.0;
            }
            return outcome;
        }

        let mut claimed = vec![false; detections.len()];
        let mut redirects: Vec<Option<u64>> = vec![None; detections.len()];
        let inv_ego = ego_pose.inverse();

        for track in current.values_mut() {
            let predicted_sensor = inv_ego * track.pose;

            let gate_noise = if track.track_score >= self.tracking.pre_loose_steps {
                &self.noise.loose_matching
            } else if track.active_steps <= self.tracking.early_steps {
                // New tracks need some chances to obtain a velocity.
                &self.noise.early_loose_matching
            } else {
                &self.noise.loose_matching
            };

            let hit = best_detection(detections, &predicted_sensor, gate_noise, Some(&claimed));

            match hit {
                Some((index, error)) if error < self.tracking.match_threshold => {
                    if track.lost_count > 0 {
                        // Re-acquired after being lost: the graph-level
                        // track is done, but the user-facing identity lives
                        // on in the fresh registration below.
                        redirects[index] = Some(track.tracking_index);
                        track.tombstone();
                        continue;
                    }

                    claimed[index] = true;
                    track.lost_count = 0;
                    if track.track_score <= self.tracking.pre_loose_steps {
                        track.track_score += 1;
                    }
                    track.detection = detections[index].clone();
                    track.confidence = detections[index].score;

                    if track.track_score >= self.tracking.pre_loose_steps + 1 {
                        self.evaluate_tight_candidate(
                            track,
                            detections,
                            &predicted_sensor,
                            ego_key,
                            ego_pose,
                            estimates,
                            &mut outcome,
                            ego_buffer,
                            loose_buffer,
                        );
                    } else {
                        // Pre-loose coupling stabilizes the velocity first.
                        track.is_tightly_coupled = false;
                        let handle = self.stage_loose_detection(
                            track,
                            &detections[index],
                            ego_pose,
                            ego_buffer,
                            loose_buffer,
                        );
                        outcome.handles.entry(track.object_index).or_default().detection =
                            Some(handle);
                    }
                }
                _ => {
                    track.lost_count = track.lost_count.saturating_add(1);
                    track.track_score = 0;
                    track.confidence = 0.0;

                    let fallback = best_detection(
                        detections,
                        &predicted_sensor,
                        &self.noise.data_association,
                        None,
                    );
                    if let Some((index, error)) = fallback {
                        if error < self.tracking.match_threshold {
                            redirects[index] = Some(track.tracking_index);
                            track.tombstone();
                        }
                    }
                }
            }
        }

        // A detection no track claimed registers a new moving object; a
        // fallback re-acquisition donates its tracking identity.
        for (index, detection) in detections.iter().enumerate() {
            if claimed[index] {
                continue;
            }
            let object_index = counters.next_object();
            let tracking_index = redirects[index]
                .unwrap_or_else(|| counters.next_tracking());

            let pose = ego_pose * detection.pose;
            let pose_node = nodes.allocate();
            let velocity_node = nodes.allocate();
            let mut track = ObjectTrack::register(
                object_index,
                tracking_index,
                pose,
                pose_node,
                velocity_node,
                detection.clone(),
                timestamp_us,
            );

            loose_buffer.insert_value(pose_node, pose);
            loose_buffer.insert_value(velocity_node, track.velocity);

            let factor = LooseDetectionFactor::new(
                pose_node,
                *ego_pose,
                detection.pose,
                &self.noise.loose_detection,
            );
            track.initial_detection_error = {
                let mut scratch = Values::new();
                scratch.insert(pose_node, pose);
                factor.error(&scratch)
            };
            let position = loose_buffer.add_factor(Box::new(factor));
            outcome.handles.entry(object_index).or_default().detection =
                Some(StagedHandle::Loose(position));

            loose_buffer.add_factor(Box::new(PriorFactor::velocity(
                velocity_node,
                track.velocity,
                &self.noise.velocity_prior,
            )));

            current.insert(object_index, track);
        }

        self.stage_motion_factors(steps, dt, &mut outcome, ego_buffer, loose_buffer);

        outcome
    }

    /// Spatial + temporal consistency evaluation of a saturated track.
    #[allow(clippy::too_many_arguments)]
    fn evaluate_tight_candidate(
        &self,
        track: &mut ObjectTrack,
        detections: &[Detection],
        predicted_sensor: &Pose3,
        ego_key: NodeKey,
        ego_pose: &Pose3,
        estimates: &Values,
        outcome: &mut CouplingOutcome,
        ego_buffer: &mut FactorBuffer,
        loose_buffer: &mut FactorBuffer,
    ) {
        // Re-pick under the tight matching noise; only a detection that
        // survives the tighter gate may couple into the ego partition.
        let Some((index, tight_error)) = best_detection(
            detections,
            predicted_sensor,
            &self.noise.tight_matching,
            None,
        ) else {
            return;
        };

        let spatial = tight_error <= self.tracking.tight_detection_error_threshold;
        let temporal = track.velocity_is_consistent(
            self.tracking.velocity_consistency_window,
            estimates,
            self.tracking.angular_velocity_consistency_variance,
            self.tracking.linear_velocity_consistency_variance,
        );

        if spatial && temporal {
            outcome.any_tight = true;
            outcome.tight_count += 1;
            track.is_tightly_coupled = true;

            let factor = TightDetectionFactor::new(
                ego_key,
                track.pose_node,
                detections[index].pose,
                &self.noise.tight_detection,
            );
            track.initial_detection_error = {
                let mut scratch = Values::new();
                scratch.insert(ego_key, *ego_pose);
                scratch.insert(track.pose_node, track.pose);
                factor.error(&scratch)
            };
            let position = ego_buffer.add_factor(Box::new(factor));
            outcome.handles.entry(track.object_index).or_default().detection =
                Some(StagedHandle::Ego(position));
        } else {
            log::debug!(
                "object {} demoted (spatial {}, temporal {})",
                track.object_index,
                spatial,
                temporal
            );
            track.track_score = (track.track_score - self.tracking.demote_steps).max(0);
            track.is_tightly_coupled = false;
            let handle = self.stage_loose_detection(
                track,
                &detections[index],
                ego_pose,
                ego_buffer,
                loose_buffer,
            );
            outcome.handles.entry(track.object_index).or_default().detection = Some(handle);
        }
    }

    /// Stage a loose detection factor and migrate the step's initial values
    /// out of the ego buffer.
    fn stage_loose_detection(
        &self,
        track: &mut ObjectTrack,
        detection: &Detection,
        ego_pose: &Pose3,
        ego_buffer: &mut FactorBuffer,
        loose_buffer: &mut FactorBuffer,
    ) -> StagedHandle {
        ego_buffer.move_value_to(track.pose_node, loose_buffer);
        ego_buffer.move_value_to(track.velocity_node, loose_buffer);

        let factor = LooseDetectionFactor::new(
            track.pose_node,
            *ego_pose,
            detection.pose,
            &self.noise.loose_detection,
        );
        track.initial_detection_error = {
            let mut scratch = Values::new();
            scratch.insert(track.pose_node, track.pose);
            factor.error(&scratch)
        };
        StagedHandle::Loose(loose_buffer.add_factor(Box::new(factor)))
    }

    /// Stable-pose and constant-velocity factors between consecutive steps
    /// of every associated, non-first track, in the tier of the track.
    fn stage_motion_factors(
        &self,
        steps: &mut [BTreeMap<u64, ObjectTrack>],
        dt: f64,
        outcome: &mut CouplingOutcome,
        ego_buffer: &mut FactorBuffer,
        loose_buffer: &mut FactorBuffer,
    ) {
        if steps.len() < 2 {
            return;
        }
        let (head, tail) = steps.split_at_mut(steps.len() - 1);
        let previous = &head[head.len() - 1];
        let current = &mut tail[0];

        for track in current.values_mut() {
            if track.is_first || track.lost_count > 0 {
                continue;
            }
            let Some(prev) = previous.get(&track.object_index) else {
                continue;
            };

            let early = track.active_steps <= self.tracking.early_steps;
            let (prev_velocity, velocity) = (prev.velocity_node, track.velocity_node);
            let velocity_factor = move |variances: &[f64; 6]| {
                Box::new(ConstantVelocityFactor::new(prev_velocity, velocity, variances))
            };
            let motion = StablePoseFactor::new(
                prev.pose_node,
                prev.velocity_node,
                track.pose_node,
                dt,
                &self.noise.motion,
            );
            track.initial_motion_error = {
                let mut scratch = Values::new();
                scratch.insert(prev.pose_node, prev.pose);
                scratch.insert(prev.velocity_node, prev.velocity);
                scratch.insert(track.pose_node, track.pose);
                motion.error(&scratch)
            };

            let handle = if track.is_tightly_coupled {
                ego_buffer.add_factor(velocity_factor(&self.noise.constant_velocity));
                StagedHandle::Ego(ego_buffer.add_factor(Box::new(motion)))
            } else {
                let variances = if early {
                    &self.noise.early_constant_velocity
                } else {
                    &self.noise.constant_velocity
                };
                loose_buffer.add_factor(velocity_factor(variances));
                StagedHandle::Loose(loose_buffer.add_factor(Box::new(motion)))
            };
            outcome.handles.entry(track.object_index).or_default().motion = Some(handle);
        }
    }
}
