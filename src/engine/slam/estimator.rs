//! Joint per-scan update orchestrator.
//!
//! Per scan, in order: the ego pipeline decides key-frame promotion and
//! stages its factors; the propagator rolls tracks forward; association and
//! the coupling machine classify every track and stage detection/motion
//! factors into the ego or the loose partition; the two partitions are
//! submitted to the one smoother in sequence; estimates are read back into
//! the track records and the key-pose history; on a discontinuous event the
//! whole cached trajectory is rewritten and the map cache flushed.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use crate::config::EstimatorConfig;
use crate::core::se3::{self, Pose3};
use crate::core::types::{
    Detection, Diagnosis, FactorErrors, GnssSample, KeyPose, LoopConstraint, ObjectState,
    PointCloud3, ScanInput, ScanResult,
};
use crate::engine::graph::smoother::{FactorBuffer, FactorId, IncrementalSmoother, Partition};
use crate::engine::slam::ego::EgoPipeline;
use crate::engine::tracking::coupling::{CouplingMachine, CouplingOutcome, StagedHandle};
use crate::engine::tracking::propagator::Propagator;
use crate::engine::tracking::track::ObjectTrack;
use crate::engine::tracking::TrackCounters;
use crate::engine::NodeAllocator;
use crate::error::Result;
use crate::io::pcd;
use crate::io::results::EstimationResult;
use crate::workers::{DetectionSource, DetectorWorker};

/// The joint incremental estimator.
///
/// Owns the smoother and all cross-scan state. Embeddings that share it
/// with background workers wrap it in the one coarse mutex
/// ([`crate::workers::SharedEstimator`]); all per-scan work happens through
/// `&mut self` under that lock.
pub struct JointEstimator {
    config: EstimatorConfig,
    smoother: IncrementalSmoother,
    ego: EgoPipeline,
    nodes: NodeAllocator,
    counters: TrackCounters,
    /// Per-scan track tables; index t holds the tracks at processed scan t.
    steps: Vec<BTreeMap<u64, ObjectTrack>>,
    detector: Option<DetectorWorker>,
    /// Per-key-frame feature clouds in sensor frame.
    corner_keyframes: Vec<PointCloud3>,
    surf_keyframes: Vec<PointCloud3>,
    /// World-frame feature tiles per key-pose; flushed on pose correction.
    map_cache: HashMap<usize, (PointCloud3, PointCloud3)>,
    last_timestamp_us: Option<u64>,
    current_pose: Pose3,
    previous_pose: Option<Pose3>,
    /// Planar marginal variance of the latest key, for GNSS gating.
    pose_covariance_xy: Option<(f64, f64)>,
}

impl JointEstimator {
    /// Create an estimator with the given configuration.
    pub fn new(config: EstimatorConfig) -> Self {
        let smoother = IncrementalSmoother::new(config.smoother.clone());
        let ego = EgoPipeline::new(
            config.keyframe.clone(),
            config.gnss.clone(),
            config.noise.clone(),
        );
        Self {
            config,
            smoother,
            ego,
            nodes: NodeAllocator::new(),
            counters: TrackCounters::default(),
            steps: Vec::new(),
            detector: None,
            corner_keyframes: Vec::new(),
            surf_keyframes: Vec::new(),
            map_cache: HashMap::new(),
            last_timestamp_us: None,
            current_pose: Pose3::identity(),
            previous_pose: None,
            pose_covariance_xy: None,
        }
    }

    /// Attach the external detector; its blocking call runs on a worker
    /// fired at the start of every scan.
    pub fn set_detector(&mut self, source: Arc<dyn DetectionSource>) {
        self.detector = Some(DetectorWorker::spawn(source));
    }

    /// Queue a GNSS sample.
    pub fn push_gnss(&mut self, sample: GnssSample) {
        self.ego.push_gnss(sample);
    }

    /// Queue a loop-closure constraint.
    pub fn push_loop_constraint(&mut self, constraint: LoopConstraint) {
        self.ego.push_loop_constraint(constraint);
    }

    /// Cached ego key-pose history.
    pub fn key_poses(&self) -> &[KeyPose] {
        self.ego.key_poses()
    }

    /// Per-scan track tables (full history).
    pub fn steps(&self) -> &[BTreeMap<u64, ObjectTrack>] {
        &self.steps
    }

    /// The underlying smoother.
    pub fn smoother(&self) -> &IncrementalSmoother {
        &self.smoother
    }

    /// Track identity counters.
    pub fn counters(&self) -> TrackCounters {
        self.counters
    }

    /// Process one scan through the full joint pipeline.
    pub fn process_scan(&mut self, input: ScanInput) -> Result<ScanResult> {
        let started = Instant::now();
        let timestamp_us = input.timestamp_us;
        let dt = self
            .last_timestamp_us
            .map(|previous| timestamp_us.saturating_sub(previous) as f64 * 1e-6)
            .unwrap_or(0.0);
        self.last_timestamp_us = Some(timestamp_us);

        // The detector call overlaps the ego staging and is joined before
        // any factor construction.
        if let Some(worker) = &self.detector {
            worker.begin_scan(Arc::clone(&input.raw_cloud))?;
        }

        let required = self.ego.key_poses().is_empty()
            || self.ego.should_add_keyframe(&input.registered_pose);
        let asynchronous = self.config.tracking.asynchronous_estimation;

        if !input.registration_refined {
            log::warn!("scan at {timestamp_us} carries an unrefined registration prior");
        }

        if !required && !asynchronous {
            // Nothing enters the graph this scan; drain the worker and coast.
            let detections = self.join_detections()?;
            self.current_pose = input.registered_pose;
            let incremental = self.take_incremental();
            return Ok(ScanResult {
                pose: self.current_pose,
                incremental,
                is_degenerate: input.is_degenerate,
                keyframe_added: false,
                objects: Vec::new(),
                diagnosis: Diagnosis {
                    timestamp_us,
                    num_detections: detections.len(),
                    processing_ms: started.elapsed().as_secs_f64() * 1e3,
                    num_tightly_coupled: 0,
                },
            });
        }

        // 1. Ego factors.
        let mut ego_buffer = FactorBuffer::new();
        let mut discontinuity = false;
        let (ego_key, ego_pose) = if required {
            let node = self.ego.stage_keyframe(
                input.registered_pose,
                timestamp_us,
                &mut self.nodes,
                &mut ego_buffer,
            );
            discontinuity |=
                self.ego
                    .stage_gnss(timestamp_us, self.pose_covariance_xy, &mut ego_buffer);
            discontinuity |= self.ego.stage_loop_constraints(&mut ego_buffer);
            (node, input.registered_pose)
        } else {
            let latest = self
                .ego
                .latest()
                .expect("first scan is always a key-frame");
            let (node, pose) = (latest.node, latest.pose);
            // Stage the cached key value so object factors can anchor on
            // it; erased again before the update.
            ego_buffer.insert_value(node, pose);
            (node, pose)
        };

        let mut detections = self.join_detections()?;
        let num_detections = detections.len();
        if !required {
            // Associate against the last key-pose by folding the small ego
            // motion since that key into every detection.
            let small_motion = se3::between(&ego_pose, &input.registered_pose);
            for detection in &mut detections {
                detection.pose = small_motion * detection.pose;
            }
        }

        // 2. Propagation.
        let propagator = Propagator {
            lost_steps: self.config.tracking.lost_steps,
            velocity_window: self.config.tracking.velocity_consistency_window,
        };
        propagator.propagate(
            &mut self.steps,
            dt,
            timestamp_us,
            &mut self.nodes,
            &mut ego_buffer,
        );

        // 3. Association and coupling.
        let machine = CouplingMachine {
            tracking: &self.config.tracking,
            noise: &self.config.noise,
        };
        let mut loose_buffer = FactorBuffer::new();
        let outcome = machine.run(
            &mut self.steps,
            &detections,
            ego_key,
            &ego_pose,
            dt,
            timestamp_us,
            self.smoother.estimate(),
            &mut self.counters,
            &mut self.nodes,
            &mut ego_buffer,
            &mut loose_buffer,
        );
        discontinuity |= outcome.any_tight;

        // 4. The tentative ego value leaves the buffer on non-key scans.
        if !required {
            ego_buffer.erase_value(ego_key);
        }

        // 5. Two-tier submission.
        let factor_base = self.smoother.num_factors();
        let ego_staged = ego_buffer.len();
        self.smoother.update(ego_buffer, Partition::Ego)?;
        self.smoother.refine()?;
        if discontinuity {
            for _ in 0..5 {
                self.smoother.refine()?;
            }
        }
        if !loose_buffer.is_empty() {
            self.smoother.update(loose_buffer, Partition::Loose)?;
            self.smoother.refine()?;
        }

        self.resolve_handles(&outcome, factor_base, ego_staged);

        // 7. Read-back.
        if required {
            self.ego.refresh_latest(self.smoother.estimate());
            self.corner_keyframes.push(input.corner_cloud.clone());
            self.surf_keyframes.push(input.surf_cloud.clone());
            match self.smoother.marginal_covariance(ego_key) {
                Ok(covariance) => {
                    self.pose_covariance_xy = Some((covariance[(3, 3)], covariance[(4, 4)]));
                }
                Err(error) => {
                    log::warn!("marginal covariance unavailable: {error}");
                    self.pose_covariance_xy = None;
                }
            }
        }
        self.current_pose = if required {
            self.ego
                .latest()
                .expect("key-pose staged above")
                .pose
        } else {
            input.registered_pose
        };
        let objects = self.write_back_objects(timestamp_us);

        // 8. Pose correction.
        if discontinuity {
            self.ego.correct_poses(self.smoother.estimate());
            self.map_cache.clear();
            if required {
                self.current_pose = self
                    .ego
                    .latest()
                    .expect("key-pose staged above")
                    .pose;
            }
        }

        let incremental = self.take_incremental();
        Ok(ScanResult {
            pose: self.current_pose,
            incremental,
            is_degenerate: input.is_degenerate,
            keyframe_added: required,
            objects,
            diagnosis: Diagnosis {
                timestamp_us,
                num_detections,
                processing_ms: started.elapsed().as_secs_f64() * 1e3,
                num_tightly_coupled: outcome.tight_count,
            },
        })
    }

    /// Per-track world-frame path points, keyed by `object_index`.
    pub fn object_paths(&self) -> BTreeMap<u64, Vec<(u64, Pose3)>> {
        self.paths_by(|track| track.object_index)
    }

    /// Per-track world-frame path points, keyed by `tracking_index`.
    pub fn tracking_paths(&self) -> BTreeMap<u64, Vec<(u64, Pose3)>> {
        self.paths_by(|track| track.tracking_index)
    }

    /// Full estimation-result export, read back from the current smoother
    /// estimate.
    pub fn estimation_result(&self) -> EstimationResult {
        EstimationResult::build(
            self.ego.key_poses(),
            &self.steps,
            self.smoother.estimate(),
            self.counters,
        )
    }

    /// Save trajectory and map PCD files under `directory`, optionally
    /// voxel-downsampled at `leaf_size` (meters; zero keeps full density).
    pub fn save_map(&mut self, directory: &Path, leaf_size: f64) -> Result<()> {
        std::fs::create_dir_all(directory)?;
        pcd::write_trajectory(&directory.join("trajectory.pcd"), self.ego.key_poses())?;
        pcd::write_transformations(
            &directory.join("transformations.pcd"),
            self.ego.key_poses(),
        )?;

        let mut corner = PointCloud3::new();
        let mut surf = PointCloud3::new();
        for index in 0..self.ego.key_poses().len() {
            let (tile_corner, tile_surf) = self.map_tile(index);
            corner.extend(tile_corner);
            surf.extend(tile_surf);
        }
        if leaf_size > 0.0 {
            corner = pcd::voxel_downsample(&corner, leaf_size);
            surf = pcd::voxel_downsample(&surf, leaf_size);
        }
        let mut global = PointCloud3::new();
        global.extend(&corner);
        global.extend(&surf);

        pcd::write_cloud(&directory.join("CornerMap.pcd"), &corner)?;
        pcd::write_cloud(&directory.join("SurfMap.pcd"), &surf)?;
        pcd::write_cloud(&directory.join("GlobalMap.pcd"), &global)?;
        log::info!(
            "map saved to {} ({} key-frames)",
            directory.display(),
            self.ego.key_poses().len()
        );
        Ok(())
    }

    fn join_detections(&self) -> Result<Vec<Detection>> {
        match &self.detector {
            Some(worker) => Ok(worker.join_scan()?.unwrap_or_default()),
            None => Ok(Vec::new()),
        }
    }

    fn take_incremental(&mut self) -> Pose3 {
        let incremental = match self.previous_pose {
            Some(previous) => se3::between(&previous, &self.current_pose),
            None => Pose3::identity(),
        };
        self.previous_pose = Some(self.current_pose);
        incremental
    }

    /// Turn the scan's staged buffer positions into smoother handles.
    fn resolve_handles(&mut self, outcome: &CouplingOutcome, base: FactorId, ego_staged: usize) {
        let Some(current) = self.steps.last_mut() else {
            return;
        };
        let resolve = |handle: StagedHandle| match handle {
            StagedHandle::Ego(position) => base + position,
            StagedHandle::Loose(position) => base + ego_staged + position,
        };
        for (object_index, handles) in &outcome.handles {
            if let Some(track) = current.get_mut(object_index) {
                track.detection_factor = handles.detection.map(resolve);
                track.motion_factor = handles.motion.map(resolve);
            }
        }
    }

    /// Write smoother estimates back into the track records and emit the
    /// per-scan object states. Lost tracks did not join the optimization
    /// and are skipped.
    fn write_back_objects(&mut self, timestamp_us: u64) -> Vec<ObjectState> {
        let smoother = &self.smoother;
        let estimates = smoother.estimate();
        let mut states = Vec::new();

        let Some(current) = self.steps.last_mut() else {
            return states;
        };
        for track in current.values_mut() {
            if track.lost_count > 0 {
                continue;
            }
            track.pose = estimates.pose(track.pose_node);
            track.velocity = estimates.pose(track.velocity_node);
            track.bounding_box = track.detection.with_pose(track.pose);
            track.bounding_box.label = track.object_index as u32;
            track.active_steps += 1;

            let detection_error = track
                .detection_factor
                .and_then(|id| smoother.factor_error(id))
                .map(|current| FactorErrors {
                    current,
                    initial: track.initial_detection_error,
                });
            let motion_error = track
                .motion_factor
                .and_then(|id| smoother.factor_error(id))
                .map(|current| FactorErrors {
                    current,
                    initial: track.initial_motion_error,
                });

            states.push(ObjectState {
                timestamp_us,
                detection: track.detection.clone(),
                bounding_box: track.bounding_box.clone(),
                pose: track.pose,
                velocity: track.velocity,
                object_index: track.object_index,
                tracking_index: track.tracking_index,
                lost_count: track.lost_count,
                confidence: track.confidence,
                is_tightly_coupled: track.is_tightly_coupled,
                is_first: track.is_first,
                detection_error,
                motion_error,
            });
        }
        states
    }

    fn paths_by(&self, key: impl Fn(&ObjectTrack) -> u64) -> BTreeMap<u64, Vec<(u64, Pose3)>> {
        let mut paths: BTreeMap<u64, Vec<(u64, Pose3)>> = BTreeMap::new();
        for step in &self.steps {
            for track in step.values() {
                if track.lost_count == 0 {
                    paths
                        .entry(key(track))
                        .or_default()
                        .push((track.timestamp_us, track.pose));
                }
            }
        }
        paths
    }

    /// World-frame feature tile of one key-frame, cached until a pose
    /// correction invalidates it.
    fn map_tile(&mut self, index: usize) -> &(PointCloud3, PointCloud3) {
        if !self.map_cache.contains_key(&index) {
            let pose = self.ego.key_poses()[index].pose;
            let corner = self
                .corner_keyframes
                .get(index)
                .map(|cloud| cloud.transform(&pose))
                .unwrap_or_default();
            let surf = self
                .surf_keyframes
                .get(index)
                .map(|cloud| cloud.transform(&pose))
                .unwrap_or_default();
            self.map_cache.insert(index, (corner, surf));
        }
        &self.map_cache[&index]
    }
}
