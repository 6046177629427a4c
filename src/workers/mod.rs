//! Background workers.
//!
//! The detector worker runs the blocking detection RPC off the scan thread:
//! the orchestrator fires it at the start of each scan and joins it before
//! factor construction. The loop-closure worker paces itself on a timer,
//! snapshots the key-pose history under the estimator lock, runs the
//! (external) registrar outside it and publishes accepted constraints back
//! into the queue the orchestrator drains at the next scan. Workers observe
//! the shared run flag and exit at the next loop boundary.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;

use crate::config::LoopClosureConfig;
use crate::core::se3::Pose3;
use crate::core::types::{Detection, KeyPose, LoopConstraint, PointCloud3};
use crate::engine::slam::estimator::JointEstimator;
use crate::error::{Error, Result};

/// The estimator behind the one coarse mutex every worker shares.
pub type SharedEstimator = Arc<Mutex<JointEstimator>>;

/// The external object detector (a blocking RPC in the reference system).
///
/// Returns `None` on transport failure; the estimator treats that as a scan
/// without detections.
pub trait DetectionSource: Send + Sync {
    /// Detect oriented bounding boxes in a raw sensor-frame cloud.
    fn detect(&self, cloud: &PointCloud3) -> Option<Vec<Detection>>;
}

/// The external scan registration the loop-closure worker calls (ICP
/// between the clouds around two key-poses).
pub trait LoopRegistrar: Send + Sync {
    /// Align key-pose `current` against `previous` given the full history.
    /// Returns the measured relative pose `current⁻¹ · previous` and the
    /// registration fitness (lower is better), or `None` on
    /// non-convergence.
    fn register(&self, key_poses: &[KeyPose], current: usize, previous: usize)
        -> Option<(Pose3, f64)>;
}

/// Long-lived worker thread wrapping the detector RPC.
pub struct DetectorWorker {
    request_tx: Option<Sender<Arc<PointCloud3>>>,
    reply_rx: Receiver<Option<Vec<Detection>>>,
    handle: Option<JoinHandle<()>>,
}

impl DetectorWorker {
    /// Spawn the worker thread.
    pub fn spawn(source: Arc<dyn DetectionSource>) -> Self {
        let (request_tx, request_rx) = bounded::<Arc<PointCloud3>>(1);
        let (reply_tx, reply_rx) = bounded(1);
        let handle = thread::Builder::new()
            .name("detector".into())
            .spawn(move || {
                for cloud in request_rx.iter() {
                    if reply_tx.send(source.detect(&cloud)).is_err() {
                        break;
                    }
                }
            })
            .expect("failed to spawn detector thread");
        Self {
            request_tx: Some(request_tx),
            reply_rx,
            handle: Some(handle),
        }
    }

    /// Hand the scan's raw cloud to the detector (non-blocking for a cloud
    /// per scan).
    pub fn begin_scan(&self, cloud: Arc<PointCloud3>) -> Result<()> {
        self.request_tx
            .as_ref()
            .ok_or(Error::DetectorDisconnected)?
            .send(cloud)
            .map_err(|_| Error::DetectorDisconnected)
    }

    /// Block until the detector replies for the scan in flight.
    pub fn join_scan(&self) -> Result<Option<Vec<Detection>>> {
        self.reply_rx.recv().map_err(|_| Error::DetectorDisconnected)
    }
}

impl Drop for DetectorWorker {
    fn drop(&mut self) {
        // Closing the request channel lets the thread run off the end.
        drop(self.request_tx.take());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Candidate pair for loop closure: the latest key against the earliest
/// key-pose inside the search radius with enough time separation.
pub fn find_loop_candidate(
    key_poses: &[KeyPose],
    config: &LoopClosureConfig,
    already_closed: &HashMap<usize, usize>,
) -> Option<(usize, usize)> {
    let current = key_poses.last()?;
    if already_closed.contains_key(&current.index) {
        return None;
    }
    let gap_us = (config.time_gap_s * 1e6) as u64;
    for candidate in key_poses.iter() {
        if current.timestamp_us.saturating_sub(candidate.timestamp_us) <= gap_us {
            continue;
        }
        let distance =
            (candidate.pose.translation.vector - current.pose.translation.vector).norm();
        if distance < config.search_radius_m {
            return Some((current.index, candidate.index));
        }
    }
    None
}

/// Background loop-closure proposer.
pub struct LoopClosureWorker {
    handle: Option<JoinHandle<()>>,
}

impl LoopClosureWorker {
    /// Spawn the worker; it exits when `running` clears.
    pub fn spawn(
        shared: SharedEstimator,
        registrar: Arc<dyn LoopRegistrar>,
        config: LoopClosureConfig,
        running: Arc<AtomicBool>,
    ) -> Self {
        let handle = thread::Builder::new()
            .name("loop-closure".into())
            .spawn(move || {
                if !config.enabled {
                    return;
                }
                let period = Duration::from_secs_f64(1.0 / config.frequency_hz.max(1e-3));
                let mut closed: HashMap<usize, usize> = HashMap::new();
                while running.load(Ordering::Relaxed) {
                    thread::sleep(period);

                    let snapshot: Vec<KeyPose> = shared.lock().key_poses().to_vec();
                    let Some((current, previous)) =
                        find_loop_candidate(&snapshot, &config, &closed)
                    else {
                        continue;
                    };
                    // The registrar runs outside the lock; ICP is slow.
                    let Some((relative, fitness)) =
                        registrar.register(&snapshot, current, previous)
                    else {
                        continue;
                    };
                    if fitness > config.fitness_threshold {
                        continue;
                    }
                    closed.insert(current, previous);
                    log::info!(
                        "loop closure {} -> {} (fitness {:.3})",
                        current,
                        previous,
                        fitness
                    );
                    shared.lock().push_loop_constraint(LoopConstraint {
                        from_index: current,
                        to_index: previous,
                        relative,
                        variance: fitness.max(1e-6),
                    });
                }
            })
            .expect("failed to spawn loop-closure thread");
        Self {
            handle: Some(handle),
        }
    }

    /// Wait for the worker to observe the cleared run flag and exit.
    pub fn join(mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
