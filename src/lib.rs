//! # gati-slam
//!
//! Joint incremental estimation for LiDAR-inertial SLAM with moving-object
//! tracking. One factor graph holds both the ego key-pose trajectory (from
//! an external scan-to-map registration front-end) and the pose-and-velocity
//! trajectories of detected moving objects; a per-scan state machine
//! classifies each track as tightly or loosely coupled so that object
//! observations sharpen the odometry when they are trustworthy and never
//! corrupt it when they are not.
//!
//! ## Architecture
//!
//! - [`engine::graph`]: the factor library, a block-sparse solver and the
//!   incremental smoother with its two-tier (ego / loose) submission.
//! - [`engine::tracking`]: track records, the constant-velocity
//!   propagator, greedy data association and the coupling state machine.
//! - [`engine::slam`]: the ego pipeline adapter and the
//!   [`JointEstimator`] orchestrating each scan.
//! - [`workers`]: the detector worker joined before factor construction
//!   and the loop-closure worker feeding the constraint queue.
//! - [`io`]: PCD map export and the estimation-result service.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use gati_slam::{EstimatorConfig, JointEstimator, PointCloud3, ScanInput};
//! use gati_slam::core::se3;
//!
//! let mut estimator = JointEstimator::new(EstimatorConfig::default());
//! let result = estimator
//!     .process_scan(ScanInput {
//!         timestamp_us: 0,
//!         registered_pose: se3::from_rpy_xyz(0.0, 0.0, 0.0, 0.0, 0.0, 0.0),
//!         registration_refined: true,
//!         is_degenerate: false,
//!         corner_cloud: PointCloud3::new(),
//!         surf_cloud: PointCloud3::new(),
//!         raw_cloud: Arc::new(PointCloud3::new()),
//!     })
//!     .unwrap();
//! assert!(result.keyframe_added);
//! ```

pub mod config;
pub mod core;
pub mod engine;
pub mod error;
pub mod io;
pub mod workers;

pub use config::EstimatorConfig;
pub use core::se3::Pose3;
pub use core::types::{
    Detection, Diagnosis, GnssSample, LoopConstraint, ObjectState, PointCloud3, ScanInput,
    ScanResult,
};
pub use engine::slam::estimator::JointEstimator;
pub use error::{Error, Result};
pub use workers::{DetectionSource, LoopClosureWorker, LoopRegistrar, SharedEstimator};
