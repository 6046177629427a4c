//! Estimator configuration.
//!
//! One section per concern, with defaults holding the reference values. The
//! structs are plain serde data; loading them from a file is the embedding
//! application's business.

use serde::{Deserialize, Serialize};

/// Diagonal variance vector in tangent order `[roll, pitch, yaw, x, y, z]`.
pub type Variances = [f64; 6];

/// Key-frame acceptance gates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyframeConfig {
    /// Minimum Euclidean translation from the last key-pose, meters.
    pub add_distance_threshold: f64,
    /// Minimum Euler-angle component from the last key-pose, radians.
    pub add_angle_threshold: f64,
}

impl Default for KeyframeConfig {
    fn default() -> Self {
        Self {
            add_distance_threshold: 1.0,
            add_angle_threshold: 0.2,
        }
    }
}

/// Moving-object tracking gates and windows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackingConfig {
    /// Steps of loose coupling before a track may become tight (`K_tight`).
    pub pre_loose_steps: i32,
    /// Early window during which matching and velocity noises stay wide
    /// (`N_early`).
    pub early_steps: u32,
    /// Score deducted when a tight-coupling consistency test fails
    /// (`delta_k_demote`).
    pub demote_steps: i32,
    /// Consecutive misses after which a track is retired (`L_max`).
    pub lost_steps: i32,
    /// Number of recent velocities in the temporal consistency test (`W`).
    pub velocity_consistency_window: usize,
    /// Association gate on the matching error (`tau_match`).
    pub match_threshold: f64,
    /// Spatial consistency gate on the tight detection error
    /// (`tau_tight_det`).
    pub tight_detection_error_threshold: f64,
    /// Angular tolerance (variance) of the velocity consistency test.
    pub angular_velocity_consistency_variance: f64,
    /// Linear tolerance (variance) of the velocity consistency test.
    pub linear_velocity_consistency_variance: f64,
    /// Keep estimating objects on non-key-frame scans against the cached
    /// key-pose.
    pub asynchronous_estimation: bool,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            pre_loose_steps: 3,
            early_steps: 5,
            demote_steps: 1,
            lost_steps: 3,
            velocity_consistency_window: 3,
            match_threshold: 4.0,
            tight_detection_error_threshold: 1.0,
            angular_velocity_consistency_variance: 1e-4,
            linear_velocity_consistency_variance: 1e-2,
            asynchronous_estimation: true,
        }
    }
}

/// Diagonal noise models of every factor and matcher, as variances.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NoiseConfig {
    /// Prior on the first ego key-pose.
    pub prior_odometry: Variances,
    /// Ego odometry between-factor.
    pub odometry_between: Variances,
    /// Loosely-coupled detection factor.
    pub loose_detection: Variances,
    /// Tightly-coupled detection factor.
    pub tight_detection: Variances,
    /// Matching noise for tracks inside the early window.
    pub early_loose_matching: Variances,
    /// Nominal matching noise.
    pub loose_matching: Variances,
    /// Matching noise of the tight-candidate spatial test.
    pub tight_matching: Variances,
    /// Wide fallback matcher that re-identifies tombstoned tracks.
    pub data_association: Variances,
    /// Stable-pose motion factor.
    pub motion: Variances,
    /// Constant-velocity factor, nominal.
    pub constant_velocity: Variances,
    /// Constant-velocity factor inside the early window.
    pub early_constant_velocity: Variances,
    /// Prior on a freshly registered track's velocity, weighted toward
    /// vehicle-forward motion.
    pub velocity_prior: Variances,
}

impl Default for NoiseConfig {
    fn default() -> Self {
        Self {
            prior_odometry: [1e-4; 6],
            odometry_between: [1e-6, 1e-6, 1e-6, 1e-4, 1e-4, 1e-4],
            loose_detection: [1e-2, 1e-2, 1e-2, 1e-1, 1e-1, 1e-1],
            tight_detection: [1e-3, 1e-3, 1e-3, 1e-2, 1e-2, 1e-2],
            early_loose_matching: [1.0, 1.0, 1.0, 10.0, 10.0, 10.0],
            loose_matching: [1e-1, 1e-1, 1e-1, 1.0, 1.0, 1.0],
            tight_matching: [1e-2, 1e-2, 1e-2, 1e-1, 1e-1, 1e-1],
            data_association: [10.0, 10.0, 10.0, 100.0, 100.0, 100.0],
            motion: [1e-3, 1e-3, 1e-3, 1e-2, 1e-2, 1e-2],
            constant_velocity: [1e-3, 1e-3, 1e-3, 1e-2, 1e-2, 1e-2],
            early_constant_velocity: [1e-1, 1e-1, 1e-1, 1.0, 1.0, 1.0],
            velocity_prior: [1e-2, 1e-2, 1e0, 1e8, 1e2, 1e2],
        }
    }
}

/// GNSS fusion gates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GnssConfig {
    /// Reject samples whose planar position variance exceeds this.
    pub cov_threshold: f64,
    /// Only fuse GNSS once the marginal pose covariance grows past this.
    pub pose_cov_threshold: f64,
    /// Trust the GNSS elevation instead of the current estimate.
    pub use_elevation: bool,
    /// Half-width of the scan-time bracket, seconds.
    pub time_window_s: f64,
    /// Minimum spacing between fused samples, meters.
    pub min_spacing_m: f64,
}

impl Default for GnssConfig {
    fn default() -> Self {
        Self {
            cov_threshold: 2.0,
            pose_cov_threshold: 25.0,
            use_elevation: false,
            time_window_s: 0.2,
            min_spacing_m: 5.0,
        }
    }
}

/// Loop-closure worker gates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopClosureConfig {
    /// Master enable for the worker.
    pub enabled: bool,
    /// Candidate search radius around the latest key-pose, meters.
    pub search_radius_m: f64,
    /// Minimum time separation between the two ends, seconds.
    pub time_gap_s: f64,
    /// Reject registrations whose fitness score exceeds this.
    pub fitness_threshold: f64,
    /// Worker pace, hertz.
    pub frequency_hz: f64,
}

impl Default for LoopClosureConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            search_radius_m: 15.0,
            time_gap_s: 30.0,
            fitness_threshold: 0.3,
            frequency_hz: 1.0,
        }
    }
}

/// Gates handed through to the scan-to-map registration front-end and used
/// by the map export.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MappingConfig {
    /// Corner feature voxel leaf, meters.
    pub corner_leaf_size: f64,
    /// Surface feature voxel leaf, meters.
    pub surf_leaf_size: f64,
    /// Radius of the surrounding key-frame search, meters.
    pub surrounding_search_radius: f64,
    /// Iteration cap of the scan-to-map optimization.
    pub scan_to_map_iterations: u32,
}

impl Default for MappingConfig {
    fn default() -> Self {
        Self {
            corner_leaf_size: 0.2,
            surf_leaf_size: 0.4,
            surrounding_search_radius: 50.0,
            scan_to_map_iterations: 30,
        }
    }
}

/// Damping policy of the smoother's Gauss-Newton step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmootherConfig {
    /// Initial Levenberg-Marquardt damping factor.
    pub damping_factor: f64,
    /// Retries (with raised damping) before a step is declared failed.
    pub max_step_retries: u32,
}

impl Default for SmootherConfig {
    fn default() -> Self {
        Self {
            damping_factor: 1e-6,
            max_step_retries: 4,
        }
    }
}

/// Top-level configuration of the joint estimator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EstimatorConfig {
    /// Key-frame gates.
    #[serde(default)]
    pub keyframe: KeyframeConfig,
    /// Tracking state-machine gates.
    #[serde(default)]
    pub tracking: TrackingConfig,
    /// Factor and matcher noise models.
    #[serde(default)]
    pub noise: NoiseConfig,
    /// GNSS fusion gates.
    #[serde(default)]
    pub gnss: GnssConfig,
    /// Loop-closure gates.
    #[serde(default)]
    pub loop_closure: LoopClosureConfig,
    /// Registration/map gates.
    #[serde(default)]
    pub mapping: MappingConfig,
    /// Smoother step policy.
    #[serde(default)]
    pub smoother: SmootherConfig,
}
