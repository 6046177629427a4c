//! Factor library for the joint smoother.
//!
//! Every factor exposes a raw residual vector and a diagonal noise model
//! (stored as per-row `1/σ`); the smoother whitens rows during
//! linearization. Reported factor errors follow the
//! `0.5 · ‖Σ^{-1/2} r‖²` convention that the association gates and the
//! consistency thresholds are written against.
//!
//! The four custom residuals:
//!
//! - tight detection: `Log(Z⁻¹ · (X⁻¹ · P))` over ego pose `X` and object
//!   pose `P`;
//! - loose detection: the same expression with `X` frozen at the estimate
//!   the factor was created with, so the observation refines `P` without
//!   pulling on the ego;
//! - stable pose: `Log(P_t⁻¹ · P_{t-1} · Exp(Δt · Log(V_{t-1})))`, the
//!   constant-twist prediction between consecutive object poses;
//! - constant velocity: `Log(V_{t-1}⁻¹ · V_t)`.

use nalgebra::{DVector, Vector3, Vector6};

use super::smoother::Values;
use crate::core::se3::{self, Pose3};
use crate::core::types::NodeKey;

/// What a factor constrains; used for diagnostics and partition audits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FactorKind {
    /// Prior on an ego key-pose.
    Prior,
    /// Weak prior on a freshly registered track's velocity.
    VelocityPrior,
    /// Sequential ego odometry constraint.
    Odometry,
    /// Loop-closure constraint between distant ego key-poses.
    LoopClosure,
    /// GNSS position constraint.
    Gnss,
    /// Detection factor in the ego partition.
    TightDetection,
    /// Detection factor anchored on a frozen ego pose.
    LooseDetection,
    /// Constant-twist prediction between consecutive object poses.
    StablePose,
    /// Smoothness constraint between consecutive velocities.
    ConstantVelocity,
}

/// A residual block over one or more SE(3) variables.
pub trait Factor: Send {
    /// Variable keys this factor constrains, in residual order.
    fn keys(&self) -> &[NodeKey];

    /// Residual dimension.
    fn dim(&self) -> usize;

    /// Raw (unwhitened) residual at the given values.
    fn residual(&self, values: &Values) -> DVector<f64>;

    /// Per-row `1/σ` of the diagonal noise model.
    fn sqrt_info(&self) -> &DVector<f64>;

    /// Factor kind for diagnostics.
    fn kind(&self) -> FactorKind;

    /// Whitened error `0.5 · ‖Σ^{-1/2} r‖²`.
    fn error(&self, values: &Values) -> f64 {
        let r = self.residual(values);
        let s = self.sqrt_info();
        let mut sum = 0.0;
        for i in 0..r.len() {
            let w = r[i] * s[i];
            sum += w * w;
        }
        0.5 * sum
    }
}

/// `1/σ` rows from a 6-vector of variances.
pub fn sqrt_info_from_variances(variances: &[f64; 6]) -> DVector<f64> {
    DVector::from_iterator(6, variances.iter().map(|v| 1.0 / v.sqrt()))
}

fn log_residual(rel: Pose3) -> DVector<f64> {
    let xi: Vector6<f64> = se3::log(&rel);
    DVector::from_column_slice(xi.as_slice())
}

/// Prior factor pinning one pose to a target.
pub struct PriorFactor {
    keys: [NodeKey; 1],
    target: Pose3,
    sqrt_info: DVector<f64>,
    kind: FactorKind,
}

impl PriorFactor {
    /// Prior on an ego key-pose.
    pub fn new(key: NodeKey, target: Pose3, variances: &[f64; 6]) -> Self {
        Self {
            keys: [key],
            target,
            sqrt_info: sqrt_info_from_variances(variances),
            kind: FactorKind::Prior,
        }
    }

    /// Weak velocity prior for a freshly registered track.
    pub fn velocity(key: NodeKey, target: Pose3, variances: &[f64; 6]) -> Self {
        Self {
            kind: FactorKind::VelocityPrior,
            ..Self::new(key, target, variances)
        }
    }
}

impl Factor for PriorFactor {
    fn keys(&self) -> &[NodeKey] {
        &self.keys
    }

    fn dim(&self) -> usize {
        6
    }

    fn residual(&self, values: &Values) -> DVector<f64> {
        log_residual(se3::between(&self.target, &values.pose(self.keys[0])))
    }

    fn sqrt_info(&self) -> &DVector<f64> {
        &self.sqrt_info
    }

    fn kind(&self) -> FactorKind {
        self.kind
    }
}

/// Relative-pose constraint between two variables.
pub struct BetweenFactor {
    keys: [NodeKey; 2],
    measurement: Pose3,
    sqrt_info: DVector<f64>,
    kind: FactorKind,
}

impl BetweenFactor {
    /// Sequential odometry edge.
    pub fn odometry(from: NodeKey, to: NodeKey, measurement: Pose3, variances: &[f64; 6]) -> Self {
        Self {
            keys: [from, to],
            measurement,
            sqrt_info: sqrt_info_from_variances(variances),
            kind: FactorKind::Odometry,
        }
    }

    /// Loop-closure edge.
    pub fn loop_closure(
        from: NodeKey,
        to: NodeKey,
        measurement: Pose3,
        variances: &[f64; 6],
    ) -> Self {
        Self {
            kind: FactorKind::LoopClosure,
            ..Self::odometry(from, to, measurement, variances)
        }
    }
}

impl Factor for BetweenFactor {
    fn keys(&self) -> &[NodeKey] {
        &self.keys
    }

    fn dim(&self) -> usize {
        6
    }

    fn residual(&self, values: &Values) -> DVector<f64> {
        let predicted = se3::between(&values.pose(self.keys[0]), &values.pose(self.keys[1]));
        log_residual(se3::between(&self.measurement, &predicted))
    }

    fn sqrt_info(&self) -> &DVector<f64> {
        &self.sqrt_info
    }

    fn kind(&self) -> FactorKind {
        self.kind
    }
}

/// Position-only GNSS constraint on an ego key-pose.
pub struct GnssFactor {
    keys: [NodeKey; 1],
    position: Vector3<f64>,
    sqrt_info: DVector<f64>,
}

impl GnssFactor {
    /// Constrain the pose translation to the GNSS fix.
    pub fn new(key: NodeKey, position: Vector3<f64>, variances: &Vector3<f64>) -> Self {
        Self {
            keys: [key],
            position,
            sqrt_info: DVector::from_iterator(3, variances.iter().map(|v| 1.0 / v.sqrt())),
        }
    }
}

impl Factor for GnssFactor {
    fn keys(&self) -> &[NodeKey] {
        &self.keys
    }

    fn dim(&self) -> usize {
        3
    }

    fn residual(&self, values: &Values) -> DVector<f64> {
        let t = values.pose(self.keys[0]).translation.vector;
        DVector::from_column_slice((t - self.position).as_slice())
    }

    fn sqrt_info(&self) -> &DVector<f64> {
        &self.sqrt_info
    }

    fn kind(&self) -> FactorKind {
        FactorKind::Gnss
    }
}

/// Tightly-coupled detection factor over (ego pose, object pose).
///
/// Ties the object to the ego through the sensor-frame observation, so the
/// observed rigidity pins both ends.
pub struct TightDetectionFactor {
    keys: [NodeKey; 2],
    detection: Pose3,
    sqrt_info: DVector<f64>,
}

impl TightDetectionFactor {
    /// `ego` and `object` are smoother keys; `detection` is the observed box
    /// pose in the sensor frame.
    pub fn new(ego: NodeKey, object: NodeKey, detection: Pose3, variances: &[f64; 6]) -> Self {
        Self {
            keys: [ego, object],
            detection,
            sqrt_info: sqrt_info_from_variances(variances),
        }
    }
}

impl Factor for TightDetectionFactor {
    fn keys(&self) -> &[NodeKey] {
        &self.keys
    }

    fn dim(&self) -> usize {
        6
    }

    fn residual(&self, values: &Values) -> DVector<f64> {
        let in_sensor = se3::between(&values.pose(self.keys[0]), &values.pose(self.keys[1]));
        log_residual(se3::between(&self.detection, &in_sensor))
    }

    fn sqrt_info(&self) -> &DVector<f64> {
        &self.sqrt_info
    }

    fn kind(&self) -> FactorKind {
        FactorKind::TightDetection
    }
}

/// Loosely-coupled detection factor over the object pose only.
///
/// The ego pose is captured at creation time as a constant, so the
/// observation cannot pull on the odometry.
pub struct LooseDetectionFactor {
    keys: [NodeKey; 1],
    ego_pose: Pose3,
    detection: Pose3,
    sqrt_info: DVector<f64>,
}

impl LooseDetectionFactor {
    /// `ego_pose` is the current ego estimate, frozen; `detection` is the
    /// observed box pose in the sensor frame.
    pub fn new(object: NodeKey, ego_pose: Pose3, detection: Pose3, variances: &[f64; 6]) -> Self {
        Self {
            keys: [object],
            ego_pose,
            detection,
            sqrt_info: sqrt_info_from_variances(variances),
        }
    }
}

impl Factor for LooseDetectionFactor {
    fn keys(&self) -> &[NodeKey] {
        &self.keys
    }

    fn dim(&self) -> usize {
        6
    }

    fn residual(&self, values: &Values) -> DVector<f64> {
        let in_sensor = se3::between(&self.ego_pose, &values.pose(self.keys[0]));
        log_residual(se3::between(&self.detection, &in_sensor))
    }

    fn sqrt_info(&self) -> &DVector<f64> {
        &self.sqrt_info
    }

    fn kind(&self) -> FactorKind {
        FactorKind::LooseDetection
    }
}

/// Stable-pose motion factor over (previous pose, previous velocity,
/// current pose) with a fixed time step.
pub struct StablePoseFactor {
    keys: [NodeKey; 3],
    dt: f64,
    sqrt_info: DVector<f64>,
}

impl StablePoseFactor {
    /// Keys in order: previous pose, previous velocity, current pose.
    pub fn new(
        prev_pose: NodeKey,
        prev_velocity: NodeKey,
        pose: NodeKey,
        dt: f64,
        variances: &[f64; 6],
    ) -> Self {
        Self {
            keys: [prev_pose, prev_velocity, pose],
            dt,
            sqrt_info: sqrt_info_from_variances(variances),
        }
    }
}

impl Factor for StablePoseFactor {
    fn keys(&self) -> &[NodeKey] {
        &self.keys
    }

    fn dim(&self) -> usize {
        6
    }

    fn residual(&self, values: &Values) -> DVector<f64> {
        let prev = values.pose(self.keys[0]);
        let velocity = values.pose(self.keys[1]);
        let current = values.pose(self.keys[2]);
        let predicted = prev * se3::exp(&(se3::log(&velocity) * self.dt));
        log_residual(se3::between(&current, &predicted))
    }

    fn sqrt_info(&self) -> &DVector<f64> {
        &self.sqrt_info
    }

    fn kind(&self) -> FactorKind {
        FactorKind::StablePose
    }
}

/// Constant-velocity factor over consecutive velocity variables.
pub struct ConstantVelocityFactor {
    keys: [NodeKey; 2],
    sqrt_info: DVector<f64>,
}

impl ConstantVelocityFactor {
    /// Keys in order: previous velocity, current velocity.
    pub fn new(prev: NodeKey, current: NodeKey, variances: &[f64; 6]) -> Self {
        Self {
            keys: [prev, current],
            sqrt_info: sqrt_info_from_variances(variances),
        }
    }
}

impl Factor for ConstantVelocityFactor {
    fn keys(&self) -> &[NodeKey] {
        &self.keys
    }

    fn dim(&self) -> usize {
        6
    }

    fn residual(&self, values: &Values) -> DVector<f64> {
        log_residual(se3::between(
            &values.pose(self.keys[0]),
            &values.pose(self.keys[1]),
        ))
    }

    fn sqrt_info(&self) -> &DVector<f64> {
        &self.sqrt_info
    }

    fn kind(&self) -> FactorKind {
        FactorKind::ConstantVelocity
    }
}
