//! Incremental nonlinear smoother over SE(3) variables.
//!
//! Factors and initial values are staged in [`FactorBuffer`]s and folded in
//! with [`IncrementalSmoother::update`], which performs one damped
//! Gauss-Newton relinearize/solve step over the whole problem; callers that
//! see a discontinuous event (loop closure, a promotion into the ego
//! partition) issue several [`IncrementalSmoother::refine`] calls to let the
//! change propagate. Every factor remembers the partition it arrived in so
//! the two-tier submission remains auditable after the fact.

use std::collections::{BTreeMap, HashMap};

use nalgebra::{DMatrix, Matrix6, Vector6};

use super::factors::{Factor, FactorKind};
use super::linalg::BlockMatrix;
use crate::config::SmootherConfig;
use crate::core::se3::{self, Pose3, Tangent};
use crate::core::types::NodeKey;
use crate::error::{Error, Result};

/// Step size of the central-difference Jacobians.
const JACOBIAN_EPS: f64 = 1e-6;

/// Current estimates of all variables, keyed by node.
#[derive(Default)]
pub struct Values {
    map: BTreeMap<NodeKey, Pose3>,
}

impl Values {
    /// Create an empty value set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the value under `key`.
    pub fn insert(&mut self, key: NodeKey, pose: Pose3) {
        self.map.insert(key, pose);
    }

    /// Remove the value under `key`, returning it if present.
    pub fn remove(&mut self, key: NodeKey) -> Option<Pose3> {
        self.map.remove(&key)
    }

    /// Look up a value.
    pub fn get(&self, key: NodeKey) -> Option<&Pose3> {
        self.map.get(&key)
    }

    /// Look up a value that the staging validation guarantees to exist.
    pub fn pose(&self, key: NodeKey) -> Pose3 {
        *self
            .map
            .get(&key)
            .expect("factor references a key validated at staging time")
    }

    /// Whether `key` has a value.
    pub fn contains(&self, key: NodeKey) -> bool {
        self.map.contains_key(&key)
    }

    /// Number of values.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Iterate values in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&NodeKey, &Pose3)> {
        self.map.iter()
    }
}

/// Which tier of the two-stage submission a factor belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Partition {
    /// Ego odometry plus tightly-coupled object factors.
    Ego,
    /// Loosely-coupled object factors.
    Loose,
}

/// Opaque handle to a factor inside the smoother.
pub type FactorId = usize;

/// Staged factors and initial values awaiting one `update` call.
#[derive(Default)]
pub struct FactorBuffer {
    factors: Vec<Box<dyn Factor>>,
    values: Vec<(NodeKey, Pose3)>,
}

impl FactorBuffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage a factor; returns its position within this buffer.
    pub fn add_factor(&mut self, factor: Box<dyn Factor>) -> usize {
        self.factors.push(factor);
        self.factors.len() - 1
    }

    /// Stage an initial value.
    pub fn insert_value(&mut self, key: NodeKey, pose: Pose3) {
        self.values.push((key, pose));
    }

    /// Drop a staged value again (the asynchronous-estimation dance around
    /// the cached ego key).
    pub fn erase_value(&mut self, key: NodeKey) {
        self.values.retain(|(k, _)| *k != key);
    }

    /// Move a staged value into `other`, if present.
    pub fn move_value_to(&mut self, key: NodeKey, other: &mut FactorBuffer) {
        if let Some(pos) = self.values.iter().position(|(k, _)| *k == key) {
            let (k, pose) = self.values.remove(pos);
            other.insert_value(k, pose);
        }
    }

    /// Look up a staged value.
    pub fn staged_value(&self, key: NodeKey) -> Option<Pose3> {
        self.values
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, p)| *p)
    }

    /// Number of staged factors.
    pub fn len(&self) -> usize {
        self.factors.len()
    }

    /// Whether nothing is staged.
    pub fn is_empty(&self) -> bool {
        self.factors.is_empty() && self.values.is_empty()
    }
}

/// Outcome of one relinearize/solve step.
#[derive(Debug, Clone, Copy)]
pub struct UpdateStats {
    /// Whitened chi-squared before the step.
    pub chi2_before: f64,
    /// Whitened chi-squared after the step.
    pub chi2_after: f64,
    /// Damping retries consumed.
    pub retries: u32,
}

struct StoredFactor {
    factor: Box<dyn Factor>,
    partition: Partition,
}

/// The joint incremental smoother.
pub struct IncrementalSmoother {
    config: SmootherConfig,
    factors: Vec<StoredFactor>,
    values: Values,
    lambda: f64,
}

impl IncrementalSmoother {
    /// Create an empty smoother.
    pub fn new(config: SmootherConfig) -> Self {
        let lambda = config.damping_factor;
        Self {
            config,
            factors: Vec::new(),
            values: Values::new(),
            lambda,
        }
    }

    /// Fold a staged buffer into the problem and run one
    /// relinearize/solve step.
    ///
    /// Staged values for keys the smoother already estimates are ignored:
    /// the running estimate is the better initializer. A staged factor
    /// referencing a key with no value anywhere is refused without touching
    /// the problem.
    pub fn update(&mut self, buffer: FactorBuffer, partition: Partition) -> Result<UpdateStats> {
        for factor in &buffer.factors {
            for key in factor.keys() {
                let staged = buffer.values.iter().any(|(k, _)| k == key);
                if !staged && !self.values.contains(*key) {
                    return Err(Error::UnknownKey(*key));
                }
            }
        }

        for (key, pose) in buffer.values {
            if !self.values.contains(key) {
                self.values.insert(key, pose);
            }
        }
        for factor in buffer.factors {
            self.factors.push(StoredFactor { factor, partition });
        }

        self.step()
    }

    /// One more relinearize/solve step without new factors.
    pub fn refine(&mut self) -> Result<UpdateStats> {
        self.step()
    }

    /// Current estimates.
    pub fn estimate(&self) -> &Values {
        &self.values
    }

    /// Number of variables.
    pub fn num_values(&self) -> usize {
        self.values.len()
    }

    /// Number of factors.
    pub fn num_factors(&self) -> usize {
        self.factors.len()
    }

    /// Error of a stored factor at the current estimate.
    pub fn factor_error(&self, id: FactorId) -> Option<f64> {
        self.factors.get(id).map(|f| f.factor.error(&self.values))
    }

    /// Iterate `(id, kind, partition, keys)` over all stored factors.
    pub fn factors(&self) -> impl Iterator<Item = (FactorId, FactorKind, Partition, &[NodeKey])> {
        self.factors
            .iter()
            .enumerate()
            .map(|(id, f)| (id, f.factor.kind(), f.partition, f.factor.keys()))
    }

    /// Marginal covariance of one variable, from the current linearization.
    pub fn marginal_covariance(&mut self, key: NodeKey) -> Result<Matrix6<f64>> {
        if !self.values.contains(key) {
            return Err(Error::UnknownKey(key));
        }
        let (ordering, index) = self.ordering();
        let (mut h, _) = self.linearize(&index);
        // A whisper of damping keeps unconstrained directions finite.
        h.damp(1e-12);
        let chol = h
            .cholesky()
            .ok_or_else(|| Error::Solver("indefinite Hessian in marginal".into()))?;

        let block = index[&key];
        let mut cov = Matrix6::zeros();
        for i in 0..6 {
            let mut rhs = vec![Vector6::zeros(); ordering.len()];
            rhs[block][i] = 1.0;
            chol.solve_in_place(&mut rhs);
            cov.set_column(i, &rhs[block]);
        }
        Ok(cov)
    }

    /// Total whitened chi-squared of the problem.
    pub fn chi2(&self) -> f64 {
        self.factors
            .iter()
            .map(|f| 2.0 * f.factor.error(&self.values))
            .sum()
    }

    fn ordering(&self) -> (Vec<NodeKey>, HashMap<NodeKey, usize>) {
        let ordering: Vec<NodeKey> = self.values.iter().map(|(k, _)| *k).collect();
        let index = ordering
            .iter()
            .enumerate()
            .map(|(i, k)| (*k, i))
            .collect();
        (ordering, index)
    }

    /// Assemble the whitened normal equations `H·δ = -g` at the current
    /// values, with central-difference Jacobians on the right-perturbed
    /// manifold.
    fn linearize(&mut self, index: &HashMap<NodeKey, usize>) -> (BlockMatrix, Vec<Vector6<f64>>) {
        let n = index.len();
        let mut h = BlockMatrix::new(n);
        let mut g = vec![Vector6::zeros(); n];

        let Self {
            factors, values, ..
        } = self;

        for stored in factors.iter() {
            let factor = stored.factor.as_ref();
            let dim = factor.dim();
            let keys = factor.keys();
            let sqrt_info = factor.sqrt_info().clone();

            let mut jacobians: Vec<DMatrix<f64>> = Vec::with_capacity(keys.len());
            for &key in keys {
                let mut jac = DMatrix::zeros(dim, 6);
                let original = values.pose(key);
                for axis in 0..6 {
                    let mut delta = Tangent::zeros();
                    delta[axis] = JACOBIAN_EPS;
                    values.insert(key, original * se3::exp(&delta));
                    let plus = factor.residual(values);
                    delta[axis] = -JACOBIAN_EPS;
                    values.insert(key, original * se3::exp(&delta));
                    let minus = factor.residual(values);
                    for row in 0..dim {
                        jac[(row, axis)] =
                            (plus[row] - minus[row]) / (2.0 * JACOBIAN_EPS) * sqrt_info[row];
                    }
                }
                values.insert(key, original);
                jacobians.push(jac);
            }

            let mut residual = factor.residual(values);
            for row in 0..dim {
                residual[row] *= sqrt_info[row];
            }

            for (a, &key_a) in keys.iter().enumerate() {
                let ia = index[&key_a];
                let jta = jacobians[a].transpose();
                g[ia] += Vector6::from_iterator((&jta * &residual).iter().copied());
                for (b, &key_b) in keys.iter().enumerate().skip(a) {
                    let ib = index[&key_b];
                    let block = &jta * &jacobians[b];
                    let block6 = Matrix6::from_iterator(block.iter().copied());
                    if ia >= ib {
                        h.add_block(ia, ib, &block6);
                    } else {
                        h.add_block(ib, ia, &block6.transpose());
                    }
                }
            }
        }

        (h, g)
    }

    /// One damped Gauss-Newton step with divergence retries, the policy of a
    /// single incremental update.
    fn step(&mut self) -> Result<UpdateStats> {
        if self.factors.is_empty() || self.values.is_empty() {
            return Ok(UpdateStats {
                chi2_before: 0.0,
                chi2_after: 0.0,
                retries: 0,
            });
        }

        let (ordering, index) = self.ordering();
        let chi2_before = self.chi2();
        let (h, g) = self.linearize(&index);

        let mut retries = 0;
        loop {
            let mut damped = h.clone();
            damped.damp(self.lambda);
            let solved = damped.cholesky().map(|chol| {
                let mut delta: Vec<Vector6<f64>> = g.iter().map(|v| -v).collect();
                chol.solve_in_place(&mut delta);
                delta
            });

            if let Some(delta) = solved {
                for (block, key) in ordering.iter().enumerate() {
                    let updated = self.values.pose(*key) * se3::exp(&delta[block]);
                    self.values.insert(*key, updated);
                }
                let chi2_after = self.chi2();
                if chi2_after <= chi2_before * 1.1 + 1e-12 {
                    self.lambda = (self.lambda * 0.1).max(self.config.damping_factor);
                    return Ok(UpdateStats {
                        chi2_before,
                        chi2_after,
                        retries,
                    });
                }
                // Diverged: revert and raise the damping.
                for (block, key) in ordering.iter().enumerate() {
                    let reverted = self.values.pose(*key) * se3::exp(&(-delta[block]));
                    self.values.insert(*key, reverted);
                }
            }

            retries += 1;
            self.lambda *= 10.0;
            if retries > self.config.max_step_retries {
                return Err(Error::Solver(format!(
                    "no descent step found (lambda {:.3e})",
                    self.lambda
                )));
            }
        }
    }
}
