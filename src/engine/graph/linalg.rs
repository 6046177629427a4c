//! Block-sparse normal equations and their Cholesky factorization.
//!
//! The smoother's Hessian is stored as 6x6 blocks keyed by (row, col) block
//! indices, lower triangle only. Factorization is a right-looking block
//! Cholesky in natural order; the graphs this crate builds are chain-like
//! (odometry and per-track motion chains plus a few long-range loop edges),
//! so natural order keeps fill-in near the band.

use std::collections::BTreeMap;

use nalgebra::{Cholesky, Matrix6, Vector6};

/// Symmetric block matrix, lower triangle stored.
#[derive(Debug, Clone)]
pub struct BlockMatrix {
    n: usize,
    blocks: BTreeMap<(usize, usize), Matrix6<f64>>,
}

impl BlockMatrix {
    /// Create an all-zero symmetric matrix of `n` 6x6 blocks.
    pub fn new(n: usize) -> Self {
        Self {
            n,
            blocks: BTreeMap::new(),
        }
    }

    /// Number of block rows.
    pub fn block_dim(&self) -> usize {
        self.n
    }

    /// Accumulate `m` into block (r, c). Upper-triangle writes are folded
    /// into the stored lower triangle.
    pub fn add_block(&mut self, r: usize, c: usize, m: &Matrix6<f64>) {
        if r >= c {
            *self
                .blocks
                .entry((r, c))
                .or_insert_with(Matrix6::zeros) += m;
        } else {
            *self
                .blocks
                .entry((c, r))
                .or_insert_with(Matrix6::zeros) += m.transpose();
        }
    }

    /// Add `lambda · max(diag, floor)` to every diagonal entry, the
    /// Levenberg-Marquardt damping rule.
    pub fn damp(&mut self, lambda: f64) {
        for c in 0..self.n {
            let block = self
                .blocks
                .entry((c, c))
                .or_insert_with(Matrix6::zeros);
            for i in 0..6 {
                block[(i, i)] += lambda * block[(i, i)].max(1.0);
            }
        }
    }

    /// Factorize as `L·Lᵀ`. Returns `None` when a diagonal pivot is not
    /// positive definite.
    pub fn cholesky(&self) -> Option<BlockCholesky> {
        let mut work = self.blocks.clone();
        let mut diag: Vec<Matrix6<f64>> = Vec::with_capacity(self.n);
        let mut cols: Vec<Vec<(usize, Matrix6<f64>)>> = vec![Vec::new(); self.n];

        for c in 0..self.n {
            let d = work.remove(&(c, c)).unwrap_or_else(Matrix6::zeros);
            let l_cc = Cholesky::new(d)?.l();

            // Sub-diagonal blocks of this column: L_rc = W_rc · L_cc⁻ᵀ.
            let rows: Vec<usize> = work
                .range((c + 1, c)..(self.n, c + 1))
                .filter(|((_, cc), _)| *cc == c)
                .map(|((r, _), _)| *r)
                .collect();
            for &r in &rows {
                let w_rc = work.remove(&(r, c)).unwrap_or_else(Matrix6::zeros);
                let l_rc = solve_lower_rhs(&l_cc, &w_rc.transpose()).transpose();
                cols[c].push((r, l_rc));
            }

            // Schur update of the trailing submatrix.
            for i in 0..cols[c].len() {
                let (r1, l1) = cols[c][i];
                for j in 0..=i {
                    let (r2, l2) = cols[c][j];
                    let (hi, lo) = if r1 >= r2 { (r1, r2) } else { (r2, r1) };
                    let update = if r1 >= r2 {
                        l1 * l2.transpose()
                    } else {
                        l2 * l1.transpose()
                    };
                    *work
                        .entry((hi, lo))
                        .or_insert_with(Matrix6::zeros) -= update;
                }
            }

            diag.push(l_cc);
        }

        Some(BlockCholesky { n: self.n, diag, cols })
    }
}

/// Lower-triangular block factor of a [`BlockMatrix`].
#[derive(Debug, Clone)]
pub struct BlockCholesky {
    n: usize,
    /// Diagonal lower-triangular 6x6 factors.
    diag: Vec<Matrix6<f64>>,
    /// Sub-diagonal blocks per column, sorted by row.
    cols: Vec<Vec<(usize, Matrix6<f64>)>>,
}

impl BlockCholesky {
    /// Solve `L·Lᵀ·x = b` in place.
    pub fn solve_in_place(&self, b: &mut [Vector6<f64>]) {
        debug_assert_eq!(b.len(), self.n);

        // Forward: L·y = b, column-oriented.
        for c in 0..self.n {
            let y = solve_lower(&self.diag[c], &b[c]);
            b[c] = y;
            for (r, l_rc) in &self.cols[c] {
                b[*r] -= l_rc * y;
            }
        }

        // Backward: Lᵀ·x = y.
        for c in (0..self.n).rev() {
            let mut acc = b[c];
            for (r, l_rc) in &self.cols[c] {
                acc -= l_rc.transpose() * b[*r];
            }
            b[c] = solve_upper_transposed(&self.diag[c], &acc);
        }
    }
}

/// Forward substitution `L·x = b` for a lower-triangular 6x6 `L`.
fn solve_lower(l: &Matrix6<f64>, b: &Vector6<f64>) -> Vector6<f64> {
    let mut x = Vector6::zeros();
    for i in 0..6 {
        let mut sum = b[i];
        for j in 0..i {
            sum -= l[(i, j)] * x[j];
        }
        x[i] = sum / l[(i, i)];
    }
    x
}

/// Back substitution `Lᵀ·x = b` for a lower-triangular 6x6 `L`.
fn solve_upper_transposed(l: &Matrix6<f64>, b: &Vector6<f64>) -> Vector6<f64> {
    let mut x = Vector6::zeros();
    for i in (0..6).rev() {
        let mut sum = b[i];
        for j in (i + 1)..6 {
            sum -= l[(j, i)] * x[j];
        }
        x[i] = sum / l[(i, i)];
    }
    x
}

/// Forward substitution with a 6x6 right-hand side: `L·X = B`.
fn solve_lower_rhs(l: &Matrix6<f64>, b: &Matrix6<f64>) -> Matrix6<f64> {
    let mut x = Matrix6::zeros();
    for col in 0..6 {
        let xc = solve_lower(l, &b.column(col).into_owned());
        x.set_column(col, &xc);
    }
    x
}
