//! Ground cost between a source and a target mini-batch in the joint (embedding, label) space.
//!
//! \[
//! C_{ij} = \alpha\, C^0_{ij} + \beta\, C^1_{ij},\qquad
//! C^0_{ij} = \|x^s_i - x^t_j\|^2
//! \]
//!
//! and `C1` is either the squared distance between the one-hot source label and the raw target
//! prediction (the reference behaviour) or, when `LabelCost::SoftmaxCrossEntropy` is selected,
//! `-log softmax(p^t_j)[y^s_i]`.
//!
//! All of this is host-side: the inputs come from a frozen forward pass and the output goes
//! straight into the transport solver.

use crate::{Error, Result};
use ndarray::{Array2, ArrayView2};
use serde::{Deserialize, Serialize};

/// Label/prediction term of the ground cost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelCost {
    /// `||onehot(y_i) - p_j||^2` on raw predictions.
    #[default]
    SquaredEuclidean,
    /// `-log softmax(p_j)[y_i]` (experimental).
    SoftmaxCrossEntropy,
}

/// The three matrices of one batch pair. Only `total` feeds the solver; the parts are kept for
/// logging and tests.
#[derive(Debug, Clone)]
pub struct CostMatrix {
    pub feature: Array2<f32>,
    pub label: Array2<f32>,
    pub total: Array2<f32>,
}

#[derive(Debug, Clone, Copy)]
pub struct CostMatrixBuilder {
    /// Weight of the embedding term.
    pub alpha: f32,
    /// Weight of the label term.
    pub beta: f32,
    pub label_cost: LabelCost,
    pub num_classes: usize,
}

impl CostMatrixBuilder {
    pub fn new(alpha: f32, beta: f32, label_cost: LabelCost, num_classes: usize) -> Self {
        Self {
            alpha,
            beta,
            label_cost,
            num_classes,
        }
    }

    /// Build `C` for source embeddings `xs` (`n×d`), target embeddings `xt` (`m×d`), source
    /// labels `ys` (`n`), and target predictions `pt` (`m×k`).
    pub fn build(
        &self,
        xs: &ArrayView2<f32>,
        xt: &ArrayView2<f32>,
        ys: &[usize],
        pt: &ArrayView2<f32>,
    ) -> Result<CostMatrix> {
        let n = xs.nrows();
        let m = xt.nrows();
        if n == 0 || m == 0 {
            return Err(Error::Domain("source and target batches must be non-empty"));
        }
        if xs.ncols() != xt.ncols() {
            return Err(Error::Shape("source and target embeddings must share a dimension"));
        }
        if ys.len() != n {
            return Err(Error::Shape("ys length must match xs.nrows()"));
        }
        if pt.nrows() != m {
            return Err(Error::Shape("pt rows must match xt.nrows()"));
        }
        if pt.ncols() != self.num_classes {
            return Err(Error::Config(format!(
                "target predictions have {} classes, configuration says {}",
                pt.ncols(),
                self.num_classes
            )));
        }
        if let Some(&bad) = ys.iter().find(|&&y| y >= self.num_classes) {
            return Err(Error::Data(format!(
                "source label {bad} out of range for {} classes",
                self.num_classes
            )));
        }
        if !self.alpha.is_finite() || self.alpha < 0.0 || !self.beta.is_finite() || self.beta < 0.0
        {
            return Err(Error::Config(
                "cost weights must be finite and nonnegative".to_string(),
            ));
        }
        if xs.iter().chain(xt.iter()).chain(pt.iter()).any(|v| !v.is_finite()) {
            return Err(Error::Numerical(
                "cost inputs contain NaN/Inf".to_string(),
            ));
        }

        let feature = squared_euclidean_cdist(xs, xt);
        let label = match self.label_cost {
            LabelCost::SquaredEuclidean => onehot_squared_distance(ys, pt),
            LabelCost::SoftmaxCrossEntropy => softmax_cross_entropy_cost(ys, pt),
        };
        if feature.iter().chain(label.iter()).any(|v| !v.is_finite()) {
            return Err(Error::Numerical("cost matrix overflowed".to_string()));
        }

        let mut total = Array2::<f32>::zeros((n, m));
        for ((t, &f), &l) in total.iter_mut().zip(feature.iter()).zip(label.iter()) {
            let v = self.alpha * f + self.beta * l;
            if !v.is_finite() {
                return Err(Error::Numerical("cost matrix overflowed".to_string()));
            }
            *t = v.max(0.0);
        }

        Ok(CostMatrix {
            feature,
            label,
            total,
        })
    }
}

/// `D[i, j] = sum_k (a_ik - b_jk)^2`. Overflow surfaces as `inf`.
pub fn squared_euclidean_cdist(a: &ArrayView2<f32>, b: &ArrayView2<f32>) -> Array2<f32> {
    Array2::from_shape_fn((a.nrows(), b.nrows()), |(i, j)| {
        a.row(i)
            .iter()
            .zip(b.row(j).iter())
            .map(|(&x, &y)| (x - y) * (x - y))
            .sum()
    })
}

/// `||e_y - p||^2` between each source one-hot label and each target prediction.
fn onehot_squared_distance(ys: &[usize], pt: &ArrayView2<f32>) -> Array2<f32> {
    Array2::from_shape_fn((ys.len(), pt.nrows()), |(i, j)| {
        pt.row(j)
            .iter()
            .enumerate()
            .map(|(k, &p)| {
                let e = if k == ys[i] { 1.0 } else { 0.0 };
                (e - p) * (e - p)
            })
            .sum()
    })
}

fn softmax_cross_entropy_cost(ys: &[usize], pt: &ArrayView2<f32>) -> Array2<f32> {
    let log_probs = log_softmax_rows(pt);
    let mut c = Array2::<f32>::zeros((ys.len(), pt.nrows()));
    for ((i, j), v) in c.indexed_iter_mut() {
        *v = (-log_probs[[j, ys[i]]]).max(0.0);
    }
    c
}

/// Row-wise numerically stable log-softmax.
pub fn log_softmax_rows(x: &ArrayView2<f32>) -> Array2<f32> {
    let mut out = x.to_owned();
    for mut row in out.rows_mut() {
        let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let lse = max + row.iter().map(|&v| (v - max).exp()).sum::<f32>().ln();
        row.mapv_inplace(|v| v - lse);
    }
    out
}
