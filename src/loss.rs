//! Differentiable DeepJDOT losses.
//!
//! Both losses take the coupling `gamma` as a plain tensor built from host data, so it is a
//! constant for autodiff: gradients flow into the embeddings and logits only.
//!
//! - [`alignment_loss`]: \( \lambda_1 \alpha \sum_{ij} \gamma_{ij} \|g^s_i - g^t_j\|^2 \)
//! - [`categorical_transport_loss`]:
//!   \( w_{cl} ( w_t \sum_{ij} \gamma_{ij}\, \mathrm{CE}(y^s_i, f^t_j) + w_s\, \overline{\mathrm{CE}}(y^s, f^s) ) \)

use burn_core as burn;

use burn::tensor::activation::log_softmax;
use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, TensorData};

use crate::config::JdotWeights;
use crate::{Error, Result};

/// One-hot matrix `[labels.len(), num_classes]`.
pub fn one_hot_tensor<B: Backend>(
    labels: &[usize],
    num_classes: usize,
    device: &B::Device,
) -> Result<Tensor<B, 2>> {
    let mut v = vec![0.0f32; labels.len() * num_classes];
    for (i, &y) in labels.iter().enumerate() {
        if y >= num_classes {
            return Err(Error::Data(format!(
                "label {y} out of range for {num_classes} classes"
            )));
        }
        v[i * num_classes + y] = 1.0;
    }
    Ok(Tensor::from_data(
        TensorData::new(v, [labels.len(), num_classes]),
        device,
    ))
}

/// `D[i, j] = ||a_i - b_j||^2` on tensors; same definition as the host cost.
pub fn pairwise_sq_dists<B: Backend>(a: Tensor<B, 2>, b: Tensor<B, 2>) -> Tensor<B, 2> {
    let [m, _] = b.dims();
    let a2 = a.clone().powf_scalar(2.0).sum_dim(1);
    let b2 = b.clone().powf_scalar(2.0).sum_dim(1).reshape([1, m]);
    let ab = a.matmul(b.transpose());
    a2 + b2 - ab.mul_scalar(2.0)
}

/// Mean cross-entropy of `logits` against integer labels.
pub fn cross_entropy<B: Backend>(logits: Tensor<B, 2>, labels: &[usize]) -> Result<Tensor<B, 1>> {
    let [n, k] = logits.dims();
    if labels.len() != n {
        return Err(Error::Shape("labels length must match logits rows"));
    }
    let onehot = one_hot_tensor::<B>(labels, k, &logits.device())?;
    let logp = log_softmax(logits, 1);
    Ok((onehot * logp).sum_dim(1).mean().neg())
}

/// Coupling-weighted embedding distance.
pub fn alignment_loss<B: Backend>(
    source_embedding: Tensor<B, 2>,
    target_embedding: Tensor<B, 2>,
    gamma: Tensor<B, 2>,
    alpha: f32,
    train_align_weight: f32,
) -> Result<Tensor<B, 1>> {
    let [n, d] = source_embedding.dims();
    let [m, d2] = target_embedding.dims();
    if d != d2 {
        return Err(Error::Shape("source and target embeddings must share a dimension"));
    }
    if gamma.dims() != [n, m] {
        return Err(Error::Shape("gamma must be [n_src, n_trg]"));
    }
    let dist = pairwise_sq_dists(source_embedding, target_embedding);
    Ok((gamma * dist).sum().mul_scalar(train_align_weight * alpha))
}

/// Coupling-weighted cross-domain classification loss plus source supervision.
pub fn categorical_transport_loss<B: Backend>(
    source_logits: Tensor<B, 2>,
    target_logits: Tensor<B, 2>,
    source_labels: &[usize],
    gamma: Tensor<B, 2>,
    weights: &JdotWeights,
) -> Result<Tensor<B, 1>> {
    let [n, k] = source_logits.dims();
    let [m, k2] = target_logits.dims();
    if k != k2 {
        return Err(Error::Shape("source and target logits must have the same classes"));
    }
    if gamma.dims() != [n, m] {
        return Err(Error::Shape("gamma must be [n_src, n_trg]"));
    }
    let source_loss = cross_entropy(source_logits, source_labels)?;

    // target_loss[i, j] = -(onehot(y_i) . log_softmax(t_j))
    let onehot = one_hot_tensor::<B>(source_labels, k, &target_logits.device())?;
    let target_logp = log_softmax(target_logits, 1);
    let target_loss = onehot.matmul(target_logp.transpose()).neg();

    let transported = (gamma * target_loss).sum().mul_scalar(weights.target_weight);
    Ok((transported + source_loss.mul_scalar(weights.source_weight))
        .mul_scalar(weights.train_cl_weight))
}
