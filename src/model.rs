//! The model seam and the built-in PointNet classifier.
//!
//! Training only needs four things from a network: logits per head, the intermediate embedding
//! the alignment loss pulls together, a point-wise reconstruction for DefRec, and a couple of
//! shape facts. [`PointCloudModel`] is exactly that; anything implementing it (and burn's
//! `AutodiffModule`) can be trained.

use burn_core as burn;

use burn::module::Module;
use burn::tensor::activation::{relu, sigmoid};
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use burn_nn::{Dropout, DropoutConfig, Linear, LinearConfig};

use crate::config::ModelConfig;
use crate::{Error, Result};

/// Which classifier output to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Head {
    Classification,
    Alignment,
}

/// Everything one forward pass produces.
#[derive(Debug, Clone)]
pub struct ModelOutput<B: Backend> {
    /// `[batch, num_classes]`
    pub classification: Tensor<B, 2>,
    /// `[batch, num_classes]`, present iff the model has an alignment head.
    pub alignment: Option<Tensor<B, 2>>,
    /// `[batch, embedding_dim]`
    pub embedding: Tensor<B, 2>,
}

impl<B: Backend> ModelOutput<B> {
    pub fn head(&self, head: Head) -> Result<Tensor<B, 2>> {
        match head {
            Head::Classification => Ok(self.classification.clone()),
            Head::Alignment => self.alignment.clone().ok_or_else(|| {
                Error::Config("alignment head requested but the model has none".to_string())
            }),
        }
    }
}

/// A point-cloud classifier trainable by the epoch trainer.
pub trait PointCloudModel<B: Backend>: Module<B> {
    /// `points`: `[batch, num_points, 3]`.
    fn forward(&self, points: Tensor<B, 3>) -> ModelOutput<B>;

    /// DefRec reconstruction, `[batch, num_points, 3]`.
    fn reconstruct(&self, points: Tensor<B, 3>) -> Tensor<B, 3>;

    fn num_classes(&self) -> usize;

    fn has_alignment_head(&self) -> bool;
}

/// Shared per-point MLP, max-pool, embedding, two classifier heads, and a folding-style
/// decoder that maps `[point feature, global feature]` back to coordinates.
#[derive(Module, Debug)]
pub struct PointNetClassifier<B: Backend> {
    point_mlp: Vec<Linear<B>>,
    embed: Linear<B>,
    dropout: Dropout,
    cls_head: Linear<B>,
    align_head: Option<Linear<B>>,
    decoder: Vec<Linear<B>>,
    num_classes: usize,
    sigmoid_embedding: bool,
}

impl<B: Backend> PointNetClassifier<B> {
    pub fn new(
        device: &B::Device,
        config: &ModelConfig,
        num_classes: usize,
        alignment_head: bool,
    ) -> Result<Self> {
        let Some(&feat_dim) = config.point_dims.last() else {
            return Err(Error::Config("model.point_dims must be non-empty".to_string()));
        };
        if num_classes == 0 || config.embedding_dim == 0 {
            return Err(Error::Config(
                "num_classes and embedding_dim must be > 0".to_string(),
            ));
        }

        let mut point_mlp = Vec::with_capacity(config.point_dims.len());
        let mut in_dim = 3;
        for &out_dim in &config.point_dims {
            point_mlp.push(LinearConfig::new(in_dim, out_dim).init(device));
            in_dim = out_dim;
        }

        let embed = LinearConfig::new(feat_dim, config.embedding_dim).init(device);
        let cls_head = LinearConfig::new(config.embedding_dim, num_classes).init(device);
        let align_head = alignment_head
            .then(|| LinearConfig::new(config.embedding_dim, num_classes).init(device));

        let mut decoder = Vec::with_capacity(config.decoder_dims.len() + 1);
        let mut in_dim = 2 * feat_dim;
        for &out_dim in &config.decoder_dims {
            decoder.push(LinearConfig::new(in_dim, out_dim).init(device));
            in_dim = out_dim;
        }
        decoder.push(LinearConfig::new(in_dim, 3).init(device));

        Ok(Self {
            point_mlp,
            embed,
            dropout: DropoutConfig::new(config.dropout).init(),
            cls_head,
            align_head,
            decoder,
            num_classes,
            sigmoid_embedding: config.sigmoid_embedding,
        })
    }

    /// Per-point features `[batch, num_points, feat]` and their max-pool `[batch, feat]`.
    fn encode(&self, points: Tensor<B, 3>) -> (Tensor<B, 3>, Tensor<B, 2>) {
        let [batch, num_points, _] = points.dims();
        let mut x = points.reshape([batch * num_points, 3]);
        for layer in &self.point_mlp {
            x = relu(layer.forward(x));
        }
        let feat = x.dims()[1];
        let per_point: Tensor<B, 3> = x.reshape([batch, num_points, feat]);
        let global = per_point.clone().max_dim(1).reshape([batch, feat]);
        (per_point, global)
    }
}

impl<B: Backend> PointCloudModel<B> for PointNetClassifier<B> {
    fn forward(&self, points: Tensor<B, 3>) -> ModelOutput<B> {
        let (_, global) = self.encode(points);
        let pre = self.embed.forward(global);
        let embedding = if self.sigmoid_embedding {
            sigmoid(pre)
        } else {
            relu(pre)
        };
        let h = self.dropout.forward(embedding.clone());
        let classification = self.cls_head.forward(h.clone());
        let alignment = self.align_head.as_ref().map(|head| head.forward(h));
        ModelOutput {
            classification,
            alignment,
            embedding,
        }
    }

    fn reconstruct(&self, points: Tensor<B, 3>) -> Tensor<B, 3> {
        let [batch, num_points, _] = points.dims();
        let (per_point, global) = self.encode(points);
        let feat = global.dims()[1];
        let global = global.reshape([batch, 1, feat]).repeat_dim(1, num_points);
        let mut x = Tensor::cat(vec![per_point, global], 2).reshape([batch * num_points, 2 * feat]);
        let last = self.decoder.len() - 1;
        for (i, layer) in self.decoder.iter().enumerate() {
            x = layer.forward(x);
            if i < last {
                x = relu(x);
            }
        }
        x.reshape([batch, num_points, 3])
    }

    fn num_classes(&self) -> usize {
        self.num_classes
    }

    fn has_alignment_head(&self) -> bool {
        self.align_head.is_some()
    }
}
