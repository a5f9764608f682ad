//! Auxiliary perturbations: DefRec (deform a region, reconstruct it) and PCM (point-cloud
//! mixup).
//!
//! Both work on host batches (`[batch, num_points, 3]`) and hand back the perturbed points plus
//! whatever their loss needs; the loss side is on burn tensors so it joins the training graph.

use burn_core as burn;

use burn::tensor::activation::log_softmax;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use ndarray::{Array2, Array3, ArrayView3};
use rand::seq::SliceRandom;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Beta, Distribution, Normal};

use crate::config::DistortionMode;
use crate::loss::one_hot_tensor;
use crate::{Error, Result};

/// A region needs at least this many points to be deformed.
pub const MIN_REGION_POINTS: usize = 20;

/// Ball radius for [`DistortionMode::VolumeBasedRadius`].
pub const COLLAPSE_RADIUS: f32 = 0.5;

/// Std of the Gaussian used to resample a voxel region.
const RESAMPLE_STD: f32 = 0.03;

/// Deformed points and the binary mask of what was changed.
#[derive(Debug, Clone)]
pub struct Deformed {
    pub points: Array3<f32>,
    /// `[batch, num_points]`, 1.0 for deformed points.
    pub mask: Array2<f32>,
}

/// A self-supervised reconstruction task.
pub trait SelfSupervisedTask {
    fn deform(&mut self, points: &ArrayView3<f32>) -> Result<Deformed>;

    /// Scalar loss between the model's reconstruction and the undeformed points.
    fn loss<B: Backend>(
        &self,
        reconstruction: Tensor<B, 3>,
        original: Tensor<B, 3>,
        mask: Tensor<B, 2>,
    ) -> Tensor<B, 1>;
}

/// Centres of the `n^3` voxels that tile `[-1, 1]^3`, flattened as `ix*n*n + iy*n + iz`.
pub fn region_centres(n: usize) -> Vec<[f32; 3]> {
    let c = |i: usize| -1.0 + (2 * i + 1) as f32 / n as f32;
    let mut out = Vec::with_capacity(n * n * n);
    for ix in 0..n {
        for iy in 0..n {
            for iz in 0..n {
                out.push([c(ix), c(iy), c(iz)]);
            }
        }
    }
    out
}

/// Voxel id of a point (coordinates outside `[-1, 1]` land in the border voxels).
pub fn region_of(p: [f32; 3], n: usize) -> usize {
    let bin = |v: f32| -> usize {
        let b = ((v + 1.0) * 0.5 * n as f32).floor();
        if b < 0.0 {
            0
        } else {
            (b as usize).min(n - 1)
        }
    };
    bin(p[0]) * n * n + bin(p[1]) * n + bin(p[2])
}

/// Built-in DefRec.
///
/// Voxel mode visits regions in random order and resamples the first one holding at least
/// [`MIN_REGION_POINTS`] points from a tight Gaussian around its centre. Radius mode collapses
/// every point within [`COLLAPSE_RADIUS`] of a random anchor point onto the anchor.
#[derive(Debug, Clone)]
pub struct RegionDeformation {
    mode: DistortionMode,
    num_regions: usize,
    centres: Vec<[f32; 3]>,
    weight: f32,
    rng: ChaCha8Rng,
}

impl RegionDeformation {
    pub fn new(
        mode: DistortionMode,
        num_regions: usize,
        weight: f32,
        rng: ChaCha8Rng,
    ) -> Result<Self> {
        if num_regions == 0 {
            return Err(Error::Config("num_regions must be > 0".to_string()));
        }
        Ok(Self {
            mode,
            num_regions,
            centres: region_centres(num_regions),
            weight,
            rng,
        })
    }

    fn deform_voxels(
        &mut self,
        cloud: &mut ndarray::ArrayViewMut2<f32>,
        mask: &mut ndarray::ArrayViewMut1<f32>,
        noise: &Normal<f32>,
    ) {
        let n = self.num_regions;
        let regions: Vec<usize> = cloud
            .rows()
            .into_iter()
            .map(|r| region_of([r[0], r[1], r[2]], n))
            .collect();
        let mut order: Vec<usize> = (0..self.centres.len()).collect();
        order.shuffle(&mut self.rng);
        for region in order {
            let members: Vec<usize> = (0..regions.len()).filter(|&i| regions[i] == region).collect();
            if members.len() < MIN_REGION_POINTS {
                continue;
            }
            let centre = self.centres[region];
            for i in members {
                mask[i] = 1.0;
                for k in 0..3 {
                    cloud[[i, k]] = centre[k] + noise.sample(&mut self.rng);
                }
            }
            break;
        }
    }

    fn deform_radius(
        &mut self,
        cloud: &mut ndarray::ArrayViewMut2<f32>,
        mask: &mut ndarray::ArrayViewMut1<f32>,
    ) {
        let num_points = cloud.nrows();
        let anchor_idx = self.rng.random_range(0..num_points);
        let anchor = [
            cloud[[anchor_idx, 0]],
            cloud[[anchor_idx, 1]],
            cloud[[anchor_idx, 2]],
        ];
        let r2 = COLLAPSE_RADIUS * COLLAPSE_RADIUS;
        for i in 0..num_points {
            let d2: f32 = (0..3).map(|k| (cloud[[i, k]] - anchor[k]).powi(2)).sum();
            if d2 <= r2 {
                mask[i] = 1.0;
                for k in 0..3 {
                    cloud[[i, k]] = anchor[k];
                }
            }
        }
    }
}

impl SelfSupervisedTask for RegionDeformation {
    fn deform(&mut self, points: &ArrayView3<f32>) -> Result<Deformed> {
        let (batch, num_points, dim) = points.dim();
        if dim != 3 {
            return Err(Error::Data(format!("expected 3D points, got dimension {dim}")));
        }
        if batch == 0 || num_points == 0 {
            return Err(Error::Data("cannot deform an empty batch".to_string()));
        }
        let noise = Normal::new(0.0f32, RESAMPLE_STD)
            .map_err(|e| Error::Config(format!("deformation noise: {e}")))?;
        let mut out = points.to_owned();
        let mut mask = Array2::<f32>::zeros((batch, num_points));
        for b in 0..batch {
            let mut cloud = out.index_axis_mut(ndarray::Axis(0), b);
            let mut m = mask.row_mut(b);
            match self.mode {
                DistortionMode::VolumeBasedVoxels => self.deform_voxels(&mut cloud, &mut m, &noise),
                DistortionMode::VolumeBasedRadius => self.deform_radius(&mut cloud, &mut m),
            }
        }
        Ok(Deformed { points: out, mask })
    }

    /// `weight * sum(mask * ||r - x||^2) / max(1, sum(mask))`
    fn loss<B: Backend>(
        &self,
        reconstruction: Tensor<B, 3>,
        original: Tensor<B, 3>,
        mask: Tensor<B, 2>,
    ) -> Tensor<B, 1> {
        let [batch, num_points, _] = reconstruction.dims();
        let per_point = (reconstruction - original)
            .powf_scalar(2.0)
            .sum_dim(2)
            .reshape([batch, num_points]);
        let count = mask.clone().sum().clamp_min(1.0);
        (per_point * mask).sum().div(count).mul_scalar(self.weight)
    }
}

/// Mixup targets: both label sets and the share of points taken from the first shape.
#[derive(Debug, Clone)]
pub struct MixupTargets {
    pub labels_a: Vec<usize>,
    pub labels_b: Vec<usize>,
    pub lambda: f32,
}

#[derive(Debug, Clone)]
pub struct Mixed {
    pub points: Array3<f32>,
    pub targets: MixupTargets,
}

/// A shape-mixing regularizer for the supervised term.
pub trait MixupTask {
    fn mix(&mut self, points: &ArrayView3<f32>, labels: &[usize]) -> Result<Mixed>;

    fn loss<B: Backend>(&self, logits: Tensor<B, 2>, targets: &MixupTargets) -> Result<Tensor<B, 1>>;
}

/// Built-in PCM: draw `lambda ~ Beta(a, a)`, then build every mixed cloud from a random
/// `round(lambda * N)` points of its own shape and the remaining points of a partner shape
/// chosen by a batch permutation. The effective `lambda` is the realised point share.
#[derive(Debug, Clone)]
pub struct PointCloudMixup {
    beta: Beta<f64>,
    rng: ChaCha8Rng,
}

impl PointCloudMixup {
    pub fn new(param: f64, rng: ChaCha8Rng) -> Result<Self> {
        let beta = Beta::new(param, param)
            .map_err(|e| Error::Config(format!("mixup_param {param}: {e}")))?;
        Ok(Self { beta, rng })
    }
}

impl MixupTask for PointCloudMixup {
    fn mix(&mut self, points: &ArrayView3<f32>, labels: &[usize]) -> Result<Mixed> {
        let (batch, num_points, dim) = points.dim();
        if labels.len() != batch {
            return Err(Error::Data(format!(
                "{} labels for a batch of {batch}",
                labels.len()
            )));
        }
        if batch == 0 || num_points == 0 || dim != 3 {
            return Err(Error::Data("mixup needs a non-empty batch of 3D points".to_string()));
        }
        let lam = self.beta.sample(&mut self.rng);
        let take_a = ((lam * num_points as f64).round() as usize).min(num_points);

        let mut partner: Vec<usize> = (0..batch).collect();
        partner.shuffle(&mut self.rng);

        let mut out = Array3::<f32>::zeros((batch, num_points, 3));
        let mut idx: Vec<usize> = (0..num_points).collect();
        for b in 0..batch {
            idx.shuffle(&mut self.rng);
            let (from_a, from_b) = idx.split_at(take_a);
            let other = partner[b];
            for (slot, &i) in from_a.iter().enumerate() {
                for k in 0..3 {
                    out[[b, slot, k]] = points[[b, i, k]];
                }
            }
            for (slot, &i) in from_b.iter().enumerate() {
                for k in 0..3 {
                    out[[b, take_a + slot, k]] = points[[other, i, k]];
                }
            }
        }

        Ok(Mixed {
            points: out,
            targets: MixupTargets {
                labels_a: labels.to_vec(),
                labels_b: partner.iter().map(|&p| labels[p]).collect(),
                lambda: take_a as f32 / num_points as f32,
            },
        })
    }

    /// `lambda * CE(logits, a) + (1 - lambda) * CE(logits, b)`
    fn loss<B: Backend>(&self, logits: Tensor<B, 2>, targets: &MixupTargets) -> Result<Tensor<B, 1>> {
        let [n, k] = logits.dims();
        if targets.labels_a.len() != n || targets.labels_b.len() != n {
            return Err(Error::Shape("mixup targets must match logits rows"));
        }
        let device = logits.device();
        let soft = one_hot_tensor::<B>(&targets.labels_a, k, &device)?
            .mul_scalar(targets.lambda)
            + one_hot_tensor::<B>(&targets.labels_b, k, &device)?.mul_scalar(1.0 - targets.lambda);
        let logp = log_softmax(logits, 1);
        Ok((soft * logp).sum_dim(1).mean().neg())
    }
}
