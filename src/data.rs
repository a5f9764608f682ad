//! Point-cloud sets, per-domain loaders, and the synthetic domains the binary trains on.
//!
//! A [`PointCloudSet`] is an in-memory `[len, num_points, 3]` array plus labels. Loaders never
//! copy the set; they plan an epoch as index lists and gather one [`Batch`] at a time.

use ndarray::{Array3, ArrayView3, Axis};
use rand::seq::SliceRandom;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};

use crate::config::{DatasetName, SyntheticConfig};
use crate::{Error, Result};

/// One mini-batch.
#[derive(Debug, Clone)]
pub struct Batch {
    /// `[batch, num_points, 3]`
    pub points: Array3<f32>,
    pub labels: Vec<usize>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct PointCloudSet {
    points: Array3<f32>,
    labels: Vec<usize>,
}

impl PointCloudSet {
    pub fn new(points: Array3<f32>, labels: Vec<usize>) -> Result<Self> {
        let (n, num_points, dim) = points.dim();
        if labels.len() != n {
            return Err(Error::Data(format!(
                "{} labels for {n} point clouds",
                labels.len()
            )));
        }
        if dim != 3 {
            return Err(Error::Data(format!("expected 3D points, got dimension {dim}")));
        }
        if n > 0 && num_points == 0 {
            return Err(Error::Data("point clouds must have at least one point".to_string()));
        }
        if points.iter().any(|v| !v.is_finite()) {
            return Err(Error::Data("point coordinates contain NaN/Inf".to_string()));
        }
        Ok(Self { points, labels })
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn points(&self) -> ArrayView3<'_, f32> {
        self.points.view()
    }

    pub fn labels(&self) -> &[usize] {
        &self.labels
    }

    /// Gather the given samples, in order.
    pub fn gather(&self, indices: &[usize]) -> Result<Batch> {
        if let Some(&bad) = indices.iter().find(|&&i| i >= self.len()) {
            return Err(Error::Data(format!(
                "sample index {bad} out of range for a set of {}",
                self.len()
            )));
        }
        Ok(Batch {
            points: self.points.select(Axis(0), indices),
            labels: indices.iter().map(|&i| self.labels[i]).collect(),
        })
    }

    /// Sub-set by index.
    pub fn subset(&self, indices: &[usize]) -> Result<Self> {
        let b = self.gather(indices)?;
        Ok(Self {
            points: b.points,
            labels: b.labels,
        })
    }

    /// Samples per class over `0..num_classes`; labels outside the range are an error.
    pub fn class_counts(&self, num_classes: usize) -> Result<Vec<usize>> {
        let mut counts = vec![0usize; num_classes];
        for &y in &self.labels {
            if y >= num_classes {
                return Err(Error::Data(format!(
                    "label {y} out of range for {num_classes} classes"
                )));
            }
            counts[y] += 1;
        }
        Ok(counts)
    }

    /// Shuffle, then cut off `val_fraction` of the samples (at least one when possible) as a
    /// validation set.
    pub fn split_train_val(&self, val_fraction: f32, rng: &mut ChaCha8Rng) -> Result<(Self, Self)> {
        if !(val_fraction > 0.0 && val_fraction < 1.0) {
            return Err(Error::Config("val_fraction must be in (0, 1)".to_string()));
        }
        let n = self.len();
        if n < 2 {
            return Err(Error::Data(format!("cannot split a set of {n} samples")));
        }
        let mut idx: Vec<usize> = (0..n).collect();
        idx.shuffle(rng);
        let n_val = ((n as f32 * val_fraction).round() as usize).clamp(1, n - 1);
        let (val, train) = idx.split_at(n_val);
        Ok((self.subset(train)?, self.subset(val)?))
    }
}

/// How a training loader draws its batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sampling {
    /// Shuffle every epoch; the trailing incomplete batch is dropped.
    Random,
    /// Every batch holds `batch_size / num_classes` samples of each class.
    Balanced { num_classes: usize },
}

/// Batches of one domain's training set.
#[derive(Debug, Clone)]
pub struct DomainLoader<'a> {
    set: &'a PointCloudSet,
    batch_size: usize,
    sampling: Sampling,
}

impl<'a> DomainLoader<'a> {
    pub fn new(set: &'a PointCloudSet, batch_size: usize, sampling: Sampling) -> Result<Self> {
        if batch_size == 0 {
            return Err(Error::Config("batch_size must be > 0".to_string()));
        }
        if let Sampling::Balanced { num_classes } = sampling {
            if num_classes == 0 || batch_size % num_classes != 0 {
                return Err(Error::Config(format!(
                    "balanced batches of {batch_size} need a multiple of {num_classes} classes"
                )));
            }
            let counts = set.class_counts(num_classes)?;
            if let Some(c) = counts.iter().position(|&c| c == 0) {
                return Err(Error::Data(format!(
                    "class {c} has no samples; balanced sampling is impossible"
                )));
            }
        }
        Ok(Self {
            set,
            batch_size,
            sampling,
        })
    }

    /// Number of batches one epoch yields.
    pub fn batches_per_epoch(&self) -> usize {
        self.set.len() / self.batch_size
    }

    /// Plan one epoch.
    pub fn epoch(&self, rng: &mut ChaCha8Rng) -> EpochBatches<'a> {
        let plan = match self.sampling {
            Sampling::Random => {
                let mut idx: Vec<usize> = (0..self.set.len()).collect();
                idx.shuffle(rng);
                idx.chunks_exact(self.batch_size).map(<[usize]>::to_vec).collect()
            }
            Sampling::Balanced { num_classes } => self.balanced_plan(num_classes, rng),
        };
        EpochBatches {
            set: self.set,
            plan: plan.into_iter(),
        }
    }

    // Per-class pools are reshuffled when they run dry, so rare classes repeat within an epoch.
    fn balanced_plan(&self, num_classes: usize, rng: &mut ChaCha8Rng) -> Vec<Vec<usize>> {
        let per_class = self.batch_size / num_classes;
        let mut pools: Vec<Vec<usize>> = vec![Vec::new(); num_classes];
        for (i, &y) in self.set.labels().iter().enumerate() {
            pools[y].push(i);
        }
        for pool in &mut pools {
            pool.shuffle(rng);
        }
        let mut cursor = vec![0usize; num_classes];
        let mut plan = Vec::with_capacity(self.batches_per_epoch());
        for _ in 0..self.batches_per_epoch() {
            let mut batch = Vec::with_capacity(self.batch_size);
            for c in 0..num_classes {
                for _ in 0..per_class {
                    if cursor[c] == pools[c].len() {
                        pools[c].shuffle(rng);
                        cursor[c] = 0;
                    }
                    batch.push(pools[c][cursor[c]]);
                    cursor[c] += 1;
                }
            }
            batch.shuffle(rng);
            plan.push(batch);
        }
        plan
    }
}

/// One epoch of batches.
#[derive(Debug)]
pub struct EpochBatches<'a> {
    set: &'a PointCloudSet,
    plan: std::vec::IntoIter<Vec<usize>>,
}

impl Iterator for EpochBatches<'_> {
    type Item = Batch;

    fn next(&mut self) -> Option<Batch> {
        let idx = self.plan.next()?;
        // Indices come from the set itself.
        Some(Batch {
            points: self.set.points.select(Axis(0), &idx),
            labels: idx.iter().map(|&i| self.set.labels[i]).collect(),
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.plan.size_hint()
    }
}

/// Every split a run touches.
#[derive(Debug, Clone)]
pub struct DomainSplits {
    pub source_train: PointCloudSet,
    pub source_val: PointCloudSet,
    pub target_train: PointCloudSet,
    pub target_val: PointCloudSet,
    pub target_test: PointCloudSet,
}

impl DomainSplits {
    /// Synthetic source and target domains with the same label space, drawn from `rng`
    /// (normally `component_rng(SeedStream::Data)`).
    pub fn synthetic(
        source: DatasetName,
        target: DatasetName,
        num_classes: usize,
        cfg: &SyntheticConfig,
        val_fraction: f32,
        mut rng: ChaCha8Rng,
    ) -> Result<Self> {
        let src = synthetic_domain(source, num_classes, cfg.train_per_class, cfg.num_points, &mut rng)?;
        let trg = synthetic_domain(target, num_classes, cfg.train_per_class, cfg.num_points, &mut rng)?;
        let target_test =
            synthetic_domain(target, num_classes, cfg.test_per_class, cfg.num_points, &mut rng)?;
        let (source_train, source_val) = src.split_train_val(val_fraction, &mut rng)?;
        let (target_train, target_val) = trg.split_train_val(val_fraction, &mut rng)?;
        tracing::info!(
            %source,
            %target,
            source_train = source_train.len(),
            source_val = source_val.len(),
            target_train = target_train.len(),
            target_val = target_val.len(),
            target_test = target_test.len(),
            "synthetic domains ready"
        );
        Ok(Self {
            source_train,
            source_val,
            target_train,
            target_val,
            target_test,
        })
    }
}

/// Class-conditioned shapes in the unit ball, perturbed the way each benchmark differs:
/// ModelNet clean, ShapeNet with anisotropic scale and a yaw, ScanNet noisy with one side
/// occluded (the occluded points are re-drawn from the visible ones).
pub fn synthetic_domain(
    domain: DatasetName,
    num_classes: usize,
    per_class: usize,
    num_points: usize,
    rng: &mut ChaCha8Rng,
) -> Result<PointCloudSet> {
    if num_classes == 0 || per_class == 0 || num_points == 0 {
        return Err(Error::Config(
            "synthetic domains need classes, samples and points".to_string(),
        ));
    }
    let jitter = Normal::new(0.0f32, 0.01).map_err(|e| Error::Config(e.to_string()))?;
    let scan_noise = Normal::new(0.0f32, 0.04).map_err(|e| Error::Config(e.to_string()))?;

    let n = num_classes * per_class;
    let mut points = Array3::<f32>::zeros((n, num_points, 3));
    let mut labels = Vec::with_capacity(n);
    for s in 0..n {
        let class = s % num_classes;
        labels.push(class);
        let mut cloud: Vec<[f32; 3]> = (0..num_points)
            .map(|_| {
                let p = sample_shape_point(class, rng);
                [
                    p[0] + jitter.sample(rng),
                    p[1] + jitter.sample(rng),
                    p[2] + jitter.sample(rng),
                ]
            })
            .collect();

        match domain {
            DatasetName::ModelNet => {}
            DatasetName::ShapeNet => {
                let sx = rng.random_range(0.8f32..1.2);
                let sy = rng.random_range(0.8f32..1.2);
                let sz = rng.random_range(0.8f32..1.2);
                let yaw = rng.random_range(-0.5f32..0.5);
                let (sin, cos) = yaw.sin_cos();
                for p in &mut cloud {
                    let (x, y) = (p[0] * sx, p[1] * sy);
                    *p = [cos * x - sin * y, sin * x + cos * y, p[2] * sz];
                }
            }
            DatasetName::ScanNet => {
                for p in &mut cloud {
                    for v in p.iter_mut() {
                        *v += scan_noise.sample(rng);
                    }
                }
                occlude(&mut cloud, rng);
            }
        }

        normalize_to_unit_ball(&mut cloud);
        for (i, p) in cloud.iter().enumerate() {
            for k in 0..3 {
                points[[s, i, k]] = p[k];
            }
        }
    }
    PointCloudSet::new(points, labels)
}

// Drop the points on one side of a random plane through the centroid, refill by duplicating
// survivors.
fn occlude(cloud: &mut [[f32; 3]], rng: &mut ChaCha8Rng) {
    let theta = rng.random_range(0.0f32..std::f32::consts::TAU);
    let normal = [theta.cos(), theta.sin(), 0.0];
    let offset = rng.random_range(0.2f32..0.6);
    let visible: Vec<[f32; 3]> = cloud
        .iter()
        .copied()
        .filter(|p| p[0] * normal[0] + p[1] * normal[1] < offset)
        .collect();
    if visible.is_empty() {
        return;
    }
    for p in cloud.iter_mut() {
        if p[0] * normal[0] + p[1] * normal[1] >= offset {
            *p = visible[rng.random_range(0..visible.len())];
        }
    }
}

fn normalize_to_unit_ball(cloud: &mut [[f32; 3]]) {
    let n = cloud.len() as f32;
    let mut c = [0.0f32; 3];
    for p in cloud.iter() {
        for k in 0..3 {
            c[k] += p[k] / n;
        }
    }
    let mut r = 0.0f32;
    for p in cloud.iter_mut() {
        for k in 0..3 {
            p[k] -= c[k];
        }
        r = r.max((p[0] * p[0] + p[1] * p[1] + p[2] * p[2]).sqrt());
    }
    if r > 0.0 {
        for p in cloud.iter_mut() {
            for v in p.iter_mut() {
                *v /= r;
            }
        }
    }
}

/// One surface point of the class's base shape. Classes beyond ten reuse the ten families
/// with a class-dependent stretch along z.
fn sample_shape_point(class: usize, rng: &mut ChaCha8Rng) -> [f32; 3] {
    use std::f32::consts::TAU;
    let family = class % 10;
    let stretch = 1.0 + 0.35 * (class / 10) as f32;
    let u: f32 = rng.random_range(0.0..1.0);
    let v: f32 = rng.random_range(0.0..1.0);
    let phi = TAU * u;
    let p = match family {
        // sphere
        0 => {
            let z = 2.0 * v - 1.0;
            let r = (1.0 - z * z).max(0.0).sqrt();
            [r * phi.cos(), r * phi.sin(), z]
        }
        // cube surface
        1 => {
            let face = rng.random_range(0..6usize);
            let a = 2.0 * u - 1.0;
            let b = 2.0 * v - 1.0;
            let s = if face % 2 == 0 { 1.0 } else { -1.0 };
            match face / 2 {
                0 => [s, a, b],
                1 => [a, s, b],
                _ => [a, b, s],
            }
        }
        // cylinder
        2 => [0.5 * phi.cos(), 0.5 * phi.sin(), 2.0 * v - 1.0],
        // cone
        3 => {
            let r = 0.8 * (1.0 - v);
            [r * phi.cos(), r * phi.sin(), 2.0 * v - 1.0]
        }
        // torus
        4 => {
            let psi = TAU * v;
            let r = 0.7 + 0.25 * psi.cos();
            [r * phi.cos(), r * phi.sin(), 0.25 * psi.sin()]
        }
        // flat square
        5 => [2.0 * u - 1.0, 2.0 * v - 1.0, 0.0],
        // three orthogonal rods
        6 => {
            let t = 2.0 * u - 1.0;
            let e = 0.05 * (2.0 * v - 1.0);
            match rng.random_range(0..3usize) {
                0 => [t, e, -e],
                1 => [e, t, e],
                _ => [-e, e, t],
            }
        }
        // cigar ellipsoid
        7 => {
            let z = 2.0 * v - 1.0;
            let r = (1.0 - z * z).max(0.0).sqrt();
            [0.3 * r * phi.cos(), 0.3 * r * phi.sin(), z]
        }
        // dumbbell
        8 => {
            let z = 2.0 * v - 1.0;
            let r = (1.0 - z * z).max(0.0).sqrt();
            let side = if rng.random_bool(0.5) { 0.6 } else { -0.6 };
            [0.4 * r * phi.cos() + side, 0.4 * r * phi.sin(), 0.4 * z]
        }
        // thin ring
        _ => [phi.cos(), phi.sin(), 0.05 * (2.0 * v - 1.0)],
    };
    [p[0], p[1], p[2] * stretch]
}
