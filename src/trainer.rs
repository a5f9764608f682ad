//! Per-batch and per-epoch orchestration.
//!
//! One batch is a synchronized pair (source batch, target batch). Every enabled loss term runs
//! its own `backward()`; the gradients are folded into one `GradientsAccumulator` and the
//! optimizer steps once:
//!
//! 1. source: DefRec reconstruction, then the supervised term (PCM or plain cross-entropy),
//! 2. target: DefRec reconstruction,
//! 3. alignment: coupling from the frozen `valid()` snapshot, then a fresh autodiff forward of
//!    both batches into `L_cat + L_align`,
//! 4. one optimizer step.
//!
//! The learning rate follows the schedule once per epoch. After each epoch both validation
//! splits are evaluated and the snapshot with the strictly best source accuracy is kept.

use std::collections::BTreeMap;
use std::marker::PhantomData;

use burn_core as burn;

use burn::module::AutodiffModule;
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::Tensor;
use burn_optim::decay::WeightDecayConfig;
use burn_optim::momentum::MomentumConfig;
use burn_optim::{
    AdamConfig, GradientsAccumulator, GradientsParams, LearningRate, Optimizer, SgdConfig,
};
use ndarray::Array2;
use rand_chacha::ChaCha8Rng;
use tracing::{debug, info, warn};

use crate::config::{OptimizerKind, TrainConfig};
use crate::convert::{array2_to_tensor, array3_to_tensor, scalar, tensor_to_array2};
use crate::cost::CostMatrixBuilder;
use crate::data::{Batch, DomainLoader, DomainSplits, PointCloudSet, Sampling};
use crate::eval::{EvalReport, Evaluator};
use crate::loss::{alignment_loss, categorical_transport_loss, cross_entropy};
use crate::metrics::{LossComponent, LossDomain, LossLedger};
use crate::model::{PointCloudModel, PointNetClassifier};
use crate::perturb::{MixupTask, PointCloudMixup, RegionDeformation, SelfSupervisedTask};
use crate::schedule::LrScheduler;
use crate::seed::{component_rng, init_global_seed, SeedStream};
use crate::transport::{Coupling, TransportSolver};
use crate::{Error, Result};

/// Couplings whose marginals drift further than this are logged.
const MARGINAL_WARN_TOLERANCE: f32 = 1e-3;

/// Mean losses of one epoch.
#[derive(Debug, Clone)]
pub struct EpochLosses {
    pub lr: LearningRate,
    pub batches: usize,
    pub means: BTreeMap<LossComponent, f32>,
}

#[derive(Debug, Clone)]
pub struct EpochReport {
    pub epoch: usize,
    pub lr: LearningRate,
    pub losses: BTreeMap<LossComponent, f32>,
    pub source_val: EvalReport,
    pub target_val: EvalReport,
    /// Best source validation accuracy up to and including this epoch.
    pub best_source_accuracy: f32,
    pub improved: bool,
}

/// What model selection remembers about the chosen epoch.
#[derive(Debug, Clone)]
pub struct BestRecord {
    pub epoch: usize,
    pub source_val_accuracy: f32,
    pub source_val_loss: f32,
    pub target_val_accuracy: f32,
    pub target_val_loss: f32,
    pub target_val_confusion: Array2<usize>,
}

/// Keeps the snapshot of the epoch with the strictly highest source validation accuracy.
/// Target numbers are recorded alongside but never compared.
#[derive(Debug, Clone)]
pub struct BestModelTracker<T> {
    best: Option<(BestRecord, T)>,
}

impl<T> Default for BestModelTracker<T> {
    fn default() -> Self {
        Self { best: None }
    }
}

impl<T> BestModelTracker<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` when this epoch became the new best.
    pub fn observe(
        &mut self,
        epoch: usize,
        source_val: &EvalReport,
        target_val: &EvalReport,
        snapshot: T,
    ) -> bool {
        let improved = match &self.best {
            None => true,
            Some((record, _)) => source_val.accuracy > record.source_val_accuracy,
        };
        if improved {
            self.best = Some((
                BestRecord {
                    epoch,
                    source_val_accuracy: source_val.accuracy,
                    source_val_loss: source_val.loss,
                    target_val_accuracy: target_val.accuracy,
                    target_val_loss: target_val.loss,
                    target_val_confusion: target_val.confusion.clone(),
                },
                snapshot,
            ));
        }
        improved
    }

    pub fn best_record(&self) -> Option<&BestRecord> {
        self.best.as_ref().map(|(r, _)| r)
    }

    pub fn into_best(self) -> Option<(BestRecord, T)> {
        self.best
    }
}

/// Result of [`EpochTrainer::fit`]. Snapshots are non-autodiff modules.
#[derive(Debug, Clone)]
pub struct FitReport<T> {
    pub history: Vec<EpochReport>,
    pub best: BestRecord,
    pub best_model: T,
    pub final_model: T,
}

pub struct EpochTrainer<B, M, O, S, X>
where
    B: AutodiffBackend,
    M: PointCloudModel<B> + AutodiffModule<B>,
    O: Optimizer<M, B>,
    S: SelfSupervisedTask,
    X: MixupTask,
{
    config: TrainConfig,
    model: M,
    optim: O,
    defrec: S,
    mixup: X,
    cost: CostMatrixBuilder,
    solver: TransportSolver,
    scheduler: LrScheduler,
    evaluator: Evaluator,
    loader_rng: ChaCha8Rng,
    device: B::Device,
    epoch: usize,
    _backend: PhantomData<B>,
}

impl<B, M, O, S, X> EpochTrainer<B, M, O, S, X>
where
    B: AutodiffBackend,
    M: PointCloudModel<B> + AutodiffModule<B>,
    M::InnerModule: PointCloudModel<B::InnerBackend>,
    O: Optimizer<M, B>,
    S: SelfSupervisedTask,
    X: MixupTask,
{
    /// Validate the configuration against itself and against the model, and join the
    /// process-wide seed (a different seed already in place is a configuration error).
    pub fn new(
        config: TrainConfig,
        model: M,
        optim: O,
        defrec: S,
        mixup: X,
        device: B::Device,
    ) -> Result<Self> {
        config.validate()?;
        if model.num_classes() != config.num_classes {
            return Err(Error::Config(format!(
                "model has {} classes, configuration says {}",
                model.num_classes(),
                config.num_classes
            )));
        }
        if config.switches.alignment_head && !model.has_alignment_head() {
            return Err(Error::Config(
                "switches.alignment_head is set but the model has no alignment head".to_string(),
            ));
        }

        let cost = CostMatrixBuilder::new(
            config.jdot.alpha,
            config.jdot.target_weight,
            config.label_cost,
            config.num_classes,
        );
        let scheduler =
            LrScheduler::from_config(config.lr_schedule, config.optimizer.lr, config.epochs);
        let evaluator = Evaluator::new(config.eval_head(), config.num_classes, config.test_batch_size);
        init_global_seed::<B>(config.seed, &device)?;
        let loader_rng = component_rng(SeedStream::Loader)?;
        Ok(Self {
            solver: TransportSolver::new(config.transport),
            cost,
            scheduler,
            evaluator,
            loader_rng,
            config,
            model,
            optim,
            defrec,
            mixup,
            device,
            epoch: 0,
            _backend: PhantomData,
        })
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn into_model(self) -> M {
        self.model
    }

    /// Epochs completed so far.
    pub fn epochs_done(&self) -> usize {
        self.epoch
    }

    /// Exact (or entropic) coupling between the two batches, computed on the frozen snapshot.
    pub fn compute_coupling(&self, source: &Batch, target: &Batch) -> Result<Coupling> {
        let frozen = self.model.valid();
        let head = self.config.transport_head();
        let s = frozen.forward(array3_to_tensor::<B::InnerBackend>(
            &self.device,
            &source.points.view(),
        ));
        let t = frozen.forward(array3_to_tensor::<B::InnerBackend>(
            &self.device,
            &target.points.view(),
        ));
        let xs = tensor_to_array2(s.embedding)?;
        let xt = tensor_to_array2(t.embedding.clone())?;
        let pt = tensor_to_array2(t.head(head)?)?;

        let cost = self.cost.build(&xs.view(), &xt.view(), &source.labels, &pt.view())?;
        let gamma = self.solver.solve(&cost.total.view())?;

        let err = gamma.max_marginal_error();
        if err > MARGINAL_WARN_TOLERANCE {
            warn!(err, "coupling marginals drift from uniform");
        }
        debug!(
            transport_cost = gamma.transport_cost(&cost.total.view())?,
            "coupling computed"
        );
        Ok(gamma)
    }

    fn accumulate(&self, acc: &mut GradientsAccumulator<M>, loss: Tensor<B, 1>) {
        let grads = loss.backward();
        let grads = GradientsParams::from_grads(grads, &self.model);
        acc.accumulate(&self.model, grads);
    }

    /// One synchronized batch pair: every enabled term, one optimizer step.
    pub fn train_batch(
        &mut self,
        source: &Batch,
        target: &Batch,
        lr: LearningRate,
        ledger: &mut LossLedger,
    ) -> Result<()> {
        if source.is_empty() || target.is_empty() {
            return Err(Error::Data("empty batch".to_string()));
        }
        let switches = self.config.switches;
        let device = self.device.clone();
        let n_src = source.len();
        let n_trg = target.len();
        let mut acc = GradientsAccumulator::<M>::new();

        let src_points = array3_to_tensor::<B>(&device, &source.points.view());
        let trg_points = array3_to_tensor::<B>(&device, &target.points.view());

        if switches.defrec_on_source {
            let deformed = self.defrec.deform(&source.points.view())?;
            let recon = self
                .model
                .reconstruct(array3_to_tensor::<B>(&device, &deformed.points.view()));
            let mask = array2_to_tensor::<B>(&device, &deformed.mask.view());
            let loss = self.defrec.loss(recon, src_points.clone(), mask);
            let v = finite_value(loss.clone(), LossComponent::SourceDefRec)?;
            ledger.record(LossComponent::SourceDefRec, v, n_src);
            ledger.record(LossComponent::SourceTotal, v, n_src);
            self.accumulate(&mut acc, loss);
        }

        if switches.supervised {
            let (component, loss) = if switches.mixup {
                let mixed = self.mixup.mix(&source.points.view(), &source.labels)?;
                let logits = self
                    .model
                    .forward(array3_to_tensor::<B>(&device, &mixed.points.view()))
                    .classification;
                (LossComponent::SourceMixup, self.mixup.loss(logits, &mixed.targets)?)
            } else {
                let logits = self.model.forward(src_points.clone()).classification;
                let ce = cross_entropy(logits, &source.labels)?;
                (
                    LossComponent::SourceCls,
                    ce.mul_scalar(1.0 - self.config.defrec_weight),
                )
            };
            let v = finite_value(loss.clone(), component)?;
            ledger.record(component, v, n_src);
            ledger.record(LossComponent::SourceTotal, v, n_src);
            self.accumulate(&mut acc, loss);
        }
        ledger.count(LossDomain::Source, n_src);

        if switches.defrec_on_target {
            let deformed = self.defrec.deform(&target.points.view())?;
            let recon = self
                .model
                .reconstruct(array3_to_tensor::<B>(&device, &deformed.points.view()));
            let mask = array2_to_tensor::<B>(&device, &deformed.mask.view());
            let loss = self.defrec.loss(recon, trg_points.clone(), mask);
            let v = finite_value(loss.clone(), LossComponent::TargetDefRec)?;
            ledger.record(LossComponent::TargetDefRec, v, n_trg);
            self.accumulate(&mut acc, loss);
        }
        ledger.count(LossDomain::Target, n_trg);

        if switches.alignment {
            let gamma = self.compute_coupling(source, target)?;
            let gamma = array2_to_tensor::<B>(&device, &gamma.plan().view());
            let head = self.config.transport_head();
            let jdot = self.config.jdot;

            let s = self.model.forward(src_points);
            let t = self.model.forward(trg_points);
            let cat = categorical_transport_loss(
                s.head(head)?,
                t.head(head)?,
                &source.labels,
                gamma.clone(),
                &jdot,
            )?;
            let align = alignment_loss(
                s.embedding,
                t.embedding,
                gamma,
                jdot.alpha,
                jdot.train_align_weight,
            )?;
            let cat_v = finite_value(cat.clone(), LossComponent::AlignmentCat)?;
            let align_v = finite_value(align.clone(), LossComponent::AlignmentAlign)?;
            let total = cat + align;
            ledger.record(LossComponent::AlignmentCat, cat_v, n_src);
            ledger.record(LossComponent::AlignmentAlign, align_v, n_src);
            ledger.record(LossComponent::AlignmentTotal, cat_v + align_v, n_src);
            self.accumulate(&mut acc, total);
            ledger.count(LossDomain::Alignment, n_src);
        }

        let grads = acc.grads();
        self.model = self.optim.step(lr, self.model.clone(), grads);
        Ok(())
    }

    /// One pass over `zip(source, target)`; the shorter loader ends the epoch.
    pub fn train_epoch(
        &mut self,
        source: &PointCloudSet,
        target: &PointCloudSet,
    ) -> Result<EpochLosses> {
        let lr = self.scheduler.lr_at(self.epoch);
        let batch_size = self.config.batch_size;
        let sampling = if self.config.balance_source {
            Sampling::Balanced {
                num_classes: self.config.num_classes,
            }
        } else {
            Sampling::Random
        };
        let src_loader = DomainLoader::new(source, batch_size, sampling)?;
        let trg_loader = DomainLoader::new(target, batch_size, Sampling::Random)?;
        let src_batches = src_loader.epoch(&mut self.loader_rng);
        let trg_batches = trg_loader.epoch(&mut self.loader_rng);

        let mut ledger = LossLedger::new();
        let mut batches = 0usize;
        for (s, t) in src_batches.zip(trg_batches) {
            self.train_batch(&s, &t, lr, &mut ledger)?;
            batches += 1;
        }
        if batches == 0 {
            return Err(Error::Data(format!(
                "no full batch of {batch_size} in source ({}) or target ({})",
                source.len(),
                target.len()
            )));
        }
        self.epoch += 1;
        Ok(EpochLosses {
            lr,
            batches,
            means: ledger.means(),
        })
    }

    /// Train for `config.epochs`, evaluating and selecting after every epoch.
    pub fn fit(&mut self, splits: &DomainSplits) -> Result<FitReport<M::InnerModule>> {
        let mut tracker = BestModelTracker::new();
        let mut history = Vec::with_capacity(self.config.epochs);
        for _ in 0..self.config.epochs {
            let epoch = self.epoch;
            let losses = self.train_epoch(&splits.source_train, &splits.target_train)?;
            let snapshot = self.model.valid();
            let source_val = self.evaluator.evaluate::<B::InnerBackend, _>(
                &snapshot,
                &splits.source_val,
                &self.device,
            )?;
            let target_val = self.evaluator.evaluate::<B::InnerBackend, _>(
                &snapshot,
                &splits.target_val,
                &self.device,
            )?;
            let improved = tracker.observe(epoch, &source_val, &target_val, snapshot);
            let best_source_accuracy = tracker
                .best_record()
                .map(|r| r.source_val_accuracy)
                .unwrap_or(source_val.accuracy);

            info!(
                epoch,
                lr = losses.lr,
                batches = losses.batches,
                losses = ?losses.means,
                source_val_acc = source_val.accuracy,
                source_val_loss = source_val.loss,
                target_val_acc = target_val.accuracy,
                target_val_loss = target_val.loss,
                improved,
                "epoch done"
            );

            history.push(EpochReport {
                epoch,
                lr: losses.lr,
                losses: losses.means,
                source_val,
                target_val,
                best_source_accuracy,
                improved,
            });
        }

        let (best, best_model) = tracker
            .into_best()
            .ok_or_else(|| Error::Config("epochs must be > 0".to_string()))?;
        info!(
            epoch = best.epoch,
            source_val_acc = best.source_val_accuracy,
            source_val_loss = best.source_val_loss,
            target_val_acc = best.target_val_accuracy,
            target_val_loss = best.target_val_loss,
            "best model"
        );
        Ok(FitReport {
            history,
            best,
            best_model,
            final_model: self.model.valid(),
        })
    }
}

fn finite_value<B: Backend>(loss: Tensor<B, 1>, component: LossComponent) -> Result<f32> {
    let v = scalar(loss)?;
    if !v.is_finite() {
        return Err(Error::Numerical(format!("{component} loss is not finite ({v})")));
    }
    Ok(v)
}

/// Everything a full run produces.
#[derive(Debug, Clone)]
pub struct TrainingOutcome<B: AutodiffBackend> {
    pub fit: FitReport<PointNetClassifier<B::InnerBackend>>,
    /// The best snapshot on the held-out target test split.
    pub target_test: EvalReport,
}

/// Seed, build the built-in model and collaborators, train, select, and test.
pub fn train_domain_adaptation<B: AutodiffBackend>(
    config: &TrainConfig,
    splits: &DomainSplits,
    device: &B::Device,
) -> Result<TrainingOutcome<B>> {
    config.validate()?;
    init_global_seed::<B>(config.seed, device)?;

    let model = PointNetClassifier::<B>::new(
        device,
        &config.model,
        config.num_classes,
        config.switches.alignment_head,
    )?;
    let defrec = RegionDeformation::new(
        config.distortion,
        config.num_regions,
        config.defrec_weight,
        component_rng(SeedStream::Deformation)?,
    )?;
    let mixup = PointCloudMixup::new(config.mixup_param, component_rng(SeedStream::Mixup)?)?;

    let opt = config.optimizer;
    match opt.kind {
        OptimizerKind::Adam => {
            let optim = AdamConfig::new()
                .with_epsilon(1e-8)
                .with_weight_decay(Some(WeightDecayConfig::new(opt.weight_decay as f32)))
                .init::<B, PointNetClassifier<B>>();
            run(config, model, optim, defrec, mixup, splits, device)
        }
        OptimizerKind::Sgd => {
            let momentum = MomentumConfig::new()
                .with_momentum(opt.momentum)
                .with_dampening(0.0)
                .with_nesterov(false);
            let optim = SgdConfig::new()
                .with_momentum(Some(momentum))
                .with_weight_decay(Some(WeightDecayConfig::new(opt.weight_decay as f32)))
                .init::<B, PointNetClassifier<B>>();
            run(config, model, optim, defrec, mixup, splits, device)
        }
    }
}

fn run<B, O>(
    config: &TrainConfig,
    model: PointNetClassifier<B>,
    optim: O,
    defrec: RegionDeformation,
    mixup: PointCloudMixup,
    splits: &DomainSplits,
    device: &B::Device,
) -> Result<TrainingOutcome<B>>
where
    B: AutodiffBackend,
    O: Optimizer<PointNetClassifier<B>, B>,
{
    info!(
        experiment = %config.experiment_name,
        source = %config.source,
        target = %config.target,
        epochs = config.epochs,
        optimizer = ?config.optimizer.kind,
        "training"
    );
    let mut trainer = EpochTrainer::new(
        config.clone(),
        model,
        optim,
        defrec,
        mixup,
        device.clone(),
    )?;
    let fit = trainer.fit(splits)?;
    let target_test = Evaluator::new(config.eval_head(), config.num_classes, config.test_batch_size)
        .evaluate::<B::InnerBackend, _>(&fit.best_model, &splits.target_test, device)?;
    info!(
        accuracy = target_test.accuracy,
        loss = target_test.loss,
        "target test (best model)"
    );
    Ok(TrainingOutcome { fit, target_test })
}
