//! Small end-to-end runs on synthetic domains. Every run in this binary seeds with 1 because the
//! global seed can only be set once per process.

use burn_core::module::AutodiffModule;
use burn_core::tensor::backend::{AutodiffBackend, Backend};
use burn_optim::AdamConfig;

use pointda::config::{
    DatasetName, LossSwitches, ModelConfig, OptimizerKind, SyntheticConfig, TrainConfig,
};
use pointda::data::DomainSplits;
use pointda::eval::Evaluator;
use pointda::metrics::LossComponent;
use pointda::model::PointNetClassifier;
use pointda::perturb::{PointCloudMixup, RegionDeformation};
use pointda::seed::{seeded_rng, SeedStream};
use pointda::trainer::{train_domain_adaptation, EpochTrainer};
use pointda::transport::TransportMethod;
use pointda::BurnBackend;

type Model = PointNetClassifier<BurnBackend>;
type Inner = <BurnBackend as AutodiffBackend>::InnerBackend;

fn tiny_config() -> TrainConfig {
    TrainConfig {
        epochs: 3,
        batch_size: 4,
        test_batch_size: 8,
        num_classes: 3,
        val_fraction: 0.25,
        model: ModelConfig {
            point_dims: vec![8, 16],
            embedding_dim: 8,
            decoder_dims: vec![16],
            dropout: 0.0,
            sigmoid_embedding: true,
        },
        synthetic: SyntheticConfig {
            train_per_class: 4,
            test_per_class: 2,
            num_points: 24,
        },
        num_regions: 2,
        seed: 1,
        ..TrainConfig::default()
    }
}

fn splits(cfg: &TrainConfig) -> DomainSplits {
    DomainSplits::synthetic(
        DatasetName::ModelNet,
        DatasetName::ScanNet,
        cfg.num_classes,
        &cfg.synthetic,
        cfg.val_fraction,
        seeded_rng(cfg.seed, SeedStream::Data),
    )
    .unwrap()
}

#[test]
fn best_source_accuracy_is_the_running_max() {
    let cfg = tiny_config();
    let splits = splits(&cfg);
    let device = <BurnBackend as Backend>::Device::default();
    let out = train_domain_adaptation::<BurnBackend>(&cfg, &splits, &device).unwrap();

    let history = &out.fit.history;
    assert_eq!(history.len(), cfg.epochs);
    assert!(history[0].improved);
    let mut running = f32::NEG_INFINITY;
    for (e, r) in history.iter().enumerate() {
        assert_eq!(r.epoch, e);
        running = running.max(r.source_val.accuracy);
        assert_eq!(r.best_source_accuracy, running);
        assert_eq!(r.source_val.count, splits.source_val.len());
        assert_eq!(r.target_val.count, splits.target_val.len());
    }
    // The kept epoch is the first one that reached the maximum.
    let best = &out.fit.best;
    let first_max = history
        .iter()
        .position(|r| r.source_val.accuracy == running)
        .unwrap();
    assert_eq!(best.epoch, first_max);
    assert_eq!(best.target_val_confusion, history[first_max].target_val.confusion);

    assert_eq!(out.target_test.count, splits.target_test.len());
    assert_eq!(out.target_test.confusion.sum(), splits.target_test.len());

    // Re-evaluating the kept snapshot reproduces the recorded numbers.
    let again = Evaluator::new(cfg.eval_head(), cfg.num_classes, cfg.test_batch_size)
        .evaluate::<Inner, _>(
            &out.fit.best_model,
            &splits.source_val,
            &device,
        )
        .unwrap();
    assert_eq!(again.accuracy, best.source_val_accuracy);
    assert!((again.loss - best.source_val_loss).abs() < 1e-4);
}

#[test]
fn sgd_with_entropic_transport_runs() {
    let mut cfg = tiny_config();
    cfg.epochs = 1;
    cfg.optimizer.kind = OptimizerKind::Sgd;
    cfg.optimizer.lr = 1e-3;
    cfg.transport = TransportMethod::Entropic {
        reg: 0.5,
        max_iter: 2_000,
        tol: 1e-6,
    };
    let splits = splits(&cfg);
    let device = <BurnBackend as Backend>::Device::default();
    let out = train_domain_adaptation::<BurnBackend>(&cfg, &splits, &device).unwrap();
    let losses = &out.fit.history[0].losses;
    assert!(losses[&LossComponent::AlignmentTotal].is_finite());
}

fn switches_from_bits(bits: u8) -> LossSwitches {
    LossSwitches {
        defrec_on_source: bits & 1 != 0,
        supervised: bits & 2 != 0,
        mixup: bits & 4 != 0,
        defrec_on_target: bits & 8 != 0,
        alignment: bits & 16 != 0,
        alignment_head: bits & 32 != 0,
        alignment_classifier: bits & 64 != 0,
    }
}

#[test]
fn every_legal_switch_combination_trains_one_epoch() {
    let base = tiny_config();
    let splits = splits(&base);
    let device = <BurnBackend as Backend>::Device::default();
    let mut legal = 0;
    for bits in 0u8..128 {
        let mut cfg = base.clone();
        cfg.switches = switches_from_bits(bits);
        if cfg.validate().is_err() {
            continue;
        }
        legal += 1;
        let model =
            Model::new(&device, &cfg.model, cfg.num_classes, cfg.switches.alignment_head).unwrap();
        let optim = AdamConfig::new().init::<BurnBackend, Model>();
        let defrec = RegionDeformation::new(
            cfg.distortion,
            cfg.num_regions,
            cfg.defrec_weight,
            seeded_rng(cfg.seed, SeedStream::Deformation),
        )
        .unwrap();
        let mixup =
            PointCloudMixup::new(cfg.mixup_param, seeded_rng(cfg.seed, SeedStream::Mixup)).unwrap();
        let s = cfg.switches;
        let mut trainer =
            EpochTrainer::new(cfg, model, optim, defrec, mixup, device.clone()).unwrap();
        let losses = trainer
            .train_epoch(&splits.source_train, &splits.target_train)
            .unwrap_or_else(|e| panic!("switches {bits:#09b}: {e}"));
        assert!(losses.batches > 0);
        assert_eq!(
            losses.means.contains_key(&LossComponent::AlignmentTotal),
            s.alignment,
            "switches {bits:#09b}"
        );
        assert_eq!(
            losses.means.contains_key(&LossComponent::TargetDefRec),
            s.defrec_on_target
        );
        for v in losses.means.values() {
            assert!(v.is_finite());
        }
        // The snapshot is usable for inference after a step.
        let _ = trainer.model().valid();
    }
    assert!(legal > 0);
}
