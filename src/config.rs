//! Training configuration.
//!
//! [`TrainConfig`] carries every hyper-parameter of a run. It round-trips through JSON and is
//! checked once by [`TrainConfig::validate`] before anything is built; illegal switch
//! combinations never reach the trainer.
//!
//! Defaults reproduce the reference DefRec + PCM + DeepJDOT setup (Adam, lr `2e-4`, weight decay
//! `5e-5`, cosine annealing over 150 epochs, batch 32, `alpha = 1e-3`, `tloss = 1e-4`).

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::cost::LabelCost;
use crate::model::Head;
use crate::transport::TransportMethod;
use crate::{Error, Result};

/// Point-cloud benchmark a domain is drawn from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DatasetName {
    ModelNet,
    ShapeNet,
    ScanNet,
}

impl DatasetName {
    pub fn as_str(&self) -> &'static str {
        match self {
            DatasetName::ModelNet => "modelnet",
            DatasetName::ShapeNet => "shapenet",
            DatasetName::ScanNet => "scannet",
        }
    }
}

impl fmt::Display for DatasetName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DatasetName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "modelnet" => Ok(DatasetName::ModelNet),
            "shapenet" => Ok(DatasetName::ShapeNet),
            "scannet" => Ok(DatasetName::ScanNet),
            other => Err(Error::Config(format!(
                "unknown dataset '{other}' (expected modelnet, shapenet or scannet)"
            ))),
        }
    }
}

impl TryFrom<String> for DatasetName {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<DatasetName> for String {
    fn from(d: DatasetName) -> Self {
        d.as_str().to_string()
    }
}

/// Encoder architecture. Only the built-in PointNet classifier ships with the crate; other
/// names are rejected when the configuration is parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Architecture {
    PointNet,
}

impl FromStr for Architecture {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pointnet" => Ok(Architecture::PointNet),
            other => Err(Error::Config(format!(
                "architecture '{other}' is not available (supported: pointnet)"
            ))),
        }
    }
}

impl TryFrom<String> for Architecture {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<Architecture> for String {
    fn from(a: Architecture) -> Self {
        match a {
            Architecture::PointNet => "pointnet".to_string(),
        }
    }
}

/// How DefRec picks the deformed region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistortionMode {
    /// Resample the points of one voxel region around its centre.
    #[default]
    VolumeBasedVoxels,
    /// Collapse a ball around a random point onto that point.
    VolumeBasedRadius,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerKind {
    #[default]
    Adam,
    Sgd,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OptimizerConfig {
    pub kind: OptimizerKind,
    pub lr: f64,
    /// SGD only.
    pub momentum: f64,
    pub weight_decay: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            kind: OptimizerKind::Adam,
            lr: 2e-4,
            momentum: 0.9,
            weight_decay: 5e-5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LrSchedule {
    Constant,
    /// Cosine annealing from `lr` to `eta_min` over `epochs`, stepped once per epoch.
    #[default]
    Cosine,
}

/// Which loss terms run. Each flag is independent; [`TrainConfig::validate`] rejects the
/// combinations that make no sense.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LossSwitches {
    pub defrec_on_source: bool,
    pub supervised: bool,
    /// PCM in place of plain cross-entropy for the supervised term.
    pub mixup: bool,
    pub defrec_on_target: bool,
    /// DeepJDOT alignment step.
    pub alignment: bool,
    /// Use the separate alignment head for the transport objective.
    pub alignment_head: bool,
    /// Use the alignment head for evaluation too.
    pub alignment_classifier: bool,
}

impl Default for LossSwitches {
    fn default() -> Self {
        Self {
            defrec_on_source: false,
            supervised: true,
            mixup: true,
            defrec_on_target: true,
            alignment: true,
            alignment_head: false,
            alignment_classifier: false,
        }
    }
}

impl LossSwitches {
    pub fn any_active(&self) -> bool {
        self.defrec_on_source || self.supervised || self.defrec_on_target || self.alignment
    }
}

/// DeepJDOT weights.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct JdotWeights {
    /// Embedding-distance weight, in the cost and in the alignment loss.
    pub alpha: f32,
    /// Source cross-entropy weight inside the categorical loss.
    pub source_weight: f32,
    /// Target transport-loss weight; also the label-cost weight of `C`.
    pub target_weight: f32,
    pub train_cl_weight: f32,
    pub train_align_weight: f32,
}

impl Default for JdotWeights {
    fn default() -> Self {
        Self {
            alpha: 0.001,
            source_weight: 1.0,
            target_weight: 0.0001,
            train_cl_weight: 1.0,
            train_align_weight: 1.0,
        }
    }
}

/// Built-in PointNet classifier shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Widths of the shared per-point MLP.
    pub point_dims: Vec<usize>,
    pub embedding_dim: usize,
    /// Hidden widths of the reconstruction decoder.
    pub decoder_dims: Vec<usize>,
    pub dropout: f64,
    /// Squash the embedding with a sigmoid (ReLU otherwise).
    pub sigmoid_embedding: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            point_dims: vec![64, 128, 256],
            embedding_dim: 128,
            decoder_dims: vec![128, 64],
            dropout: 0.5,
            sigmoid_embedding: true,
        }
    }
}

/// Size of the generated synthetic domains.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SyntheticConfig {
    pub train_per_class: usize,
    pub test_per_class: usize,
    pub num_points: usize,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            train_per_class: 64,
            test_per_class: 16,
            num_points: 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub experiment_name: String,
    pub source: DatasetName,
    pub target: DatasetName,
    pub architecture: Architecture,
    pub epochs: usize,
    /// Per-domain training batch size.
    pub batch_size: usize,
    pub test_batch_size: usize,
    pub optimizer: OptimizerConfig,
    pub lr_schedule: LrSchedule,
    pub switches: LossSwitches,
    pub jdot: JdotWeights,
    pub defrec_weight: f32,
    /// Beta distribution parameter for PCM.
    pub mixup_param: f64,
    pub distortion: DistortionMode,
    /// Regions per axis for DefRec; the lookup holds `num_regions^3` centres.
    pub num_regions: usize,
    /// Class-balanced source batches.
    pub balance_source: bool,
    pub val_fraction: f32,
    pub num_classes: usize,
    pub transport: TransportMethod,
    pub label_cost: LabelCost,
    pub seed: u64,
    pub model: ModelConfig,
    pub synthetic: SyntheticConfig,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            experiment_name: "DefRec_PCM".to_string(),
            source: DatasetName::ShapeNet,
            target: DatasetName::ScanNet,
            architecture: Architecture::PointNet,
            epochs: 150,
            batch_size: 32,
            test_batch_size: 32,
            optimizer: OptimizerConfig::default(),
            lr_schedule: LrSchedule::Cosine,
            switches: LossSwitches::default(),
            jdot: JdotWeights::default(),
            defrec_weight: 0.5,
            mixup_param: 1.0,
            distortion: DistortionMode::VolumeBasedVoxels,
            num_regions: 3,
            balance_source: false,
            val_fraction: 0.1,
            num_classes: 10,
            transport: TransportMethod::Exact,
            label_cost: LabelCost::SquaredEuclidean,
            seed: 1,
            model: ModelConfig::default(),
            synthetic: SyntheticConfig::default(),
        }
    }
}

impl TrainConfig {
    /// Load and validate.
    pub fn from_json(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|source| Error::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let cfg: TrainConfig = serde_json::from_str(&contents)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Pretty-printed JSON, parent directories created as needed.
    pub fn to_json(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|source| Error::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).map_err(|source| Error::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Head whose logits feed the cost and the categorical transport loss.
    pub fn transport_head(&self) -> Head {
        if self.switches.alignment_head {
            Head::Alignment
        } else {
            Head::Classification
        }
    }

    /// Head used for evaluation and model selection.
    pub fn eval_head(&self) -> Head {
        let s = &self.switches;
        if s.alignment && s.alignment_head && s.alignment_classifier {
            Head::Alignment
        } else {
            Head::Classification
        }
    }

    /// Check every field and every switch combination; the first problem wins.
    pub fn validate(&self) -> Result<()> {
        fn invalid(field: &str, reason: impl fmt::Display) -> Result<()> {
            Err(Error::Config(format!("{field}: {reason}")))
        }

        if self.epochs == 0 {
            return invalid("epochs", "must be > 0");
        }
        if self.batch_size == 0 {
            return invalid("batch_size", "must be > 0");
        }
        if self.test_batch_size == 0 {
            return invalid("test_batch_size", "must be > 0");
        }
        if self.num_classes < 2 {
            return invalid("num_classes", "must be >= 2");
        }
        if self.num_regions == 0 {
            return invalid("num_regions", "must be > 0");
        }
        if !(self.optimizer.lr > 0.0) || !self.optimizer.lr.is_finite() {
            return invalid("optimizer.lr", "must be positive and finite");
        }
        if !(0.0..1.0).contains(&self.optimizer.momentum) {
            return invalid("optimizer.momentum", "must be in [0, 1)");
        }
        if !(self.optimizer.weight_decay >= 0.0) || !self.optimizer.weight_decay.is_finite() {
            return invalid("optimizer.weight_decay", "must be nonnegative and finite");
        }
        if !(0.0..=1.0).contains(&self.defrec_weight) {
            return invalid("defrec_weight", "must be in [0, 1]");
        }
        if !(self.mixup_param > 0.0) || !self.mixup_param.is_finite() {
            return invalid("mixup_param", "must be positive and finite");
        }
        if !(self.val_fraction > 0.0 && self.val_fraction < 1.0) {
            return invalid("val_fraction", "must be in (0, 1)");
        }
        let j = &self.jdot;
        for (name, w) in [
            ("jdot.alpha", j.alpha),
            ("jdot.source_weight", j.source_weight),
            ("jdot.target_weight", j.target_weight),
            ("jdot.train_cl_weight", j.train_cl_weight),
            ("jdot.train_align_weight", j.train_align_weight),
        ] {
            if !w.is_finite() || w < 0.0 {
                return invalid(name, "must be nonnegative and finite");
            }
        }
        if let TransportMethod::Entropic { reg, max_iter, tol } = self.transport {
            if !(reg > 0.0) || !reg.is_finite() {
                return invalid("transport.reg", "must be positive and finite");
            }
            if max_iter == 0 {
                return invalid("transport.max_iter", "must be > 0");
            }
            if !(tol > 0.0) || !tol.is_finite() {
                return invalid("transport.tol", "must be positive and finite");
            }
        }
        let m = &self.model;
        if m.point_dims.is_empty() || m.point_dims.contains(&0) {
            return invalid("model.point_dims", "must be non-empty with positive widths");
        }
        if m.embedding_dim == 0 {
            return invalid("model.embedding_dim", "must be > 0");
        }
        if m.decoder_dims.contains(&0) {
            return invalid("model.decoder_dims", "widths must be positive");
        }
        if !(0.0..1.0).contains(&m.dropout) {
            return invalid("model.dropout", "must be in [0, 1)");
        }
        let syn = &self.synthetic;
        if syn.num_points == 0 || syn.train_per_class == 0 || syn.test_per_class == 0 {
            return invalid("synthetic", "sizes must be > 0");
        }

        let s = &self.switches;
        if !s.any_active() {
            return invalid("switches", "at least one loss term must be enabled");
        }
        if s.mixup && !s.supervised {
            return invalid("switches.mixup", "requires switches.supervised");
        }
        if s.alignment_classifier && !(s.alignment && s.alignment_head) {
            return invalid(
                "switches.alignment_classifier",
                "requires switches.alignment and switches.alignment_head",
            );
        }
        if self.balance_source && self.batch_size % self.num_classes != 0 {
            return invalid(
                "balance_source",
                format!(
                    "batch_size {} must be a multiple of num_classes {}",
                    self.batch_size, self.num_classes
                ),
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let cfg = TrainConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.num_classes, 10);
        assert_eq!(cfg.eval_head(), Head::Classification);
        assert_eq!(cfg.transport_head(), Head::Classification);
    }

    #[test]
    fn mixup_requires_supervised() {
        let mut cfg = TrainConfig::default();
        cfg.switches.supervised = false;
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));
        cfg.switches.mixup = false;
        cfg.validate().unwrap();
    }

    #[test]
    fn alignment_classifier_requires_head_and_alignment() {
        let mut cfg = TrainConfig::default();
        cfg.switches.alignment_classifier = true;
        assert!(cfg.validate().is_err());
        cfg.switches.alignment_head = true;
        cfg.validate().unwrap();
        assert_eq!(cfg.eval_head(), Head::Alignment);
        assert_eq!(cfg.transport_head(), Head::Alignment);
        cfg.switches.alignment = false;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn no_active_loss_is_rejected() {
        let mut cfg = TrainConfig::default();
        cfg.switches = LossSwitches {
            defrec_on_source: false,
            supervised: false,
            mixup: false,
            defrec_on_target: false,
            alignment: false,
            alignment_head: false,
            alignment_classifier: false,
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn balanced_batches_need_divisible_batch_size() {
        let mut cfg = TrainConfig::default();
        cfg.balance_source = true;
        assert!(cfg.validate().is_err());
        cfg.batch_size = 30;
        cfg.validate().unwrap();
    }

    #[test]
    fn unknown_names_are_config_errors() {
        assert!(matches!("dgcnn".parse::<Architecture>(), Err(Error::Config(_))));
        assert!(matches!("kitti".parse::<DatasetName>(), Err(Error::Config(_))));
        assert_eq!("ScanNet".parse::<DatasetName>().unwrap(), DatasetName::ScanNet);
    }

    #[test]
    fn json_rejects_unknown_architecture() {
        let json = r#"{ "architecture": "dgcnn" }"#;
        assert!(serde_json::from_str::<TrainConfig>(json).is_err());
    }

    #[test]
    fn json_round_trip_preserves_everything() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("cfg.json");
        let mut cfg = TrainConfig::default();
        cfg.transport = TransportMethod::Entropic {
            reg: 0.05,
            max_iter: 500,
            tol: 1e-4,
        };
        cfg.optimizer.kind = OptimizerKind::Sgd;
        cfg.source = DatasetName::ModelNet;
        cfg.to_json(&path).unwrap();
        let back = TrainConfig::from_json(&path).unwrap();
        assert_eq!(back, cfg);
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let cfg: TrainConfig = serde_json::from_str(r#"{ "epochs": 3, "seed": 7 }"#).unwrap();
        assert_eq!(cfg.epochs, 3);
        assert_eq!(cfg.seed, 7);
        assert_eq!(cfg.batch_size, 32);
    }
}
