//! Classification metrics and per-epoch loss bookkeeping.
//!
//! These helpers are small and explicit: accuracy is plain accuracy over samples, balanced
//! accuracy is the mean recall over classes that actually occur, and the ledger averages a loss
//! by the number of samples of the domain it was computed on (not by the number of batches).

use std::collections::BTreeMap;
use std::fmt;

use ndarray::Array2;

use crate::{Error, Result};

/// `num_classes × num_classes`, rows = true label, cols = prediction.
pub fn confusion_matrix(truth: &[usize], pred: &[usize], num_classes: usize) -> Result<Array2<usize>> {
    if truth.len() != pred.len() {
        return Err(Error::Shape("truth and pred must have the same length"));
    }
    let mut m = Array2::<usize>::zeros((num_classes, num_classes));
    for (&t, &p) in truth.iter().zip(pred) {
        if t >= num_classes || p >= num_classes {
            return Err(Error::Data(format!(
                "label pair ({t}, {p}) out of range for {num_classes} classes"
            )));
        }
        m[[t, p]] += 1;
    }
    Ok(m)
}

/// Fraction of samples on the diagonal; 0 for an empty matrix.
pub fn accuracy(confusion: &Array2<usize>) -> f32 {
    let total: usize = confusion.sum();
    if total == 0 {
        return 0.0;
    }
    let hit: usize = confusion.diag().sum();
    hit as f32 / total as f32
}

/// Mean per-class recall over classes with at least one true sample.
pub fn balanced_accuracy(confusion: &Array2<usize>) -> f32 {
    let mut sum = 0.0f32;
    let mut present = 0usize;
    for (c, row) in confusion.outer_iter().enumerate() {
        let support: usize = row.sum();
        if support > 0 {
            sum += row[c] as f32 / support as f32;
            present += 1;
        }
    }
    if present == 0 {
        0.0
    } else {
        sum / present as f32
    }
}

/// Index of the largest entry of each row (first on ties).
pub fn argmax_rows(logits: &Array2<f32>) -> Vec<usize> {
    logits
        .outer_iter()
        .map(|row| {
            let mut best = 0usize;
            for (j, &v) in row.iter().enumerate() {
                if v > row[best] {
                    best = j;
                }
            }
            best
        })
        .collect()
}

/// Which samples a loss component is averaged over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LossDomain {
    Source,
    Target,
    Alignment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LossComponent {
    SourceTotal,
    SourceCls,
    SourceMixup,
    SourceDefRec,
    TargetDefRec,
    AlignmentTotal,
    AlignmentCat,
    AlignmentAlign,
}

impl LossComponent {
    pub fn domain(self) -> LossDomain {
        match self {
            LossComponent::SourceTotal
            | LossComponent::SourceCls
            | LossComponent::SourceMixup
            | LossComponent::SourceDefRec => LossDomain::Source,
            LossComponent::TargetDefRec => LossDomain::Target,
            LossComponent::AlignmentTotal
            | LossComponent::AlignmentCat
            | LossComponent::AlignmentAlign => LossDomain::Alignment,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LossComponent::SourceTotal => "source/total",
            LossComponent::SourceCls => "source/cls",
            LossComponent::SourceMixup => "source/mixup",
            LossComponent::SourceDefRec => "source/defrec",
            LossComponent::TargetDefRec => "target/defrec",
            LossComponent::AlignmentTotal => "alignment/total",
            LossComponent::AlignmentCat => "alignment/cat",
            LossComponent::AlignmentAlign => "alignment/align",
        }
    }
}

impl fmt::Display for LossComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Running `loss * batch_size` sums for one epoch.
#[derive(Debug, Clone, Default)]
pub struct LossLedger {
    sums: BTreeMap<LossComponent, f64>,
    counts: BTreeMap<LossDomain, usize>,
}

impl LossLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one batch-mean loss value.
    pub fn record(&mut self, component: LossComponent, value: f32, batch_size: usize) {
        *self.sums.entry(component).or_insert(0.0) += value as f64 * batch_size as f64;
    }

    /// Count samples seen by a domain once per batch.
    pub fn count(&mut self, domain: LossDomain, batch_size: usize) {
        *self.counts.entry(domain).or_insert(0) += batch_size;
    }

    pub fn samples(&self, domain: LossDomain) -> usize {
        self.counts.get(&domain).copied().unwrap_or(0)
    }

    /// Per-sample means; components whose domain saw no samples are left out.
    pub fn means(&self) -> BTreeMap<LossComponent, f32> {
        self.sums
            .iter()
            .filter_map(|(&c, &s)| {
                let n = self.samples(c.domain());
                (n > 0).then(|| (c, (s / n as f64) as f32))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn confusion_and_accuracies() {
        let truth = [0, 0, 0, 1, 2, 2];
        let pred = [0, 0, 1, 1, 2, 0];
        let m = confusion_matrix(&truth, &pred, 4).unwrap();
        assert_eq!(m[[0, 0]], 2);
        assert_eq!(m[[0, 1]], 1);
        assert_eq!(m[[2, 0]], 1);
        assert_eq!(m.row(3).sum(), 0);
        assert!((accuracy(&m) - 4.0 / 6.0).abs() < 1e-6);
        // (2/3 + 1 + 1/2) / 3, class 3 absent.
        assert!((balanced_accuracy(&m) - (2.0 / 3.0 + 1.0 + 0.5) / 3.0).abs() < 1e-6);
    }

    #[test]
    fn confusion_rejects_out_of_range() {
        assert!(matches!(
            confusion_matrix(&[0, 3], &[0, 0], 3),
            Err(Error::Data(_))
        ));
        assert!(confusion_matrix(&[0], &[0, 1], 3).is_err());
    }

    #[test]
    fn argmax_takes_first_tie() {
        let l = ndarray::array![[0.1f32, 0.9, 0.9], [2.0, -1.0, 0.0]];
        assert_eq!(argmax_rows(&l), vec![1, 0]);
    }

    #[test]
    fn ledger_normalises_by_domain_samples() {
        let mut l = LossLedger::new();
        l.record(LossComponent::SourceCls, 2.0, 4);
        l.count(LossDomain::Source, 4);
        l.record(LossComponent::SourceCls, 1.0, 4);
        l.count(LossDomain::Source, 4);
        l.record(LossComponent::TargetDefRec, 3.0, 4);
        let means = l.means();
        assert!((means[&LossComponent::SourceCls] - 1.5).abs() < 1e-6);
        // No target samples counted, so no target mean.
        assert!(!means.contains_key(&LossComponent::TargetDefRec));
    }

    proptest! {
        #[test]
        fn prop_accuracy_bounds(
            pairs in proptest::collection::vec((0usize..5, 0usize..5), 1..64)
        ) {
            let truth: Vec<usize> = pairs.iter().map(|p| p.0).collect();
            let pred: Vec<usize> = pairs.iter().map(|p| p.1).collect();
            let m = confusion_matrix(&truth, &pred, 5).unwrap();
            prop_assert_eq!(m.sum(), pairs.len());
            let acc = accuracy(&m);
            let bal = balanced_accuracy(&m);
            prop_assert!((0.0..=1.0).contains(&acc));
            prop_assert!((0.0..=1.0 + 1e-6).contains(&bal));
        }
    }
}
