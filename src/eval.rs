//! Inference-mode evaluation of a model snapshot on one split.

use burn_core::tensor::backend::Backend;
use ndarray::Array2;

use crate::convert::{array3_to_tensor, scalar, tensor_to_array2};
use crate::data::PointCloudSet;
use crate::loss::cross_entropy;
use crate::metrics::{accuracy, argmax_rows, balanced_accuracy, confusion_matrix};
use crate::model::{Head, PointCloudModel};
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct EvalReport {
    /// Mean cross-entropy over samples.
    pub loss: f32,
    pub accuracy: f32,
    pub balanced_accuracy: f32,
    pub count: usize,
    /// Rows = true label, cols = prediction, over `0..num_classes`.
    pub confusion: Array2<usize>,
}

/// Walks a split in its stored order with a fixed batch size. Pass a non-autodiff snapshot
/// (`AutodiffModule::valid`) so dropout is off and no graph is recorded.
#[derive(Debug, Clone, Copy)]
pub struct Evaluator {
    pub head: Head,
    pub num_classes: usize,
    pub batch_size: usize,
}

impl Evaluator {
    pub fn new(head: Head, num_classes: usize, batch_size: usize) -> Self {
        Self {
            head,
            num_classes,
            batch_size,
        }
    }

    pub fn evaluate<B, M>(&self, model: &M, set: &PointCloudSet, device: &B::Device) -> Result<EvalReport>
    where
        B: Backend,
        M: PointCloudModel<B>,
    {
        if set.is_empty() {
            return Err(Error::Data("cannot evaluate an empty split".to_string()));
        }
        if self.batch_size == 0 {
            return Err(Error::Config("test_batch_size must be > 0".to_string()));
        }
        if model.num_classes() != self.num_classes {
            return Err(Error::Config(format!(
                "model has {} classes, evaluator expects {}",
                model.num_classes(),
                self.num_classes
            )));
        }

        let order: Vec<usize> = (0..set.len()).collect();
        let mut loss_sum = 0.0f64;
        let mut pred = Vec::with_capacity(set.len());
        for chunk in order.chunks(self.batch_size) {
            let batch = set.gather(chunk)?;
            let points = array3_to_tensor::<B>(device, &batch.points.view());
            let logits = model.forward(points).head(self.head)?;
            let ce = scalar(cross_entropy(logits.clone(), &batch.labels)?)?;
            loss_sum += ce as f64 * batch.len() as f64;
            pred.extend(argmax_rows(&tensor_to_array2(logits)?));
        }

        let confusion = confusion_matrix(set.labels(), &pred, self.num_classes)?;
        Ok(EvalReport {
            loss: (loss_sum / set.len() as f64) as f32,
            accuracy: accuracy(&confusion),
            balanced_accuracy: balanced_accuracy(&confusion),
            count: set.len(),
            confusion,
        })
    }
}
