//! Per-epoch learning-rate schedules.

use burn_optim::LearningRate;

use crate::config::LrSchedule;

/// Learning rate as a function of the epoch index.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LrScheduler {
    Constant(LearningRate),
    /// `eta_min + (base - eta_min) * (1 + cos(pi * epoch / t_max)) / 2`
    Cosine {
        base: LearningRate,
        eta_min: LearningRate,
        t_max: usize,
    },
}

impl LrScheduler {
    pub fn from_config(schedule: LrSchedule, base: LearningRate, epochs: usize) -> Self {
        match schedule {
            LrSchedule::Constant => LrScheduler::Constant(base),
            LrSchedule::Cosine => LrScheduler::Cosine {
                base,
                eta_min: 0.0,
                t_max: epochs.max(1),
            },
        }
    }

    pub fn lr_at(&self, epoch: usize) -> LearningRate {
        match *self {
            LrScheduler::Constant(lr) => lr,
            LrScheduler::Cosine {
                base,
                eta_min,
                t_max,
            } => {
                let progress = epoch.min(t_max) as f64 / t_max as f64;
                eta_min + (base - eta_min) * (1.0 + (std::f64::consts::PI * progress).cos()) / 2.0
            }
        }
    }
}
