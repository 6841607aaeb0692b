//! Callback system for training hooks.

mod checkpoint;
mod early_stopping;

pub use checkpoint::ModelCheckpoint;
pub use early_stopping::EarlyStopping;

use crate::losses::LogVars;
use crate::module::TrainStepOutput;
use crate::{Result, Trainer};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Min,
    Max,
}

impl Mode {
    pub(crate) fn is_better(&self, current: f64, best: f64, min_delta: f64) -> bool {
        match self {
            Mode::Min => current < best - min_delta,
            Mode::Max => current > best + min_delta,
        }
    }
}

/// Averaged log values of one epoch.
#[derive(Clone, Debug)]
pub struct EpochMetrics {
    pub epoch: usize,
    /// Training log values weighted by the number of samples of each batch.
    pub train: LogVars,
    /// Validation metrics, when validation ran this epoch.
    pub val: Option<LogVars>,
}

impl EpochMetrics {
    /// Looks up `train/<key>` or `val/<key>`.
    pub fn get(&self, key: &str) -> Option<f64> {
        if let Some(key) = key.strip_prefix("train/") {
            self.train.get(key)
        } else if let Some(key) = key.strip_prefix("val/") {
            self.val.as_ref()?.get(key)
        } else {
            None
        }
    }
}

pub trait Callback: Send {
    fn on_fit_start(&mut self, _trainer: &Trainer) -> Result<()> {
        Ok(())
    }

    fn on_fit_end(&mut self, _trainer: &Trainer) -> Result<()> {
        Ok(())
    }

    fn on_epoch_start(&mut self, _trainer: &Trainer, _epoch: usize) -> Result<()> {
        Ok(())
    }

    fn on_epoch_end(
        &mut self,
        _trainer: &Trainer,
        _epoch: usize,
        _metrics: &EpochMetrics,
    ) -> Result<()> {
        Ok(())
    }

    fn on_train_batch_end(
        &mut self,
        _trainer: &Trainer,
        _batch_idx: usize,
        _output: &TrainStepOutput,
    ) -> Result<()> {
        Ok(())
    }

    fn should_stop(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_are_looked_up_by_phase() {
        let mut train = LogVars::new();
        train.insert("loss", 0.5);
        let mut val = LogVars::new();
        val.insert("top1_acc", 0.75);
        let metrics = EpochMetrics {
            epoch: 0,
            train,
            val: Some(val),
        };
        assert_eq!(metrics.get("train/loss"), Some(0.5));
        assert_eq!(metrics.get("val/top1_acc"), Some(0.75));
        assert_eq!(metrics.get("val/loss"), None);
        assert_eq!(metrics.get("loss"), None);
    }
}
