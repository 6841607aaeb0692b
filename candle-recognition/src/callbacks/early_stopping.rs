//! Early stopping callback.

use super::{Callback, EpochMetrics, Mode};
use crate::{Result, Trainer};

/// Stops training once the monitored metric has not improved for `patience` epochs.
///
/// Epochs where the metric is absent, e.g. epochs without validation, are not counted.
pub struct EarlyStopping {
    monitor: String,
    patience: usize,
    min_delta: f64,
    mode: Mode,
    best_metric: Option<f64>,
    epochs_without_improvement: usize,
    stopped: bool,
}

impl EarlyStopping {
    pub fn new() -> Self {
        Self {
            monitor: "val/top1_acc".to_string(),
            patience: 3,
            min_delta: 0.0,
            mode: Mode::Max,
            best_metric: None,
            epochs_without_improvement: 0,
            stopped: false,
        }
    }

    /// A `train/<key>` or `val/<key>` metric.
    pub fn monitor(mut self, metric: impl Into<String>) -> Self {
        self.monitor = metric.into();
        self
    }

    pub fn patience(mut self, patience: usize) -> Self {
        self.patience = patience;
        self
    }

    pub fn min_delta(mut self, delta: f64) -> Self {
        self.min_delta = delta;
        self
    }

    pub fn mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }
}

impl Default for EarlyStopping {
    fn default() -> Self {
        Self::new()
    }
}

impl Callback for EarlyStopping {
    fn on_epoch_end(
        &mut self,
        _trainer: &Trainer,
        epoch: usize,
        metrics: &EpochMetrics,
    ) -> Result<()> {
        let Some(current) = metrics.get(&self.monitor) else {
            return Ok(());
        };

        match self.best_metric {
            Some(best) if !self.mode.is_better(current, best, self.min_delta) => {
                self.epochs_without_improvement += 1;
                if self.epochs_without_improvement >= self.patience {
                    tracing::info!(
                        epoch,
                        monitor = %self.monitor,
                        best,
                        "no improvement for {} epochs",
                        self.epochs_without_improvement
                    );
                    self.stopped = true;
                }
            }
            _ => {
                self.best_metric = Some(current);
                self.epochs_without_improvement = 0;
            }
        }

        Ok(())
    }

    fn should_stop(&self) -> bool {
        self.stopped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::losses::LogVars;
    use crate::TrainerConfig;

    fn epoch(epoch: usize, top1: Option<f64>) -> EpochMetrics {
        let val = top1.map(|v| {
            let mut val = LogVars::new();
            val.insert("top1_acc", v);
            val
        });
        EpochMetrics {
            epoch,
            train: LogVars::new(),
            val,
        }
    }

    #[test]
    fn stops_once_improvement_plateaus() -> Result<()> {
        let trainer = Trainer::new(TrainerConfig::new());
        let mut early_stopping = EarlyStopping::new().patience(2).min_delta(0.05);
        // 0.74 is within min_delta of 0.7, and epochs without validation are skipped.
        let accuracies = [Some(0.2), Some(0.5), None, Some(0.7), Some(0.74), None, Some(0.7)];
        let mut stopped_at = None;
        for (i, top1) in accuracies.into_iter().enumerate() {
            early_stopping.on_epoch_end(&trainer, i, &epoch(i, top1))?;
            if early_stopping.should_stop() && stopped_at.is_none() {
                stopped_at = Some(i);
            }
        }
        assert_eq!(stopped_at, Some(6));
        assert_eq!(early_stopping.best_metric, Some(0.7));
        Ok(())
    }

    #[test]
    fn improvements_reset_the_patience() -> Result<()> {
        let trainer = Trainer::new(TrainerConfig::new());
        let mut early_stopping = EarlyStopping::new().patience(2);
        for (i, top1) in [0.5, 0.4, 0.6, 0.55, 0.7].into_iter().enumerate() {
            early_stopping.on_epoch_end(&trainer, i, &epoch(i, Some(top1)))?;
            assert!(!early_stopping.should_stop(), "stopped at epoch {i}");
        }
        assert_eq!(early_stopping.epochs_without_improvement, 0);
        Ok(())
    }
}
