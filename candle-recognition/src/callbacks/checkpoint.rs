//! Model checkpointing callback.

use super::{Callback, EpochMetrics, Mode};
use crate::{Result, Trainer};
use candle_nn::VarMap;
use std::collections::BinaryHeap;
use std::path::PathBuf;

struct CheckpointEntry {
    metric: f64,
    path: PathBuf,
    mode: Mode,
}

impl PartialEq for CheckpointEntry {
    fn eq(&self, other: &Self) -> bool {
        self.metric == other.metric
    }
}

impl Eq for CheckpointEntry {}

impl PartialOrd for CheckpointEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CheckpointEntry {
    // The heap top is the worst checkpoint, the next one to delete.
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        let ordering = self.metric.total_cmp(&other.metric);
        match self.mode {
            Mode::Min => ordering,
            Mode::Max => ordering.reverse(),
        }
    }
}

/// Saves the parameters as safetensors whenever the monitored metric improves, keeping
/// the `save_top_k` best files. Only rank 0 writes.
pub struct ModelCheckpoint {
    varmap: VarMap,
    dirpath: PathBuf,
    monitor: String,
    save_top_k: usize,
    mode: Mode,
    checkpoints: BinaryHeap<CheckpointEntry>,
    best_metric: Option<f64>,
}

impl ModelCheckpoint {
    pub fn new(varmap: VarMap, dirpath: impl Into<PathBuf>) -> Self {
        Self {
            varmap,
            dirpath: dirpath.into(),
            monitor: "val/top1_acc".to_string(),
            save_top_k: 1,
            mode: Mode::Max,
            checkpoints: BinaryHeap::new(),
            best_metric: None,
        }
    }

    /// A `train/<key>` or `val/<key>` metric.
    pub fn monitor(mut self, metric: impl Into<String>) -> Self {
        self.monitor = metric.into();
        self
    }

    pub fn save_top_k(mut self, k: usize) -> Self {
        self.save_top_k = k;
        self
    }

    pub fn mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    /// Paths of the checkpoints currently kept, best first.
    pub fn best_paths(&self) -> Vec<PathBuf> {
        let mut entries: Vec<_> = self.checkpoints.iter().collect();
        entries.sort();
        entries.into_iter().map(|e| e.path.clone()).collect()
    }

    fn save_checkpoint(&mut self, epoch: usize, metric: f64) -> Result<()> {
        std::fs::create_dir_all(&self.dirpath)?;

        let filename = format!(
            "epoch_{:04}_{}_{:.4}.safetensors",
            epoch,
            self.monitor.replace('/', "_"),
            metric
        );
        let path = self.dirpath.join(&filename);
        self.varmap.save(&path)?;
        tracing::info!(epoch, path = %path.display(), "saved checkpoint");

        self.checkpoints.push(CheckpointEntry {
            metric,
            path,
            mode: self.mode,
        });

        while self.checkpoints.len() > self.save_top_k {
            if let Some(entry) = self.checkpoints.pop() {
                if let Err(err) = std::fs::remove_file(&entry.path) {
                    tracing::warn!(path = %entry.path.display(), %err, "could not remove checkpoint");
                }
            }
        }

        Ok(())
    }
}

impl Callback for ModelCheckpoint {
    fn on_epoch_end(&mut self, trainer: &Trainer, epoch: usize, metrics: &EpochMetrics) -> Result<()> {
        if trainer.process_group().rank() != 0 {
            return Ok(());
        }
        let Some(current) = metrics.get(&self.monitor) else {
            return Ok(());
        };

        let should_save = match self.best_metric {
            None => true,
            Some(best) => self.mode.is_better(current, best, 0.0),
        };

        if should_save {
            self.best_metric = Some(current);
            self.save_checkpoint(epoch, current)?;
        }

        Ok(())
    }
}
