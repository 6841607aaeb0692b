//! Trainer configuration and experiment config records.

mod overlay;

pub use overlay::{apply_override, apply_overrides, load, merge, parse_override, BASE_KEY, DELETE_KEY};

use crate::Result;
use candle::Device;
use serde::Deserialize;
use serde_json::Value;

/// A config section as loaded from an experiment record, e.g. `test_cfg`.
pub type ConfigDict = serde_json::Map<String, Value>;

pub struct TrainerConfig {
    pub max_epochs: usize,
    pub device: Device,
    pub log_every_n_steps: usize,
    /// `k` values reported as `top{k}_acc` after each validation pass.
    pub eval_topk: Vec<usize>,
    pub validate_every_n_epochs: usize,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            max_epochs: 100,
            device: Device::Cpu,
            log_every_n_steps: 20,
            eval_topk: vec![1, 5],
            validate_every_n_epochs: 1,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ScheduleFile {
    total_epochs: Option<usize>,
    log_config: Option<LogSection>,
    evaluation: Option<EvaluationSection>,
}

#[derive(Debug, Default, Deserialize)]
struct LogSection {
    interval: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct EvaluationSection {
    interval: Option<usize>,
    topk: Option<Vec<usize>>,
}

impl TrainerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads the schedule keys of an experiment record (`total_epochs`,
    /// `log_config.interval`, `evaluation.interval` and `evaluation.topk`). Keys that are
    /// absent keep their defaults.
    pub fn from_config(cfg: &Value) -> Result<Self> {
        let file = ScheduleFile::deserialize(cfg)?;
        let mut config = Self::default();
        if let Some(epochs) = file.total_epochs {
            config.max_epochs = epochs;
        }
        if let Some(interval) = file.log_config.and_then(|log| log.interval) {
            config.log_every_n_steps = interval;
        }
        if let Some(evaluation) = file.evaluation {
            if let Some(interval) = evaluation.interval {
                config.validate_every_n_epochs = interval;
            }
            if let Some(topk) = evaluation.topk {
                config.eval_topk = topk;
            }
        }
        Ok(config)
    }

    pub fn max_epochs(mut self, epochs: usize) -> Self {
        self.max_epochs = epochs;
        self
    }

    pub fn device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    pub fn log_every_n_steps(mut self, n: usize) -> Self {
        self.log_every_n_steps = n;
        self
    }

    pub fn eval_topk(mut self, topk: impl Into<Vec<usize>>) -> Self {
        self.eval_topk = topk.into();
        self
    }

    pub fn validate_every_n_epochs(mut self, n: usize) -> Self {
        self.validate_every_n_epochs = n;
        self
    }
}
