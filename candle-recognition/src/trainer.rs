//! Training loop implementation.

use crate::callbacks::EpochMetrics;
use crate::dist::{ProcessGroup, SingleProcess};
use crate::losses::LogVars;
use crate::metrics::{MeanClassAccuracy, Metric, TopKAccuracy};
use crate::module::{DataBatch, Recognizer};
use crate::{Callback, Error, Result, TrainerConfig};
use candle::Tensor;
use candle_nn::Optimizer;
use std::sync::Arc;

/// Running averages of log values, weighted by the number of samples behind each update.
#[derive(Default)]
struct LogBuffer {
    sums: Vec<(String, f64)>,
    count: usize,
}

impl LogBuffer {
    fn update(&mut self, log_vars: &LogVars, num_samples: usize) {
        for (key, value) in log_vars.iter() {
            let weighted = value * num_samples as f64;
            match self.sums.iter_mut().find(|(k, _)| k == key) {
                Some((_, sum)) => *sum += weighted,
                None => self.sums.push((key.to_string(), weighted)),
            }
        }
        self.count += num_samples;
    }

    fn average(&self) -> LogVars {
        let mut out = LogVars::new();
        if self.count > 0 {
            for (key, sum) in self.sums.iter() {
                out.insert(key.clone(), sum / self.count as f64);
            }
        }
        out
    }

    fn clear(&mut self) {
        self.sums.clear();
        self.count = 0;
    }
}

pub struct Trainer {
    config: TrainerConfig,
    callbacks: Vec<Box<dyn Callback>>,
    group: Arc<dyn ProcessGroup>,
    history: Vec<EpochMetrics>,
}

impl Trainer {
    pub fn new(config: TrainerConfig) -> Self {
        Self {
            config,
            callbacks: Vec::new(),
            group: Arc::new(SingleProcess),
            history: Vec::new(),
        }
    }

    pub fn with_callback(mut self, callback: impl Callback + 'static) -> Self {
        self.callbacks.push(Box::new(callback));
        self
    }

    /// Runs as one worker of `group`. Log values are averaged over the group.
    pub fn with_process_group(mut self, group: Arc<dyn ProcessGroup>) -> Self {
        self.group = group;
        self
    }

    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    pub fn process_group(&self) -> &dyn ProcessGroup {
        self.group.as_ref()
    }

    /// Metrics of every epoch run by the last call to [`fit`](Self::fit).
    pub fn history(&self) -> &[EpochMetrics] {
        &self.history
    }

    pub fn fit<M, O>(
        &mut self,
        model: &M,
        optimizer: &mut O,
        train_data: &[DataBatch],
        val_data: Option<&[DataBatch]>,
    ) -> Result<()>
    where
        M: Recognizer + ?Sized,
        O: Optimizer,
    {
        let mut callbacks = std::mem::take(&mut self.callbacks);
        let result = self.run(&mut callbacks, model, optimizer, train_data, val_data);
        self.callbacks = callbacks;
        result
    }

    fn run<M, O>(
        &mut self,
        callbacks: &mut [Box<dyn Callback>],
        model: &M,
        optimizer: &mut O,
        train_data: &[DataBatch],
        val_data: Option<&[DataBatch]>,
    ) -> Result<()>
    where
        M: Recognizer + ?Sized,
        O: Optimizer,
    {
        self.history.clear();
        for cb in callbacks.iter_mut() {
            cb.on_fit_start(self)?;
        }

        let log_every = self.config.log_every_n_steps;
        let validate_every = self.config.validate_every_n_epochs;
        let is_main = self.group.rank() == 0;
        let mut global_step = 0usize;

        for epoch in 0..self.config.max_epochs {
            for cb in callbacks.iter_mut() {
                cb.on_epoch_start(self, epoch)?;
            }

            let mut epoch_buffer = LogBuffer::default();
            let mut window = LogBuffer::default();
            for (batch_idx, batch) in train_data.iter().enumerate() {
                let output = model.train_step(batch, self.group.as_ref())?;
                optimizer.backward_step(&output.loss)?;
                epoch_buffer.update(&output.log_vars, output.num_samples);
                window.update(&output.log_vars, output.num_samples);
                global_step += 1;

                if log_every > 0 && global_step % log_every == 0 {
                    if is_main {
                        tracing::info!(
                            "Epoch [{}][{}/{}] {}",
                            epoch + 1,
                            batch_idx + 1,
                            train_data.len(),
                            window.average()
                        );
                    }
                    window.clear();
                }

                for cb in callbacks.iter_mut() {
                    cb.on_train_batch_end(self, batch_idx, &output)?;
                }
            }

            let val = match val_data {
                Some(val_data) if validate_every > 0 && (epoch + 1) % validate_every == 0 => {
                    Some(self.validate(model, val_data)?)
                }
                _ => None,
            };
            let metrics = EpochMetrics {
                epoch,
                train: epoch_buffer.average(),
                val,
            };
            if is_main {
                match &metrics.val {
                    Some(val) => tracing::info!("Epoch(val) [{}] {}", epoch + 1, val),
                    None => tracing::debug!("Epoch [{}] {}", epoch + 1, metrics.train),
                }
            }

            for cb in callbacks.iter_mut() {
                cb.on_epoch_end(self, epoch, &metrics)?;
            }
            self.history.push(metrics);

            if callbacks.iter().any(|cb| cb.should_stop()) {
                tracing::info!(epoch = epoch + 1, "stopping early");
                break;
            }
        }

        for cb in callbacks.iter_mut() {
            cb.on_fit_end(self)?;
        }
        Ok(())
    }

    /// Evaluates `model` on labelled batches, reporting `top{k}_acc` for every configured
    /// `k` and `mean_class_accuracy`. Values are averaged over the process group.
    pub fn validate<M>(&self, model: &M, batches: &[DataBatch]) -> Result<LogVars>
    where
        M: Recognizer + ?Sized,
    {
        let mut topk: Vec<TopKAccuracy> = self
            .config
            .eval_topk
            .iter()
            .map(|&k| TopKAccuracy::new(k))
            .collect();
        let mut mean_class = MeanClassAccuracy::new();

        for batch in batches {
            let Some(label) = &batch.label else {
                return Err(Error::InvalidArgument(
                    "validation batches must carry labels".to_string(),
                ));
            };
            let output = model.val_step(batch)?;
            for metric in topk.iter_mut() {
                metric.update(&output.results, label)?;
            }
            mean_class.update(&output.results, label)?;
        }

        let mut names: Vec<String> = topk.iter().map(|m| format!("top{}_acc", m.k())).collect();
        let mut values: Vec<f64> = topk.iter().map(|m| m.compute()).collect();
        names.push("mean_class_accuracy".to_string());
        values.push(mean_class.compute());

        if self.group.is_distributed() {
            let local = Tensor::new(values.as_slice(), &self.config.device)?;
            values = self.group.all_reduce_mean(&local)?.to_vec1::<f64>()?;
        }

        let mut log_vars = LogVars::new();
        for (name, value) in names.into_iter().zip(values) {
            log_vars.insert(name, value);
        }
        Ok(log_vars)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_buffer_weights_by_samples() {
        let mut buffer = LogBuffer::default();
        let mut a = LogVars::new();
        a.insert("loss", 1.0);
        let mut b = LogVars::new();
        b.insert("loss", 4.0);
        buffer.update(&a, 2);
        buffer.update(&b, 1);
        assert_eq!(buffer.average().get("loss"), Some(2.0));
        buffer.clear();
        assert!(buffer.average().is_empty());
    }
}
