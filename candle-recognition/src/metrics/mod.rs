//! Classification metrics accumulated over validation batches.

use crate::{Error, Result};
use candle::{DType, Tensor};

pub trait Metric {
    fn update(&mut self, preds: &Tensor, targets: &Tensor) -> Result<()>;
    fn compute(&self) -> f64;
    fn reset(&mut self);
}

/// Scores as host rows and labels as class indices, checked for matching lengths.
fn host_rows(scores: &Tensor, labels: &Tensor) -> Result<(Vec<Vec<f32>>, Vec<usize>)> {
    let scores = scores.to_dtype(DType::F32)?.to_vec2::<f32>()?;
    let labels = labels.flatten_all()?.to_dtype(DType::U32)?.to_vec1::<u32>()?;
    if scores.len() != labels.len() {
        return Err(Error::InvalidArgument(format!(
            "{} score rows for {} labels",
            scores.len(),
            labels.len()
        )));
    }
    let labels = labels.into_iter().map(|l| l as usize).collect::<Vec<_>>();
    if let Some((row, label)) = scores
        .iter()
        .zip(&labels)
        .find(|(row, label)| **label >= row.len())
    {
        return Err(Error::InvalidArgument(format!(
            "label {label} is out of range for {} classes",
            row.len()
        )));
    }
    Ok((scores, labels))
}

/// Zero based rank of the label, counting every other class that scores at least as
/// high. Ties rank against the label. A row holding a NaN has no rank.
fn label_rank(row: &[f32], label: usize) -> Option<usize> {
    if row.iter().any(|s| s.is_nan()) {
        return None;
    }
    let target = row[label];
    Some(
        row.iter()
            .enumerate()
            .filter(|&(class, &s)| class != label && s >= target)
            .count(),
    )
}

fn is_hit(row: &[f32], label: usize, k: usize) -> bool {
    label_rank(row, label).is_some_and(|rank| rank < k)
}

/// Fraction of samples whose label is among the `k` best scores, for each `k`.
///
/// `scores` is `[N, num_classes]` and `labels` holds `N` class indices. Ties count against
/// the label and rows with a NaN score are misses. An empty batch yields zeros.
pub fn top_k_accuracy(scores: &Tensor, labels: &Tensor, topk: &[usize]) -> Result<Vec<f64>> {
    let (rows, labels) = host_rows(scores, labels)?;
    if rows.is_empty() {
        return Ok(vec![0.0; topk.len()]);
    }
    let ranks: Vec<Option<usize>> = rows
        .iter()
        .zip(&labels)
        .map(|(row, &label)| label_rank(row, label))
        .collect();
    Ok(topk
        .iter()
        .map(|&k| {
            let hits = ranks.iter().filter(|r| r.is_some_and(|r| r < k)).count();
            hits as f64 / ranks.len() as f64
        })
        .collect())
}

#[derive(Debug, Clone)]
pub struct TopKAccuracy {
    k: usize,
    hits: usize,
    total: usize,
}

impl TopKAccuracy {
    pub fn new(k: usize) -> Self {
        Self { k, hits: 0, total: 0 }
    }

    pub fn k(&self) -> usize {
        self.k
    }
}

impl Metric for TopKAccuracy {
    fn update(&mut self, preds: &Tensor, targets: &Tensor) -> Result<()> {
        let (rows, labels) = host_rows(preds, targets)?;
        self.hits += rows
            .iter()
            .zip(&labels)
            .filter(|(row, &label)| is_hit(row, label, self.k))
            .count();
        self.total += rows.len();
        Ok(())
    }

    fn compute(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.hits as f64 / self.total as f64
        }
    }

    fn reset(&mut self) {
        self.hits = 0;
        self.total = 0;
    }
}

/// Mean over classes of the per-class recall of the arg-max prediction. Classes that never
/// appear as a label are left out.
#[derive(Debug, Clone, Default)]
pub struct MeanClassAccuracy {
    correct: Vec<usize>,
    seen: Vec<usize>,
}

impl MeanClassAccuracy {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Metric for MeanClassAccuracy {
    fn update(&mut self, preds: &Tensor, targets: &Tensor) -> Result<()> {
        let (rows, labels) = host_rows(preds, targets)?;
        for (row, label) in rows.iter().zip(labels) {
            if label >= self.seen.len() {
                self.seen.resize(label + 1, 0);
                self.correct.resize(label + 1, 0);
            }
            self.seen[label] += 1;
            if is_hit(row, label, 1) {
                self.correct[label] += 1;
            }
        }
        Ok(())
    }

    fn compute(&self) -> f64 {
        let recalls: Vec<f64> = self
            .seen
            .iter()
            .zip(&self.correct)
            .filter(|(&seen, _)| seen > 0)
            .map(|(&seen, &correct)| correct as f64 / seen as f64)
            .collect();
        if recalls.is_empty() {
            0.0
        } else {
            recalls.iter().sum::<f64>() / recalls.len() as f64
        }
    }

    fn reset(&mut self) {
        self.correct.clear();
        self.seen.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle::Device;

    fn scores() -> Result<Tensor> {
        Ok(Tensor::new(
            &[[0.1f32, 0.7, 0.2], [0.5, 0.3, 0.2], [0.2, 0.3, 0.5], [0.6, 0.3, 0.1]],
            &Device::Cpu,
        )?)
    }

    #[test]
    fn top_k_counts_better_classes() -> Result<()> {
        let labels = Tensor::new(&[1u32, 1, 0, 2], &Device::Cpu)?;
        let acc = top_k_accuracy(&scores()?, &labels, &[1, 2, 3])?;
        assert_eq!(acc, vec![0.25, 0.5, 1.0]);
        Ok(())
    }

    #[test]
    fn top_k_metric_accumulates_batches() -> Result<()> {
        let mut metric = TopKAccuracy::new(1);
        let labels = Tensor::new(&[1u32, 0, 2, 0], &Device::Cpu)?;
        metric.update(&scores()?, &labels)?;
        metric.update(&scores()?.narrow(0, 0, 2)?, &labels.narrow(0, 0, 2)?)?;
        assert_eq!(metric.compute(), 1.0);
        metric.reset();
        assert_eq!(metric.compute(), 0.0);
        Ok(())
    }

    #[test]
    fn mean_class_accuracy_ignores_unseen_classes() -> Result<()> {
        let mut metric = MeanClassAccuracy::new();
        // class 1 is right once out of two, classes 0 and 2 always
        let labels = Tensor::new(&[1u32, 1, 2, 0], &Device::Cpu)?;
        metric.update(&scores()?, &labels)?;
        assert!((metric.compute() - (0.5 + 1.0 + 1.0) / 3.0).abs() < 1e-12);
        let labels = Tensor::new(&[1u32, 1, 1, 0], &Device::Cpu)?;
        metric.reset();
        metric.update(&scores()?, &labels)?;
        assert!((metric.compute() - (1.0 / 3.0 + 1.0) / 2.0).abs() < 1e-12);
        Ok(())
    }

    #[test]
    fn tied_rows_are_misses() -> Result<()> {
        let collapsed = Tensor::zeros((4, 400), DType::F32, &Device::Cpu)?;
        let labels = Tensor::new(&[0u32, 17, 123, 399], &Device::Cpu)?;
        assert_eq!(top_k_accuracy(&collapsed, &labels, &[1, 5])?, vec![0.0, 0.0]);

        // Two classes share the best score, so the label only makes the top two.
        let tied = Tensor::new(&[[0.4f32, 0.4, 0.2]], &Device::Cpu)?;
        let label = Tensor::new(&[1u32], &Device::Cpu)?;
        assert_eq!(top_k_accuracy(&tied, &label, &[1, 2])?, vec![0.0, 1.0]);

        let mut mean_class = MeanClassAccuracy::new();
        mean_class.update(&collapsed, &labels)?;
        assert_eq!(mean_class.compute(), 0.0);
        Ok(())
    }

    #[test]
    fn nan_rows_are_misses() -> Result<()> {
        let nan = f32::NAN;
        let diverged = Tensor::new(&[[nan, nan, nan], [0.1, nan, 0.9], [0.1, 0.2, 0.7]], &Device::Cpu)?;
        let labels = Tensor::new(&[2u32, 2, 2], &Device::Cpu)?;
        let acc = top_k_accuracy(&diverged, &labels, &[1, 3])?;
        assert_eq!(acc, vec![1.0 / 3.0, 1.0 / 3.0]);

        let mut top1 = TopKAccuracy::new(1);
        top1.update(&diverged, &labels)?;
        assert_eq!(top1.compute(), 1.0 / 3.0);
        let mut mean_class = MeanClassAccuracy::new();
        mean_class.update(&diverged, &labels)?;
        assert_eq!(mean_class.compute(), 1.0 / 3.0);
        Ok(())
    }

    #[test]
    fn out_of_range_labels_are_rejected() -> Result<()> {
        let labels = Tensor::new(&[3u32, 0, 0, 0], &Device::Cpu)?;
        assert!(matches!(
            top_k_accuracy(&scores()?, &labels, &[1]),
            Err(Error::InvalidArgument(_))
        ));
        Ok(())
    }
}
