//! Classification heads mapping backbone features to class scores.

mod i3d_head;
mod tsn_head;

pub use i3d_head::{I3DHead, I3DHeadConfig};
pub use tsn_head::{ConsensusConfig, TSNHead, TSNHeadConfig};

use crate::losses::LossBundle;
use crate::metrics::top_k_accuracy;
use crate::params::{Param, ParamStore};
use crate::{Error, Result};
use candle::{DType, Module, Tensor, D};
use candle_nn::Init;
use serde::Deserialize;

pub trait Head: Send {
    fn init_weights(&mut self) -> Result<()>;

    /// Produces `[N, num_classes]` scores. Heads that fold segments expect
    /// `N * num_segs` feature rows.
    fn forward_t(&self, xs: &Tensor, num_segs: usize, train: bool) -> Result<Tensor>;

    /// Losses and training metrics for a batch of scores.
    fn loss(&self, cls_score: &Tensor, labels: &Tensor) -> Result<LossBundle>;
}

fn default_loss_weight() -> f64 {
    1.0
}

/// `loss_cls` of a head.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LossConfig {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default = "default_loss_weight")]
    pub loss_weight: f64,
}

impl Default for LossConfig {
    fn default() -> Self {
        Self {
            kind: "CrossEntropyLoss".to_string(),
            loss_weight: default_loss_weight(),
        }
    }
}

const LOSS_TYPES: &[&str] = &["CrossEntropyLoss"];
const SPATIAL_TYPES: &[&str] = &["avg"];

pub(crate) fn default_dropout_ratio() -> f32 {
    0.5
}

pub(crate) fn default_init_std() -> f64 {
    0.01
}

pub(crate) fn default_topk() -> Vec<usize> {
    vec![1, 5]
}

pub(crate) fn default_spatial_type() -> Option<String> {
    Some("avg".to_string())
}

pub(crate) fn check_loss(cfg: &LossConfig) -> Result<()> {
    if LOSS_TYPES.contains(&cfg.kind.as_str()) {
        Ok(())
    } else {
        Err(Error::unsupported("loss_cls.type", &cfg.kind, LOSS_TYPES))
    }
}

pub(crate) fn check_spatial_type(spatial_type: Option<&str>) -> Result<()> {
    match spatial_type {
        None => Ok(()),
        Some(kind) if SPATIAL_TYPES.contains(&kind) => Ok(()),
        Some(kind) => Err(Error::unsupported("spatial_type", kind, SPATIAL_TYPES)),
    }
}

/// Averages every dimension after the channels, or flattens them when pooling is off.
pub(crate) fn pool_features(xs: &Tensor, spatial_type: Option<&str>) -> Result<Tensor> {
    match spatial_type {
        Some(_) if xs.rank() > 2 => Ok(xs.flatten_from(2)?.mean(2)?),
        _ => Ok(xs.flatten_from(1)?),
    }
}

/// The final linear layer of a head, initialised from a normal distribution.
pub(crate) struct FcCls {
    weight: Param,
    bias: Param,
    linear: candle_nn::Linear,
}

impl FcCls {
    pub(crate) fn new(
        ps: &ParamStore,
        in_channels: usize,
        num_classes: usize,
        init_std: f64,
    ) -> Result<Self> {
        let init = Init::Randn {
            mean: 0.,
            stdev: init_std,
        };
        let weight = ps.param("weight", (num_classes, in_channels), init)?;
        let bias = ps.param("bias", num_classes, Init::Const(0.))?;
        let linear = candle_nn::Linear::new(weight.tensor().clone(), Some(bias.tensor().clone()));
        Ok(Self {
            weight,
            bias,
            linear,
        })
    }

    pub(crate) fn init_weights(&mut self) -> Result<()> {
        self.weight.reset()?;
        self.bias.reset()
    }

    pub(crate) fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        Ok(self.linear.forward(xs)?)
    }
}

/// Cross-entropy loss plus top-k accuracy for hard labels.
///
/// Hard labels are class indices of shape `[N]` (a 0-d label counts as a batch of one).
/// Soft labels have the shape of the scores and only produce a loss.
pub(crate) fn classification_loss(
    cls_score: &Tensor,
    labels: &Tensor,
    loss_cfg: &LossConfig,
    topk: &[usize],
) -> Result<LossBundle> {
    let labels = if labels.rank() == 0 {
        labels.unsqueeze(0)?
    } else {
        labels.clone()
    };

    let mut losses = LossBundle::new();
    let loss = if labels.dims() == cls_score.dims() {
        let log_probs = candle_nn::ops::log_softmax(cls_score, D::Minus1)?;
        log_probs
            .mul(&labels.to_dtype(log_probs.dtype())?)?
            .sum(D::Minus1)?
            .neg()?
            .mean_all()?
    } else {
        let labels = labels.flatten_all()?;
        if labels.dim(0)? != cls_score.dim(0)? {
            return Err(Error::InvalidArgument(format!(
                "{} labels for {} score rows",
                labels.dim(0)?,
                cls_score.dim(0)?
            )));
        }
        let accuracies = top_k_accuracy(cls_score, &labels, topk)?;
        for (k, acc) in topk.iter().zip(accuracies) {
            let acc = Tensor::new(acc as f32, cls_score.device())?.to_dtype(cls_score.dtype())?;
            losses.insert(format!("top{k}_acc"), acc);
        }
        candle_nn::loss::cross_entropy(cls_score, &labels.to_dtype(DType::U32)?)?
    };
    losses.insert("loss_cls", loss.affine(loss_cfg.loss_weight, 0.)?);
    Ok(losses)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::losses::LossValue;
    use candle::Device;

    fn value(losses: &LossBundle, name: &str) -> f32 {
        match losses.get(name) {
            Some(LossValue::Tensor(t)) => t.to_scalar::<f32>().expect("scalar"),
            other => panic!("{name}: {other:?}"),
        }
    }

    #[test]
    fn hard_labels_report_accuracy_before_the_loss() -> Result<()> {
        let dev = Device::Cpu;
        let scores = Tensor::new(&[[4f32, 1., 0.], [0., 1., 4.]], &dev)?;
        let labels = Tensor::new(&[0u32, 1], &dev)?;
        let losses = classification_loss(&scores, &labels, &LossConfig::default(), &[1, 2])?;
        let keys: Vec<_> = losses.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["top1_acc", "top2_acc", "loss_cls"]);
        assert_eq!(value(&losses, "top1_acc"), 0.5);
        assert_eq!(value(&losses, "top2_acc"), 1.0);
        assert!(value(&losses, "loss_cls") > 0.0);
        Ok(())
    }

    #[test]
    fn loss_weight_scales_the_loss() -> Result<()> {
        let dev = Device::Cpu;
        let scores = Tensor::new(&[[1f32, 2., 3.]], &dev)?;
        let labels = Tensor::new(2u32, &dev)?;
        let plain = classification_loss(&scores, &labels, &LossConfig::default(), &[1])?;
        let weighted = LossConfig {
            loss_weight: 2.0,
            ..Default::default()
        };
        let doubled = classification_loss(&scores, &labels, &weighted, &[1])?;
        let diff = value(&doubled, "loss_cls") - 2.0 * value(&plain, "loss_cls");
        assert!(diff.abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn soft_labels_skip_accuracy() -> Result<()> {
        let dev = Device::Cpu;
        let scores = Tensor::new(&[[0f32, 0.]], &dev)?;
        let labels = Tensor::new(&[[0.5f32, 0.5]], &dev)?;
        let losses = classification_loss(&scores, &labels, &LossConfig::default(), &[1])?;
        assert_eq!(losses.len(), 1);
        assert!((value(&losses, "loss_cls") - std::f32::consts::LN_2).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn pooling_averages_trailing_dimensions() -> Result<()> {
        let xs = Tensor::arange(0f32, 8., &Device::Cpu)?.reshape((1, 2, 2, 2))?;
        let pooled = pool_features(&xs, Some("avg"))?;
        assert_eq!(pooled.to_vec2::<f32>()?, vec![vec![1.5, 5.5]]);
        Ok(())
    }
}
