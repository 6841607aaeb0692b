use super::{
    check_loss, check_spatial_type, classification_loss, default_dropout_ratio, default_init_std,
    default_spatial_type, default_topk, pool_features, FcCls, Head, LossConfig,
};
use crate::losses::LossBundle;
use crate::params::ParamStore;
use crate::{Error, Result};
use candle::Tensor;
use candle_nn::{Dropout, ModuleT};
use serde::Deserialize;

const CONSENSUS_TYPES: &[&str] = &["AvgConsensus"];

fn default_consensus_dim() -> usize {
    1
}

/// How per-segment features are fused into one video feature.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConsensusConfig {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default = "default_consensus_dim")]
    pub dim: usize,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            kind: "AvgConsensus".to_string(),
            dim: default_consensus_dim(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TSNHeadConfig {
    pub num_classes: usize,
    pub in_channels: usize,
    #[serde(default = "default_spatial_type")]
    pub spatial_type: Option<String>,
    #[serde(default)]
    pub consensus: ConsensusConfig,
    #[serde(default = "default_dropout_ratio")]
    pub dropout_ratio: f32,
    #[serde(default = "default_init_std")]
    pub init_std: f64,
    #[serde(default)]
    pub loss_cls: LossConfig,
    #[serde(default = "default_topk")]
    pub topk: Vec<usize>,
}

impl TSNHeadConfig {
    pub fn new(num_classes: usize, in_channels: usize) -> Self {
        Self {
            num_classes,
            in_channels,
            spatial_type: default_spatial_type(),
            consensus: ConsensusConfig::default(),
            dropout_ratio: default_dropout_ratio(),
            init_std: default_init_std(),
            loss_cls: LossConfig::default(),
            topk: default_topk(),
        }
    }
}

/// Temporal segment head: pools each segment, averages segments of the same video and
/// classifies the result.
pub struct TSNHead {
    cfg: TSNHeadConfig,
    dropout: Dropout,
    fc_cls: FcCls,
}

impl TSNHead {
    pub fn new(ps: &ParamStore, cfg: &TSNHeadConfig) -> Result<Self> {
        if cfg.num_classes == 0 {
            return Err(Error::Config("num_classes must be positive".to_string()));
        }
        check_loss(&cfg.loss_cls)?;
        check_spatial_type(cfg.spatial_type.as_deref())?;
        if !CONSENSUS_TYPES.contains(&cfg.consensus.kind.as_str()) {
            return Err(Error::unsupported(
                "consensus.type",
                &cfg.consensus.kind,
                CONSENSUS_TYPES,
            ));
        }
        if cfg.consensus.dim != 1 {
            return Err(Error::unsupported("consensus.dim", cfg.consensus.dim, &["1"]));
        }
        let fc_cls = FcCls::new(&ps.pp("fc_cls"), cfg.in_channels, cfg.num_classes, cfg.init_std)?;
        Ok(Self {
            cfg: cfg.clone(),
            dropout: Dropout::new(cfg.dropout_ratio),
            fc_cls,
        })
    }

    pub fn config(&self) -> &TSNHeadConfig {
        &self.cfg
    }
}

impl Head for TSNHead {
    fn init_weights(&mut self) -> Result<()> {
        self.fc_cls.init_weights()
    }

    fn forward_t(&self, xs: &Tensor, num_segs: usize, train: bool) -> Result<Tensor> {
        let rows = xs.dim(0)?;
        if num_segs == 0 || rows % num_segs != 0 {
            return Err(Error::InvalidArgument(format!(
                "{rows} feature rows cannot be split into segments of {num_segs}"
            )));
        }
        let xs = pool_features(xs, self.cfg.spatial_type.as_deref())?;
        let channels = xs.dim(1)?;
        let xs = xs.reshape((rows / num_segs, num_segs, channels))?.mean(1)?;
        let xs = self.dropout.forward_t(&xs, train)?;
        self.fc_cls.forward(&xs)
    }

    fn loss(&self, cls_score: &Tensor, labels: &Tensor) -> Result<LossBundle> {
        classification_loss(cls_score, labels, &self.cfg.loss_cls, &self.cfg.topk)
    }
}
