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

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct I3DHeadConfig {
    pub num_classes: usize,
    pub in_channels: usize,
    /// `"avg"` pools over time and space, `null` expects pre-pooled features.
    #[serde(default = "default_spatial_type")]
    pub spatial_type: Option<String>,
    #[serde(default = "default_dropout_ratio")]
    pub dropout_ratio: f32,
    #[serde(default = "default_init_std")]
    pub init_std: f64,
    #[serde(default)]
    pub loss_cls: LossConfig,
    #[serde(default = "default_topk")]
    pub topk: Vec<usize>,
}

impl I3DHeadConfig {
    pub fn new(num_classes: usize, in_channels: usize) -> Self {
        Self {
            num_classes,
            in_channels,
            spatial_type: default_spatial_type(),
            dropout_ratio: default_dropout_ratio(),
            init_std: default_init_std(),
            loss_cls: LossConfig::default(),
            topk: default_topk(),
        }
    }
}

/// Global average pooling, dropout and a linear classifier over `[N, C, T, H, W]` features.
pub struct I3DHead {
    cfg: I3DHeadConfig,
    dropout: Dropout,
    fc_cls: FcCls,
}

impl I3DHead {
    pub fn new(ps: &ParamStore, cfg: &I3DHeadConfig) -> Result<Self> {
        if cfg.num_classes == 0 {
            return Err(Error::Config("num_classes must be positive".to_string()));
        }
        check_loss(&cfg.loss_cls)?;
        check_spatial_type(cfg.spatial_type.as_deref())?;
        let fc_cls = FcCls::new(&ps.pp("fc_cls"), cfg.in_channels, cfg.num_classes, cfg.init_std)?;
        Ok(Self {
            cfg: cfg.clone(),
            dropout: Dropout::new(cfg.dropout_ratio),
            fc_cls,
        })
    }

    pub fn config(&self) -> &I3DHeadConfig {
        &self.cfg
    }
}

impl Head for I3DHead {
    fn init_weights(&mut self) -> Result<()> {
        self.fc_cls.init_weights()
    }

    fn forward_t(&self, xs: &Tensor, _num_segs: usize, train: bool) -> Result<Tensor> {
        let xs = pool_features(xs, self.cfg.spatial_type.as_deref())?;
        let xs = self.dropout.forward_t(&xs, train)?;
        self.fc_cls.forward(&xs)
    }

    fn loss(&self, cls_score: &Tensor, labels: &Tensor) -> Result<LossBundle> {
        classification_loss(cls_score, labels, &self.cfg.loss_cls, &self.cfg.topk)
    }
}
