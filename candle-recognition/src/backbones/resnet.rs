use super::conv::NormConfig;
use super::resnet3d::{ResNet3d, ResNet3dConfig, StageFlags};
use super::Backbone;
use crate::params::ParamStore;
use crate::Result;
use candle::Tensor;
use serde::Deserialize;

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ResNetConfig {
    pub in_channels: usize,
    pub base_channels: usize,
    pub stage_blocks: Vec<usize>,
    pub conv1_kernel: usize,
    pub pool1: bool,
    pub norm_cfg: NormConfig,
    pub zero_init_residual: bool,
}

impl Default for ResNetConfig {
    fn default() -> Self {
        Self {
            in_channels: 3,
            base_channels: 16,
            stage_blocks: vec![1, 1, 1, 1],
            conv1_kernel: 7,
            pool1: true,
            norm_cfg: NormConfig {
                kind: "BN2d".to_string(),
                ..Default::default()
            },
            zero_init_residual: true,
        }
    }
}

/// 2-D ResNet over `[N, C, H, W]` frames, used by segment based recognizers.
///
/// Shares its blocks with [`ResNet3d`]: every kernel has a temporal extent of one.
pub struct ResNet {
    inner: ResNet3d,
}

impl ResNet {
    pub fn new(ps: &ParamStore, cfg: &ResNetConfig) -> Result<Self> {
        let flat = ResNet3dConfig {
            in_channels: cfg.in_channels,
            base_channels: cfg.base_channels,
            stage_blocks: cfg.stage_blocks.clone(),
            conv1_kernel: [1, cfg.conv1_kernel, cfg.conv1_kernel],
            conv1_stride: [1, 2],
            pool1: cfg.pool1,
            inflate: Some(vec![StageFlags::Stage(0); cfg.stage_blocks.len()]),
            non_local: None,
            norm_cfg: cfg.norm_cfg.clone(),
            zero_init_residual: cfg.zero_init_residual,
            ..Default::default()
        };
        Ok(Self {
            inner: ResNet3d::new(ps, &flat)?,
        })
    }
}

impl Backbone for ResNet {
    fn init_weights(&mut self) -> Result<()> {
        self.inner.init_weights()
    }

    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let ys = self.inner.forward_t(&xs.unsqueeze(2)?, train)?;
        Ok(ys.squeeze(2)?)
    }

    fn out_channels(&self) -> usize {
        self.inner.out_channels()
    }
}
