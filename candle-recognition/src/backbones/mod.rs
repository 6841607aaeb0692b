//! Feature extractors turning clips into dense representations.

mod conv;
mod non_local;
mod resnet;
mod resnet3d;

pub use conv::{BatchNorm, Conv3d, Conv3dConfig, ConvModule, NormConfig};
pub use non_local::{NonLocal3d, NonLocalConfig, NonLocalMode};
pub use resnet::{ResNet, ResNetConfig};
pub use resnet3d::{ResNet3d, ResNet3dConfig, StageFlags};

use crate::Result;
use candle::Tensor;

pub trait Backbone: Send {
    /// Fills every parameter from its initialisation recipe.
    fn init_weights(&mut self) -> Result<()>;

    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor>;

    /// Channel count of the produced features.
    fn out_channels(&self) -> usize;
}

/// Max-pools the two spatial dimensions of a `[N, C, T, H, W]` tensor by 2.
pub(crate) fn spatial_max_pool(xs: &Tensor) -> Result<Tensor> {
    let (n, c, t, h, w) = xs.dims5()?;
    if h < 2 || w < 2 {
        return Ok(xs.clone());
    }
    let pooled = xs.reshape((n, c * t, h, w))?.max_pool2d(2)?;
    let (_, _, h, w) = pooled.dims4()?;
    Ok(pooled.reshape((n, c, t, h, w))?)
}
