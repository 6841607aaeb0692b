//! Non-local blocks (Wang et al., "Non-local Neural Networks").

use super::conv::{Conv3d, Conv3dConfig, ConvModule, NormConfig};
use super::spatial_max_pool;
use crate::params::{Param, ParamStore};
use crate::{Error, Result};
use candle::{Tensor, D};
use candle_nn::Init;
use serde::Deserialize;

const INIT_STD: f64 = 0.01;

/// How pairwise affinities between positions are computed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NonLocalMode {
    Gaussian,
    EmbeddedGaussian,
    DotProduct,
    Concatenation,
}

/// `non_local_cfg` of a backbone.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct NonLocalConfig {
    /// Max-pool the `g` and `phi` paths spatially by 2.
    pub sub_sample: bool,
    /// Divide embedded gaussian affinities by `sqrt(inter_channels)`.
    pub use_scale: bool,
    pub norm_cfg: Option<NormConfig>,
    pub mode: NonLocalMode,
    /// `inter_channels = in_channels / reduction`.
    pub reduction: usize,
}

impl Default for NonLocalConfig {
    fn default() -> Self {
        Self {
            sub_sample: false,
            use_scale: true,
            norm_cfg: None,
            mode: NonLocalMode::EmbeddedGaussian,
            reduction: 2,
        }
    }
}

struct Embedding {
    theta: Conv3d,
    phi: Conv3d,
}

/// A residual non-local block over `[N, C, T, H, W]` features.
///
/// The output projection is zero-initialised, so a freshly initialised block is the
/// identity.
pub struct NonLocal3d {
    g: Conv3d,
    embedding: Option<Embedding>,
    concat_project: Option<Param>,
    conv_out: ConvModule,
    cfg: NonLocalConfig,
    inter_channels: usize,
}

impl NonLocal3d {
    pub fn new(ps: &ParamStore, in_channels: usize, cfg: &NonLocalConfig) -> Result<Self> {
        if cfg.reduction == 0 {
            return Err(Error::Config("non_local_cfg.reduction must be positive".to_string()));
        }
        let inter_channels = (in_channels / cfg.reduction).max(1);
        let pointwise = Conv3dConfig::new([1, 1, 1]);
        let normal = Init::Randn {
            mean: 0.,
            stdev: INIT_STD,
        };

        let g = Conv3d::new(&ps.pp("g"), in_channels, inter_channels, pointwise, true, normal)?;
        let embedding = match cfg.mode {
            NonLocalMode::Gaussian => None,
            _ => Some(Embedding {
                theta: Conv3d::new(
                    &ps.pp("theta"),
                    in_channels,
                    inter_channels,
                    pointwise,
                    true,
                    normal,
                )?,
                phi: Conv3d::new(
                    &ps.pp("phi"),
                    in_channels,
                    inter_channels,
                    pointwise,
                    true,
                    normal,
                )?,
            }),
        };
        let concat_project = match cfg.mode {
            NonLocalMode::Concatenation => Some(ps.pp("concat_project").param(
                "weight",
                (2 * inter_channels, 1),
                normal,
            )?),
            _ => None,
        };
        let mut conv_out = ConvModule::new(
            &ps.pp("conv_out"),
            inter_channels,
            in_channels,
            pointwise,
            cfg.norm_cfg.as_ref(),
            false,
            normal,
        )?;
        conv_out.zero_init();

        Ok(Self {
            g,
            embedding,
            concat_project,
            conv_out,
            cfg: cfg.clone(),
            inter_channels,
        })
    }

    pub fn init_weights(&mut self) -> Result<()> {
        self.g.init_weights()?;
        if let Some(embedding) = &mut self.embedding {
            embedding.theta.init_weights()?;
            embedding.phi.init_weights()?;
        }
        if let Some(weight) = &self.concat_project {
            weight.reset()?;
        }
        self.conv_out.init_weights()
    }

    fn sub_sample(&self, xs: &Tensor) -> Result<Tensor> {
        if self.cfg.sub_sample {
            spatial_max_pool(xs)
        } else {
            Ok(xs.clone())
        }
    }

    /// `[N, C, T, H, W]` to `[N, THW, C]`.
    fn positions_last(xs: &Tensor) -> Result<Tensor> {
        Ok(xs.flatten_from(2)?.transpose(1, 2)?.contiguous()?)
    }

    fn pairwise(&self, theta_x: &Tensor, phi_x: &Tensor) -> Result<Tensor> {
        let affinity = theta_x.matmul(phi_x)?;
        let num_keys = phi_x.dim(D::Minus1)? as f64;
        let weights = match self.cfg.mode {
            NonLocalMode::Gaussian => candle_nn::ops::softmax(&affinity, D::Minus1)?,
            NonLocalMode::EmbeddedGaussian => {
                let affinity = if self.cfg.use_scale {
                    let scale = (theta_x.dim(D::Minus1)? as f64).sqrt();
                    affinity.affine(1. / scale, 0.)?
                } else {
                    affinity
                };
                candle_nn::ops::softmax(&affinity, D::Minus1)?
            }
            NonLocalMode::DotProduct => affinity.affine(1. / num_keys, 0.)?,
            NonLocalMode::Concatenation => {
                let Some(weight) = &self.concat_project else {
                    return Err(Error::Config("concatenation without projection".to_string()));
                };
                let ci = self.inter_channels;
                let w_theta = weight.tensor().narrow(0, 0, ci)?;
                let w_phi = weight.tensor().narrow(0, ci, ci)?.t()?.contiguous()?;
                let from_query = theta_x.broadcast_matmul(&w_theta)?;
                let from_key = w_phi.broadcast_matmul(phi_x)?;
                from_query
                    .broadcast_add(&from_key)?
                    .relu()?
                    .affine(1. / num_keys, 0.)?
            }
        };
        Ok(weights)
    }

    pub fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let (n, _c, t, h, w) = xs.dims5()?;

        let g_x = Self::positions_last(&self.sub_sample(&self.g.forward(xs)?)?)?;
        let (theta_x, phi_x) = match &self.embedding {
            None => (
                Self::positions_last(xs)?,
                self.sub_sample(xs)?.flatten_from(2)?.contiguous()?,
            ),
            Some(embedding) => (
                Self::positions_last(&embedding.theta.forward(xs)?)?,
                self.sub_sample(&embedding.phi.forward(xs)?)?
                    .flatten_from(2)?
                    .contiguous()?,
            ),
        };

        let weights = self.pairwise(&theta_x, &phi_x)?;
        let ys = weights
            .matmul(&g_x)?
            .transpose(1, 2)?
            .reshape((n, self.inter_channels, t, h, w))?;
        let ys = self.conv_out.forward_t(&ys, train)?;
        Ok(xs.add(&ys)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle::{DType, Device};
    use candle_nn::VarMap;

    fn block(cfg: &NonLocalConfig) -> Result<NonLocal3d> {
        let varmap = VarMap::new();
        let ps = ParamStore::new(&varmap, DType::F32, &Device::Cpu);
        let mut block = NonLocal3d::new(&ps, 8, cfg)?;
        block.init_weights()?;
        Ok(block)
    }

    #[test]
    fn fresh_block_is_identity_in_every_mode() -> Result<()> {
        let xs = Tensor::randn(0f32, 1., (2, 8, 2, 4, 4), &Device::Cpu)?;
        for mode in [
            NonLocalMode::Gaussian,
            NonLocalMode::EmbeddedGaussian,
            NonLocalMode::DotProduct,
            NonLocalMode::Concatenation,
        ] {
            let cfg = NonLocalConfig {
                sub_sample: true,
                mode,
                norm_cfg: Some(NormConfig::default()),
                ..Default::default()
            };
            let ys = block(&cfg)?.forward_t(&xs, false)?;
            assert_eq!(ys.dims(), xs.dims());
            let diff = (ys - &xs)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()?;
            assert!(diff < 1e-6, "{mode:?} changed its input by {diff}");
        }
        Ok(())
    }

    #[test]
    fn config_reads_snake_case_modes() -> Result<()> {
        let cfg: NonLocalConfig = serde_json::from_value(serde_json::json!({
            "sub_sample": true,
            "use_scale": false,
            "norm_cfg": {"type": "BN3d", "requires_grad": true},
            "mode": "dot_product",
        }))?;
        assert_eq!(cfg.mode, NonLocalMode::DotProduct);
        assert!(!cfg.use_scale);
        assert_eq!(cfg.reduction, 2);
        Ok(())
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let cfg: std::result::Result<NonLocalConfig, _> =
            serde_json::from_value(serde_json::json!({"mode": "dot_product", "zeros": true}));
        assert!(cfg.is_err());
    }
}
