use crate::params::{Param, ParamStore};
use crate::{Error, Result};
use candle::Tensor;
use candle_nn::init::{FanInOut, NonLinearity, NormalOrUniform};
use candle_nn::{Init, ModuleT};
use serde::Deserialize;

pub(crate) const KAIMING_FAN_OUT: Init = Init::Kaiming {
    dist: NormalOrUniform::Normal,
    fan: FanInOut::FanOut,
    non_linearity: NonLinearity::ReLU,
};

const NORM_TYPES: &[&str] = &["BN3d", "BN", "BN2d", "SyncBN"];

fn default_true() -> bool {
    true
}

fn default_eps() -> f64 {
    1e-5
}

/// `norm_cfg` of a convolution block.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NormConfig {
    #[serde(rename = "type")]
    pub kind: String,
    /// When false the affine parameters are detached from the graph.
    #[serde(default = "default_true")]
    pub requires_grad: bool,
    #[serde(default = "default_eps")]
    pub eps: f64,
}

impl Default for NormConfig {
    fn default() -> Self {
        Self {
            kind: "BN3d".to_string(),
            requires_grad: true,
            eps: default_eps(),
        }
    }
}

/// Batch normalisation over dimension 1 of a tensor of any rank.
pub struct BatchNorm {
    weight: Param,
    bias: Param,
    inner: candle_nn::BatchNorm,
}

impl BatchNorm {
    pub fn new(ps: &ParamStore, num_features: usize, cfg: &NormConfig) -> Result<Self> {
        if !NORM_TYPES.contains(&cfg.kind.as_str()) {
            return Err(Error::unsupported("norm_cfg.type", &cfg.kind, NORM_TYPES));
        }
        let weight = ps.param("weight", num_features, Init::Const(1.))?;
        let bias = ps.param("bias", num_features, Init::Const(0.))?;
        let (w, b) = if cfg.requires_grad {
            (weight.tensor().clone(), bias.tensor().clone())
        } else {
            (weight.tensor().detach(), bias.tensor().detach())
        };
        // The layer updates these vars in place, so the var map sees the running statistics.
        let running_mean = ps.buffer("running_mean", num_features, Init::Const(0.))?;
        let running_var = ps.buffer("running_var", num_features, Init::Const(1.))?;
        let inner = candle_nn::BatchNorm::new(
            num_features,
            running_mean.as_tensor().clone(),
            running_var.as_tensor().clone(),
            w,
            b,
            cfg.eps,
        )?;
        Ok(Self {
            weight,
            bias,
            inner,
        })
    }

    /// Makes the next `init_weights` set the scale to zero.
    pub fn zero_init(&mut self) {
        self.weight.set_init(Init::Const(0.));
    }

    pub fn init_weights(&mut self) -> Result<()> {
        self.weight.reset()?;
        self.bias.reset()
    }

    pub fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        Ok(self.inner.forward_t(xs, train)?)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Conv3dConfig {
    /// `[t, h, w]`. The spatial kernel has to be square.
    pub kernel: [usize; 3],
    pub stride: [usize; 3],
    pub padding: [usize; 3],
}

impl Conv3dConfig {
    pub fn new(kernel: [usize; 3]) -> Self {
        Self {
            kernel,
            stride: [1, 1, 1],
            padding: [kernel[0] / 2, kernel[1] / 2, kernel[2] / 2],
        }
    }

    pub fn stride(mut self, stride: [usize; 3]) -> Self {
        self.stride = stride;
        self
    }

    pub fn padding(mut self, padding: [usize; 3]) -> Self {
        self.padding = padding;
        self
    }
}

/// A 3-D convolution evaluated as a sum of 2-D convolutions, one per temporal tap.
pub struct Conv3d {
    weight: Param,
    bias: Option<Param>,
    cfg: Conv3dConfig,
}

impl Conv3d {
    pub fn new(
        ps: &ParamStore,
        in_channels: usize,
        out_channels: usize,
        cfg: Conv3dConfig,
        bias: bool,
        init: Init,
    ) -> Result<Self> {
        let [kt, kh, kw] = cfg.kernel;
        if kt == 0 || kh == 0 || kh != kw {
            return Err(Error::Config(format!(
                "conv kernel {:?} must be non-empty with a square spatial part",
                cfg.kernel
            )));
        }
        if cfg.stride.contains(&0) || cfg.stride[1] != cfg.stride[2] || cfg.padding[1] != cfg.padding[2]
        {
            return Err(Error::Config(format!(
                "conv stride {:?} and padding {:?} must be square in space",
                cfg.stride, cfg.padding
            )));
        }
        let weight = ps.param("weight", (out_channels, in_channels, kt, kh, kw), init)?;
        let bias = if bias {
            Some(ps.param("bias", out_channels, Init::Const(0.))?)
        } else {
            None
        };
        Ok(Self { weight, bias, cfg })
    }

    pub fn zero_init(&mut self) {
        self.weight.set_init(Init::Const(0.));
    }

    pub fn init_weights(&mut self) -> Result<()> {
        self.weight.reset()?;
        match &self.bias {
            Some(bias) => bias.reset(),
            None => Ok(()),
        }
    }

    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let (n, c, t, h, w) = xs.dims5()?;
        let [kt, _, _] = self.cfg.kernel;
        let [st, ss, _] = self.cfg.stride;
        let [pt, ps, _] = self.cfg.padding;
        if t + 2 * pt < kt {
            return Err(Error::InvalidArgument(format!(
                "{t} frames are too few for a temporal kernel of {kt}"
            )));
        }
        let t_out = (t + 2 * pt - kt) / st + 1;
        let xs = if pt > 0 {
            xs.pad_with_zeros(2, pt, pt)?
        } else {
            xs.clone()
        };

        let mut out: Option<Tensor> = None;
        for k in 0..kt {
            let frames = if st == 1 {
                xs.narrow(2, k, t_out)?
            } else {
                let idx: Vec<u32> = (0..t_out).map(|i| (k + i * st) as u32).collect();
                xs.index_select(&Tensor::new(idx.as_slice(), xs.device())?, 2)?
            };
            let frames = frames.transpose(1, 2)?.reshape((n * t_out, c, h, w))?;
            let kernel = self.weight.tensor().narrow(2, k, 1)?.squeeze(2)?.contiguous()?;
            let ys = frames.conv2d(&kernel, ps, ss, 1, 1)?;
            out = Some(match out {
                None => ys,
                Some(acc) => acc.add(&ys)?,
            });
        }
        let Some(out) = out else {
            return Err(Error::Config("empty temporal kernel".to_string()));
        };

        let (_, c_out, h_out, w_out) = out.dims4()?;
        let out = out
            .reshape((n, t_out, c_out, h_out, w_out))?
            .transpose(1, 2)?
            .contiguous()?;
        match &self.bias {
            Some(bias) => Ok(out.broadcast_add(&bias.tensor().reshape((1, c_out, 1, 1, 1))?)?),
            None => Ok(out),
        }
    }
}

/// Convolution followed by an optional norm and an optional ReLU.
pub struct ConvModule {
    conv: Conv3d,
    norm: Option<BatchNorm>,
    relu: bool,
}

impl ConvModule {
    /// The convolution carries a bias only when no norm follows it.
    pub fn new(
        ps: &ParamStore,
        in_channels: usize,
        out_channels: usize,
        cfg: Conv3dConfig,
        norm_cfg: Option<&NormConfig>,
        relu: bool,
        init: Init,
    ) -> Result<Self> {
        let conv = Conv3d::new(
            &ps.pp("conv"),
            in_channels,
            out_channels,
            cfg,
            norm_cfg.is_none(),
            init,
        )?;
        let norm = match norm_cfg {
            Some(norm_cfg) => Some(BatchNorm::new(&ps.pp("bn"), out_channels, norm_cfg)?),
            None => None,
        };
        Ok(Self { conv, norm, relu })
    }

    /// Zeroes the block output at init: the norm scale when there is a norm, the conv
    /// weight otherwise.
    pub fn zero_init(&mut self) {
        match &mut self.norm {
            Some(norm) => norm.zero_init(),
            None => self.conv.zero_init(),
        }
    }

    pub fn init_weights(&mut self) -> Result<()> {
        self.conv.init_weights()?;
        match &mut self.norm {
            Some(norm) => norm.init_weights(),
            None => Ok(()),
        }
    }

    pub fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let mut ys = self.conv.forward(xs)?;
        if let Some(norm) = &self.norm {
            ys = norm.forward_t(&ys, train)?;
        }
        if self.relu {
            ys = ys.relu()?;
        }
        Ok(ys)
    }
}
