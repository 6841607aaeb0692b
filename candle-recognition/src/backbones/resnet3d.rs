//! Inflated 3-D ResNet (I3D) built from basic blocks.

use super::conv::{Conv3dConfig, ConvModule, NormConfig, KAIMING_FAN_OUT};
use super::non_local::{NonLocal3d, NonLocalConfig};
use super::{spatial_max_pool, Backbone};
use crate::params::ParamStore;
use crate::{Error, Result};
use candle::Tensor;
use serde::Deserialize;

/// A per-stage switch, either one value for the whole stage or one value per block.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum StageFlags {
    Stage(usize),
    Blocks(Vec<usize>),
}

fn expand_flags(
    key: &str,
    flags: Option<&[StageFlags]>,
    stage_blocks: &[usize],
    default: bool,
) -> Result<Vec<Vec<bool>>> {
    let Some(flags) = flags else {
        return Ok(stage_blocks.iter().map(|&n| vec![default; n]).collect());
    };
    if flags.len() != stage_blocks.len() {
        return Err(Error::Config(format!(
            "{key} has {} stages, expected {}",
            flags.len(),
            stage_blocks.len()
        )));
    }
    flags
        .iter()
        .zip(stage_blocks)
        .enumerate()
        .map(|(stage, (flag, &n))| match flag {
            StageFlags::Stage(v) => Ok(vec![*v != 0; n]),
            StageFlags::Blocks(vs) if vs.len() == n => Ok(vs.iter().map(|v| *v != 0).collect()),
            StageFlags::Blocks(vs) => Err(Error::Config(format!(
                "{key}[{stage}] has {} entries, expected {n}",
                vs.len()
            ))),
        })
        .collect()
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ResNet3dConfig {
    pub in_channels: usize,
    pub base_channels: usize,
    /// Number of basic blocks per stage. Stage `i` has `base_channels * 2^i` channels and
    /// every stage after the first halves the spatial size.
    pub stage_blocks: Vec<usize>,
    pub conv1_kernel: [usize; 3],
    /// `[temporal, spatial]` stride of the stem convolution.
    pub conv1_stride: [usize; 2],
    pub pool1: bool,
    /// Whether blocks use 3x3x3 (inflated) or 1x3x3 kernels. Defaults to inflated.
    pub inflate: Option<Vec<StageFlags>>,
    /// Blocks followed by a non-local block. Defaults to none.
    pub non_local: Option<Vec<StageFlags>>,
    pub non_local_cfg: NonLocalConfig,
    pub norm_cfg: NormConfig,
    /// Zero the last norm of every residual branch at init.
    pub zero_init_residual: bool,
}

impl Default for ResNet3dConfig {
    fn default() -> Self {
        Self {
            in_channels: 3,
            base_channels: 16,
            stage_blocks: vec![1, 1, 1, 1],
            conv1_kernel: [3, 7, 7],
            conv1_stride: [1, 2],
            pool1: true,
            inflate: None,
            non_local: None,
            non_local_cfg: NonLocalConfig::default(),
            norm_cfg: NormConfig::default(),
            zero_init_residual: true,
        }
    }
}

struct BasicBlock3d {
    conv1: ConvModule,
    conv2: ConvModule,
    downsample: Option<ConvModule>,
    non_local: Option<NonLocal3d>,
}

impl BasicBlock3d {
    #[allow(clippy::too_many_arguments)]
    fn new(
        ps: &ParamStore,
        in_channels: usize,
        planes: usize,
        spatial_stride: usize,
        inflate: bool,
        non_local: bool,
        cfg: &ResNet3dConfig,
    ) -> Result<Self> {
        let (kt, pt) = if inflate { (3, 1) } else { (1, 0) };
        let norm = Some(&cfg.norm_cfg);
        let conv1 = ConvModule::new(
            &ps.pp("conv1"),
            in_channels,
            planes,
            Conv3dConfig::new([kt, 3, 3])
                .stride([1, spatial_stride, spatial_stride])
                .padding([pt, 1, 1]),
            norm,
            true,
            KAIMING_FAN_OUT,
        )?;
        let mut conv2 = ConvModule::new(
            &ps.pp("conv2"),
            planes,
            planes,
            Conv3dConfig::new([kt, 3, 3]).padding([pt, 1, 1]),
            norm,
            false,
            KAIMING_FAN_OUT,
        )?;
        if cfg.zero_init_residual {
            conv2.zero_init();
        }
        let downsample = if spatial_stride != 1 || in_channels != planes {
            Some(ConvModule::new(
                &ps.pp("downsample"),
                in_channels,
                planes,
                Conv3dConfig::new([1, 1, 1]).stride([1, spatial_stride, spatial_stride]),
                norm,
                false,
                KAIMING_FAN_OUT,
            )?)
        } else {
            None
        };
        let non_local = if non_local {
            Some(NonLocal3d::new(
                &ps.pp("non_local_block"),
                planes,
                &cfg.non_local_cfg,
            )?)
        } else {
            None
        };
        Ok(Self {
            conv1,
            conv2,
            downsample,
            non_local,
        })
    }

    fn init_weights(&mut self) -> Result<()> {
        self.conv1.init_weights()?;
        self.conv2.init_weights()?;
        if let Some(downsample) = &mut self.downsample {
            downsample.init_weights()?;
        }
        if let Some(non_local) = &mut self.non_local {
            non_local.init_weights()?;
        }
        Ok(())
    }

    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let ys = self.conv1.forward_t(xs, train)?;
        let ys = self.conv2.forward_t(&ys, train)?;
        let identity = match &self.downsample {
            Some(downsample) => downsample.forward_t(xs, train)?,
            None => xs.clone(),
        };
        let ys = ys.add(&identity)?.relu()?;
        match &self.non_local {
            Some(non_local) => non_local.forward_t(&ys, train),
            None => Ok(ys),
        }
    }
}

/// Takes `[N, C, T, H, W]` clips and returns `[N, C', T', H', W']` features.
pub struct ResNet3d {
    stem: ConvModule,
    pool1: bool,
    blocks: Vec<BasicBlock3d>,
    out_channels: usize,
}

impl ResNet3d {
    pub fn new(ps: &ParamStore, cfg: &ResNet3dConfig) -> Result<Self> {
        if cfg.stage_blocks.is_empty() {
            return Err(Error::Config("stage_blocks must name at least one stage".to_string()));
        }
        let inflate = expand_flags("inflate", cfg.inflate.as_deref(), &cfg.stage_blocks, true)?;
        let non_local =
            expand_flags("non_local", cfg.non_local.as_deref(), &cfg.stage_blocks, false)?;

        let [kt, kh, kw] = cfg.conv1_kernel;
        let [st, ss] = cfg.conv1_stride;
        let stem = ConvModule::new(
            &ps.pp("conv1"),
            cfg.in_channels,
            cfg.base_channels,
            Conv3dConfig::new([kt, kh, kw])
                .stride([st, ss, ss])
                .padding([kt / 2, kh / 2, kw / 2]),
            Some(&cfg.norm_cfg),
            true,
            KAIMING_FAN_OUT,
        )?;

        let mut blocks = Vec::new();
        let mut in_channels = cfg.base_channels;
        let mut planes = cfg.base_channels;
        for (stage, &num_blocks) in cfg.stage_blocks.iter().enumerate() {
            let ps_stage = ps.pp(format!("layer{}", stage + 1));
            for block in 0..num_blocks {
                let spatial_stride = if stage > 0 && block == 0 { 2 } else { 1 };
                blocks.push(BasicBlock3d::new(
                    &ps_stage.pp(block),
                    in_channels,
                    planes,
                    spatial_stride,
                    inflate[stage][block],
                    non_local[stage][block],
                    cfg,
                )?);
                in_channels = planes;
            }
            planes *= 2;
        }
        tracing::debug!(
            blocks = blocks.len(),
            non_local = non_local.iter().flatten().filter(|v| **v).count(),
            out_channels = in_channels,
            "built ResNet3d"
        );
        Ok(Self {
            stem,
            pool1: cfg.pool1,
            blocks,
            out_channels: in_channels,
        })
    }
}

impl Backbone for ResNet3d {
    fn init_weights(&mut self) -> Result<()> {
        self.stem.init_weights()?;
        for block in self.blocks.iter_mut() {
            block.init_weights()?;
        }
        Ok(())
    }

    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let mut ys = self.stem.forward_t(xs, train)?;
        if self.pool1 {
            ys = spatial_max_pool(&ys)?;
        }
        for block in self.blocks.iter() {
            ys = block.forward_t(&ys, train)?;
        }
        Ok(ys)
    }

    fn out_channels(&self) -> usize {
        self.out_channels
    }
}
