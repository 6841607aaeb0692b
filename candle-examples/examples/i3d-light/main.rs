// Trains a small non-local I3D on synthetic clips. Brightness encodes the class, so
// validation accuracy should approach 100%. Pass `--cfg-options optimizer.type=AdamW` for
// faster convergence than the config's SGD.
#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

#[cfg(feature = "accelerate")]
extern crate accelerate_src;

use candle_nn::{Optimizer, VarMap};
use candle_recognition::config::{self, apply_overrides, parse_override};
use candle_recognition::{build_model, EarlyStopping, ModelCheckpoint, Mode, Trainer, TrainerConfig};
use candle_recognition_examples::{
    device, into_batches, optimizer_choice, synthetic_clips, ClipShape, OptimizerChoice,
};
use clap::Parser;
use rand::prelude::*;
use rand::rng;
use serde_json::json;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Experiment config.
    #[arg(
        long,
        default_value = concat!(
            env!("CARGO_MANIFEST_DIR"),
            "/../candle-recognition/configs/recognition/i3d/",
            "i3d_nl_embedded_gaussian_r_tiny_32x2x1_100e_8xb8_kinetics400_rgb.json"
        )
    )]
    config: PathBuf,

    /// Overrides such as `model.backbone.non_local_cfg.mode=dot_product`.
    #[arg(long, num_args = 1..)]
    cfg_options: Vec<String>,

    /// Run on CPU rather than on GPU.
    #[arg(long)]
    cpu: bool,

    #[arg(long, default_value_t = 4)]
    num_classes: usize,

    #[arg(long, default_value_t = 5)]
    epochs: usize,

    #[arg(long, default_value_t = 64)]
    num_videos: usize,

    #[arg(long, default_value_t = 8)]
    batch_size: usize,

    #[arg(long, default_value_t = 8)]
    clip_len: usize,

    #[arg(long, default_value_t = 32)]
    size: usize,

    /// Where to save the best checkpoint.
    #[arg(long)]
    work_dir: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();
    let dev = device(args.cpu)?;

    let mut cfg = config::load(&args.config)?;
    let mut overrides = vec![
        ("model.cls_head.num_classes".to_string(), json!(args.num_classes)),
        ("total_epochs".to_string(), json!(args.epochs)),
        ("evaluation.interval".to_string(), json!(1)),
        ("evaluation.topk".to_string(), json!([1])),
        ("log_config.interval".to_string(), json!(4)),
    ];
    for option in args.cfg_options.iter() {
        overrides.push(parse_override(option)?);
    }
    apply_overrides(&mut cfg, overrides)?;

    let varmap = VarMap::new();
    let model = build_model(&cfg, &varmap, &dev)?;
    let shape = ClipShape {
        num_clips: 1,
        clip_len: args.clip_len,
        size: args.size,
    };
    let (train_imgs, train_labels) = synthetic_clips(args.num_videos, args.num_classes, shape, &dev)?;
    let (val_imgs, val_labels) = synthetic_clips(args.num_videos / 4, args.num_classes, shape, &dev)?;
    let mut train_batches = into_batches(&train_imgs, &train_labels, args.batch_size)?;
    train_batches.shuffle(&mut rng());
    let val_batches = into_batches(&val_imgs, &val_labels, args.batch_size)?;

    let config = TrainerConfig::from_config(&cfg)?.device(dev.clone());
    let mut trainer = Trainer::new(config).with_callback(
        EarlyStopping::new()
            .monitor("val/top1_acc")
            .patience(3)
            .mode(Mode::Max),
    );
    if let Some(work_dir) = &args.work_dir {
        trainer = trainer.with_callback(ModelCheckpoint::new(varmap.clone(), work_dir));
    }

    match optimizer_choice(&cfg)? {
        OptimizerChoice::Sgd { lr, ignored } => {
            if !ignored.is_empty() {
                tracing::warn!(?ignored, "plain SGD ignores these optimizer settings");
            }
            let mut optimizer = candle_nn::SGD::new(model.parameters(), lr)?;
            trainer.fit(model.as_ref(), &mut optimizer, &train_batches, Some(&val_batches))?;
        }
        OptimizerChoice::AdamW { lr, weight_decay } => {
            let params = candle_nn::ParamsAdamW {
                lr,
                weight_decay,
                ..Default::default()
            };
            let mut optimizer = candle_nn::AdamW::new(model.parameters(), params)?;
            trainer.fit(model.as_ref(), &mut optimizer, &train_batches, Some(&val_batches))?;
        }
    }

    let metrics = trainer.validate(model.as_ref(), &val_batches)?;
    println!("final validation: {metrics}");
    Ok(())
}
