use candle::utils::{cuda_is_available, metal_is_available};
use candle::{DType, Device, Tensor};
use candle_recognition::{DataBatch, Error, Result};
use serde_json::Value;

pub fn device(cpu: bool) -> Result<Device> {
    if cpu {
        Ok(Device::Cpu)
    } else if cuda_is_available() {
        Ok(Device::new_cuda(0)?)
    } else if metal_is_available() {
        Ok(Device::new_metal(0)?)
    } else {
        #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
        {
            println!(
                "Running on CPU, to run on GPU(metal), build this example with `--features metal`"
            );
        }
        #[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
        {
            println!("Running on CPU, to run on GPU, build this example with `--features cuda`");
        }
        Ok(Device::Cpu)
    }
}

/// Shape of the generated clips.
#[derive(Clone, Copy, Debug)]
pub struct ClipShape {
    pub num_clips: usize,
    pub clip_len: usize,
    pub size: usize,
}

/// Noisy clips whose brightness encodes the class, `[N, clips, 3, T, H, W]`, along with
/// their labels. Video `i` belongs to class `i % num_classes`.
pub fn synthetic_clips(
    num_videos: usize,
    num_classes: usize,
    shape: ClipShape,
    device: &Device,
) -> Result<(Tensor, Tensor)> {
    let labels: Vec<u32> = (0..num_videos).map(|i| (i % num_classes) as u32).collect();
    let span = num_classes.saturating_sub(1).max(1) as f32;
    let shift: Vec<f32> = labels.iter().map(|&c| 2. * c as f32 / span - 1.).collect();
    let shift = Tensor::new(shift.as_slice(), device)?.reshape((num_videos, 1, 1, 1, 1, 1))?;
    let noise = Tensor::randn(
        0f32,
        0.5,
        (num_videos, shape.num_clips, 3, shape.clip_len, shape.size, shape.size),
        device,
    )?;
    let imgs = noise.broadcast_add(&shift)?.to_dtype(DType::F32)?;
    Ok((imgs, Tensor::new(labels.as_slice(), device)?))
}

/// Splits videos into batches of `batch_size`, dropping the remainder.
pub fn into_batches(imgs: &Tensor, labels: &Tensor, batch_size: usize) -> Result<Vec<DataBatch>> {
    let num_batches = imgs.dim(0)? / batch_size.max(1);
    let mut batches = Vec::with_capacity(num_batches);
    for idx in 0..num_batches {
        let start = idx * batch_size;
        batches.push(DataBatch::new(
            imgs.narrow(0, start, batch_size)?,
            Some(labels.narrow(0, start, batch_size)?),
        )?);
    }
    Ok(batches)
}

const OPTIMIZERS: &[&str] = &["SGD", "AdamW"];

/// The `optimizer` section of an experiment config.
#[derive(Clone, Debug, PartialEq)]
pub enum OptimizerChoice {
    /// candle-nn's SGD has neither momentum nor weight decay, so those keys are reported
    /// back as ignored.
    Sgd { lr: f64, ignored: Vec<String> },
    AdamW { lr: f64, weight_decay: f64 },
}

/// Reads `optimizer.type`, `lr`, `momentum` and `weight_decay`. A missing section is
/// SGD with a learning rate of 0.01.
pub fn optimizer_choice(cfg: &Value) -> Result<OptimizerChoice> {
    let section = &cfg["optimizer"];
    let lr = section["lr"].as_f64().unwrap_or(0.01);
    let weight_decay = section["weight_decay"].as_f64().unwrap_or(0.0);
    match section["type"].as_str().unwrap_or("SGD") {
        "SGD" => {
            let mut ignored = Vec::new();
            if section["momentum"].as_f64().is_some_and(|m| m != 0.0) {
                ignored.push("momentum".to_string());
            }
            if weight_decay != 0.0 {
                ignored.push("weight_decay".to_string());
            }
            Ok(OptimizerChoice::Sgd { lr, ignored })
        }
        "AdamW" => Ok(OptimizerChoice::AdamW { lr, weight_decay }),
        other => Err(Error::UnsupportedValue {
            key: "optimizer.type".to_string(),
            value: other.to_string(),
            supported: format!("{OPTIMIZERS:?}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sgd_reports_what_it_ignores() -> Result<()> {
        let cfg = json!({"optimizer": {"type": "SGD", "lr": 0.1, "momentum": 0.9, "weight_decay": 0.0001}});
        assert_eq!(
            optimizer_choice(&cfg)?,
            OptimizerChoice::Sgd {
                lr: 0.1,
                ignored: vec!["momentum".to_string(), "weight_decay".to_string()],
            }
        );
        let plain = json!({"optimizer": {"type": "SGD", "lr": 0.1}});
        assert_eq!(
            optimizer_choice(&plain)?,
            OptimizerChoice::Sgd {
                lr: 0.1,
                ignored: vec![],
            }
        );
        Ok(())
    }

    #[test]
    fn adamw_and_unknown_types() -> Result<()> {
        let cfg = json!({"optimizer": {"type": "AdamW", "lr": 0.001, "weight_decay": 0.05}});
        assert_eq!(
            optimizer_choice(&cfg)?,
            OptimizerChoice::AdamW {
                lr: 0.001,
                weight_decay: 0.05,
            }
        );
        let err = optimizer_choice(&json!({"optimizer": {"type": "Lamb"}})).err();
        assert!(matches!(err, Some(Error::UnsupportedValue { .. })));
        Ok(())
    }
}
