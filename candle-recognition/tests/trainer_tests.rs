#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

#[cfg(feature = "accelerate")]
extern crate accelerate_src;

use anyhow::Result;
use candle::{DType, Device, Tensor};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarMap};
use candle_recognition::{
    build_model, Callback, DataBatch, EarlyStopping, EpochMetrics, LocalGroup, Mode,
    ModelCheckpoint, ProcessGroup, Recognizer, SingleProcess, TrainStepOutput, Trainer,
    TrainerConfig,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn tiny_experiment() -> Value {
    json!({
        "model": {
            "type": "Recognizer3D",
            "backbone": {
                "type": "ResNet3d",
                "base_channels": 4,
                "stage_blocks": [1],
                "conv1_kernel": [1, 3, 3],
                "conv1_stride": [1, 1],
                "pool1": false,
            },
            "cls_head": {
                "type": "I3DHead",
                "num_classes": 2,
                "in_channels": 4,
                "dropout_ratio": 0.0,
                "topk": [1],
            },
        },
        "test_cfg": {"average_clips": "prob"},
    })
}

fn tiny_model(varmap: &VarMap) -> Result<Box<dyn Recognizer>> {
    Ok(build_model(&tiny_experiment(), varmap, &Device::Cpu)?)
}

fn values(varmap: &VarMap, key: &str) -> Result<Vec<f32>> {
    let data = varmap.data().lock().unwrap();
    Ok(data[key].flatten_all()?.to_vec1::<f32>()?)
}

fn max_abs_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
    Ok((a - b)?.abs()?.max_all()?.to_scalar::<f32>()?)
}

fn checkpoint_files(dir: &std::path::Path) -> Result<Vec<String>> {
    let files = std::fs::read_dir(dir)?
        .map(|entry| entry.map(|e| e.file_name().to_string_lossy().into_owned()))
        .collect::<std::io::Result<_>>()?;
    Ok(files)
}

/// Videos of class 1 are brighter than videos of class 0.
fn batches(num_batches: usize, offset: f32) -> Result<Vec<DataBatch>> {
    let device = Device::Cpu;
    let mut out = Vec::with_capacity(num_batches);
    for _ in 0..num_batches {
        let noise = Tensor::randn(0f32, 0.1, (4, 1, 3, 2, 6, 6), &device)?;
        let shift = Tensor::new(&[-1f32, 1., -1., 1.], &device)?
            .affine(1., offset as f64)?
            .reshape((4, 1, 1, 1, 1, 1))?;
        let imgs = noise.broadcast_add(&shift)?;
        let labels = Tensor::new(&[0u32, 1, 0, 1], &device)?;
        out.push(DataBatch::new(imgs, Some(labels))?);
    }
    Ok(out)
}

fn optimizer(model: &dyn Recognizer) -> Result<AdamW> {
    let params = ParamsAdamW {
        lr: 0.01,
        ..Default::default()
    };
    Ok(AdamW::new(model.parameters(), params)?)
}

#[test]
fn trainer_reduces_the_loss() -> Result<()> {
    let varmap = VarMap::new();
    let model = tiny_model(&varmap)?;
    let mut optimizer = optimizer(model.as_ref())?;
    let train = batches(2, 0.)?;

    let config = TrainerConfig::new().max_epochs(30).log_every_n_steps(0);
    let mut trainer = Trainer::new(config);
    trainer.fit(model.as_ref(), &mut optimizer, &train, None)?;

    let history = trainer.history();
    assert_eq!(history.len(), 30);
    let first = history[0].get("train/loss").expect("loss logged");
    let last = history[29].get("train/loss").expect("loss logged");
    assert!(last < first, "loss went from {first} to {last}");
    assert!(history.iter().all(|m| m.val.is_none()));
    Ok(())
}

#[test]
fn trainer_with_validation() -> Result<()> {
    let varmap = VarMap::new();
    let model = tiny_model(&varmap)?;
    let mut optimizer = optimizer(model.as_ref())?;
    let train = batches(2, 0.)?;
    let val = batches(1, 0.)?;

    let config = TrainerConfig::new()
        .max_epochs(4)
        .log_every_n_steps(1)
        .eval_topk([1])
        .validate_every_n_epochs(2);
    let mut trainer = Trainer::new(config);
    trainer.fit(model.as_ref(), &mut optimizer, &train, Some(&val))?;

    let validated: Vec<bool> = trainer.history().iter().map(|m| m.val.is_some()).collect();
    assert_eq!(validated, vec![false, true, false, true]);

    let val_metrics = trainer.validate(model.as_ref(), &val)?;
    let keys: Vec<_> = val_metrics.keys().collect();
    assert_eq!(keys, vec!["top1_acc", "mean_class_accuracy"]);
    let top1 = val_metrics.get("top1_acc").expect("top1");
    assert!((0.0..=1.0).contains(&top1));
    Ok(())
}

#[test]
fn validation_needs_labels() -> Result<()> {
    let model = tiny_model(&VarMap::new())?;
    let imgs = Tensor::zeros((1, 1, 3, 2, 6, 6), DType::F32, &Device::Cpu)?;
    let unlabelled = vec![DataBatch::new(imgs, None)?];
    let trainer = Trainer::new(TrainerConfig::new());
    assert!(trainer.validate(model.as_ref(), &unlabelled).is_err());
    Ok(())
}

struct CountingCallback {
    epoch_starts: Arc<AtomicUsize>,
    epoch_ends: Arc<AtomicUsize>,
    batch_ends: Arc<AtomicUsize>,
    samples: Arc<AtomicUsize>,
}

impl CountingCallback {
    fn new() -> Self {
        Self {
            epoch_starts: Arc::new(AtomicUsize::new(0)),
            epoch_ends: Arc::new(AtomicUsize::new(0)),
            batch_ends: Arc::new(AtomicUsize::new(0)),
            samples: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl Callback for CountingCallback {
    fn on_epoch_start(&mut self, _trainer: &Trainer, _epoch: usize) -> candle_recognition::Result<()> {
        self.epoch_starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn on_epoch_end(
        &mut self,
        _trainer: &Trainer,
        _epoch: usize,
        _metrics: &EpochMetrics,
    ) -> candle_recognition::Result<()> {
        self.epoch_ends.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn on_train_batch_end(
        &mut self,
        _trainer: &Trainer,
        _batch_idx: usize,
        output: &TrainStepOutput,
    ) -> candle_recognition::Result<()> {
        self.batch_ends.fetch_add(1, Ordering::SeqCst);
        self.samples.fetch_add(output.num_samples, Ordering::SeqCst);
        Ok(())
    }
}

#[test]
fn trainer_callback_invocation() -> Result<()> {
    let model = tiny_model(&VarMap::new())?;
    let mut optimizer = optimizer(model.as_ref())?;
    let train = batches(2, 0.)?;

    let callback = CountingCallback::new();
    let epoch_starts = callback.epoch_starts.clone();
    let epoch_ends = callback.epoch_ends.clone();
    let batch_ends = callback.batch_ends.clone();
    let samples = callback.samples.clone();

    let config = TrainerConfig::new().max_epochs(5).log_every_n_steps(0);
    let mut trainer = Trainer::new(config).with_callback(callback);
    trainer.fit(model.as_ref(), &mut optimizer, &train, None)?;

    assert_eq!(epoch_starts.load(Ordering::SeqCst), 5);
    assert_eq!(epoch_ends.load(Ordering::SeqCst), 5);
    assert_eq!(batch_ends.load(Ordering::SeqCst), 10); // 2 batches * 5 epochs
    assert_eq!(samples.load(Ordering::SeqCst), 40);

    Ok(())
}

struct StopAfter {
    stop_at_epoch: usize,
    current_epoch: usize,
}

impl Callback for StopAfter {
    fn on_epoch_end(
        &mut self,
        _trainer: &Trainer,
        _epoch: usize,
        _metrics: &EpochMetrics,
    ) -> candle_recognition::Result<()> {
        self.current_epoch += 1;
        Ok(())
    }

    fn should_stop(&self) -> bool {
        self.current_epoch >= self.stop_at_epoch
    }
}

#[test]
fn trainer_early_stopping() -> Result<()> {
    let model = tiny_model(&VarMap::new())?;
    let mut optimizer = optimizer(model.as_ref())?;
    let train = batches(1, 0.)?;

    let counting = CountingCallback::new();
    let epoch_count = counting.epoch_starts.clone();
    let stopper = StopAfter {
        stop_at_epoch: 3,
        current_epoch: 0,
    };

    let config = TrainerConfig::new().max_epochs(100).log_every_n_steps(0);
    let mut trainer = Trainer::new(config)
        .with_callback(counting)
        .with_callback(stopper);
    trainer.fit(model.as_ref(), &mut optimizer, &train, None)?;

    assert_eq!(epoch_count.load(Ordering::SeqCst), 3);
    assert_eq!(trainer.history().len(), 3);

    Ok(())
}

#[test]
fn builtin_early_stopping_on_a_plateau() -> Result<()> {
    let model = tiny_model(&VarMap::new())?;
    let mut optimizer = optimizer(model.as_ref())?;
    let train = batches(1, 0.)?;
    let val = batches(1, 0.)?;

    // Accuracy never improves by more than one, so only the first epoch counts as progress.
    let early_stopping = EarlyStopping::new()
        .monitor("val/top1_acc")
        .patience(2)
        .min_delta(1.0)
        .mode(Mode::Max);

    let config = TrainerConfig::new()
        .max_epochs(50)
        .log_every_n_steps(0)
        .eval_topk([1]);
    let mut trainer = Trainer::new(config).with_callback(early_stopping);
    trainer.fit(model.as_ref(), &mut optimizer, &train, Some(&val))?;

    assert_eq!(trainer.history().len(), 3);
    Ok(())
}

#[test]
fn builtin_early_stopping_follows_a_moving_loss() -> Result<()> {
    let model = tiny_model(&VarMap::new())?;
    let mut optimizer = optimizer(model.as_ref())?;
    let train = batches(1, 0.)?;

    let patience = 2;
    let early_stopping = EarlyStopping::new()
        .monitor("train/loss")
        .patience(patience)
        .mode(Mode::Min);
    let config = TrainerConfig::new().max_epochs(60).log_every_n_steps(0);
    let mut trainer = Trainer::new(config).with_callback(early_stopping);
    trainer.fit(model.as_ref(), &mut optimizer, &train, None)?;

    let losses: Vec<f64> = trainer
        .history()
        .iter()
        .map(|m| m.get("train/loss").expect("loss logged"))
        .collect();

    // Replays the stopping rule over the logged losses.
    let mut best = losses[0];
    let mut best_epoch = 0;
    let mut waited = 0;
    let mut expected_stop = None;
    for (epoch, &loss) in losses.iter().enumerate().skip(1) {
        if loss < best {
            best = loss;
            best_epoch = epoch;
            waited = 0;
        } else {
            waited += 1;
            if waited >= patience {
                expected_stop = Some(epoch);
                break;
            }
        }
    }
    assert!(best_epoch > 0, "the loss never improved: {losses:?}");
    match expected_stop {
        Some(epoch) => assert_eq!(losses.len(), epoch + 1, "{losses:?}"),
        None => assert_eq!(losses.len(), 60),
    }
    Ok(())
}

#[test]
fn checkpoint_keeps_the_best_file() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let varmap = VarMap::new();
    let model = tiny_model(&varmap)?;
    let mut optimizer = optimizer(model.as_ref())?;
    let train = batches(1, 0.)?;

    let checkpoint = ModelCheckpoint::new(varmap.clone(), dir.path())
        .monitor("train/loss")
        .mode(Mode::Min)
        .save_top_k(1);
    let config = TrainerConfig::new().max_epochs(6).log_every_n_steps(0);
    let mut trainer = Trainer::new(config).with_callback(checkpoint);
    trainer.fit(model.as_ref(), &mut optimizer, &train, None)?;

    let files = checkpoint_files(dir.path())?;
    assert_eq!(files.len(), 1, "{files:?}");
    assert!(files[0].contains("train_loss"));
    assert!(files[0].ends_with(".safetensors"));

    let mut restored = VarMap::new();
    tiny_model(&restored)?;
    restored.load(dir.path().join(&files[0]))?;
    let running_mean = values(&restored, "backbone.conv1.bn.running_mean")?;
    assert!(running_mean.iter().any(|&m| m != 0.0), "{running_mean:?}");
    Ok(())
}

#[test]
fn restored_checkpoint_reproduces_scores() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let varmap = VarMap::new();
    let model = tiny_model(&varmap)?;
    let mut optimizer = optimizer(model.as_ref())?;
    let train = batches(3, 0.)?;
    let val = batches(1, 0.)?;

    // A single epoch always saves, so the file holds the final state.
    let checkpoint = ModelCheckpoint::new(varmap.clone(), dir.path())
        .monitor("train/loss")
        .mode(Mode::Min);
    let config = TrainerConfig::new().max_epochs(1).log_every_n_steps(0);
    let mut trainer = Trainer::new(config).with_callback(checkpoint);
    trainer.fit(model.as_ref(), &mut optimizer, &train, None)?;
    let expected = model.forward_test(&val[0].imgs)?;

    let files = checkpoint_files(dir.path())?;
    assert_eq!(files.len(), 1, "{files:?}");
    let mut restored = VarMap::new();
    let fresh = tiny_model(&restored)?;
    restored.load(dir.path().join(&files[0]))?;
    let scores = fresh.forward_test(&val[0].imgs)?;
    let diff = max_abs_diff(&expected, &scores)?;
    assert!(diff < 1e-5, "restored scores differ by {diff}");

    // The running statistics are part of the checkpoint.
    let key = "backbone.conv1.bn.running_var";
    assert_eq!(values(&varmap, key)?, values(&restored, key)?);
    Ok(())
}

#[test]
fn workers_log_identical_values() -> Result<()> {
    let handles: Vec<_> = LocalGroup::new_group(2)
        .into_iter()
        .map(|group| {
            std::thread::spawn(move || -> Result<Vec<f64>> {
                let offset = group.rank() as f32;
                let model = tiny_model(&VarMap::new())?;
                let mut optimizer = optimizer(model.as_ref())?;
                let train = batches(2, offset)?;
                let val = batches(1, offset)?;
                let group: Arc<dyn ProcessGroup> = Arc::new(group);
                let config = TrainerConfig::new()
                    .max_epochs(2)
                    .log_every_n_steps(0)
                    .eval_topk([1]);
                let mut trainer = Trainer::new(config).with_process_group(group);
                trainer.fit(model.as_ref(), &mut optimizer, &train, Some(&val))?;
                let mut logged = Vec::new();
                for metrics in trainer.history() {
                    logged.push(metrics.get("train/loss").expect("loss"));
                    logged.push(metrics.get("val/top1_acc").expect("top1"));
                }
                Ok(logged)
            })
        })
        .collect();
    let mut results = Vec::new();
    for handle in handles {
        results.push(handle.join().expect("worker thread")?);
    }
    assert_eq!(results[0], results[1]);
    Ok(())
}

#[test]
fn optimizer_updates_trainable_weights_only() -> Result<()> {
    let mut experiment = tiny_experiment();
    experiment["model"]["backbone"]["norm_cfg"] = json!({"type": "BN3d", "requires_grad": false});
    let varmap = VarMap::new();
    let model = build_model(&experiment, &varmap, &Device::Cpu)?;
    let mut optimizer = optimizer(model.as_ref())?;
    let train = batches(1, 0.)?;

    let stem = "backbone.conv1.conv.weight";
    let fc = "cls_head.fc_cls.weight";
    let frozen = "backbone.conv1.bn.weight";
    let before: Vec<Vec<f32>> = [stem, fc, frozen]
        .iter()
        .map(|key| values(&varmap, key))
        .collect::<Result<_>>()?;
    let running_mean = "backbone.conv1.bn.running_mean";
    assert_eq!(values(&varmap, running_mean)?, vec![0.0; 4]);

    let output = model.train_step(&train[0], &SingleProcess)?;
    optimizer.backward_step(&output.loss)?;

    assert_ne!(values(&varmap, stem)?, before[0], "backbone weights did not move");
    assert_ne!(values(&varmap, fc)?, before[1], "head weights did not move");
    assert_eq!(values(&varmap, frozen)?, before[2], "a frozen norm scale moved");
    // Running statistics follow the batches, not the optimizer.
    assert_ne!(values(&varmap, running_mean)?, vec![0.0; 4]);
    Ok(())
}
