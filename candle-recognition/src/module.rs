//! The recognizer contract driven by [`Trainer`](crate::Trainer).

use crate::dist::ProcessGroup;
use crate::losses::{parse_losses, LogVars, LossBundle};
use crate::params::trainable_vars;
use crate::recognizers::RecognizerBase;
use crate::{Error, Result};
use candle::{Tensor, Var};

/// One batch handed to [`Recognizer::train_step`] or [`Recognizer::val_step`].
#[derive(Clone, Debug)]
pub struct DataBatch {
    pub imgs: Tensor,
    pub label: Option<Tensor>,
    /// Weight of this batch when log values are averaged over an epoch.
    pub num_samples: usize,
}

impl DataBatch {
    /// `num_samples` defaults to the leading dimension of `imgs`.
    pub fn new(imgs: Tensor, label: Option<Tensor>) -> Result<Self> {
        let num_samples = imgs.dim(0)?;
        Ok(Self {
            imgs,
            label,
            num_samples,
        })
    }

    pub fn with_num_samples(mut self, num_samples: usize) -> Self {
        self.num_samples = num_samples;
        self
    }
}

/// Output of a training step.
#[derive(Debug)]
pub struct TrainStepOutput {
    /// Differentiable total loss, to back-propagate through.
    pub loss: Tensor,
    /// Plain numbers for logging, identical on every worker.
    pub log_vars: LogVars,
    pub num_samples: usize,
}

/// Output of a validation step.
#[derive(Debug)]
pub struct ValStepOutput {
    pub results: Tensor,
}

/// What [`Recognizer::forward`] produced.
#[derive(Debug)]
pub enum ForwardOutput {
    Losses(LossBundle),
    Scores(Tensor),
}

/// A backbone plus classification head that can be trained by [`Trainer`](crate::Trainer).
///
/// Implementors provide the two computations; dispatch and step packaging are shared.
pub trait Recognizer: Send {
    fn base(&self) -> &RecognizerBase;

    /// Losses and training metrics for a batch of inputs and labels.
    fn forward_train(&self, imgs: &Tensor, labels: &Tensor) -> Result<LossBundle>;

    /// Class scores for a batch of inputs, averaged over clips as `test_cfg` says.
    fn forward_test(&self, imgs: &Tensor) -> Result<Tensor>;

    /// Runs the training computation when `return_loss` is set, inference otherwise.
    ///
    /// Asking for a loss without a label fails before anything is computed.
    fn forward(
        &self,
        imgs: &Tensor,
        label: Option<&Tensor>,
        return_loss: bool,
    ) -> Result<ForwardOutput> {
        if !return_loss {
            return Ok(ForwardOutput::Scores(self.forward_test(imgs)?));
        }
        let Some(label) = label else {
            return Err(Error::InvalidArgument(
                "label must be defined when return_loss is true".to_string(),
            ));
        };
        Ok(ForwardOutput::Losses(self.forward_train(imgs, label)?))
    }

    fn train_step(&self, batch: &DataBatch, group: &dyn ProcessGroup) -> Result<TrainStepOutput> {
        let ForwardOutput::Losses(losses) = self.forward(&batch.imgs, batch.label.as_ref(), true)?
        else {
            return Err(Error::InvalidArgument(
                "training forward returned scores".to_string(),
            ));
        };
        let (loss, log_vars) = parse_losses(&losses, group)?;
        Ok(TrainStepOutput {
            loss,
            log_vars,
            num_samples: batch.num_samples,
        })
    }

    fn val_step(&self, batch: &DataBatch) -> Result<ValStepOutput> {
        let ForwardOutput::Scores(results) = self.forward(&batch.imgs, None, false)? else {
            return Err(Error::InvalidArgument(
                "inference forward returned losses".to_string(),
            ));
        };
        Ok(ValStepOutput { results })
    }

    /// All trainable parameters, for an optimizer. Batch-norm running statistics are left
    /// out.
    fn parameters(&self) -> Vec<Var> {
        trainable_vars(self.base().varmap())
    }
}
