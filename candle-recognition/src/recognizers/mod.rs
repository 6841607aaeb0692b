//! Recognizers: a backbone and a classification head composed into one trainable model.

mod recognizer2d;
mod recognizer3d;

pub use recognizer2d::Recognizer2D;
pub use recognizer3d::Recognizer3D;

use crate::backbones::Backbone;
use crate::config::ConfigDict;
use crate::heads::Head;
use crate::{Error, Result};
use candle::{Tensor, D};
use candle_nn::VarMap;
use serde_json::Value;

const AVERAGE_CLIPS: &[&str] = &["score", "prob", "null"];

/// Averages the class scores of the clips of one video.
///
/// `cls_score` is `[clips, num_classes]`. `test_cfg.average_clips` selects the mode:
/// `"prob"` averages softmax probabilities, `"score"` averages raw scores and `null`
/// returns the scores unchanged. Averaged outputs keep the clip dimension with size one.
pub fn average_clip(cls_score: &Tensor, test_cfg: Option<&ConfigDict>) -> Result<Tensor> {
    let missing = || Error::MissingConfig {
        section: "test_cfg",
        key: "average_clips".to_string(),
    };
    let mode = test_cfg
        .ok_or_else(missing)?
        .get("average_clips")
        .ok_or_else(missing)?;
    match mode {
        Value::Null => Ok(cls_score.clone()),
        Value::String(mode) if mode == "prob" => {
            let probs = candle_nn::ops::softmax(cls_score, D::Minus1)?;
            Ok(probs.mean_keepdim(0)?)
        }
        Value::String(mode) if mode == "score" => Ok(cls_score.mean_keepdim(0)?),
        other => Err(Error::unsupported("average_clips", other, AVERAGE_CLIPS)),
    }
}

/// State shared by every recognizer.
pub struct RecognizerBase {
    backbone: Box<dyn Backbone>,
    cls_head: Box<dyn Head>,
    train_cfg: Option<ConfigDict>,
    test_cfg: Option<ConfigDict>,
    varmap: VarMap,
}

impl RecognizerBase {
    /// Takes freshly built components whose parameters live in `varmap` and initialises
    /// their weights.
    pub fn new(
        mut backbone: Box<dyn Backbone>,
        mut cls_head: Box<dyn Head>,
        train_cfg: Option<ConfigDict>,
        test_cfg: Option<ConfigDict>,
        varmap: VarMap,
    ) -> Result<Self> {
        backbone.init_weights()?;
        cls_head.init_weights()?;
        tracing::debug!(num_vars = varmap.all_vars().len(), "initialised recognizer weights");
        Ok(Self {
            backbone,
            cls_head,
            train_cfg,
            test_cfg,
            varmap,
        })
    }

    /// Backbone features of `imgs`.
    pub fn extract_feat(&self, imgs: &Tensor, train: bool) -> Result<Tensor> {
        self.backbone.forward_t(imgs, train)
    }

    pub fn average_clip(&self, cls_score: &Tensor) -> Result<Tensor> {
        average_clip(cls_score, self.test_cfg.as_ref())
    }

    pub fn backbone(&self) -> &dyn Backbone {
        self.backbone.as_ref()
    }

    pub fn cls_head(&self) -> &dyn Head {
        self.cls_head.as_ref()
    }

    pub fn train_cfg(&self) -> Option<&ConfigDict> {
        self.train_cfg.as_ref()
    }

    pub fn test_cfg(&self) -> Option<&ConfigDict> {
        self.test_cfg.as_ref()
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }
}

/// Averages each video's rows of `scores` (`[videos * clips, num_classes]`) and stacks the
/// results.
pub(crate) fn average_per_video(
    base: &RecognizerBase,
    scores: &Tensor,
    videos: usize,
    clips: usize,
) -> Result<Tensor> {
    let mut averaged = Vec::with_capacity(videos);
    for video in 0..videos {
        averaged.push(base.average_clip(&scores.narrow(0, video * clips, clips)?)?);
    }
    Ok(Tensor::cat(&averaged, 0)?)
}
