use super::{average_per_video, RecognizerBase};
use crate::losses::LossBundle;
use crate::module::Recognizer;
use crate::{Error, Result};
use candle::Tensor;

/// Folds `[N, clips, ...]` into `[N * clips, ...]`.
pub(crate) fn fold_clips(imgs: &Tensor, rank: usize) -> Result<(Tensor, usize, usize)> {
    if imgs.rank() != rank {
        return Err(Error::InvalidArgument(format!(
            "expected a rank {rank} input, got shape {:?}",
            imgs.dims()
        )));
    }
    let dims = imgs.dims();
    let (videos, clips) = (dims[0], dims[1]);
    let mut folded = vec![videos * clips];
    folded.extend_from_slice(&dims[2..]);
    Ok((imgs.reshape(folded)?, videos, clips))
}

/// Labels as one row per video, with a 0-d label read as a batch of one.
pub(crate) fn video_labels(labels: &Tensor, videos: usize) -> Result<Tensor> {
    let labels = if labels.rank() == 0 {
        labels.unsqueeze(0)?
    } else {
        labels.clone()
    };
    if labels.dim(0)? != videos {
        return Err(Error::InvalidArgument(format!(
            "{} labels for {videos} videos",
            labels.dim(0)?
        )));
    }
    Ok(labels)
}

/// Recognizer over `[N, clips, C, T, H, W]` clips with a 3-D backbone.
pub struct Recognizer3D {
    base: RecognizerBase,
}

impl Recognizer3D {
    pub fn new(base: RecognizerBase) -> Self {
        Self { base }
    }
}

impl Recognizer for Recognizer3D {
    fn base(&self) -> &RecognizerBase {
        &self.base
    }

    fn forward_train(&self, imgs: &Tensor, labels: &Tensor) -> Result<LossBundle> {
        let labels = video_labels(labels, imgs.dim(0)?)?;
        let (imgs, videos, clips) = fold_clips(imgs, 6)?;
        let feats = self.base.extract_feat(&imgs, true)?;
        let cls_score = self.base.cls_head().forward_t(&feats, 1, true)?;
        let idx: Vec<u32> = (0..videos as u32)
            .flat_map(|v| std::iter::repeat(v).take(clips))
            .collect();
        let labels = labels.index_select(&Tensor::new(idx.as_slice(), labels.device())?, 0)?;
        self.base.cls_head().loss(&cls_score, &labels)
    }

    fn forward_test(&self, imgs: &Tensor) -> Result<Tensor> {
        let (imgs, videos, clips) = fold_clips(imgs, 6)?;
        let feats = self.base.extract_feat(&imgs, false)?;
        let cls_score = self.base.cls_head().forward_t(&feats, 1, false)?;
        average_per_video(&self.base, &cls_score, videos, clips)
    }
}
