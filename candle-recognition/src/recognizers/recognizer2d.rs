use super::recognizer3d::{fold_clips, video_labels};
use super::{average_per_video, RecognizerBase};
use crate::losses::LossBundle;
use crate::module::Recognizer;
use crate::Result;
use candle::Tensor;

/// Recognizer over `[N, segs, C, H, W]` frames with a 2-D backbone. The head fuses the
/// segments of each video.
pub struct Recognizer2D {
    base: RecognizerBase,
}

impl Recognizer2D {
    pub fn new(base: RecognizerBase) -> Self {
        Self { base }
    }
}

impl Recognizer for Recognizer2D {
    fn base(&self) -> &RecognizerBase {
        &self.base
    }

    fn forward_train(&self, imgs: &Tensor, labels: &Tensor) -> Result<LossBundle> {
        let labels = video_labels(labels, imgs.dim(0)?)?;
        let (imgs, _, segs) = fold_clips(imgs, 5)?;
        let feats = self.base.extract_feat(&imgs, true)?;
        let cls_score = self.base.cls_head().forward_t(&feats, segs, true)?;
        self.base.cls_head().loss(&cls_score, &labels)
    }

    fn forward_test(&self, imgs: &Tensor) -> Result<Tensor> {
        let (imgs, videos, segs) = fold_clips(imgs, 5)?;
        let feats = self.base.extract_feat(&imgs, false)?;
        let cls_score = self.base.cls_head().forward_t(&feats, segs, false)?;
        average_per_video(&self.base, &cls_score, videos, 1)
    }
}
