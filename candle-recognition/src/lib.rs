//! Video action recognition for Candle: backbones, heads and recognizers built from
//! JSON experiment configs, plus a training loop driving their train and validation steps.

pub mod backbones;
pub mod builder;
pub mod callbacks;
pub mod config;
pub mod dist;
pub mod error;
pub mod heads;
pub mod losses;
pub mod metrics;
pub mod module;
pub mod params;
pub mod recognizers;
pub mod trainer;

pub use builder::{build_backbone, build_head, build_model, build_recognizer};
pub use callbacks::{Callback, EarlyStopping, EpochMetrics, Mode, ModelCheckpoint};
pub use config::{ConfigDict, TrainerConfig};
pub use dist::{LocalGroup, ProcessGroup, SingleProcess};
pub use error::{Error, Result};
pub use losses::{parse_losses, LogVars, LossBundle, LossValue};
pub use module::{DataBatch, ForwardOutput, Recognizer, TrainStepOutput, ValStepOutput};
pub use recognizers::{average_clip, Recognizer2D, Recognizer3D, RecognizerBase};
pub use trainer::Trainer;
