//! Error type shared by the whole crate.

/// Errors raised while building, running or training a recognizer.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A call was made with arguments that cannot be honoured, e.g. a loss was requested
    /// without a label.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A required key is absent from a config section.
    #[error("\"{key}\" must be defined in {section}")]
    MissingConfig { section: &'static str, key: String },

    /// A config key is present but its value is outside of the supported set.
    #[error("{value} is not supported for \"{key}\", currently supported ones are {supported}")]
    UnsupportedValue {
        key: String,
        value: String,
        supported: String,
    },

    /// A loss entry is neither a float tensor nor a non-empty list of float tensors.
    #[error("{0} is not a tensor or list of tensors")]
    TypeMismatch(String),

    /// A `type` field names a component that is not registered.
    #[error("unknown {kind} type \"{name}\"")]
    UnknownType { kind: &'static str, name: String },

    #[error("config error: {0}")]
    Config(String),

    #[error("collective error: {0}")]
    Distributed(String),

    #[error(transparent)]
    Candle(#[from] candle::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn unsupported(
        key: impl Into<String>,
        value: impl std::fmt::Display,
        supported: &[&str],
    ) -> Self {
        Self::UnsupportedValue {
            key: key.into(),
            value: value.to_string(),
            supported: format!("{supported:?}"),
        }
    }
}
