use crate::audio::MicrophoneState;

/// Result alias that carries the custom [`ToyboxError`] type.
pub type Result<T> = std::result::Result<T, ToyboxError>;

/// Common error type for the core crate.
#[derive(Debug, thiserror::Error)]
pub enum ToyboxError {
    /// Free-form failure reported by a collaborator (toy module, fetcher).
    #[error("{0}")]
    Message(String),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    /// Malformed JSON in a manifest, catalog or configuration file.
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    /// The analysis transform only supports power-of-two sizes.
    #[error("fft size {size} is not a power of two (minimum 2)")]
    InvalidFftSize { size: usize },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// A toy module's start routine returned something that is not a toy.
    #[error("malformed toy returned by module: {0}")]
    MalformedToy(String),
    #[error("no module registered for `{0}`")]
    ModuleNotFound(String),
    #[error("unknown toy `{0}`")]
    UnknownToy(String),
    /// The only failure surfaced to the user when a toy cannot be shown.
    #[error("toy `{slug}` failed to start: {reason}")]
    ToyFailedToStart { slug: String, reason: String },
    /// Audio input is not usable. Distinct from a live but silent stream.
    #[error("audio input unavailable ({0:?})")]
    AudioUnavailable(MicrophoneState),
    #[error("{0} channel disconnected")]
    Disconnected(&'static str),
}

impl ToyboxError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }
}

impl From<&str> for ToyboxError {
    fn from(value: &str) -> Self {
        Self::msg(value)
    }
}

impl From<String> for ToyboxError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}

/// Failure reported by a toy while it tears itself down.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("dispose failed: {0}")]
pub struct DisposeError(pub String);

impl DisposeError {
    pub fn new<T: Into<String>>(reason: T) -> Self {
        Self(reason.into())
    }
}
