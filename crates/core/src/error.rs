/// Result alias that carries the custom [`AudioVizError`] type.
pub type Result<T> = std::result::Result<T, AudioVizError>;

/// Common error type for the core crate.
#[derive(Debug, thiserror::Error)]
pub enum AudioVizError {
    /// No capture device, unsupported capture configuration, or a backend
    /// failure while opening the live input. Returned by
    /// `connect_microphone`; the state machine reverts to idle.
    #[error("audio capture unavailable: {0}")]
    CaptureUnavailable(String),
    /// The file could not be probed or decoded, or decoding produced an
    /// unusable track (no samples, zero sample rate).
    #[error("could not decode audio file: {0}")]
    Decode(String),
    /// The audible output path for file playback could not be opened.
    #[error("audio playback failed: {0}")]
    Playback(String),
    /// Precondition failure on a caller-supplied value.
    #[error("{0}")]
    InvalidInput(&'static str),
    /// Free-form message for failures without a richer classification.
    #[error("{0}")]
    Message(String),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    /// Wrapper around FFT processing errors.
    #[error("{0}")]
    Fft(#[from] realfft::FftError),
}

impl AudioVizError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }
}

impl From<&str> for AudioVizError {
    fn from(value: &str) -> Self {
        Self::msg(value)
    }
}

impl From<String> for AudioVizError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}
