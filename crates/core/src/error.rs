/// Result alias that carries the custom [`BeatframeError`] type.
pub type Result<T> = std::result::Result<T, BeatframeError>;

/// Common error type for the core crate.
#[derive(Debug, thiserror::Error)]
pub enum BeatframeError {
    /// Tempo must be a finite, strictly positive number.
    #[error("invalid bpm {0}: tempo must be finite and greater than zero")]
    InvalidBpm(f64),
    /// Loop bounds were non-finite or collapsed to an empty range.
    #[error("invalid loop range [{start}, {end})")]
    InvalidLoopRange { start: f64, end: f64 },
    /// Audio bytes could not be decoded into samples.
    #[error("failed to decode audio: {0}")]
    Decode(String),
    /// No audio output capability is available.
    #[error("audio device unavailable: {0}")]
    DeviceUnavailable(String),
    /// Playback scheduling was driven outside its stop/seek/play protocol.
    #[error("scheduling conflict: {0}")]
    SchedulingConflict(&'static str),
    /// Playback was requested before any audio was loaded.
    #[error("no audio loaded")]
    AudioNotLoaded,
    /// The visual layer failed to produce a frame.
    #[error("frame {frame} failed to render: {reason}")]
    RenderFrame { frame: u64, reason: String },
    /// The video encoder process failed.
    #[error("encoder failed: {0}")]
    Encode(String),
    /// Status was requested for an unknown or expired job.
    #[error("export job `{0}` not found")]
    JobNotFound(String),
    /// An export request violated its constraints.
    #[error("invalid export request: {0}")]
    InvalidRequest(String),
    /// Free-form error for configuration and wiring problems.
    #[error("{0}")]
    Message(String),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    /// Wrapper around JSON (de)serialisation errors.
    #[error("{0}")]
    Json(#[from] serde_json::Error),
}

impl BeatframeError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }
}

impl From<&str> for BeatframeError {
    fn from(value: &str) -> Self {
        Self::msg(value)
    }
}

impl From<String> for BeatframeError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn displays_loop_range() {
        let err = BeatframeError::InvalidLoopRange { start: 4.0, end: 4.0 };
        assert_eq!(err.to_string(), "invalid loop range [4, 4)");
    }

    #[test]
    fn converts_io_errors() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: BeatframeError = io.into();
        assert!(matches!(err, BeatframeError::Io(_)));
    }
}
