use thiserror::Error;

/// Everything that can go wrong between a synthesis call and the audio sink.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("no idle synthesis worker available")]
    PoolExhausted,

    #[error("voice not found: {0}")]
    VoiceNotFound(String),

    #[error("synthesis failed: {0}")]
    SynthesisFailure(String),

    #[error("pipeline stage '{stage}' failed: {message}")]
    PipelineStage { stage: &'static str, message: String },

    #[error("pipeline already has a source attached")]
    PipelineBusy,

    #[error("request {0} is already in flight")]
    DuplicateRequest(u64),

    #[error("speech provider control loop has stopped")]
    ServiceStopped,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ProviderError {
    pub fn stage(stage: &'static str, message: impl Into<String>) -> Self {
        Self::PipelineStage {
            stage,
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ProviderError>;

impl From<ProviderError> for zbus::fdo::Error {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::PoolExhausted => zbus::fdo::Error::LimitsExceeded(err.to_string()),
            ProviderError::VoiceNotFound(_) | ProviderError::DuplicateRequest(_) => {
                zbus::fdo::Error::InvalidArgs(err.to_string())
            }
            other => zbus::fdo::Error::Failed(other.to_string()),
        }
    }
}
