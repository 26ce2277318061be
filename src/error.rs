//! Error taxonomy for the captioning pipeline.

use thiserror::Error;

use crate::caption::CaptionError;
use crate::pipeline::ImageStatus;

pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// The asset source could not be read.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Captioning provider is not configured: {0}")]
    ProviderUnconfigured(String),

    #[error("Captioning failed: {0}")]
    ProviderFailure(String),

    #[error("Captioning provider returned no usable text")]
    ProviderEmptyResult,

    #[error("Image not found: {0}")]
    NotFound(String),

    /// Another drain currently owns the worker.
    #[error("Already processing")]
    Busy,

    /// The run was cancelled while waiting to retry.
    #[error("Cancelled")]
    Cancelled,

    #[error("Cannot move image {id} from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: ImageStatus,
        to: ImageStatus,
    },

    #[error("Invalid setting: {0}")]
    InvalidSetting(String),

    #[error("Storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

impl PipelineError {
    /// Errors that end the whole scan/drain pass instead of a single item.
    pub fn aborts_pass(&self) -> bool {
        matches!(
            self,
            PipelineError::PermissionDenied(_) | PipelineError::ProviderUnconfigured(_)
        )
    }

    /// Errors worth another provider call after a backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, PipelineError::ProviderFailure(_))
    }
}

impl From<CaptionError> for PipelineError {
    fn from(err: CaptionError) -> Self {
        match err {
            CaptionError::NotConfigured(msg) => PipelineError::ProviderUnconfigured(msg),
            CaptionError::Empty => PipelineError::ProviderEmptyResult,
            CaptionError::Unavailable => {
                PipelineError::ProviderFailure("captioning service unavailable".to_string())
            }
            other => PipelineError::ProviderFailure(other.to_string()),
        }
    }
}
