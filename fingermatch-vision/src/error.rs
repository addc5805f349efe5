use thiserror::Error;

/// Failures of the feature extractor.
///
/// Display strings name the kind of failure only. Paths and decoder details
/// are logged at debug level instead of being carried to callers.
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("input image not found")]
    InputNotFound,
    #[error("input image unreadable: {0}")]
    InputUnreadable(String),
    #[error("model load failed: {0}")]
    ModelLoad(String),
    #[error("inference failed: {0}")]
    Inference(String),
}

pub type Result<T, E = ExtractError> = std::result::Result<T, E>;
