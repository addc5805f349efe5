use fingermatch_vision::ExtractError;
use thiserror::Error;

/// Errors surfaced by the matching core.
///
/// `IndexLoad`, `ModelLoad` and `Config` happen at startup and are fatal.
/// The rest are per-request. A missing record is not an error at all, it is
/// reported as an absent record.
#[derive(Debug, Error)]
pub enum MatchError {
    #[error("input image not found")]
    InputNotFound,
    #[error("input image unreadable: {0}")]
    InputUnreadable(String),
    #[error("index load failed: {0}")]
    IndexLoad(String),
    #[error("model load failed: {0}")]
    ModelLoad(String),
    #[error("record store unavailable: {0}")]
    RecordStoreUnavailable(String),
    #[error("inference failed: {0}")]
    Inference(String),
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl MatchError {
    /// True for errors that stem from the caller's input rather than the service.
    pub fn is_input_error(&self) -> bool {
        matches!(self, Self::InputNotFound | Self::InputUnreadable(_))
    }
}

impl From<ExtractError> for MatchError {
    fn from(e: ExtractError) -> Self {
        match e {
            ExtractError::InputNotFound => Self::InputNotFound,
            ExtractError::InputUnreadable(msg) => Self::InputUnreadable(msg),
            ExtractError::ModelLoad(msg) => Self::ModelLoad(msg),
            ExtractError::Inference(msg) => Self::Inference(msg),
        }
    }
}

pub type Result<T, E = MatchError> = std::result::Result<T, E>;
