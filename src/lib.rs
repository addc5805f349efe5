pub mod config;
pub mod error;
pub mod gallery;
pub mod index;
pub mod matcher;
pub mod npy;
pub mod response;
pub mod service;
pub mod storage;

pub use error::{MatchError, Result};
pub use service::{MatchOptions, MatchResult, Matcher, RecordStatus};

// Re-export vision types for convenience
pub use fingermatch_vision::{
    CnnEncoder, CnnWeights, Device, Embedding, Encoder, ExtractError, Extractor, OnnxEncoder,
    EMBEDDING_DIM, INPUT_SIZE,
};
