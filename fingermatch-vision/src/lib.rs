pub mod cnn;
pub mod error;
pub mod extractor;
pub mod fingerprint;
pub mod model;

// Re-export commonly used types
pub use cnn::{CnnEncoder, CnnWeights};
pub use error::ExtractError;
pub use extractor::Extractor;
pub use fingerprint::{Embedding, EMBEDDING_DIM, INPUT_SIZE};
pub use model::{Device, Encoder, OnnxEncoder};
