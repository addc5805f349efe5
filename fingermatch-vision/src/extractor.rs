use std::path::Path;

use image::DynamicImage;
use ndarray::Array4;

use crate::error::{ExtractError, Result};
use crate::fingerprint::{self, Embedding, EMBEDDING_DIM, INPUT_SIZE};
use crate::model::Encoder;

/// Full pipeline: decode -> grayscale/resize/normalize -> encode -> L2 normalize
pub struct Extractor {
    encoder: Box<dyn Encoder>,
}

impl Extractor {
    /// Wrap an encoder after checking that it produces
    /// [`EMBEDDING_DIM`]-sized output.
    pub fn new(encoder: Box<dyn Encoder>) -> Result<Self> {
        let size = INPUT_SIZE as usize;
        let probe = encoder
            .encode(Array4::zeros((1, 1, size, size)))
            .map_err(|e| ExtractError::ModelLoad(format!("probe inference: {e}")))?;
        if probe.len() != EMBEDDING_DIM {
            return Err(ExtractError::ModelLoad(format!(
                "model produces {}-dimensional output, expected {EMBEDDING_DIM}",
                probe.len()
            )));
        }
        Ok(Self { encoder })
    }

    pub fn dim(&self) -> usize {
        EMBEDDING_DIM
    }

    /// Decode the image at `path` and extract its embedding.
    pub fn extract_path(&self, path: &Path) -> Result<Embedding> {
        let img = fingerprint::load_image(path)?;
        self.extract_image(&img)
    }

    /// Extract the embedding of an already decoded image.
    pub fn extract_image(&self, img: &DynamicImage) -> Result<Embedding> {
        let input = fingerprint::preprocess(img)?;
        let raw = self.encoder.encode(input)?;
        if raw.len() != EMBEDDING_DIM {
            return Err(ExtractError::Inference(format!(
                "model produced {} values",
                raw.len()
            )));
        }
        Ok(Embedding::from_raw(raw))
    }
}
