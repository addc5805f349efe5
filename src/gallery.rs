use std::path::Path;

use ndarray::Array2;

use crate::error::{MatchError, Result};
use crate::npy;

/// Pre-enrolled gallery: embedding matrix plus the parallel identifier table.
///
/// Row `i` of `embeddings` belongs to `identities[i]`; the candidate index
/// uses the same positions as its labels.
#[derive(Debug, Clone)]
pub struct Gallery {
    embeddings: Array2<f32>,
    identities: Vec<String>,
}

impl Gallery {
    pub fn new(embeddings: Array2<f32>, identities: Vec<String>) -> Result<Self> {
        let rows = embeddings.nrows();
        if rows != identities.len() {
            return Err(MatchError::IndexLoad(format!(
                "gallery has {rows} embeddings but {} identifiers",
                identities.len()
            )));
        }
        if rows == 0 {
            return Err(MatchError::IndexLoad("gallery is empty".to_string()));
        }
        // Row slices below rely on a contiguous row-major buffer.
        let embeddings = embeddings.as_standard_layout().into_owned();
        Ok(Self {
            embeddings,
            identities,
        })
    }

    /// Load the `.npy` embedding matrix and the identifier list.
    pub fn load(embeddings_path: &Path, identities_path: &Path) -> Result<Self> {
        let embeddings = npy::read_matrix(embeddings_path).map_err(|e| {
            MatchError::IndexLoad(format!("embeddings {}: {e}", embeddings_path.display()))
        })?;
        let raw = std::fs::read(identities_path).map_err(|e| {
            MatchError::IndexLoad(format!("identifiers {}: {e}", identities_path.display()))
        })?;
        let identities = parse_identities(&raw);

        let gallery = Self::new(embeddings, identities)?;
        log::info!(
            "loaded gallery: {} entries, dimension {}",
            gallery.len(),
            gallery.dim()
        );
        Ok(gallery)
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    pub fn dim(&self) -> usize {
        self.embeddings.ncols()
    }

    pub fn embeddings(&self) -> &Array2<f32> {
        &self.embeddings
    }

    /// Stored embedding at `position`.
    pub fn embedding(&self, position: usize) -> Option<&[f32]> {
        let dim = self.dim();
        let start = position.checked_mul(dim)?;
        self.embeddings.as_slice()?.get(start..start + dim)
    }

    /// Raw identifier as listed in the identifier table.
    pub fn raw_identity(&self, position: usize) -> Option<&str> {
        self.identities.get(position).map(String::as_str)
    }

    /// Identity id at `position`: the identifier's base name.
    pub fn identity(&self, position: usize) -> Option<&str> {
        self.raw_identity(position).map(base_name)
    }
}

/// Decode the identifier list: one entry per line, Latin-1, trimmed,
/// blank lines skipped.
pub fn parse_identities(raw: &[u8]) -> Vec<String> {
    // Latin-1 maps every byte to the code point of the same value.
    let text: String = raw.iter().map(|&b| b as char).collect();
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Strip any directory prefix, accepting both `/` and `\` separators.
pub fn base_name(id: &str) -> &str {
    id.rsplit(['/', '\\']).next().unwrap_or(id)
}
