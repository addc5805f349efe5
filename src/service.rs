use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use image::DynamicImage;
use serde::Serialize;

use crate::config::{Backend, Config};
use crate::error::{MatchError, Result};
use crate::gallery::Gallery;
use crate::index::CandidateIndex;
use crate::matcher::{self, AcceptancePolicy, Decision};
use crate::storage::{DirectoryStore, Record, RecordResolver};
use crate::{CnnEncoder, Embedding, Encoder, Extractor, OnnxEncoder};

/// What happened to the record lookup for a request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "record", rename_all = "camelCase")]
pub enum RecordStatus {
    /// The candidate was not confirmed, so nothing was looked up.
    NotRequested,
    Found(Record),
    /// Confirmed, but the store has no record under that identity.
    Missing,
    /// Confirmed, but the store could not be queried.
    Unavailable(String),
}

/// Result of matching one probe against the gallery.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchResult {
    /// Best candidate after exact re-ranking, confirmed or not.
    pub candidate_id: Option<String>,
    pub similarity: f64,
    pub confirmed: bool,
    pub record: RecordStatus,
}

impl MatchResult {
    fn no_candidates() -> Self {
        Self {
            candidate_id: None,
            similarity: -1.0,
            confirmed: false,
            record: RecordStatus::NotRequested,
        }
    }

    /// Identity id, present only for confirmed matches.
    pub fn identity_id(&self) -> Option<&str> {
        if self.confirmed {
            self.candidate_id.as_deref()
        } else {
            None
        }
    }

    pub fn record(&self) -> Option<&Record> {
        match &self.record {
            RecordStatus::Found(r) => Some(r),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MatchOptions {
    pub top_k: usize,
    pub policy: AcceptancePolicy,
}

impl Default for MatchOptions {
    fn default() -> Self {
        Self {
            top_k: 5,
            policy: AcceptancePolicy::Exact,
        }
    }
}

/// Immutable matching service: model, gallery, index and record resolver,
/// loaded once and shared across requests.
pub struct Matcher {
    extractor: Extractor,
    gallery: Gallery,
    index: CandidateIndex,
    resolver: RecordResolver,
    options: MatchOptions,
}

impl Matcher {
    /// Assemble a service, checking that extractor, gallery and index agree
    /// on dimension and element count.
    pub fn new(
        extractor: Extractor,
        gallery: Gallery,
        index: CandidateIndex,
        resolver: RecordResolver,
        options: MatchOptions,
    ) -> Result<Self> {
        if gallery.dim() != extractor.dim() {
            return Err(MatchError::IndexLoad(format!(
                "gallery dimension {} does not match embedding dimension {}",
                gallery.dim(),
                extractor.dim()
            )));
        }
        if index.dim() != gallery.dim() {
            return Err(MatchError::IndexLoad(format!(
                "index dimension {} does not match gallery dimension {}",
                index.dim(),
                gallery.dim()
            )));
        }
        if index.len() != gallery.len() {
            return Err(MatchError::IndexLoad(format!(
                "index holds {} elements but gallery has {}",
                index.len(),
                gallery.len()
            )));
        }
        if options.top_k == 0 {
            return Err(MatchError::Config("top_k must be at least 1".to_string()));
        }
        if let AcceptancePolicy::AtLeast(t) = options.policy {
            log::warn!(
                "acceptance policy relaxed to similarity >= {t}; only exact matches are confirmed by default"
            );
        }

        Ok(Self {
            extractor,
            gallery,
            index,
            resolver,
            options,
        })
    }

    /// Load every artifact named in `cfg`. Any failure is fatal.
    pub fn from_config(cfg: &Config) -> Result<Self> {
        cfg.validate().map_err(|e| MatchError::Config(e.to_string()))?;

        let encoder: Box<dyn Encoder> = match cfg.model.backend {
            Backend::Onnx => Box::new(OnnxEncoder::load(&cfg.model.path, cfg.model.device)?),
            Backend::Native => Box::new(CnnEncoder::load(&cfg.model.path)?),
        };
        let extractor = Extractor::new(encoder)?;

        let gallery = Gallery::load(&cfg.gallery.embeddings, &cfg.gallery.identities)?;
        let index = CandidateIndex::load(&cfg.gallery.index, extractor.dim(), cfg.search.ef)?;

        let mut resolver = RecordResolver::new(Arc::new(DirectoryStore::new(&cfg.store.dir)))
            .with_internal_id_field(cfg.store.internal_id_field.clone());
        if cfg.store.timeout_ms > 0 {
            resolver = resolver.with_timeout(Duration::from_millis(cfg.store.timeout_ms));
        }

        Self::new(
            extractor,
            gallery,
            index,
            resolver,
            MatchOptions {
                top_k: cfg.search.top_k,
                policy: cfg.search.policy(),
            },
        )
    }

    pub fn gallery(&self) -> &Gallery {
        &self.gallery
    }

    pub fn index(&self) -> &CandidateIndex {
        &self.index
    }

    pub fn extractor(&self) -> &Extractor {
        &self.extractor
    }

    pub fn options(&self) -> MatchOptions {
        self.options
    }

    /// Run the full pipeline on the image at `path`.
    pub fn match_path(&self, path: &Path) -> Result<MatchResult> {
        let embedding = self.extractor.extract_path(path)?;
        self.match_embedding(&embedding)
    }

    pub fn match_image(&self, img: &DynamicImage) -> Result<MatchResult> {
        let embedding = self.extractor.extract_image(img)?;
        self.match_embedding(&embedding)
    }

    /// Search, re-rank and resolve. A record store failure does not fail the
    /// request; it is reported as [`RecordStatus::Unavailable`].
    pub fn match_embedding(&self, embedding: &Embedding) -> Result<MatchResult> {
        let Some(decision) = self.find_best(embedding) else {
            log::info!("no candidates returned for probe");
            return Ok(MatchResult::no_candidates());
        };

        log::info!(
            "best candidate {} similarity {:.6} confirmed {}",
            decision.identity_id,
            decision.similarity,
            decision.confirmed
        );

        let record = match self
            .resolver
            .resolve(&decision.identity_id, decision.confirmed)
        {
            Ok(Some(record)) => RecordStatus::Found(record),
            Ok(None) if decision.confirmed => {
                log::warn!("no record for confirmed identity {}", decision.identity_id);
                RecordStatus::Missing
            }
            Ok(None) => RecordStatus::NotRequested,
            Err(MatchError::RecordStoreUnavailable(reason)) => RecordStatus::Unavailable(reason),
            Err(e) => return Err(e),
        };

        Ok(MatchResult {
            candidate_id: Some(decision.identity_id),
            similarity: decision.similarity,
            confirmed: decision.confirmed,
            record,
        })
    }

    /// Candidate search plus exact re-ranking, without record resolution.
    pub fn find_best(&self, embedding: &Embedding) -> Option<Decision> {
        let candidates = self.index.top_k(embedding.as_slice(), self.options.top_k);
        log::debug!("index returned {} candidates", candidates.len());
        matcher::decide(embedding, &candidates, &self.gallery, self.options.policy)
    }
}
