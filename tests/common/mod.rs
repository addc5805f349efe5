#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use fingermatch::config::{Backend, Config};
use fingermatch::gallery::Gallery;
use fingermatch::index::{CandidateIndex, DEFAULT_EF};
use fingermatch::storage::{Record, RecordResolver, RecordStore};
use fingermatch::{npy, CnnEncoder, CnnWeights, Extractor, MatchOptions, Matcher};
use image::{DynamicImage, GrayImage, Luma};
use ndarray::Array2;
use serde_json::Value;
use tempfile::TempDir;

pub const SEED: u64 = 21;

pub fn init_logger() {
    env_logger::builder().is_test(true).try_init().ok();
}

pub fn weights() -> CnnWeights {
    CnnWeights::seeded([4, 8, 16], SEED)
}

pub fn extractor() -> Result<Extractor> {
    Ok(Extractor::new(Box::new(CnnEncoder::new(weights())?))?)
}

/// Synthetic ridge pattern; `core` shifts the singular point, `freq` the ridge spacing.
pub fn ridges(core: (f32, f32), freq: f32) -> DynamicImage {
    let (w, h) = (160u32, 192u32);
    DynamicImage::ImageLuma8(GrayImage::from_fn(w, h, |x, y| {
        let dx = x as f32 - w as f32 * core.0;
        let dy = y as f32 - h as f32 * core.1;
        let r = (dx * dx + dy * dy).sqrt();
        Luma([(127.5 + 127.5 * (r * freq).sin()) as u8])
    }))
}

/// Copy of `img` with one pixel inverted.
pub fn perturb_one_pixel(img: &DynamicImage) -> DynamicImage {
    let mut gray = img.to_luma8();
    let (x, y) = (gray.width() / 2, gray.height() / 2);
    let Luma([v]) = *gray.get_pixel(x, y);
    gray.put_pixel(x, y, Luma([255 - v]));
    DynamicImage::ImageLuma8(gray)
}

pub fn object(v: Value) -> Record {
    match v {
        Value::Object(m) => m,
        other => panic!("expected an object, got {other}"),
    }
}

/// A complete artifact set on disk: weights, enrolled scans, gallery,
/// identifier list, index, record directory and a config pointing at them.
pub struct Fixture {
    pub dir: TempDir,
    pub config: Config,
    /// Enrolled scans, in gallery order.
    pub scans: Vec<PathBuf>,
    pub embeddings: Array2<f32>,
}

impl Fixture {
    /// Enroll `prints` under `scans/<name>` and write one record per `records` entry.
    pub fn build(prints: &[(&str, DynamicImage)], records: &[(&str, Value)]) -> Result<Self> {
        let dir = tempfile::tempdir()?;
        let root = dir.path();

        let model = root.join("cnn.bin");
        weights().save(&model)?;
        let extractor = extractor()?;

        std::fs::create_dir_all(root.join("scans"))?;
        let mut scans = Vec::new();
        let mut rows = Vec::new();
        let mut ids = String::new();
        for (name, img) in prints {
            let path = root.join("scans").join(format!("{name}.png"));
            img.save(&path)?;
            rows.extend(extractor.extract_path(&path)?.vector.iter().copied());
            ids.push_str(&format!("scans/{name}\n"));
            scans.push(path);
        }
        let embeddings = Array2::from_shape_vec((prints.len(), extractor.dim()), rows)?;

        let emb_path = root.join("embeddings.npy");
        let ids_path = root.join("image_ids.csv");
        let index_path = root.join("fingerprint_ann.bin");
        npy::write_matrix(&emb_path, &embeddings)?;
        std::fs::write(&ids_path, ids)?;
        CandidateIndex::exhaustive(&embeddings, DEFAULT_EF).save(&index_path)?;

        let records_dir = root.join("records");
        std::fs::create_dir_all(&records_dir)?;
        for (id, record) in records {
            std::fs::write(
                records_dir.join(format!("{id}.json")),
                serde_json::to_vec(record)?,
            )?;
        }

        let mut config = Config::default();
        config.model.backend = Backend::Native;
        config.model.path = model;
        config.gallery.embeddings = emb_path;
        config.gallery.identities = ids_path;
        config.gallery.index = index_path;
        config.store.dir = records_dir;

        Ok(Self {
            dir,
            config,
            scans,
            embeddings,
        })
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    pub fn matcher(&self) -> Result<Matcher> {
        Ok(Matcher::from_config(&self.config)?)
    }

    /// Same artifacts, but records come from `store`.
    pub fn matcher_with_store(&self, store: Arc<dyn RecordStore>) -> Result<Matcher> {
        let gallery = Gallery::load(&self.config.gallery.embeddings, &self.config.gallery.identities)?;
        let index = CandidateIndex::load(&self.config.gallery.index, gallery.dim(), DEFAULT_EF)?;
        Ok(Matcher::new(
            extractor()?,
            gallery,
            index,
            RecordResolver::new(store),
            MatchOptions::default(),
        )?)
    }

    pub fn write(&self, name: &str, img: &DynamicImage) -> Result<PathBuf> {
        let path = self.path(name);
        img.save(&path)?;
        Ok(path)
    }
}

pub fn abc() -> Vec<(&'static str, DynamicImage)> {
    vec![
        ("A", ridges((0.40, 0.55), 0.35)),
        ("B", ridges((0.55, 0.45), 0.28)),
        ("C", ridges((0.35, 0.35), 0.45)),
    ]
}
