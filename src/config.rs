use anyhow::{Context, Result};
use fingermatch_vision::Device;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::index::DEFAULT_EF;
use crate::matcher::AcceptancePolicy;
use crate::storage::DEFAULT_INTERNAL_ID_FIELD;

pub static CONFIG_PATH: Lazy<&'static Path> = Lazy::new(|| {
    Path::new(
        option_env!("FINGERMATCH_CONFIG_PATH").unwrap_or("/usr/local/etc/fingermatch/config.toml"),
    )
});

pub static DATA_PREFIX: Lazy<&'static Path> = Lazy::new(|| {
    Path::new(option_env!("FINGERMATCH_DATA_PREFIX").unwrap_or("/usr/local/share/fingermatch"))
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Onnx,
    Native,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub backend: Backend,
    pub path: PathBuf,
    pub device: Device,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GalleryConfig {
    pub embeddings: PathBuf,
    pub identities: PathBuf,
    pub index: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub top_k: usize,
    pub ef: usize,
    /// Unset keeps the exact-match rule; setting it opts into a calibrated threshold.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_similarity: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub dir: PathBuf,
    pub timeout_ms: u64,
    pub internal_id_field: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub model: ModelConfig,
    pub gallery: GalleryConfig,
    pub search: SearchConfig,
    pub store: StoreConfig,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Onnx,
            path: DATA_PREFIX.join("fingerprint_cnn.onnx"),
            device: Device::Cpu,
        }
    }
}

impl Default for GalleryConfig {
    fn default() -> Self {
        Self {
            embeddings: DATA_PREFIX.join("embeddings.npy"),
            identities: DATA_PREFIX.join("image_ids.csv"),
            index: DATA_PREFIX.join("fingerprint_ann.bin"),
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            top_k: 5,
            ef: DEFAULT_EF,
            min_similarity: None,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dir: DATA_PREFIX.join("records"),
            timeout_ms: 2000,
            internal_id_field: DEFAULT_INTERNAL_ID_FIELD.to_string(),
        }
    }
}

impl SearchConfig {
    pub fn policy(&self) -> AcceptancePolicy {
        match self.min_similarity {
            None => AcceptancePolicy::Exact,
            Some(t) => AcceptancePolicy::AtLeast(t),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.search.top_k == 0 {
            anyhow::bail!("search.top_k must be at least 1");
        }
        if self.search.ef == 0 {
            anyhow::bail!("search.ef must be at least 1");
        }
        if let Some(t) = self.search.min_similarity {
            if !(-1.0..=1.0).contains(&t) {
                anyhow::bail!("search.min_similarity must lie in [-1, 1], got {t}");
            }
        }
        Ok(())
    }
}

pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let path = path.unwrap_or(&CONFIG_PATH);
    if !path.exists() {
        log::debug!("no config at {}, using defaults", path.display());
        return Ok(Config::default());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading config at {}", path.display()))?;
    let cfg: Config =
        toml::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validating config {}", path.display()))?;
    Ok(cfg)
}

pub fn save_config(cfg: &Config, path: Option<&Path>) -> Result<()> {
    let path = path.unwrap_or(&CONFIG_PATH);
    let data = toml::to_string_pretty(cfg)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, data)?;
    Ok(())
}
