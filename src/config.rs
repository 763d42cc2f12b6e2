/// Configuration module for embedder sessions.
///
/// Handles loading, validating, and providing default configuration values,
/// and resolving where the engine library lives on disk.
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::download::LibraryRelease;
use crate::engine::native::library_file_name;
use crate::types::{Normalization, PoolingType};

/// Engine release downloaded into the default library cache.
pub const DEFAULT_LIBRARY_VERSION: &str = "v0.0.8";

// ── Default value functions ──────────────────────────────────────────

fn default_library_version() -> String {
    DEFAULT_LIBRARY_VERSION.to_string()
}

fn default_auto_download() -> bool {
    true
}

// ── Config structs ───────────────────────────────────────────────────

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct EmbedderConfig {
    /// Full path to the engine library. Takes precedence over `library_dir`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub library_path: Option<PathBuf>,

    /// Directory holding the platform-named engine library.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub library_dir: Option<PathBuf>,

    #[serde(default = "default_library_version")]
    pub library_version: String,

    /// Local model file, or the file name inside `hf_repo` when that is set.
    #[serde(default)]
    pub model_path: PathBuf,

    /// HuggingFace repository to fetch `model_path` from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hf_repo: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hf_token: Option<String>,

    /// Where downloaded models are stored. Defaults to `llama_cache/models`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_cache_dir: Option<PathBuf>,

    /// Fetch the engine library and `hf_repo` models when they are missing.
    #[serde(default = "default_auto_download")]
    pub auto_download: bool,

    #[serde(default)]
    pub pooling: PoolingType,

    #[serde(default)]
    pub normalization: Normalization,
}

// ── Default impls ────────────────────────────────────────────────────

impl Default for EmbedderConfig {
    fn default() -> Self {
        Self {
            library_path: None,
            library_dir: None,
            library_version: default_library_version(),
            model_path: PathBuf::new(),
            hf_repo: None,
            hf_token: None,
            model_cache_dir: None,
            auto_download: default_auto_download(),
            pooling: PoolingType::default(),
            normalization: Normalization::default(),
        }
    }
}

// ── Config implementation ────────────────────────────────────────────

impl EmbedderConfig {
    /// Config for `model_path` with every other field at its default.
    #[must_use]
    pub fn for_model(model_path: impl Into<PathBuf>) -> Self {
        Self {
            model_path: model_path.into(),
            ..Self::default()
        }
    }

    /// Load configuration from a JSON file.
    ///
    /// A missing file yields the defaults; an unreadable or invalid one is an
    /// error.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!("{} not found, using defaults", path.display());
            return Ok(Self::default());
        }

        let data = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {}", path.display()))?;
        let cfg: EmbedderConfig = serde_json::from_str(&data)
            .with_context(|| format!("invalid JSON in {}", path.display()))?;

        info!("Loaded configuration from {}", path.display());
        Ok(cfg)
    }

    /// Save configuration to a JSON file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let data = serde_json::to_string_pretty(self).context("failed to marshal config")?;
        std::fs::write(path, data)
            .with_context(|| format!("failed to write config: {}", path.display()))?;
        Ok(())
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            !self.model_path.as_os_str().is_empty(),
            "model_path must be set"
        );
        anyhow::ensure!(
            !self.library_version.is_empty(),
            "library_version must not be empty"
        );
        if let Some(path) = &self.library_path {
            anyhow::ensure!(
                !path.as_os_str().is_empty(),
                "library_path must not be empty when set"
            );
        }
        if let Some(repo) = &self.hf_repo {
            anyhow::ensure!(!repo.is_empty(), "hf_repo must not be empty when set");
        }
        Ok(())
    }

    /// Where the model file is read from.
    ///
    /// With `hf_repo` set this is the file's name inside the model cache;
    /// otherwise `model_path` with a leading `~/` expanded.
    pub fn resolve_model_path(&self) -> Result<PathBuf> {
        if self.hf_repo.is_none() {
            return expand_tilde(&self.model_path);
        }
        let name = self
            .model_path
            .file_name()
            .with_context(|| format!("no file name in {}", self.model_path.display()))?;
        Ok(self.resolve_model_cache_dir()?.join(name))
    }

    pub fn resolve_model_cache_dir(&self) -> Result<PathBuf> {
        match &self.model_cache_dir {
            Some(dir) => expand_tilde(dir),
            None => default_model_dir(),
        }
    }

    /// Whether the library comes from the shared cache rather than an
    /// explicit `library_path` or `library_dir`.
    #[must_use]
    pub fn uses_library_cache(&self) -> bool {
        self.library_path.is_none() && self.library_dir.is_none()
    }

    /// Where to load the engine library from.
    ///
    /// `library_path` if set, else `library_dir` joined with the platform
    /// library name, else the host's release directory in the shared cache,
    /// e.g. `libs/llama-embedder-linux-x64-v0.0.8/libllama-embedder.so`.
    pub fn resolve_library_path(&self) -> Result<PathBuf> {
        if let Some(path) = &self.library_path {
            return expand_tilde(path);
        }
        if let Some(dir) = &self.library_dir {
            return Ok(expand_tilde(dir)?.join(library_file_name()));
        }
        let release = LibraryRelease::for_host(&self.library_version)?;
        Ok(release.library_path(&default_library_dir()?))
    }
}

/// Root of the shared cache, e.g. `~/.cache/llama_cache` on Linux.
pub fn default_cache_dir() -> Result<PathBuf> {
    let cache = dirs::cache_dir().context("cannot determine cache directory")?;
    Ok(cache.join("llama_cache"))
}

/// Engine library cache, `<cache>/libs`.
pub fn default_library_dir() -> Result<PathBuf> {
    Ok(default_cache_dir()?.join("libs"))
}

/// Downloaded model cache, `<cache>/models`.
pub fn default_model_dir() -> Result<PathBuf> {
    Ok(default_cache_dir()?.join("models"))
}

fn expand_tilde(path: &Path) -> Result<PathBuf> {
    match path.strip_prefix("~") {
        Ok(rest) => {
            let home = dirs::home_dir().context("cannot determine home directory")?;
            Ok(home.join(rest))
        }
        Err(_) => Ok(path.to_path_buf()),
    }
}

// ── Tests ────────────────────────────────────────────────────────────
