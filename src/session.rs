/// Owned embedder session for Rust hosts.
///
/// Opens the engine library and one embedder from an [`EmbedderConfig`], and
/// releases them in order (embedder first, then the library reference) when
/// dropped.
use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::Context;
use tracing::warn;

use crate::bridge::{Bridge, EmbedderId, LibraryId};
use crate::config::{self, EmbedderConfig};
use crate::download::{self, LibraryRelease};
use crate::error::Result;
use crate::marshal::{self, EmbeddingMatrix, Tokenized};
use crate::types::{Normalization, PoolingType};

pub struct EmbedderSession<'b> {
    bridge: &'b Bridge,
    library: LibraryId,
    embedder: EmbedderId,
    pooling: PoolingType,
    normalization: Normalization,
}

impl<'b> EmbedderSession<'b> {
    /// Load the configured library and initialize an embedder for its model.
    ///
    /// With `auto_download` on, a cached library or `hf_repo` model that is
    /// not on disk yet is downloaded first. If initialization fails the
    /// library reference taken here is released before returning.
    pub fn open(bridge: &'b Bridge, config: &EmbedderConfig) -> anyhow::Result<Self> {
        config.validate()?;
        let library_path = acquire_library(config)?;
        let model_path = acquire_model(config)?;

        let library = bridge
            .load_library(&library_path)
            .with_context(|| format!("failed to load engine from {}", library_path.display()))?;

        match bridge.init_embedder(library, &model_path, config.pooling) {
            Ok(embedder) => Ok(Self {
                bridge,
                library,
                embedder,
                pooling: config.pooling,
                normalization: config.normalization,
            }),
            Err(e) => {
                if let Err(free_err) = bridge.free_library(library) {
                    warn!("Failed to release library after init failure: {free_err}");
                }
                Err(e).with_context(|| format!("failed to load model {}", model_path.display()))
            }
        }
    }

    #[must_use]
    pub fn embedder_id(&self) -> EmbedderId {
        self.embedder
    }

    #[must_use]
    pub fn library_id(&self) -> LibraryId {
        self.library
    }

    #[must_use]
    pub fn pooling(&self) -> PoolingType {
        self.pooling
    }

    #[must_use]
    pub fn normalization(&self) -> Normalization {
        self.normalization
    }

    /// Embed with the session's default normalization.
    pub fn embed<S: AsRef<str>>(&self, texts: &[S]) -> Result<EmbeddingMatrix> {
        self.embed_with(texts, self.normalization)
    }

    pub fn embed_with<S: AsRef<str>>(
        &self,
        texts: &[S],
        normalization: Normalization,
    ) -> Result<EmbeddingMatrix> {
        self.bridge.embed(self.embedder, texts, normalization)
    }

    /// Model metadata decoded back into a map.
    pub fn metadata(&self) -> Result<BTreeMap<String, String>> {
        let entries = self.bridge.metadata(self.embedder)?;
        Ok(marshal::decode_metadata(entries))
    }

    /// Embedding width advertised by the model's `<arch>.embedding_length`
    /// metadata, if the model carries it.
    pub fn dimensions(&self) -> Result<Option<usize>> {
        let metadata = self.metadata()?;
        Ok(metadata
            .get("general.architecture")
            .and_then(|arch| metadata.get(&format!("{arch}.embedding_length")))
            .and_then(|width| width.parse().ok()))
    }

    pub fn tokenize<S: AsRef<str>>(&self, texts: &[S]) -> Result<Vec<Tokenized>> {
        self.bridge.tokenize(self.embedder, texts)
    }
}

fn acquire_library(config: &EmbedderConfig) -> anyhow::Result<PathBuf> {
    let path = config.resolve_library_path()?;
    if !config.auto_download || !config.uses_library_cache() || path.exists() {
        return Ok(path);
    }
    let release = LibraryRelease::for_host(&config.library_version)?;
    download::ensure_library(&release, &config::default_library_dir()?)
}

fn acquire_model(config: &EmbedderConfig) -> anyhow::Result<PathBuf> {
    let path = config.resolve_model_path()?;
    let Some(repo) = &config.hf_repo else {
        return Ok(path);
    };
    if !config.auto_download || path.exists() {
        return Ok(path);
    }
    let file = config.model_path.to_string_lossy();
    download::ensure_hf_model(
        repo,
        &file,
        &config.resolve_model_cache_dir()?,
        config.hf_token.as_deref(),
    )
}

impl Drop for EmbedderSession<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.bridge.free_embedder(self.embedder) {
            warn!("Failed to free embedder {}: {e}", self.embedder);
        }
        if let Err(e) = self.bridge.free_library(self.library) {
            warn!("Failed to release library {}: {e}", self.library);
        }
    }
}
