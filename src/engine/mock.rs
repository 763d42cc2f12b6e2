/// Mock engine for testing purposes.
///
/// Generates deterministic embeddings based on text hash, and records how it
/// is called so tests can check the bridge's locking and lifecycle rules.
use std::collections::HashSet;
use std::ffi::{CStr, c_void};
use std::hash::{DefaultHasher, Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use super::{EmbeddingEngine, EngineLoader, RawEmbedder};
use crate::error::{BridgeError, Result};
use crate::marshal::{EmbeddingMatrix, Tokenized};
use crate::types::{Normalization, PoolingType};

const CLS_TOKEN: i32 = 101;
const SEP_TOKEN: i32 = 102;
const VOCAB_SIZE: u64 = 30_000;

/// Per-embedder state; its heap address doubles as the opaque handle.
struct MockModel {
    pooling: PoolingType,
}

/// A mock engine that produces deterministic vectors from text hashes.
///
/// Useful for testing without a native library on disk.
pub struct MockEngine {
    dimensions: usize,
    call_delay: Option<Duration>,
    rejected_models: HashSet<String>,
    metadata: Vec<(String, String)>,
    in_call: AtomicBool,
    overlapping_calls: AtomicUsize,
    live_embedders: AtomicUsize,
}

impl MockEngine {
    /// Create a new `MockEngine` with the given dimensionality.
    #[must_use]
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            call_delay: None,
            rejected_models: HashSet::new(),
            metadata: vec![
                ("general.architecture".to_string(), "bert".to_string()),
                ("general.name".to_string(), "mock-embedder".to_string()),
                (
                    "bert.embedding_length".to_string(),
                    dimensions.to_string(),
                ),
            ],
            in_call: AtomicBool::new(false),
            overlapping_calls: AtomicUsize::new(0),
            live_embedders: AtomicUsize::new(0),
        }
    }

    /// Sleep inside every embed call, widening the window for overlap.
    #[must_use]
    pub fn with_call_delay(mut self, delay: Duration) -> Self {
        self.call_delay = Some(delay);
        self
    }

    /// Make `init` return no embedder for this model path.
    #[must_use]
    pub fn rejecting_model(mut self, model_path: &str) -> Self {
        self.rejected_models.insert(model_path.to_string());
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: Vec<(String, String)>) -> Self {
        self.metadata = metadata;
        self
    }

    #[must_use]
    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// Number of times two calls were inside the engine at once.
    #[must_use]
    pub fn overlapping_calls(&self) -> usize {
        self.overlapping_calls.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn live_embedders(&self) -> usize {
        self.live_embedders.load(Ordering::SeqCst)
    }

    /// The vector this engine produces for `text`, before normalization.
    #[must_use]
    pub fn raw_vector(&self, text: &str) -> Vec<f32> {
        let mut hasher = DefaultHasher::new();
        text.hash(&mut hasher);
        let bytes = hasher.finish().to_le_bytes();

        (0..self.dimensions)
            .map(|i| f32::from(bytes[i % 8]) / 255.0 - 0.5)
            .collect()
    }

    /// The row this engine produces for `text` under `normalization`.
    #[must_use]
    pub fn expected_row(&self, text: &str, normalization: Normalization) -> Vec<f32> {
        normalize(self.raw_vector(text), normalization)
    }

    fn enter(&self) -> CallGuard<'_> {
        if self.in_call.swap(true, Ordering::SeqCst) {
            self.overlapping_calls.fetch_add(1, Ordering::SeqCst);
        }
        CallGuard(&self.in_call)
    }
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new(384)
    }
}

struct CallGuard<'a>(&'a AtomicBool);

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl EmbeddingEngine for MockEngine {
    fn init(&self, model_path: &CStr, pooling: PoolingType) -> Result<RawEmbedder> {
        let _call = self.enter();
        let path = model_path.to_string_lossy();
        if path.is_empty() || self.rejected_models.contains(path.as_ref()) {
            return Err(BridgeError::InitFailed(
                "embedder not initialized properly".to_string(),
            ));
        }

        let model = Box::into_raw(Box::new(MockModel { pooling }));
        self.live_embedders.fetch_add(1, Ordering::SeqCst);
        RawEmbedder::from_ptr(model.cast::<c_void>())
            .ok_or_else(|| BridgeError::InitFailed("mock model allocation".to_string()))
    }

    fn free(&self, embedder: RawEmbedder) {
        let _call = self.enter();
        drop(unsafe { Box::from_raw(embedder.as_ptr().cast::<MockModel>()) });
        self.live_embedders.fetch_sub(1, Ordering::SeqCst);
    }

    fn embed(
        &self,
        embedder: RawEmbedder,
        texts: &[&CStr],
        normalization: Normalization,
    ) -> Result<EmbeddingMatrix> {
        let _call = self.enter();
        let model = unsafe { &*embedder.as_ptr().cast::<MockModel>() };
        if model.pooling == PoolingType::None && texts.len() > 1 {
            return Err(BridgeError::invocation(
                "embed",
                "pooling type none only supports a single input",
            ));
        }
        if let Some(delay) = self.call_delay {
            std::thread::sleep(delay);
        }

        let rows = texts
            .iter()
            .map(|t| self.expected_row(&t.to_string_lossy(), normalization))
            .collect();
        EmbeddingMatrix::from_rows(rows)
    }

    fn metadata(&self, _embedder: RawEmbedder) -> Result<Vec<(String, String)>> {
        let _call = self.enter();
        Ok(self.metadata.clone())
    }

    fn tokenize(&self, _embedder: RawEmbedder, texts: &[&CStr]) -> Result<Vec<Tokenized>> {
        let _call = self.enter();
        Ok(texts
            .iter()
            .map(|t| {
                let mut tokens = vec![CLS_TOKEN];
                tokens.extend(t.to_string_lossy().split_whitespace().map(|word| {
                    let mut hasher = DefaultHasher::new();
                    word.hash(&mut hasher);
                    1000 + (hasher.finish() % VOCAB_SIZE) as i32
                }));
                tokens.push(SEP_TOKEN);
                let attention_mask = vec![1; tokens.len()];
                Tokenized {
                    tokens,
                    attention_mask,
                }
            })
            .collect())
    }
}

/// Apply the engine's per-row scaling rule.
fn normalize(mut vec: Vec<f32>, normalization: Normalization) -> Vec<f32> {
    let scale = match normalization {
        Normalization::None => return vec,
        Normalization::MaxAbsInt16 => {
            let max = vec.iter().fold(0.0f32, |m, v| m.max(v.abs()));
            max / 32760.0
        }
        Normalization::Taxicab => vec.iter().map(|v| v.abs()).sum::<f32>(),
        Normalization::Euclidean => vec.iter().map(|v| v * v).sum::<f32>().sqrt(),
        Normalization::PNorm(p) => vec
            .iter()
            .map(|v| v.abs().powi(p))
            .sum::<f32>()
            .powf(1.0 / p as f32),
    };
    if scale > 0.0 {
        let inv = 1.0 / scale;
        for v in &mut vec {
            *v *= inv;
        }
    }
    vec
}

/// Loader that serves one shared [`MockEngine`] for a fixed set of paths.
pub struct MockLoader {
    engine: Arc<MockEngine>,
    paths: HashSet<PathBuf>,
    loads: AtomicUsize,
}

impl MockLoader {
    #[must_use]
    pub fn new(engine: Arc<MockEngine>) -> Self {
        Self {
            engine,
            paths: HashSet::new(),
            loads: AtomicUsize::new(0),
        }
    }

    /// Accept `path` as a loadable library.
    #[must_use]
    pub fn with_library(mut self, path: impl Into<PathBuf>) -> Self {
        self.paths.insert(path.into());
        self
    }

    /// How many times a library was actually opened.
    #[must_use]
    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

impl EngineLoader for MockLoader {
    fn load(&self, path: &Path) -> Result<Arc<dyn EmbeddingEngine>> {
        if !self.paths.contains(path) {
            return Err(BridgeError::LibraryLoad {
                path: path.display().to_string(),
                reason: "cannot open shared object file: No such file or directory".to_string(),
            });
        }
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(self.engine.clone())
    }
}

/// An `Arc<MockLoader>` loads through the shared instance, so tests can keep
/// a handle for inspecting `loads()`.
impl EngineLoader for Arc<MockLoader> {
    fn load(&self, path: &Path) -> Result<Arc<dyn EmbeddingEngine>> {
        self.as_ref().load(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init(engine: &MockEngine) -> RawEmbedder {
        engine.init(c"models/mock.gguf", PoolingType::Mean).unwrap()
    }

    #[test]
    fn test_mock_embed_dimensions() {
        let engine = MockEngine::new(384);
        let e = init(&engine);
        let result = engine.embed(e, &[c"hello world"], Normalization::Euclidean).unwrap();
        assert_eq!(result.rows(), 1);
        assert_eq!(result.cols(), 384);
        engine.free(e);
    }

    #[test]
    fn test_mock_embed_deterministic() {
        let engine = MockEngine::new(64);
        let e = init(&engine);
        let a = engine.embed(e, &[c"hello"], Normalization::Euclidean).unwrap();
        let b = engine.embed(e, &[c"hello"], Normalization::Euclidean).unwrap();
        assert_eq!(a, b, "same input should produce same output");

        let c = engine.embed(e, &[c"world"], Normalization::Euclidean).unwrap();
        assert_ne!(a, c, "different inputs should produce different outputs");
        engine.free(e);
    }

    #[test]
    fn test_mock_embed_normalized() {
        let engine = MockEngine::new(384);
        let row = engine.expected_row("test normalization", Normalization::Euclidean);
        let norm: f32 = row.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!(
            (norm - 1.0).abs() < 0.01,
            "vector should be approximately unit length, got {norm}"
        );

        let row = engine.expected_row("test normalization", Normalization::Taxicab);
        let l1: f32 = row.iter().map(|v| v.abs()).sum();
        assert!((l1 - 1.0).abs() < 0.01, "expected unit L1 norm, got {l1}");
    }

    #[test]
    fn test_mock_rejected_model() {
        let engine = MockEngine::default().rejecting_model("models/broken.gguf");
        let err = engine
            .init(c"models/broken.gguf", PoolingType::Mean)
            .unwrap_err();
        assert!(err.to_string().contains("not initialized properly"));
        assert_eq!(engine.live_embedders(), 0);
    }

    #[test]
    fn test_mock_tokenize_wraps_special_tokens() {
        let engine = MockEngine::default();
        let e = init(&engine);
        let out = engine.tokenize(e, &[c"hello big world"]).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].tokens.len(), 5);
        assert_eq!(out[0].tokens[0], CLS_TOKEN);
        assert_eq!(out[0].tokens[4], SEP_TOKEN);
        assert_eq!(out[0].attention_mask, vec![1; 5]);
        engine.free(e);
    }

    #[test]
    fn test_mock_loader_unknown_path() {
        let loader = MockLoader::new(Arc::new(MockEngine::default())).with_library("/libs/a.so");
        assert!(loader.load(Path::new("/libs/a.so")).is_ok());
        assert!(loader.load(Path::new("/libs/b.so")).is_err());
        assert_eq!(loader.loads(), 1);
    }
}
