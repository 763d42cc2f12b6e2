/// Engine trait and shared types for the native embedding collaborator.
///
/// An engine is built once per loaded library and shared behind `Arc`. The
/// bridge serializes every call into it, so implementations do not need their
/// own locking around the model/context pair.
pub mod mock;
pub mod native;

use std::ffi::{CStr, c_void};
use std::path::Path;
use std::ptr::NonNull;
use std::sync::Arc;

use crate::error::{BridgeError, Result};
use crate::marshal::{EmbeddingMatrix, Tokenized};
use crate::types::{Normalization, PoolingType};

/// Engine-side embedder pointer. Opaque: only ever forwarded, never read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawEmbedder(NonNull<c_void>);

// The pointer is only dereferenced by the engine, under the registry lock.
unsafe impl Send for RawEmbedder {}

impl RawEmbedder {
    /// `None` for a null pointer.
    #[must_use]
    pub fn from_ptr(ptr: *mut c_void) -> Option<Self> {
        NonNull::new(ptr).map(Self)
    }

    #[must_use]
    pub fn as_ptr(self) -> *mut c_void {
        self.0.as_ptr()
    }
}

/// The fixed contract every embedding engine satisfies.
///
/// All implementations must be `Send + Sync` to allow sharing behind `Arc`.
pub trait EmbeddingEngine: Send + Sync {
    /// Load a model and create its inference context.
    fn init(&self, model_path: &CStr, pooling: PoolingType) -> Result<RawEmbedder>;

    /// Release an embedder created by [`init`](Self::init).
    fn free(&self, embedder: RawEmbedder);

    /// Embed `texts`, one output row per text, in order.
    fn embed(
        &self,
        embedder: RawEmbedder,
        texts: &[&CStr],
        normalization: Normalization,
    ) -> Result<EmbeddingMatrix>;

    /// Model provenance as key/value pairs, in engine order.
    fn metadata(&self, embedder: RawEmbedder) -> Result<Vec<(String, String)>>;

    /// Token ids and attention masks, one entry per text.
    fn tokenize(&self, _embedder: RawEmbedder, _texts: &[&CStr]) -> Result<Vec<Tokenized>> {
        Err(BridgeError::Unsupported("tokenize"))
    }
}

/// Turns a library path into an engine.
pub trait EngineLoader: Send + Sync {
    fn load(&self, path: &Path) -> Result<Arc<dyn EmbeddingEngine>>;
}
