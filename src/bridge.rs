//! Handle registry and the guarded entry points.
//!
//! A [`Bridge`] owns every loaded engine library and every embedder created
//! from one, addressed by opaque non-zero ids. One mutex covers the whole
//! registry and is held for the full duration of each engine call, so an
//! engine never sees two calls at once and a library can never be unloaded
//! underneath an in-flight call.
//!
//! Every failing method writes its error to the last-error channel before
//! returning it.
use std::collections::HashMap;
use std::ffi::{CStr, CString};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock, Mutex, MutexGuard};

use tracing::{debug, info};

use crate::engine::native::DylibLoader;
use crate::engine::{EmbeddingEngine, EngineLoader, RawEmbedder};
use crate::error::{BridgeError, Result};
use crate::last_error;
use crate::marshal::{self, EmbeddingMatrix, Tokenized};
use crate::types::{Normalization, PoolingType};

/// Opaque reference to a loaded engine library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LibraryId(u64);

/// Opaque reference to an initialized embedder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EmbedderId(u64);

macro_rules! raw_id {
    ($name:ident) => {
        impl $name {
            /// `None` for `0`, the null handle.
            #[must_use]
            pub fn from_raw(raw: u64) -> Option<Self> {
                (raw != 0).then_some(Self(raw))
            }

            #[must_use]
            pub fn as_raw(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

raw_id!(LibraryId);
raw_id!(EmbedderId);

struct LibraryRecord {
    /// Canonical path, `None` for engines registered in-process.
    key: Option<PathBuf>,
    engine: Arc<dyn EmbeddingEngine>,
    loads: usize,
    embedders: usize,
}

impl LibraryRecord {
    fn refs(&self) -> usize {
        self.loads + self.embedders
    }
}

struct EmbedderRecord {
    library: LibraryId,
    raw: RawEmbedder,
    pooling: PoolingType,
}

#[derive(Default)]
struct Registry {
    libraries: HashMap<LibraryId, LibraryRecord>,
    by_path: HashMap<PathBuf, LibraryId>,
    embedders: HashMap<EmbedderId, EmbedderRecord>,
    next_id: u64,
}

impl Registry {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn library(&self, id: LibraryId) -> Result<&LibraryRecord> {
        self.libraries
            .get(&id)
            .ok_or(BridgeError::UnknownLibrary(id.0))
    }

    fn embedder(&self, id: EmbedderId) -> Result<(&EmbedderRecord, Arc<dyn EmbeddingEngine>)> {
        let record = self
            .embedders
            .get(&id)
            .ok_or(BridgeError::UnknownEmbedder(id.0))?;
        let engine = self.library(record.library)?.engine.clone();
        Ok((record, engine))
    }

    /// Drop the library once nothing references it any more.
    fn unload_if_unused(&mut self, id: LibraryId) {
        let unused = self.libraries.get(&id).is_some_and(|lib| lib.refs() == 0);
        if !unused {
            return;
        }
        if let Some(record) = self.libraries.remove(&id) {
            if let Some(key) = &record.key {
                self.by_path.remove(key);
                info!("Unloaded engine library {}", key.display());
            } else {
                info!("Released in-process engine {id}");
            }
        }
    }
}

/// Run one engine call, turning a panic inside the engine into an error.
fn guarded<T>(operation: &'static str, call: impl FnOnce() -> Result<T>) -> Result<T> {
    panic::catch_unwind(AssertUnwindSafe(call)).unwrap_or_else(|payload| {
        let reason = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "engine panicked".to_string());
        Err(BridgeError::invocation(operation, reason))
    })
}

fn to_cstrings<S: AsRef<str>>(texts: &[S]) -> Result<Vec<CString>> {
    texts
        .iter()
        .enumerate()
        .map(|(i, t)| {
            CString::new(t.as_ref())
                .map_err(|_| BridgeError::invalid(format!("text {i} contains a NUL byte")))
        })
        .collect()
}

/// Registry of engine libraries and embedders behind a single lock.
pub struct Bridge {
    loader: Box<dyn EngineLoader>,
    registry: Mutex<Registry>,
}

impl Default for Bridge {
    fn default() -> Self {
        Self::new()
    }
}

impl Bridge {
    /// A bridge that opens engine libraries from disk.
    #[must_use]
    pub fn new() -> Self {
        Self::with_loader(DylibLoader)
    }

    #[must_use]
    pub fn with_loader(loader: impl EngineLoader + 'static) -> Self {
        Self {
            loader: Box::new(loader),
            registry: Mutex::new(Registry::default()),
        }
    }

    /// The process-wide bridge behind the C entry points.
    pub fn global() -> &'static Bridge {
        static GLOBAL: LazyLock<Bridge> = LazyLock::new(Bridge::new);
        &GLOBAL
    }

    fn lock(&self) -> Result<MutexGuard<'_, Registry>> {
        self.registry
            .lock()
            .map_err(|e| BridgeError::Poisoned(e.to_string()))
    }

    // ── Libraries ────────────────────────────────────────────────────

    /// Load the engine library at `path`.
    ///
    /// Loading a path that is already loaded returns the same id and bumps
    /// its reference count instead of opening the library again.
    pub fn load_library(&self, path: &Path) -> Result<LibraryId> {
        self.load_library_inner(path)
            .inspect_err(last_error::record)
    }

    fn load_library_inner(&self, path: &Path) -> Result<LibraryId> {
        let key = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        let mut registry = self.lock()?;

        if let Some(&id) = registry.by_path.get(&key) {
            if let Some(record) = registry.libraries.get_mut(&id) {
                record.loads += 1;
                debug!(
                    "Library {} already loaded as {id}, refs now {}",
                    key.display(),
                    record.refs()
                );
                return Ok(id);
            }
        }

        let engine = self.loader.load(path)?;
        let id = LibraryId(registry.next_id());
        registry.by_path.insert(key.clone(), id);
        registry.libraries.insert(
            id,
            LibraryRecord {
                key: Some(key),
                engine,
                loads: 1,
                embedders: 0,
            },
        );
        Ok(id)
    }

    /// Register an engine that is already in memory, e.g. statically linked.
    ///
    /// The returned id behaves like a loaded library with one reference.
    pub fn register_engine(&self, engine: Arc<dyn EmbeddingEngine>) -> Result<LibraryId> {
        let mut registry = self.lock().inspect_err(last_error::record)?;
        let id = LibraryId(registry.next_id());
        registry.libraries.insert(
            id,
            LibraryRecord {
                key: None,
                engine,
                loads: 1,
                embedders: 0,
            },
        );
        info!("Registered in-process engine {id}");
        Ok(id)
    }

    /// Drop one load reference.
    ///
    /// The library is unloaded only when no loads and no embedders remain,
    /// so embedders keep working after their library's last `free_library`
    /// until they are freed themselves.
    pub fn free_library(&self, id: LibraryId) -> Result<()> {
        self.free_library_inner(id).inspect_err(last_error::record)
    }

    fn free_library_inner(&self, id: LibraryId) -> Result<()> {
        let mut registry = self.lock()?;
        let record = registry
            .libraries
            .get_mut(&id)
            .filter(|lib| lib.loads > 0)
            .ok_or(BridgeError::UnknownLibrary(id.0))?;
        record.loads -= 1;
        debug!("Library {id} released, refs now {}", record.refs());
        registry.unload_if_unused(id);
        Ok(())
    }

    /// Current reference count (loads plus live embedders), `None` once
    /// unloaded.
    #[must_use]
    pub fn library_refs(&self, id: LibraryId) -> Option<usize> {
        let registry = self.lock().ok()?;
        registry.libraries.get(&id).map(LibraryRecord::refs)
    }

    // ── Embedders ────────────────────────────────────────────────────

    /// Initialize an embedder for `model_path` from a loaded library.
    pub fn init_embedder(
        &self,
        library: LibraryId,
        model_path: &Path,
        pooling: PoolingType,
    ) -> Result<EmbedderId> {
        let result = model_path
            .to_str()
            .ok_or_else(|| {
                BridgeError::invalid(format!("model path {} is not UTF-8", model_path.display()))
            })
            .and_then(|p| {
                CString::new(p).map_err(|_| BridgeError::invalid("model path contains a NUL byte"))
            });
        match result {
            Ok(c_path) => self.init_embedder_c(library, &c_path, pooling),
            Err(e) => {
                last_error::record(&e);
                Err(e)
            }
        }
    }

    pub(crate) fn init_embedder_c(
        &self,
        library: LibraryId,
        model_path: &CStr,
        pooling: PoolingType,
    ) -> Result<EmbedderId> {
        self.init_embedder_inner(library, model_path, pooling)
            .inspect_err(last_error::record)
    }

    fn init_embedder_inner(
        &self,
        library: LibraryId,
        model_path: &CStr,
        pooling: PoolingType,
    ) -> Result<EmbedderId> {
        let mut registry = self.lock()?;
        let engine = registry
            .library(library)
            .ok()
            .filter(|lib| lib.loads > 0)
            .map(|lib| lib.engine.clone())
            .ok_or(BridgeError::UnknownLibrary(library.0))?;

        let raw = guarded("init", || engine.init(model_path, pooling)).map_err(|e| match e {
            BridgeError::InitFailed(_) => e,
            other => BridgeError::InitFailed(other.to_string()),
        })?;

        let id = EmbedderId(registry.next_id());
        registry.embedders.insert(
            id,
            EmbedderRecord {
                library,
                raw,
                pooling,
            },
        );
        if let Some(lib) = registry.libraries.get_mut(&library) {
            lib.embedders += 1;
        }
        info!(
            "Initialized embedder {id} from library {library} ({}, pooling {pooling:?})",
            model_path.to_string_lossy()
        );
        Ok(id)
    }

    /// Release an embedder, then drop its reference on the library.
    pub fn free_embedder(&self, id: EmbedderId) -> Result<()> {
        self.free_embedder_inner(id).inspect_err(last_error::record)
    }

    fn free_embedder_inner(&self, id: EmbedderId) -> Result<()> {
        let mut registry = self.lock()?;
        let (record, engine) = registry.embedder(id)?;
        let (library, raw) = (record.library, record.raw);
        registry.embedders.remove(&id);

        let freed = guarded("free_embedder", || {
            engine.free(raw);
            Ok(())
        });
        drop(engine);

        if let Some(lib) = registry.libraries.get_mut(&library) {
            lib.embedders -= 1;
        }
        registry.unload_if_unused(library);
        info!("Freed embedder {id}");
        freed
    }

    /// Pooling type the embedder was created with.
    pub fn pooling(&self, id: EmbedderId) -> Result<PoolingType> {
        let registry = self.lock().inspect_err(last_error::record)?;
        registry
            .embedder(id)
            .map(|(record, _)| record.pooling)
            .inspect_err(last_error::record)
    }

    #[must_use]
    pub fn embedder_count(&self) -> usize {
        self.lock().map(|r| r.embedders.len()).unwrap_or(0)
    }

    // ── Invocation ───────────────────────────────────────────────────

    /// Embed `texts`; row `i` of the result belongs to `texts[i]`.
    ///
    /// An empty input yields an empty matrix without calling the engine.
    pub fn embed<S: AsRef<str>>(
        &self,
        id: EmbedderId,
        texts: &[S],
        normalization: Normalization,
    ) -> Result<EmbeddingMatrix> {
        let texts = to_cstrings(texts).inspect_err(last_error::record)?;
        let refs: Vec<&CStr> = texts.iter().map(CString::as_c_str).collect();
        self.embed_c(id, &refs, normalization)
    }

    pub(crate) fn embed_c(
        &self,
        id: EmbedderId,
        texts: &[&CStr],
        normalization: Normalization,
    ) -> Result<EmbeddingMatrix> {
        self.embed_inner(id, texts, normalization)
            .inspect_err(last_error::record)
    }

    fn embed_inner(
        &self,
        id: EmbedderId,
        texts: &[&CStr],
        normalization: Normalization,
    ) -> Result<EmbeddingMatrix> {
        let registry = self.lock()?;
        let (record, engine) = registry.embedder(id)?;
        if texts.is_empty() {
            return Ok(EmbeddingMatrix::empty());
        }

        let matrix = guarded("embed", || engine.embed(record.raw, texts, normalization))?;
        if matrix.rows() != texts.len() {
            return Err(BridgeError::invocation(
                "embed",
                format!("engine returned {} rows for {} texts", matrix.rows(), texts.len()),
            ));
        }
        debug!(
            "Embedded {} texts with embedder {id} ({normalization}), dim {}",
            matrix.rows(),
            matrix.cols()
        );
        Ok(matrix)
    }

    /// Model metadata flattened to `key=value` entries, in engine order.
    ///
    /// Pairs whose key contains `=` are dropped.
    pub fn metadata(&self, id: EmbedderId) -> Result<Vec<String>> {
        self.metadata_inner(id).inspect_err(last_error::record)
    }

    fn metadata_inner(&self, id: EmbedderId) -> Result<Vec<String>> {
        let registry = self.lock()?;
        let (record, engine) = registry.embedder(id)?;
        let pairs = guarded("get_metadata", || engine.metadata(record.raw))?;
        Ok(marshal::encode_metadata(pairs))
    }

    /// Token ids and attention masks, one entry per text.
    pub fn tokenize<S: AsRef<str>>(&self, id: EmbedderId, texts: &[S]) -> Result<Vec<Tokenized>> {
        let texts = to_cstrings(texts).inspect_err(last_error::record)?;
        let refs: Vec<&CStr> = texts.iter().map(CString::as_c_str).collect();
        self.tokenize_c(id, &refs)
    }

    pub(crate) fn tokenize_c(&self, id: EmbedderId, texts: &[&CStr]) -> Result<Vec<Tokenized>> {
        self.tokenize_inner(id, texts)
            .inspect_err(last_error::record)
    }

    fn tokenize_inner(&self, id: EmbedderId, texts: &[&CStr]) -> Result<Vec<Tokenized>> {
        let registry = self.lock()?;
        let (record, engine) = registry.embedder(id)?;
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let out = guarded("tokenize", || engine.tokenize(record.raw, texts))?;
        if out.len() != texts.len() {
            return Err(BridgeError::invocation(
                "tokenize",
                format!("engine returned {} sequences for {} texts", out.len(), texts.len()),
            ));
        }
        marshal::check_token_lengths(&out)?;
        Ok(out)
    }
}
