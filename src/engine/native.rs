/// Native engine reached through C function pointers.
///
/// The pointers come either from a shared library opened with `libloading`
/// (the usual case) or from an engine linked statically into the host.
use std::ffi::{CStr, OsString, c_char, c_int, c_void};
use std::path::Path;
use std::ptr;
use std::sync::Arc;

use libloading::Library;
use tracing::{debug, info};

use super::{EmbeddingEngine, EngineLoader, RawEmbedder};
use crate::error::{BridgeError, Result};
use crate::marshal::{
    self, EmbeddingMatrix, FloatMatrix, MetadataPair, TokenSequence, Tokenized,
};
use crate::types::{Normalization, PoolingType};

/// Base name of the engine library; see [`library_file_name`].
pub const LIBRARY_BASE_NAME: &str = "llama-embedder";

pub const INIT_SYMBOL: &str = "init_embedder";
pub const FREE_SYMBOL: &str = "free_embedder";
pub const EMBED_SYMBOL: &str = "embed_c";
pub const GET_METADATA_SYMBOL: &str = "get_metadata_c";
pub const FREE_METADATA_SYMBOL: &str = "free_metadata_c";
pub const TOKENIZE_SYMBOL: &str = "tokenize_c";
pub const FREE_TOKENS_SYMBOL: &str = "free_tokenize_c";

pub type InitEmbedderFn = unsafe extern "C" fn(*const c_char, u32) -> *mut c_void;
pub type FreeEmbedderFn = unsafe extern "C" fn(*mut c_void);
/// Returns a matrix whose `data` was allocated with `malloc`.
pub type EmbedFn =
    unsafe extern "C" fn(*mut c_void, *const *const c_char, usize, i32) -> FloatMatrix;
pub type GetMetadataFn =
    unsafe extern "C" fn(*mut c_void, *mut *mut MetadataPair, *mut usize) -> c_int;
pub type FreeMetadataFn = unsafe extern "C" fn(*mut MetadataPair, usize);
pub type TokenizeFn = unsafe extern "C" fn(
    *mut c_void,
    *const *const c_char,
    usize,
    *mut *mut TokenSequence,
    *mut usize,
) -> c_int;
pub type FreeTokensFn = unsafe extern "C" fn(*mut TokenSequence, usize);

/// Platform file name of the engine library, e.g. `libllama-embedder.so`.
#[must_use]
pub fn library_file_name() -> OsString {
    libloading::library_filename(LIBRARY_BASE_NAME)
}

/// Resolved engine entry points.
///
/// The first five are required. The tokenizer pair is optional and only
/// used when both are present.
#[derive(Clone, Copy)]
pub struct FunctionTable {
    pub init: InitEmbedderFn,
    pub free: FreeEmbedderFn,
    pub embed: EmbedFn,
    pub get_metadata: GetMetadataFn,
    pub free_metadata: FreeMetadataFn,
    pub tokenize: Option<TokenizeFn>,
    pub free_tokens: Option<FreeTokensFn>,
}

impl FunctionTable {
    /// Resolve every required symbol from `library`, failing on the first
    /// one that is missing.
    ///
    /// # Safety
    ///
    /// The symbols must have the signatures declared above, and the returned
    /// table must not outlive `library`.
    pub unsafe fn resolve(library: &Library, path: &str) -> Result<Self> {
        unsafe {
            Ok(Self {
                init: required(library, path, INIT_SYMBOL)?,
                free: required(library, path, FREE_SYMBOL)?,
                embed: required(library, path, EMBED_SYMBOL)?,
                get_metadata: required(library, path, GET_METADATA_SYMBOL)?,
                free_metadata: required(library, path, FREE_METADATA_SYMBOL)?,
                tokenize: optional(library, TOKENIZE_SYMBOL),
                free_tokens: optional(library, FREE_TOKENS_SYMBOL),
            })
        }
    }
}

unsafe fn required<T: Copy>(library: &Library, path: &str, symbol: &'static str) -> Result<T> {
    let sym = unsafe { library.get::<T>(symbol.as_bytes()) }.map_err(|e| {
        BridgeError::MissingSymbol {
            path: path.to_string(),
            symbol,
            reason: e.to_string(),
        }
    })?;
    Ok(*sym)
}

unsafe fn optional<T: Copy>(library: &Library, symbol: &'static str) -> Option<T> {
    match unsafe { library.get::<T>(symbol.as_bytes()) } {
        Ok(sym) => Some(*sym),
        Err(e) => {
            debug!("Optional symbol {symbol} not available: {e}");
            None
        }
    }
}

/// Engine backed by a [`FunctionTable`].
pub struct NativeEngine {
    table: FunctionTable,
    // Keeps the table's code mapped; dropping it unloads the module.
    _library: Option<Library>,
}

impl NativeEngine {
    /// Open the shared library at `path` and resolve its entry points.
    ///
    /// On a missing symbol the library is closed again before returning.
    pub fn open(path: &Path) -> Result<Self> {
        let shown = path.display().to_string();
        let library = unsafe { Library::new(path) }.map_err(|e| BridgeError::LibraryLoad {
            path: shown.clone(),
            reason: e.to_string(),
        })?;
        let table = unsafe { FunctionTable::resolve(&library, &shown) }?;

        info!(
            "Loaded engine library {shown} (tokenizer: {})",
            table.tokenize.is_some() && table.free_tokens.is_some()
        );

        Ok(Self {
            table,
            _library: Some(library),
        })
    }

    /// Wrap entry points from an engine linked into the current binary.
    ///
    /// # Safety
    ///
    /// Every pointer must follow the engine's C contract for the lifetime of
    /// the returned value.
    #[must_use]
    pub unsafe fn from_table(table: FunctionTable) -> Self {
        Self {
            table,
            _library: None,
        }
    }

    fn tokenizer(&self) -> Option<(TokenizeFn, FreeTokensFn)> {
        self.table.tokenize.zip(self.table.free_tokens)
    }
}

impl EmbeddingEngine for NativeEngine {
    fn init(&self, model_path: &CStr, pooling: PoolingType) -> Result<RawEmbedder> {
        let ptr = unsafe { (self.table.init)(model_path.as_ptr(), pooling.code()) };
        // Native init signals failure only through a null return.
        RawEmbedder::from_ptr(ptr)
            .ok_or_else(|| BridgeError::InitFailed("embedder not initialized properly".to_string()))
    }

    fn free(&self, embedder: RawEmbedder) {
        unsafe { (self.table.free)(embedder.as_ptr()) };
    }

    fn embed(
        &self,
        embedder: RawEmbedder,
        texts: &[&CStr],
        normalization: Normalization,
    ) -> Result<EmbeddingMatrix> {
        let argv: Vec<*const c_char> = texts.iter().map(|t| t.as_ptr()).collect();
        let fm = unsafe {
            (self.table.embed)(
                embedder.as_ptr(),
                argv.as_ptr(),
                argv.len(),
                normalization.code(),
            )
        };

        let copied = unsafe { marshal::copy_native_matrix(&fm, texts.len()) };
        if !fm.data.is_null() {
            unsafe { libc::free(fm.data.cast()) };
        }
        copied
    }

    fn metadata(&self, embedder: RawEmbedder) -> Result<Vec<(String, String)>> {
        let mut pairs: *mut MetadataPair = ptr::null_mut();
        let mut size = 0usize;
        let status = unsafe { (self.table.get_metadata)(embedder.as_ptr(), &mut pairs, &mut size) };

        if status != 0 || pairs.is_null() {
            if !pairs.is_null() {
                unsafe { (self.table.free_metadata)(pairs, size) };
            }
            return Err(BridgeError::invocation(
                "get_metadata",
                format!("engine returned status {status}"),
            ));
        }

        let copied = unsafe { marshal::copy_native_pairs(pairs, size) };
        unsafe { (self.table.free_metadata)(pairs, size) };
        Ok(copied)
    }

    fn tokenize(&self, embedder: RawEmbedder, texts: &[&CStr]) -> Result<Vec<Tokenized>> {
        let Some((tokenize, free_tokens)) = self.tokenizer() else {
            return Err(BridgeError::Unsupported("tokenize"));
        };

        let argv: Vec<*const c_char> = texts.iter().map(|t| t.as_ptr()).collect();
        let mut seqs: *mut TokenSequence = ptr::null_mut();
        let mut size = 0usize;
        let status = unsafe {
            tokenize(
                embedder.as_ptr(),
                argv.as_ptr(),
                argv.len(),
                &mut seqs,
                &mut size,
            )
        };

        let copied = if status != 0 {
            Err(BridgeError::invocation(
                "tokenize",
                format!("engine returned status {status}"),
            ))
        } else if size != texts.len() {
            Err(BridgeError::invocation(
                "tokenize",
                format!("engine returned {size} sequences for {} texts", texts.len()),
            ))
        } else {
            unsafe { marshal::copy_native_tokens(seqs, size) }
        };
        if !seqs.is_null() {
            unsafe { free_tokens(seqs, size) };
        }
        copied
    }
}

/// Loader that opens engine libraries from disk.
#[derive(Debug, Default, Clone, Copy)]
pub struct DylibLoader;

impl EngineLoader for DylibLoader {
    fn load(&self, path: &Path) -> Result<Arc<dyn EmbeddingEngine>> {
        Ok(Arc::new(NativeEngine::open(path)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_file_name_has_base_name() {
        let name = library_file_name();
        let name = name.to_string_lossy();
        assert!(name.contains(LIBRARY_BASE_NAME), "got: {name}");
    }

    #[test]
    fn test_open_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(library_file_name());
        let err = NativeEngine::open(&path).err().unwrap();
        assert!(
            matches!(err, BridgeError::LibraryLoad { .. }),
            "unexpected error: {err}"
        );
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_open_library_without_engine_symbols() {
        // libc is always mapped and exports none of the engine symbols.
        let err = NativeEngine::open(Path::new("libc.so.6")).err().unwrap();
        match err {
            BridgeError::MissingSymbol { symbol, .. } => assert_eq!(symbol, INIT_SYMBOL),
            other => panic!("unexpected error: {other}"),
        }
    }
}
