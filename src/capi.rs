/// C-facing API functions for host-language bindings.
///
/// Each entry point works against [`Bridge::global`], never unwinds, and on
/// failure returns a sentinel (`0`, `-1`, null, or the zero matrix) after
/// writing the reason to the last-error channel. Every allocating call has
/// exactly one matching `embedder_free_*` release.
use std::collections::BTreeSet;
use std::ffi::{CStr, c_char};
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::ptr;
use std::sync::Mutex;

use tracing::warn;

use crate::bridge::{Bridge, EmbedderId, LibraryId};
use crate::error::{BridgeError, Result};
use crate::last_error;
use crate::logging;
use crate::marshal::{self, FloatMatrix, TokenSequence};
use crate::types::{Normalization, PoolingType};

const OK: i32 = 0;
const FAILED: i32 = -1;

/// Run `body`, mapping both errors and panics to `sentinel`.
fn boundary<T>(sentinel: T, body: impl FnOnce() -> Result<T>) -> T {
    match panic::catch_unwind(AssertUnwindSafe(body)) {
        Ok(Ok(value)) => value,
        // The bridge already recorded its own errors.
        Ok(Err(_)) => sentinel,
        Err(_) => {
            last_error::set_last_error("internal panic in embedder bridge");
            sentinel
        }
    }
}

/// Report an argument error that never reached the bridge.
fn reject<T>(err: BridgeError) -> Result<T> {
    last_error::record(&err);
    Err(err)
}

unsafe fn str_arg<'a>(ptr: *const c_char, name: &str) -> Result<&'a str> {
    if ptr.is_null() {
        return reject(BridgeError::invalid(format!("{name} is null")));
    }
    match unsafe { CStr::from_ptr(ptr) }.to_str() {
        Ok(s) => Ok(s),
        Err(e) => reject(BridgeError::invalid(format!("{name} is not UTF-8: {e}"))),
    }
}

unsafe fn texts_arg<'a>(texts: *const *const c_char, count: usize) -> Result<Vec<&'a CStr>> {
    if count == 0 {
        return Ok(Vec::new());
    }
    if texts.is_null() {
        return reject(BridgeError::invalid("texts is null"));
    }
    let ptrs = unsafe { std::slice::from_raw_parts(texts, count) };
    let mut out = Vec::with_capacity(count);
    for (i, &p) in ptrs.iter().enumerate() {
        if p.is_null() {
            return reject(BridgeError::invalid(format!("text {i} is null")));
        }
        out.push(unsafe { CStr::from_ptr(p) });
    }
    Ok(out)
}

/// Addresses of metadata and token arrays handed out and not yet released.
///
/// Catches double and foreign releases only until an address is reused.
static OUTSTANDING: Mutex<BTreeSet<usize>> = Mutex::new(BTreeSet::new());

fn track<T>(array: *mut T) -> *mut T {
    if !array.is_null() {
        let mut live = OUTSTANDING.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        live.insert(array.addr());
    }
    array
}

/// `true` if `array` was handed out and is now released by the caller.
fn untrack<T>(array: *mut T, kind: &str) -> bool {
    if array.is_null() {
        return false;
    }
    let mut live = OUTSTANDING.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let known = live.remove(&array.addr());
    if !known {
        warn!("Ignoring release of unknown or already released {kind} array");
    }
    known
}

fn embedder_arg(handle: u64) -> Result<EmbedderId> {
    EmbedderId::from_raw(handle).map_or_else(|| reject(BridgeError::UnknownEmbedder(0)), Ok)
}

fn normalization_arg(code: i32) -> Result<Normalization> {
    Normalization::try_from(code).or_else(reject)
}

// ── Libraries ────────────────────────────────────────────────────────

/// Load the engine library at `path`. Returns `0` on failure.
///
/// # Safety
///
/// `path` must be null or a NUL-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn embedder_load_library(path: *const c_char) -> u64 {
    boundary(0, || {
        let path = unsafe { str_arg(path, "library path") }?;
        Bridge::global()
            .load_library(Path::new(path))
            .map(LibraryId::as_raw)
    })
}

/// Drop one load reference. `0` is a no-op.
#[unsafe(no_mangle)]
pub extern "C" fn embedder_free_library(library: u64) {
    let Some(id) = LibraryId::from_raw(library) else {
        return;
    };
    boundary((), || Bridge::global().free_library(id));
}

// ── Embedders ────────────────────────────────────────────────────────

/// Initialize an embedder and store its handle in `out_embedder`.
///
/// Returns `0` on success and `-1` on failure, in which case
/// `out_embedder` is set to `0`.
///
/// # Safety
///
/// `model_path` must be null or a NUL-terminated string; `out_embedder` must
/// be null or writable.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn embedder_init(
    library: u64,
    model_path: *const c_char,
    pooling_type: u32,
    out_embedder: *mut u64,
) -> i32 {
    if let Some(out) = unsafe { out_embedder.as_mut() } {
        *out = 0;
    }
    boundary(FAILED, || {
        if out_embedder.is_null() {
            return reject(BridgeError::invalid("out_embedder is null"));
        }
        let library = LibraryId::from_raw(library)
            .map_or_else(|| reject(BridgeError::UnknownLibrary(0)), Ok)?;
        if model_path.is_null() {
            return reject(BridgeError::invalid("model path is null"));
        }
        let model_path = unsafe { CStr::from_ptr(model_path) };
        let pooling = PoolingType::try_from(pooling_type).or_else(reject)?;

        let id = Bridge::global().init_embedder_c(library, model_path, pooling)?;
        unsafe { *out_embedder = id.as_raw() };
        Ok(OK)
    })
}

/// Release an embedder. `0` is a no-op.
#[unsafe(no_mangle)]
pub extern "C" fn embedder_free(embedder: u64) {
    let Some(id) = EmbedderId::from_raw(embedder) else {
        return;
    };
    boundary((), || Bridge::global().free_embedder(id));
}

// ── Embedding ────────────────────────────────────────────────────────

/// Embed `text_count` texts. Returns the zero matrix on failure.
///
/// An empty input also yields the zero matrix without touching the error
/// channel; use [`embedder_embed_into`] to tell the two apart by status.
/// Release the result with [`embedder_free_matrix`].
///
/// # Safety
///
/// `texts` must point to `text_count` NUL-terminated strings.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn embedder_embed(
    embedder: u64,
    texts: *const *const c_char,
    text_count: usize,
    normalization: i32,
) -> FloatMatrix {
    let mut out = FloatMatrix::null();
    unsafe { embedder_embed_into(embedder, texts, text_count, normalization, &mut out) };
    out
}

/// Status-returning form of [`embedder_embed`].
///
/// Writes the matrix to `out` and returns `0`, or leaves `out` zeroed and
/// returns `-1`.
///
/// # Safety
///
/// As for [`embedder_embed`]; `out` must be null or writable.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn embedder_embed_into(
    embedder: u64,
    texts: *const *const c_char,
    text_count: usize,
    normalization: i32,
    out: *mut FloatMatrix,
) -> i32 {
    if let Some(out) = unsafe { out.as_mut() } {
        *out = FloatMatrix::null();
    }
    boundary(FAILED, || {
        if out.is_null() {
            return reject(BridgeError::invalid("output matrix is null"));
        }
        let id = embedder_arg(embedder)?;
        let normalization = normalization_arg(normalization)?;
        let texts = unsafe { texts_arg(texts, text_count) }?;

        let matrix = Bridge::global().embed_c(id, &texts, normalization)?;
        unsafe { *out = matrix.into_raw() };
        Ok(OK)
    })
}

/// Free a matrix from [`embedder_embed`] and zero it.
///
/// Safe to call on a null pointer or an already-released matrix.
///
/// # Safety
///
/// `matrix` must be null or a matrix returned by this library, unmodified.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn embedder_free_matrix(matrix: *mut FloatMatrix) {
    unsafe { marshal::release_matrix(matrix) };
}

// ── Metadata ─────────────────────────────────────────────────────────

/// Model metadata as `key=value` strings; the count goes to `out_size`.
///
/// Returns null with `*out_size == 0` on failure. Release with
/// [`embedder_free_metadata`].
///
/// # Safety
///
/// `out_size` must be null or writable.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn embedder_get_metadata(embedder: u64, out_size: *mut usize) -> *mut *mut c_char {
    if let Some(size) = unsafe { out_size.as_mut() } {
        *size = 0;
    }
    boundary(ptr::null_mut(), || {
        if out_size.is_null() {
            return reject(BridgeError::invalid("out_size is null"));
        }
        let id = embedder_arg(embedder)?;
        let entries = Bridge::global().metadata(id)?;
        let (array, len) = marshal::c_strings_into_raw(entries).or_else(reject)?;
        unsafe { *out_size = len };
        Ok(track(array))
    })
}

/// Free every entry from [`embedder_get_metadata`], then the array.
///
/// Arrays not currently handed out are ignored, so an immediate second
/// release is a no-op. Tracking is by address: once the allocator reuses a
/// released array's address for a newer array, a stale release of the old
/// pointer frees the newer one.
///
/// # Safety
///
/// `metadata` must be null or an array returned by this library together
/// with the size reported for it, not yet released.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn embedder_free_metadata(metadata: *mut *mut c_char, size: usize) {
    if untrack(metadata, "metadata") {
        unsafe { marshal::release_c_strings(metadata, size) };
    }
}

// ── Tokenize ─────────────────────────────────────────────────────────

/// Tokenize `text_count` texts; the sequence count goes to `out_size`.
///
/// Returns null on failure or for empty input. Release with
/// [`embedder_free_tokens`].
///
/// # Safety
///
/// `texts` must point to `text_count` NUL-terminated strings; `out_size`
/// must be null or writable.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn embedder_tokenize(
    embedder: u64,
    texts: *const *const c_char,
    text_count: usize,
    out_size: *mut usize,
) -> *mut TokenSequence {
    if let Some(size) = unsafe { out_size.as_mut() } {
        *size = 0;
    }
    boundary(ptr::null_mut(), || {
        if out_size.is_null() {
            return reject(BridgeError::invalid("out_size is null"));
        }
        let id = embedder_arg(embedder)?;
        let texts = unsafe { texts_arg(texts, text_count) }?;
        let seqs = Bridge::global().tokenize_c(id, &texts)?;
        let (array, len) = marshal::tokens_into_raw(seqs).or_else(reject)?;
        unsafe { *out_size = len };
        Ok(track(array))
    })
}

/// Free sequences from [`embedder_tokenize`].
///
/// Arrays not currently handed out are ignored, so an immediate second
/// release is a no-op. Tracking is by address: once the allocator reuses a
/// released array's address for a newer array, a stale release of the old
/// pointer frees the newer one.
///
/// # Safety
///
/// `tokens` must be null or an array returned by this library together with
/// the size reported for it, not yet released.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn embedder_free_tokens(tokens: *mut TokenSequence, size: usize) {
    if untrack(tokens, "token") {
        unsafe { marshal::release_tokens(tokens, size) };
    }
}

// ── Diagnostics ──────────────────────────────────────────────────────

/// Last recorded failure message, empty if none.
///
/// The pointer stays valid until the next failing call; copy it before
/// calling into the bridge again.
#[unsafe(no_mangle)]
pub extern "C" fn embedder_last_error() -> *const c_char {
    last_error::last_error_ptr()
}

/// Install a stderr `tracing` subscriber with the given filter directive
/// (`null` means `info`).
///
/// # Safety
///
/// `filter` must be null or a NUL-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn embedder_init_logging(filter: *const c_char) -> i32 {
    boundary(FAILED, || {
        let filter = if filter.is_null() {
            logging::DEFAULT_FILTER
        } else {
            unsafe { str_arg(filter, "log filter") }?
        };
        logging::init(filter).or_else(reject)?;
        Ok(OK)
    })
}
