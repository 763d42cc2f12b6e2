/// Result marshaling between engine-native buffers, owned Rust values, and
/// caller-owned C buffers.
///
/// Inbound (`copy_native_*`) functions copy out of buffers the engine still
/// owns; the engine's own release call runs afterwards. Outbound
/// (`*_into_raw`) functions hand a single allocation to the caller, and each
/// has exactly one `release_*` counterpart accepting the same shape.
use std::collections::BTreeMap;
use std::ffi::{CStr, CString, c_char};
use std::ptr;

use tracing::warn;

use crate::error::{BridgeError, Result};

/// Separator between key and value in flattened metadata entries.
pub const METADATA_SEPARATOR: char = '=';

// ── C layouts ────────────────────────────────────────────────────────

/// Row-major `rows × cols` float buffer.
///
/// Shared layout for the engine's `embed_c` return value and the matrix the
/// bridge hands to callers.
#[repr(C)]
#[derive(Debug)]
pub struct FloatMatrix {
    pub data: *mut f32,
    pub rows: usize,
    pub cols: usize,
}

impl FloatMatrix {
    /// The zero matrix, also used as the failure sentinel.
    #[must_use]
    pub const fn null() -> Self {
        Self {
            data: ptr::null_mut(),
            rows: 0,
            cols: 0,
        }
    }
}

/// One metadata entry as produced by the engine's `get_metadata_c`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct MetadataPair {
    pub key: *const c_char,
    pub value: *const c_char,
}

/// Token ids and attention mask for one input text, both `len` long.
#[repr(C)]
#[derive(Debug)]
pub struct TokenSequence {
    pub tokens: *mut i32,
    pub attention_mask: *mut i32,
    pub len: usize,
}

// ── Embedding matrix ─────────────────────────────────────────────────

/// Owned embedding output, one row per input text.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingMatrix {
    data: Vec<f32>,
    rows: usize,
    cols: usize,
}

impl EmbeddingMatrix {
    /// Wrap a row-major buffer, checking that it is exactly `rows × cols`.
    pub fn new(data: Vec<f32>, rows: usize, cols: usize) -> Result<Self> {
        let expected = rows
            .checked_mul(cols)
            .ok_or_else(|| BridgeError::invalid(format!("matrix {rows}x{cols} overflows")))?;
        if data.len() != expected {
            return Err(BridgeError::invalid(format!(
                "matrix {rows}x{cols} needs {expected} values, got {}",
                data.len()
            )));
        }
        Ok(Self { data, rows, cols })
    }

    /// Result for an empty input set.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            data: Vec::new(),
            rows: 0,
            cols: 0,
        }
    }

    /// Build from per-text vectors; every row must have the same length.
    pub fn from_rows(rows: Vec<Vec<f32>>) -> Result<Self> {
        let Some(cols) = rows.first().map(Vec::len) else {
            return Ok(Self::empty());
        };
        let n = rows.len();
        let mut data = Vec::new();
        data.try_reserve_exact(n * cols)
            .map_err(|e| BridgeError::Allocation(format!("{n}x{cols} embedding matrix: {e}")))?;
        for (i, row) in rows.into_iter().enumerate() {
            if row.len() != cols {
                return Err(BridgeError::invalid(format!(
                    "row {i} has {} columns, expected {cols}",
                    row.len()
                )));
            }
            data.extend(row);
        }
        Ok(Self {
            data,
            rows: n,
            cols,
        })
    }

    #[must_use]
    pub fn rows(&self) -> usize {
        self.rows
    }

    #[must_use]
    pub fn cols(&self) -> usize {
        self.cols
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    /// Row `i`, or `None` if out of range.
    #[must_use]
    pub fn row(&self, i: usize) -> Option<&[f32]> {
        if i >= self.rows {
            return None;
        }
        let start = i * self.cols;
        Some(&self.data[start..start + self.cols])
    }

    pub fn iter_rows(&self) -> impl Iterator<Item = &[f32]> {
        (0..self.rows).filter_map(|i| self.row(i))
    }

    #[must_use]
    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    #[must_use]
    pub fn into_rows(self) -> Vec<Vec<f32>> {
        if self.cols == 0 {
            return vec![Vec::new(); self.rows];
        }
        self.data.chunks(self.cols).map(<[f32]>::to_vec).collect()
    }

    /// Transfer ownership to a C caller. Release with [`release_matrix`].
    #[must_use]
    pub fn into_raw(self) -> FloatMatrix {
        if self.data.is_empty() {
            return FloatMatrix {
                data: ptr::null_mut(),
                rows: self.rows,
                cols: self.cols,
            };
        }
        let boxed = self.data.into_boxed_slice();
        FloatMatrix {
            data: Box::into_raw(boxed).cast::<f32>(),
            rows: self.rows,
            cols: self.cols,
        }
    }
}

/// Copy an engine-owned matrix, expecting one row per input text.
///
/// # Safety
///
/// `fm.data` must be null or point to at least `fm.rows * fm.cols` floats.
pub unsafe fn copy_native_matrix(fm: &FloatMatrix, expected_rows: usize) -> Result<EmbeddingMatrix> {
    if fm.rows != expected_rows {
        return Err(BridgeError::invocation(
            "embed",
            format!("engine returned {} rows for {expected_rows} texts", fm.rows),
        ));
    }
    if fm.rows == 0 {
        return Ok(EmbeddingMatrix::empty());
    }
    if fm.cols == 0 {
        return Err(BridgeError::invocation(
            "embed",
            "engine returned zero-width embeddings",
        ));
    }
    if fm.data.is_null() {
        return Err(BridgeError::invocation("embed", "engine returned a null matrix"));
    }
    let len = fm.rows.checked_mul(fm.cols).ok_or_else(|| {
        BridgeError::invocation("embed", format!("matrix {}x{} overflows", fm.rows, fm.cols))
    })?;

    let src = unsafe { std::slice::from_raw_parts(fm.data, len) };
    let mut data = Vec::new();
    data.try_reserve_exact(len).map_err(|e| {
        BridgeError::Allocation(format!("{}x{} embedding matrix: {e}", fm.rows, fm.cols))
    })?;
    data.extend_from_slice(src);
    EmbeddingMatrix::new(data, fm.rows, fm.cols)
}

/// Free a matrix produced by [`EmbeddingMatrix::into_raw`] and null it out.
///
/// Null pointers and already-released matrices are no-ops.
///
/// # Safety
///
/// `fm` must be null or point to a matrix returned by this crate whose
/// `rows`/`cols` were not modified.
pub unsafe fn release_matrix(fm: *mut FloatMatrix) {
    let Some(fm) = (unsafe { fm.as_mut() }) else {
        return;
    };
    if !fm.data.is_null() {
        let len = fm.rows * fm.cols;
        drop(unsafe { Box::from_raw(ptr::slice_from_raw_parts_mut(fm.data, len)) });
    }
    *fm = FloatMatrix::null();
}

// ── Metadata ─────────────────────────────────────────────────────────

/// Copy engine-owned pairs, skipping any with a null key or value.
///
/// # Safety
///
/// `pairs` must be null or point to `len` pairs whose non-null members are
/// NUL-terminated strings.
pub unsafe fn copy_native_pairs(pairs: *const MetadataPair, len: usize) -> Vec<(String, String)> {
    if pairs.is_null() {
        return Vec::new();
    }
    let pairs = unsafe { std::slice::from_raw_parts(pairs, len) };
    let mut out = Vec::with_capacity(len);
    for (i, pair) in pairs.iter().enumerate() {
        if pair.key.is_null() || pair.value.is_null() {
            warn!("Null key or value at metadata index {i}, skipping");
            continue;
        }
        let key = unsafe { CStr::from_ptr(pair.key) }.to_string_lossy().into_owned();
        let value = unsafe { CStr::from_ptr(pair.value) }.to_string_lossy().into_owned();
        out.push((key, value));
    }
    out
}

/// Flatten one pair into `key=value`.
///
/// Keys containing the separator are rejected since the entry could not be
/// decoded back unambiguously. Values may contain it: decoding splits at the
/// first separator only.
pub fn encode_pair(key: &str, value: &str) -> Result<String> {
    if key.contains(METADATA_SEPARATOR) {
        return Err(BridgeError::invalid(format!(
            "metadata key {key:?} contains '{METADATA_SEPARATOR}'"
        )));
    }
    Ok(format!("{key}{METADATA_SEPARATOR}{value}"))
}

/// Split a `key=value` entry at its first separator.
#[must_use]
pub fn decode_pair(entry: &str) -> Option<(&str, &str)> {
    entry.split_once(METADATA_SEPARATOR)
}

/// Flatten a metadata collection in order, dropping keys that cannot be
/// encoded.
pub fn encode_metadata<I, K, V>(pairs: I) -> Vec<String>
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: AsRef<str>,
{
    pairs
        .into_iter()
        .filter_map(|(k, v)| match encode_pair(k.as_ref(), v.as_ref()) {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!("Skipping metadata entry: {e}");
                None
            }
        })
        .collect()
}

/// Rebuild the map from flattened entries. Later duplicates win.
pub fn decode_metadata<I, S>(entries: I) -> BTreeMap<String, String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    entries
        .into_iter()
        .filter_map(|entry| {
            decode_pair(entry.as_ref()).map(|(k, v)| (k.to_string(), v.to_string()))
        })
        .collect()
}

/// Hand flattened entries to a C caller as `char**` plus a count.
///
/// An empty list is returned as a null pointer with count zero. Release with
/// [`release_c_strings`].
pub fn c_strings_into_raw(entries: Vec<String>) -> Result<(*mut *mut c_char, usize)> {
    if entries.is_empty() {
        return Ok((ptr::null_mut(), 0));
    }
    let mut raw: Vec<*mut c_char> = Vec::new();
    raw.try_reserve_exact(entries.len())
        .map_err(|e| BridgeError::Allocation(format!("{} metadata entries: {e}", entries.len())))?;
    for entry in entries {
        match CString::new(entry) {
            Ok(c) => raw.push(c.into_raw()),
            Err(e) => {
                // Already-converted entries would leak otherwise.
                let len = raw.len();
                let boxed = raw.into_boxed_slice();
                unsafe { release_c_strings(Box::into_raw(boxed).cast(), len) };
                return Err(BridgeError::invalid(format!("metadata entry contains NUL: {e}")));
            }
        }
    }
    let len = raw.len();
    Ok((Box::into_raw(raw.into_boxed_slice()).cast(), len))
}

/// Free an array from [`c_strings_into_raw`]: every element, then the
/// container.
///
/// # Safety
///
/// `array` must be null or a pointer returned by [`c_strings_into_raw`]
/// together with the `len` it reported, not yet released.
pub unsafe fn release_c_strings(array: *mut *mut c_char, len: usize) {
    if array.is_null() {
        return;
    }
    let entries = unsafe { Box::from_raw(ptr::slice_from_raw_parts_mut(array, len)) };
    for &entry in entries.iter() {
        if !entry.is_null() {
            drop(unsafe { CString::from_raw(entry) });
        }
    }
}

// ── Tokens ───────────────────────────────────────────────────────────

/// Owned tokenizer output for one text.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Tokenized {
    pub tokens: Vec<i32>,
    pub attention_mask: Vec<i32>,
}

/// Copy engine-owned token sequences.
///
/// # Safety
///
/// `seqs` must be null or point to `len` sequences whose non-null arrays hold
/// `seq.len` values each.
pub unsafe fn copy_native_tokens(seqs: *const TokenSequence, len: usize) -> Result<Vec<Tokenized>> {
    if seqs.is_null() {
        return Err(BridgeError::invocation("tokenize", "engine returned null tokens"));
    }
    let seqs = unsafe { std::slice::from_raw_parts(seqs, len) };
    seqs.iter()
        .map(|seq| -> Result<Tokenized> {
            Ok(Tokenized {
                tokens: unsafe { copy_i32s(seq.tokens, seq.len) }?,
                attention_mask: unsafe { copy_i32s(seq.attention_mask, seq.len) }?,
            })
        })
        .collect()
}

unsafe fn copy_i32s(src: *const i32, len: usize) -> Result<Vec<i32>> {
    if len == 0 {
        return Ok(Vec::new());
    }
    if src.is_null() {
        return Err(BridgeError::invocation(
            "tokenize",
            format!("engine returned a null array for {len} tokens"),
        ));
    }
    let mut out = Vec::new();
    out.try_reserve_exact(len)
        .map_err(|e| BridgeError::Allocation(format!("{len} tokens: {e}")))?;
    out.extend_from_slice(unsafe { std::slice::from_raw_parts(src, len) });
    Ok(out)
}

/// Check that every sequence's mask is as long as its token ids.
pub fn check_token_lengths(seqs: &[Tokenized]) -> Result<()> {
    match seqs
        .iter()
        .position(|t| t.tokens.len() != t.attention_mask.len())
    {
        Some(i) => Err(BridgeError::invocation(
            "tokenize",
            format!(
                "sequence {i} has {} tokens but {} mask values",
                seqs[i].tokens.len(),
                seqs[i].attention_mask.len()
            ),
        )),
        None => Ok(()),
    }
}

/// Hand token sequences to a C caller. Release with [`release_tokens`].
///
/// Both arrays of a sequence share one `len`, so sequences whose mask and
/// ids differ in length are rejected.
pub fn tokens_into_raw(seqs: Vec<Tokenized>) -> Result<(*mut TokenSequence, usize)> {
    check_token_lengths(&seqs)?;
    if seqs.is_empty() {
        return Ok((ptr::null_mut(), 0));
    }
    let raw: Vec<TokenSequence> = seqs
        .into_iter()
        .map(|t| {
            let len = t.tokens.len();
            TokenSequence {
                tokens: i32s_into_raw(t.tokens),
                attention_mask: i32s_into_raw(t.attention_mask),
                len,
            }
        })
        .collect();
    let len = raw.len();
    Ok((Box::into_raw(raw.into_boxed_slice()).cast(), len))
}

fn i32s_into_raw(values: Vec<i32>) -> *mut i32 {
    if values.is_empty() {
        return ptr::null_mut();
    }
    Box::into_raw(values.into_boxed_slice()).cast()
}

/// Free sequences from [`tokens_into_raw`].
///
/// # Safety
///
/// `seqs` must be null or a pointer returned by [`tokens_into_raw`] together
/// with the `len` it reported, not yet released.
pub unsafe fn release_tokens(seqs: *mut TokenSequence, len: usize) {
    if seqs.is_null() {
        return;
    }
    let seqs = unsafe { Box::from_raw(ptr::slice_from_raw_parts_mut(seqs, len)) };
    for seq in seqs.iter() {
        for array in [seq.tokens, seq.attention_mask] {
            if !array.is_null() {
                drop(unsafe { Box::from_raw(ptr::slice_from_raw_parts_mut(array, seq.len)) });
            }
        }
    }
}
