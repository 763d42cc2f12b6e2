/// Native engine tests against an in-process engine.
///
/// The fake entry points below follow the engine's C contract (malloc'd
/// embed output, engine-owned metadata and token arrays) so the whole
/// marshaling path runs without a shared library on disk.
use embedder_bridge::engine::native::{FunctionTable, NativeEngine};
use embedder_bridge::last_error::last_error;
use embedder_bridge::marshal::{FloatMatrix, MetadataPair, TokenSequence};
use embedder_bridge::{Bridge, BridgeError, Normalization, PoolingType};
use std::ffi::{CStr, c_char, c_int, c_void};
use std::path::Path;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

const COLS: usize = 4;

static SERIAL: Mutex<()> = Mutex::new(());
static LIVE_MODELS: AtomicUsize = AtomicUsize::new(0);

fn serial() -> MutexGuard<'static, ()> {
    SERIAL.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct FakeModel {
    pooling: u32,
}

unsafe extern "C" fn fake_init(model_path: *const c_char, pooling: u32) -> *mut c_void {
    let path = unsafe { CStr::from_ptr(model_path) };
    if path.to_bytes().ends_with(b"missing.gguf") {
        return ptr::null_mut();
    }
    LIVE_MODELS.fetch_add(1, Ordering::SeqCst);
    Box::into_raw(Box::new(FakeModel { pooling })).cast()
}

unsafe extern "C" fn fake_free(embedder: *mut c_void) {
    drop(unsafe { Box::from_raw(embedder.cast::<FakeModel>()) });
    LIVE_MODELS.fetch_sub(1, Ordering::SeqCst);
}

/// Row `i` is `[text length, normalization code, i, pooling code]`.
/// A text equal to `"fail"` makes the whole call return the null matrix.
unsafe extern "C" fn fake_embed(
    embedder: *mut c_void,
    texts: *const *const c_char,
    count: usize,
    normalization: i32,
) -> FloatMatrix {
    let model = unsafe { &*embedder.cast::<FakeModel>() };
    let texts = unsafe { std::slice::from_raw_parts(texts, count) };
    if texts
        .iter()
        .any(|&t| unsafe { CStr::from_ptr(t) }.to_bytes() == b"fail")
    {
        return FloatMatrix::null();
    }

    let data = unsafe { libc::malloc(count * COLS * size_of::<f32>()) }.cast::<f32>();
    let out = unsafe { std::slice::from_raw_parts_mut(data, count * COLS) };
    for (i, &t) in texts.iter().enumerate() {
        let len = unsafe { CStr::from_ptr(t) }.to_bytes().len();
        out[i * COLS..(i + 1) * COLS].copy_from_slice(&[
            len as f32,
            normalization as f32,
            i as f32,
            model.pooling as f32,
        ]);
    }
    FloatMatrix {
        data,
        rows: count,
        cols: COLS,
    }
}

unsafe extern "C" fn fake_get_metadata(
    _embedder: *mut c_void,
    out: *mut *mut MetadataPair,
    size: *mut usize,
) -> c_int {
    let pairs = vec![
        MetadataPair {
            key: c"general.architecture".as_ptr(),
            value: c"nomic-bert".as_ptr(),
        },
        MetadataPair {
            key: ptr::null(),
            value: c"orphan".as_ptr(),
        },
        MetadataPair {
            key: c"general.name".as_ptr(),
            value: c"nomic-embed-text-v1.5".as_ptr(),
        },
    ];
    unsafe {
        *size = pairs.len();
        *out = Box::into_raw(pairs.into_boxed_slice()).cast();
    }
    0
}

unsafe extern "C" fn fake_get_metadata_failing(
    _embedder: *mut c_void,
    _out: *mut *mut MetadataPair,
    _size: *mut usize,
) -> c_int {
    -1
}

unsafe extern "C" fn fake_free_metadata(pairs: *mut MetadataPair, size: usize) {
    drop(unsafe { Box::from_raw(ptr::slice_from_raw_parts_mut(pairs, size)) });
}

/// One token per byte.
unsafe extern "C" fn fake_tokenize(
    _embedder: *mut c_void,
    texts: *const *const c_char,
    count: usize,
    out: *mut *mut TokenSequence,
    size: *mut usize,
) -> c_int {
    let texts = unsafe { std::slice::from_raw_parts(texts, count) };
    let seqs: Vec<TokenSequence> = texts
        .iter()
        .map(|&t| {
            let bytes = unsafe { CStr::from_ptr(t) }.to_bytes();
            let tokens: Box<[i32]> = bytes.iter().map(|&b| i32::from(b)).collect();
            let mask: Box<[i32]> = vec![1; bytes.len()].into_boxed_slice();
            TokenSequence {
                tokens: Box::into_raw(tokens).cast(),
                attention_mask: Box::into_raw(mask).cast(),
                len: bytes.len(),
            }
        })
        .collect();
    unsafe {
        *size = seqs.len();
        *out = Box::into_raw(seqs.into_boxed_slice()).cast();
    }
    0
}

unsafe extern "C" fn fake_free_tokens(seqs: *mut TokenSequence, size: usize) {
    let seqs = unsafe { Box::from_raw(ptr::slice_from_raw_parts_mut(seqs, size)) };
    for seq in seqs.iter() {
        unsafe {
            drop(Box::from_raw(ptr::slice_from_raw_parts_mut(seq.tokens, seq.len)));
            drop(Box::from_raw(ptr::slice_from_raw_parts_mut(
                seq.attention_mask,
                seq.len,
            )));
        }
    }
}

fn fake_table() -> FunctionTable {
    FunctionTable {
        init: fake_init,
        free: fake_free,
        embed: fake_embed,
        get_metadata: fake_get_metadata,
        free_metadata: fake_free_metadata,
        tokenize: Some(fake_tokenize),
        free_tokens: Some(fake_free_tokens),
    }
}

fn register(bridge: &Bridge, table: FunctionTable) -> embedder_bridge::LibraryId {
    let engine = unsafe { NativeEngine::from_table(table) };
    bridge.register_engine(Arc::new(engine)).unwrap()
}

#[test]
fn test_native_embed_copies_rows_in_order() {
    let _guard = serial();
    let bridge = Bridge::new();
    let lib = register(&bridge, fake_table());
    let e = bridge
        .init_embedder(lib, Path::new("models/nomic.gguf"), PoolingType::Cls)
        .unwrap();

    let m = bridge
        .embed(e, &["a", "abc", "abcdef"], Normalization::Taxicab)
        .unwrap();
    assert_eq!((m.rows(), m.cols()), (3, COLS));
    assert_eq!(m.row(0).unwrap(), &[1.0, 1.0, 0.0, 2.0]);
    assert_eq!(m.row(1).unwrap(), &[3.0, 1.0, 1.0, 2.0]);
    assert_eq!(m.row(2).unwrap(), &[6.0, 1.0, 2.0, 2.0]);

    bridge.free_embedder(e).unwrap();
    bridge.free_library(lib).unwrap();
    assert_eq!(LIVE_MODELS.load(Ordering::SeqCst), 0);
}

#[test]
fn test_native_null_init_is_reported() {
    let _guard = serial();
    let bridge = Bridge::new();
    let lib = register(&bridge, fake_table());

    let err = bridge
        .init_embedder(lib, Path::new("models/missing.gguf"), PoolingType::Mean)
        .unwrap_err();
    assert!(matches!(err, BridgeError::InitFailed(_)));
    assert_eq!(
        last_error(),
        "failed to initialize embedder: embedder not initialized properly"
    );
    assert_eq!(bridge.library_refs(lib), Some(1));
}

#[test]
fn test_native_null_matrix_is_failure() {
    let _guard = serial();
    let bridge = Bridge::new();
    let lib = register(&bridge, fake_table());
    let e = bridge
        .init_embedder(lib, Path::new("models/nomic.gguf"), PoolingType::Mean)
        .unwrap();

    assert!(bridge.embed(e, &["ok", "fail"], Normalization::Euclidean).is_err());
    assert!(last_error().starts_with("embed failed"), "got: {}", last_error());

    // Still usable afterwards
    assert_eq!(bridge.embed(e, &["ok"], Normalization::Euclidean).unwrap().rows(), 1);
    bridge.free_embedder(e).unwrap();
}

#[test]
fn test_native_metadata_skips_null_entries() {
    let _guard = serial();
    let bridge = Bridge::new();
    let lib = register(&bridge, fake_table());
    let e = bridge
        .init_embedder(lib, Path::new("models/nomic.gguf"), PoolingType::Mean)
        .unwrap();

    assert_eq!(
        bridge.metadata(e).unwrap(),
        vec![
            "general.architecture=nomic-bert".to_string(),
            "general.name=nomic-embed-text-v1.5".to_string(),
        ]
    );
    bridge.free_embedder(e).unwrap();
}

#[test]
fn test_native_metadata_status_failure() {
    let _guard = serial();
    let bridge = Bridge::new();
    let lib = register(
        &bridge,
        FunctionTable {
            get_metadata: fake_get_metadata_failing,
            ..fake_table()
        },
    );
    let e = bridge
        .init_embedder(lib, Path::new("models/nomic.gguf"), PoolingType::Mean)
        .unwrap();

    assert!(bridge.metadata(e).is_err());
    assert_eq!(last_error(), "get_metadata failed: engine returned status -1");
    bridge.free_embedder(e).unwrap();
}

#[test]
fn test_native_tokenize() {
    let _guard = serial();
    let bridge = Bridge::new();
    let lib = register(&bridge, fake_table());
    let e = bridge
        .init_embedder(lib, Path::new("models/nomic.gguf"), PoolingType::Mean)
        .unwrap();

    let out = bridge.tokenize(e, &["hi", "abc"]).unwrap();
    assert_eq!(out[0].tokens, vec![104, 105]);
    assert_eq!(out[1].tokens, vec![97, 98, 99]);
    assert_eq!(out[1].attention_mask, vec![1, 1, 1]);
    bridge.free_embedder(e).unwrap();
}

#[test]
fn test_native_tokenize_unsupported_without_symbols() {
    let _guard = serial();
    let bridge = Bridge::new();
    let lib = register(
        &bridge,
        FunctionTable {
            tokenize: None,
            free_tokens: None,
            ..fake_table()
        },
    );
    let e = bridge
        .init_embedder(lib, Path::new("models/nomic.gguf"), PoolingType::Mean)
        .unwrap();

    let err = bridge.tokenize(e, &["hi"]).unwrap_err();
    assert!(matches!(err, BridgeError::Unsupported("tokenize")));
    bridge.free_embedder(e).unwrap();
}
