//! # embedder-bridge: Embedding Engine Bridge
//!
//! Loads a native text-embedding engine (`libllama-embedder`) at runtime and
//! exposes it to host languages through a small, handle-based C ABI, and to
//! Rust callers through [`Bridge`] and [`EmbedderSession`].
//!
//! ## Architecture
//!
//! - **[`bridge`]** - Handle registry, reference counting, and the lock that serializes engine calls
//! - **[`capi`]** - `extern "C"` entry points with sentinel returns and paired release functions
//! - **[`engine`]** - Engine trait, the `libloading`-backed native engine, and a mock for tests
//! - **[`marshal`]** - Owned buffers crossing the boundary (matrices, `key=value` arrays, tokens)
//! - **[`last_error`]** - Process-wide last-error message channel
//! - **[`types`]** - Pooling and normalization codes
//! - **[`config`]** - JSON session configuration and library path resolution
//! - **[`download`]** - Engine library and HuggingFace model download into the shared cache
//! - **[`session`]** - Scoped library + embedder pair for Rust hosts
//! - **[`logging`]** - Opt-in stderr `tracing` subscriber

pub mod bridge;
pub mod capi;
pub mod config;
pub mod download;
pub mod engine;
pub mod error;
pub mod last_error;
pub mod logging;
pub mod marshal;
pub mod session;
pub mod types;

pub use bridge::{Bridge, EmbedderId, LibraryId};
pub use config::EmbedderConfig;
pub use error::{BridgeError, Result};
pub use marshal::{EmbeddingMatrix, Tokenized};
pub use session::EmbedderSession;
pub use types::{Normalization, PoolingType};
