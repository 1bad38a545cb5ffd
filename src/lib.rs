//! Single-owner handles for externally-acquired resources.
//!
//! # Intention
//!
//! - Bind a raw handle (connection, cursor, buffer pointer) to the call that
//!   releases it, and run that call exactly once when ownership ends.
//! - Show the wrapper against a real external API: SQLite's C interface as a
//!   key-value store, its statements as cursors, and whole-file buffers.
//!
//! # Architectural Boundaries
//!
//! - `handle` is generic and knows nothing about any particular resource.
//! - Storage semantics belong to SQLite; `kv` and `cursor` only bind to it.
//! - The wrapper never reports a status of its own. Errors come from the
//!   engine or from argument checks in the bindings.

pub mod config;
pub mod cursor;
pub mod error;
pub mod file_view;
pub mod handle;
pub mod kv;

pub use config::{KvConfig, OpenMode};
pub use cursor::Cursor;
pub use error::{KvError, KvResult};
pub use file_view::FileView;
pub use handle::{HandleKind, ReleaseFn, UniqueHandle};
pub use kv::KvStore;
