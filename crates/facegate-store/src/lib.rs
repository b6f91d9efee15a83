//! facegate-store — SQLite persistence for identities and face signatures.
//!
//! Feature vectors are stored as JSON arrays, optionally sealed with
//! AES-256-GCM when a store key is configured.

pub mod cipher;
mod sqlite;

pub use cipher::{CipherError, EmbeddingCipher};
pub use sqlite::SqliteStore;
