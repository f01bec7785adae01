//! Arkivist is a queryable key-value document store.
//!
//! Documents live in an insertion-ordered in-memory map of JSON values and are
//! optionally persisted to a single JSON file, either in plain text or wrapped
//! in an AES-256-GCM encrypted envelope.
//!
//! ## Core Components
//! - [`engine`]: The store, its query builder, the persistence codec and the key vault.
//! - [`server`]: TCP daemon exposing one store over a line protocol.

pub mod engine;
pub mod server;

use std::path::PathBuf;
use thiserror::Error;

pub use engine::{Arkivist, Filter, Options, Query, QuerySpec, ReadMode};

/// Errors returned by Arkivist.
#[derive(Error, Debug)]
pub enum Error {
    /// The file read mode is not one of `r`, `r+` or `w+`.
    #[error("unsupported file read mode `{0}`, use `r`, `r+` or `w+`")]
    UnsupportedReadMode(String),
    /// The file does not carry the expected extension.
    #[error("unsupported file {0:?}, expected a .{1} file")]
    UnsupportedFile(PathBuf, &'static str),
    /// The encrypted envelope has an unsupported version or algorithm.
    #[error("the file is not compatible with arkivist: {0}")]
    Incompatible(String),
    /// The store is not bound to a file.
    #[error("no file path bound to the store")]
    NoFilePath,
    /// Encryption or decryption was requested but no key is loaded.
    #[error("encryption key is missing")]
    MissingCipher,
    /// The key material is malformed.
    #[error("invalid key: {0}")]
    InvalidKey(String),
    /// The payload could not be decrypted.
    #[error("decryption failed (wrong key or tampered data)")]
    Decryption,
    /// The elements of a sequence cannot be sorted together.
    #[error("values at `{0}` cannot be sorted")]
    Unorderable(String),
    /// A value cannot be used as a key.
    #[error("value at `{0}` cannot be used as a key")]
    Unhashable(String),
    /// Two values map to the same key.
    #[error("duplicate value `{0}`")]
    DuplicateValue(String),
    /// Remote fetch failed.
    #[error("fetch error: {0}")]
    Fetch(String),
    /// An internal error occurred.
    #[error("internal error: {0}")]
    Internal(String),
    /// An I/O error occurred during persistence or network communication.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Error during JSON serialization or deserialization.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A specialized Result type for Arkivist operations.
pub type Result<T> = std::result::Result<T, Error>;

/// An insertion-ordered JSON object, the unit every store operation works on.
pub type Document = serde_json::Map<String, serde_json::Value>;
