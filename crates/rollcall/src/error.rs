//! Error types for rollcall.
//!
//! Store and object-store failures keep their own enums
//! ([`crate::store::StoreError`], [`crate::objects::ObjectError`]) so they can
//! travel over listener channels; they are wrapped here when they reach a
//! caller.

use std::path::PathBuf;
use thiserror::Error;

use crate::objects::ObjectError;
use crate::store::StoreError;

/// The main error type for rollcall operations.
#[derive(Error, Debug)]
pub enum Error {
    /// A tree store operation failed.
    #[error("tree store: {0}")]
    Store(#[from] StoreError),

    /// An object store lookup failed.
    #[error("object store: {0}")]
    Object(#[from] ObjectError),

    // === Local database ===
    /// The tree database could not be opened.
    #[error("cannot open tree database {path}: {source}")]
    Database {
        /// Database file.
        path: PathBuf,
        /// Cause reported by SQLite.
        #[source]
        source: rusqlite::Error,
    },

    /// A statement against the tree database failed.
    #[error("tree database: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// The stored schema version cannot be used by this build.
    #[error("unsupported tree database schema: {0}")]
    Schema(String),

    /// A directory needed by the database could not be created.
    #[error("cannot create {path}: {source}")]
    CreateDir {
        /// Directory that was being created.
        path: PathBuf,
        /// Cause.
        #[source]
        source: std::io::Error,
    },

    // === Configuration ===
    /// A configuration source could not be read or parsed.
    #[error("cannot load configuration: {0}")]
    Config(Box<figment::Error>),

    /// The merged configuration holds an unusable value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A record value could not be encoded.
    #[error("cannot encode record value: {0}")]
    Json(#[from] serde_json::Error),
}

/// A specialized Result type for rollcall operations.
pub type Result<T> = std::result::Result<T, Error>;

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Self::Config(Box::new(err))
    }
}

impl Error {
    /// Whether the error came from a remote store.
    ///
    /// Remote failures are transient from the session's point of view: the
    /// operation can be tried again with a fresh call.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Store(_) | Self::Object(_))
    }

    /// Whether the store refused the operation for lack of permission.
    #[must_use]
    pub fn is_permission_error(&self) -> bool {
        matches!(self, Self::Store(StoreError::PermissionDenied { .. }))
    }
}
