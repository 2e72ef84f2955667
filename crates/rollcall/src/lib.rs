//! `rollcall` - child-record key registry and realtime sync core
//!
//! This library keeps a collection of child records in a hierarchical tree
//! store consistent with the display names they carry: it creates missing
//! records, moves records stored under a stale key, and serves live,
//! rename-following streams of individual record fields.

#![warn(missing_docs)]
#![warn(missing_debug_implementations)]
#![deny(unsafe_code)]

pub mod cli;
pub mod config;
pub mod error;
pub mod key;
pub mod logging;
pub mod objects;
pub mod record;
pub mod registry;
pub mod store;

pub use config::Config;
pub use error::{Error, Result};
pub use key::{normalize, ChildKey};
pub use logging::init_logging;
pub use objects::{DirObjectStore, ObjectRef, ObjectStore};
pub use record::{ChildField, ChildRecord, ChildStatus, RecordDefaults};
pub use registry::{ChildKeyRegistry, FieldStream, FieldValue, RegistrySettings};
pub use store::{MemoryTreeStore, SqliteTreeStore, TreePath, TreeStore};
