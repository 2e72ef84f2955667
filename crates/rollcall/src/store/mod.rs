//! Remote tree store boundary.
//!
//! Child records live in a path-addressed hierarchical key-value store. This
//! module defines the [`TreeStore`] trait the registry talks to, the path and
//! listener payload types, and ships two backends:
//!
//! - [`memory::MemoryTreeStore`], an in-process tree with fault injection
//! - [`sqlite::SqliteTreeStore`], a persistent tree kept in `SQLite`
//!
//! Both backends deliver listener notifications through the shared
//! [`hub::ChangeHub`].

pub mod hub;
pub mod memory;
pub mod sqlite;

use std::fmt;

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::broadcast;

pub use memory::MemoryTreeStore;
pub use sqlite::SqliteTreeStore;

/// Characters a path segment may not contain.
const FORBIDDEN_SEGMENT_CHARS: &[char] = &['.', '#', '$', '[', ']', '/'];

/// Errors reported by a tree store.
///
/// Store errors are `Clone` so they can be delivered to every listener of a
/// path.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The store cannot be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The caller may not perform this operation.
    #[error("permission denied at {path}")]
    PermissionDenied {
        /// Path the operation targeted.
        path: String,
    },

    /// A path or path segment is malformed.
    #[error("invalid path '{path}': {reason}")]
    InvalidPath {
        /// The offending path.
        path: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The backend failed.
    #[error("store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Create a backend error.
    #[must_use]
    pub fn backend(message: impl fmt::Display) -> Self {
        Self::Backend(message.to_string())
    }

    /// Check if this error means the store is unreachable.
    #[must_use]
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Result type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// What a value listener receives: the new value at its path, or an error.
pub type ValueChange = StoreResult<Option<Value>>;

/// A slash-separated path into the tree.
///
/// The empty path is the root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct TreePath {
    segments: Vec<String>,
}

impl TreePath {
    /// The root of the tree.
    #[must_use]
    pub fn root() -> Self {
        Self::default()
    }

    /// Parse a slash-separated path. Leading and trailing slashes are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidPath`] if any segment is empty or
    /// contains a forbidden character.
    pub fn parse(path: &str) -> StoreResult<Self> {
        let trimmed = path.trim_matches('/');
        if trimmed.is_empty() {
            return Ok(Self::root());
        }

        let mut segments = Vec::new();
        for segment in trimmed.split('/') {
            validate_segment(path, segment)?;
            segments.push(segment.to_string());
        }
        Ok(Self { segments })
    }

    /// Append one segment.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidPath`] if the segment is invalid.
    pub fn child(&self, segment: &str) -> StoreResult<Self> {
        validate_segment(&format!("{self}/{segment}"), segment)?;
        let mut segments = self.segments.clone();
        segments.push(segment.to_string());
        Ok(Self { segments })
    }

    /// The path's segments.
    #[must_use]
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// The last segment, or `None` for the root.
    #[must_use]
    pub fn last(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    /// Check whether this is the root path.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// The parent path, or `None` for the root.
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            return None;
        }
        Some(Self {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        })
    }

    /// All proper ancestors, root first.
    #[must_use]
    pub fn ancestors(&self) -> Vec<Self> {
        (0..self.segments.len())
            .map(|len| Self {
                segments: self.segments[..len].to_vec(),
            })
            .collect()
    }

    /// Check whether `self` equals `other` or is one of its ancestors.
    #[must_use]
    pub fn contains(&self, other: &Self) -> bool {
        other.segments.len() >= self.segments.len()
            && self.segments[..] == other.segments[..self.segments.len()]
    }

    /// Check whether a change at one path can affect a listener at the other.
    #[must_use]
    pub fn is_related(&self, other: &Self) -> bool {
        self.contains(other) || other.contains(self)
    }

    /// The path as stored: segments joined by `/`, empty for the root.
    #[must_use]
    pub fn as_key(&self) -> String {
        self.segments.join("/")
    }
}

impl fmt::Display for TreePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.segments.join("/"))
    }
}

fn validate_segment(path: &str, segment: &str) -> StoreResult<()> {
    let reason = if segment.is_empty() {
        Some("empty segment".to_string())
    } else if let Some(c) = segment.chars().find(|c| FORBIDDEN_SEGMENT_CHARS.contains(c)) {
        Some(format!("segment '{segment}' contains '{c}'"))
    } else if segment.chars().any(char::is_control) {
        Some(format!("segment '{segment}' contains a control character"))
    } else {
        None
    };

    match reason {
        Some(reason) => Err(StoreError::InvalidPath {
            path: path.to_string(),
            reason,
        }),
        None => Ok(()),
    }
}

/// A change in the set of children directly under a watched path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChildEvent {
    /// A child key appeared.
    Added(String),
    /// A child key disappeared.
    Removed(String),
}

/// A path-addressed hierarchical key-value store.
///
/// Writing `Value::Null` is the same as removing. Listener registration is
/// local and succeeds even while the store is unreachable; the listener then
/// receives errors until the store recovers.
#[async_trait::async_trait]
pub trait TreeStore: Send + Sync + fmt::Debug {
    /// Read the value at a path. `None` if nothing is stored there.
    async fn get(&self, path: &TreePath) -> StoreResult<Option<Value>>;

    /// Replace the value at a path.
    async fn set(&self, path: &TreePath, value: Value) -> StoreResult<()>;

    /// Merge `fields` into the object at a path, one child per entry.
    async fn update(&self, path: &TreePath, fields: Map<String, Value>) -> StoreResult<()>;

    /// Delete the value at a path.
    async fn remove(&self, path: &TreePath) -> StoreResult<()>;

    /// Store `value` under a fresh, store-generated child key of `path`.
    ///
    /// Returns the generated key. Keys sort in creation order.
    async fn push(&self, path: &TreePath, value: Value) -> StoreResult<String>;

    /// Listen for the full value at a path after every related change.
    async fn watch_value(&self, path: &TreePath) -> StoreResult<broadcast::Receiver<ValueChange>>;

    /// Listen for children being added to or removed from a path.
    ///
    /// Children present at registration time are not reported.
    async fn watch_children(&self, path: &TreePath) -> StoreResult<broadcast::Receiver<ChildEvent>>;
}

/// Generates push keys that sort in creation order.
///
/// Keys are the creation time in milliseconds followed by a counter that
/// resets whenever the millisecond changes.
#[derive(Debug, Default)]
pub struct PushIdGenerator {
    last: Mutex<(i64, u32)>,
}

impl PushIdGenerator {
    /// Create a new generator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Produce the next key.
    pub fn next_id(&self) -> String {
        let now = Utc::now().timestamp_millis();
        let mut last = self.last.lock();
        let (millis, counter) = if now > last.0 {
            (now, 0)
        } else {
            (last.0, last.1 + 1)
        };
        *last = (millis, counter);
        format!("{millis:013}-{counter:010}")
    }
}

/// Walk `value` down `path`, treating non-objects and `null` as absent.
#[must_use]
pub fn value_at<'a>(value: &'a Value, path: &TreePath) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.segments() {
        current = current.as_object()?.get(segment)?;
    }
    if current.is_null() {
        None
    } else {
        Some(current)
    }
}

/// Replace the value at `path` inside `tree`, creating intermediate objects
/// as needed.
///
/// Writing `null` removes the entry. Intermediate values that are not
/// objects are replaced by objects.
pub fn set_value_at(tree: &mut Value, path: &TreePath, value: Value) {
    let Some((last, parents)) = path.segments().split_last() else {
        *tree = value;
        return;
    };

    let mut current = tree;
    for segment in parents {
        if value.is_null() && current.get(segment).is_none() {
            return;
        }
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
        let Some(object) = current.as_object_mut() else {
            return;
        };
        current = object
            .entry(segment.clone())
            .or_insert_with(|| Value::Object(Map::new()));
    }

    if value.is_null() {
        if let Some(object) = current.as_object_mut() {
            object.remove(last);
        }
        return;
    }

    if !current.is_object() {
        *current = Value::Object(Map::new());
    }
    if let Some(object) = current.as_object_mut() {
        object.insert(last.clone(), value);
    }
}

/// Keys of the direct children of a value, empty for non-objects.
#[must_use]
pub fn child_keys(value: Option<&Value>) -> std::collections::BTreeSet<String> {
    value
        .and_then(Value::as_object)
        .map(|object| object.keys().cloned().collect())
        .unwrap_or_default()
}
