//! Object storage boundary.
//!
//! Child photos are referenced by URL. The registry only needs to know
//! whether the object behind a URL exists, so the [`ObjectStore`] trait is a
//! single existence check. Two URL shapes are recognised:
//!
//! - `gs://<bucket>/<path>`
//! - `https://firebasestorage.googleapis.com/v0/b/<bucket>/o/<url-encoded path>`

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

use parking_lot::Mutex;
use regex::Regex;
use thiserror::Error;
use tracing::trace;

/// Errors reported by an object store.
#[derive(Debug, Error)]
pub enum ObjectError {
    /// The URL is not a recognised object reference.
    #[error("unrecognized object reference: {0}")]
    Unrecognized(String),

    /// The object store cannot be reached.
    #[error("object store unavailable: {0}")]
    Unavailable(String),

    /// Checking the object on disk failed.
    #[error("failed to check object at {path}: {source}")]
    Io {
        /// Path that was checked.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },
}

fn gs_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^gs://([A-Za-z0-9][A-Za-z0-9._-]*)/(.+)$").expect("Invalid regex pattern")
    })
}

fn download_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"^https://firebasestorage\.googleapis\.com/v0/b/([A-Za-z0-9][A-Za-z0-9._-]*)/o/([^?#]+)(?:[?#].*)?$",
        )
        .expect("Invalid regex pattern")
    })
}

/// A reference to an object in a bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectRef {
    bucket: String,
    path: String,
}

impl ObjectRef {
    /// Create a reference directly.
    #[must_use]
    pub fn new(bucket: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            path: path.into(),
        }
    }

    /// Parse an object URL.
    ///
    /// # Errors
    ///
    /// Returns [`ObjectError::Unrecognized`] if the URL matches neither
    /// recognised shape, or its path is empty or escapes the bucket.
    pub fn parse(url: &str) -> Result<Self, ObjectError> {
        let url = url.trim();
        let (bucket, path) = if let Some(caps) = gs_pattern().captures(url) {
            (caps[1].to_string(), caps[2].to_string())
        } else if let Some(caps) = download_pattern().captures(url) {
            (caps[1].to_string(), percent_decode(&caps[2]))
        } else {
            return Err(ObjectError::Unrecognized(url.to_string()));
        };

        let path = path.trim_start_matches('/').to_string();
        if path.is_empty() || path.split('/').any(|segment| segment == "..") {
            return Err(ObjectError::Unrecognized(url.to_string()));
        }

        Ok(Self { bucket, path })
    }

    /// The bucket name.
    #[must_use]
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// The object path inside the bucket.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gs://{}/{}", self.bucket, self.path)
    }
}

/// Decode `%XX` escapes. Malformed escapes are kept as they are.
fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let high = char::from(bytes[i + 1]).to_digit(16);
            let low = char::from(bytes[i + 2]).to_digit(16);
            if let (Some(high), Some(low)) = (high, low) {
                if let Ok(byte) = u8::try_from((high << 4) | low) {
                    out.push(byte);
                    i += 3;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Something that can tell whether an object exists.
#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync + fmt::Debug {
    /// Check whether the referenced object exists.
    async fn exists(&self, object: &ObjectRef) -> Result<bool, ObjectError>;
}

/// Object store held in memory.
#[derive(Debug)]
pub struct MemoryObjectStore {
    objects: Mutex<HashSet<ObjectRef>>,
    reachable: AtomicBool,
}

impl Default for MemoryObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryObjectStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            objects: Mutex::new(HashSet::new()),
            reachable: AtomicBool::new(true),
        }
    }

    /// Add an object.
    pub fn insert(&self, object: ObjectRef) {
        self.objects.lock().insert(object);
    }

    /// Remove an object.
    pub fn remove(&self, object: &ObjectRef) {
        self.objects.lock().remove(object);
    }

    /// Simulate losing or regaining the connection.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn exists(&self, object: &ObjectRef) -> Result<bool, ObjectError> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(ObjectError::Unavailable(
                "memory object store is offline".to_string(),
            ));
        }
        Ok(self.objects.lock().contains(object))
    }
}

/// Object store backed by a local directory.
///
/// `gs://bucket/a/b.png` lives at `<root>/bucket/a/b.png`.
#[derive(Debug, Clone)]
pub struct DirObjectStore {
    root: PathBuf,
}

impl DirObjectStore {
    /// Create a store rooted at `root`. The directory need not exist yet.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Where an object lives on disk.
    #[must_use]
    pub fn object_path(&self, object: &ObjectRef) -> PathBuf {
        let mut path = self.root.join(object.bucket());
        for segment in object.path().split('/').filter(|s| !s.is_empty()) {
            path.push(segment);
        }
        path
    }
}

#[async_trait::async_trait]
impl ObjectStore for DirObjectStore {
    async fn exists(&self, object: &ObjectRef) -> Result<bool, ObjectError> {
        let path = self.object_path(object);
        trace!("Checking object at {}", path.display());
        tokio::fs::try_exists(&path)
            .await
            .map_err(|source| ObjectError::Io { path, source })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_gs_url() {
        let object = ObjectRef::parse("gs://bus-app.appspot.com/children/tom.png").unwrap();
        assert_eq!(object.bucket(), "bus-app.appspot.com");
        assert_eq!(object.path(), "children/tom.png");
        assert_eq!(object.to_string(), "gs://bus-app.appspot.com/children/tom.png");
    }

    #[test]
    fn test_parse_download_url() {
        let object = ObjectRef::parse(
            "https://firebasestorage.googleapis.com/v0/b/bus-app.appspot.com/o/children%2Ftom%20b.png?alt=media&token=abc",
        )
        .unwrap();
        assert_eq!(object.bucket(), "bus-app.appspot.com");
        assert_eq!(object.path(), "children/tom b.png");
    }

    #[test]
    fn test_parse_rejects_other_urls() {
        assert!(matches!(
            ObjectRef::parse("https://example.com/tom.png"),
            Err(ObjectError::Unrecognized(_))
        ));
        assert!(ObjectRef::parse("gs://bucket/").is_err());
        assert!(ObjectRef::parse("gs://bucket/a/../../etc").is_err());
        assert!(ObjectRef::parse("").is_err());
    }

    #[test]
    fn test_percent_decode() {
        assert_eq!(percent_decode("a%2Fb"), "a/b");
        assert_eq!(percent_decode("100%"), "100%");
        assert_eq!(percent_decode("%zz"), "%zz");
        assert_eq!(percent_decode("x%41"), "xA");
    }

    #[tokio::test]
    async fn test_memory_object_store() {
        let store = MemoryObjectStore::new();
        let object = ObjectRef::new("bucket", "children/tom.png");
        assert!(!store.exists(&object).await.unwrap());

        store.insert(object.clone());
        assert!(store.exists(&object).await.unwrap());

        store.set_reachable(false);
        assert!(matches!(
            store.exists(&object).await,
            Err(ObjectError::Unavailable(_))
        ));

        store.set_reachable(true);
        store.remove(&object);
        assert!(!store.exists(&object).await.unwrap());
    }

    #[tokio::test]
    async fn test_dir_object_store() {
        let root = std::env::temp_dir().join(format!("rollcall-objects-{}", std::process::id()));
        let store = DirObjectStore::new(&root);
        let object = ObjectRef::new("bucket", "children/tom.png");

        assert!(!store.exists(&object).await.unwrap());

        let path = store.object_path(&object);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"png").unwrap();
        assert!(store.exists(&object).await.unwrap());

        let _ = std::fs::remove_dir_all(&root);
    }
}
