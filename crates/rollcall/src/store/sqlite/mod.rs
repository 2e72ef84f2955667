//! `SQLite`-backed tree store.
//!
//! Persists the tree as flattened leaves so the CLI can work against a local
//! database with the same semantics as a remote store. Listeners are served
//! in-process through the shared [`ChangeHub`]; writes made by other
//! processes are not observed.

pub mod migrations;
pub mod schema;

use std::path::{Path, PathBuf};

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, Transaction};
use serde_json::{Map, Value};
use tokio::sync::broadcast;
use tracing::{debug, info};

use super::hub::ChangeHub;
use super::{
    set_value_at, ChildEvent, PushIdGenerator, StoreError, StoreResult, TreePath, TreeStore,
    ValueChange,
};
use crate::error::{Error, Result};

/// Selects a node and everything below it.
const SELECT_SUBTREE: &str = r"
SELECT path, value FROM nodes
WHERE path = ?1 OR substr(path, 1, length(?2)) = ?2
";

/// Deletes a node and everything below it.
const DELETE_SUBTREE: &str = r"
DELETE FROM nodes
WHERE path = ?1 OR substr(path, 1, length(?2)) = ?2
";

/// Persistent tree store.
#[derive(Debug)]
pub struct SqliteTreeStore {
    /// Path to the database file.
    path: PathBuf,
    /// Database connection.
    conn: Mutex<Connection>,
    hub: ChangeHub,
    push_ids: PushIdGenerator,
}

impl SqliteTreeStore {
    /// Open or create a tree database at the given path.
    ///
    /// Creates the parent directories and database file if they don't exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or migrated.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|source| Error::CreateDir {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }

        debug!("Opening tree database at {}", path.display());
        let mut conn = Connection::open(&path).map_err(|source| Error::Database {
            path: path.clone(),
            source,
        })?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        migrations::initialize_schema(&mut conn)?;

        info!("Tree database opened at {}", path.display());
        Ok(Self::from_connection(path, conn))
    }

    /// Create an in-memory tree database.
    ///
    /// # Errors
    ///
    /// Returns an error if the in-memory database cannot be created.
    pub fn open_in_memory() -> Result<Self> {
        let path = PathBuf::from(":memory:");
        let mut conn = Connection::open_in_memory().map_err(|source| Error::Database {
            path: path.clone(),
            source,
        })?;
        migrations::initialize_schema(&mut conn)?;
        Ok(Self::from_connection(path, conn))
    }

    fn from_connection(path: PathBuf, conn: Connection) -> Self {
        Self {
            path,
            conn: Mutex::new(conn),
            hub: ChangeHub::new(),
            push_ids: PushIdGenerator::new(),
        }
    }

    /// Get the path to the database file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of stored leaves.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn leaf_count(&self) -> Result<i64> {
        let count = self
            .conn
            .lock()
            .query_row("SELECT COUNT(*) FROM nodes", [], |row| row.get(0))?;
        Ok(count)
    }

    fn read(&self, path: &TreePath) -> StoreResult<Option<Value>> {
        let conn = self.conn.lock();
        read_subtree(&conn, path).map_err(StoreError::backend)
    }

    /// Apply a batch of subtree replacements in one transaction.
    fn write(&self, entries: &[(TreePath, &Value)]) -> StoreResult<()> {
        let mut conn = self.conn.lock();
        let result = (|| -> Result<()> {
            let tx = conn.transaction()?;
            for (path, value) in entries {
                replace_subtree(&tx, path, value)?;
            }
            tx.commit()?;
            Ok(())
        })();
        result.map_err(StoreError::backend)
    }

    fn notify(&self, path: &TreePath) {
        self.hub.publish(path, |p| self.read(p));
    }
}

fn subtree_prefix(key: &str) -> String {
    if key.is_empty() {
        String::new()
    } else {
        format!("{key}/")
    }
}

/// Reassemble the value at `path` from its stored leaves.
fn read_subtree(conn: &Connection, path: &TreePath) -> Result<Option<Value>> {
    let key = path.as_key();
    let prefix = subtree_prefix(&key);

    let mut stmt = conn.prepare_cached(SELECT_SUBTREE)?;
    let rows = stmt
        .query_map(params![key, prefix], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    if rows.is_empty() {
        return Ok(None);
    }

    let mut tree = Value::Null;
    for (leaf_path, text) in rows {
        let leaf: Value = serde_json::from_str(&text)?;
        if leaf_path == key {
            return Ok(Some(leaf));
        }
        let relative = TreePath::parse(&leaf_path[prefix.len()..])?;
        set_value_at(&mut tree, &relative, leaf);
    }
    Ok(Some(tree))
}

/// Replace everything at and below `path` with `value`.
///
/// Ancestor leaves are dropped, since the path now sits inside an object.
fn replace_subtree(tx: &Transaction<'_>, path: &TreePath, value: &Value) -> Result<()> {
    let key = path.as_key();
    tx.execute(DELETE_SUBTREE, params![key, subtree_prefix(&key)])?;
    for ancestor in path.ancestors() {
        tx.execute("DELETE FROM nodes WHERE path = ?1", [ancestor.as_key()])?;
    }

    let mut leaves = Vec::new();
    flatten(path, value, &mut leaves)?;

    let updated_at = Utc::now().to_rfc3339();
    let mut insert =
        tx.prepare_cached("INSERT INTO nodes (path, value, updated_at) VALUES (?1, ?2, ?3)")?;
    for (leaf_path, leaf) in leaves {
        insert.execute(params![leaf_path, leaf, updated_at])?;
    }
    Ok(())
}

/// Collect `(path, json)` leaves for a value. Non-empty objects are
/// descended into; everything else is a leaf. `null` produces nothing.
fn flatten(path: &TreePath, value: &Value, out: &mut Vec<(String, String)>) -> Result<()> {
    match value {
        Value::Null => Ok(()),
        Value::Object(object) if !object.is_empty() => {
            for (key, child) in object {
                flatten(&path.child(key)?, child, out)?;
            }
            Ok(())
        }
        leaf => {
            out.push((path.as_key(), serde_json::to_string(leaf)?));
            Ok(())
        }
    }
}

#[async_trait::async_trait]
impl TreeStore for SqliteTreeStore {
    async fn get(&self, path: &TreePath) -> StoreResult<Option<Value>> {
        self.read(path)
    }

    async fn set(&self, path: &TreePath, value: Value) -> StoreResult<()> {
        self.write(&[(path.clone(), &value)])?;
        self.notify(path);
        Ok(())
    }

    async fn update(&self, path: &TreePath, fields: Map<String, Value>) -> StoreResult<()> {
        let entries = fields
            .iter()
            .map(|(key, value)| path.child(key).map(|child| (child, value)))
            .collect::<StoreResult<Vec<_>>>()?;
        self.write(&entries)?;
        self.notify(path);
        Ok(())
    }

    async fn remove(&self, path: &TreePath) -> StoreResult<()> {
        self.write(&[(path.clone(), &Value::Null)])?;
        self.notify(path);
        Ok(())
    }

    async fn push(&self, path: &TreePath, value: Value) -> StoreResult<String> {
        let id = self.push_ids.next_id();
        let child = path.child(&id)?;
        self.write(&[(child.clone(), &value)])?;
        self.notify(&child);
        Ok(id)
    }

    async fn watch_value(&self, path: &TreePath) -> StoreResult<broadcast::Receiver<ValueChange>> {
        Ok(self.hub.watch_value(path))
    }

    async fn watch_children(&self, path: &TreePath) -> StoreResult<broadcast::Receiver<ChildEvent>> {
        Ok(self.hub.watch_children(path, |p| self.read(p)))
    }
}
