//! `SQLite` schema definitions for the tree store.
//!
//! The tree is stored as flattened leaves: one row per scalar, array, or
//! empty object, keyed by its slash-separated path.

/// SQL statement to create the nodes table.
pub const CREATE_NODES_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS nodes (
    path TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
)
";

/// SQL statement to create the metadata table for storing key-value pairs.
pub const CREATE_METADATA_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS metadata (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
)
";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_nodes_table_contains_required_columns() {
        assert!(CREATE_NODES_TABLE.contains("path TEXT PRIMARY KEY"));
        assert!(CREATE_NODES_TABLE.contains("value TEXT NOT NULL"));
    }

    #[test]
    fn test_create_metadata_table_structure() {
        assert!(CREATE_METADATA_TABLE.contains("key TEXT PRIMARY KEY"));
        assert!(CREATE_METADATA_TABLE.contains("value TEXT NOT NULL"));
    }
}
