use serde::ser::{Serialize, SerializeMap, Serializer};
use serde::Deserialize;
use std::fmt;

use crate::{Error, Result};

/// Kind of a change event as reported by the binlog source.
///
/// Only `Insert`, `Update` and `Delete` carry rows; DDL and transaction
/// markers are decoded so they can be recognised and skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, serde::Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MutationKind {
    Insert,
    Update,
    Delete,
    Ddl,
    Transaction,
}

impl MutationKind {
    /// Maps a source event type name to a kind. Unknown names yield `None`.
    pub fn parse(event_type: &str) -> Option<Self> {
        match event_type.trim().to_ascii_uppercase().as_str() {
            "INSERT" => Some(MutationKind::Insert),
            "UPDATE" => Some(MutationKind::Update),
            "DELETE" => Some(MutationKind::Delete),
            "CREATE" | "ALTER" | "ERASE" | "QUERY" | "TRUNCATE" | "RENAME" | "CINDEX"
            | "DINDEX" | "GTID" => Some(MutationKind::Ddl),
            "BEGIN" | "COMMIT" | "ROLLBACK" | "TRANSACTIONBEGIN" | "TRANSACTIONEND"
            | "XACOMMIT" | "XAROLLBACK" => Some(MutationKind::Transaction),
            _ => None,
        }
    }

    pub fn is_row_change(&self) -> bool {
        matches!(
            self,
            MutationKind::Insert | MutationKind::Update | MutationKind::Delete
        )
    }
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MutationKind::Insert => "INSERT",
            MutationKind::Update => "UPDATE",
            MutationKind::Delete => "DELETE",
            MutationKind::Ddl => "DDL",
            MutationKind::Transaction => "TRANSACTION",
        };
        f.write_str(name)
    }
}

/// The `(schema, table)` pair a change belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableKey {
    pub schema: String,
    pub table: String,
}

impl TableKey {
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
        }
    }
}

impl fmt::Display for TableKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.table)
    }
}

/// One row image: column name to raw textual value, in source column order.
///
/// Column names are unique; inserting an existing column replaces its value
/// in place.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RowSnapshot {
    columns: Vec<(String, Option<String>)>,
}

impl RowSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert, mostly used by tests and fixtures.
    pub fn with(mut self, column: impl Into<String>, value: Option<&str>) -> Self {
        self.insert(column, value.map(str::to_string));
        self
    }

    pub fn insert(&mut self, column: impl Into<String>, value: Option<String>) {
        let column = column.into();
        match self.columns.iter_mut().find(|(name, _)| *name == column) {
            Some((_, existing)) => *existing = value,
            None => self.columns.push((column, value)),
        }
    }

    /// Returns `None` if the column is absent and `Some(None)` if it is SQL NULL.
    pub fn get(&self, column: &str) -> Option<Option<&str>> {
        self.columns
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value.as_deref())
    }

    pub fn contains(&self, column: &str) -> bool {
        self.columns.iter().any(|(name, _)| name == column)
    }

    pub fn columns(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.columns
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_deref()))
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|(name, _)| name.as_str())
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Completes a partial image with the columns it lacks from `base`.
    ///
    /// The result follows `base`'s column order. Used for UPDATE before-images
    /// that only list the changed columns.
    pub fn completed_from(&self, base: &RowSnapshot) -> RowSnapshot {
        let mut completed = base.clone();
        for (column, value) in &self.columns {
            completed.insert(column.clone(), value.clone());
        }
        completed
    }

    fn same_columns(&self, other: &RowSnapshot) -> bool {
        self.len() == other.len() && self.column_names().all(|name| other.contains(name))
    }
}

impl FromIterator<(String, Option<String>)> for RowSnapshot {
    fn from_iter<I: IntoIterator<Item = (String, Option<String>)>>(iter: I) -> Self {
        let mut snapshot = RowSnapshot::new();
        for (column, value) in iter {
            snapshot.insert(column, value);
        }
        snapshot
    }
}

impl Serialize for RowSnapshot {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.columns.len()))?;
        for (column, value) in &self.columns {
            map.serialize_entry(column, value)?;
        }
        map.end()
    }
}

impl fmt::Display for RowSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(self) {
            Ok(json) => f.write_str(&json),
            Err(_) => write!(f, "{:?}", self.columns),
        }
    }
}

/// Row images attached to a change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeRows {
    /// The inserted row or the deleted row.
    Single(RowSnapshot),
    /// The row after and before an UPDATE.
    Update { new: RowSnapshot, old: RowSnapshot },
}

/// A single row mutation on one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawChange {
    pub key: TableKey,
    pub kind: MutationKind,
    pub rows: ChangeRows,
}

impl RawChange {
    pub fn insert(key: TableKey, row: RowSnapshot) -> Self {
        Self {
            key,
            kind: MutationKind::Insert,
            rows: ChangeRows::Single(row),
        }
    }

    pub fn delete(key: TableKey, row: RowSnapshot) -> Self {
        Self {
            key,
            kind: MutationKind::Delete,
            rows: ChangeRows::Single(row),
        }
    }

    /// Builds an UPDATE. Both images must end up with the same column set:
    /// columns missing from `old` are filled from `new`, columns only present
    /// in `old` are rejected.
    pub fn update(key: TableKey, new: RowSnapshot, old: RowSnapshot) -> Result<Self> {
        let old = old.completed_from(&new);
        if !old.same_columns(&new) {
            return Err(Error::InvalidMessage {
                message: format!(
                    "UPDATE on {} has before-image columns missing from the after-image",
                    key
                ),
            });
        }
        Ok(Self {
            key,
            kind: MutationKind::Update,
            rows: ChangeRows::Update { new, old },
        })
    }

    pub fn schema(&self) -> &str {
        &self.key.schema
    }

    pub fn table(&self) -> &str {
        &self.key.table
    }

    /// Row images in listener order: `[row]`, or `[new, old]` for UPDATE.
    pub fn snapshots(&self) -> Vec<&RowSnapshot> {
        match &self.rows {
            ChangeRows::Single(row) => vec![row],
            ChangeRows::Update { new, old } => vec![new, old],
        }
    }
}

/// Ordered changes pulled together and acknowledged as one unit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawBatch {
    changes: Vec<RawChange>,
}

impl RawBatch {
    pub fn new(changes: Vec<RawChange>) -> Self {
        Self { changes }
    }

    pub fn push(&mut self, change: RawChange) {
        self.changes.push(change);
    }

    pub fn changes(&self) -> &[RawChange] {
        &self.changes
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

impl IntoIterator for RawBatch {
    type Item = RawChange;
    type IntoIter = std::vec::IntoIter<RawChange>;

    fn into_iter(self) -> Self::IntoIter {
        self.changes.into_iter()
    }
}

impl FromIterator<RawChange> for RawBatch {
    fn from_iter<I: IntoIterator<Item = RawChange>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn users() -> TableKey {
        TableKey::new("db", "users")
    }

    #[test]
    fn test_parse_event_types() {
        assert_eq!(MutationKind::parse("INSERT"), Some(MutationKind::Insert));
        assert_eq!(MutationKind::parse("update"), Some(MutationKind::Update));
        assert_eq!(MutationKind::parse("ALTER"), Some(MutationKind::Ddl));
        assert_eq!(MutationKind::parse("BEGIN"), Some(MutationKind::Transaction));
        assert_eq!(MutationKind::parse("HEARTBEAT"), None);
        assert!(!MutationKind::Ddl.is_row_change());
    }

    #[test]
    fn test_snapshot_keeps_order_and_unique_columns() {
        let row = RowSnapshot::new()
            .with("id", Some("1"))
            .with("name", Some("a"))
            .with("id", Some("2"));

        assert_eq!(row.len(), 2);
        assert_eq!(row.column_names().collect::<Vec<_>>(), vec!["id", "name"]);
        assert_eq!(row.get("id"), Some(Some("2")));
        assert_eq!(row.get("missing"), None);
    }

    #[test]
    fn test_null_is_distinct_from_absent() {
        let row = RowSnapshot::new().with("email", None);
        assert_eq!(row.get("email"), Some(None));
        assert!(row.contains("email"));
    }

    #[test]
    fn test_update_completes_partial_old_image() {
        let new = RowSnapshot::new().with("id", Some("1")).with("name", Some("b"));
        let old = RowSnapshot::new().with("name", Some("a"));

        let change = RawChange::update(users(), new, old).unwrap();
        let rows = change.snapshots();

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get("name"), Some(Some("b")));
        assert_eq!(rows[1].get("name"), Some(Some("a")));
        assert_eq!(rows[1].get("id"), Some(Some("1")));
    }

    #[test]
    fn test_update_rejects_unknown_old_columns() {
        let new = RowSnapshot::new().with("id", Some("1"));
        let old = RowSnapshot::new().with("ghost", Some("x"));

        assert!(RawChange::update(users(), new, old).is_err());
    }

    #[test]
    fn test_snapshot_serializes_as_object() {
        let row = RowSnapshot::new().with("id", Some("1")).with("note", None);
        assert_eq!(row.to_string(), r#"{"id":"1","note":null}"#);
    }
}
