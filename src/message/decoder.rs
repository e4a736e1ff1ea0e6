use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, trace};

use super::types::{MutationKind, RawChange, RowSnapshot, TableKey};
use crate::{Error, Result};

/// Wire layout of the messages on the topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageFormat {
    /// One table per message, rows as `column -> text` objects.
    Flat,
    /// Entry list with typed column records per row.
    Structured,
}

impl MessageFormat {
    pub fn from_flag(flat_message: bool) -> Self {
        if flat_message {
            MessageFormat::Flat
        } else {
            MessageFormat::Structured
        }
    }

    /// Decodes one broker payload into its row changes, in source order.
    ///
    /// DDL and transaction markers decode to no changes.
    pub fn decode(&self, payload: &[u8]) -> Result<Vec<RawChange>> {
        match self {
            MessageFormat::Flat => decode_flat(serde_json::from_slice(payload)?),
            MessageFormat::Structured => decode_structured(serde_json::from_slice(payload)?),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlatMessage {
    #[serde(default)]
    pub id: i64,
    pub database: String,
    pub table: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub is_ddl: bool,
    #[serde(default)]
    pub pk_names: Option<Vec<String>>,
    #[serde(default)]
    pub data: Option<Vec<Map<String, Value>>>,
    #[serde(default)]
    pub old: Option<Vec<Map<String, Value>>>,
    #[serde(default)]
    pub es: i64,
    #[serde(default)]
    pub ts: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StructuredMessage {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub entries: Vec<StructuredEntry>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StructuredEntry {
    pub schema_name: String,
    pub table_name: String,
    pub event_type: String,
    #[serde(default)]
    pub is_ddl: bool,
    #[serde(default)]
    pub row_datas: Vec<StructuredRowData>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StructuredRowData {
    #[serde(default)]
    pub before_columns: Vec<StructuredColumn>,
    #[serde(default)]
    pub after_columns: Vec<StructuredColumn>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StructuredColumn {
    pub name: String,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub is_null: bool,
}

/// Expands a flat message into one change per `data` row.
pub fn decode_flat(message: FlatMessage) -> Result<Vec<RawChange>> {
    let Some(kind) = row_kind(&message.event_type, message.is_ddl) else {
        return Ok(Vec::new());
    };
    let key = TableKey::new(message.database, message.table);
    let data = message.data.unwrap_or_default();

    if kind == MutationKind::Update {
        let old = message.old.unwrap_or_default();
        if old.len() != data.len() {
            return Err(Error::InvalidMessage {
                message: format!(
                    "UPDATE on {} has {} rows but {} before-images",
                    key,
                    data.len(),
                    old.len()
                ),
            });
        }
        return data
            .into_iter()
            .zip(old)
            .map(|(new, old)| {
                RawChange::update(key.clone(), snapshot_from_object(new), snapshot_from_object(old))
            })
            .collect();
    }

    let changes = data
        .into_iter()
        .map(|row| single_row_change(key.clone(), kind, snapshot_from_object(row)))
        .collect::<Vec<_>>();
    trace!("Decoded {} {} rows for {}", changes.len(), kind, key);
    Ok(changes)
}

/// Expands every entry of a structured message, keeping entry then row order.
pub fn decode_structured(message: StructuredMessage) -> Result<Vec<RawChange>> {
    let mut changes = Vec::new();

    for entry in message.entries {
        let Some(kind) = row_kind(&entry.event_type, entry.is_ddl) else {
            continue;
        };
        let key = TableKey::new(entry.schema_name, entry.table_name);

        for row in entry.row_datas {
            let change = match kind {
                MutationKind::Insert => {
                    RawChange::insert(key.clone(), snapshot_from_columns(row.after_columns))
                }
                MutationKind::Delete => {
                    RawChange::delete(key.clone(), snapshot_from_columns(row.before_columns))
                }
                _ => RawChange::update(
                    key.clone(),
                    snapshot_from_columns(row.after_columns),
                    snapshot_from_columns(row.before_columns),
                )?,
            };
            changes.push(change);
        }
    }

    Ok(changes)
}

fn row_kind(event_type: &str, is_ddl: bool) -> Option<MutationKind> {
    if is_ddl {
        debug!("Skipping DDL event '{}'", event_type);
        return None;
    }
    match MutationKind::parse(event_type) {
        Some(kind) if kind.is_row_change() => Some(kind),
        Some(kind) => {
            trace!("Skipping {} marker", kind);
            None
        }
        None => {
            debug!("Skipping unknown event type '{}'", event_type);
            None
        }
    }
}

fn single_row_change(key: TableKey, kind: MutationKind, row: RowSnapshot) -> RawChange {
    match kind {
        MutationKind::Delete => RawChange::delete(key, row),
        _ => RawChange::insert(key, row),
    }
}

fn snapshot_from_object(object: Map<String, Value>) -> RowSnapshot {
    object
        .into_iter()
        .map(|(column, value)| (column, text_value(value)))
        .collect()
}

fn snapshot_from_columns(columns: Vec<StructuredColumn>) -> RowSnapshot {
    columns
        .into_iter()
        .map(|column| {
            let value = if column.is_null { None } else { column.value };
            (column.name, value)
        })
        .collect()
}

fn text_value(value: Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s),
        other => Some(other.to_string()),
    }
}
