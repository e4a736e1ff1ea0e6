//! Row conversion from raw text snapshots into typed entities.
//!
//! An [`EntityMetadata`] is the conversion table for one entity type: the
//! table it maps and, per column, a setter that writes the parsed value into
//! the entity. Tables are built once at startup and only read afterwards.
//!
//! ```rust
//! use cdc_dispatch::convert::{convert, EntityMetadata};
//! use cdc_dispatch::message::RowSnapshot;
//!
//! #[derive(Debug, Default)]
//! struct User {
//!     id: i64,
//!     name: String,
//! }
//!
//! let metadata = EntityMetadata::<User>::new("db", "users")
//!     .parsed("id", |user, id| user.id = id)
//!     .text("name", |user, name| user.name = name);
//!
//! let row = RowSnapshot::new().with("id", Some("1")).with("name", Some("a"));
//! let user = convert(&row, &metadata);
//!
//! assert_eq!(user.entity.id, 1);
//! assert_eq!(user.entity.name, "a");
//! ```

use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::ConversionError;
use crate::message::{RowSnapshot, TableKey};

type Setter<T> = Arc<dyn Fn(&mut T, &str) -> anyhow::Result<()> + Send + Sync>;

struct ColumnBinding<T> {
    column: String,
    setter: Setter<T>,
}

impl<T> Clone for ColumnBinding<T> {
    fn clone(&self) -> Self {
        Self {
            column: self.column.clone(),
            setter: Arc::clone(&self.setter),
        }
    }
}

/// Column-to-field conversion table for entity type `T`.
pub struct EntityMetadata<T> {
    key: TableKey,
    columns: Vec<ColumnBinding<T>>,
    strict: bool,
}

impl<T> EntityMetadata<T> {
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            key: TableKey::new(schema, table),
            columns: Vec::new(),
            strict: false,
        }
    }

    /// Binds a column to a setter receiving the raw text value.
    ///
    /// Binding the same column twice replaces the earlier setter.
    pub fn column<F>(mut self, column: impl Into<String>, setter: F) -> Self
    where
        F: Fn(&mut T, &str) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let column = column.into();
        let setter: Setter<T> = Arc::new(setter);
        match self.columns.iter_mut().find(|b| b.column == column) {
            Some(binding) => binding.setter = setter,
            None => self.columns.push(ColumnBinding { column, setter }),
        }
        self
    }

    /// Binds a column parsed with [`FromStr`].
    pub fn parsed<V, F>(self, column: impl Into<String>, assign: F) -> Self
    where
        V: FromStr,
        V::Err: fmt::Display,
        F: Fn(&mut T, V) + Send + Sync + 'static,
    {
        self.column(column, move |entity, raw| {
            let value = raw
                .trim()
                .parse::<V>()
                .map_err(|e| anyhow::anyhow!("{}", e))?;
            assign(entity, value);
            Ok(())
        })
    }

    /// Binds a column copied as an owned string.
    pub fn text<F>(self, column: impl Into<String>, assign: F) -> Self
    where
        F: Fn(&mut T, String) + Send + Sync + 'static,
    {
        self.column(column, move |entity, raw| {
            assign(entity, raw.to_string());
            Ok(())
        })
    }

    /// Treat any conversion error on this entity as a failed change.
    pub fn strict(mut self) -> Self {
        self.strict = true;
        self
    }

    pub fn key(&self) -> &TableKey {
        &self.key
    }

    pub fn is_strict(&self) -> bool {
        self.strict
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|b| b.column.as_str())
    }
}

impl<T> Clone for EntityMetadata<T> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            columns: self.columns.clone(),
            strict: self.strict,
        }
    }
}

impl<T> fmt::Debug for EntityMetadata<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityMetadata")
            .field("key", &self.key)
            .field("columns", &self.column_names().collect::<Vec<_>>())
            .field("strict", &self.strict)
            .finish()
    }
}

/// A converted row: the entity plus any column that failed to convert.
#[derive(Debug, Clone, PartialEq)]
pub struct TypedRow<T> {
    pub entity: T,
    pub errors: Vec<ConversionError>,
}

impl<T> TypedRow<T> {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn into_entity(self) -> T {
        self.entity
    }
}

impl<T> Deref for TypedRow<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.entity
    }
}

/// Projects a snapshot onto `T` through its conversion table.
///
/// Absent and NULL columns leave the field at its default. A failing setter
/// is recorded on the returned row and conversion continues with the next
/// column.
pub fn convert<T: Default>(snapshot: &RowSnapshot, metadata: &EntityMetadata<T>) -> TypedRow<T> {
    let mut entity = T::default();
    let mut errors = Vec::new();

    for binding in &metadata.columns {
        let Some(Some(raw)) = snapshot.get(&binding.column) else {
            continue;
        };
        if let Err(e) = (binding.setter)(&mut entity, raw) {
            errors.push(ConversionError {
                column: binding.column.clone(),
                value: raw.to_string(),
                reason: format!("{:#}", e),
            });
        }
    }

    TypedRow { entity, errors }
}

/// Metadata looked up by table, for callers that load conversion tables
/// from a provider instead of writing them inline.
#[derive(Debug)]
pub struct MetadataCatalog<T> {
    entries: HashMap<TableKey, EntityMetadata<T>>,
}

impl<T> Default for MetadataCatalog<T> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<T> MetadataCatalog<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, metadata: EntityMetadata<T>) {
        self.entries.insert(metadata.key().clone(), metadata);
    }

    pub fn lookup(&self, schema: &str, table: &str) -> Option<EntityMetadata<T>> {
        self.entries.get(&TableKey::new(schema, table)).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T> FromIterator<EntityMetadata<T>> for MetadataCatalog<T> {
    fn from_iter<I: IntoIterator<Item = EntityMetadata<T>>>(iter: I) -> Self {
        let mut catalog = MetadataCatalog::new();
        for metadata in iter {
            catalog.insert(metadata);
        }
        catalog
    }
}
