use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use crate::convert::{EntityMetadata, MetadataCatalog};
use crate::handler::{Binding, BoundListener, EntryListener};
use crate::message::TableKey;
use crate::{Error, Result};

/// Listeners keyed by exact `(schema, table)`.
///
/// Built once before the consumer starts and read-only afterwards, so it is
/// shared between dispatch tasks without locking.
#[derive(Default)]
pub struct ListenerRegistry {
    by_schema: HashMap<String, HashMap<String, Arc<dyn BoundListener>>>,
    len: usize,
}

impl ListenerRegistry {
    pub fn builder() -> ListenerRegistryBuilder {
        ListenerRegistryBuilder::default()
    }

    pub fn resolve(&self, schema: &str, table: &str) -> Option<&Arc<dyn BoundListener>> {
        self.by_schema.get(schema)?.get(table)
    }

    pub fn keys(&self) -> impl Iterator<Item = &TableKey> {
        self.by_schema
            .values()
            .flat_map(|tables| tables.values().map(|listener| listener.key()))
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl std::fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut keys: Vec<String> = self.keys().map(|k| k.to_string()).collect();
        keys.sort();
        f.debug_struct("ListenerRegistry").field("keys", &keys).finish()
    }
}

#[derive(Default)]
pub struct ListenerRegistryBuilder {
    registry: ListenerRegistry,
}

impl ListenerRegistryBuilder {
    /// Binds `listener` to the table named by `metadata`.
    ///
    /// At most one listener may be bound per table.
    pub fn bind<T, L>(self, metadata: EntityMetadata<T>, listener: L) -> Result<Self>
    where
        T: Default + Send + Sync + 'static,
        L: EntryListener<T> + 'static,
    {
        self.bind_erased(Arc::new(Binding::new(metadata, listener)))
    }

    /// Binds `listener` using the conversion table the catalog holds for
    /// `schema.table`.
    pub fn bind_from_catalog<T, L>(
        self,
        catalog: &MetadataCatalog<T>,
        schema: &str,
        table: &str,
        listener: L,
    ) -> Result<Self>
    where
        T: Default + Send + Sync + 'static,
        L: EntryListener<T> + 'static,
    {
        let metadata = catalog.lookup(schema, table).ok_or_else(|| Error::Registration {
            message: format!("no entity metadata for {}.{}", schema, table),
        })?;
        self.bind(metadata, listener)
    }

    /// Binds an already type-erased listener under its own key.
    pub fn bind_erased(mut self, listener: Arc<dyn BoundListener>) -> Result<Self> {
        let key = listener.key().clone();
        let tables = self
            .registry
            .by_schema
            .entry(key.schema.clone())
            .or_default();

        if tables.contains_key(&key.table) {
            return Err(Error::Registration {
                message: format!("a listener is already bound to {}", key),
            });
        }

        info!(schema = %key.schema, table = %key.table, "Registered entry listener");
        tables.insert(key.table, listener);
        self.registry.len += 1;
        Ok(self)
    }

    pub fn build(self) -> ListenerRegistry {
        self.registry
    }
}
