use async_trait::async_trait;
use std::sync::Arc;
use tracing::warn;

use crate::convert::{convert, EntityMetadata, TypedRow};
use crate::error::DispatchError;
use crate::message::{MutationKind, RawChange, RowSnapshot, TableKey};

/// Application callback for the changes of one table.
///
/// `rows` holds one entity for INSERT and DELETE, and `[new, old]` for
/// UPDATE. Returning an error fails the change and keeps the batch from
/// being acknowledged.
#[async_trait]
pub trait EntryListener<T>: Send + Sync {
    async fn on_row_change(&self, rows: &[TypedRow<T>], kind: MutationKind) -> anyhow::Result<()>;
}

#[async_trait]
impl<T, L> EntryListener<T> for Arc<L>
where
    T: Sync,
    L: EntryListener<T> + ?Sized,
{
    async fn on_row_change(&self, rows: &[TypedRow<T>], kind: MutationKind) -> anyhow::Result<()> {
        (**self).on_row_change(rows, kind).await
    }
}

/// A listener bound to its conversion table, with the entity type erased so
/// listeners of different types can share one registry.
#[async_trait]
pub trait BoundListener: Send + Sync {
    fn key(&self) -> &TableKey;

    /// Converts the raw images and invokes the listener.
    async fn on_snapshots(&self, rows: &[&RowSnapshot], kind: MutationKind) -> anyhow::Result<()>;
}

pub(crate) struct Binding<T, L> {
    metadata: EntityMetadata<T>,
    listener: L,
}

impl<T, L> Binding<T, L> {
    pub(crate) fn new(metadata: EntityMetadata<T>, listener: L) -> Self {
        Self { metadata, listener }
    }
}

#[async_trait]
impl<T, L> BoundListener for Binding<T, L>
where
    T: Default + Send + Sync + 'static,
    L: EntryListener<T> + 'static,
{
    fn key(&self) -> &TableKey {
        self.metadata.key()
    }

    async fn on_snapshots(&self, rows: &[&RowSnapshot], kind: MutationKind) -> anyhow::Result<()> {
        let typed: Vec<TypedRow<T>> = rows.iter().map(|row| convert(row, &self.metadata)).collect();

        for error in typed.iter().flat_map(|row| row.errors.iter()) {
            if self.metadata.is_strict() {
                return Err(anyhow::Error::new(error.clone()).context("row conversion failed"));
            }
            warn!(
                schema = %self.metadata.key().schema,
                table = %self.metadata.key().table,
                column = %error.column,
                "{}",
                error
            );
        }

        self.listener.on_row_change(&typed, kind).await
    }
}

/// Handles one change with its resolved listener.
///
/// Any conversion or listener failure is returned as a [`DispatchError`]
/// carrying the change's table, kind and raw images.
pub async fn handle_row_data(
    change: &RawChange,
    listener: &dyn BoundListener,
) -> Result<(), DispatchError> {
    let rows = change.snapshots();

    listener
        .on_snapshots(&rows, change.kind)
        .await
        .map_err(|source| DispatchError {
            schema: change.schema().to_string(),
            table: change.table().to_string(),
            kind: change.kind,
            rows: rows.into_iter().cloned().collect(),
            source,
        })
}
