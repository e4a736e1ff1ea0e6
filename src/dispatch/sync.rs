use std::sync::Arc;
use tracing::{debug, error, trace};

use super::{dispatch_change, BatchOutcome, ChangeOutcome};
use crate::message::RawBatch;
use crate::registry::ListenerRegistry;

/// Handles changes one after another on the calling task.
///
/// The first failing change stops the batch; later changes are not touched.
pub struct SyncDispatcher {
    registry: Arc<ListenerRegistry>,
}

impl SyncDispatcher {
    pub fn new(registry: Arc<ListenerRegistry>) -> Self {
        Self { registry }
    }

    pub async fn dispatch_batch(&self, batch: RawBatch) -> BatchOutcome {
        let mut dispatched = 0;
        let mut skipped = 0;

        for (index, change) in batch.changes().iter().enumerate() {
            let listener = self.registry.resolve(change.schema(), change.table());
            match dispatch_change(listener, change).await {
                ChangeOutcome::Dispatched => dispatched += 1,
                ChangeOutcome::Skipped => {
                    trace!("No listener for {}, skipping change {}", change.key, index);
                    skipped += 1;
                }
                ChangeOutcome::Failed(error) => {
                    error!(
                        schema = %error.schema,
                        table = %error.table,
                        kind = %error.kind,
                        index,
                        error = %format!("{:#}", error.source),
                        "Change failed, aborting rest of batch"
                    );
                    return BatchOutcome::FirstFailure {
                        index,
                        dispatched,
                        error,
                    };
                }
            }
        }

        debug!(dispatched, skipped, "Batch dispatched");
        BatchOutcome::AllOk {
            dispatched,
            skipped,
        }
    }
}
