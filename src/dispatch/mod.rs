//! Batch dispatch: resolve each change's listener and hand it the converted
//! rows, either in order on the calling task or across a bounded pool.
//!
//! [`MessageHandler::from_config`] picks the decoder and dispatcher pair for
//! a consumer configuration.

mod pool;
mod sync;

pub use pool::AsyncDispatcher;
pub use sync::SyncDispatcher;

use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::instrument;

use crate::config::ConsumerConfig;
use crate::error::DispatchError;
use crate::handler::{handle_row_data, BoundListener};
use crate::message::{MessageFormat, RawBatch, RawChange};
use crate::registry::ListenerRegistry;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    Sync,
    Async,
}

impl DispatchMode {
    pub fn from_flag(async_dispatch: bool) -> Self {
        if async_dispatch {
            DispatchMode::Async
        } else {
            DispatchMode::Sync
        }
    }
}

/// Result of dispatching one change.
#[derive(Debug)]
pub enum ChangeOutcome {
    Dispatched,
    /// No listener is bound to the change's table.
    Skipped,
    Failed(DispatchError),
}

/// Handles one change. A panicking listener fails the change like an
/// error would.
async fn dispatch_change(
    listener: Option<&Arc<dyn BoundListener>>,
    change: &RawChange,
) -> ChangeOutcome {
    let Some(listener) = listener else {
        return ChangeOutcome::Skipped;
    };
    match AssertUnwindSafe(handle_row_data(change, listener.as_ref()))
        .catch_unwind()
        .await
    {
        Ok(Ok(())) => ChangeOutcome::Dispatched,
        Ok(Err(error)) => ChangeOutcome::Failed(error),
        Err(panic) => ChangeOutcome::Failed(change_failure(
            change,
            anyhow::anyhow!("listener panicked: {}", panic_message(panic.as_ref())),
        )),
    }
}

/// Builds the error for `change` failing with `source`.
fn change_failure(change: &RawChange, source: anyhow::Error) -> DispatchError {
    DispatchError {
        schema: change.schema().to_string(),
        table: change.table().to_string(),
        kind: change.kind,
        rows: change.snapshots().into_iter().cloned().collect(),
        source,
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}

/// Result of dispatching a whole batch.
#[derive(Debug)]
pub enum BatchOutcome {
    AllOk {
        dispatched: usize,
        skipped: usize,
    },
    /// At least one change failed; the batch must not be acknowledged.
    FirstFailure {
        /// Batch position of the earliest failing change.
        index: usize,
        /// Changes that completed successfully before the batch settled.
        dispatched: usize,
        error: DispatchError,
    },
}

impl BatchOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, BatchOutcome::AllOk { .. })
    }

    pub fn dispatched(&self) -> usize {
        match self {
            BatchOutcome::AllOk { dispatched, .. } => *dispatched,
            BatchOutcome::FirstFailure { dispatched, .. } => *dispatched,
        }
    }
}

/// Dispatch loop variant.
pub enum Dispatcher {
    Sync(SyncDispatcher),
    Async(AsyncDispatcher),
}

impl Dispatcher {
    pub fn new(mode: DispatchMode, registry: Arc<ListenerRegistry>, worker_pool_size: usize) -> Self {
        match mode {
            DispatchMode::Sync => Dispatcher::Sync(SyncDispatcher::new(registry)),
            DispatchMode::Async => {
                Dispatcher::Async(AsyncDispatcher::new(registry, worker_pool_size))
            }
        }
    }

    pub fn mode(&self) -> DispatchMode {
        match self {
            Dispatcher::Sync(_) => DispatchMode::Sync,
            Dispatcher::Async(_) => DispatchMode::Async,
        }
    }

    pub async fn dispatch_batch(&self, batch: RawBatch) -> BatchOutcome {
        match self {
            Dispatcher::Sync(dispatcher) => dispatcher.dispatch_batch(batch).await,
            Dispatcher::Async(dispatcher) => dispatcher.dispatch_batch(batch).await,
        }
    }
}

/// Decoder and dispatcher for one consumer.
pub struct MessageHandler {
    format: MessageFormat,
    dispatcher: Dispatcher,
}

impl MessageHandler {
    pub fn new(format: MessageFormat, dispatcher: Dispatcher) -> Self {
        Self { format, dispatcher }
    }

    /// Selects the `{sync, async} x {flat, structured}` combination the
    /// configuration asks for.
    pub fn from_config(config: &ConsumerConfig, registry: Arc<ListenerRegistry>) -> Self {
        let format = MessageFormat::from_flag(config.flat_message);
        let mode = DispatchMode::from_flag(config.async_dispatch);
        Self::new(
            format,
            Dispatcher::new(mode, registry, config.worker_pool_size),
        )
    }

    pub fn format(&self) -> MessageFormat {
        self.format
    }

    pub fn mode(&self) -> DispatchMode {
        self.dispatcher.mode()
    }

    pub fn decode(&self, payload: &[u8]) -> Result<Vec<RawChange>> {
        self.format.decode(payload)
    }

    #[instrument(skip_all, fields(batch_size = batch.len(), mode = ?self.mode()))]
    pub async fn dispatch_batch(&self, batch: RawBatch) -> BatchOutcome {
        self.dispatcher.dispatch_batch(batch).await
    }
}
