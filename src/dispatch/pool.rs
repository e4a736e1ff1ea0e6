use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, trace, warn};

use super::{change_failure, dispatch_change, BatchOutcome, ChangeOutcome};
use crate::error::DispatchError;
use crate::handler::BoundListener;
use crate::message::{RawBatch, RawChange, TableKey};
use crate::registry::ListenerRegistry;

/// Changes of one table, in batch order, with their batch positions.
struct Shard {
    key: TableKey,
    listener: Arc<dyn BoundListener>,
    changes: Vec<(usize, RawChange)>,
    completed: AtomicUsize,
}

type Failure = (usize, DispatchError);

/// Cancels the shard tasks of a batch whose dispatch was dropped before it
/// settled. Finished tasks are unaffected.
struct ShardTasks {
    handles: Vec<AbortHandle>,
    cancelled: Arc<AtomicBool>,
}

impl Drop for ShardTasks {
    fn drop(&mut self) {
        self.cancelled.store(true, Ordering::Release);
        for handle in &self.handles {
            handle.abort();
        }
    }
}

/// Hands changes to a bounded pool of tokio tasks.
///
/// Changes are sharded by table: one task per table walks that table's
/// changes in batch order, so per-table ordering holds while different
/// tables proceed in parallel. Every handled change holds one permit of a
/// semaphore sized to the pool, which bounds in-flight listener calls.
///
/// `dispatch_batch` returns only once every shard task has finished. After
/// a failure, shards stop before starting their next change; changes that
/// already started run to completion. Dropping the returned future cancels
/// every shard, including listener calls in progress.
pub struct AsyncDispatcher {
    registry: Arc<ListenerRegistry>,
    permits: Arc<Semaphore>,
    pool_size: usize,
}

impl AsyncDispatcher {
    pub fn new(registry: Arc<ListenerRegistry>, pool_size: usize) -> Self {
        let pool_size = pool_size.max(1);
        Self {
            registry,
            permits: Arc::new(Semaphore::new(pool_size)),
            pool_size,
        }
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    pub async fn dispatch_batch(&self, batch: RawBatch) -> BatchOutcome {
        let (shards, skipped) = self.shard(batch);
        let cancelled = Arc::new(AtomicBool::new(false));

        let units: Vec<(Arc<Shard>, JoinHandle<Option<Failure>>)> = shards
            .into_iter()
            .map(|shard| {
                let shard = Arc::new(shard);
                let unit = tokio::spawn(run_shard(
                    Arc::clone(&shard),
                    Arc::clone(&self.permits),
                    Arc::clone(&cancelled),
                ));
                (shard, unit)
            })
            .collect();
        let _shard_tasks = ShardTasks {
            handles: units.iter().map(|(_, unit)| unit.abort_handle()).collect(),
            cancelled: Arc::clone(&cancelled),
        };

        let mut dispatched = 0;
        let mut failures = Vec::new();

        for (shard, unit) in units {
            let joined = unit.await;
            let completed = shard.completed.load(Ordering::Acquire);
            dispatched += completed;

            match joined {
                Ok(None) => {}
                Ok(Some(failure)) => failures.push(failure),
                Err(join_error) => {
                    cancelled.store(true, Ordering::Release);
                    if let Some(failure) = aborted_change(&shard, completed, join_error) {
                        failures.push(failure);
                    }
                }
            }
        }

        let Some(first) = failures.iter().map(|(index, _)| *index).min() else {
            debug!(dispatched, skipped, "Batch dispatched");
            return BatchOutcome::AllOk {
                dispatched,
                skipped,
            };
        };

        let mut first_failure = None;
        for (index, error) in failures {
            if index == first {
                error!(
                    schema = %error.schema,
                    table = %error.table,
                    kind = %error.kind,
                    index,
                    error = %format!("{:#}", error.source),
                    "Change failed, batch will not be acknowledged"
                );
                first_failure = Some(error);
            } else {
                warn!(
                    schema = %error.schema,
                    table = %error.table,
                    index,
                    error = %format!("{:#}", error.source),
                    "Additional change failure in batch"
                );
            }
        }

        match first_failure {
            Some(error) => BatchOutcome::FirstFailure {
                index: first,
                dispatched,
                error,
            },
            None => BatchOutcome::AllOk {
                dispatched,
                skipped,
            },
        }
    }

    /// Groups routable changes by table in first-seen order and counts the
    /// unroutable ones.
    fn shard(&self, batch: RawBatch) -> (Vec<Shard>, usize) {
        let mut shards: Vec<Shard> = Vec::new();
        let mut slots: HashMap<TableKey, usize> = HashMap::new();
        let mut skipped = 0;

        for (index, change) in batch.into_iter().enumerate() {
            if let Some(&slot) = slots.get(&change.key) {
                shards[slot].changes.push((index, change));
                continue;
            }
            let Some(listener) = self.registry.resolve(change.schema(), change.table()) else {
                trace!("No listener for {}, skipping change {}", change.key, index);
                skipped += 1;
                continue;
            };
            slots.insert(change.key.clone(), shards.len());
            shards.push(Shard {
                key: change.key.clone(),
                listener: Arc::clone(listener),
                changes: vec![(index, change)],
                completed: AtomicUsize::new(0),
            });
        }

        (shards, skipped)
    }
}

async fn run_shard(
    shard: Arc<Shard>,
    permits: Arc<Semaphore>,
    cancelled: Arc<AtomicBool>,
) -> Option<Failure> {
    for (index, change) in &shard.changes {
        if cancelled.load(Ordering::Acquire) {
            trace!("Batch already failed, {} stops before change {}", shard.key, index);
            return None;
        }
        let Ok(_permit) = permits.acquire().await else {
            return None;
        };
        if cancelled.load(Ordering::Acquire) {
            return None;
        }

        match dispatch_change(Some(&shard.listener), change).await {
            ChangeOutcome::Failed(error) => {
                cancelled.store(true, Ordering::Release);
                return Some((*index, error));
            }
            _ => {
                shard.completed.fetch_add(1, Ordering::AcqRel);
            }
        }
    }
    None
}

/// Builds the failure for the change that was running when a shard task
/// panicked or was aborted.
fn aborted_change(
    shard: &Shard,
    completed: usize,
    join_error: tokio::task::JoinError,
) -> Option<Failure> {
    let (index, change) = shard.changes.get(completed)?;
    Some((
        *index,
        change_failure(
            change,
            anyhow::anyhow!("listener task did not complete: {}", join_error),
        ),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::test_support::*;
    use crate::convert::TypedRow;
    use crate::handler::EntryListener;
    use crate::message::MutationKind;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;

    fn recorder(table: &str, seen: &Arc<Mutex<Vec<(String, i64, MutationKind)>>>) -> Recorder {
        Recorder {
            table: table.to_string(),
            seen: Arc::clone(seen),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_per_table_order_is_preserved() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let registry = ListenerRegistry::builder()
            .bind(
                user_metadata("users"),
                Recorder {
                    delay: Some(Duration::from_millis(5)),
                    ..recorder("users", &seen)
                },
            )
            .unwrap()
            .bind(user_metadata("orders"), recorder("orders", &seen))
            .unwrap()
            .build();
        let dispatcher = AsyncDispatcher::new(Arc::new(registry), 4);

        let batch = RawBatch::new(vec![
            insert("users", 1),
            insert("orders", 10),
            insert("users", 2),
            insert("orders", 11),
            insert("users", 3),
        ]);
        let outcome = dispatcher.dispatch_batch(batch).await;

        assert!(matches!(outcome, BatchOutcome::AllOk { dispatched: 5, skipped: 0 }));
        let seen = seen.lock().unwrap();
        let users: Vec<_> = seen.iter().filter(|(t, _, _)| t == "users").map(|(_, id, _)| *id).collect();
        let orders: Vec<_> = seen.iter().filter(|(t, _, _)| t == "orders").map(|(_, id, _)| *id).collect();
        assert_eq!(users, vec![1, 2, 3]);
        assert_eq!(orders, vec![10, 11]);
    }

    #[tokio::test]
    async fn test_failure_marks_batch_and_stops_shard() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let registry = ListenerRegistry::builder()
            .bind(
                user_metadata("users"),
                Recorder {
                    fail_on_id: Some(2),
                    ..recorder("users", &seen)
                },
            )
            .unwrap()
            .build();
        let dispatcher = AsyncDispatcher::new(Arc::new(registry), 2);

        let batch: RawBatch = (1..=3).map(|id| insert("users", id)).collect();
        let outcome = dispatcher.dispatch_batch(batch).await;

        match outcome {
            BatchOutcome::FirstFailure { index, dispatched, error } => {
                assert_eq!(index, 1);
                assert_eq!(dispatched, 1);
                assert_eq!(error.table, "users");
            }
            other => panic!("expected failure, got {:?}", other),
        }
        let ids: Vec<_> = seen.lock().unwrap().iter().map(|(_, id, _)| *id).collect();
        assert_eq!(ids, vec![1]);
    }

    #[tokio::test]
    async fn test_reports_lowest_failing_index() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let registry = ListenerRegistry::builder()
            .bind(
                user_metadata("users"),
                Recorder {
                    fail_on_id: Some(1),
                    delay: Some(Duration::from_millis(20)),
                    ..recorder("users", &seen)
                },
            )
            .unwrap()
            .bind(
                user_metadata("orders"),
                Recorder {
                    fail_on_id: Some(10),
                    ..recorder("orders", &seen)
                },
            )
            .unwrap()
            .build();
        let dispatcher = AsyncDispatcher::new(Arc::new(registry), 4);

        let batch = RawBatch::new(vec![insert("users", 1), insert("orders", 10)]);
        let outcome = dispatcher.dispatch_batch(batch).await;

        match outcome {
            BatchOutcome::FirstFailure { index, error, .. } => {
                assert_eq!(index, 0);
                assert_eq!(error.table, "users");
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unbound_tables_are_skipped() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let registry = ListenerRegistry::builder()
            .bind(user_metadata("users"), recorder("users", &seen))
            .unwrap()
            .build();
        let dispatcher = AsyncDispatcher::new(Arc::new(registry), 1);

        let batch = RawBatch::new(vec![insert("orders", 1), insert("users", 2), insert("orders", 3)]);
        let outcome = dispatcher.dispatch_batch(batch).await;

        assert!(matches!(outcome, BatchOutcome::AllOk { dispatched: 1, skipped: 2 }));
    }

    #[tokio::test]
    async fn test_panicking_listener_fails_batch() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let registry = ListenerRegistry::builder()
            .bind(
                user_metadata("users"),
                Recorder {
                    panic_on_id: Some(1),
                    ..recorder("users", &seen)
                },
            )
            .unwrap()
            .build();
        let dispatcher = AsyncDispatcher::new(Arc::new(registry), 2);

        let outcome = dispatcher.dispatch_batch(RawBatch::new(vec![insert("users", 1)])).await;

        match outcome {
            BatchOutcome::FirstFailure { index, error, .. } => {
                assert_eq!(index, 0);
                assert!(format!("{:#}", error.source).contains("listener panicked"));
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_dropped_dispatch_cancels_listeners() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let registry = ListenerRegistry::builder()
            .bind(
                user_metadata("users"),
                Recorder {
                    delay: Some(Duration::from_millis(200)),
                    ..recorder("users", &seen)
                },
            )
            .unwrap()
            .bind(
                user_metadata("orders"),
                Recorder {
                    delay: Some(Duration::from_millis(200)),
                    ..recorder("orders", &seen)
                },
            )
            .unwrap()
            .build();
        let dispatcher = AsyncDispatcher::new(Arc::new(registry), 2);

        let batch = RawBatch::new(vec![insert("users", 1), insert("orders", 2)]);
        let dispatch = tokio::time::timeout(Duration::from_millis(20), dispatcher.dispatch_batch(batch)).await;
        assert!(dispatch.is_err());

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(seen.lock().unwrap().is_empty());
    }

    struct Gauge {
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl EntryListener<User> for Gauge {
        async fn on_row_change(&self, _rows: &[TypedRow<User>], _kind: MutationKind) -> anyhow::Result<()> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_pool_size_bounds_concurrency() {
        let gauge = Arc::new(Gauge {
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let tables = ["a", "b", "c", "d", "e", "f"];
        let mut builder = ListenerRegistry::builder();
        for table in tables {
            builder = builder.bind(user_metadata(table), Arc::clone(&gauge)).unwrap();
        }
        let dispatcher = AsyncDispatcher::new(Arc::new(builder.build()), 2);

        let batch: RawBatch = tables.iter().map(|t| insert(t, 1)).collect();
        let outcome = dispatcher.dispatch_batch(batch).await;

        assert!(outcome.is_ok());
        assert_eq!(outcome.dispatched(), 6);
        assert!(gauge.peak.load(Ordering::SeqCst) <= 2);
    }
}
