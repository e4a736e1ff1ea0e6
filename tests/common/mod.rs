#![allow(dead_code)]

use async_trait::async_trait;
use cdc_dispatch::config::{ConsumerConfig, TimeUnit};
use cdc_dispatch::message::MutationKind;
use cdc_dispatch::{BatchSource, EntityMetadata, EntryListener, Error, PulledBatch, Result, TypedRow};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Default, Clone, PartialEq)]
pub struct User {
    pub id: i64,
    pub name: String,
    pub age: Option<u32>,
}

pub fn user_metadata(table: &str) -> EntityMetadata<User> {
    EntityMetadata::new("db", table)
        .parsed("id", |u: &mut User, v| u.id = v)
        .text("name", |u: &mut User, v| u.name = v)
        .parsed("age", |u: &mut User, v| u.age = Some(v))
}

/// One listener call as seen by [`RecordingListener`].
#[derive(Debug, Clone)]
pub struct Call {
    pub table: String,
    pub kind: MutationKind,
    pub users: Vec<User>,
    pub conversion_errors: usize,
}

/// Records every call; fails the first `failures` calls that see `fail_on_id`.
#[derive(Clone, Default)]
pub struct RecordingListener {
    pub table: String,
    pub fail_on_id: Option<i64>,
    pub failures: Arc<AtomicUsize>,
    pub calls: Arc<Mutex<Vec<Call>>>,
}

impl RecordingListener {
    pub fn new(table: &str) -> Self {
        Self {
            table: table.to_string(),
            ..Default::default()
        }
    }

    pub fn failing_on(mut self, id: i64, times: usize) -> Self {
        self.fail_on_id = Some(id);
        self.failures = Arc::new(AtomicUsize::new(times));
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn ids(&self) -> Vec<i64> {
        self.calls().iter().map(|c| c.users[0].id).collect()
    }
}

#[async_trait]
impl EntryListener<User> for RecordingListener {
    async fn on_row_change(&self, rows: &[TypedRow<User>], kind: MutationKind) -> anyhow::Result<()> {
        if let Some(id) = self.fail_on_id {
            let hit = rows.iter().any(|r| r.id == id);
            if hit
                && self
                    .failures
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok()
            {
                anyhow::bail!("listener rejected id {}", id);
            }
        }

        self.calls.lock().unwrap().push(Call {
            table: self.table.clone(),
            kind,
            users: rows.iter().map(|r| r.entity.clone()).collect(),
            conversion_errors: rows.iter().map(|r| r.errors.len()).sum(),
        });
        Ok(())
    }
}

pub fn flat_message(table: &str, kind: &str, data: Value, old: Value) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "id": 1,
        "database": "db",
        "table": table,
        "type": kind,
        "isDdl": false,
        "pkNames": ["id"],
        "data": data,
        "old": old,
        "es": 1700000000000i64,
        "ts": 1700000000100i64
    }))
    .unwrap()
}

pub fn flat_insert(table: &str, id: i64) -> Vec<u8> {
    flat_message(
        table,
        "INSERT",
        json!([{"id": id.to_string(), "name": format!("user-{}", id)}]),
        Value::Null,
    )
}

/// Consumer settings for tests: short poll timeout and backoff.
pub fn test_consumer_config(async_dispatch: bool) -> ConsumerConfig {
    ConsumerConfig {
        batch_size: 10,
        timeout: 10,
        unit: TimeUnit::Milliseconds,
        async_dispatch,
        worker_pool_size: 4,
        min_backoff_ms: 5,
        max_backoff_ms: 20,
        ..ConsumerConfig::default()
    }
}

#[derive(Debug, Default)]
pub struct SourceState {
    pub batches: Vec<Vec<Vec<u8>>>,
    pub cursor: usize,
    pub acked: Vec<usize>,
    pub rewinds: Vec<usize>,
    pub pulls: usize,
    pub pull_failures: usize,
    pub rewind_failures: usize,
    pub closed: bool,
}

/// In-memory broker: each queued batch is delivered whole, and a rewind
/// delivers it again.
#[derive(Clone, Default)]
pub struct MemorySource {
    pub state: Arc<Mutex<SourceState>>,
}

impl MemorySource {
    pub fn with_batches(batches: Vec<Vec<Vec<u8>>>) -> Self {
        let source = Self::default();
        source.state.lock().unwrap().batches = batches;
        source
    }

    pub fn failing_pulls(self, count: usize) -> Self {
        self.state.lock().unwrap().pull_failures = count;
        self
    }

    pub fn failing_rewinds(self, count: usize) -> Self {
        self.state.lock().unwrap().rewind_failures = count;
        self
    }

    pub fn acked(&self) -> Vec<usize> {
        self.state.lock().unwrap().acked.clone()
    }

    pub fn rewinds(&self) -> Vec<usize> {
        self.state.lock().unwrap().rewinds.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    pub fn is_drained(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.acked.len() == state.batches.len() && state.cursor == state.batches.len()
    }
}

#[async_trait]
impl BatchSource for MemorySource {
    type Position = usize;

    async fn pull(&mut self, _max_messages: usize, timeout: Duration) -> Result<Option<PulledBatch<usize>>> {
        let next = {
            let mut state = self.state.lock().unwrap();
            state.pulls += 1;
            if state.pull_failures > 0 {
                state.pull_failures -= 1;
                return Err(Error::Pull {
                    message: "broker unavailable".to_string(),
                });
            }
            let cursor = state.cursor;
            match state.batches.get(cursor).cloned() {
                Some(payloads) => {
                    state.cursor += 1;
                    Some(PulledBatch {
                        payloads,
                        position: cursor,
                    })
                }
                None => None,
            }
        };

        if next.is_none() {
            tokio::time::sleep(timeout).await;
        }
        Ok(next)
    }

    async fn ack(&mut self, position: &usize) -> Result<()> {
        self.state.lock().unwrap().acked.push(*position);
        Ok(())
    }

    async fn rewind(&mut self, position: &usize) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.rewind_failures > 0 {
            state.rewind_failures -= 1;
            return Err(Error::Pull {
                message: "seek failed".to_string(),
            });
        }
        state.rewinds.push(*position);
        state.cursor = *position;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.state.lock().unwrap().closed = true;
        Ok(())
    }
}

/// Polls `condition` until it holds or two seconds pass.
pub async fn wait_until<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
