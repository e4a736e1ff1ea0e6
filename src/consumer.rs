//! The consume loop: pull a batch, dispatch it, and acknowledge it only when
//! every change was handled.
//!
//! A failed batch is rewound instead of acknowledged, so the broker delivers
//! it again on the next pull. Listeners therefore see at-least-once
//! delivery and may receive a change more than once.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use cdc_dispatch::config::Config;
//! use cdc_dispatch::consumer::ConsumerClient;
//! use cdc_dispatch::dispatch::MessageHandler;
//! use cdc_dispatch::kafka::KafkaSource;
//! use cdc_dispatch::registry::ListenerRegistry;
//!
//! # async fn example() -> cdc_dispatch::Result<()> {
//! let config = Config::from_file("config.toml")?;
//! let registry = Arc::new(ListenerRegistry::builder().build());
//! let handler = MessageHandler::from_config(&config.consumer, registry);
//! let source = KafkaSource::new(&config.kafka)?;
//!
//! let handle = ConsumerClient::new(source, handler, &config.consumer)?.start();
//! tokio::signal::ctrl_c().await?;
//! handle.stop().await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::config::ConsumerConfig;
use crate::dispatch::{BatchOutcome, MessageHandler};
use crate::message::{RawBatch, SubscriptionFilter};
use crate::{Error, Result};

/// Raw payloads of one pull, with the position that acknowledges them.
#[derive(Debug)]
pub struct PulledBatch<P> {
    pub payloads: Vec<Vec<u8>>,
    pub position: P,
}

/// The broker side of the consumer.
#[async_trait]
pub trait BatchSource: Send + 'static {
    /// Opaque position covering one pulled batch.
    type Position: Send + Sync + fmt::Debug;

    /// Waits up to `timeout` for at most `max_messages` messages.
    /// `Ok(None)` means nothing arrived in time.
    async fn pull(
        &mut self,
        max_messages: usize,
        timeout: Duration,
    ) -> Result<Option<PulledBatch<Self::Position>>>;

    /// Advances the durable position past the batch.
    async fn ack(&mut self, position: &Self::Position) -> Result<()>;

    /// Moves the read position back so the batch is delivered again.
    async fn rewind(&mut self, position: &Self::Position) -> Result<()>;

    /// Releases the broker connection.
    async fn close(&mut self) -> Result<()>;
}

/// Counters describing what the consumer has done so far.
#[derive(Debug, Default)]
pub struct ConsumerStats {
    batches_acked: AtomicU64,
    batches_failed: AtomicU64,
    changes_dispatched: AtomicU64,
    changes_skipped: AtomicU64,
    changes_filtered: AtomicU64,
    pull_errors: AtomicU64,
}

impl ConsumerStats {
    pub fn batches_acked(&self) -> u64 {
        self.batches_acked.load(Ordering::Relaxed)
    }

    pub fn batches_failed(&self) -> u64 {
        self.batches_failed.load(Ordering::Relaxed)
    }

    pub fn changes_dispatched(&self) -> u64 {
        self.changes_dispatched.load(Ordering::Relaxed)
    }

    pub fn changes_skipped(&self) -> u64 {
        self.changes_skipped.load(Ordering::Relaxed)
    }

    pub fn changes_filtered(&self) -> u64 {
        self.changes_filtered.load(Ordering::Relaxed)
    }

    pub fn pull_errors(&self) -> u64 {
        self.pull_errors.load(Ordering::Relaxed)
    }
}

/// Exponential backoff between failed iterations, capped at `max`.
#[derive(Debug, Clone)]
struct Backoff {
    min: Duration,
    max: Duration,
    consecutive: u32,
}

impl Backoff {
    fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max,
            consecutive: 0,
        }
    }

    fn next_delay(&mut self) -> Duration {
        self.consecutive = self.consecutive.saturating_add(1);
        let factor = 2u32.saturating_pow(self.consecutive.saturating_sub(1).min(31));
        self.min.saturating_mul(factor).min(self.max)
    }

    fn reset(&mut self) {
        self.consecutive = 0;
    }
}

/// How one loop iteration ended.
enum Iteration {
    Idle,
    Acked,
    Failed,
}

pub struct ConsumerClient<S: BatchSource> {
    source: S,
    handler: MessageHandler,
    filter: SubscriptionFilter,
    batch_size: usize,
    poll_timeout: Duration,
    shutdown_grace: Option<Duration>,
    backoff: Backoff,
    /// Position of a failed batch whose rewind has not succeeded yet.
    /// Nothing is pulled while it is set.
    pending_rewind: Option<S::Position>,
    stats: Arc<ConsumerStats>,
}

impl<S: BatchSource> ConsumerClient<S> {
    pub fn new(source: S, handler: MessageHandler, config: &ConsumerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            source,
            handler,
            filter: SubscriptionFilter::parse(&config.filter)?,
            batch_size: config.batch_size,
            poll_timeout: config.poll_timeout(),
            shutdown_grace: config.shutdown_grace(),
            backoff: Backoff::new(config.min_backoff(), config.max_backoff()),
            pending_rewind: None,
            stats: Arc::new(ConsumerStats::default()),
        })
    }

    pub fn stats(&self) -> Arc<ConsumerStats> {
        Arc::clone(&self.stats)
    }

    /// Spawns the consume loop on its own task.
    pub fn start(self) -> ConsumerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (abort_tx, abort_rx) = watch::channel(false);
        let stats = self.stats();
        let grace = self.shutdown_grace;

        info!(
            batch_size = self.batch_size,
            poll_timeout_ms = self.poll_timeout.as_millis() as u64,
            mode = ?self.handler.mode(),
            format = ?self.handler.format(),
            "Starting consumer"
        );
        let task = tokio::spawn(self.run(shutdown_rx, abort_rx));

        ConsumerHandle {
            shutdown: shutdown_tx,
            abort: abort_tx,
            task,
            stats,
            grace,
        }
    }

    /// Runs until `shutdown` turns true or its sender is dropped. An `abort`
    /// signal also abandons the batch in progress. The source is closed on
    /// every exit path.
    async fn run(
        mut self,
        mut shutdown: watch::Receiver<bool>,
        mut abort: watch::Receiver<bool>,
    ) -> Result<()> {
        let result = self.consume(&mut shutdown, &mut abort).await;

        if let Err(e) = self.source.close().await {
            warn!(error = %e, "Failed to close batch source");
        }
        info!(
            batches_acked = self.stats.batches_acked(),
            batches_failed = self.stats.batches_failed(),
            "Consumer stopped"
        );
        result
    }

    async fn consume(
        &mut self,
        shutdown: &mut watch::Receiver<bool>,
        abort: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            if let Some(position) = self.pending_rewind.take() {
                if let Err(e) = self.source.rewind(&position).await {
                    error!(error = %e, ?position, "Rewind still failing, not pulling");
                    self.pending_rewind = Some(position);
                    if !self.back_off(shutdown).await {
                        return Ok(());
                    }
                    continue;
                }
                info!(?position, "Rewound failed batch");
            }

            let pulled = tokio::select! {
                biased;
                _ = shutdown.changed() => return Ok(()),
                pulled = self.source.pull(self.batch_size, self.poll_timeout) => pulled,
            };

            let iteration = match pulled {
                Ok(Some(batch)) => {
                    tokio::select! {
                        biased;
                        _ = aborted(abort) => {
                            warn!("Abandoning in-flight batch, it stays unacknowledged");
                            return Ok(());
                        }
                        iteration = self.process(batch) => iteration,
                    }
                }
                Ok(None) => {
                    trace!("Empty pull");
                    Iteration::Idle
                }
                Err(e) => {
                    self.stats.pull_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(error = %e, "Pull failed");
                    Iteration::Failed
                }
            };

            match iteration {
                Iteration::Acked => self.backoff.reset(),
                Iteration::Idle => {}
                Iteration::Failed => {
                    if !self.back_off(shutdown).await {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Sleeps for the next backoff delay. Returns false if shutdown was
    /// signalled meanwhile.
    async fn back_off(&mut self, shutdown: &mut watch::Receiver<bool>) -> bool {
        let delay = self.backoff.next_delay();
        debug!(delay_ms = delay.as_millis() as u64, "Backing off");
        tokio::select! {
            biased;
            _ = shutdown.changed() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    /// Decodes, filters and dispatches one pulled batch, then acknowledges or
    /// rewinds it. Not cancelled by shutdown once started.
    #[instrument(skip_all, fields(messages = pulled.payloads.len()))]
    async fn process(&mut self, pulled: PulledBatch<S::Position>) -> Iteration {
        let PulledBatch { payloads, position } = pulled;

        let batch = match self.materialize(&payloads) {
            Ok(batch) => batch,
            Err(e) => {
                self.stats.pull_errors.fetch_add(1, Ordering::Relaxed);
                error!(error = %e, ?position, "Malformed batch, rewinding");
                self.rewind(position).await;
                return Iteration::Failed;
            }
        };

        let outcome = if batch.is_empty() {
            BatchOutcome::AllOk {
                dispatched: 0,
                skipped: 0,
            }
        } else {
            self.handler.dispatch_batch(batch).await
        };

        match outcome {
            BatchOutcome::AllOk {
                dispatched,
                skipped,
            } => {
                self.stats
                    .changes_dispatched
                    .fetch_add(dispatched as u64, Ordering::Relaxed);
                self.stats
                    .changes_skipped
                    .fetch_add(skipped as u64, Ordering::Relaxed);

                if let Err(e) = self.source.ack(&position).await {
                    error!(error = %e, ?position, "Failed to acknowledge batch");
                    return Iteration::Failed;
                }
                self.stats.batches_acked.fetch_add(1, Ordering::Relaxed);
                debug!(dispatched, skipped, ?position, "Batch acknowledged");
                Iteration::Acked
            }
            BatchOutcome::FirstFailure {
                index,
                dispatched,
                error,
            } => {
                self.stats
                    .changes_dispatched
                    .fetch_add(dispatched as u64, Ordering::Relaxed);
                self.stats.batches_failed.fetch_add(1, Ordering::Relaxed);
                error!(
                    index,
                    schema = %error.schema,
                    table = %error.table,
                    kind = %error.kind,
                    rows = ?error.rows.iter().map(ToString::to_string).collect::<Vec<_>>(),
                    error = %format!("{:#}", error.source),
                    "Batch failed, position not advanced"
                );
                self.rewind(position).await;
                Iteration::Failed
            }
        }
    }

    fn materialize(&self, payloads: &[Vec<u8>]) -> Result<RawBatch> {
        let mut batch = RawBatch::default();
        for payload in payloads {
            let changes = self.handler.decode(payload).map_err(|e| Error::Pull {
                message: format!("undecodable message: {}", e),
            })?;
            for change in changes {
                if self.filter.matches(&change.key) {
                    batch.push(change);
                } else {
                    self.stats.changes_filtered.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        Ok(batch)
    }

    /// Rewinds to a failed batch. A failed rewind is kept pending and
    /// retried before the next pull, so no later batch is acknowledged past
    /// the failed one.
    async fn rewind(&mut self, position: S::Position) {
        if let Err(e) = self.source.rewind(&position).await {
            error!(error = %e, ?position, "Failed to rewind source, retrying before next pull");
            self.pending_rewind = Some(position);
        }
    }
}

/// Resolves once `abort` turns true. Never resolves if its sender is gone.
async fn aborted(abort: &mut watch::Receiver<bool>) {
    let released = abort.wait_for(|abort| *abort).await.is_err();
    if released {
        std::future::pending::<()>().await;
    }
}

/// Control handle for a started consumer.
///
/// Dropping the handle without calling [`stop`](ConsumerHandle::stop) also
/// stops the loop, but nothing waits for it.
pub struct ConsumerHandle {
    shutdown: watch::Sender<bool>,
    abort: watch::Sender<bool>,
    task: JoinHandle<Result<()>>,
    stats: Arc<ConsumerStats>,
    grace: Option<Duration>,
}

impl ConsumerHandle {
    pub fn stats(&self) -> &ConsumerStats {
        &self.stats
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Signals shutdown and waits for the in-flight batch to settle.
    ///
    /// With a grace period, a batch still in progress after it elapses is
    /// abandoned: its listener calls are cancelled, the source is closed, and
    /// [`Error::Timeout`] is returned. The abandoned batch is not
    /// acknowledged.
    pub async fn stop(self) -> Result<()> {
        let ConsumerHandle {
            shutdown,
            abort,
            mut task,
            grace,
            ..
        } = self;
        let _ = shutdown.send(true);
        info!("Stopping consumer");

        let joined = match grace {
            None => task.await,
            Some(grace) => match tokio::time::timeout(grace, &mut task).await {
                Ok(joined) => joined,
                Err(_) => {
                    warn!(grace_ms = grace.as_millis() as u64, "Consumer busy past grace period, abandoning batch");
                    let _ = abort.send(true);
                    if tokio::time::timeout(grace, &mut task).await.is_err() {
                        error!("Consumer did not release its source, aborting task");
                        task.abort();
                    }
                    return Err(Error::Timeout {
                        message: format!(
                            "consumer did not stop within {} ms",
                            grace.as_millis()
                        ),
                    });
                }
            },
        };

        joined.map_err(|e| Error::Consumer {
            message: format!("consumer task failed: {}", e),
        })?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(500));

        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
        assert_eq!(backoff.next_delay(), Duration::from_millis(400));
        assert_eq!(backoff.next_delay(), Duration::from_millis(500));
        assert_eq!(backoff.next_delay(), Duration::from_millis(500));

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn test_backoff_survives_many_failures() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(60));
        for _ in 0..100 {
            backoff.next_delay();
        }
        assert_eq!(backoff.next_delay(), Duration::from_secs(60));
    }
}
