//! Fire-and-forget submission of accounting batches.
//!
//! Batches go into a bounded queue drained by a single pump task, which runs
//! each batch on its own task once one of `workers` permits is free. When the
//! queue is full the new batch is rejected and logged rather than queued
//! without bound. Nothing on the reply path ever awaits a batch.

use super::{RateLimitClient, RateLimitHit};
use crate::error::DispatchError;
use serde::Deserialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Semaphore, mpsc};
use tracing::{debug, error, warn};

/// Sizing of the dispatch pool.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Maximum number of batches in flight against the limiter.
    pub workers: usize,
    /// Batches that may wait for a free worker before new ones are shed.
    pub queue_capacity: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            workers: 10,
            queue_capacity: 1024,
        }
    }
}

/// Running counters for the dispatcher.
#[derive(Debug, Default)]
pub struct DispatchStats {
    submitted: AtomicU64,
    rejected: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

impl DispatchStats {
    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

/// Process-wide handle for submitting batches. Cheap to clone.
#[derive(Clone)]
pub struct RateLimitDispatcher {
    tx: mpsc::Sender<Vec<RateLimitHit>>,
    capacity: usize,
    stats: Arc<DispatchStats>,
}

impl RateLimitDispatcher {
    /// Start the pump task on the current Tokio runtime.
    ///
    /// Zero-sized pools are bumped to one.
    pub fn spawn(client: Arc<dyn RateLimitClient>, config: DispatcherConfig) -> Self {
        let capacity = config.queue_capacity.max(1);
        let workers = config.workers.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let stats = Arc::new(DispatchStats::default());

        tokio::spawn(pump(
            rx,
            client,
            Arc::new(Semaphore::new(workers)),
            Arc::clone(&stats),
        ));

        Self {
            tx,
            capacity,
            stats,
        }
    }

    /// Queue `hits` for submission without waiting. Empty batches are dropped.
    pub fn submit(&self, hits: Vec<RateLimitHit>) -> Result<(), DispatchError> {
        if hits.is_empty() {
            return Ok(());
        }
        match self.tx.try_send(hits) {
            Ok(()) => {
                self.stats.submitted.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(TrySendError::Full(batch)) => {
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                warn!(
                    batch_size = batch.len(),
                    capacity = self.capacity,
                    "rate-limit dispatch queue full, dropping batch"
                );
                Err(DispatchError::QueueFull {
                    capacity: self.capacity,
                })
            }
            Err(TrySendError::Closed(_)) => Err(DispatchError::Closed),
        }
    }

    pub fn stats(&self) -> &DispatchStats {
        &self.stats
    }
}

async fn pump(
    mut rx: mpsc::Receiver<Vec<RateLimitHit>>,
    client: Arc<dyn RateLimitClient>,
    permits: Arc<Semaphore>,
    stats: Arc<DispatchStats>,
) {
    while let Some(batch) = rx.recv().await {
        let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
            break;
        };
        let client = Arc::clone(&client);
        let stats = Arc::clone(&stats);
        tokio::spawn(async move {
            let _permit = permit;
            match client.should_rate_limit(&batch).await {
                Ok(decision) => {
                    stats.completed.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        client = client.name(),
                        batch_size = batch.len(),
                        decision = ?decision,
                        "rate-limit batch recorded"
                    );
                }
                Err(e) => {
                    stats.failed.fetch_add(1, Ordering::Relaxed);
                    error!(
                        client = client.name(),
                        batch_size = batch.len(),
                        error = %e,
                        "rate-limit batch failed"
                    );
                }
            }
        });
    }
    debug!("rate-limit dispatcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::RateLimitDecision;
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::sync::Notify;

    struct Recording {
        tx: mpsc::UnboundedSender<Vec<RateLimitHit>>,
        gate: Option<Arc<Notify>>,
        fail: bool,
    }

    #[async_trait]
    impl RateLimitClient for Recording {
        fn name(&self) -> &str {
            "recording"
        }

        async fn should_rate_limit(
            &self,
            hits: &[RateLimitHit],
        ) -> Result<RateLimitDecision, DispatchError> {
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            let _ = self.tx.send(hits.to_vec());
            if self.fail {
                Err(DispatchError::Client("unavailable".into()))
            } else {
                Ok(RateLimitDecision::Ok)
            }
        }
    }

    fn batch() -> Vec<RateLimitHit> {
        vec![RateLimitHit::new("aitotaltokencount", "b", 14)]
    }

    #[tokio::test]
    async fn submitted_batch_reaches_client() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let client = Arc::new(Recording { tx, gate: None, fail: false });
        let dispatcher = RateLimitDispatcher::spawn(client, DispatcherConfig::default());

        dispatcher.submit(batch()).unwrap();
        let got = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, batch());
        assert_eq!(dispatcher.stats().submitted(), 1);
    }

    #[tokio::test]
    async fn empty_batch_is_not_queued() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let client = Arc::new(Recording { tx, gate: None, fail: false });
        let dispatcher = RateLimitDispatcher::spawn(client, DispatcherConfig::default());
        dispatcher.submit(Vec::new()).unwrap();
        assert_eq!(dispatcher.stats().submitted(), 0);
    }

    #[tokio::test]
    async fn full_queue_sheds_new_batches() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let client = Arc::new(Recording {
            tx,
            gate: Some(Arc::new(Notify::new())),
            fail: false,
        });
        let dispatcher = RateLimitDispatcher::spawn(
            client,
            DispatcherConfig {
                workers: 1,
                queue_capacity: 1,
            },
        );

        // The current-thread test runtime does not run the pump until we
        // yield, so the second submission finds the queue full.
        dispatcher.submit(batch()).unwrap();
        let err = dispatcher.submit(batch()).unwrap_err();
        assert!(matches!(err, DispatchError::QueueFull { capacity: 1 }));
        assert_eq!(dispatcher.stats().rejected(), 1);
    }

    #[tokio::test]
    async fn client_failure_is_counted() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let client = Arc::new(Recording { tx, gate: None, fail: true });
        let dispatcher = RateLimitDispatcher::spawn(client, DispatcherConfig::default());

        dispatcher.submit(batch()).unwrap();
        rx.recv().await.unwrap();
        for _ in 0..100 {
            if dispatcher.stats().failed() == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(dispatcher.stats().failed(), 1);
    }
}
