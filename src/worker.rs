//! Partition tailing loop shared by the aggregation stage and the
//! changelog consumers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{oneshot, watch};

use crate::error::Result;
use crate::log::{CommitLog, LogRecord};

/// Per-record logic driven by a [`PartitionWorker`]
#[async_trait]
pub trait PartitionHandler: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    /// Offset to start consuming `partition` from
    async fn start_offset(&self, partition: u32) -> Result<u64>;

    /// Apply one record. An error makes the worker retry the same record.
    async fn handle(&self, record: &LogRecord) -> Result<()>;
}

/// Tails one partition of a topic and feeds records to a handler, in order.
pub struct PartitionWorker<H> {
    pub log: Arc<dyn CommitLog>,
    pub topic: String,
    pub partition: u32,
    pub batch_size: usize,
    pub retry_backoff: Duration,
    pub handler: H,
}

impl<H: PartitionHandler> PartitionWorker<H> {
    /// Run until `shutdown` flips to true. `ready` fires once every record
    /// that existed when the worker started has been handled; it is dropped
    /// unfired if the worker stops first.
    pub async fn run(self, ready: oneshot::Sender<()>, mut shutdown: watch::Receiver<bool>) {
        let name = self.handler.name();
        let partition = self.partition;
        let mut appended = self.log.subscribe(&self.topic);
        let mut ready = Some(ready);

        let (mut offset, target) = loop {
            match self.start_position().await {
                Ok(position) => break position,
                Err(e) => {
                    tracing::warn!(
                        worker = name,
                        partition,
                        error = %e,
                        "cannot read start position"
                    );
                    if self.pause(&mut shutdown).await {
                        return;
                    }
                }
            }
        };
        tracing::info!(
            worker = name,
            topic = %self.topic,
            partition,
            offset,
            target,
            "partition worker started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            if offset >= target {
                if let Some(tx) = ready.take() {
                    tracing::debug!(worker = name, partition, offset, "partition worker caught up");
                    let _ = tx.send(());
                }
            }

            let batch = match self.log.read(&self.topic, partition, offset, self.batch_size).await {
                Ok(batch) => batch,
                Err(e) => {
                    tracing::warn!(
                        worker = name,
                        partition,
                        offset,
                        error = %e,
                        "reading partition failed"
                    );
                    if self.pause(&mut shutdown).await {
                        break;
                    }
                    continue;
                }
            };

            if batch.is_empty() {
                tokio::select! {
                    changed = appended.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = shutdown.changed() => break,
                }
                continue;
            }

            let mut failed = false;
            for record in batch {
                match self.handler.handle(&record).await {
                    Ok(()) => offset = record.offset + 1,
                    Err(e) => {
                        tracing::error!(
                            worker = name,
                            partition,
                            offset = record.offset,
                            key = %record.key,
                            error = %e,
                            "handling record failed, will retry"
                        );
                        failed = true;
                        break;
                    }
                }
            }
            if failed && self.pause(&mut shutdown).await {
                break;
            }
        }

        tracing::info!(worker = name, partition, offset, "partition worker stopped");
    }

    async fn start_position(&self) -> Result<(u64, u64)> {
        let offset = self.handler.start_offset(self.partition).await?;
        let target = self.log.end_offset(&self.topic, self.partition).await?;
        Ok((offset, target))
    }

    /// Sleep for the retry back-off; true if shutdown was requested meanwhile
    async fn pause(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        let interrupted = tokio::select! {
            _ = tokio::time::sleep(self.retry_backoff) => false,
            _ = shutdown.changed() => true,
        };
        interrupted || *shutdown.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::KeyMaterialError;
    use crate::log::InMemoryCommitLog;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Records handled offsets; fails the first attempt at `fail_at`
    struct FlakyHandler {
        fail_at: u64,
        attempts: AtomicU32,
        handled: Arc<Mutex<Vec<u64>>>,
    }

    #[async_trait]
    impl PartitionHandler for FlakyHandler {
        fn name(&self) -> &'static str {
            "flaky"
        }

        async fn start_offset(&self, _partition: u32) -> Result<u64> {
            Ok(0)
        }

        async fn handle(&self, record: &LogRecord) -> Result<()> {
            if record.offset == self.fail_at && self.attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(KeyMaterialError::Storage("transient".into()));
            }
            self.handled.lock().push(record.offset);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_failed_record_is_retried_in_order() {
        let log = Arc::new(InMemoryCommitLog::new(1));
        for i in 0..4 {
            log.append("topic", "key", vec![i]).await.unwrap();
        }
        let handled = Arc::new(Mutex::new(Vec::new()));
        let worker = PartitionWorker {
            log: log.clone(),
            topic: "topic".into(),
            partition: 0,
            batch_size: 3,
            retry_backoff: Duration::from_millis(10),
            handler: FlakyHandler {
                fail_at: 1,
                attempts: AtomicU32::new(0),
                handled: handled.clone(),
            },
        };
        let (ready_tx, ready_rx) = oneshot::channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(worker.run(ready_tx, shutdown_rx));

        tokio::time::timeout(Duration::from_secs(5), ready_rx).await.unwrap().unwrap();
        assert_eq!(*handled.lock(), vec![0, 1, 2, 3]);

        // Records appended after catching up are picked up too.
        log.append("topic", "key", vec![9]).await.unwrap();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while handled.lock().len() < 5 {
            assert!(tokio::time::Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_before_ready_drops_signal() {
        let log = Arc::new(InMemoryCommitLog::new(1));
        log.set_available(false);
        let worker = PartitionWorker {
            log: log.clone(),
            topic: "topic".into(),
            partition: 0,
            batch_size: 8,
            retry_backoff: Duration::from_millis(10),
            handler: FlakyHandler {
                fail_at: u64::MAX,
                attempts: AtomicU32::new(0),
                handled: Arc::new(Mutex::new(Vec::new())),
            },
        };
        let (ready_tx, ready_rx) = oneshot::channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(worker.run(ready_tx, shutdown_rx));

        tokio::time::sleep(Duration::from_millis(30)).await;
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
        assert!(ready_rx.await.is_err());
    }
}
