//! Commit log transport
//!
//! The log is the only source of truth: an append-only, partitioned,
//! ordered-per-key record log that can be replayed from offset zero.
//! [`CommitLog`] is the seam to a real broker; [`InMemoryCommitLog`] backs
//! tests, the demo binary and single-process deployments.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use tokio::sync::watch;

use crate::error::{KeyMaterialError, Result};

/// A record as stored in one partition of a topic
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub partition: u32,
    pub offset: u64,
    pub key: String,
    pub payload: Vec<u8>,
    pub timestamp: DateTime<Utc>,
}

/// Where an appended record landed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordPosition {
    pub partition: u32,
    pub offset: u64,
}

/// Partitioned, ordered-per-key, replayable log
#[async_trait]
pub trait CommitLog: Send + Sync {
    /// Number of partitions of `topic`
    fn partitions(&self, topic: &str) -> u32;

    /// Append a record; all records with the same key land in the same partition
    async fn append(&self, topic: &str, key: &str, payload: Vec<u8>) -> Result<RecordPosition>;

    /// Read up to `max` records of one partition starting at `from_offset`
    async fn read(
        &self,
        topic: &str,
        partition: u32,
        from_offset: u64,
        max: usize,
    ) -> Result<Vec<LogRecord>>;

    /// Offset the next appended record of the partition will get
    async fn end_offset(&self, topic: &str, partition: u32) -> Result<u64>;

    /// Append counter for `topic`; changes whenever a record is appended
    fn subscribe(&self, topic: &str) -> watch::Receiver<u64>;
}

/// Stable key partitioner shared by every process reading the same log
pub fn partition_for(key: &str, partitions: u32) -> u32 {
    let digest = Sha256::digest(key.as_bytes());
    let hash = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    hash % partitions.max(1)
}

struct TopicLog {
    partitions: Vec<Vec<LogRecord>>,
    appended: watch::Sender<u64>,
}

impl TopicLog {
    fn new(partitions: u32) -> Self {
        let (appended, _) = watch::channel(0);
        Self {
            partitions: (0..partitions).map(|_| Vec::new()).collect(),
            appended,
        }
    }
}

/// In-process commit log
pub struct InMemoryCommitLog {
    partitions: u32,
    topics: RwLock<HashMap<String, TopicLog>>,
    available: AtomicBool,
}

impl InMemoryCommitLog {
    pub fn new(partitions: u32) -> Self {
        Self {
            partitions: partitions.max(1),
            topics: RwLock::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate the transport becoming unreachable (or reachable again)
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Total number of records appended to `topic`
    pub fn record_count(&self, topic: &str) -> usize {
        self.topics
            .read()
            .get(topic)
            .map(|t| t.partitions.iter().map(Vec::len).sum())
            .unwrap_or(0)
    }

    fn ensure_available(&self, topic: &str) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(KeyMaterialError::Transport(format!("commit log unreachable (topic {})", topic)))
        }
    }

    fn check_partition(&self, topic: &str, partition: u32) -> Result<()> {
        if partition >= self.partitions {
            return Err(KeyMaterialError::Transport(format!(
                "partition {} out of range for topic {} ({} partitions)",
                partition, topic, self.partitions
            )));
        }
        Ok(())
    }

    fn with_topic<T>(&self, topic: &str, f: impl FnOnce(&mut TopicLog) -> T) -> T {
        let mut topics = self.topics.write();
        let log = topics
            .entry(topic.to_string())
            .or_insert_with(|| TopicLog::new(self.partitions));
        f(log)
    }
}

impl Default for InMemoryCommitLog {
    fn default() -> Self {
        Self::new(1)
    }
}

#[async_trait]
impl CommitLog for InMemoryCommitLog {
    fn partitions(&self, _topic: &str) -> u32 {
        self.partitions
    }

    async fn append(&self, topic: &str, key: &str, payload: Vec<u8>) -> Result<RecordPosition> {
        self.ensure_available(topic)?;
        let partition = partition_for(key, self.partitions);

        let position = self.with_topic(topic, |log| {
            let records = &mut log.partitions[partition as usize];
            let offset = records.len() as u64;
            records.push(LogRecord {
                partition,
                offset,
                key: key.to_string(),
                payload,
                timestamp: Utc::now(),
            });
            log.appended.send_modify(|count| *count += 1);
            RecordPosition { partition, offset }
        });

        tracing::trace!(topic, key, partition, offset = position.offset, "record appended");
        Ok(position)
    }

    async fn read(
        &self,
        topic: &str,
        partition: u32,
        from_offset: u64,
        max: usize,
    ) -> Result<Vec<LogRecord>> {
        self.ensure_available(topic)?;
        self.check_partition(topic, partition)?;

        let topics = self.topics.read();
        let Some(log) = topics.get(topic) else {
            return Ok(Vec::new());
        };
        let records = &log.partitions[partition as usize];
        let start = (from_offset as usize).min(records.len());
        let end = start.saturating_add(max).min(records.len());
        Ok(records[start..end].to_vec())
    }

    async fn end_offset(&self, topic: &str, partition: u32) -> Result<u64> {
        self.ensure_available(topic)?;
        self.check_partition(topic, partition)?;

        Ok(self
            .topics
            .read()
            .get(topic)
            .map(|log| log.partitions[partition as usize].len() as u64)
            .unwrap_or(0))
    }

    fn subscribe(&self, topic: &str) -> watch::Receiver<u64> {
        self.with_topic(topic, |log| log.appended.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partitioner_is_stable() {
        let p = partition_for("user-42", 6);
        assert!(p < 6);
        for _ in 0..10 {
            assert_eq!(partition_for("user-42", 6), p);
        }
        assert_eq!(partition_for("anything", 1), 0);
        assert_eq!(partition_for("anything", 0), 0);
    }

    #[tokio::test]
    async fn test_same_key_is_ordered_in_one_partition() {
        let log = InMemoryCommitLog::new(4);
        let first = log.append("commands", "user-1", b"a".to_vec()).await.unwrap();
        let second = log.append("commands", "user-1", b"b".to_vec()).await.unwrap();

        assert_eq!(first.partition, second.partition);
        assert_eq!(second.offset, first.offset + 1);

        let records = log.read("commands", first.partition, 0, 10).await.unwrap();
        let payloads: Vec<_> = records.iter().map(|r| r.payload.clone()).collect();
        assert_eq!(payloads, vec![b"a".to_vec(), b"b".to_vec()]);
        assert_eq!(log.end_offset("commands", first.partition).await.unwrap(), 2);
        assert_eq!(log.record_count("commands"), 2);
    }

    #[tokio::test]
    async fn test_read_window() {
        let log = InMemoryCommitLog::new(1);
        for i in 0..5u8 {
            log.append("t", "k", vec![i]).await.unwrap();
        }
        let window = log.read("t", 0, 3, 10).await.unwrap();
        assert_eq!(window.iter().map(|r| r.offset).collect::<Vec<_>>(), vec![3, 4]);
        assert!(log.read("t", 0, 9, 10).await.unwrap().is_empty());
        assert!(log.read("missing", 0, 0, 10).await.unwrap().is_empty());
        assert!(log.read("t", 1, 0, 10).await.is_err());
    }

    #[tokio::test]
    async fn test_subscribe_sees_appends() {
        let log = InMemoryCommitLog::new(2);
        let mut rx = log.subscribe("t");
        log.append("t", "k", vec![1]).await.unwrap();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), 1);
    }

    #[tokio::test]
    async fn test_unavailable_transport() {
        let log = InMemoryCommitLog::new(1);
        log.set_available(false);
        let err = log.append("t", "k", vec![]).await.unwrap_err();
        assert!(matches!(err, KeyMaterialError::Transport(_)));
        assert!(log.read("t", 0, 0, 1).await.is_err());

        log.set_available(true);
        assert!(log.append("t", "k", vec![]).await.is_ok());
    }
}
