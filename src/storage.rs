//! Partition-local aggregate table
//!
//! The aggregation stage materializes its output here and commits, per
//! commands partition, the offset of the next command to apply. A restarted
//! worker resumes at that offset instead of replaying the whole partition.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::error::Result;
use crate::material::{MaterialAggregate, Subject};

/// Aggregate row of the local table
#[derive(Debug, Clone)]
pub struct StoredAggregate {
    pub subject: Subject,
    pub aggregate: MaterialAggregate,
    /// Commands partition owning the subject
    pub partition: u32,
    pub updated_at: DateTime<Utc>,
}

/// Storage trait for the local table backend
#[async_trait]
pub trait AggregateStore: Send + Sync {
    /// Current aggregate of a subject
    async fn get(&self, subject: &Subject) -> Result<Option<MaterialAggregate>>;

    /// Upsert the aggregate of a subject
    async fn put(&self, entry: StoredAggregate) -> Result<()>;

    /// Record that every command of `partition` before `next_offset` is applied
    async fn commit_offset(&self, partition: u32, next_offset: u64) -> Result<()>;

    /// Committed next offset of a partition, `None` if nothing was processed yet
    async fn committed_offset(&self, partition: u32) -> Result<Option<u64>>;

    /// Subjects held for the given partition
    async fn subjects_in_partition(&self, partition: u32) -> Result<Vec<Subject>>;
}

/// In-memory implementation of AggregateStore
///
/// Suitable for development, testing, and single-instance deployments.
/// Data is lost when the process terminates.
pub struct InMemoryAggregateStore {
    aggregates: RwLock<HashMap<Subject, StoredAggregate>>,
    offsets: RwLock<HashMap<u32, u64>>,
}

impl InMemoryAggregateStore {
    pub fn new() -> Self {
        Self {
            aggregates: RwLock::new(HashMap::new()),
            offsets: RwLock::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.aggregates.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.aggregates.read().is_empty()
    }
}

impl Default for InMemoryAggregateStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AggregateStore for InMemoryAggregateStore {
    async fn get(&self, subject: &Subject) -> Result<Option<MaterialAggregate>> {
        Ok(self.aggregates.read().get(subject).map(|e| e.aggregate.clone()))
    }

    async fn put(&self, entry: StoredAggregate) -> Result<()> {
        self.aggregates.write().insert(entry.subject.clone(), entry);
        Ok(())
    }

    async fn commit_offset(&self, partition: u32, next_offset: u64) -> Result<()> {
        self.offsets.write().insert(partition, next_offset);
        Ok(())
    }

    async fn committed_offset(&self, partition: u32) -> Result<Option<u64>> {
        Ok(self.offsets.read().get(&partition).copied())
    }

    async fn subjects_in_partition(&self, partition: u32) -> Result<Vec<Subject>> {
        let mut subjects: Vec<_> = self
            .aggregates
            .read()
            .values()
            .filter(|e| e.partition == partition)
            .map(|e| e.subject.clone())
            .collect();
        subjects.sort();
        Ok(subjects)
    }
}
