//! Replicated view of every subject's aggregate
//!
//! Every node consumes all partitions of the changelog topic, whichever node
//! owns the subject's commands partition, and applies updates last-write-wins.
//! Applied updates are forwarded as [`ViewEvent`]s to the correlator.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::aggregation::AggregateUpdate;
use crate::error::Result;
use crate::log::LogRecord;
use crate::material::{MaterialAggregate, Subject};
use crate::worker::PartitionHandler;

/// Emitted for each aggregate update applied to the view
#[derive(Debug, Clone)]
pub enum ViewEvent {
    Updated {
        subject: Subject,
        aggregate: MaterialAggregate,
    },
}

#[derive(Debug, Default)]
pub struct ReplicatedView {
    entries: RwLock<HashMap<Subject, MaterialAggregate>>,
}

impl ReplicatedView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, subject: &Subject) -> Option<MaterialAggregate> {
        self.entries.read().get(subject).cloned()
    }

    /// Last write wins. The reducer never empties a populated aggregate,
    /// so replays and duplicates converge to the same entry.
    pub fn apply(&self, subject: Subject, aggregate: MaterialAggregate) {
        self.entries.write().insert(subject, aggregate);
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn subjects(&self) -> Vec<Subject> {
        let mut subjects: Vec<_> = self.entries.read().keys().cloned().collect();
        subjects.sort();
        subjects
    }
}

/// Applies one changelog partition to the view
pub struct ChangelogConsumer {
    pub view: Arc<ReplicatedView>,
    pub events: mpsc::UnboundedSender<ViewEvent>,
}

#[async_trait]
impl PartitionHandler for ChangelogConsumer {
    fn name(&self) -> &'static str {
        "changelog"
    }

    // The view lives in memory only, so it is rebuilt from the start.
    async fn start_offset(&self, _partition: u32) -> Result<u64> {
        Ok(0)
    }

    async fn handle(&self, record: &LogRecord) -> Result<()> {
        let update = match AggregateUpdate::decode(&record.payload) {
            Ok(update) => update,
            Err(e) => {
                tracing::warn!(
                    partition = record.partition,
                    offset = record.offset,
                    key = %record.key,
                    error = %e,
                    "undecodable changelog record skipped"
                );
                return Ok(());
            }
        };

        self.view.apply(update.subject.clone(), update.aggregate.clone());
        tracing::trace!(
            subject = %update.subject,
            materials = update.aggregate.materials.len(),
            "view updated"
        );

        // The resolver is gone only during shutdown.
        let _ = self.events.send(ViewEvent::Updated {
            subject: update.subject,
            aggregate: update.aggregate,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{GeneratedKey, SecureKey};
    use crate::log::{CommitLog, InMemoryCommitLog};
    use crate::material::Material;
    use crate::worker::PartitionWorker;
    use std::time::Duration;
    use tokio::sync::{oneshot, watch};

    fn populated(subject: &Subject) -> MaterialAggregate {
        MaterialAggregate::empty().with_material(Material::first(
            subject.clone(),
            GeneratedKey {
                algorithm: "TEST".into(),
                key: SecureKey::new(vec![3; 32]),
            },
        ))
    }

    #[test]
    fn test_apply_last_write_wins() {
        let view = ReplicatedView::new();
        let subject = Subject::new("user-1").unwrap();
        assert!(view.get(&subject).is_none());

        view.apply(subject.clone(), MaterialAggregate::empty());
        view.apply(subject.clone(), populated(&subject));
        view.apply(subject.clone(), populated(&subject));

        assert_eq!(view.len(), 1);
        assert_eq!(view.get(&subject).unwrap().materials.len(), 1);
        assert_eq!(view.subjects(), vec![subject]);
    }

    #[tokio::test]
    async fn test_consumer_applies_and_emits() {
        let log = Arc::new(InMemoryCommitLog::new(2));
        let view = Arc::new(ReplicatedView::new());
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let subject = Subject::new("user-9").unwrap();

        let update = AggregateUpdate {
            subject: subject.clone(),
            aggregate: populated(&subject),
        };
        let position = log.append("changelog", "user-9", b"{broken".to_vec()).await.unwrap();
        log.append("changelog", "user-9", update.encode().unwrap()).await.unwrap();

        let worker = PartitionWorker {
            log: log.clone(),
            topic: "changelog".into(),
            partition: position.partition,
            batch_size: 16,
            retry_backoff: Duration::from_millis(10),
            handler: ChangelogConsumer {
                view: view.clone(),
                events: events_tx,
            },
        };
        let (ready_tx, ready_rx) = oneshot::channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(worker.run(ready_tx, shutdown_rx));
        tokio::time::timeout(Duration::from_secs(5), ready_rx).await.unwrap().unwrap();

        assert_eq!(view.get(&subject), Some(update.aggregate.clone()));
        match events_rx.recv().await.unwrap() {
            ViewEvent::Updated { subject: s, aggregate } => {
                assert_eq!(s, subject);
                assert_eq!(aggregate, update.aggregate);
            }
        }

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
