//! Aggregation stage
//!
//! Folds the command history of every subject into a [`MaterialAggregate`].
//! One [`AggregationStage`] worker owns one commands partition, so a subject
//! is only ever reduced by a single writer and create-if-absent needs no lock.
//!
//! Per record the stage:
//! 1. reduces the command against the aggregate in the local table,
//! 2. stores the result if it changed,
//! 3. publishes a populated aggregate to the changelog topic (also for no-ops,
//!    so waiters on the subject are resolved),
//! 4. commits the next offset of the partition.
//!
//! A record that fails in steps 2-4 is retried from step 1. Step 1 then finds
//! the stored aggregate, so a registered key is never replaced by a second one.
//!
//! Material only ever enters an aggregate from a `Register` command. A `Create`
//! against an empty aggregate makes the stage generate material and append it
//! to the commands topic as a `Register`, so replaying the log always yields
//! the key that was handed out.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::command::Command;
use crate::crypto::MaterialGenerator;
use crate::error::Result;
use crate::log::{CommitLog, LogRecord};
use crate::material::{Material, MaterialAggregate, Subject};
use crate::storage::{AggregateStore, StoredAggregate};
use crate::worker::PartitionHandler;

/// What the reducer did with one command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOutcome {
    /// Registered material appended to an empty aggregate
    Appended,
    /// Aggregate already had material; command ignored
    AlreadyPresent,
    /// Create against an empty aggregate; material has to be registered first
    MaterialRequested,
    /// Forget is not implemented; aggregate unchanged
    ForgetNotImplemented,
    /// Unknown command tag; aggregate unchanged
    Unsupported,
    /// Registered material belongs to another subject; aggregate unchanged
    SubjectMismatch,
}

#[derive(Debug, Clone)]
pub struct Reduction {
    pub aggregate: MaterialAggregate,
    pub outcome: ReduceOutcome,
}

impl Reduction {
    fn unchanged(aggregate: MaterialAggregate, outcome: ReduceOutcome) -> Self {
        Self { aggregate, outcome }
    }

    pub fn changed(&self) -> bool {
        self.outcome == ReduceOutcome::Appended
    }
}

/// Apply one command to a subject's aggregate.
///
/// Pure and deterministic: the result depends only on the command and the
/// current aggregate. Every fault is logged and leaves the aggregate
/// unchanged, so one bad command cannot stop the other subjects of the
/// partition.
pub fn reduce(subject: &Subject, command: &Command, current: MaterialAggregate) -> Reduction {
    match command {
        Command::Create { .. } | Command::Register { .. } if !current.is_empty() => {
            tracing::info!(
                subject = %subject,
                command = command.kind(),
                "material already present, command ignored"
            );
            Reduction::unchanged(current, ReduceOutcome::AlreadyPresent)
        }
        Command::Create { .. } => {
            tracing::debug!(subject = %subject, "create on empty aggregate, material requested");
            Reduction::unchanged(current, ReduceOutcome::MaterialRequested)
        }
        Command::Register { material, .. } => {
            if &material.subject != subject {
                tracing::warn!(
                    subject = %subject,
                    material_subject = %material.subject,
                    "registered material belongs to another subject, ignored"
                );
                return Reduction::unchanged(current, ReduceOutcome::SubjectMismatch);
            }
            tracing::info!(subject = %subject, material_id = %material.id, "material registered");
            Reduction {
                aggregate: current.with_material(material.clone()),
                outcome: ReduceOutcome::Appended,
            }
        }
        Command::Forget { .. } => {
            tracing::error!(
                subject = %subject,
                "forget is not implemented, aggregate left unchanged"
            );
            Reduction::unchanged(current, ReduceOutcome::ForgetNotImplemented)
        }
        Command::Unknown => {
            tracing::warn!(subject = %subject, "unsupported command, ignored");
            Reduction::unchanged(current, ReduceOutcome::Unsupported)
        }
    }
}

/// Changelog record: the latest aggregate of a subject
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateUpdate {
    pub subject: Subject,
    pub aggregate: MaterialAggregate,
}

impl AggregateUpdate {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(payload)?)
    }
}

/// Reduces the commands of one partition into the local table and the changelog
pub struct AggregationStage {
    log: Arc<dyn CommitLog>,
    store: Arc<dyn AggregateStore>,
    generator: Arc<dyn MaterialGenerator>,
    commands_topic: String,
    changelog_topic: String,
    /// Subjects whose generated `Register` is in the log but not reduced yet
    requested: Mutex<HashSet<Subject>>,
}

impl AggregationStage {
    pub fn new(
        log: Arc<dyn CommitLog>,
        store: Arc<dyn AggregateStore>,
        generator: Arc<dyn MaterialGenerator>,
        commands_topic: impl Into<String>,
        changelog_topic: impl Into<String>,
    ) -> Self {
        Self {
            log,
            store,
            generator,
            commands_topic: commands_topic.into(),
            changelog_topic: changelog_topic.into(),
            requested: Mutex::new(HashSet::new()),
        }
    }

    /// Generate material for `subject` and append it as a `Register`. The
    /// subject key keeps it in this partition, after the triggering `Create`.
    async fn request_material(&self, subject: &Subject) -> Result<()> {
        let already_requested = self.requested.lock().contains(subject);
        if already_requested {
            tracing::debug!(subject = %subject, "material already requested");
            return Ok(());
        }

        let generated = match self.generator.generate(subject) {
            Ok(generated) => generated,
            Err(e) => {
                tracing::error!(subject = %subject, error = %e, "material generation failed");
                return Ok(());
            }
        };
        let material = Material::first(subject.clone(), generated);
        let material_id = material.id;
        let command = Command::Register {
            subject: subject.clone(),
            material,
        };
        self.log
            .append(&self.commands_topic, subject.as_str(), command.encode()?)
            .await?;

        self.requested.lock().insert(subject.clone());
        tracing::info!(subject = %subject, %material_id, "material generated for create");
        Ok(())
    }
}

#[async_trait]
impl PartitionHandler for AggregationStage {
    fn name(&self) -> &'static str {
        "aggregation"
    }

    async fn start_offset(&self, partition: u32) -> Result<u64> {
        Ok(self.store.committed_offset(partition).await?.unwrap_or(0))
    }

    async fn handle(&self, record: &LogRecord) -> Result<()> {
        let partition = record.partition;
        let next_offset = record.offset + 1;

        let subject = match Subject::new(record.key.clone()) {
            Ok(subject) => subject,
            Err(_) => {
                tracing::warn!(
                    partition,
                    offset = record.offset,
                    "command without subject key skipped"
                );
                return self.store.commit_offset(partition, next_offset).await;
            }
        };
        let command = match Command::decode(&record.payload) {
            Ok(command) => command,
            Err(e) => {
                tracing::warn!(
                    partition,
                    offset = record.offset,
                    subject = %subject,
                    error = %e,
                    "undecodable command skipped"
                );
                return self.store.commit_offset(partition, next_offset).await;
            }
        };

        let current = self.store.get(&subject).await?.unwrap_or_default();
        let reduction = reduce(&subject, &command, current);

        if reduction.outcome == ReduceOutcome::MaterialRequested {
            self.request_material(&subject).await?;
        }
        if reduction.changed() {
            self.store
                .put(StoredAggregate {
                    subject: subject.clone(),
                    aggregate: reduction.aggregate.clone(),
                    partition,
                    updated_at: Utc::now(),
                })
                .await?;
        }

        // An empty aggregate satisfies no waiter and must not shadow a
        // populated entry in the view.
        if !reduction.aggregate.is_empty() {
            self.requested.lock().remove(&subject);
            let update = AggregateUpdate {
                subject: subject.clone(),
                aggregate: reduction.aggregate,
            };
            self.log
                .append(&self.changelog_topic, subject.as_str(), update.encode()?)
                .await?;
        }

        self.store.commit_offset(partition, next_offset).await?;
        tracing::debug!(
            partition,
            offset = record.offset,
            subject = %subject,
            outcome = ?reduction.outcome,
            "command applied"
        );
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::crypto::GeneratedKey;
    use crate::crypto::SecureKey;
    use crate::error::KeyMaterialError;
    use crate::log::InMemoryCommitLog;
    use crate::storage::InMemoryAggregateStore;
    use crate::worker::PartitionWorker;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::{Duration, Instant};
    use tokio::sync::{oneshot, watch};
    use tokio::task::JoinHandle;

    /// Deterministic generator: key bytes are the call counter
    #[derive(Default)]
    pub(crate) struct CountingGenerator {
        pub(crate) calls: AtomicU32,
    }

    impl MaterialGenerator for CountingGenerator {
        fn generate(&self, _subject: &Subject) -> Result<GeneratedKey> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(GeneratedKey {
                algorithm: "TEST".into(),
                key: SecureKey::new(vec![n as u8; 32]),
            })
        }
    }

    struct FailingGenerator;

    impl MaterialGenerator for FailingGenerator {
        fn generate(&self, _subject: &Subject) -> Result<GeneratedKey> {
            Err(KeyMaterialError::Crypto("no entropy".into()))
        }
    }

    fn subject(id: &str) -> Subject {
        Subject::new(id).unwrap()
    }

    fn material(subject: &Subject, byte: u8) -> Material {
        Material::first(
            subject.clone(),
            GeneratedKey {
                algorithm: "TEST".into(),
                key: SecureKey::new(vec![byte; 32]),
            },
        )
    }

    fn register(s: &Subject, byte: u8) -> Command {
        Command::Register {
            subject: s.clone(),
            material: material(s, byte),
        }
    }

    fn spawn_stage(
        log: &Arc<InMemoryCommitLog>,
        store: &Arc<InMemoryAggregateStore>,
        generator: Arc<dyn MaterialGenerator>,
    ) -> (oneshot::Receiver<()>, watch::Sender<bool>, JoinHandle<()>) {
        let worker = PartitionWorker {
            log: log.clone(),
            topic: "commands".into(),
            partition: 0,
            batch_size: 2,
            retry_backoff: Duration::from_millis(10),
            handler: AggregationStage::new(
                log.clone(),
                store.clone(),
                generator,
                "commands",
                "changelog",
            ),
        };
        let (ready_tx, ready_rx) = oneshot::channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(worker.run(ready_tx, shutdown_rx));
        (ready_rx, shutdown_tx, handle)
    }

    async fn wait_for_offset(store: &InMemoryAggregateStore, next_offset: u64) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while store.committed_offset(0).await.unwrap() != Some(next_offset) {
            assert!(Instant::now() < deadline, "stage did not reach offset {}", next_offset);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[test]
    fn test_create_is_idempotent() {
        let s = subject("user-1");
        let create = Command::Create { subject: s.clone() };

        let requested = reduce(&s, &create, MaterialAggregate::empty());
        assert_eq!(requested.outcome, ReduceOutcome::MaterialRequested);
        assert!(requested.aggregate.is_empty());

        let populated = reduce(&s, &register(&s, 1), requested.aggregate).aggregate;
        let again = reduce(&s, &create, populated.clone());
        assert_eq!(again.outcome, ReduceOutcome::AlreadyPresent);
        assert_eq!(again.aggregate, populated);
    }

    #[test]
    fn test_exactly_one_material_after_many_commands() {
        let s = subject("user-2");
        let commands = vec![
            register(&s, 1),
            Command::Create { subject: s.clone() },
            register(&s, 2),
            Command::Forget { subject: s.clone() },
            Command::Unknown,
            Command::Create { subject: s.clone() },
        ];

        let aggregate = commands
            .iter()
            .fold(MaterialAggregate::empty(), |acc, command| reduce(&s, command, acc).aggregate);

        assert_eq!(aggregate.materials.len(), 1);
        assert_eq!(aggregate.latest().unwrap().key.as_bytes(), &[1u8; 32][..]);
    }

    #[test]
    fn test_replay_is_deterministic() {
        let s = subject("user-3");
        let history = vec![
            Command::Create { subject: s.clone() },
            register(&s, 5),
            Command::Create { subject: s.clone() },
            register(&s, 6),
        ];
        let replay = || {
            history
                .iter()
                .fold(MaterialAggregate::empty(), |acc, command| reduce(&s, command, acc).aggregate)
        };
        assert_eq!(replay(), replay());
        assert_eq!(replay().latest().unwrap().key.as_bytes(), &[5u8; 32][..]);
    }

    #[test]
    fn test_forget_and_unknown_leave_aggregate_unchanged() {
        let s = subject("user-4");
        let populated = MaterialAggregate::empty().with_material(material(&s, 1));

        let forget = reduce(&s, &Command::Forget { subject: s.clone() }, populated.clone());
        assert_eq!(forget.outcome, ReduceOutcome::ForgetNotImplemented);
        assert_eq!(forget.aggregate, populated);

        let unknown = reduce(&s, &Command::Unknown, populated.clone());
        assert_eq!(unknown.outcome, ReduceOutcome::Unsupported);
        assert_eq!(unknown.aggregate, populated);
    }

    #[test]
    fn test_foreign_material_is_ignored() {
        let s = subject("user-5");
        let other = subject("user-6");
        let mismatch = reduce(
            &s,
            &Command::Register { subject: s.clone(), material: material(&other, 1) },
            MaterialAggregate::empty(),
        );
        assert_eq!(mismatch.outcome, ReduceOutcome::SubjectMismatch);
        assert!(mismatch.aggregate.is_empty());
    }

    #[tokio::test]
    async fn test_stage_registers_material_for_create() {
        let log = Arc::new(InMemoryCommitLog::new(1));
        let store = Arc::new(InMemoryAggregateStore::new());
        let generator = Arc::new(CountingGenerator::default());
        let s = subject("user-42");

        let create = Command::Create { subject: s.clone() }.encode().unwrap();
        log.append("commands", "user-42", create.clone()).await.unwrap();
        log.append("commands", "user-42", b"garbage".to_vec()).await.unwrap();
        log.append("commands", "user-42", create).await.unwrap();
        log.append("commands", "user-42", br#"{"type":"rotate"}"#.to_vec()).await.unwrap();

        let (ready_rx, shutdown_tx, handle) = spawn_stage(&log, &store, generator.clone());
        tokio::time::timeout(Duration::from_secs(5), ready_rx).await.unwrap().unwrap();
        // The generated register lands after the four original commands.
        wait_for_offset(&store, 5).await;

        let stored = store.get(&s).await.unwrap().unwrap();
        assert_eq!(stored.materials.len(), 1);
        assert_eq!(stored.latest().unwrap().key.as_bytes(), &[1u8; 32][..]);
        assert_eq!(generator.calls.load(Ordering::SeqCst), 1);
        assert_eq!(log.record_count("commands"), 5);

        let registered = log.read("commands", 0, 4, 1).await.unwrap();
        match Command::decode(&registered[0].payload).unwrap() {
            Command::Register { material, .. } => assert_eq!(Some(&material), stored.latest()),
            other => panic!("expected register, got {:?}", other),
        }

        // Only the populated aggregate is published.
        let changelog = log.read("changelog", 0, 0, 10).await.unwrap();
        assert_eq!(changelog.len(), 1);
        assert_eq!(AggregateUpdate::decode(&changelog[0].payload).unwrap().aggregate, stored);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_replaying_create_into_fresh_table_keeps_key() {
        let log = Arc::new(InMemoryCommitLog::new(1));
        let generator = Arc::new(CountingGenerator::default());
        let s = subject("user-legacy");
        let create = Command::Create { subject: s.clone() }.encode().unwrap();
        log.append("commands", "user-legacy", create).await.unwrap();

        let first = Arc::new(InMemoryAggregateStore::new());
        let (_ready, shutdown_tx, handle) = spawn_stage(&log, &first, generator.clone());
        wait_for_offset(&first, 2).await;
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
        let issued = first.get(&s).await.unwrap().unwrap();

        // Rebuilding the table from the log generates again, but the register
        // already in the log wins.
        let rebuilt = Arc::new(InMemoryAggregateStore::new());
        let (_ready, shutdown_tx, handle) = spawn_stage(&log, &rebuilt, generator.clone());
        wait_for_offset(&rebuilt, 3).await;
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();

        let replayed = rebuilt.get(&s).await.unwrap().unwrap();
        assert_eq!(replayed, issued);
        assert_eq!(replayed.latest().unwrap().key.as_bytes(), &[1u8; 32][..]);
        assert_eq!(generator.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_generation_failure_is_contained() {
        let log = Arc::new(InMemoryCommitLog::new(1));
        let store = Arc::new(InMemoryAggregateStore::new());
        let s = subject("user-7");
        log.append("commands", "user-7", Command::Create { subject: s.clone() }.encode().unwrap())
            .await
            .unwrap();
        log.append("commands", "user-7", register(&s, 9).encode().unwrap()).await.unwrap();

        let (ready_rx, shutdown_tx, handle) = spawn_stage(&log, &store, Arc::new(FailingGenerator));
        tokio::time::timeout(Duration::from_secs(5), ready_rx).await.unwrap().unwrap();

        let stored = store.get(&s).await.unwrap().unwrap();
        assert_eq!(stored.latest().unwrap().key.as_bytes(), &[9u8; 32][..]);
        assert_eq!(log.record_count("commands"), 2);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
