//! Key material facade
//!
//! `get_or_create` returns the subject's key from the replicated view when it
//! exists. Otherwise it pre-generates material, registers a waiter, publishes
//! a `Register` command and waits (bounded) until the view observes the
//! subject's aggregate. Concurrent first calls for one subject may each
//! publish; the reducer keeps the first material and every waiter receives it.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::aggregation::AggregationStage;
use crate::config::KeyStoreConfig;
use crate::correlator::{spawn_resolver, CompletionCorrelator, PendingCompletion};
use crate::crypto::{
    Aes256GcmGenerator, AesGcmCipher, EncryptedData, MaterialGenerator, AES_256_GCM,
};
use crate::error::{KeyMaterialError, Result};
use crate::log::{CommitLog, InMemoryCommitLog};
use crate::material::{Material, MaterialAggregate, Subject};
use crate::publisher::CommandPublisher;
use crate::storage::{AggregateStore, InMemoryAggregateStore};
use crate::view::{ChangelogConsumer, ReplicatedView};
use crate::worker::PartitionWorker;

/// Result of a forget request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForgetOutcome {
    /// Tombstoning is not designed yet; nothing was written
    NotImplemented,
}

struct Workers {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    resolver: JoinHandle<()>,
}

impl Workers {
    async fn stop(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "partition worker ended abnormally");
            }
        }
        // Ends once the changelog consumers dropped their event senders.
        if let Err(e) = self.resolver.await {
            tracing::warn!(error = %e, "completion resolver ended abnormally");
        }
    }
}

pub struct KeyMaterialService {
    config: KeyStoreConfig,
    publisher: CommandPublisher,
    view: Arc<ReplicatedView>,
    correlator: Arc<CompletionCorrelator>,
    store: Arc<dyn AggregateStore>,
    generator: Arc<dyn MaterialGenerator>,
    owned_partitions: Vec<u32>,
    workers: Mutex<Option<Workers>>,
}

impl KeyMaterialService {
    /// Start with an in-memory log and table sized from `config`
    pub async fn start_in_memory(config: KeyStoreConfig) -> Result<Self> {
        let log = Arc::new(InMemoryCommitLog::new(config.partitions));
        let store = Arc::new(InMemoryAggregateStore::new());
        Self::start(config, log, store, Arc::new(Aes256GcmGenerator)).await
    }

    /// Spawn the changelog consumers, the aggregation workers of the owned
    /// partitions and the resolver, then wait until all of them caught up
    /// with the log. Not reaching that state within the startup timeout is
    /// a [`KeyMaterialError::StartupFailure`].
    pub async fn start(
        config: KeyStoreConfig,
        log: Arc<dyn CommitLog>,
        store: Arc<dyn AggregateStore>,
        generator: Arc<dyn MaterialGenerator>,
    ) -> Result<Self> {
        config.validate()?;

        let changelog_topic = config.changelog_topic();
        let owned_partitions = config.assigned_partitions(log.partitions(&config.commands_topic));
        let view = Arc::new(ReplicatedView::new());
        let correlator = Arc::new(CompletionCorrelator::new());

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let resolver = spawn_resolver(correlator.clone(), events_rx);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::new();
        let mut readiness = Vec::new();

        for partition in 0..log.partitions(&changelog_topic) {
            let worker = PartitionWorker {
                log: log.clone(),
                topic: changelog_topic.clone(),
                partition,
                batch_size: config.poll_batch_size,
                retry_backoff: config.retry_backoff(),
                handler: ChangelogConsumer {
                    view: view.clone(),
                    events: events_tx.clone(),
                },
            };
            let (ready_tx, ready_rx) = oneshot::channel();
            readiness.push(ready_rx);
            tasks.push(tokio::spawn(worker.run(ready_tx, shutdown_rx.clone())));
        }
        drop(events_tx);

        for &partition in &owned_partitions {
            let worker = PartitionWorker {
                log: log.clone(),
                topic: config.commands_topic.clone(),
                partition,
                batch_size: config.poll_batch_size,
                retry_backoff: config.retry_backoff(),
                handler: AggregationStage::new(
                    log.clone(),
                    store.clone(),
                    generator.clone(),
                    config.commands_topic.clone(),
                    changelog_topic.clone(),
                ),
            };
            let (ready_tx, ready_rx) = oneshot::channel();
            readiness.push(ready_rx);
            tasks.push(tokio::spawn(worker.run(ready_tx, shutdown_rx.clone())));
        }

        let workers = Workers {
            shutdown: shutdown_tx,
            tasks,
            resolver,
        };

        let all_ready = async move {
            for ready in readiness {
                ready.await.map_err(|_| "a worker stopped before catching up".to_string())?;
            }
            Ok::<(), String>(())
        };
        let startup_timeout = config.startup_timeout();
        let failure = match tokio::time::timeout(startup_timeout, all_ready).await {
            Ok(Ok(())) => None,
            Ok(Err(reason)) => Some(reason),
            Err(_) => Some(format!("processing not ready within {:?}", startup_timeout)),
        };
        if let Some(reason) = failure {
            tracing::error!(reason = %reason, "key material service failed to start");
            workers.stop().await;
            return Err(KeyMaterialError::StartupFailure(reason));
        }

        tracing::info!(
            application_id = %config.application_id,
            commands_topic = %config.commands_topic,
            owned_partitions = ?owned_partitions,
            subjects = view.len(),
            "key material service ready"
        );

        Ok(Self {
            publisher: CommandPublisher::new(log, config.commands_topic.clone()),
            config,
            view,
            correlator,
            store,
            generator,
            owned_partitions,
            workers: Mutex::new(Some(workers)),
        })
    }

    /// Return the subject's key material, creating it if the subject has none.
    ///
    /// Waits at most the configured request timeout for the created material
    /// to reach the view.
    pub async fn get_or_create(&self, subject_id: &str) -> Result<Material> {
        let subject = Subject::new(subject_id)?;
        self.ensure_running()?;

        if let Some(material) = self.current_material(&subject) {
            return Ok(material);
        }

        let pending = self.correlator.register(&subject);
        // The view may have been updated between the lookup and registering.
        if let Some(material) = self.current_material(&subject) {
            self.correlator.cancel(&subject, pending.id);
            return Ok(material);
        }

        let material = match self.generator.generate(&subject) {
            Ok(generated) => Material::first(subject.clone(), generated),
            Err(e) => {
                self.correlator.cancel(&subject, pending.id);
                tracing::error!(subject = %subject, error = %e, "material generation failed");
                // Nothing could be published for the subject.
                return Err(KeyMaterialError::PublishFailure(format!(
                    "material generation failed: {}",
                    e
                )));
            }
        };
        if let Err(e) = self.publisher.register(material).await {
            self.correlator.cancel(&subject, pending.id);
            tracing::warn!(subject = %subject, error = %e, "publishing register command failed");
            return Err(e);
        }

        self.await_completion(pending).await
    }

    /// View-only read; never writes to the log
    pub fn lookup_existing(&self, subject_id: &str) -> Result<Option<MaterialAggregate>> {
        let subject = Subject::new(subject_id)?;
        Ok(self.view.get(&subject).filter(|aggregate| !aggregate.is_empty()))
    }

    /// Forgetting a subject is not supported yet. The request is rejected
    /// with an explicit outcome and nothing is written to the log.
    pub fn forget(&self, subject_id: &str) -> Result<ForgetOutcome> {
        let subject = Subject::new(subject_id)?;
        self.ensure_running()?;
        tracing::warn!(subject = %subject, "forget requested but not implemented");
        Ok(ForgetOutcome::NotImplemented)
    }

    /// Encrypt a field value with the subject's key (created if absent).
    /// Returns `base64(nonce || ciphertext)`; the subject is the associated data.
    pub async fn encrypt_for(&self, subject_id: &str, plaintext: &[u8]) -> Result<String> {
        let material = self.get_or_create(subject_id).await?;
        Self::check_algorithm(&material)?;
        let aad = material.subject.as_str().as_bytes();
        let encrypted = AesGcmCipher::encrypt(&material.key, plaintext, Some(aad))?;
        Ok(encrypted.to_base64())
    }

    /// Decrypt a value produced by [`encrypt_for`](Self::encrypt_for). Never creates a key.
    pub fn decrypt_for(&self, subject_id: &str, encoded: &str) -> Result<Vec<u8>> {
        let subject = Subject::new(subject_id)?;
        let material = self
            .current_material(&subject)
            .ok_or_else(|| KeyMaterialError::MaterialNotFound(subject.to_string()))?;
        Self::check_algorithm(&material)?;
        let encrypted = EncryptedData::from_base64(encoded)?;
        AesGcmCipher::decrypt(&material.key, &encrypted, Some(subject.as_str().as_bytes()))
    }

    /// Stop accepting requests, stop the workers, then fail outstanding waiters.
    pub async fn shutdown(&self) {
        self.publisher.close();
        let workers = self.workers.lock().take();
        if let Some(workers) = workers {
            workers.stop().await;
        }
        let abandoned = self.correlator.abandon_all();
        tracing::info!(abandoned, "key material service stopped");
    }

    pub fn config(&self) -> &KeyStoreConfig {
        &self.config
    }

    pub fn owned_partitions(&self) -> &[u32] {
        &self.owned_partitions
    }

    /// Number of subjects in the replicated view
    pub fn view_len(&self) -> usize {
        self.view.len()
    }

    /// Number of callers waiting for material
    pub fn pending_requests(&self) -> usize {
        self.correlator.pending_count()
    }

    /// Subjects materialized in this node's local table
    pub async fn local_subjects(&self) -> Result<Vec<Subject>> {
        let mut subjects = Vec::new();
        for &partition in &self.owned_partitions {
            subjects.extend(self.store.subjects_in_partition(partition).await?);
        }
        Ok(subjects)
    }

    fn ensure_running(&self) -> Result<()> {
        if self.publisher.is_open() {
            Ok(())
        } else {
            Err(KeyMaterialError::ServiceStopped)
        }
    }

    fn current_material(&self, subject: &Subject) -> Option<Material> {
        self.view.get(subject).and_then(|aggregate| aggregate.latest().cloned())
    }

    async fn await_completion(&self, pending: PendingCompletion) -> Result<Material> {
        let timeout = self.config.request_timeout();
        let PendingCompletion { subject, id, receiver } = pending;

        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(aggregate)) => aggregate
                .latest()
                .cloned()
                .ok_or_else(|| KeyMaterialError::MaterialNotFound(subject.to_string())),
            Ok(Err(_)) => {
                tracing::warn!(subject = %subject, "pending request abandoned");
                Err(KeyMaterialError::AwaitTimeout {
                    subject: subject.to_string(),
                    timeout,
                })
            }
            Err(_) => {
                self.correlator.cancel(&subject, id);
                tracing::warn!(subject = %subject, ?timeout, "timed out waiting for key material");
                Err(KeyMaterialError::AwaitTimeout {
                    subject: subject.to_string(),
                    timeout,
                })
            }
        }
    }

    fn check_algorithm(material: &Material) -> Result<()> {
        if material.algorithm == AES_256_GCM {
            Ok(())
        } else {
            Err(KeyMaterialError::Crypto(format!(
                "unsupported algorithm {} for subject {}",
                material.algorithm, material.subject
            )))
        }
    }
}

impl Drop for KeyMaterialService {
    fn drop(&mut self) {
        if let Some(workers) = self.workers.get_mut().take() {
            let _ = workers.shutdown.send(true);
        }
    }
}
