//! Appends subject commands to the commands topic, keyed by subject

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::command::Command;
use crate::error::{KeyMaterialError, Result};
use crate::log::{CommitLog, RecordPosition};
use crate::material::{Material, Subject};

pub struct CommandPublisher {
    log: Arc<dyn CommitLog>,
    topic: String,
    open: AtomicBool,
}

impl CommandPublisher {
    pub fn new(log: Arc<dyn CommitLog>, topic: impl Into<String>) -> Self {
        Self {
            log,
            topic: topic.into(),
            open: AtomicBool::new(true),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub async fn create(&self, subject: &Subject) -> Result<RecordPosition> {
        self.publish(&Command::Create { subject: subject.clone() }).await
    }

    /// Publish caller-generated material for its subject
    pub async fn register(&self, material: Material) -> Result<RecordPosition> {
        let subject = material.subject.clone();
        self.publish(&Command::Register { subject, material }).await
    }

    pub async fn forget(&self, subject: &Subject) -> Result<RecordPosition> {
        self.publish(&Command::Forget { subject: subject.clone() }).await
    }

    /// Append one command. No retry happens here: a rejected append is
    /// reported to the caller as [`KeyMaterialError::PublishFailure`].
    pub async fn publish(&self, command: &Command) -> Result<RecordPosition> {
        if !self.is_open() {
            return Err(KeyMaterialError::ServiceStopped);
        }
        let subject = command
            .subject()
            .ok_or_else(|| KeyMaterialError::Validation("command carries no subject".into()))?;
        let payload = command.encode()?;

        let position = self
            .log
            .append(&self.topic, subject.as_str(), payload)
            .await
            .map_err(|e| KeyMaterialError::PublishFailure(e.to_string()))?;

        tracing::debug!(
            subject = %subject,
            command = command.kind(),
            topic = %self.topic,
            partition = position.partition,
            offset = position.offset,
            "command published"
        );
        Ok(position)
    }

    /// Stop accepting commands
    pub fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}
