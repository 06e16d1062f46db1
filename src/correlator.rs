//! Completion correlator
//!
//! Pairs callers waiting for a subject's material with the view update that
//! satisfies them. The facade registers a waiter before publishing; a single
//! resolver task drains [`ViewEvent`]s and completes the matching waiters.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::material::{MaterialAggregate, Subject};
use crate::view::ViewEvent;

pub type WaiterId = u64;

/// Handle of one registered waiter
#[derive(Debug)]
pub struct PendingCompletion {
    pub subject: Subject,
    pub id: WaiterId,
    pub receiver: oneshot::Receiver<MaterialAggregate>,
}

type Waiters = Vec<(WaiterId, oneshot::Sender<MaterialAggregate>)>;

#[derive(Default)]
pub struct CompletionCorrelator {
    next_id: AtomicU64,
    pending: Mutex<HashMap<Subject, Waiters>>,
}

impl CompletionCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter for `subject`. Several waiters per subject are allowed.
    pub fn register(&self, subject: &Subject) -> PendingCompletion {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().entry(subject.clone()).or_default().push((id, tx));
        PendingCompletion {
            subject: subject.clone(),
            id,
            receiver: rx,
        }
    }

    /// Complete every waiter of `subject` with `aggregate`.
    ///
    /// The entry is removed before completing, so later updates for the same
    /// subject do not complete anything. A subject nobody waits for is a no-op.
    /// Returns the number of waiters completed.
    pub fn resolve(&self, subject: &Subject, aggregate: &MaterialAggregate) -> usize {
        let removed = self.pending.lock().remove(subject);
        let Some(waiters) = removed else {
            return 0;
        };

        let mut completed = 0;
        for (_, tx) in waiters {
            // A waiter that already gave up dropped its receiver.
            if tx.send(aggregate.clone()).is_ok() {
                completed += 1;
            }
        }
        tracing::debug!(subject = %subject, completed, "pending requests resolved");
        completed
    }

    /// Remove one waiter (e.g. after its timeout). Returns whether it was still pending.
    pub fn cancel(&self, subject: &Subject, id: WaiterId) -> bool {
        let mut pending = self.pending.lock();
        let Some(waiters) = pending.get_mut(subject) else {
            return false;
        };
        let before = waiters.len();
        waiters.retain(|(waiter, _)| *waiter != id);
        let removed = waiters.len() != before;
        if waiters.is_empty() {
            pending.remove(subject);
        }
        removed
    }

    /// Drop every waiter; their callers observe a closed channel.
    pub fn abandon_all(&self) -> usize {
        let drained: Vec<_> = self.pending.lock().drain().collect();
        drained.iter().map(|(_, waiters)| waiters.len()).sum()
    }

    /// Number of waiting callers
    pub fn pending_count(&self) -> usize {
        self.pending.lock().values().map(Vec::len).sum()
    }

    pub fn is_pending(&self, subject: &Subject) -> bool {
        self.pending.lock().contains_key(subject)
    }
}

/// Spawn the task that resolves waiters from view events. It ends once every
/// event sender is gone.
pub fn spawn_resolver(
    correlator: Arc<CompletionCorrelator>,
    mut events: mpsc::UnboundedReceiver<ViewEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                // An empty aggregate satisfies nobody; keep waiting.
                ViewEvent::Updated { subject, aggregate } if !aggregate.is_empty() => {
                    correlator.resolve(&subject, &aggregate);
                }
                ViewEvent::Updated { .. } => {}
            }
        }
        tracing::debug!("completion resolver stopped");
    })
}
