//! Attestation session seam.
//!
//! A session submits a proof bundle and hands back two channels: a live stream
//! of lifecycle events and a deferred result that resolves once the
//! attestation carrying the proof has been published.

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::debug;

use zkrelay_common::{AttestedProof, Hash32, ProofBundle, RelayError};

/// Capacity of the per-submission event channel.
pub const EVENT_BUFFER: usize = 32;

/// Lifecycle event emitted by the attestation network for one submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The submission was included in a (non-final) block.
    IncludedInBlock { tx_hash: Hash32 },
    /// The block containing the submission was finalized.
    Finalized { block_hash: Hash32 },
    /// Transport or transaction error. Not fatal on its own.
    Error { message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    IncludedInBlock,
    Finalized,
    Error,
}

impl SessionEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            SessionEvent::IncludedInBlock { .. } => EventKind::IncludedInBlock,
            SessionEvent::Finalized { .. } => EventKind::Finalized,
            SessionEvent::Error { .. } => EventKind::Error,
        }
    }
}

/// Deferred result of a submission: the attested pair or the rejection cause.
pub type SubmissionResult = Result<AttestedProof, String>;

/// Handle to one in-flight submission.
///
/// Dropping it stops the task following the submission.
pub struct Submission {
    pub events: mpsc::Receiver<SessionEvent>,
    pub result: oneshot::Receiver<SubmissionResult>,
    task: Option<JoinHandle<()>>,
}

impl Submission {
    /// Create the producer and consumer halves of a submission.
    pub fn channel() -> (SubmissionSender, Submission) {
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let (result_tx, result_rx) = oneshot::channel();

        (
            SubmissionSender {
                events: events_tx,
                result: Some(result_tx),
            },
            Submission {
                events: events_rx,
                result: result_rx,
                task: None,
            },
        )
    }

    /// Attach the task that drives this submission.
    pub fn with_task(mut self, task: JoinHandle<()>) -> Self {
        self.task = Some(task);
        self
    }
}

impl Drop for Submission {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Producer half used by session implementations.
pub struct SubmissionSender {
    events: mpsc::Sender<SessionEvent>,
    result: Option<oneshot::Sender<SubmissionResult>>,
}

impl SubmissionSender {
    /// Emit a lifecycle event. Events sent after the consumer is gone are dropped.
    pub async fn emit(&self, event: SessionEvent) {
        if self.events.send(event).await.is_err() {
            debug!("submission consumer gone, dropping event");
        }
    }

    /// Resolve the deferred result. Later calls are ignored.
    pub fn resolve(&mut self, attested: AttestedProof) {
        if let Some(tx) = self.result.take() {
            let _ = tx.send(Ok(attested));
        }
    }

    /// Reject the deferred result. Later calls are ignored.
    pub fn reject(&mut self, cause: impl Into<String>) {
        if let Some(tx) = self.result.take() {
            let _ = tx.send(Err(cause.into()));
        }
    }

    pub fn is_settled(&self) -> bool {
        self.result.is_none()
    }
}

/// Authenticated session against the attestation network.
#[async_trait]
pub trait AttestationSession: Send + Sync {
    /// Submit a proof bundle for verification and attestation.
    ///
    /// An error here means the submission could not even be started; a
    /// rejected deferred result means the network refused it. Neither closes
    /// the session.
    async fn submit(&self, bundle: ProofBundle) -> Result<Submission, RelayError>;

    /// Tear down the session and any submission it is still following.
    async fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;
    use zkrelay_common::AttestationId;

    #[tokio::test]
    async fn test_result_settles_once() {
        let (mut sender, mut submission) = Submission::channel();

        sender.reject("first");
        sender.resolve(AttestedProof {
            attestation_id: AttestationId(1),
            leaf_digest: Hash32::ZERO,
        });
        assert!(sender.is_settled());

        let result = (&mut submission.result).await.unwrap();
        assert_eq!(result, Err("first".to_string()));
    }

    #[tokio::test]
    async fn test_events_are_delivered_in_order() {
        let (sender, mut submission) = Submission::channel();

        sender
            .emit(SessionEvent::IncludedInBlock { tx_hash: Hash32([1u8; 32]) })
            .await;
        sender
            .emit(SessionEvent::Finalized { block_hash: Hash32([2u8; 32]) })
            .await;
        drop(sender);

        assert_eq!(
            submission.events.recv().await.map(|e| e.kind()),
            Some(EventKind::IncludedInBlock)
        );
        assert_eq!(
            submission.events.recv().await.map(|e| e.kind()),
            Some(EventKind::Finalized)
        );
        assert_eq!(submission.events.recv().await, None);
    }

    #[tokio::test]
    async fn test_dropping_submission_aborts_task() {
        let (_sender, submission) = Submission::channel();
        let (alive_tx, alive_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let _alive = alive_tx;
            std::future::pending::<()>().await;
        });

        drop(submission.with_task(task));
        assert!(alive_rx.await.is_err(), "task should have been aborted");
    }
}
