//! Per-submission event dispatcher.
//!
//! Folds session events into the submission's `AttestationHandle`. Status only
//! moves forward: duplicates and late events are no-ops, and error events are
//! recorded without changing status.

use std::collections::HashSet;

use tracing::{debug, info, warn};

use zkrelay_common::{AttestationHandle, AttestationStatus, AttestedProof};

use crate::session::{EventKind, SessionEvent};

/// Effect of applying one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Status moved forward to the contained value.
    Advanced(AttestationStatus),
    /// An event of this kind was already applied.
    Duplicate(EventKind),
    /// The event would move status backwards (or out of a terminal state).
    Stale {
        event: EventKind,
        current: AttestationStatus,
    },
    /// An error event was logged.
    Recorded,
}

/// Status machine for one submission.
#[derive(Debug, Default)]
pub struct EventDispatcher {
    handle: AttestationHandle,
    seen: HashSet<EventKind>,
    errors: Vec<String>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&self) -> &AttestationHandle {
        &self.handle
    }

    pub fn status(&self) -> AttestationStatus {
        self.handle.status()
    }

    /// Distinct error messages reported for this submission.
    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    /// Apply a session event.
    pub fn apply(&mut self, event: &SessionEvent) -> Transition {
        let target = match event {
            SessionEvent::IncludedInBlock { .. } => AttestationStatus::IncludedInBlock,
            SessionEvent::Finalized { .. } => AttestationStatus::Finalized,
            SessionEvent::Error { message } => return self.record_error(message),
        };

        let kind = event.kind();
        if !self.seen.insert(kind) {
            debug!(event = ?kind, "duplicate session event ignored");
            return Transition::Duplicate(kind);
        }

        if !self.handle.advance(target) {
            debug!(
                event = ?kind,
                current = %self.handle.status(),
                "stale session event ignored"
            );
            return Transition::Stale {
                event: kind,
                current: self.handle.status(),
            };
        }

        match event {
            SessionEvent::IncludedInBlock { tx_hash } => {
                info!(tx_hash = %tx_hash, "Transaction accepted in zkVerify");
            }
            SessionEvent::Finalized { block_hash } => {
                info!(block_hash = %block_hash, "Transaction finalized in zkVerify");
            }
            SessionEvent::Error { .. } => {}
        }

        Transition::Advanced(target)
    }

    fn record_error(&mut self, message: &str) -> Transition {
        if self.errors.iter().any(|m| m == message) {
            debug!(error = %message, "duplicate session error ignored");
            return Transition::Duplicate(EventKind::Error);
        }

        warn!(
            error = %message,
            status = %self.handle.status(),
            "An error occurred during the transaction"
        );
        self.errors.push(message.to_string());
        Transition::Recorded
    }

    /// Record the resolved attestation id and leaf digest.
    pub fn resolve(&mut self, attested: AttestedProof) {
        info!(
            attestation_id = %attested.attestation_id,
            leaf_digest = %attested.leaf_digest,
            "Attestation published on zkVerify"
        );
        self.handle.resolve(attested);
    }

    /// Move to the terminal failure state after the deferred result rejected.
    pub fn mark_failed(&mut self) {
        self.handle.advance(AttestationStatus::SubmissionFailed);
    }

    /// Finalization observed and the attestation pair is known.
    pub fn is_ready(&self) -> bool {
        self.handle.status() == AttestationStatus::Finalized && self.handle.is_resolved()
    }
}
