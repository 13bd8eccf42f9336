//! Error types for the attestation relay.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::types::{AttestationId, Hash32};

/// Stage of the relay a failure belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Stage {
    Session,
    Submission,
    Finalization,
    Retrieval,
    AttestationRoot,
    Broadcast,
    Confirmation,
    Acknowledgment,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Session => "session",
            Stage::Submission => "submission",
            Stage::Finalization => "finalization",
            Stage::Retrieval => "retrieval",
            Stage::AttestationRoot => "attestation-root",
            Stage::Broadcast => "broadcast",
            Stage::Confirmation => "confirmation",
            Stage::Acknowledgment => "acknowledgment",
        };
        f.write_str(s)
    }
}

/// Coarse classification used when reporting a failed relay.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    Session,
    Submission,
    Retrieval,
    Relay,
    Timeout,
    Duplicate,
}

fn id_suffix(id: &Option<AttestationId>) -> String {
    id.map(|id| format!(" (attestation {})", id)).unwrap_or_default()
}

/// Error type for the relay. Every variant is fatal for the current attempt.
#[derive(Error, Debug)]
pub enum RelayError {
    /// The attestation-network session could not be established.
    #[error("session error: {0}")]
    Session(String),

    /// The proof was rejected or never produced a complete attestation.
    #[error("submission failed{}: {cause}", id_suffix(.attestation_id))]
    Submission {
        attestation_id: Option<AttestationId>,
        cause: String,
    },

    /// The inclusion proof could not be retrieved.
    #[error("inclusion proof retrieval failed for attestation {attestation_id} after {attempts} attempt(s): {cause}")]
    Retrieval {
        attestation_id: AttestationId,
        attempts: u32,
        cause: String,
    },

    /// The destination chain rejected the relay transaction.
    #[error("relay failed for attestation {attestation_id}: {reason}")]
    Relay {
        attestation_id: AttestationId,
        tx_hash: Option<Hash32>,
        reason: String,
    },

    /// A stage's terminal event did not arrive in time. Needs an operator.
    #[error("timed out after {waited:?} waiting for {stage}{}", id_suffix(.attestation_id))]
    Timeout {
        stage: Stage,
        attestation_id: Option<AttestationId>,
        tx_hash: Option<Hash32>,
        waited: Duration,
    },

    /// A relay for this attestation is already running or already sent.
    #[error("attestation {attestation_id} is already being relayed or was relayed")]
    Duplicate { attestation_id: AttestationId },
}

impl RelayError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RelayError::Session(_) => ErrorKind::Session,
            RelayError::Submission { .. } => ErrorKind::Submission,
            RelayError::Retrieval { .. } => ErrorKind::Retrieval,
            RelayError::Relay { .. } => ErrorKind::Relay,
            RelayError::Timeout { .. } => ErrorKind::Timeout,
            RelayError::Duplicate { .. } => ErrorKind::Duplicate,
        }
    }

    pub fn stage(&self) -> Stage {
        match self {
            RelayError::Session(_) => Stage::Session,
            RelayError::Submission { .. } => Stage::Submission,
            RelayError::Retrieval { .. } => Stage::Retrieval,
            RelayError::Relay { .. } | RelayError::Duplicate { .. } => Stage::Broadcast,
            RelayError::Timeout { stage, .. } => *stage,
        }
    }

    pub fn attestation_id(&self) -> Option<AttestationId> {
        match self {
            RelayError::Session(_) => None,
            RelayError::Submission { attestation_id, .. } => *attestation_id,
            RelayError::Timeout { attestation_id, .. } => *attestation_id,
            RelayError::Retrieval { attestation_id, .. }
            | RelayError::Relay { attestation_id, .. }
            | RelayError::Duplicate { attestation_id } => Some(*attestation_id),
        }
    }

    /// Relay transaction hash, when the failure happened after broadcast.
    pub fn tx_hash(&self) -> Option<Hash32> {
        match self {
            RelayError::Relay { tx_hash, .. } | RelayError::Timeout { tx_hash, .. } => *tx_hash,
            _ => None,
        }
    }

    pub fn timeout(stage: Stage, attestation_id: Option<AttestationId>, waited: Duration) -> Self {
        RelayError::Timeout {
            stage,
            attestation_id,
            tx_hash: None,
            waited,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_context_in_messages() {
        let err = RelayError::Submission {
            attestation_id: None,
            cause: "bad proof".into(),
        };
        assert_eq!(err.to_string(), "submission failed: bad proof");

        let err = RelayError::timeout(
            Stage::AttestationRoot,
            Some(AttestationId(7)),
            Duration::from_secs(5),
        );
        assert_eq!(
            err.to_string(),
            "timed out after 5s waiting for attestation-root (attestation 7)"
        );
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(err.stage(), Stage::AttestationRoot);
        assert_eq!(err.attestation_id(), Some(AttestationId(7)));
    }

    #[test]
    fn test_relay_error_carries_tx_hash() {
        let err = RelayError::Relay {
            attestation_id: AttestationId(1),
            tx_hash: Some(Hash32([2u8; 32])),
            reason: "execution reverted: invalid proof".into(),
        };
        assert_eq!(err.kind(), ErrorKind::Relay);
        assert_eq!(err.tx_hash(), Some(Hash32([2u8; 32])));
        assert!(err.to_string().contains("invalid proof"));
    }
}
