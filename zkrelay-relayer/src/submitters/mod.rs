//! Destination chains for proof relay.

mod evm;

pub use evm::EvmDestination;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use zkrelay_common::{AttestationId, Hash32, ProofRelayCall};

use crate::watcher::{AckMatcher, EventListener};

/// Node answers to a resend of a transaction it already holds, or whose nonce
/// is already taken.
const ALREADY_SUBMITTED: &[&str] = &[
    "already known",
    "known transaction",
    "already imported",
    "nonce too low",
    "replacement transaction underpriced",
];

/// Failure talking to a destination chain.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChainError {
    /// Transport failure. The request may or may not have reached the node.
    #[error("network error: {0}")]
    Network(String),

    /// The node or the contract refused the request.
    #[error("rejected: {0}")]
    Rejected(String),

    #[error("subscription error: {0}")]
    Subscription(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl ChainError {
    pub fn is_network(&self) -> bool {
        matches!(self, ChainError::Network(_))
    }

    /// Whether the node refused a send because the transaction, or another
    /// one at the same nonce, is already in its pool or chain.
    pub fn is_already_submitted(&self) -> bool {
        match self {
            ChainError::Rejected(reason) => {
                let reason = reason.to_lowercase();
                ALREADY_SUBMITTED.iter().any(|known| reason.contains(known))
            }
            _ => false,
        }
    }
}

/// Relay call signed at a fixed nonce. Its hash is known before the first
/// send, and resending the same bytes cannot create a second transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedRelay {
    pub tx_hash: Hash32,
    pub nonce: u64,
    pub raw: Vec<u8>,
}

/// How a mined relay transaction ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Confirmation {
    Mined,
    /// Reverted, with the chain's reason when it could be recovered.
    Reverted(String),
}

/// `AttestationPosted(attestationId, root)` from the zkVerify contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AttestationPosted {
    pub attestation_id: AttestationId,
    pub root: Hash32,
}

/// `SuccessfulProofSubmission(winner)` from the application contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProofAcknowledged {
    /// Topic of the indexed `winner` string (its keccak hash).
    pub winner_topic: Hash32,
    /// Transaction that emitted the event, when the node reports it.
    pub tx_hash: Option<Hash32>,
}

/// Trait for destination chains.
#[async_trait]
pub trait DestinationChain: Send + Sync {
    /// Get the chain name.
    fn chain_name(&self) -> &str;

    /// Account that signs relay calls, as the application contract names it.
    fn caller(&self) -> String;

    /// Subscribe to `AttestationPosted` for one attestation id.
    async fn subscribe_attestation_posted(
        &self,
        attestation_id: AttestationId,
    ) -> Result<EventListener<AttestationPosted>, ChainError>;

    /// Subscribe to `SuccessfulProofSubmission` for this chain's caller.
    /// Every observed acknowledgment goes through `matcher`; the listener
    /// fires only with the one emitted by the relay transaction.
    async fn subscribe_proof_acknowledged(
        &self,
        matcher: AckMatcher,
    ) -> Result<EventListener<ProofAcknowledged>, ChainError>;

    /// Next nonce for the caller, counting pending transactions.
    async fn pending_nonce(&self) -> Result<u64, ChainError>;

    /// Build and sign the relay call at a fixed nonce without sending it.
    async fn sign_relay(&self, call: &ProofRelayCall, nonce: u64) -> Result<SignedRelay, ChainError>;

    /// Send a signed relay call without waiting for inclusion.
    async fn broadcast(&self, relay: &SignedRelay) -> Result<(), ChainError>;

    /// Wait until `tx_hash` is mined.
    async fn confirm(&self, tx_hash: Hash32) -> Result<Confirmation, ChainError>;

    /// Check if the chain is reachable.
    async fn health_check(&self) -> Result<bool, ChainError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_already_submitted_answers() {
        assert!(ChainError::Rejected("already known".into()).is_already_submitted());
        assert!(ChainError::Rejected("(code: -32000, message: nonce too low, data: None)".into()).is_already_submitted());
        assert!(ChainError::Rejected("Replacement transaction underpriced".into()).is_already_submitted());

        assert!(!ChainError::Rejected("insufficient funds for gas * price + value".into()).is_already_submitted());
        assert!(!ChainError::Network("already known".into()).is_already_submitted());
    }
}
