//! Cross-chain relay of one finalized attestation.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use zkrelay_common::{
    FinalizedAttestation, Hash32, InclusionProof, ProofRelayCall, RelayError, RelayOutcome, Stage,
};

use crate::inflight::InFlightGuard;
use crate::submitters::{Confirmation, DestinationChain};
use crate::watcher::{DestinationWatcher, RelayWatch};

/// Bounds on each destination-chain stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayTimeouts {
    /// Wait for `AttestationPosted`.
    pub attestation_root: Duration,
    /// Wait for the node to accept the relay transaction.
    pub broadcast: Duration,
    /// Wait for the relay transaction to be mined.
    pub confirmation: Duration,
    /// Wait for `SuccessfulProofSubmission`.
    pub acknowledgment: Duration,
}

impl Default for RelayTimeouts {
    fn default() -> Self {
        Self {
            attestation_root: Duration::from_secs(1_800),
            broadcast: Duration::from_secs(60),
            confirmation: Duration::from_secs(300),
            acknowledgment: Duration::from_secs(300),
        }
    }
}

/// Sends the relay call once the destination chain knows the attestation root.
pub struct CrossChainRelay {
    chain: Arc<dyn DestinationChain>,
    watcher: DestinationWatcher,
    timeouts: RelayTimeouts,
}

impl CrossChainRelay {
    pub fn new(chain: Arc<dyn DestinationChain>, timeouts: RelayTimeouts) -> Self {
        let watcher = DestinationWatcher::new(
            chain.clone(),
            timeouts.attestation_root,
            timeouts.acknowledgment,
        );
        Self {
            chain,
            watcher,
            timeouts,
        }
    }

    /// Relay `proof` for `attestation`.
    ///
    /// Nothing is sent until the attestation root has been posted. At most one
    /// transaction is ever mined for the attestation: the call is signed once
    /// and a resend after a lost broadcast sends the same signed bytes.
    pub async fn relay(
        &self,
        attestation: &FinalizedAttestation,
        proof: &InclusionProof,
        claim: &InFlightGuard,
    ) -> Result<RelayOutcome, RelayError> {
        let attestation_id = attestation.attestation_id();
        let call = ProofRelayCall::new(attestation_id, proof);

        let mut watch = self.watcher.watch(attestation_id).await?;
        watch.await_root().await?;

        claim.mark_broadcast();
        let tx_hash = self.broadcast(&call, &watch).await?;

        self.confirm(&call, tx_hash).await?;

        watch.await_acknowledgment(tx_hash).await?;

        info!(
            attestation_id = %attestation_id,
            tx_hash = %tx_hash,
            "Relay complete"
        );
        Ok(call.outcome(tx_hash, true, true))
    }

    async fn broadcast(&self, call: &ProofRelayCall, watch: &RelayWatch) -> Result<Hash32, RelayError> {
        let attestation_id = call.attestation_id;
        let rejected = |tx_hash: Option<Hash32>, reason: String| RelayError::Relay {
            attestation_id,
            tx_hash,
            reason,
        };

        let nonce = self
            .chain
            .pending_nonce()
            .await
            .map_err(|e| rejected(None, format!("nonce lookup failed: {}", e)))?;
        let signed = self
            .chain
            .sign_relay(call, nonce)
            .await
            .map_err(|e| rejected(None, e.to_string()))?;
        let tx_hash = signed.tx_hash;
        watch.relay_signed(tx_hash);

        let mut last_error = None;
        for attempt in 1..=2u32 {
            match tokio::time::timeout(self.timeouts.broadcast, self.chain.broadcast(&signed)).await {
                Ok(Ok(())) => return Ok(tx_hash),
                // The first send reached the node after all.
                Ok(Err(e)) if attempt > 1 && e.is_already_submitted() => {
                    warn!(
                        attestation_id = %attestation_id,
                        tx_hash = %tx_hash,
                        nonce,
                        answer = %e,
                        "resend refused as already submitted, following the signed transaction"
                    );
                    return Ok(tx_hash);
                }
                Ok(Err(e)) if e.is_network() => {
                    warn!(attestation_id = %attestation_id, tx_hash = %tx_hash, attempt, nonce, error = %e, "broadcast failed");
                    last_error = Some(e);
                }
                Ok(Err(e)) => return Err(rejected((attempt > 1).then_some(tx_hash), e.to_string())),
                Err(_) => {
                    warn!(attestation_id = %attestation_id, tx_hash = %tx_hash, attempt, nonce, "broadcast timed out");
                    last_error = None;
                }
            }
        }

        // Either send may have reached the node, so the hash is always reported.
        Err(match last_error {
            Some(e) => rejected(Some(tx_hash), e.to_string()),
            None => RelayError::Timeout {
                stage: Stage::Broadcast,
                attestation_id: Some(attestation_id),
                tx_hash: Some(tx_hash),
                waited: self.timeouts.broadcast,
            },
        })
    }

    async fn confirm(&self, call: &ProofRelayCall, tx_hash: Hash32) -> Result<(), RelayError> {
        let attestation_id = call.attestation_id;
        match tokio::time::timeout(self.timeouts.confirmation, self.chain.confirm(tx_hash)).await {
            Ok(Ok(Confirmation::Mined)) => {
                info!(attestation_id = %attestation_id, tx_hash = %tx_hash, "Relay transaction mined");
                Ok(())
            }
            Ok(Ok(Confirmation::Reverted(reason))) => {
                warn!(attestation_id = %attestation_id, tx_hash = %tx_hash, reason = %reason, "Relay transaction reverted");
                Err(RelayError::Relay {
                    attestation_id,
                    tx_hash: Some(tx_hash),
                    reason,
                })
            }
            Ok(Err(e)) => Err(RelayError::Relay {
                attestation_id,
                tx_hash: Some(tx_hash),
                reason: e.to_string(),
            }),
            Err(_) => Err(RelayError::Timeout {
                stage: Stage::Confirmation,
                attestation_id: Some(attestation_id),
                tx_hash: Some(tx_hash),
                waited: self.timeouts.confirmation,
            }),
        }
    }
}
