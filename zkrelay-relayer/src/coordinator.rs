//! End-to-end relay flow: submit, attest, retrieve, relay.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use zkrelay_common::{
    AttestationCheckpoint, FinalizedAttestation, ProofBundle, RelayError, RelayOutcome, Stage,
};

use crate::dispatcher::EventDispatcher;
use crate::inflight::InFlightRegistry;
use crate::relay::{CrossChainRelay, RelayTimeouts};
use crate::retriever::{InclusionProofRetriever, ProofPathQuery};
use crate::retry::RetryPolicy;
use crate::session::AttestationSession;
use crate::submitters::DestinationChain;

/// Stage bounds and persistence settings for the coordinator.
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    /// Bound on submission until the attestation is published.
    pub finalization_timeout: Duration,
    pub retry: RetryPolicy,
    /// Bound on a single proof-path query.
    pub rpc_timeout: Duration,
    pub timeouts: RelayTimeouts,
    pub checkpoint_path: Option<PathBuf>,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            finalization_timeout: Duration::from_secs(900),
            retry: RetryPolicy::default(),
            rpc_timeout: Duration::from_secs(30),
            timeouts: RelayTimeouts::default(),
            checkpoint_path: None,
        }
    }
}

/// Runs proofs through the whole relay.
pub struct RelayCoordinator {
    session: Arc<dyn AttestationSession>,
    retriever: InclusionProofRetriever,
    relay: CrossChainRelay,
    registry: InFlightRegistry,
    finalization_timeout: Duration,
    checkpoint_path: Option<PathBuf>,
}

impl RelayCoordinator {
    pub fn new(
        session: Arc<dyn AttestationSession>,
        query: Arc<dyn ProofPathQuery>,
        chain: Arc<dyn DestinationChain>,
        settings: CoordinatorSettings,
    ) -> Self {
        Self {
            session,
            retriever: InclusionProofRetriever::new(query, settings.retry, settings.rpc_timeout),
            relay: CrossChainRelay::new(chain, settings.timeouts),
            registry: InFlightRegistry::new(),
            finalization_timeout: settings.finalization_timeout,
            checkpoint_path: settings.checkpoint_path,
        }
    }

    pub fn registry(&self) -> &InFlightRegistry {
        &self.registry
    }

    /// Submit `bundle` and relay it once its attestation is published.
    pub async fn relay(&self, bundle: ProofBundle) -> Result<RelayOutcome, RelayError> {
        let attestation = self.attest(bundle).await?;
        self.resume(attestation.checkpoint()).await
    }

    /// Submit `bundle` and wait until the submission is finalized and the
    /// attestation containing it is published.
    pub async fn attest(&self, bundle: ProofBundle) -> Result<FinalizedAttestation, RelayError> {
        let mut submission = self.session.submit(bundle).await?;
        let mut dispatcher = EventDispatcher::new();

        let deadline = tokio::time::sleep(self.finalization_timeout);
        tokio::pin!(deadline);

        let mut events_open = true;
        let mut result_done = false;

        while !dispatcher.is_ready() {
            tokio::select! {
                event = submission.events.recv(), if events_open => match event {
                    Some(event) => {
                        dispatcher.apply(&event);
                    }
                    None => events_open = false,
                },
                result = &mut submission.result, if !result_done => {
                    result_done = true;
                    match result {
                        Ok(Ok(attested)) => dispatcher.resolve(attested),
                        Ok(Err(cause)) => {
                            dispatcher.mark_failed();
                            error!(error = %cause, "Transaction failed");
                            return Err(RelayError::Submission {
                                attestation_id: dispatcher.handle().attestation_id(),
                                cause,
                            });
                        }
                        Err(_) => {
                            dispatcher.mark_failed();
                            return Err(RelayError::Submission {
                                attestation_id: None,
                                cause: "session dropped the submission without a result".to_string(),
                            });
                        }
                    }
                },
                _ = &mut deadline => {
                    warn!(
                        status = %dispatcher.status(),
                        waited = ?self.finalization_timeout,
                        "attestation not published in time"
                    );
                    return Err(RelayError::timeout(
                        Stage::Finalization,
                        dispatcher.handle().attestation_id(),
                        self.finalization_timeout,
                    ));
                }
            }

            // Published, but the event stream ended without finalization.
            if result_done && !events_open && !dispatcher.is_ready() {
                if let Err(err) = dispatcher.handle().finalized() {
                    error!(error = %err, "published attestation was never finalized");
                    return Err(err);
                }
            }
        }

        let attestation = dispatcher.handle().finalized()?;
        self.persist(&attestation.checkpoint());
        Ok(attestation)
    }

    /// Relay an attestation that has already been published.
    pub async fn resume(&self, checkpoint: AttestationCheckpoint) -> Result<RelayOutcome, RelayError> {
        let attestation = FinalizedAttestation::from(checkpoint);
        let claim = self.registry.claim(attestation.attestation_id())?;

        let result = async {
            let proof = self.retriever.fetch(&attestation).await?;
            self.relay.relay(&attestation, &proof, &claim).await
        }
        .await;

        match &result {
            Ok(outcome) => info!(
                attestation_id = %outcome.attestation_id(),
                tx_hash = %outcome.transaction_hash(),
                "Proof relayed and acknowledged"
            ),
            Err(e) => error!(
                attestation_id = %attestation.attestation_id(),
                stage = %e.stage(),
                tx_hash = ?e.tx_hash(),
                error = %e,
                "Relay failed"
            ),
        }
        result
    }

    fn persist(&self, checkpoint: &AttestationCheckpoint) {
        let Some(path) = self.checkpoint_path.as_ref() else {
            return;
        };

        let written = checkpoint
            .to_json()
            .map_err(|e| e.to_string())
            .and_then(|json| std::fs::write(path, json).map_err(|e| e.to_string()));

        match written {
            Ok(()) => info!(path = %path.display(), attestation_id = %checkpoint.attestation_id, "Checkpoint written"),
            Err(e) => warn!(path = %path.display(), error = %e, "failed to write checkpoint"),
        }
    }
}
