//! Inclusion-proof retrieval with bounded retries.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info, warn};

use zkrelay_common::{
    AttestationId, FinalizedAttestation, InclusionProof, LeafDigest, RawProofPath, RelayError,
};

use crate::retry::{RetryDecision, RetryPolicy};

/// Failure of a single proof-path query.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryError {
    /// Network hiccup, overloaded node or similar. Worth retrying.
    #[error("transient: {0}")]
    Transient(String),

    /// The node answered but the answer will not change on retry.
    #[error("permanent: {0}")]
    Permanent(String),
}

impl QueryError {
    pub fn is_transient(&self) -> bool {
        matches!(self, QueryError::Transient(_))
    }
}

/// Source of Merkle proof paths for published attestations.
#[async_trait]
pub trait ProofPathQuery: Send + Sync {
    async fn proof_path(
        &self,
        attestation_id: AttestationId,
        leaf_digest: LeafDigest,
    ) -> Result<RawProofPath, QueryError>;
}

/// Fetches and validates inclusion proofs.
///
/// A successful proof is cached per attestation, so asking again for the same
/// attestation does not hit the node.
pub struct InclusionProofRetriever {
    query: Arc<dyn ProofPathQuery>,
    policy: RetryPolicy,
    attempt_timeout: Duration,
    cache: Mutex<HashMap<FinalizedAttestation, InclusionProof>>,
}

impl InclusionProofRetriever {
    pub fn new(query: Arc<dyn ProofPathQuery>, policy: RetryPolicy, attempt_timeout: Duration) -> Self {
        Self {
            query,
            policy,
            attempt_timeout,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn cached(&self, attestation: &FinalizedAttestation) -> Option<InclusionProof> {
        self.cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(attestation)
            .cloned()
    }

    /// Fetch the inclusion proof of `attestation`'s leaf.
    pub async fn fetch(&self, attestation: &FinalizedAttestation) -> Result<InclusionProof, RelayError> {
        if let Some(proof) = self.cached(attestation) {
            debug!(attestation_id = %attestation.attestation_id(), "inclusion proof served from cache");
            return Ok(proof);
        }

        let attestation_id = attestation.attestation_id();
        let leaf_digest = attestation.leaf_digest();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            debug!(attestation_id = %attestation_id, attempt, "querying proof path");

            let error = match tokio::time::timeout(
                self.attempt_timeout,
                self.query.proof_path(attestation_id, leaf_digest),
            )
            .await
            {
                Ok(Ok(raw)) => match InclusionProof::from_raw(raw, leaf_digest) {
                    Ok(proof) => {
                        info!(
                            attestation_id = %attestation_id,
                            leaves = proof.number_of_leaves(),
                            index = proof.leaf_index(),
                            depth = proof.merkle_path().len(),
                            attempts = attempt,
                            "Inclusion proof retrieved"
                        );
                        self.cache
                            .lock()
                            .unwrap_or_else(|poisoned| poisoned.into_inner())
                            .insert(*attestation, proof.clone());
                        return Ok(proof);
                    }
                    Err(invalid) => QueryError::Permanent(format!("invalid proof path: {}", invalid)),
                },
                Ok(Err(error)) => error,
                Err(_) => QueryError::Transient(format!(
                    "no response within {:?}",
                    self.attempt_timeout
                )),
            };

            match self.policy.decide(attempt, error.is_transient()) {
                RetryDecision::Retry { delay } => {
                    warn!(
                        attestation_id = %attestation_id,
                        attempt,
                        max_attempts = self.policy.max_attempts,
                        retry_in = ?delay,
                        error = %error,
                        "proof path query failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                RetryDecision::GiveUp { reason } => {
                    warn!(
                        attestation_id = %attestation_id,
                        attempt,
                        error = %error,
                        reason = %reason,
                        "giving up on proof path"
                    );
                    return Err(RelayError::Retrieval {
                        attestation_id,
                        attempts: attempt,
                        cause: error.to_string(),
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use zkrelay_common::AttestationCheckpoint;

    struct ScriptedQuery {
        replies: Mutex<VecDeque<Result<RawProofPath, QueryError>>>,
        calls: AtomicU32,
    }

    impl ScriptedQuery {
        fn new(replies: Vec<Result<RawProofPath, QueryError>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                calls: AtomicU32::new(0),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ProofPathQuery for ScriptedQuery {
        async fn proof_path(
            &self,
            _attestation_id: AttestationId,
            _leaf_digest: LeafDigest,
        ) -> Result<RawProofPath, QueryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self.replies.lock().unwrap().pop_front();
            match next {
                Some(reply) => reply,
                None => std::future::pending().await,
            }
        }
    }

    fn attestation() -> FinalizedAttestation {
        AttestationCheckpoint {
            attestation_id: AttestationId(7),
            leaf_digest: "0xabc".parse().unwrap(),
        }
        .into()
    }

    fn path() -> RawProofPath {
        RawProofPath {
            root: None,
            proof: vec!["0x1".into(), "0x2".into()],
            number_of_leaves: 4,
            leaf_index: 2,
            leaf: Some("0xabc".into()),
        }
    }

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::fixed(max_attempts, Duration::from_millis(100), Duration::from_secs(1))
    }

    fn transient() -> Result<RawProofPath, QueryError> {
        Err(QueryError::Transient("503".into()))
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried() {
        let query = ScriptedQuery::new(vec![transient(), transient(), transient(), Ok(path())]);
        let retriever = InclusionProofRetriever::new(query.clone(), policy(5), Duration::from_secs(5));

        let proof = retriever.fetch(&attestation()).await.unwrap();
        assert_eq!(query.calls(), 4);
        assert_eq!(proof.number_of_leaves(), 4);
        assert_eq!(proof.leaf_index(), 2);
        assert_eq!(proof.merkle_path().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_at_ceiling() {
        let query = ScriptedQuery::new(vec![transient(), transient(), transient(), Ok(path())]);
        let retriever = InclusionProofRetriever::new(query.clone(), policy(3), Duration::from_secs(5));

        let err = retriever.fetch(&attestation()).await.unwrap_err();
        assert!(matches!(err, RelayError::Retrieval { attempts: 3, .. }));
        assert_eq!(query.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_stops_immediately() {
        let query = ScriptedQuery::new(vec![
            Err(QueryError::Permanent("unknown attestation".into())),
            Ok(path()),
        ]);
        let retriever = InclusionProofRetriever::new(query.clone(), policy(5), Duration::from_secs(5));

        let err = retriever.fetch(&attestation()).await.unwrap_err();
        assert!(matches!(err, RelayError::Retrieval { attempts: 1, .. }));
        assert_eq!(query.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_path_is_not_retried() {
        let mut bad = path();
        bad.leaf_index = 9;
        let query = ScriptedQuery::new(vec![Ok(bad), Ok(path())]);
        let retriever = InclusionProofRetriever::new(query.clone(), policy(5), Duration::from_secs(5));

        assert!(retriever.fetch(&attestation()).await.is_err());
        assert_eq!(query.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_query_counts_as_attempt() {
        // Empty script: every call hangs.
        let query = ScriptedQuery::new(vec![]);
        let retriever = InclusionProofRetriever::new(query.clone(), policy(2), Duration::from_secs(1));

        let err = retriever.fetch(&attestation()).await.unwrap_err();
        assert!(matches!(err, RelayError::Retrieval { attempts: 2, .. }));
        assert_eq!(query.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_proof_is_cached() {
        let query = ScriptedQuery::new(vec![Ok(path())]);
        let retriever = InclusionProofRetriever::new(query.clone(), policy(5), Duration::from_secs(5));

        let first = retriever.fetch(&attestation()).await.unwrap();
        let second = retriever.fetch(&attestation()).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(query.calls(), 1);
    }
}
