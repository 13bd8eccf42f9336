//! Merkle inclusion proofs and the relay call built from them.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{AttestationId, Hash32, LeafDigest, ParseHashError};

/// Deepest Merkle path accepted from the attestation network.
pub const MAX_MERKLE_DEPTH: usize = 64;

/// Validation failure of a `poe_proofPath` payload.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidProofPath {
    #[error("attestation tree has no leaves")]
    NoLeaves,

    #[error("leaf index {leaf_index} out of range for {number_of_leaves} leaves")]
    LeafIndexOutOfRange {
        leaf_index: u64,
        number_of_leaves: u64,
    },

    #[error("merkle path has {len} entries, at most {max} allowed for {number_of_leaves} leaves")]
    PathTooLong {
        len: usize,
        max: usize,
        number_of_leaves: u64,
    },

    #[error("merkle path entry {index}: {source}")]
    BadHash {
        index: usize,
        #[source]
        source: ParseHashError,
    },

    #[error("proof is for leaf {actual}, expected {expected}")]
    LeafMismatch { expected: LeafDigest, actual: String },
}

/// `poe_proofPath` response as it comes off the wire.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawProofPath {
    #[serde(default)]
    pub root: Option<String>,
    pub proof: Vec<String>,
    #[serde(alias = "numberOfLeaves")]
    pub number_of_leaves: u64,
    #[serde(alias = "leafIndex")]
    pub leaf_index: u64,
    #[serde(default)]
    pub leaf: Option<String>,
}

/// Ordered sibling hashes from leaf to root.
#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MerklePath(Vec<Hash32>);

impl MerklePath {
    pub fn new(hashes: Vec<Hash32>) -> Self {
        Self(hashes)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[Hash32] {
        &self.0
    }
}

/// Maximum path length for a binary tree of `number_of_leaves` leaves.
fn depth_bound(number_of_leaves: u64) -> usize {
    if number_of_leaves <= 1 {
        0
    } else {
        (64 - (number_of_leaves - 1).leading_zeros()) as usize
    }
}

/// Merkle proof that a leaf digest belongs to a published attestation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct InclusionProof {
    merkle_path: MerklePath,
    number_of_leaves: u64,
    leaf_index: u64,
}

impl InclusionProof {
    pub fn new(
        merkle_path: MerklePath,
        number_of_leaves: u64,
        leaf_index: u64,
    ) -> Result<Self, InvalidProofPath> {
        if number_of_leaves == 0 {
            return Err(InvalidProofPath::NoLeaves);
        }
        if leaf_index >= number_of_leaves {
            return Err(InvalidProofPath::LeafIndexOutOfRange {
                leaf_index,
                number_of_leaves,
            });
        }

        let max = depth_bound(number_of_leaves).min(MAX_MERKLE_DEPTH);
        if merkle_path.len() > max {
            return Err(InvalidProofPath::PathTooLong {
                len: merkle_path.len(),
                max,
                number_of_leaves,
            });
        }

        Ok(Self {
            merkle_path,
            number_of_leaves,
            leaf_index,
        })
    }

    /// Validate a raw RPC payload for `expected_leaf`.
    pub fn from_raw(raw: RawProofPath, expected_leaf: LeafDigest) -> Result<Self, InvalidProofPath> {
        if let Some(leaf) = raw.leaf.as_deref() {
            let matches = leaf
                .parse::<Hash32>()
                .map(|parsed| parsed == expected_leaf)
                .unwrap_or(false);
            if !matches {
                return Err(InvalidProofPath::LeafMismatch {
                    expected: expected_leaf,
                    actual: leaf.to_string(),
                });
            }
        }

        if raw.proof.len() > MAX_MERKLE_DEPTH {
            return Err(InvalidProofPath::PathTooLong {
                len: raw.proof.len(),
                max: MAX_MERKLE_DEPTH,
                number_of_leaves: raw.number_of_leaves,
            });
        }

        let hashes = raw
            .proof
            .iter()
            .enumerate()
            .map(|(index, s)| {
                s.parse::<Hash32>()
                    .map_err(|source| InvalidProofPath::BadHash { index, source })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Self::new(MerklePath::new(hashes), raw.number_of_leaves, raw.leaf_index)
    }

    pub fn merkle_path(&self) -> &MerklePath {
        &self.merkle_path
    }

    pub fn number_of_leaves(&self) -> u64 {
        self.number_of_leaves
    }

    pub fn leaf_index(&self) -> u64 {
        self.leaf_index
    }
}

/// Arguments of `proveGameWinner(attestationId, merklePath, leafCount, index)`,
/// in call order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ProofRelayCall {
    pub attestation_id: AttestationId,
    pub merkle_path: Vec<Hash32>,
    pub leaf_count: u64,
    pub index: u64,
}

impl ProofRelayCall {
    pub fn new(attestation_id: AttestationId, proof: &InclusionProof) -> Self {
        Self {
            attestation_id,
            merkle_path: proof.merkle_path().as_slice().to_vec(),
            leaf_count: proof.number_of_leaves(),
            index: proof.leaf_index(),
        }
    }

    /// Record the terminal result of relaying this call.
    pub fn outcome(
        &self,
        transaction_hash: Hash32,
        accepted_on_chain: bool,
        application_acknowledged: bool,
    ) -> RelayOutcome {
        RelayOutcome {
            attestation_id: self.attestation_id,
            transaction_hash,
            accepted_on_chain,
            application_acknowledged,
        }
    }
}

/// Terminal record of one relay attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct RelayOutcome {
    attestation_id: AttestationId,
    transaction_hash: Hash32,
    accepted_on_chain: bool,
    application_acknowledged: bool,
}

impl RelayOutcome {
    pub fn attestation_id(&self) -> AttestationId {
        self.attestation_id
    }

    pub fn transaction_hash(&self) -> Hash32 {
        self.transaction_hash
    }

    pub fn accepted_on_chain(&self) -> bool {
        self.accepted_on_chain
    }

    pub fn application_acknowledged(&self) -> bool {
        self.application_acknowledged
    }
}
