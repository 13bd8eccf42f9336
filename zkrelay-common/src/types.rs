//! Core types for the attestation relay.
//!
//! This module provides types for:
//! - 32-byte hashes parsed from and rendered as `0x` hex
//! - Opaque proof bundles submitted to zkVerify
//! - The per-submission attestation handle and its status machine
//! - Checkpoints that let a relay resume at the retrieval stage

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crate::error::RelayError;

// ═══════════════════════════════════════════════════════════════════════════════
// HASHES
// ═══════════════════════════════════════════════════════════════════════════════

/// 32-byte hash as used by both zkVerify (`H256`) and the EVM (`bytes32`).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Hash32(pub [u8; 32]);

/// Leaf digest of an attested statement.
pub type LeafDigest = Hash32;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseHashError {
    #[error("hash must start with 0x: {0:?}")]
    MissingPrefix(String),

    #[error("hash has no digits")]
    Empty,

    #[error("hash longer than 32 bytes ({0} hex digits)")]
    TooLong(usize),

    #[error("invalid hex digit in {0:?}")]
    InvalidDigit(String),
}

impl Hash32 {
    pub const ZERO: Hash32 = Hash32([0u8; 32]);

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }
}

impl FromStr for Hash32 {
    type Err = ParseHashError;

    /// Parses `0x`-prefixed hex of up to 64 digits. Short values are
    /// left-padded, matching ABI encoding of numeric `bytes32` arguments.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s
            .strip_prefix("0x")
            .or_else(|| s.strip_prefix("0X"))
            .ok_or_else(|| ParseHashError::MissingPrefix(s.to_string()))?;

        if digits.is_empty() {
            return Err(ParseHashError::Empty);
        }
        if digits.len() > 64 {
            return Err(ParseHashError::TooLong(digits.len()));
        }

        let padded = format!("{:0>64}", digits);
        let bytes =
            hex::decode(&padded).map_err(|_| ParseHashError::InvalidDigit(s.to_string()))?;

        let mut out = [0u8; 32];
        out.copy_from_slice(&bytes);
        Ok(Self(out))
    }
}

impl fmt::Display for Hash32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Hash32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash32({})", self.to_hex())
    }
}

impl From<[u8; 32]> for Hash32 {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl Serialize for Hash32 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Hash32 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PROOF BUNDLE
// ═══════════════════════════════════════════════════════════════════════════════

/// Opaque proof produced upstream. The relay never inspects its contents.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofBundle {
    #[serde(with = "hex_bytes")]
    pub verifying_key: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub proof: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub public_inputs: Vec<u8>,
}

impl ProofBundle {
    pub fn new(verifying_key: Vec<u8>, proof: Vec<u8>, public_inputs: Vec<u8>) -> Self {
        Self {
            verifying_key,
            proof,
            public_inputs,
        }
    }

    /// Load a bundle from its JSON representation.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("0x{}", hex::encode(bytes)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s.trim_start_matches("0x")).map_err(serde::de::Error::custom)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ATTESTATION
// ═══════════════════════════════════════════════════════════════════════════════

/// Attestation identifier assigned by zkVerify.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttestationId(pub u64);

impl AttestationId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for AttestationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for AttestationId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// Resolved value of a successful submission. Both fields are always present.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttestedProof {
    pub attestation_id: AttestationId,
    pub leaf_digest: LeafDigest,
}

/// Lifecycle of one submission on the attestation network.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttestationStatus {
    Submitted,
    IncludedInBlock,
    Finalized,
    SubmissionFailed,
}

impl AttestationStatus {
    fn rank(self) -> u8 {
        match self {
            AttestationStatus::Submitted => 0,
            AttestationStatus::IncludedInBlock => 1,
            AttestationStatus::Finalized => 2,
            AttestationStatus::SubmissionFailed => 3,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, AttestationStatus::SubmissionFailed)
    }

    /// Whether moving from `self` to `next` is a forward step.
    ///
    /// Failure is reachable from every non-terminal state; nothing leaves it.
    pub fn can_advance_to(self, next: AttestationStatus) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }
}

impl fmt::Display for AttestationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AttestationStatus::Submitted => "submitted",
            AttestationStatus::IncludedInBlock => "included_in_block",
            AttestationStatus::Finalized => "finalized",
            AttestationStatus::SubmissionFailed => "submission_failed",
        };
        f.write_str(s)
    }
}

/// Mutable record of one submission, filled in as it resolves.
///
/// `None` fields mean "not known yet".
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AttestationHandle {
    attestation_id: Option<AttestationId>,
    leaf_digest: Option<LeafDigest>,
    status: AttestationStatus,
}

impl Default for AttestationHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl AttestationHandle {
    pub fn new() -> Self {
        Self {
            attestation_id: None,
            leaf_digest: None,
            status: AttestationStatus::Submitted,
        }
    }

    pub fn attestation_id(&self) -> Option<AttestationId> {
        self.attestation_id
    }

    pub fn leaf_digest(&self) -> Option<LeafDigest> {
        self.leaf_digest
    }

    pub fn status(&self) -> AttestationStatus {
        self.status
    }

    /// Move to `next` if it is a forward step. Returns whether the status changed.
    pub fn advance(&mut self, next: AttestationStatus) -> bool {
        if self.status.can_advance_to(next) {
            self.status = next;
            true
        } else {
            false
        }
    }

    /// Record the resolved submission. Both fields are set together.
    pub fn resolve(&mut self, attested: AttestedProof) {
        self.attestation_id = Some(attested.attestation_id);
        self.leaf_digest = Some(attested.leaf_digest);
    }

    pub fn is_resolved(&self) -> bool {
        self.attestation_id.is_some() && self.leaf_digest.is_some()
    }

    /// The finalized view required by inclusion-proof retrieval.
    pub fn finalized(&self) -> Result<FinalizedAttestation, RelayError> {
        match (self.status, self.attestation_id, self.leaf_digest) {
            (AttestationStatus::Finalized, Some(attestation_id), Some(leaf_digest)) => {
                Ok(FinalizedAttestation {
                    attestation_id,
                    leaf_digest,
                })
            }
            (status, attestation_id, _) => Err(RelayError::Submission {
                attestation_id,
                cause: format!(
                    "attestation not usable for retrieval (status {}, resolved {})",
                    status,
                    self.is_resolved()
                ),
            }),
        }
    }
}

/// An attestation whose id and leaf digest are both known and whose
/// submission was finalized. Only this type can be handed to retrieval.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FinalizedAttestation {
    attestation_id: AttestationId,
    leaf_digest: LeafDigest,
}

impl FinalizedAttestation {
    pub fn attestation_id(&self) -> AttestationId {
        self.attestation_id
    }

    pub fn leaf_digest(&self) -> LeafDigest {
        self.leaf_digest
    }

    pub fn checkpoint(&self) -> AttestationCheckpoint {
        AttestationCheckpoint {
            attestation_id: self.attestation_id,
            leaf_digest: self.leaf_digest,
        }
    }
}

/// Persisted progress of a published attestation that has not been relayed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttestationCheckpoint {
    pub attestation_id: AttestationId,
    pub leaf_digest: LeafDigest,
}

impl AttestationCheckpoint {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

impl From<AttestationCheckpoint> for FinalizedAttestation {
    fn from(checkpoint: AttestationCheckpoint) -> Self {
        Self {
            attestation_id: checkpoint.attestation_id,
            leaf_digest: checkpoint.leaf_digest,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_parse_pads_short_values() {
        let h: Hash32 = "0xabc".parse().unwrap();
        assert_eq!(h.0[30], 0x0a);
        assert_eq!(h.0[31], 0xbc);
        assert!(h.0[..30].iter().all(|b| *b == 0));
        assert_eq!(
            h.to_string(),
            "0x0000000000000000000000000000000000000000000000000000000000000abc"
        );
    }

    #[test]
    fn test_hash_parse_rejects_bad_input() {
        assert_eq!(
            "abc".parse::<Hash32>(),
            Err(ParseHashError::MissingPrefix("abc".into()))
        );
        assert_eq!("0x".parse::<Hash32>(), Err(ParseHashError::Empty));
        assert!(matches!(
            format!("0x{}", "1".repeat(65)).parse::<Hash32>(),
            Err(ParseHashError::TooLong(65))
        ));
        assert!(matches!(
            "0xzz".parse::<Hash32>(),
            Err(ParseHashError::InvalidDigit(_))
        ));
    }

    #[test]
    fn test_hash_serde_uses_hex_string() {
        let h = Hash32([0x11; 32]);
        let json = serde_json::to_string(&h).unwrap();
        assert_eq!(json, format!("\"0x{}\"", "11".repeat(32)));
        let back: Hash32 = serde_json::from_str(&json).unwrap();
        assert_eq!(back, h);
    }

    #[test]
    fn test_proof_bundle_from_json() {
        let bundle = ProofBundle::from_json(
            r#"{"verifying_key":"0x0102","proof":"0xff","public_inputs":"0x"}"#,
        )
        .unwrap();
        assert_eq!(bundle.verifying_key, vec![1, 2]);
        assert_eq!(bundle.proof, vec![0xff]);
        assert!(bundle.public_inputs.is_empty());
    }

    #[test]
    fn test_status_is_monotonic() {
        use AttestationStatus::*;

        assert!(Submitted.can_advance_to(IncludedInBlock));
        assert!(Submitted.can_advance_to(Finalized));
        assert!(IncludedInBlock.can_advance_to(Finalized));
        assert!(!Finalized.can_advance_to(IncludedInBlock));
        assert!(!Finalized.can_advance_to(Submitted));
        assert!(!Finalized.can_advance_to(Finalized));
        assert!(Finalized.can_advance_to(SubmissionFailed));
        assert!(!SubmissionFailed.can_advance_to(Finalized));
    }

    #[test]
    fn test_handle_requires_finalized_and_resolved() {
        let mut handle = AttestationHandle::new();
        assert!(matches!(
            handle.finalized(),
            Err(RelayError::Submission { attestation_id: None, .. })
        ));

        handle.advance(AttestationStatus::Finalized);
        assert!(handle.finalized().is_err(), "unresolved handle must be rejected");

        handle.resolve(AttestedProof {
            attestation_id: AttestationId(7),
            leaf_digest: "0xabc".parse().unwrap(),
        });
        let finalized = handle.finalized().unwrap();
        assert_eq!(finalized.attestation_id(), AttestationId(7));
    }

    #[test]
    fn test_resolved_but_not_finalized_is_rejected() {
        let mut handle = AttestationHandle::new();
        handle.resolve(AttestedProof {
            attestation_id: AttestationId(3),
            leaf_digest: Hash32::ZERO,
        });
        handle.advance(AttestationStatus::IncludedInBlock);

        let err = handle.finalized().unwrap_err();
        assert_eq!(err.attestation_id(), Some(AttestationId(3)));
    }

    #[test]
    fn test_checkpoint_roundtrip_into_finalized() {
        let checkpoint = AttestationCheckpoint {
            attestation_id: AttestationId(42),
            leaf_digest: Hash32([9u8; 32]),
        };
        let json = checkpoint.to_json().unwrap();
        assert!(json.contains("\"attestation_id\": 42"));

        let finalized: FinalizedAttestation = AttestationCheckpoint::from_json(&json).unwrap().into();
        assert_eq!(finalized.checkpoint(), checkpoint);
    }
}
