//! zkrelay-common
//!
//! Data model shared by the zkVerify → EVM attestation relay: proof bundles,
//! attestation handles and their status machine, Merkle inclusion proofs and
//! the relay error taxonomy.

pub mod error;
pub mod proof;
pub mod types;

pub use error::{ErrorKind, RelayError, Stage};
pub use proof::{
    InclusionProof, InvalidProofPath, MerklePath, ProofRelayCall, RawProofPath, RelayOutcome, MAX_MERKLE_DEPTH,
};
pub use types::{
    AttestationCheckpoint, AttestationHandle, AttestationId, AttestationStatus, AttestedProof,
    FinalizedAttestation, Hash32, LeafDigest, ParseHashError, ProofBundle,
};
