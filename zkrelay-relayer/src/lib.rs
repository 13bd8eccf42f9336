//! zkrelay-relayer
//!
//! Relayer that carries a proof from zkVerify to an EVM application contract.
//!
//! Architecture:
//! 1. Submit the proof bundle through an authenticated zkVerify session
//! 2. Follow inclusion and finalization events until the attestation is published
//! 3. Fetch the Merkle inclusion proof with bounded retries
//! 4. Wait for the destination chain to post the attestation root
//! 5. Submit `proveGameWinner` and wait for the application's acknowledgment

pub mod config;
pub mod coordinator;
pub mod dispatcher;
pub mod inflight;
pub mod poe;
pub mod relay;
pub mod retriever;
pub mod retry;
pub mod session;
pub mod submitters;
pub mod watcher;
pub mod zkverify;

pub use config::RelayerConfig;
pub use coordinator::{CoordinatorSettings, RelayCoordinator};
pub use dispatcher::{EventDispatcher, Transition};
pub use inflight::{InFlightGuard, InFlightRegistry};
pub use poe::PoeRpcClient;
pub use relay::{CrossChainRelay, RelayTimeouts};
pub use retriever::{InclusionProofRetriever, ProofPathQuery, QueryError};
pub use retry::{RetryDecision, RetryPolicy};
pub use session::{
    AttestationSession, EventKind, SessionEvent, Submission, SubmissionResult, SubmissionSender,
};
pub use submitters::{
    AttestationPosted, ChainError, Confirmation, DestinationChain, EvmDestination, ProofAcknowledged,
    SignedRelay,
};
pub use watcher::{AckMatcher, DestinationWatcher, EventListener, RelayWatch, WaitError};
pub use zkverify::ZkVerifySession;
