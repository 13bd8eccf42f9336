//! zkVerify attestation session.
//!
//! Submits proofs to a verifier pallet and follows each extrinsic until the
//! attestation containing its leaf is published.

use std::sync::Mutex;

use async_trait::async_trait;
use sp_core::{sr25519, Pair};
use subxt::dynamic::Value;
use subxt::events::StaticEvent;
use subxt::ext::scale_decode::DecodeAsType;
use subxt::tx::{Signer, TxProgress, TxStatus};
use subxt::utils::H256;
use subxt::{OnlineClient, PolkadotConfig};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use zkrelay_common::{AttestationId, AttestedProof, Hash32, ProofBundle, RelayError};

use crate::config::ZkVerifyConfig;
use crate::session::{AttestationSession, SessionEvent, Submission, SubmissionSender};

/// Subxt signer wrapper for sr25519
pub struct SubxtSigner {
    pair: sr25519::Pair,
    account_id: subxt::utils::AccountId32,
}

impl SubxtSigner {
    pub fn from_seed(seed: &str) -> Result<Self, RelayError> {
        let pair = sr25519::Pair::from_string(seed, None)
            .map_err(|e| RelayError::Session(format!("invalid seed phrase: {:?}", e)))?;
        let account_id = subxt::utils::AccountId32::from(pair.public().0);
        Ok(Self { pair, account_id })
    }
}

impl Signer<PolkadotConfig> for SubxtSigner {
    fn account_id(&self) -> subxt::utils::AccountId32 {
        self.account_id.clone()
    }

    fn address(&self) -> <PolkadotConfig as subxt::Config>::Address {
        self.account_id.clone().into()
    }

    fn sign(&self, payload: &[u8]) -> <PolkadotConfig as subxt::Config>::Signature {
        let sig = self.pair.sign(payload);
        subxt::utils::MultiSignature::Sr25519(sig.0)
    }
}

/// `Poe::NewElement`: a proof leaf was queued for an attestation.
#[derive(Debug, DecodeAsType)]
#[decode_as_type(crate_path = "subxt::ext::scale_decode")]
struct NewElement {
    value: H256,
    attestation_id: u64,
}

impl StaticEvent for NewElement {
    const PALLET: &'static str = "Poe";
    const EVENT: &'static str = "NewElement";
}

/// `Poe::NewAttestation`: an attestation root was published.
#[derive(Debug, DecodeAsType)]
#[decode_as_type(crate_path = "subxt::ext::scale_decode")]
struct NewAttestation {
    id: u64,
    attestation: H256,
}

impl StaticEvent for NewAttestation {
    const PALLET: &'static str = "Poe";
    const EVENT: &'static str = "NewAttestation";
}

type Client = OnlineClient<PolkadotConfig>;

/// Authenticated connection to zkVerify.
pub struct ZkVerifySession {
    client: Client,
    signer: SubxtSigner,
    verifier_pallet: String,
    tasks: Mutex<Vec<AbortHandle>>,
}

impl ZkVerifySession {
    /// Connect to zkVerify and bind the account derived from the seed phrase.
    pub async fn open(config: &ZkVerifyConfig) -> Result<Self, RelayError> {
        let signer = SubxtSigner::from_seed(&config.seed_phrase)?;

        info!("connecting to zkVerify at {}", config.rpc_url);
        let client = Client::from_url(&config.rpc_url)
            .await
            .map_err(|e| RelayError::Session(format!("failed to connect to {}: {}", config.rpc_url, e)))?;

        info!(
            account = %signer.account_id,
            verifier_pallet = %config.verifier_pallet,
            "zkVerify session started"
        );

        Ok(Self {
            client,
            signer,
            verifier_pallet: config.verifier_pallet.clone(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    fn track(&self, handle: AbortHandle) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
    }
}

#[async_trait]
impl AttestationSession for ZkVerifySession {
    async fn submit(&self, bundle: ProofBundle) -> Result<Submission, RelayError> {
        let no_domain: Vec<Value> = vec![];
        let tx = subxt::dynamic::tx(
            self.verifier_pallet.as_str(),
            "submit_proof",
            vec![
                Value::from_bytes(&bundle.verifying_key),
                Value::from_bytes(&bundle.proof),
                Value::from_bytes(&bundle.public_inputs),
                Value::unnamed_variant("None", no_domain),
            ],
        );

        let progress = self
            .client
            .tx()
            .sign_and_submit_then_watch_default(&tx, &self.signer)
            .await
            .map_err(|e| RelayError::Submission {
                attestation_id: None,
                cause: format!("failed to submit proof: {}", e),
            })?;

        debug!(
            extrinsic = ?progress.extrinsic_hash(),
            pallet = %self.verifier_pallet,
            "proof submitted"
        );

        let (sender, submission) = Submission::channel();
        let task = tokio::spawn(follow_submission(self.client.clone(), progress, sender));
        self.track(task.abort_handle());

        Ok(submission.with_task(task))
    }

    async fn close(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner()));
        for task in &tasks {
            task.abort();
        }
        info!(aborted = tasks.len(), "zkVerify session closed");
    }
}

/// Drive one extrinsic through inclusion, finalization and publication.
async fn follow_submission(
    client: Client,
    mut progress: TxProgress<PolkadotConfig, Client>,
    mut sender: SubmissionSender,
) {
    let mut included = false;

    while let Some(status) = progress.next().await {
        let status = match status {
            Ok(status) => status,
            Err(e) => {
                fail(&mut sender, format!("transaction status stream failed: {}", e)).await;
                return;
            }
        };

        match status {
            TxStatus::InBestBlock(in_block) => {
                if !included {
                    included = true;
                    sender
                        .emit(SessionEvent::IncludedInBlock {
                            tx_hash: Hash32(in_block.extrinsic_hash().0),
                        })
                        .await;
                }
            }
            TxStatus::NoLongerInBestBlock => {
                sender
                    .emit(SessionEvent::Error {
                        message: "transaction retracted from best block".to_string(),
                    })
                    .await;
            }
            TxStatus::InFinalizedBlock(in_block) => {
                sender
                    .emit(SessionEvent::Finalized {
                        block_hash: Hash32(in_block.block_hash().0),
                    })
                    .await;

                let events = match in_block.wait_for_success().await {
                    Ok(events) => events,
                    Err(e) => {
                        fail(&mut sender, format!("proof verification failed: {}", e)).await;
                        return;
                    }
                };

                let element = match events.find_first::<NewElement>() {
                    Ok(Some(element)) => element,
                    Ok(None) => {
                        fail(&mut sender, "no Poe::NewElement event for the proof".to_string()).await;
                        return;
                    }
                    Err(e) => {
                        fail(&mut sender, format!("failed to decode Poe::NewElement: {}", e)).await;
                        return;
                    }
                };

                let attested = AttestedProof {
                    attestation_id: AttestationId(element.attestation_id),
                    leaf_digest: Hash32(element.value.0),
                };
                debug!(
                    attestation_id = %attested.attestation_id,
                    leaf_digest = %attested.leaf_digest,
                    "proof queued for attestation"
                );

                match wait_for_publication(&client, attested.attestation_id).await {
                    Ok(()) => sender.resolve(attested),
                    Err(cause) => fail(&mut sender, cause).await,
                }
                return;
            }
            TxStatus::Error { message }
            | TxStatus::Invalid { message }
            | TxStatus::Dropped { message } => {
                fail(&mut sender, format!("transaction failed: {}", message)).await;
                return;
            }
            _ => {}
        }
    }

    fail(&mut sender, "transaction status stream ended before finalization".to_string()).await;
}

/// Follow finalized blocks until an attestation with id `attestation_id` or
/// higher is published. Ids are assigned in order, so a higher id means ours
/// went out already.
async fn wait_for_publication(client: &Client, attestation_id: AttestationId) -> Result<(), String> {
    let mut blocks = client
        .blocks()
        .subscribe_finalized()
        .await
        .map_err(|e| format!("failed to follow finalized blocks: {}", e))?;

    while let Some(block) = blocks.next().await {
        let block = block.map_err(|e| format!("finalized block stream failed: {}", e))?;
        let events = block
            .events()
            .await
            .map_err(|e| format!("failed to fetch block events: {}", e))?;

        for event in events.find::<NewAttestation>() {
            match event {
                Ok(published) if published.id >= attestation_id.get() => {
                    debug!(
                        published = published.id,
                        root = ?published.attestation,
                        "attestation published"
                    );
                    return Ok(());
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "undecodable Poe::NewAttestation event"),
            }
        }
    }

    Err("finalized block stream ended before publication".to_string())
}

async fn fail(sender: &mut SubmissionSender, cause: String) {
    sender
        .emit(SessionEvent::Error {
            message: cause.clone(),
        })
        .await;
    sender.reject(cause);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dev_seed_account() {
        let signer = SubxtSigner::from_seed("//Alice").unwrap();
        assert_eq!(
            signer.account_id().to_string(),
            "5GrwvaEF5zXb26Fz9rcQpDWS57CtERHpNehXCPcNoHGKutQY"
        );
    }

    #[test]
    fn test_invalid_seed_is_session_error() {
        assert!(matches!(
            SubxtSigner::from_seed("not a valid seed phrase at all"),
            Err(RelayError::Session(_))
        ));
    }

    #[test]
    fn test_signatures_verify() {
        let signer = SubxtSigner::from_seed("//Bob").unwrap();
        let signature = match signer.sign(b"payload") {
            subxt::utils::MultiSignature::Sr25519(bytes) => sr25519::Signature::from_raw(bytes),
            _ => panic!("expected an sr25519 signature"),
        };
        assert!(sr25519::Pair::verify(&signature, b"payload", &signer.pair.public()));
    }
}
