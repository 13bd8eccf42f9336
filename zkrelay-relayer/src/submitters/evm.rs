//! EVM destination chain.

use async_trait::async_trait;
use ethers::{
    contract::{parse_log, ContractError},
    prelude::*,
    providers::{FilterKind, RpcError},
    types::{
        transaction::eip2718::TypedTransaction, Address, BlockId, BlockNumber, Bytes, Filter,
        Log, TransactionRequest, H256, U256, U64,
    },
    utils::{keccak256, to_checksum},
};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use zkrelay_common::{AttestationId, Hash32, ProofRelayCall};

use super::{AttestationPosted, ChainError, Confirmation, DestinationChain, ProofAcknowledged, SignedRelay};
use crate::config::DestinationConfig;
use crate::watcher::{AckMatcher, EventListener};

abigen!(
    ZkVerifyAttestations,
    r#"[
        event AttestationPosted(uint256 indexed attestationId, bytes32 indexed root)
    ]"#
);

abigen!(
    GameWinnerApp,
    r#"[
        function proveGameWinner(uint256 attestationId, bytes32[] merklePath, uint256 leafCount, uint256 index)
        event SuccessfulProofSubmission(string indexed winner)
    ]"#
);

type Client = SignerMiddleware<Provider<Http>, LocalWallet>;

/// Topic of an indexed `uint256` attestation id.
fn id_topic(attestation_id: AttestationId) -> H256 {
    let mut topic = [0u8; 32];
    U256::from(attestation_id.get()).to_big_endian(&mut topic);
    H256::from(topic)
}

/// Topic of an indexed `string`: the keccak hash of its UTF-8 bytes.
fn string_topic(value: &str) -> H256 {
    H256::from(keccak256(value.as_bytes()))
}

fn network<E: std::fmt::Display>(error: E) -> ChainError {
    ChainError::Network(error.to_string())
}

fn classify<M: Middleware>(error: ContractError<M>) -> ChainError {
    if let Some(reason) = error.decode_revert::<String>() {
        return ChainError::Rejected(format!("reverted: {}", reason));
    }
    if error.is_revert() {
        return ChainError::Rejected("reverted".to_string());
    }
    if let Some(provider_error) = error.as_provider_error() {
        return if RpcError::as_error_response(provider_error).is_some() {
            ChainError::Rejected(provider_error.to_string())
        } else {
            ChainError::Network(provider_error.to_string())
        };
    }
    ChainError::Rejected(error.to_string())
}

fn classify_middleware<M: Middleware>(error: M::Error) -> ChainError {
    classify(ContractError::<M>::from_middleware_error(error))
}

fn decode_acknowledgment(log: Log) -> Option<ProofAcknowledged> {
    let tx_hash = log.transaction_hash.map(|h| Hash32(h.0));
    let event = parse_log::<SuccessfulProofSubmissionFilter>(log).ok()?;
    Some(ProofAcknowledged {
        winner_topic: Hash32(event.winner.0),
        tx_hash,
    })
}

/// Relays proofs to an EVM application contract.
pub struct EvmDestination {
    chain_name: String,
    client: Arc<Client>,
    app: GameWinnerApp<Client>,
    zkverify_address: Address,
    app_address: Address,
    caller: Address,
    poll_interval: Duration,
}

impl EvmDestination {
    pub async fn connect(config: &DestinationConfig) -> Result<Self, ChainError> {
        let wallet = config
            .secret_key
            .parse::<LocalWallet>()
            .map_err(|e| ChainError::Config(format!("invalid secret key: {}", e)))?;
        let zkverify_address: Address = config
            .zkverify_contract
            .parse()
            .map_err(|e| ChainError::Config(format!("invalid zkVerify contract address: {}", e)))?;
        let app_address: Address = config
            .app_contract
            .parse()
            .map_err(|e| ChainError::Config(format!("invalid app contract address: {}", e)))?;

        let provider = Provider::<Http>::try_from(config.rpc_url.as_str())
            .map_err(|e| ChainError::Config(format!("invalid RPC URL: {}", e)))?
            .interval(config.poll_interval);

        let chain_id = provider.get_chainid().await.map_err(network)?;
        let wallet = wallet.with_chain_id(chain_id.as_u64());
        let caller = wallet.address();

        let client = Arc::new(SignerMiddleware::new(provider, wallet));
        let app = GameWinnerApp::new(app_address, client.clone());

        info!(
            chain_id = %chain_id,
            caller = %to_checksum(&caller, None),
            zkverify_contract = ?zkverify_address,
            app_contract = ?app_address,
            "Connected to destination chain"
        );

        Ok(Self {
            chain_name: format!("evm-{}", chain_id),
            client,
            app,
            zkverify_address,
            app_address,
            caller,
            poll_interval: config.poll_interval,
        })
    }

    /// Install a log filter on the node and poll it until `select` picks an
    /// event. `select` runs on every poll, including polls with no new logs.
    async fn listen<D, F>(&self, name: String, filter: Filter, mut select: F) -> Result<EventListener<D>, ChainError>
    where
        D: Send + 'static,
        F: FnMut(Vec<Log>) -> Option<D> + Send + 'static,
    {
        let provider = self.client.provider().clone();
        let filter_id = provider
            .new_filter(FilterKind::Logs(&filter))
            .await
            .map_err(|e| ChainError::Subscription(e.to_string()))?;
        debug!(listener = %name, filter_id = %filter_id, "log filter installed");

        let (sink, listener) = EventListener::channel(name.clone());
        let poller = provider.clone();
        let poll_interval = self.poll_interval;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            loop {
                ticker.tick().await;
                let logs: Vec<Log> = match poller.get_filter_changes(filter_id).await {
                    Ok(logs) => logs,
                    Err(e) if RpcError::as_error_response(&e).is_some() => {
                        let _ = sink.send(Err(e.to_string()));
                        return;
                    }
                    Err(e) => {
                        warn!(listener = %name, error = %e, "filter poll failed");
                        continue;
                    }
                };
                if let Some(event) = select(logs) {
                    let _ = sink.send(Ok(event));
                    return;
                }
            }
        });

        Ok(listener.with_task(task).on_unsubscribe(move || {
            if let Ok(handle) = Handle::try_current() {
                handle.spawn(async move {
                    if let Err(e) = provider.uninstall_filter(filter_id).await {
                        debug!(filter_id = %filter_id, error = %e, "failed to uninstall log filter");
                    }
                });
            }
        }))
    }

    /// Replay a reverted transaction at its block to recover the revert reason.
    async fn revert_reason(&self, hash: H256, block: Option<U64>) -> String {
        let tx = match self.client.get_transaction(hash).await {
            Ok(Some(tx)) => tx,
            Ok(None) => return "reverted (transaction not found for replay)".to_string(),
            Err(e) => return format!("reverted (replay failed: {})", e),
        };

        let mut replay = TransactionRequest::new()
            .from(tx.from)
            .data(tx.input)
            .value(tx.value)
            .gas(tx.gas);
        if let Some(to) = tx.to {
            replay = replay.to(to);
        }
        let replay = <TypedTransaction as From<TransactionRequest>>::from(replay);
        let at = block.map(|number| BlockId::Number(BlockNumber::Number(number)));

        match self.client.provider().call(&replay, at).await {
            Ok(_) => "reverted (replay succeeded, no reason available)".to_string(),
            Err(e) => match classify_middleware::<Provider<Http>>(e) {
                ChainError::Rejected(reason) => reason,
                other => format!("reverted (replay failed: {})", other),
            },
        }
    }
}

#[async_trait]
impl DestinationChain for EvmDestination {
    fn chain_name(&self) -> &str {
        &self.chain_name
    }

    fn caller(&self) -> String {
        to_checksum(&self.caller, None)
    }

    async fn subscribe_attestation_posted(
        &self,
        attestation_id: AttestationId,
    ) -> Result<EventListener<AttestationPosted>, ChainError> {
        let filter = Filter::new()
            .address(self.zkverify_address)
            .topic0(AttestationPostedFilter::signature())
            .topic1(id_topic(attestation_id));
        let expected = U256::from(attestation_id.get());

        self.listen(
            format!("AttestationPosted({})", attestation_id),
            filter,
            move |logs| {
                logs.into_iter().find_map(|log| {
                    let event = parse_log::<AttestationPostedFilter>(log).ok()?;
                    (event.attestation_id == expected).then(|| AttestationPosted {
                        attestation_id,
                        root: Hash32(event.root),
                    })
                })
            },
        )
        .await
    }

    async fn subscribe_proof_acknowledged(
        &self,
        mut matcher: AckMatcher,
    ) -> Result<EventListener<ProofAcknowledged>, ChainError> {
        let caller = self.caller();
        let filter = Filter::new()
            .address(self.app_address)
            .topic0(SuccessfulProofSubmissionFilter::signature())
            .topic1(string_topic(&caller));

        self.listen(
            format!("SuccessfulProofSubmission({})", caller),
            filter,
            move |logs| matcher.select(logs.into_iter().filter_map(decode_acknowledgment)),
        )
        .await
    }

    async fn pending_nonce(&self) -> Result<u64, ChainError> {
        let nonce = self
            .client
            .get_transaction_count(self.caller, Some(BlockNumber::Pending.into()))
            .await
            .map_err(network)?;
        Ok(nonce.as_u64())
    }

    async fn sign_relay(&self, call: &ProofRelayCall, nonce: u64) -> Result<SignedRelay, ChainError> {
        let merkle_path: Vec<[u8; 32]> = call.merkle_path.iter().map(|h| h.0).collect();

        let mut tx = self
            .app
            .prove_game_winner(
                U256::from(call.attestation_id.get()),
                merkle_path,
                U256::from(call.leaf_count),
                U256::from(call.index),
            )
            .nonce(nonce)
            .tx;

        self.client
            .fill_transaction(&mut tx, None)
            .await
            .map_err(classify_middleware::<Client>)?;
        let signature = self
            .client
            .signer()
            .sign_transaction(&tx)
            .await
            .map_err(|e| ChainError::Config(format!("failed to sign relay call: {}", e)))?;

        let raw = tx.rlp_signed(&signature);
        let tx_hash = Hash32(keccak256(&raw));

        debug!(
            attestation_id = %call.attestation_id,
            tx_hash = %tx_hash,
            nonce,
            app_contract = ?self.app_address,
            "Signed proveGameWinner"
        );
        Ok(SignedRelay {
            tx_hash,
            nonce,
            raw: raw.to_vec(),
        })
    }

    async fn broadcast(&self, relay: &SignedRelay) -> Result<(), ChainError> {
        self.client
            .send_raw_transaction(Bytes::from(relay.raw.clone()))
            .await
            .map_err(classify_middleware::<Client>)?;

        info!(tx_hash = %relay.tx_hash, nonce = relay.nonce, "Tx sent to EVM");
        Ok(())
    }

    async fn confirm(&self, tx_hash: Hash32) -> Result<Confirmation, ChainError> {
        let hash = H256::from(tx_hash.0);
        loop {
            match self.client.get_transaction_receipt(hash).await {
                Ok(Some(receipt)) => {
                    let success = receipt.status.map(|s| s.as_u64() == 1).unwrap_or(false);
                    debug!(
                        tx_hash = %tx_hash,
                        block = ?receipt.block_number,
                        success,
                        "receipt received"
                    );
                    if success {
                        return Ok(Confirmation::Mined);
                    }
                    let reason = self.revert_reason(hash, receipt.block_number).await;
                    return Ok(Confirmation::Reverted(reason));
                }
                Ok(None) => {}
                Err(e) => warn!(tx_hash = %tx_hash, error = %e, "receipt query failed"),
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn health_check(&self) -> Result<bool, ChainError> {
        let block = self.client.get_block_number().await.map_err(network)?;
        debug!("EVM health check: block {}", block);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_topic_is_big_endian_word() {
        let topic = id_topic(AttestationId(7));
        assert_eq!(topic.0[31], 7);
        assert!(topic.0[..31].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_string_topic_hashes_utf8() {
        let caller = "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266";
        assert_eq!(string_topic(caller), H256::from(keccak256(caller)));
        assert_ne!(string_topic(caller), string_topic(&caller.to_lowercase()));
    }

    #[test]
    fn test_event_signatures() {
        assert_eq!(
            AttestationPostedFilter::signature(),
            H256::from(keccak256("AttestationPosted(uint256,bytes32)"))
        );
        assert_eq!(
            SuccessfulProofSubmissionFilter::signature(),
            H256::from(keccak256("SuccessfulProofSubmission(string)"))
        );
    }

    #[test]
    fn test_decode_acknowledgment_keeps_emitting_tx() {
        let winner = string_topic("0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266");
        let log = Log {
            topics: vec![SuccessfulProofSubmissionFilter::signature(), winner],
            transaction_hash: Some(H256::repeat_byte(0xaa)),
            ..Default::default()
        };

        let ack = decode_acknowledgment(log).unwrap();
        assert_eq!(ack.winner_topic, Hash32(winner.0));
        assert_eq!(ack.tx_hash, Some(Hash32([0xaa; 32])));
    }

    #[tokio::test]
    async fn test_connect_rejects_bad_secret_key() {
        let config = DestinationConfig {
            rpc_url: "http://127.0.0.1:1".into(),
            secret_key: "not-a-key".into(),
            zkverify_contract: "0x5FbDB2315678afecb367f032d93F642f64180aa3".into(),
            app_contract: "0xe7f1725E7734CE288F8367e1Bb143E90bb3F0512".into(),
            poll_interval: Duration::from_millis(100),
        };

        assert!(matches!(
            EvmDestination::connect(&config).await,
            Err(ChainError::Config(_))
        ));
    }
}
