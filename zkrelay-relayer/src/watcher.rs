//! Destination-chain event subscriptions.
//!
//! Each subscription is one-shot: it resolves with the first matching event
//! and is torn down afterwards, whether it fired, timed out or was dropped.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use zkrelay_common::{AttestationId, Hash32, RelayError, Stage};

use crate::submitters::{AttestationPosted, DestinationChain, ProofAcknowledged};

/// Sending half of a listener, held by whatever delivers the event.
pub type EventSink<T> = oneshot::Sender<Result<T, String>>;

/// Why waiting on a listener ended without an event.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WaitError {
    #[error("no event within {0:?}")]
    TimedOut(Duration),

    #[error("subscription failed: {0}")]
    Failed(String),

    #[error("subscription closed before any event")]
    Closed,
}

/// One-shot subscription to a destination-chain event.
pub struct EventListener<T> {
    name: String,
    rx: oneshot::Receiver<Result<T, String>>,
    task: Option<JoinHandle<()>>,
    on_unsubscribe: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl<T> EventListener<T> {
    pub fn channel(name: impl Into<String>) -> (EventSink<T>, EventListener<T>) {
        let (tx, rx) = oneshot::channel();
        (
            tx,
            EventListener {
                name: name.into(),
                rx,
                task: None,
                on_unsubscribe: None,
            },
        )
    }

    /// Attach the task that polls for the event.
    pub fn with_task(mut self, task: JoinHandle<()>) -> Self {
        self.task = Some(task);
        self
    }

    /// Run `f` once when the listener is torn down.
    pub fn on_unsubscribe(mut self, f: impl FnOnce() + Send + Sync + 'static) -> Self {
        self.on_unsubscribe = Some(Box::new(f));
        self
    }

    /// Wait at most `bound` for the event, then unsubscribe.
    pub async fn wait(mut self, bound: Duration) -> Result<T, WaitError> {
        match tokio::time::timeout(bound, &mut self.rx).await {
            Ok(Ok(Ok(event))) => Ok(event),
            Ok(Ok(Err(cause))) => Err(WaitError::Failed(cause)),
            Ok(Err(_)) => Err(WaitError::Closed),
            Err(_) => Err(WaitError::TimedOut(bound)),
        }
    }
}

impl<T> Drop for EventListener<T> {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        if let Some(unsubscribe) = self.on_unsubscribe.take() {
            debug!(listener = %self.name, "unsubscribing");
            unsubscribe();
        }
    }
}

/// Picks the acknowledgment emitted by the relay transaction out of every
/// acknowledgment addressed to the caller.
///
/// The relay hash arrives through a watch channel once the call is signed.
/// Acknowledgments observed before that are held until it is known; after
/// that, any acknowledgment from another transaction is discarded.
pub struct AckMatcher {
    relay_tx: watch::Receiver<Option<Hash32>>,
    held: Vec<ProofAcknowledged>,
}

impl AckMatcher {
    pub fn new(relay_tx: watch::Receiver<Option<Hash32>>) -> Self {
        Self {
            relay_tx,
            held: Vec::new(),
        }
    }

    /// Feed newly observed acknowledgments. Returns the relay transaction's
    /// acknowledgment once both it and the relay hash are known.
    pub fn select(&mut self, observed: impl IntoIterator<Item = ProofAcknowledged>) -> Option<ProofAcknowledged> {
        self.held.extend(observed);
        let relay_tx = (*self.relay_tx.borrow())?;

        let found = self.held.iter().find(|ack| ack.tx_hash == Some(relay_tx)).copied();
        if found.is_none() && !self.held.is_empty() {
            debug!(
                relay_tx = %relay_tx,
                skipped = self.held.len(),
                "ignoring acknowledgments from other transactions"
            );
            self.held.clear();
        }
        found
    }
}

/// Subscribes to the destination-chain events a relay depends on.
#[derive(Clone)]
pub struct DestinationWatcher {
    chain: Arc<dyn DestinationChain>,
    root_timeout: Duration,
    ack_timeout: Duration,
}

impl DestinationWatcher {
    pub fn new(chain: Arc<dyn DestinationChain>, root_timeout: Duration, ack_timeout: Duration) -> Self {
        Self {
            chain,
            root_timeout,
            ack_timeout,
        }
    }

    /// Subscribe to both events for `attestation_id`.
    ///
    /// The acknowledgment subscription is registered first so that it is in
    /// place before any relay call can be sent.
    pub async fn watch(&self, attestation_id: AttestationId) -> Result<RelayWatch, RelayError> {
        let subscription_failed = |cause: String| RelayError::Relay {
            attestation_id,
            tx_hash: None,
            reason: format!("subscription failed: {}", cause),
        };

        let (relay_tx, relay_rx) = watch::channel(None);
        let acknowledgment = self
            .chain
            .subscribe_proof_acknowledged(AckMatcher::new(relay_rx))
            .await
            .map_err(|e| subscription_failed(e.to_string()))?;
        let root = self
            .chain
            .subscribe_attestation_posted(attestation_id)
            .await
            .map_err(|e| subscription_failed(e.to_string()))?;

        debug!(
            attestation_id = %attestation_id,
            chain = self.chain.chain_name(),
            "watching destination chain"
        );

        Ok(RelayWatch {
            attestation_id,
            root: Some(root),
            acknowledgment: Some(acknowledgment),
            relay_tx,
            root_timeout: self.root_timeout,
            ack_timeout: self.ack_timeout,
        })
    }
}

/// Live subscriptions for one relay.
pub struct RelayWatch {
    attestation_id: AttestationId,
    root: Option<EventListener<AttestationPosted>>,
    acknowledgment: Option<EventListener<ProofAcknowledged>>,
    relay_tx: watch::Sender<Option<Hash32>>,
    root_timeout: Duration,
    ack_timeout: Duration,
}

impl RelayWatch {
    fn failure(
        &self,
        stage: Stage,
        tx_hash: Option<Hash32>,
        error: WaitError,
        waited: Duration,
    ) -> RelayError {
        match error {
            WaitError::TimedOut(_) => RelayError::Timeout {
                stage,
                attestation_id: Some(self.attestation_id),
                tx_hash,
                waited,
            },
            other => RelayError::Relay {
                attestation_id: self.attestation_id,
                tx_hash,
                reason: format!("{} listener: {}", stage, other),
            },
        }
    }

    /// Tell the acknowledgment listener which transaction to match.
    pub fn relay_signed(&self, tx_hash: Hash32) {
        self.relay_tx.send_replace(Some(tx_hash));
    }

    /// Wait for the destination chain to post the attestation root.
    pub async fn await_root(&mut self) -> Result<AttestationPosted, RelayError> {
        let listener = self.root.take().ok_or(RelayError::Relay {
            attestation_id: self.attestation_id,
            tx_hash: None,
            reason: "attestation root already awaited".to_string(),
        })?;

        match listener.wait(self.root_timeout).await {
            Ok(posted) => {
                info!(
                    attestation_id = %posted.attestation_id,
                    root = %posted.root,
                    "Attestation root posted on destination chain"
                );
                Ok(posted)
            }
            Err(e) => {
                warn!(attestation_id = %self.attestation_id, error = %e, "attestation root not observed");
                Err(self.failure(Stage::AttestationRoot, None, e, self.root_timeout))
            }
        }
    }

    /// Wait for the application's acknowledgment of the relay call `tx_hash`.
    pub async fn await_acknowledgment(&mut self, tx_hash: Hash32) -> Result<ProofAcknowledged, RelayError> {
        let listener = self.acknowledgment.take().ok_or(RelayError::Relay {
            attestation_id: self.attestation_id,
            tx_hash: Some(tx_hash),
            reason: "acknowledgment already awaited".to_string(),
        })?;

        self.relay_signed(tx_hash);

        match listener.wait(self.ack_timeout).await {
            Ok(ack) if ack.tx_hash != Some(tx_hash) => {
                let from = ack.tx_hash.map(|h| h.to_hex()).unwrap_or_else(|| "an unknown transaction".to_string());
                warn!(
                    attestation_id = %self.attestation_id,
                    tx_hash = %tx_hash,
                    ack_tx = %from,
                    "acknowledgment belongs to another transaction"
                );
                Err(RelayError::Relay {
                    attestation_id: self.attestation_id,
                    tx_hash: Some(tx_hash),
                    reason: format!("acknowledgment came from {}", from),
                })
            }
            Ok(ack) => {
                info!(
                    attestation_id = %self.attestation_id,
                    tx_hash = %tx_hash,
                    "App contract has acknowledged the proof"
                );
                Ok(ack)
            }
            Err(e) => {
                warn!(attestation_id = %self.attestation_id, tx_hash = %tx_hash, error = %e, "acknowledgment not observed");
                Err(self.failure(Stage::Acknowledgment, Some(tx_hash), e, self.ack_timeout))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn test_delivers_first_event() {
        let (tx, listener) = EventListener::<u32>::channel("numbers");
        tx.send(Ok(7)).unwrap();

        assert_eq!(listener.wait(Duration::from_secs(1)).await, Ok(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out_and_unsubscribes() {
        let unsubscribed = Arc::new(AtomicBool::new(false));
        let flag = unsubscribed.clone();

        let (_tx, listener) = EventListener::<u32>::channel("numbers");
        let listener = listener.on_unsubscribe(move || flag.store(true, Ordering::SeqCst));

        assert_eq!(
            listener.wait(Duration::from_secs(5)).await,
            Err(WaitError::TimedOut(Duration::from_secs(5)))
        );
        assert!(unsubscribed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_closed_and_failed() {
        let (tx, listener) = EventListener::<u32>::channel("numbers");
        drop(tx);
        assert_eq!(listener.wait(Duration::from_secs(1)).await, Err(WaitError::Closed));

        let (tx, listener) = EventListener::<u32>::channel("numbers");
        tx.send(Err("filter dropped".into())).unwrap();
        assert_eq!(
            listener.wait(Duration::from_secs(1)).await,
            Err(WaitError::Failed("filter dropped".into()))
        );
    }

    fn ack(tx: u8) -> ProofAcknowledged {
        ProofAcknowledged {
            winner_topic: Hash32::ZERO,
            tx_hash: Some(Hash32([tx; 32])),
        }
    }

    #[test]
    fn test_matcher_holds_acks_until_relay_is_signed() {
        let (relay_tx, relay_rx) = watch::channel(None);
        let mut matcher = AckMatcher::new(relay_rx);

        assert_eq!(matcher.select([ack(0xbb), ack(0xaa)]), None);

        relay_tx.send_replace(Some(Hash32([0xaa; 32])));
        assert_eq!(matcher.select(Vec::new()), Some(ack(0xaa)));
    }

    #[test]
    fn test_matcher_ignores_other_transactions() {
        let (relay_tx, relay_rx) = watch::channel(None);
        let mut matcher = AckMatcher::new(relay_rx);
        relay_tx.send_replace(Some(Hash32([0xaa; 32])));

        assert_eq!(matcher.select([ack(0xbb)]), None);
        let unattributed = ProofAcknowledged {
            winner_topic: Hash32::ZERO,
            tx_hash: None,
        };
        assert_eq!(matcher.select([unattributed]), None);
        assert_eq!(matcher.select([ack(0xcc), ack(0xaa)]), Some(ack(0xaa)));
    }

    #[tokio::test]
    async fn test_drop_aborts_polling_task() {
        let (alive_tx, alive_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let _alive = alive_tx;
            std::future::pending::<()>().await;
        });

        let (_tx, listener) = EventListener::<u32>::channel("numbers");
        drop(listener.with_task(task));
        assert!(alive_rx.await.is_err());
    }
}
