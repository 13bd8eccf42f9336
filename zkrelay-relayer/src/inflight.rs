//! In-flight attestation registry.
//!
//! Guards against relaying the same attestation twice from one process: an id
//! can be claimed only while no other relay for it is running, and once its
//! call has been broadcast it can never be claimed again.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

use zkrelay_common::{AttestationId, RelayError};

#[derive(Debug, Default)]
struct RegistryState {
    in_flight: HashSet<AttestationId>,
    broadcast: HashSet<AttestationId>,
}

/// Process-wide set of attestation ids currently being relayed.
#[derive(Debug, Clone, Default)]
pub struct InFlightRegistry {
    state: Arc<Mutex<RegistryState>>,
}

impl InFlightRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Claim an attestation id for relaying.
    ///
    /// Fails with `RelayError::Duplicate` while another relay holds the id, or
    /// after a call for it has already been broadcast.
    pub fn claim(&self, attestation_id: AttestationId) -> Result<InFlightGuard, RelayError> {
        let mut state = self.lock();
        if state.broadcast.contains(&attestation_id) || !state.in_flight.insert(attestation_id) {
            debug!(attestation_id = %attestation_id, "attestation already claimed");
            return Err(RelayError::Duplicate { attestation_id });
        }

        Ok(InFlightGuard {
            registry: self.clone(),
            attestation_id,
        })
    }

    pub fn is_in_flight(&self, attestation_id: AttestationId) -> bool {
        self.lock().in_flight.contains(&attestation_id)
    }

    pub fn was_broadcast(&self, attestation_id: AttestationId) -> bool {
        self.lock().broadcast.contains(&attestation_id)
    }

    /// Number of relays currently running.
    pub fn len(&self) -> usize {
        self.lock().in_flight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Exclusive claim on one attestation id. Released on drop.
#[derive(Debug)]
pub struct InFlightGuard {
    registry: InFlightRegistry,
    attestation_id: AttestationId,
}

impl InFlightGuard {
    pub fn attestation_id(&self) -> AttestationId {
        self.attestation_id
    }

    /// Record that the relay call is about to be sent. Permanent for the
    /// lifetime of the registry.
    pub fn mark_broadcast(&self) {
        self.registry.lock().broadcast.insert(self.attestation_id);
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.registry.lock().in_flight.remove(&self.attestation_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_is_exclusive() {
        let registry = InFlightRegistry::new();
        let guard = registry.claim(AttestationId(7)).unwrap();

        assert!(registry.is_in_flight(AttestationId(7)));
        assert!(matches!(
            registry.claim(AttestationId(7)),
            Err(RelayError::Duplicate { attestation_id }) if attestation_id == AttestationId(7)
        ));
        assert!(registry.claim(AttestationId(8)).is_ok());

        drop(guard);
        assert!(!registry.is_in_flight(AttestationId(7)));
        assert!(registry.claim(AttestationId(7)).is_ok());
    }

    #[test]
    fn test_broadcast_ids_cannot_be_reclaimed() {
        let registry = InFlightRegistry::new();
        let guard = registry.claim(AttestationId(3)).unwrap();
        guard.mark_broadcast();
        drop(guard);

        assert!(registry.was_broadcast(AttestationId(3)));
        assert!(registry.is_empty());
        assert!(registry.claim(AttestationId(3)).is_err());
    }

    #[test]
    fn test_clones_share_state() {
        let registry = InFlightRegistry::new();
        let other = registry.clone();

        let _guard = registry.claim(AttestationId(1)).unwrap();
        assert_eq!(other.len(), 1);
        assert!(other.claim(AttestationId(1)).is_err());
    }
}
