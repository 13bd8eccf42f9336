//! Relayer configuration.

use anyhow::{bail, Context, Result};
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::coordinator::CoordinatorSettings;
use crate::relay::RelayTimeouts;
use crate::retry::RetryPolicy;

/// Verifier pallet used when `ZKV_VERIFIER_PALLET` is not set.
pub const DEFAULT_VERIFIER_PALLET: &str = "SettlementRisc0Pallet";

/// zkVerify connection settings.
#[derive(Clone)]
pub struct ZkVerifyConfig {
    /// Substrate RPC endpoint (ws/wss).
    pub rpc_url: String,
    /// Account seed phrase used to sign submissions.
    pub seed_phrase: String,
    /// Endpoint for `poe_proofPath`; derived from `rpc_url` when unset.
    pub poe_rpc_url: Option<String>,
    /// Pallet exposing `submit_proof`.
    pub verifier_pallet: String,
    /// Bound on submission → finalization → published attestation.
    pub finalization_timeout: Duration,
}

impl ZkVerifyConfig {
    /// HTTP endpoint for proof-of-existence queries.
    pub fn poe_endpoint(&self) -> String {
        crate::poe::http_endpoint(self.poe_rpc_url.as_deref().unwrap_or(&self.rpc_url))
    }
}

impl fmt::Debug for ZkVerifyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ZkVerifyConfig")
            .field("rpc_url", &self.rpc_url)
            .field("seed_phrase", &"<redacted>")
            .field("poe_rpc_url", &self.poe_rpc_url)
            .field("verifier_pallet", &self.verifier_pallet)
            .field("finalization_timeout", &self.finalization_timeout)
            .finish()
    }
}

/// Inclusion-proof retrieval settings.
#[derive(Clone, Debug)]
pub struct RetrievalConfig {
    pub retry: RetryPolicy,
    /// Bound on a single `poe_proofPath` call.
    pub rpc_timeout: Duration,
}

/// Destination (EVM) chain settings.
#[derive(Clone)]
pub struct DestinationConfig {
    pub rpc_url: String,
    /// Hex secret key of the relaying account.
    pub secret_key: String,
    /// Contract emitting `AttestationPosted`.
    pub zkverify_contract: String,
    /// Application contract exposing `proveGameWinner`.
    pub app_contract: String,
    /// Interval for filter and receipt polling.
    pub poll_interval: Duration,
}

impl fmt::Debug for DestinationConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DestinationConfig")
            .field("rpc_url", &self.rpc_url)
            .field("secret_key", &"<redacted>")
            .field("zkverify_contract", &self.zkverify_contract)
            .field("app_contract", &self.app_contract)
            .field("poll_interval", &self.poll_interval)
            .finish()
    }
}

/// Relayer configuration.
#[derive(Clone, Debug)]
pub struct RelayerConfig {
    pub zkverify: ZkVerifyConfig,
    pub retrieval: RetrievalConfig,
    pub destination: DestinationConfig,
    pub timeouts: RelayTimeouts,
    /// Where to persist the checkpoint of a published attestation.
    pub checkpoint_path: Option<PathBuf>,
}

impl RelayerConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &str| -> Result<String> {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .with_context(|| format!("{} must be set", key))
        };
        let secs = |key: &str, default: u64| -> Result<Duration> {
            parse_or(&lookup, key, default).map(Duration::from_secs)
        };
        let millis = |key: &str, default: u64| -> Result<Duration> {
            parse_or(&lookup, key, default).map(Duration::from_millis)
        };

        let zkverify = ZkVerifyConfig {
            rpc_url: required("ZKV_RPC_URL")?,
            seed_phrase: required("ZKV_SEED_PHRASE")?,
            poe_rpc_url: lookup("ZKV_POE_RPC_URL"),
            verifier_pallet: lookup("ZKV_VERIFIER_PALLET")
                .unwrap_or_else(|| DEFAULT_VERIFIER_PALLET.to_string()),
            finalization_timeout: secs("ZKV_FINALIZATION_TIMEOUT_SECS", 900)?,
        };

        let max_attempts: u32 = parse_or(&lookup, "POE_MAX_ATTEMPTS", 5)?;
        if max_attempts == 0 {
            bail!("POE_MAX_ATTEMPTS must be at least 1");
        }
        let retrieval = RetrievalConfig {
            retry: RetryPolicy {
                max_attempts,
                base_delay: millis("POE_BASE_DELAY_MS", 1_000)?,
                max_delay: millis("POE_MAX_DELAY_MS", 30_000)?,
                ..RetryPolicy::default()
            },
            rpc_timeout: secs("POE_RPC_TIMEOUT_SECS", 30)?,
        };

        let destination = DestinationConfig {
            rpc_url: required("ETH_RPC_URL")?,
            secret_key: required("ETH_SECRET_KEY")?,
            zkverify_contract: required("ETH_ZKVERIFY_CONTRACT_ADDRESS")?,
            app_contract: required("ETH_APP_CONTRACT_ADDRESS")?,
            poll_interval: millis("ETH_POLL_INTERVAL_MS", 2_000)?,
        };

        let timeouts = RelayTimeouts {
            attestation_root: secs("ETH_ATTESTATION_TIMEOUT_SECS", 1_800)?,
            broadcast: secs("ETH_BROADCAST_TIMEOUT_SECS", 60)?,
            confirmation: secs("ETH_CONFIRMATION_TIMEOUT_SECS", 300)?,
            acknowledgment: secs("ETH_ACK_TIMEOUT_SECS", 300)?,
        };

        Ok(Self {
            zkverify,
            retrieval,
            destination,
            timeouts,
            checkpoint_path: lookup("RELAY_CHECKPOINT_PATH").map(PathBuf::from),
        })
    }

    /// Settings for the relay coordinator.
    pub fn coordinator_settings(&self) -> CoordinatorSettings {
        CoordinatorSettings {
            finalization_timeout: self.zkverify.finalization_timeout,
            retry: self.retrieval.retry.clone(),
            rpc_timeout: self.retrieval.rpc_timeout,
            timeouts: self.timeouts.clone(),
            checkpoint_path: self.checkpoint_path.clone(),
        }
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{} has an invalid value: {:?}", key, raw)),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn base_env() -> HashMap<&'static str, &'static str> {
        HashMap::from([
            ("ZKV_RPC_URL", "wss://testnet-rpc.zkverify.io"),
            ("ZKV_SEED_PHRASE", "bottom drive obey lake curtain smoke basket hold race lonely fit walk"),
            ("ETH_RPC_URL", "http://localhost:8545"),
            ("ETH_SECRET_KEY", "0x59c6995e998f97a5a0044966f0945389dc9e86dae88c7a8412f4603b6b78690d"),
            ("ETH_ZKVERIFY_CONTRACT_ADDRESS", "0x5FbDB2315678afecb367f032d93F642f64180aa3"),
            ("ETH_APP_CONTRACT_ADDRESS", "0xe7f1725E7734CE288F8367e1Bb143E90bb3F0512"),
        ])
    }

    fn load(env: &HashMap<&'static str, &'static str>) -> Result<RelayerConfig> {
        RelayerConfig::from_lookup(|key| env.get(key).map(|v| v.to_string()))
    }

    #[test]
    fn test_defaults() {
        let config = load(&base_env()).unwrap();

        assert_eq!(config.zkverify.verifier_pallet, DEFAULT_VERIFIER_PALLET);
        assert_eq!(config.zkverify.finalization_timeout, Duration::from_secs(900));
        assert_eq!(config.retrieval.retry.max_attempts, 5);
        assert_eq!(config.retrieval.retry.base_delay, Duration::from_secs(1));
        assert_eq!(config.destination.poll_interval, Duration::from_secs(2));
        assert_eq!(config.timeouts.attestation_root, Duration::from_secs(1_800));
        assert_eq!(config.checkpoint_path, None);
        assert_eq!(config.zkverify.poe_endpoint(), "https://testnet-rpc.zkverify.io");
    }

    #[test]
    fn test_missing_required_value() {
        let mut env = base_env();
        env.remove("ETH_APP_CONTRACT_ADDRESS");

        let err = load(&env).unwrap_err();
        assert!(err.to_string().contains("ETH_APP_CONTRACT_ADDRESS"));
    }

    #[test]
    fn test_overrides_and_invalid_numbers() {
        let mut env = base_env();
        env.insert("POE_MAX_ATTEMPTS", "3");
        env.insert("ZKV_POE_RPC_URL", "http://localhost:9944");
        env.insert("RELAY_CHECKPOINT_PATH", "/tmp/relay.json");
        let config = load(&env).unwrap();
        assert_eq!(config.retrieval.retry.max_attempts, 3);
        assert_eq!(config.zkverify.poe_endpoint(), "http://localhost:9944");
        assert_eq!(config.checkpoint_path, Some(PathBuf::from("/tmp/relay.json")));

        env.insert("POE_MAX_ATTEMPTS", "many");
        assert!(load(&env).is_err());

        env.insert("POE_MAX_ATTEMPTS", "0");
        assert!(load(&env).is_err());
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let config = load(&base_env()).unwrap();
        let rendered = format!("{:?}", config);
        assert!(!rendered.contains("bottom drive"));
        assert!(!rendered.contains("59c6995e"));
        assert!(rendered.contains("<redacted>"));
    }
}
