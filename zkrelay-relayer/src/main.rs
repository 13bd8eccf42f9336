//! zkrelay-relayer
//!
//! Submits a proof to zkVerify and relays its attestation to an EVM
//! application contract.
//!
//! Usage:
//!   zkrelay-relayer <proof-bundle.json>
//!   zkrelay-relayer --resume <checkpoint.json>

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::{info, warn};

use zkrelay_common::{AttestationCheckpoint, ProofBundle};
use zkrelay_relayer::{
    AttestationSession, DestinationChain, EvmDestination, PoeRpcClient, RelayCoordinator,
    RelayerConfig, ZkVerifySession,
};

const USAGE: &str = "usage: zkrelay-relayer <proof-bundle.json> | --resume <checkpoint.json>";

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Relay(PathBuf),
    Resume(PathBuf),
}

enum Input {
    Bundle(ProofBundle),
    Checkpoint(AttestationCheckpoint),
}

fn parse_args<I: IntoIterator<Item = String>>(args: I) -> Result<Command> {
    let mut args = args.into_iter();
    let command = match args.next().as_deref() {
        Some("--resume") => match args.next() {
            Some(path) => Command::Resume(PathBuf::from(path)),
            None => bail!("--resume needs a checkpoint file\n{}", USAGE),
        },
        Some("-h") | Some("--help") | None => bail!(USAGE),
        Some(path) => Command::Relay(PathBuf::from(path)),
    };

    if let Some(extra) = args.next() {
        bail!("unexpected argument: {}\n{}", extra, USAGE);
    }
    Ok(command)
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "zkrelay_relayer=info".into());
    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn read_file(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let command = parse_args(std::env::args().skip(1))?;
    let config = RelayerConfig::from_env()?;

    info!("Starting zkrelay-relayer");
    info!("zkVerify RPC: {}", config.zkverify.rpc_url);
    info!("Destination RPC: {}", config.destination.rpc_url);

    // Inputs are validated before any connection is opened.
    let input = match &command {
        Command::Relay(path) => {
            Input::Bundle(ProofBundle::from_json(&read_file(path)?).context("Invalid proof bundle")?)
        }
        Command::Resume(path) => Input::Checkpoint(
            AttestationCheckpoint::from_json(&read_file(path)?).context("Invalid checkpoint")?,
        ),
    };

    let session = Arc::new(ZkVerifySession::open(&config.zkverify).await?);
    let poe = Arc::new(PoeRpcClient::new(
        config.zkverify.poe_endpoint(),
        config.retrieval.rpc_timeout,
    )?);
    let destination = Arc::new(EvmDestination::connect(&config.destination).await?);
    if !destination.health_check().await? {
        bail!("Destination chain {} is not healthy", destination.chain_name());
    }

    let coordinator = RelayCoordinator::new(
        session.clone(),
        poe,
        destination,
        config.coordinator_settings(),
    );

    let run = async {
        match input {
            Input::Bundle(bundle) => coordinator.relay(bundle).await,
            Input::Checkpoint(checkpoint) => {
                info!(attestation_id = %checkpoint.attestation_id, "Resuming from checkpoint");
                coordinator.resume(checkpoint).await
            }
        }
    };

    let outcome = tokio::select! {
        outcome = run => outcome,
        _ = tokio::signal::ctrl_c() => {
            warn!("Shutting down relayer...");
            session.close().await;
            bail!("Interrupted");
        }
    };
    session.close().await;

    let outcome = outcome?;
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_relay_and_resume() {
        assert_eq!(
            parse_args(args(&["bundle.json"])).unwrap(),
            Command::Relay(PathBuf::from("bundle.json"))
        );
        assert_eq!(
            parse_args(args(&["--resume", "checkpoint.json"])).unwrap(),
            Command::Resume(PathBuf::from("checkpoint.json"))
        );
    }

    #[test]
    fn test_parse_rejects_bad_usage() {
        assert!(parse_args(args(&[])).is_err());
        assert!(parse_args(args(&["--resume"])).is_err());
        assert!(parse_args(args(&["a.json", "b.json"])).is_err());
    }
}
