//! zkVerify proof-of-existence RPC client.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use zkrelay_common::{AttestationId, LeafDigest, RawProofPath};

use crate::retriever::{ProofPathQuery, QueryError};

const METHOD_NOT_FOUND: i64 = -32601;
const INVALID_PARAMS: i64 = -32602;

/// Map a websocket RPC URL onto its HTTP counterpart.
pub fn http_endpoint(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("wss://") {
        format!("https://{}", rest)
    } else if let Some(rest) = url.strip_prefix("ws://") {
        format!("http://{}", rest)
    } else {
        url.to_string()
    }
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<RawProofPath>,
    #[serde(default)]
    error: Option<RpcErrorObject>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

/// JSON-RPC client for `poe_proofPath`.
#[derive(Debug, Clone)]
pub struct PoeRpcClient {
    client: reqwest::Client,
    endpoint: String,
}

impl PoeRpcClient {
    pub fn new(endpoint: impl Into<String>, request_timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            client,
            endpoint: http_endpoint(&endpoint.into()),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

fn classify_status(status: reqwest::StatusCode, body: &str) -> QueryError {
    let message = format!("HTTP {}: {}", status, body.trim());
    if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        QueryError::Transient(message)
    } else {
        QueryError::Permanent(message)
    }
}

fn classify_rpc_error(error: RpcErrorObject) -> QueryError {
    let message = format!("RPC error {}: {}", error.code, error.message);
    match error.code {
        METHOD_NOT_FOUND | INVALID_PARAMS => QueryError::Permanent(message),
        _ => QueryError::Transient(message),
    }
}

fn parse_response(body: &str) -> Result<RawProofPath, QueryError> {
    let response: RpcResponse = serde_json::from_str(body)
        .map_err(|e| QueryError::Permanent(format!("malformed response: {}", e)))?;

    if let Some(error) = response.error {
        return Err(classify_rpc_error(error));
    }

    response
        .result
        .ok_or_else(|| QueryError::Permanent("response carries no proof path".to_string()))
}

#[async_trait]
impl ProofPathQuery for PoeRpcClient {
    async fn proof_path(
        &self,
        attestation_id: AttestationId,
        leaf_digest: LeafDigest,
    ) -> Result<RawProofPath, QueryError> {
        let request = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "poe_proofPath",
            "params": [attestation_id.get(), leaf_digest.to_hex()],
        });

        debug!(endpoint = %self.endpoint, attestation_id = %attestation_id, "poe_proofPath");

        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| QueryError::Transient(format!("request failed: {}", e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| QueryError::Transient(format!("reading response failed: {}", e)))?;

        if !status.is_success() {
            return Err(classify_status(status, &body));
        }

        parse_response(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_endpoint_mapping() {
        assert_eq!(http_endpoint("wss://testnet-rpc.zkverify.io"), "https://testnet-rpc.zkverify.io");
        assert_eq!(http_endpoint("ws://127.0.0.1:9944"), "http://127.0.0.1:9944");
        assert_eq!(http_endpoint("http://127.0.0.1:9944"), "http://127.0.0.1:9944");
    }

    #[test]
    fn test_parse_success() {
        let body = r#"{
            "jsonrpc": "2.0",
            "id": 1,
            "result": {
                "root": "0xfeed",
                "proof": ["0x01", "0x02"],
                "numberOfLeaves": 4,
                "leafIndex": 2,
                "leaf": "0xabc"
            }
        }"#;

        let raw = parse_response(body).unwrap();
        assert_eq!(raw.proof, vec!["0x01", "0x02"]);
        assert_eq!(raw.number_of_leaves, 4);
        assert_eq!(raw.leaf_index, 2);
    }

    #[test]
    fn test_rpc_errors_are_classified() {
        let unknown_method = r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32601,"message":"Method not found"}}"#;
        assert!(!parse_response(unknown_method).unwrap_err().is_transient());

        let internal = r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32000,"message":"busy"}}"#;
        assert!(parse_response(internal).unwrap_err().is_transient());

        let empty = r#"{"jsonrpc":"2.0","id":1,"result":null}"#;
        assert!(!parse_response(empty).unwrap_err().is_transient());

        assert!(!parse_response("<html>").unwrap_err().is_transient());
    }

    #[test]
    fn test_http_status_classification() {
        assert!(classify_status(reqwest::StatusCode::SERVICE_UNAVAILABLE, "").is_transient());
        assert!(classify_status(reqwest::StatusCode::TOO_MANY_REQUESTS, "").is_transient());
        assert!(!classify_status(reqwest::StatusCode::NOT_FOUND, "").is_transient());
    }
}
