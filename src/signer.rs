//! Payout signer client.
//!
//! The signer service holds the delegated signing material for funder
//! access keys. Before any automated transfer it re-verifies the
//! on-chain authorization, so everything this service caches about
//! limits is advisory. Speaks JSON-RPC 2.0 over HTTP.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SignerError {
    #[error("signer transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("signer rejected the call ({code}): {message}")]
    Rpc { code: i64, message: String },
    #[error("signer returned an empty result")]
    EmptyResult,
}

/// One transfer to sign and broadcast.
#[derive(Debug, Clone, Serialize)]
pub struct TransferRequest {
    /// Payout id, echoed back by the signer for reconciliation.
    pub reference: String,
    pub key_id: String,
    pub token_address: String,
    pub amount: i64,
    pub recipient_wallet: String,
}

#[async_trait]
pub trait PayoutSigner: Send + Sync {
    /// Remaining authorized spend for the key as the chain sees it.
    async fn authorized_remaining(
        &self,
        key_id: &str,
        token_address: &str,
    ) -> std::result::Result<i64, SignerError>;

    /// Sign and broadcast a transfer; returns the transaction hash.
    async fn sign_transfer(
        &self,
        request: &TransferRequest,
    ) -> std::result::Result<String, SignerError>;
}

#[derive(Serialize)]
struct RpcRequest<'a, P: Serialize> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: P,
}

#[derive(Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcErrorBody>,
}

#[derive(Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

pub struct RpcSigner {
    client: reqwest::Client,
    url: String,
    next_id: AtomicU64,
}

impl RpcSigner {
    pub fn new(url: String, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url,
            next_id: AtomicU64::new(1),
        })
    }

    async fn call<P: Serialize, T: DeserializeOwned>(
        &self,
        method: &str,
        params: P,
    ) -> std::result::Result<T, SignerError> {
        let request = RpcRequest {
            jsonrpc: "2.0",
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        };
        let response: RpcResponse<T> = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await?
            .json()
            .await?;
        if let Some(err) = response.error {
            return Err(SignerError::Rpc {
                code: err.code,
                message: err.message,
            });
        }
        response.result.ok_or(SignerError::EmptyResult)
    }
}

#[async_trait]
impl PayoutSigner for RpcSigner {
    async fn authorized_remaining(
        &self,
        key_id: &str,
        token_address: &str,
    ) -> std::result::Result<i64, SignerError> {
        #[derive(Serialize)]
        struct Params<'a> {
            key_id: &'a str,
            token_address: &'a str,
        }
        #[derive(Deserialize)]
        struct Remaining {
            remaining: i64,
        }
        let result: Remaining = self
            .call(
                "spend_limit_remaining",
                Params {
                    key_id,
                    token_address,
                },
            )
            .await?;
        Ok(result.remaining)
    }

    async fn sign_transfer(
        &self,
        request: &TransferRequest,
    ) -> std::result::Result<String, SignerError> {
        #[derive(Deserialize)]
        struct Signed {
            tx_hash: String,
        }
        let result: Signed = self.call("sign_transfer", request).await?;
        Ok(result.tx_hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rpc_envelope_shape() {
        let req = RpcRequest {
            jsonrpc: "2.0",
            id: 7,
            method: "sign_transfer",
            params: TransferRequest {
                reference: "p-1".into(),
                key_id: "key_abc".into(),
                token_address: "0xusdc".into(),
                amount: 1500,
                recipient_wallet: "0xcontributor".into(),
            },
        };
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["jsonrpc"], "2.0");
        assert_eq!(value["method"], "sign_transfer");
        assert_eq!(value["params"]["amount"], 1500);
        assert_eq!(value["params"]["reference"], "p-1");
    }

    #[test]
    fn test_rpc_error_and_result_parsing() {
        let ok: RpcResponse<serde_json::Value> =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":1,"result":{"tx_hash":"0xabc"}}"#)
                .unwrap();
        assert!(ok.error.is_none());
        assert_eq!(ok.result.unwrap()["tx_hash"], "0xabc");

        let err: RpcResponse<serde_json::Value> = serde_json::from_str(
            r#"{"jsonrpc":"2.0","id":2,"error":{"code":-32001,"message":"key revoked"}}"#,
        )
        .unwrap();
        let body = err.error.unwrap();
        assert_eq!(body.code, -32001);
        assert_eq!(body.message, "key revoked");
    }
}
