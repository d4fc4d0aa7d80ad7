//! Read-only access to the Solana ledger over JSON-RPC.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("RPC transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected RPC response: {0}")]
    Decode(String),
}

/// One entry of an address's transaction history, newest first.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureInfo {
    pub signature: String,
    /// Unix seconds; absent for very recent or pruned entries.
    #[serde(default)]
    pub block_time: Option<i64>,
    /// Non-null when the transaction failed on chain.
    #[serde(default)]
    pub err: Option<Value>,
}

/// The parts of a confirmed transaction needed to measure a transfer.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerTransaction {
    pub account_keys: Vec<String>,
    pub pre_balances: Vec<u64>,
    pub post_balances: Vec<u64>,
    pub failed: bool,
}

impl LedgerTransaction {
    /// Net lamports credited to `address`, if it takes part in the transaction.
    pub fn received_lamports(&self, address: &str) -> Option<i64> {
        let index = self.account_keys.iter().position(|k| k == address)?;
        let pre = *self.pre_balances.get(index).unwrap_or(&0) as i64;
        let post = *self.post_balances.get(index).unwrap_or(&0) as i64;
        Some(post - pre)
    }
}

pub trait Ledger: Send + Sync {
    fn recent_signatures(
        &self,
        address: &str,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<SignatureInfo>, LedgerError>> + Send;

    /// `None` when the node does not (yet) know the transaction.
    fn transaction(
        &self,
        signature: &str,
    ) -> impl Future<Output = Result<Option<LedgerTransaction>, LedgerError>> + Send;

    fn balance(&self, address: &str) -> impl Future<Output = Result<u64, LedgerError>> + Send;
}

/// JSON-RPC client for a Solana node.
pub struct SolanaRpc {
    client: Client,
    url: String,
    next_id: AtomicU64,
}

#[derive(Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
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

#[derive(Deserialize)]
struct BalanceResult {
    value: u64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransactionResult {
    meta: Option<TransactionMeta>,
    transaction: TransactionBody,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransactionMeta {
    #[serde(default)]
    err: Option<Value>,
    pre_balances: Vec<u64>,
    post_balances: Vec<u64>,
}

#[derive(Deserialize)]
struct TransactionBody {
    message: TransactionMessage,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransactionMessage {
    account_keys: Vec<AccountKey>,
}

/// `jsonParsed` encoding yields objects; other encodings plain strings.
#[derive(Deserialize)]
#[serde(untagged)]
enum AccountKey {
    Parsed { pubkey: String },
    Plain(String),
}

impl AccountKey {
    fn into_pubkey(self) -> String {
        match self {
            AccountKey::Parsed { pubkey } => pubkey,
            AccountKey::Plain(key) => key,
        }
    }
}

impl SolanaRpc {
    pub fn new(url: impl Into<String>) -> Result<Self, LedgerError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
            next_id: AtomicU64::new(1),
        })
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<Option<T>, LedgerError> {
        let request = RpcRequest {
            jsonrpc: "2.0",
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        };
        let response = self.client.post(&self.url).json(&request).send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(LedgerError::Rpc {
                code: i64::from(status.as_u16()),
                message,
            });
        }

        let body = response
            .json::<RpcResponse<T>>()
            .await
            .map_err(|e| LedgerError::Decode(format!("{method}: {e}")))?;
        if let Some(error) = body.error {
            return Err(LedgerError::Rpc {
                code: error.code,
                message: error.message,
            });
        }
        Ok(body.result)
    }
}

impl Ledger for SolanaRpc {
    async fn recent_signatures(
        &self,
        address: &str,
        limit: usize,
    ) -> Result<Vec<SignatureInfo>, LedgerError> {
        let result = self
            .call::<Vec<SignatureInfo>>(
                "getSignaturesForAddress",
                json!([address, { "limit": limit, "commitment": "confirmed" }]),
            )
            .await?;
        Ok(result.unwrap_or_default())
    }

    async fn transaction(&self, signature: &str) -> Result<Option<LedgerTransaction>, LedgerError> {
        let result = self
            .call::<TransactionResult>(
                "getTransaction",
                json!([signature, {
                    "encoding": "jsonParsed",
                    "commitment": "confirmed",
                    "maxSupportedTransactionVersion": 0
                }]),
            )
            .await?;

        let Some(tx) = result else {
            return Ok(None);
        };
        let Some(meta) = tx.meta else {
            return Ok(None);
        };
        Ok(Some(LedgerTransaction {
            account_keys: tx
                .transaction
                .message
                .account_keys
                .into_iter()
                .map(AccountKey::into_pubkey)
                .collect(),
            pre_balances: meta.pre_balances,
            post_balances: meta.post_balances,
            failed: meta.err.is_some(),
        }))
    }

    async fn balance(&self, address: &str) -> Result<u64, LedgerError> {
        let result = self
            .call::<BalanceResult>("getBalance", json!([address]))
            .await?
            .ok_or_else(|| LedgerError::Decode("getBalance returned no result".into()))?;
        Ok(result.value)
    }
}
