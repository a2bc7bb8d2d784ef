//! Chain client: confirmed-transaction lookup against the configured RPC
//! endpoint.
//!
//! The gateway never constructs or signs transactions; all it needs from the
//! chain is whether a given signature landed, whether it executed
//! successfully, and how token balances moved. The lookup therefore speaks
//! raw JSON-RPC (`getTransaction` at `confirmed` commitment) and
//! deserializes only the meta fields the verifier reads.

use serde::Deserialize;
use serde_json::{Value, json};
use std::time::Duration;

/// Timeout for a single transaction lookup.
const LOOKUP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("chain RPC request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("chain RPC returned an error: {0}")]
    Rpc(String),
    #[error("chain RPC reply not parseable: {0}")]
    Decode(#[from] serde_json::Error),
}

/// One row of a transaction's pre/post token-balance tables.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenBalance {
    pub account_index: u8,
    pub mint: String,
    pub ui_token_amount: TokenAmountInfo,
    #[serde(default)]
    pub owner: Option<String>,
}

impl TokenBalance {
    /// Balance in base units; malformed amounts read as zero.
    pub fn base_units(&self) -> i128 {
        self.ui_token_amount.amount.parse::<i128>().unwrap_or(0)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenAmountInfo {
    /// Base-unit amount as a decimal string, e.g. `"1000000"`.
    pub amount: String,
}

/// The verifier's view of a confirmed transaction.
#[derive(Debug, Clone)]
pub struct ConfirmedTransaction {
    /// Whether the transaction's meta reports an execution error.
    pub failed: bool,
    pub pre_token_balances: Vec<TokenBalance>,
    pub post_token_balances: Vec<TokenBalance>,
}

#[derive(Debug, Clone)]
pub struct ChainClient {
    rpc_url: String,
    http: reqwest::Client,
}

impl ChainClient {
    pub fn new(rpc_url: impl Into<String>) -> Self {
        ChainClient {
            rpc_url: rpc_url.into(),
            http: reqwest::Client::new(),
        }
    }

    /// Fetches a transaction at `confirmed` commitment. `Ok(None)` means the
    /// chain does not know the signature (yet).
    pub async fn transaction(
        &self,
        signature: &str,
    ) -> Result<Option<ConfirmedTransaction>, ChainError> {
        let request = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "getTransaction",
            "params": [
                signature,
                {
                    "commitment": "confirmed",
                    "maxSupportedTransactionVersion": 0,
                    "encoding": "json",
                },
            ],
        });

        let response = self
            .http
            .post(&self.rpc_url)
            .timeout(LOOKUP_TIMEOUT)
            .json(&request)
            .send()
            .await?;
        let reply: RpcReply = response.json().await?;

        if let Some(error) = reply.error {
            return Err(ChainError::Rpc(error.to_string()));
        }
        let Some(raw) = reply.result else {
            return Ok(None);
        };
        let meta = raw.meta.unwrap_or_default();
        Ok(Some(ConfirmedTransaction {
            failed: meta.err.map(|err| !err.is_null()).unwrap_or(false),
            pre_token_balances: meta.pre_token_balances.unwrap_or_default(),
            post_token_balances: meta.post_token_balances.unwrap_or_default(),
        }))
    }
}

#[derive(Deserialize)]
struct RpcReply {
    #[serde(default)]
    result: Option<RawTransaction>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Deserialize)]
struct RawTransaction {
    #[serde(default)]
    meta: Option<RawMeta>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct RawMeta {
    #[serde(default)]
    err: Option<Value>,
    #[serde(default)]
    pre_token_balances: Option<Vec<TokenBalance>>,
    #[serde(default)]
    post_token_balances: Option<Vec<TokenBalance>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn balance(account_index: u8, mint: &str, amount: &str) -> Value {
        json!({
            "accountIndex": account_index,
            "mint": mint,
            "owner": "owner111",
            "uiTokenAmount": {
                "amount": amount,
                "decimals": 6,
                "uiAmountString": "1.0",
            },
        })
    }

    #[tokio::test]
    async fn parses_token_balance_tables() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/")
            .with_header("content-type", "application/json")
            .with_body(
                json!({
                    "jsonrpc": "2.0",
                    "id": 1,
                    "result": {
                        "slot": 1,
                        "meta": {
                            "err": null,
                            "preTokenBalances": [balance(1, "MintA", "1000000")],
                            "postTokenBalances": [balance(1, "MintA", "1001000")],
                        },
                    },
                })
                .to_string(),
            )
            .create_async()
            .await;

        let client = ChainClient::new(server.url());
        let tx = client
            .transaction(&"5".repeat(88))
            .await
            .unwrap()
            .expect("transaction found");
        assert!(!tx.failed);
        assert_eq!(tx.pre_token_balances[0].base_units(), 1_000_000);
        assert_eq!(tx.post_token_balances[0].base_units(), 1_001_000);
        assert_eq!(tx.post_token_balances[0].mint, "MintA");
    }

    #[tokio::test]
    async fn null_result_means_not_found() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/")
            .with_body(r#"{"jsonrpc":"2.0","id":1,"result":null}"#)
            .create_async()
            .await;

        let client = ChainClient::new(server.url());
        assert!(client.transaction(&"5".repeat(88)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn execution_failure_is_surfaced() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/")
            .with_body(
                json!({
                    "jsonrpc": "2.0",
                    "id": 1,
                    "result": {
                        "slot": 1,
                        "meta": { "err": {"InstructionError": [0, "Custom"]} },
                    },
                })
                .to_string(),
            )
            .create_async()
            .await;

        let client = ChainClient::new(server.url());
        let tx = client.transaction(&"5".repeat(88)).await.unwrap().unwrap();
        assert!(tx.failed);
        assert!(tx.pre_token_balances.is_empty());
    }

    #[tokio::test]
    async fn rpc_error_replies_become_chain_errors() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/")
            .with_body(r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32005,"message":"node is behind"}}"#)
            .create_async()
            .await;

        let client = ChainClient::new(server.url());
        assert!(matches!(
            client.transaction(&"5".repeat(88)).await,
            Err(ChainError::Rpc(_))
        ));
    }
}
