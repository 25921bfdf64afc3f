use super::{ReceiptSource, TransactionReceipt};
use async_trait::async_trait;
use extractor_core::{Error, Result};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::instrument;

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorObject>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

/// `eth_getTransactionReceipt` over plain JSON-RPC.
pub struct JsonRpcReceiptSource {
    client: reqwest::Client,
    url: String,
}

impl JsonRpcReceiptSource {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder().timeout(timeout).build()?,
            url: url.into(),
        })
    }
}

#[async_trait]
impl ReceiptSource for JsonRpcReceiptSource {
    #[instrument(skip(self))]
    async fn transaction_receipt(&self, transaction: &str) -> Result<Option<TransactionReceipt>> {
        let response = self
            .client
            .post(&self.url)
            .json(&json!({
                "jsonrpc": "2.0",
                "id": 1,
                "method": "eth_getTransactionReceipt",
                "params": [transaction],
            }))
            .send()
            .await?;

        let status = response.status();
        let content = response.text().await?;
        if status.as_u16() >= 400 {
            return Err(Error::request(&self.url, status.as_u16(), &content));
        }

        let reply: RpcResponse = serde_json::from_str(&content)?;
        if let Some(error) = reply.error {
            return Err(Error::Rpc {
                code: error.code,
                message: error.message,
            });
        }

        match reply.result {
            None | Some(Value::Null) => Ok(None),
            Some(receipt) => Ok(Some(serde_json::from_value(receipt)?)),
        }
    }
}
