//! Secondary revenue from transaction receipts.
//!
//! A sale pays the treasury through token transfer logs whose third topic
//! (the indexed recipient) is the treasury address. The amounts of those
//! logs are summed and scaled from wei.

pub mod rpc;

use crate::model::Revenue;
use async_trait::async_trait;
use extractor_core::backoff::{retry_with_backoff, RetryPolicy};
use extractor_core::{Error, Result};
use bigdecimal::num_bigint::BigInt;
use bigdecimal::BigDecimal;
use serde::Deserialize;
use tracing::{debug, instrument};

/// Decimal places between wei and whole tokens.
pub const TOKEN_SCALE: i64 = 18;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TransactionReceipt {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub logs: Vec<ReceiptLog>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReceiptLog {
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub data: String,
}

impl TransactionReceipt {
    fn succeeded(&self) -> bool {
        matches!(self.status.as_deref(), Some(status) if status != "0x0")
    }
}

#[async_trait]
pub trait ReceiptSource: Send + Sync {
    /// `Ok(None)` while the node does not know the transaction yet.
    async fn transaction_receipt(&self, transaction: &str) -> Result<Option<TransactionReceipt>>;
}

#[async_trait]
pub trait RevenueLookup: Send + Sync {
    async fn revenue_for(&self, transaction: &str) -> Result<Revenue>;
}

/// Left-pad a 20-byte address into the 32-byte topic form.
pub fn address_topic(address: &str) -> String {
    let hex = address.trim_start_matches("0x").to_ascii_lowercase();
    format!("0x{hex:0>64}")
}

/// Log data as an unsigned big-endian integer of any width.
fn parse_quantity(data: &str) -> Result<BigInt> {
    let hex = data.trim_start_matches("0x");
    if hex.is_empty() {
        return Ok(BigInt::default());
    }
    BigInt::parse_bytes(hex.as_bytes(), 16)
        .ok_or_else(|| Error::Validation(format!("invalid log data {data}")))
}

pub fn revenue_from_receipt(receipt: &TransactionReceipt, treasury_topic: &str) -> Result<Revenue> {
    if !receipt.succeeded() {
        return Ok(Revenue::empty());
    }

    let mut matched = 0usize;
    let mut total = BigInt::default();
    let mut token_address = None;

    for log in receipt
        .logs
        .iter()
        .filter(|log| log.topics.get(2).map_or(false, |topic| topic.eq_ignore_ascii_case(treasury_topic)))
    {
        matched += 1;
        if let Some(address) = log.address.as_deref().filter(|a| !a.is_empty()) {
            token_address = Some(address.to_string());
        }
        total += parse_quantity(&log.data)?;
    }

    if matched == 0 {
        return Ok(Revenue::empty());
    }

    let amount = BigDecimal::new(total, TOKEN_SCALE).normalized();

    Ok(Revenue {
        amount,
        token_address,
    })
}

/// Receipt fetch bounded by the "not mined yet" retry policy, followed by
/// the treasury log scan.
pub struct ReceiptLookup<S> {
    source: S,
    treasury_topic: String,
    policy: RetryPolicy,
}

impl<S: ReceiptSource> ReceiptLookup<S> {
    pub fn new(source: S, treasury_address: &str) -> Self {
        Self {
            source,
            treasury_topic: address_topic(treasury_address),
            policy: RetryPolicy::receipt_pending(),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }
}

#[async_trait]
impl<S: ReceiptSource> RevenueLookup for ReceiptLookup<S> {
    #[instrument(skip(self))]
    async fn revenue_for(&self, transaction: &str) -> Result<Revenue> {
        let source = &self.source;
        let receipt = retry_with_backoff(
            || async move {
                source
                    .transaction_receipt(transaction)
                    .await?
                    .ok_or_else(|| Error::ReceiptPending {
                        transaction: transaction.to_string(),
                    })
            },
            &self.policy,
            "transaction_receipt",
        )
        .await?;

        let revenue = revenue_from_receipt(&receipt, &self.treasury_topic)?;
        debug!(
            amount = %revenue.amount_string(),
            token = ?revenue.token_address,
            "Resolved secondary revenue"
        );
        Ok(revenue)
    }
}
