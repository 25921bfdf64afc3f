//! Stream registry. Every stream is a value: query, schema and pagination
//! strategy are data handed to the one extraction engine.

use crate::cursor::Pagination;
use crate::model::Record;
use extractor_core::backoff::RetryPolicy;
use extractor_core::config::EndpointsConfig;
use extractor_core::{Error, Result};
use serde_json::{json, Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Ice,
    Quickswap,
    Marketplace,
}

impl Endpoint {
    pub fn url<'a>(&self, endpoints: &'a EndpointsConfig) -> &'a str {
        match self {
            Endpoint::Ice => &endpoints.ice_api_url,
            Endpoint::Quickswap => &endpoints.quickswap_api_url,
            Endpoint::Marketplace => &endpoints.marketplace_api_url,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum FieldType {
    String,
    Integer,
    Object(&'static [Property]),
}

#[derive(Debug, Clone, Copy)]
pub struct Property {
    pub name: &'static str,
    pub kind: FieldType,
}

const fn prop(name: &'static str, kind: FieldType) -> Property {
    Property { name, kind }
}

/// JSON Schema for a property list; every field is nullable.
pub fn json_schema(properties: &[Property]) -> Value {
    let fields: Map<String, Value> = properties
        .iter()
        .map(|p| {
            let schema = match p.kind {
                FieldType::String => json!({ "type": ["string", "null"] }),
                FieldType::Integer => json!({ "type": ["integer", "null"] }),
                FieldType::Object(inner) => {
                    let mut schema = json_schema(inner);
                    schema["type"] = json!(["object", "null"]);
                    schema
                }
            };
            (p.name.to_string(), schema)
        })
        .collect();

    json!({ "type": "object", "properties": fields })
}

/// Per-record type fix-up applied before emission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Coercion {
    /// Numeric string (subgraph `BigInt`/`BigDecimal` ids, levels, dates) to integer.
    Integer(&'static str),
}

impl Coercion {
    /// Idempotent: an already-coerced field is left alone.
    pub fn apply(&self, record: &mut Record) -> Result<()> {
        match self {
            Coercion::Integer(field) => {
                let Some(value) = record.get_mut(*field) else {
                    return Ok(());
                };
                match value {
                    Value::Null | Value::Number(_) => {}
                    Value::String(s) => {
                        let parsed = s.trim().parse::<i64>().map_err(|e| {
                            Error::Validation(format!("field `{field}` is not an integer ({s:?}): {e}"))
                        })?;
                        *value = Value::from(parsed);
                    }
                    other => {
                        return Err(Error::Validation(format!(
                            "field `{field}` cannot be coerced to integer: {other}"
                        )))
                    }
                }
            }
        }
        Ok(())
    }
}

/// Look up secondary revenue for the transaction named by `key_field`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Enrichment {
    pub key_field: &'static str,
}

pub const PAYMENT_AMOUNT_FIELD: &str = "paymentTokenAmount";
pub const PAYMENT_ADDRESS_FIELD: &str = "paymentTokenAddress";

#[derive(Debug, Clone)]
pub struct StreamDefinition {
    pub name: &'static str,
    pub primary_keys: &'static [&'static str],
    pub endpoint: Endpoint,
    pub pagination: Pagination,
    pub object_returned: &'static str,
    pub query: &'static str,
    pub schema: &'static [Property],
    pub coercions: &'static [Coercion],
    pub enrichment: Option<Enrichment>,
    pub retry: RetryPolicy,
}

impl StreamDefinition {
    pub fn post_process(&self, record: &mut Record) -> Result<()> {
        for coercion in self.coercions {
            coercion.apply(record)?;
        }
        Ok(())
    }

    pub fn json_schema(&self) -> Value {
        json_schema(self.schema)
    }

    /// Singer catalog entry.
    pub fn catalog_entry(&self) -> Value {
        let replication_key = self.pagination.replication_key();
        json!({
            "tap_stream_id": self.name,
            "stream": self.name,
            "schema": self.json_schema(),
            "key_properties": self.primary_keys,
            "replication_key": replication_key,
            "replication_method": if replication_key.is_some() { "INCREMENTAL" } else { "FULL_TABLE" },
        })
    }
}

const ADDRESS: &[Property] = &[prop("address", FieldType::String)];
const ENTITY: &[Property] = &[prop("id", FieldType::String)];
const NFT: &[Property] = &[
    prop("id", FieldType::String),
    prop("tokenId", FieldType::String),
    prop("contractAddress", FieldType::String),
];

const ICE_LEVEL_TRANSFER_EVENTS_SCHEMA: &[Property] = &[
    prop("id", FieldType::String),
    prop("tokenId", FieldType::String),
    prop("timestamp", FieldType::Integer),
    prop("oldOwner", FieldType::Object(ADDRESS)),
    prop("newOwner", FieldType::Object(ADDRESS)),
    prop("tokenAddress", FieldType::Object(ADDRESS)),
];

const ICE_INITIAL_MINTING_EVENT_SCHEMA: &[Property] = &[
    prop("id", FieldType::String),
    prop("tokenId", FieldType::String),
    prop("timestamp", FieldType::Integer),
    prop("tokenOwner", FieldType::Object(ENTITY)),
    prop("mintCount", FieldType::String),
];

const ICE_UPGRADE_ITEM_EVENT_SCHEMA: &[Property] = &[
    prop("id", FieldType::String),
    prop("itemId", FieldType::String),
    prop("issuedId", FieldType::String),
    prop("tokenId", FieldType::String),
    prop("timestamp", FieldType::Integer),
    prop("tokenOwner", FieldType::Object(ENTITY)),
    prop("tokenAddress", FieldType::Object(ADDRESS)),
    prop("requestIndex", FieldType::String),
];

const ICE_UPGRADE_RESOLVED_EVENTS_SCHEMA: &[Property] = &[
    prop("id", FieldType::String),
    prop("newItemId", FieldType::String),
    prop("newTokenId", FieldType::String),
    prop("timestamp", FieldType::Integer),
    prop("tokenOwner", FieldType::Object(ENTITY)),
    prop("tokenAddress", FieldType::Object(ADDRESS)),
];

const NFT_ITEMS_SCHEMA: &[Property] = &[
    prop("id", FieldType::String),
    prop("owner", FieldType::Object(ENTITY)),
    prop("token", FieldType::Object(ENTITY)),
    prop("tokenId", FieldType::String),
    prop("level", FieldType::Integer),
    prop("createdAt", FieldType::Integer),
];

const ICE_NFT_ITEMS_SCHEMA: &[Property] = &[
    prop("id", FieldType::String),
    prop("owner", FieldType::Object(ENTITY)),
    prop("token", FieldType::Object(ENTITY)),
    prop("tokenId", FieldType::String),
    prop("level", FieldType::Integer),
];

const ICE_USDC_PAIR_SCHEMA: &[Property] = &[
    prop("id", FieldType::String),
    prop("date", FieldType::Integer),
    prop("reserve0", FieldType::String),
    prop("reserve1", FieldType::String),
    prop("totalSupply", FieldType::String),
    prop("reserveUSD", FieldType::String),
    prop("dailyVolumeUSD", FieldType::String),
    prop("dailyVolumeToken0", FieldType::String),
    prop("dailyVolumeToken1", FieldType::String),
    prop("dailyTxns", FieldType::String),
];

const ICE_TOKEN_BALANCES_SCHEMA: &[Property] = &[
    prop("id", FieldType::String),
    prop("owner", FieldType::Object(ENTITY)),
    prop("token", FieldType::Object(ENTITY)),
    prop("balance", FieldType::String),
];

const ICE_SECONDARY_REVENUE_SCHEMA: &[Property] = &[
    prop("id", FieldType::String),
    prop("type", FieldType::String),
    prop("buyer", FieldType::String),
    prop("seller", FieldType::String),
    prop("price", FieldType::String),
    prop("timestamp", FieldType::Integer),
    prop("txHash", FieldType::String),
    prop("nft", FieldType::Object(NFT)),
    prop(PAYMENT_AMOUNT_FIELD, FieldType::String),
    prop(PAYMENT_ADDRESS_FIELD, FieldType::String),
];

const TIMESTAMP: &[Coercion] = &[Coercion::Integer("timestamp")];
const DATE: &[Coercion] = &[Coercion::Integer("date")];
const LEVEL: &[Coercion] = &[Coercion::Integer("level")];
const LEVEL_AND_CREATED_AT: &[Coercion] = &[Coercion::Integer("level"), Coercion::Integer("createdAt")];

const ICE_LEVEL_TRANSFER_EVENTS_QUERY: &str = r#"
query ($timestamp: Int!) {
    iceLevelTransferEvents(
        first: 1000,
        orderBy: timestamp,
        orderDirection: asc,
        where: { timestamp_gte: $timestamp }
    ) {
        id
        oldOwner { address }
        newOwner { address }
        tokenAddress { address }
        tokenId
        timestamp
    }
}
"#;

const INITIAL_MINTING_EVENTS_QUERY: &str = r#"
query ($timestamp: Int!) {
    initialMintingEvents(
        first: 1000,
        orderBy: timestamp,
        orderDirection: asc,
        where: { timestamp_gte: $timestamp }
    ) {
        id
        tokenId
        mintCount
        tokenOwner { id }
        timestamp
    }
}
"#;

const UPGRADE_ITEM_EVENTS_QUERY: &str = r#"
query ($timestamp: Int!) {
    upgradeItemEvents(
        first: 1000,
        orderBy: timestamp,
        orderDirection: asc,
        where: { timestamp_gte: $timestamp }
    ) {
        id
        itemId
        issuedId
        tokenOwner { id }
        tokenId
        tokenAddress { address }
        requestIndex
        timestamp
    }
}
"#;

const UPGRADE_RESOLVED_EVENTS_QUERY: &str = r#"
query ($timestamp: Int!) {
    upgradeResolvedEvents(
        first: 1000,
        orderBy: timestamp,
        orderDirection: asc,
        where: { timestamp_gte: $timestamp }
    ) {
        id
        newItemId
        newTokenId
        tokenOwner { id }
        tokenAddress { address }
        timestamp
    }
}
"#;

const NFT_ITEMS_BY_CREATION_QUERY: &str = r#"
query ($timestamp: Int!) {
    nftitems(
        first: 1000,
        orderBy: createdAt,
        orderDirection: asc,
        where: { createdAt_gte: $timestamp }
    ) {
        id
        owner { id }
        token { id }
        tokenId
        level
        createdAt
    }
}
"#;

const NFT_ITEMS_BY_OFFSET_QUERY: &str = r#"
query ($offset: Int!) {
    nftitems(
        first: 1000,
        skip: $offset,
        orderBy: id,
        orderDirection: desc
    ) {
        id
        owner { id }
        token { id }
        tokenId
        level
    }
}
"#;

const ICE_USDC_PAIR_QUERY: &str = r#"
query ($timestamp: Int!) {
    pairDayDatas(
        first: 1000,
        orderBy: date,
        orderDirection: asc,
        where: {
            pairAddress: "0x9e3880647c07ba13e65663de29783ecd96ec21de",
            date_gte: $timestamp
        }
    ) {
        id
        date
        reserve0
        reserve1
        totalSupply
        reserveUSD
        dailyVolumeUSD
        dailyVolumeToken0
        dailyVolumeToken1
        dailyTxns
    }
}
"#;

const TOKEN_BALANCES_QUERY: &str = r#"
query ($key: String!) {
    tokenBalances(
        first: 1000,
        orderBy: id,
        orderDirection: asc,
        where: { id_gt: $key }
    ) {
        id
        owner { id }
        token { id }
        balance
    }
}
"#;

const SECONDARY_SALES_QUERY: &str = r#"
query ($timestamp: Int!) {
    sales(
        first: 1000,
        orderBy: timestamp,
        orderDirection: asc,
        where: { timestamp_gte: $timestamp, searchCategory: "wearable" }
    ) {
        id
        type
        buyer
        seller
        price
        timestamp
        txHash
        nft { id tokenId contractAddress }
    }
}
"#;

/// Every stream this extractor knows, in extraction order.
pub fn all() -> Vec<StreamDefinition> {
    let incremental = RetryPolicy::transport();

    vec![
        StreamDefinition {
            name: "ice_level_transfer_events",
            primary_keys: &["id"],
            endpoint: Endpoint::Ice,
            pagination: Pagination::Timestamp {
                replication_key: "timestamp",
            },
            object_returned: "iceLevelTransferEvents",
            query: ICE_LEVEL_TRANSFER_EVENTS_QUERY,
            schema: ICE_LEVEL_TRANSFER_EVENTS_SCHEMA,
            coercions: TIMESTAMP,
            enrichment: None,
            retry: incremental,
        },
        StreamDefinition {
            name: "ice_initial_minting_event",
            primary_keys: &["id"],
            endpoint: Endpoint::Ice,
            pagination: Pagination::Timestamp {
                replication_key: "timestamp",
            },
            object_returned: "initialMintingEvents",
            query: INITIAL_MINTING_EVENTS_QUERY,
            schema: ICE_INITIAL_MINTING_EVENT_SCHEMA,
            coercions: TIMESTAMP,
            enrichment: None,
            retry: incremental,
        },
        StreamDefinition {
            name: "ice_upgrade_item_event",
            primary_keys: &["id"],
            endpoint: Endpoint::Ice,
            pagination: Pagination::Timestamp {
                replication_key: "timestamp",
            },
            object_returned: "upgradeItemEvents",
            query: UPGRADE_ITEM_EVENTS_QUERY,
            schema: ICE_UPGRADE_ITEM_EVENT_SCHEMA,
            coercions: TIMESTAMP,
            enrichment: None,
            retry: incremental,
        },
        StreamDefinition {
            name: "ice_upgrade_resolved_events",
            primary_keys: &["id"],
            endpoint: Endpoint::Ice,
            pagination: Pagination::Timestamp {
                replication_key: "timestamp",
            },
            object_returned: "upgradeResolvedEvents",
            query: UPGRADE_RESOLVED_EVENTS_QUERY,
            schema: ICE_UPGRADE_RESOLVED_EVENTS_SCHEMA,
            coercions: TIMESTAMP,
            enrichment: None,
            retry: incremental,
        },
        StreamDefinition {
            name: "nft_items",
            primary_keys: &["id"],
            endpoint: Endpoint::Ice,
            pagination: Pagination::Timestamp {
                replication_key: "createdAt",
            },
            object_returned: "nftitems",
            query: NFT_ITEMS_BY_CREATION_QUERY,
            schema: NFT_ITEMS_SCHEMA,
            coercions: LEVEL_AND_CREATED_AT,
            enrichment: None,
            retry: incremental,
        },
        StreamDefinition {
            name: "ice_nft_items",
            primary_keys: &["id"],
            endpoint: Endpoint::Ice,
            pagination: Pagination::Offset,
            object_returned: "nftitems",
            query: NFT_ITEMS_BY_OFFSET_QUERY,
            schema: ICE_NFT_ITEMS_SCHEMA,
            coercions: LEVEL,
            enrichment: None,
            retry: RetryPolicy::transport_strict(),
        },
        StreamDefinition {
            name: "ice_usdc_pair",
            primary_keys: &["id"],
            endpoint: Endpoint::Quickswap,
            pagination: Pagination::Timestamp {
                replication_key: "date",
            },
            object_returned: "pairDayDatas",
            query: ICE_USDC_PAIR_QUERY,
            schema: ICE_USDC_PAIR_SCHEMA,
            coercions: DATE,
            enrichment: None,
            retry: incremental,
        },
        StreamDefinition {
            name: "ice_token_balances",
            primary_keys: &["id"],
            endpoint: Endpoint::Ice,
            pagination: Pagination::Key { key_field: "id" },
            object_returned: "tokenBalances",
            query: TOKEN_BALANCES_QUERY,
            schema: ICE_TOKEN_BALANCES_SCHEMA,
            coercions: &[],
            enrichment: None,
            retry: incremental,
        },
        StreamDefinition {
            name: "ice_secondary_revenue",
            primary_keys: &["id"],
            endpoint: Endpoint::Marketplace,
            pagination: Pagination::Timestamp {
                replication_key: "timestamp",
            },
            object_returned: "sales",
            query: SECONDARY_SALES_QUERY,
            schema: ICE_SECONDARY_REVENUE_SCHEMA,
            coercions: TIMESTAMP,
            enrichment: Some(Enrichment { key_field: "txHash" }),
            retry: incremental,
        },
    ]
}

/// Definitions for the requested stream names, all of them if none are
/// given. Unknown names are a configuration error.
pub fn select(names: &[String]) -> Result<Vec<StreamDefinition>> {
    let streams = all();
    if names.is_empty() {
        return Ok(streams);
    }

    names
        .iter()
        .map(|name| {
            streams
                .iter()
                .find(|s| s.name == name.as_str())
                .cloned()
                .ok_or_else(|| Error::Config(format!("unknown stream: {name}")))
        })
        .collect()
}

pub fn catalog(streams: &[StreamDefinition]) -> Value {
    json!({ "streams": streams.iter().map(StreamDefinition::catalog_entry).collect::<Vec<_>>() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashSet;

    fn record(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn stream_names_are_unique() {
        let streams = all();
        let names: HashSet<_> = streams.iter().map(|s| s.name).collect();
        assert_eq!(names.len(), streams.len());
    }

    #[test]
    fn queries_declare_their_pagination_variable() {
        for stream in all() {
            let variable = match stream.pagination {
                Pagination::Timestamp { .. } => "$timestamp",
                Pagination::Offset => "$offset",
                Pagination::Key { .. } => "$key",
            };
            assert!(
                stream.query.contains(variable),
                "{} does not use {variable}",
                stream.name
            );
            assert!(stream.query.contains(stream.object_returned), "{}", stream.name);
        }
    }

    #[test]
    fn schema_covers_keys_and_coerced_fields() {
        for stream in all() {
            let schema = stream.json_schema();
            let mut fields: Vec<&str> = stream.primary_keys.to_vec();
            fields.extend(stream.pagination.replication_key());
            fields.extend(stream.coercions.iter().map(|Coercion::Integer(f)| *f));
            for field in fields {
                assert!(
                    schema["properties"].get(field).is_some(),
                    "{} is missing {field}",
                    stream.name
                );
            }
        }
    }

    #[test]
    fn coercion_is_idempotent() {
        let nft_items = select(&["nft_items".to_string()]).unwrap().remove(0);
        let mut row = record(json!({"id": "1", "level": "3", "createdAt": "1650000000"}));

        nft_items.post_process(&mut row).unwrap();
        let once = row.clone();
        nft_items.post_process(&mut row).unwrap();

        assert_eq!(row, once);
        assert_eq!(row["level"], json!(3));
        assert_eq!(row["createdAt"], json!(1650000000));
    }

    #[test]
    fn coercion_rejects_non_numeric_strings() {
        let mut row = record(json!({"level": "three"}));
        assert!(Coercion::Integer("level").apply(&mut row).is_err());

        let mut missing = record(json!({"id": "x"}));
        Coercion::Integer("level").apply(&mut missing).unwrap();
        assert!(missing.get("level").is_none());
    }

    #[test]
    fn nested_objects_render_as_nullable_objects() {
        let schema = json_schema(&[prop("owner", FieldType::Object(ENTITY))]);
        assert_eq!(
            schema,
            json!({
                "type": "object",
                "properties": {
                    "owner": {
                        "type": ["object", "null"],
                        "properties": { "id": { "type": ["string", "null"] } }
                    }
                }
            })
        );
    }

    #[test]
    fn schemas_only_use_string_integer_and_object_types() {
        fn check(stream: &str, properties: &Value) {
            for (name, schema) in properties.as_object().unwrap() {
                let kind = schema["type"][0].as_str().unwrap();
                assert!(
                    matches!(kind, "string" | "integer" | "object"),
                    "{stream}.{name} has type {kind}"
                );
                assert_eq!(schema["type"][1], "null");
                if kind == "object" {
                    check(stream, &schema["properties"]);
                }
            }
        }

        for stream in all() {
            check(stream.name, &stream.json_schema()["properties"]);
        }
    }

    #[test]
    fn select_rejects_unknown_streams() {
        assert_eq!(select(&[]).unwrap().len(), all().len());
        assert!(matches!(select(&["nope".to_string()]), Err(Error::Config(_))));
    }

    #[test]
    fn catalog_marks_replication_method() {
        let catalog = catalog(&all());
        let entries = catalog["streams"].as_array().unwrap();
        let method = |name: &str| {
            entries
                .iter()
                .find(|e| e["stream"] == name)
                .map(|e| e["replication_method"].clone())
                .unwrap()
        };
        assert_eq!(method("ice_usdc_pair"), json!("INCREMENTAL"));
        assert_eq!(method("ice_nft_items"), json!("FULL_TABLE"));
        assert_eq!(method("ice_token_balances"), json!("FULL_TABLE"));
    }
}
