//! DynamoDB key-range table
//!
//! Provides `DynamoDbTable`, which implements `KeyRangeTable` against a
//! DynamoDB table shaped as:
//!
//! ```text
//! Table: nocode (configurable)
//!
//! Primary Key:
//!   - PK (String, Partition Key)
//!   - SK (String, Sort Key)
//!
//! Global Secondary Index: PK-SK2-index (configurable)
//!   - PK (String, Partition Key)
//!   - SK2 (String, Sort Key)
//! ```
//!
//! Every other attribute is converted between JSON and `AttributeValue`.

use async_trait::async_trait;
use aws_sdk_dynamodb::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_dynamodb::operation::put_item::PutItemError;
use aws_sdk_dynamodb::types::{AttributeValue, ReturnValue};
use aws_sdk_dynamodb::Client;
use aws_smithy_types::timeout::TimeoutConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

use crate::config::DEFAULT_TABLE_NAME;
use crate::error::{Result, StoreError};
use crate::item::{Attributes, Item, ATTR_PK, ATTR_SK};
use crate::table::{validate_key, KeyRangeTable, ReturnValues};

/// Default name of the `(PK, SK2)` secondary index
pub const DEFAULT_INDEX_NAME: &str = "PK-SK2-index";

/// Error codes DynamoDB uses for rate limiting
const THROTTLING_CODES: [&str; 3] = [
    "ProvisionedThroughputExceededException",
    "ThrottlingException",
    "RequestLimitExceeded",
];

/// Error codes for server-side unavailability
const UNAVAILABLE_CODES: [&str; 2] = ["InternalServerError", "ServiceUnavailable"];

/// DynamoDB table configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DynamoDbConfig {
    /// DynamoDB table name
    #[serde(default = "default_table_name")]
    pub table_name: String,
    /// Secondary index over (PK, SK2)
    #[serde(default = "default_index_name")]
    pub index_name: String,
    /// AWS region (optional, uses SDK default if not specified)
    #[serde(default)]
    pub region: Option<String>,
    /// Optional endpoint override (e.g. LocalStack, DynamoDB Local)
    #[serde(default)]
    pub endpoint: Option<String>,
    /// SDK operation timeout in milliseconds
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl Default for DynamoDbConfig {
    fn default() -> Self {
        Self {
            table_name: default_table_name(),
            index_name: default_index_name(),
            region: None,
            endpoint: None,
            timeout_ms: None,
        }
    }
}

fn default_table_name() -> String {
    DEFAULT_TABLE_NAME.to_string()
}

fn default_index_name() -> String {
    DEFAULT_INDEX_NAME.to_string()
}

/// DynamoDB-backed key-range table
#[derive(Clone)]
pub struct DynamoDbTable {
    client: Client,
    table_name: String,
    index_name: String,
}

impl std::fmt::Debug for DynamoDbTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamoDbTable")
            .field("table_name", &self.table_name)
            .field("index_name", &self.index_name)
            .finish()
    }
}

impl DynamoDbTable {
    /// Create a new DynamoDB table handle
    pub async fn new(sdk_config: &aws_config::SdkConfig, config: DynamoDbConfig) -> Result<Self> {
        // Inherit HTTP client, retry config and credentials from SdkConfig
        let mut builder = aws_sdk_dynamodb::config::Builder::from(sdk_config);

        if let Some(region) = config.region {
            builder = builder.region(aws_sdk_dynamodb::config::Region::new(region));
        }

        if let Some(endpoint) = config.endpoint {
            builder = builder.endpoint_url(endpoint);
        }

        if let Some(timeout_ms) = config.timeout_ms {
            let timeout_config = TimeoutConfig::builder()
                .operation_timeout(Duration::from_millis(timeout_ms))
                .build();
            builder = builder.timeout_config(timeout_config);
        }

        let client = Client::from_conf(builder.build());

        Ok(Self {
            client,
            table_name: config.table_name,
            index_name: config.index_name,
        })
    }

    /// Create from a pre-built client (for testing)
    pub fn from_client(client: Client, table_name: String, index_name: String) -> Self {
        Self {
            client,
            table_name,
            index_name,
        }
    }

    /// Convert a raw DynamoDB item into an `Item`
    fn decode_item(mut raw: HashMap<String, AttributeValue>) -> Result<Item> {
        let pk = take_string(&mut raw, ATTR_PK)?;
        let sk = take_string(&mut raw, ATTR_SK)?;
        Ok(Item {
            pk,
            sk,
            attributes: dynamo_map_to_attributes(&raw),
        })
    }

    /// Build the raw item for a put
    fn encode_item(pk: &str, sk: &str, attributes: &Attributes) -> HashMap<String, AttributeValue> {
        let mut raw = attributes_to_dynamo_map(attributes);
        raw.insert(ATTR_PK.to_string(), AttributeValue::S(pk.to_string()));
        raw.insert(ATTR_SK.to_string(), AttributeValue::S(sk.to_string()));
        raw
    }

    fn key(pk: &str, sk: &str) -> HashMap<String, AttributeValue> {
        HashMap::from([
            (ATTR_PK.to_string(), AttributeValue::S(pk.to_string())),
            (ATTR_SK.to_string(), AttributeValue::S(sk.to_string())),
        ])
    }

    /// Run a paginated query and collect every page
    async fn query_all(
        &self,
        index: Option<&str>,
        condition: &str,
        values: HashMap<String, AttributeValue>,
    ) -> Result<Vec<Item>> {
        let mut items = Vec::new();
        let mut exclusive_start_key = None;

        loop {
            let response = self
                .client
                .query()
                .table_name(&self.table_name)
                .set_index_name(index.map(str::to_string))
                .key_condition_expression(condition)
                .set_expression_attribute_values(Some(values.clone()))
                .set_exclusive_start_key(exclusive_start_key.take())
                .send()
                .await
                .map_err(|e| classify("Query", e))?;

            for raw in response.items() {
                items.push(Self::decode_item(raw.clone())?);
            }

            match response.last_evaluated_key() {
                Some(key) if !key.is_empty() => exclusive_start_key = Some(key.clone()),
                _ => break,
            }
        }

        Ok(items)
    }

    /// Check if a PutItem error is a conditional check failure
    fn is_put_conditional_check_failed(err: &SdkError<PutItemError>) -> bool {
        match err {
            SdkError::ServiceError(service_err) => {
                matches!(
                    service_err.err(),
                    PutItemError::ConditionalCheckFailedException(_)
                )
            }
            _ => false,
        }
    }
}

/// Map an SDK failure onto the store's error taxonomy
fn classify<E>(op: &str, err: SdkError<E>) -> StoreError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
{
    let message = format!("DynamoDB {op} failed: {}", DisplayErrorContext(&err));
    match &err {
        SdkError::TimeoutError(_) => StoreError::DeadlineExceeded(message),
        SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            StoreError::StoreUnavailable(message)
        }
        _ => match err.code() {
            Some(code) if THROTTLING_CODES.contains(&code) => StoreError::Throttled(message),
            Some(code) if UNAVAILABLE_CODES.contains(&code) => {
                StoreError::StoreUnavailable(message)
            }
            _ => StoreError::Backend(message),
        },
    }
}

#[async_trait]
impl KeyRangeTable for DynamoDbTable {
    async fn range_query(&self, pk: &str, sk_prefix: &str) -> Result<Vec<Item>> {
        let values = HashMap::from([
            (":pk".to_string(), AttributeValue::S(pk.to_string())),
            (":sk".to_string(), AttributeValue::S(sk_prefix.to_string())),
        ]);
        self.query_all(None, "PK = :pk AND begins_with(SK, :sk)", values)
            .await
    }

    async fn equality_query(&self, pk: &str, sk2: &str) -> Result<Vec<Item>> {
        let values = HashMap::from([
            (":pk".to_string(), AttributeValue::S(pk.to_string())),
            (":sk2".to_string(), AttributeValue::S(sk2.to_string())),
        ]);
        self.query_all(Some(&self.index_name), "PK = :pk AND SK2 = :sk2", values)
            .await
    }

    async fn get(&self, pk: &str, sk: &str) -> Result<Option<Item>> {
        validate_key(pk, sk)?;

        let response = self
            .client
            .get_item()
            .table_name(&self.table_name)
            .set_key(Some(Self::key(pk, sk)))
            .consistent_read(true)
            .send()
            .await
            .map_err(|e| classify("GetItem", e))?;

        response.item().cloned().map(Self::decode_item).transpose()
    }

    async fn replace(&self, pk: &str, sk: &str, attributes: Attributes) -> Result<()> {
        validate_key(pk, sk)?;

        self.client
            .put_item()
            .table_name(&self.table_name)
            .set_item(Some(Self::encode_item(pk, sk, &attributes)))
            .send()
            .await
            .map_err(|e| classify("PutItem", e))?;

        Ok(())
    }

    async fn put_if_absent(&self, pk: &str, sk: &str, attributes: Attributes) -> Result<bool> {
        validate_key(pk, sk)?;

        // The condition makes check and create a single atomic step.
        let result = self
            .client
            .put_item()
            .table_name(&self.table_name)
            .set_item(Some(Self::encode_item(pk, sk, &attributes)))
            .condition_expression("attribute_not_exists(#sk)")
            .expression_attribute_names("#sk", ATTR_SK)
            .send()
            .await;

        match result {
            Ok(_) => Ok(true),
            Err(e) if Self::is_put_conditional_check_failed(&e) => Ok(false),
            Err(e) => Err(classify("PutItem", e)),
        }
    }

    async fn partial_update(
        &self,
        pk: &str,
        sk: &str,
        attributes: Attributes,
        returns: ReturnValues,
    ) -> Result<Attributes> {
        validate_key(pk, sk)?;

        let mut names = HashMap::new();
        let mut values = HashMap::new();
        let mut assignments = Vec::new();
        // Placeholders are positional so attribute names never need escaping.
        for (i, (name, value)) in attributes.iter().enumerate() {
            if name == ATTR_PK || name == ATTR_SK {
                continue;
            }
            names.insert(format!("#a{i}"), name.clone());
            values.insert(format!(":v{i}"), json_to_dynamo_attr(value));
            assignments.push(format!("#a{i} = :v{i}"));
        }

        if assignments.is_empty() {
            // DynamoDB rejects an empty update expression.
            let current = self.get(pk, sk).await?;
            return Ok(match returns {
                ReturnValues::None => Attributes::new(),
                _ => current.map(|item| item.attributes).unwrap_or_default(),
            });
        }

        let return_value = match returns {
            ReturnValues::None => ReturnValue::None,
            ReturnValues::AllOld => ReturnValue::AllOld,
            ReturnValues::AllNew => ReturnValue::AllNew,
        };

        let update_expression = format!("SET {}", assignments.join(", "));
        debug!(table = %self.table_name, pk, sk, %update_expression, "UpdateItem");

        let response = self
            .client
            .update_item()
            .table_name(&self.table_name)
            .set_key(Some(Self::key(pk, sk)))
            .update_expression(update_expression)
            .set_expression_attribute_names(Some(names))
            .set_expression_attribute_values(Some(values))
            .return_values(return_value)
            .send()
            .await
            .map_err(|e| classify("UpdateItem", e))?;

        let mut returned = response.attributes().cloned().unwrap_or_default();
        returned.remove(ATTR_PK);
        returned.remove(ATTR_SK);
        Ok(dynamo_map_to_attributes(&returned))
    }

    async fn increment(&self, pk: &str, sk: &str, attribute: &str, by: i64) -> Result<i64> {
        validate_key(pk, sk)?;

        let result = self
            .client
            .update_item()
            .table_name(&self.table_name)
            .set_key(Some(Self::key(pk, sk)))
            .update_expression("SET #inc = #inc + :incr")
            .expression_attribute_names("#inc", attribute)
            .expression_attribute_values(":incr", AttributeValue::N(by.to_string()))
            .return_values(ReturnValue::UpdatedNew)
            .send()
            .await;

        match result {
            Ok(response) => response
                .attributes()
                .and_then(|attrs| attrs.get(attribute))
                .and_then(|value| value.as_n().ok())
                .and_then(|n| n.parse::<i64>().ok())
                .ok_or_else(|| {
                    StoreError::Backend(format!("UpdateItem returned no {attribute} for {pk}/{sk}"))
                }),
            // Arithmetic on a missing attribute is rejected as a validation error.
            Err(e) if e.code() == Some("ValidationException") => {
                Err(StoreError::CounterUninitialized(format!("{pk}/{sk}")))
            }
            Err(e) => Err(classify("UpdateItem", e)),
        }
    }

    async fn remove(&self, pk: &str, sk: &str) -> Result<()> {
        validate_key(pk, sk)?;

        self.client
            .delete_item()
            .table_name(&self.table_name)
            .set_key(Some(Self::key(pk, sk)))
            .send()
            .await
            .map_err(|e| classify("DeleteItem", e))?;

        Ok(())
    }
}

fn take_string(raw: &mut HashMap<String, AttributeValue>, name: &str) -> Result<String> {
    match raw.remove(name) {
        Some(AttributeValue::S(s)) => Ok(s),
        _ => Err(StoreError::Serialization(format!(
            "item is missing string attribute {name}"
        ))),
    }
}

/// Convert a DynamoDB map to an attribute bag
fn dynamo_map_to_attributes(map: &HashMap<String, AttributeValue>) -> Attributes {
    map.iter()
        .filter_map(|(k, v)| dynamo_attr_to_json(v).map(|json| (k.clone(), json)))
        .collect()
}

/// Convert a single DynamoDB AttributeValue to JSON Value
fn dynamo_attr_to_json(attr: &AttributeValue) -> Option<serde_json::Value> {
    match attr {
        AttributeValue::S(s) => Some(serde_json::Value::String(s.clone())),
        AttributeValue::N(n) => {
            // Try to parse as i64 first, then f64
            if let Ok(i) = n.parse::<i64>() {
                Some(serde_json::Value::Number(i.into()))
            } else if let Ok(f) = n.parse::<f64>() {
                serde_json::Number::from_f64(f).map(serde_json::Value::Number)
            } else {
                None
            }
        }
        AttributeValue::Bool(b) => Some(serde_json::Value::Bool(*b)),
        AttributeValue::Null(_) => Some(serde_json::Value::Null),
        AttributeValue::L(list) => {
            let items: Vec<_> = list.iter().filter_map(dynamo_attr_to_json).collect();
            Some(serde_json::Value::Array(items))
        }
        AttributeValue::M(map) => Some(serde_json::Value::Object(dynamo_map_to_attributes(map))),
        AttributeValue::Ss(set) => Some(serde_json::Value::Array(
            set.iter().cloned().map(serde_json::Value::String).collect(),
        )),
        _ => None, // Skip binary and other types
    }
}

/// Convert an attribute bag to a DynamoDB map
fn attributes_to_dynamo_map(attributes: &Attributes) -> HashMap<String, AttributeValue> {
    attributes
        .iter()
        .map(|(k, v)| (k.clone(), json_to_dynamo_attr(v)))
        .collect()
}

/// Convert a single JSON Value to DynamoDB AttributeValue
fn json_to_dynamo_attr(val: &serde_json::Value) -> AttributeValue {
    match val {
        serde_json::Value::Null => AttributeValue::Null(true),
        serde_json::Value::Bool(b) => AttributeValue::Bool(*b),
        serde_json::Value::Number(n) => AttributeValue::N(n.to_string()),
        serde_json::Value::String(s) => AttributeValue::S(s.clone()),
        serde_json::Value::Array(arr) => {
            AttributeValue::L(arr.iter().map(json_to_dynamo_attr).collect())
        }
        serde_json::Value::Object(obj) => AttributeValue::M(attributes_to_dynamo_map(obj)),
    }
}
