//! Items and attribute bags.
//!
//! An item is a schema-less JSON object stored at `(PK, SK)`. The key
//! attributes travel on [`Item`] itself; everything else, including the
//! optional `SK2` index attribute, lives in [`Item::attributes`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::{SystemTime, UNIX_EPOCH};

/// Attribute bag of an item.
pub type Attributes = Map<String, Value>;

/// Partition key attribute.
pub const ATTR_PK: &str = "PK";
/// Sort key attribute.
pub const ATTR_SK: &str = "SK";
/// Secondary-index equality attribute (unique marker value).
pub const ATTR_SK2: &str = "SK2";
/// Counter value attribute.
pub const ATTR_INCREMENT: &str = "Increment";
/// Owning resource path on unique-marker items.
pub const ATTR_OWNER: &str = "Owner";

/// Caller-facing declaration of unique fields.
pub const ATTR_UNIQUE: &str = "unique";
/// Allocated numeric id.
pub const ATTR_ID: &str = "id";
/// Resource path.
pub const ATTR_PATH: &str = "path";
/// Creation time, Unix epoch milliseconds.
pub const ATTR_CREATED_AT: &str = "createdAt";
/// Last update time, Unix epoch milliseconds.
pub const ATTR_UPDATED_AT: &str = "updatedAt";

const INTERNAL_ATTRIBUTES: [&str; 3] = [ATTR_PK, ATTR_SK, ATTR_SK2];

/// A stored item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    /// Partition key.
    pub pk: String,
    /// Sort key.
    pub sk: String,
    /// All non-key attributes.
    pub attributes: Attributes,
}

impl Item {
    pub fn new(pk: impl Into<String>, sk: impl Into<String>, attributes: Attributes) -> Self {
        Self {
            pk: pk.into(),
            sk: sk.into(),
            attributes,
        }
    }

    /// Caller-facing view: attributes without `PK`, `SK` or `SK2`.
    pub fn into_public(self) -> Attributes {
        strip_internal(self.attributes)
    }
}

/// Remove the internal key attributes from an attribute bag.
pub fn strip_internal(mut attributes: Attributes) -> Attributes {
    for name in INTERNAL_ATTRIBUTES {
        attributes.remove(name);
    }
    attributes
}

/// Extract the `SK2` string from an attribute bag, if present.
pub fn sk2_of(attributes: &Attributes) -> Option<&str> {
    attributes.get(ATTR_SK2).and_then(Value::as_str)
}

/// Shallow merge `update` into `base`, attribute by attribute.
pub fn merge(base: &mut Attributes, update: Attributes) {
    for (name, value) in update {
        base.insert(name, value);
    }
}

/// Current Unix time in milliseconds.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
