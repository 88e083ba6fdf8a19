//! KeyRangeTable trait - the raw single-table abstraction.
//!
//! A key-range table stores attribute bags addressed by `(pk, sk)` and
//! exposes:
//! - range queries by sort key prefix within a partition
//! - equality queries on the `(PK, SK2)` secondary index
//! - merge writes, full replaces and conditional creates
//! - partial updates with selectable return values
//! - atomic integer increments
//! - idempotent deletes
//!
//! Backends map transport failures to `StoreUnavailable` and rate limiting
//! to `Throttled`. Nothing here retries.

use async_trait::async_trait;

use crate::error::{Result, StoreError};
use crate::item::{Attributes, Item};

/// Which snapshot a partial update returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReturnValues {
    /// Return an empty attribute bag.
    #[default]
    None,
    /// Return the item as it was before the update (empty if it did not exist).
    AllOld,
    /// Return the item as it is after the update.
    AllNew,
}

/// Validate that a key component is usable.
pub fn validate_key(pk: &str, sk: &str) -> Result<()> {
    if pk.is_empty() {
        return Err(StoreError::InvalidPath(
            "partition key cannot be empty".to_string(),
        ));
    }
    if sk.is_empty() {
        return Err(StoreError::InvalidPath("sort key cannot be empty".to_string()));
    }
    Ok(())
}

/// The core table trait.
///
/// All backends (memory, SQLite, DynamoDB) implement this trait. Higher
/// layers hold an `Arc<dyn KeyRangeTable>` and never depend on a concrete
/// backend.
#[async_trait]
pub trait KeyRangeTable: Send + Sync {
    /// Items in partition `pk` whose sort key starts with `sk_prefix`,
    /// ordered by sort key.
    async fn range_query(&self, pk: &str, sk_prefix: &str) -> Result<Vec<Item>>;

    /// Items in partition `pk` whose `SK2` equals `sk2`, via the secondary index.
    async fn equality_query(&self, pk: &str, sk2: &str) -> Result<Vec<Item>>;

    /// Point read.
    async fn get(&self, pk: &str, sk: &str) -> Result<Option<Item>>;

    /// Upsert an item, overwriting the supplied attributes and keeping the rest.
    async fn write(&self, pk: &str, sk: &str, attributes: Attributes) -> Result<()> {
        self.partial_update(pk, sk, attributes, ReturnValues::None)
            .await
            .map(|_| ())
    }

    /// Upsert an item, replacing all of its attributes.
    async fn replace(&self, pk: &str, sk: &str, attributes: Attributes) -> Result<()>;

    /// Create an item only if no item exists at `(pk, sk)`.
    ///
    /// Returns `true` if the item was written, `false` if one already existed.
    async fn put_if_absent(&self, pk: &str, sk: &str, attributes: Attributes) -> Result<bool>;

    /// Update only the named attributes, creating the item if absent.
    async fn partial_update(
        &self,
        pk: &str,
        sk: &str,
        attributes: Attributes,
        returns: ReturnValues,
    ) -> Result<Attributes>;

    /// Atomically add `by` to an integer attribute and return the new value.
    ///
    /// Fails with `CounterUninitialized` if the item or attribute is absent.
    async fn increment(&self, pk: &str, sk: &str, attribute: &str, by: i64) -> Result<i64>;

    /// Delete an item. Deleting a missing item is not an error.
    async fn remove(&self, pk: &str, sk: &str) -> Result<()>;

    /// Release backend resources. Further calls may fail.
    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_key() {
        assert!(validate_key("projects", "projects#1").is_ok());
        assert!(matches!(
            validate_key("", "x"),
            Err(StoreError::InvalidPath(_))
        ));
        assert!(matches!(
            validate_key("x", ""),
            Err(StoreError::InvalidPath(_))
        ));
    }

    #[test]
    fn test_return_values_default() {
        assert_eq!(ReturnValues::default(), ReturnValues::None);
    }
}
