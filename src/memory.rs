//! In-memory key-range table.
//!
//! This implementation is NOT durable - data is lost on process exit.
//! Use for testing and development only.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{Result, StoreError};
use crate::item::{merge, sk2_of, Attributes, Item};
use crate::table::{validate_key, KeyRangeTable, ReturnValues};

type Key = (String, String);

/// In-memory implementation of KeyRangeTable.
///
/// Uses a BTreeMap keyed by `(pk, sk)` so that a sort key prefix is a
/// contiguous range, and a RwLock for concurrency. The secondary index is
/// answered by scanning the partition.
#[derive(Clone, Default)]
pub struct MemoryTable {
    data: Arc<RwLock<BTreeMap<Key, Attributes>>>,
}

impl MemoryTable {
    /// Create a new empty in-memory table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the number of items in the table.
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    /// Check if the table is empty.
    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    fn key(pk: &str, sk: &str) -> Key {
        (pk.to_string(), sk.to_string())
    }
}

#[async_trait]
impl KeyRangeTable for MemoryTable {
    async fn range_query(&self, pk: &str, sk_prefix: &str) -> Result<Vec<Item>> {
        let data = self.data.read();
        let items = data
            .range(Self::key(pk, sk_prefix)..)
            .take_while(|((p, s), _)| p == pk && s.starts_with(sk_prefix))
            .map(|((p, s), attrs)| Item::new(p.clone(), s.clone(), attrs.clone()))
            .collect();
        Ok(items)
    }

    async fn equality_query(&self, pk: &str, sk2: &str) -> Result<Vec<Item>> {
        let data = self.data.read();
        let items = data
            .range(Self::key(pk, "")..)
            .take_while(|((p, _), _)| p == pk)
            .filter(|(_, attrs)| sk2_of(attrs) == Some(sk2))
            .map(|((p, s), attrs)| Item::new(p.clone(), s.clone(), attrs.clone()))
            .collect();
        Ok(items)
    }

    async fn get(&self, pk: &str, sk: &str) -> Result<Option<Item>> {
        validate_key(pk, sk)?;
        Ok(self
            .data
            .read()
            .get(&Self::key(pk, sk))
            .map(|attrs| Item::new(pk, sk, attrs.clone())))
    }

    async fn replace(&self, pk: &str, sk: &str, attributes: Attributes) -> Result<()> {
        validate_key(pk, sk)?;
        self.data.write().insert(Self::key(pk, sk), attributes);
        Ok(())
    }

    async fn put_if_absent(&self, pk: &str, sk: &str, attributes: Attributes) -> Result<bool> {
        validate_key(pk, sk)?;

        let mut data = self.data.write();
        let key = Self::key(pk, sk);
        if data.contains_key(&key) {
            return Ok(false);
        }
        data.insert(key, attributes);
        Ok(true)
    }

    async fn partial_update(
        &self,
        pk: &str,
        sk: &str,
        attributes: Attributes,
        returns: ReturnValues,
    ) -> Result<Attributes> {
        validate_key(pk, sk)?;

        let mut data = self.data.write();
        let current = data.entry(Self::key(pk, sk)).or_default();
        let old = match returns {
            ReturnValues::AllOld => current.clone(),
            _ => Attributes::new(),
        };
        merge(current, attributes);

        Ok(match returns {
            ReturnValues::None => Attributes::new(),
            ReturnValues::AllOld => old,
            ReturnValues::AllNew => current.clone(),
        })
    }

    async fn increment(&self, pk: &str, sk: &str, attribute: &str, by: i64) -> Result<i64> {
        validate_key(pk, sk)?;

        let mut data = self.data.write();
        let current = data
            .get_mut(&Self::key(pk, sk))
            .and_then(|attrs| attrs.get_mut(attribute))
            .ok_or_else(|| StoreError::CounterUninitialized(format!("{pk}/{sk}")))?;
        let value = current
            .as_i64()
            .ok_or_else(|| StoreError::CounterUninitialized(format!("{pk}/{sk}: not an integer")))?;

        let next = value
            .checked_add(by)
            .ok_or_else(|| StoreError::Backend(format!("{pk}/{sk}: counter overflow")))?;
        *current = Value::from(next);
        Ok(next)
    }

    async fn remove(&self, pk: &str, sk: &str) -> Result<()> {
        validate_key(pk, sk)?;
        self.data.write().remove(&Self::key(pk, sk));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn attrs(value: Value) -> Attributes {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_replace_and_get() {
        let table = MemoryTable::new();

        table
            .replace("projects", "projects#1", attrs(json!({"name": "X"})))
            .await
            .unwrap();

        let item = table.get("projects", "projects#1").await.unwrap().unwrap();
        assert_eq!(item.pk, "projects");
        assert_eq!(item.sk, "projects#1");
        assert_eq!(item.attributes, attrs(json!({"name": "X"})));
    }

    #[tokio::test]
    async fn test_replace_clears_unspecified() {
        let table = MemoryTable::new();

        table
            .replace("p", "s", attrs(json!({"a": 1, "b": 2})))
            .await
            .unwrap();
        table.replace("p", "s", attrs(json!({"b": 3}))).await.unwrap();

        let item = table.get("p", "s").await.unwrap().unwrap();
        assert_eq!(item.attributes, attrs(json!({"b": 3})));
    }

    #[tokio::test]
    async fn test_write_merges() {
        let table = MemoryTable::new();

        table
            .write("p", "s", attrs(json!({"a": 1, "b": 2})))
            .await
            .unwrap();
        table.write("p", "s", attrs(json!({"b": 3}))).await.unwrap();

        let item = table.get("p", "s").await.unwrap().unwrap();
        assert_eq!(item.attributes, attrs(json!({"a": 1, "b": 3})));
    }

    #[tokio::test]
    async fn test_get_nonexistent() {
        let table = MemoryTable::new();
        assert!(table.get("p", "missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let table = MemoryTable::new();

        table.replace("p", "s", Attributes::new()).await.unwrap();
        table.remove("p", "s").await.unwrap();
        assert!(table.get("p", "s").await.unwrap().is_none());

        // Should not error
        table.remove("p", "s").await.unwrap();
    }

    #[tokio::test]
    async fn test_range_query_is_scoped_and_ordered() {
        let table = MemoryTable::new();

        table.replace("projects", "projects#2", Attributes::new()).await.unwrap();
        table.replace("projects", "projects#1", Attributes::new()).await.unwrap();
        table.replace("projects", "other#1", Attributes::new()).await.unwrap();
        table.replace("projectsX", "projects#3", Attributes::new()).await.unwrap();

        let items = table.range_query("projects", "projects#").await.unwrap();
        let sks: Vec<_> = items.iter().map(|i| i.sk.as_str()).collect();
        assert_eq!(sks, vec!["projects#1", "projects#2"]);
    }

    #[tokio::test]
    async fn test_equality_query() {
        let table = MemoryTable::new();

        table
            .replace("p", "m1", attrs(json!({"SK2": "name#X"})))
            .await
            .unwrap();
        table
            .replace("p", "m2", attrs(json!({"SK2": "name#Y"})))
            .await
            .unwrap();
        table
            .replace("q", "m3", attrs(json!({"SK2": "name#X"})))
            .await
            .unwrap();

        let items = table.equality_query("p", "name#X").await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].sk, "m1");
    }

    #[tokio::test]
    async fn test_put_if_absent() {
        let table = MemoryTable::new();

        assert!(table.put_if_absent("p", "s", attrs(json!({"v": 1}))).await.unwrap());
        assert!(!table.put_if_absent("p", "s", attrs(json!({"v": 2}))).await.unwrap());

        let item = table.get("p", "s").await.unwrap().unwrap();
        assert_eq!(item.attributes, attrs(json!({"v": 1})));
    }

    #[tokio::test]
    async fn test_partial_update_return_values() {
        let table = MemoryTable::new();

        let old = table
            .partial_update("p", "s", attrs(json!({"a": 1})), ReturnValues::AllOld)
            .await
            .unwrap();
        assert!(old.is_empty());

        let old = table
            .partial_update("p", "s", attrs(json!({"b": 2})), ReturnValues::AllOld)
            .await
            .unwrap();
        assert_eq!(old, attrs(json!({"a": 1})));

        let new = table
            .partial_update("p", "s", attrs(json!({"a": 3})), ReturnValues::AllNew)
            .await
            .unwrap();
        assert_eq!(new, attrs(json!({"a": 3, "b": 2})));
    }

    #[tokio::test]
    async fn test_increment() {
        let table = MemoryTable::new();

        let err = table.increment("p", "c", "Increment", 1).await.unwrap_err();
        assert!(matches!(err, StoreError::CounterUninitialized(_)));

        table
            .replace("p", "c", attrs(json!({"Increment": 10})))
            .await
            .unwrap();
        assert_eq!(table.increment("p", "c", "Increment", 1).await.unwrap(), 11);
        assert_eq!(table.increment("p", "c", "Increment", 1).await.unwrap(), 12);
    }

    #[tokio::test]
    async fn test_increment_missing_attribute() {
        let table = MemoryTable::new();

        table.replace("p", "c", attrs(json!({"other": 1}))).await.unwrap();
        let err = table.increment("p", "c", "Increment", 1).await.unwrap_err();
        assert!(matches!(err, StoreError::CounterUninitialized(_)));
    }

    #[tokio::test]
    async fn test_increment_overflow() {
        let table = MemoryTable::new();

        table
            .replace("p", "c", attrs(json!({"Increment": i64::MAX})))
            .await
            .unwrap();
        let err = table.increment("p", "c", "Increment", 1).await.unwrap_err();
        assert!(matches!(err, StoreError::Backend(ref msg) if msg.contains("overflow")));

        let item = table.get("p", "c").await.unwrap().unwrap();
        assert_eq!(item.attributes["Increment"], i64::MAX);
    }

    #[tokio::test]
    async fn test_invalid_key() {
        let table = MemoryTable::new();

        let result = table.replace("", "s", Attributes::new()).await;
        assert!(matches!(result, Err(StoreError::InvalidPath(_))));
    }

    #[tokio::test]
    async fn test_len() {
        let table = MemoryTable::new();
        assert!(table.is_empty());

        table.replace("p", "a", Attributes::new()).await.unwrap();
        table.replace("p", "b", Attributes::new()).await.unwrap();
        assert_eq!(table.len(), 2);

        table.remove("p", "a").await.unwrap();
        table.remove("p", "b").await.unwrap();
        assert!(table.is_empty());
    }
}
