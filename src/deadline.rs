//! Per-operation timeouts for any key-range table.

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Result, StoreError};
use crate::item::{Attributes, Item};
use crate::table::{KeyRangeTable, ReturnValues};

/// Wraps a table so that every call fails with `DeadlineExceeded` once it
/// runs longer than `limit`.
///
/// A timed-out write may still land on the backend; callers treat the
/// outcome as unknown.
pub struct DeadlineTable {
    inner: Arc<dyn KeyRangeTable>,
    limit: Duration,
}

impl DeadlineTable {
    pub fn new(inner: Arc<dyn KeyRangeTable>, limit: Duration) -> Self {
        Self { inner, limit }
    }

    /// The configured per-operation limit.
    pub fn limit(&self) -> Duration {
        self.limit
    }

    async fn run<T>(&self, op: &str, fut: impl Future<Output = Result<T>> + Send) -> Result<T> {
        tokio::time::timeout(self.limit, fut)
            .await
            .map_err(|_| StoreError::DeadlineExceeded(format!("{op} after {:?}", self.limit)))?
    }
}

#[async_trait]
impl KeyRangeTable for DeadlineTable {
    async fn range_query(&self, pk: &str, sk_prefix: &str) -> Result<Vec<Item>> {
        self.run("range_query", self.inner.range_query(pk, sk_prefix))
            .await
    }

    async fn equality_query(&self, pk: &str, sk2: &str) -> Result<Vec<Item>> {
        self.run("equality_query", self.inner.equality_query(pk, sk2))
            .await
    }

    async fn get(&self, pk: &str, sk: &str) -> Result<Option<Item>> {
        self.run("get", self.inner.get(pk, sk)).await
    }

    async fn write(&self, pk: &str, sk: &str, attributes: Attributes) -> Result<()> {
        self.run("write", self.inner.write(pk, sk, attributes)).await
    }

    async fn replace(&self, pk: &str, sk: &str, attributes: Attributes) -> Result<()> {
        self.run("replace", self.inner.replace(pk, sk, attributes))
            .await
    }

    async fn put_if_absent(&self, pk: &str, sk: &str, attributes: Attributes) -> Result<bool> {
        self.run("put_if_absent", self.inner.put_if_absent(pk, sk, attributes))
            .await
    }

    async fn partial_update(
        &self,
        pk: &str,
        sk: &str,
        attributes: Attributes,
        returns: ReturnValues,
    ) -> Result<Attributes> {
        self.run(
            "partial_update",
            self.inner.partial_update(pk, sk, attributes, returns),
        )
        .await
    }

    async fn increment(&self, pk: &str, sk: &str, attribute: &str, by: i64) -> Result<i64> {
        self.run("increment", self.inner.increment(pk, sk, attribute, by))
            .await
    }

    async fn remove(&self, pk: &str, sk: &str) -> Result<()> {
        self.run("remove", self.inner.remove(pk, sk)).await
    }

    async fn close(&self) {
        self.inner.close().await;
    }
}
