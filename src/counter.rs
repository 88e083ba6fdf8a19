//! Sequential id allocation per collection.
//!
//! Each collection owns a counter item at `SK(collection)#counter` holding an
//! integer `Increment`. Allocation is one atomic increment. A collection that
//! has never allocated has no counter item; the increment then fails with
//! `CounterUninitialized` and the allocator bootstraps the counter according
//! to its [`BootstrapMode`].
//!
//! Retrying `allocate` after an ambiguous failure (timeout, dropped
//! connection) may skip an id: the increment is not idempotent.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{Result, StoreError};
use crate::item::{Attributes, ATTR_INCREMENT};
use crate::keys::ItemKey;
use crate::table::KeyRangeTable;

/// First id handed out in every collection.
pub const COUNTER_SEED: i64 = 10_004_321;

/// How a missing counter is initialized on first allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BootstrapMode {
    /// Write the counter at the seed and return the seed.
    ///
    /// Two callers racing on a fresh collection can both receive the seed.
    Legacy,
    /// Create the counter at `seed - 1` only if absent, then increment.
    ///
    /// Numbering matches `Legacy` and concurrent bootstraps stay distinct.
    #[default]
    Conditional,
}

/// Allocates monotonically increasing ids per collection.
#[derive(Clone)]
pub struct CounterAllocator {
    table: Arc<dyn KeyRangeTable>,
    mode: BootstrapMode,
    seed: i64,
}

impl CounterAllocator {
    pub fn new(table: Arc<dyn KeyRangeTable>) -> Self {
        Self {
            table,
            mode: BootstrapMode::default(),
            seed: COUNTER_SEED,
        }
    }

    /// Set the bootstrap mode.
    pub fn with_mode(mut self, mode: BootstrapMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the first id handed out in each collection.
    pub fn with_seed(mut self, seed: i64) -> Self {
        self.seed = seed;
        self
    }

    pub fn mode(&self) -> BootstrapMode {
        self.mode
    }

    pub fn seed(&self) -> i64 {
        self.seed
    }

    /// Allocate the next id for `collection`.
    pub async fn allocate(&self, collection: &str) -> Result<i64> {
        let key = ItemKey::counter(collection)?;

        match self.increment(&key).await {
            Ok(id) => Ok(id),
            Err(StoreError::CounterUninitialized(_)) => self.bootstrap(collection, &key).await,
            Err(err) => Err(err),
        }
    }

    /// Create the counter for `collection` ahead of first use.
    ///
    /// Returns `false` if the counter already existed.
    pub async fn provision(&self, collection: &str) -> Result<bool> {
        let key = ItemKey::counter(collection)?;
        self.create_if_absent(&key).await
    }

    /// Last id handed out for `collection`, if any counter exists.
    pub async fn current(&self, collection: &str) -> Result<Option<i64>> {
        let key = ItemKey::counter(collection)?;
        Ok(self
            .table
            .get(&key.pk, &key.sk)
            .await?
            .and_then(|item| item.attributes.get(ATTR_INCREMENT).and_then(Value::as_i64)))
    }

    async fn increment(&self, key: &ItemKey) -> Result<i64> {
        self.table
            .increment(&key.pk, &key.sk, ATTR_INCREMENT, 1)
            .await
    }

    async fn create_if_absent(&self, key: &ItemKey) -> Result<bool> {
        self.table
            .put_if_absent(&key.pk, &key.sk, counter_attributes(self.seed - 1))
            .await
    }

    async fn bootstrap(&self, collection: &str, key: &ItemKey) -> Result<i64> {
        match self.mode {
            BootstrapMode::Legacy => {
                warn!(collection, seed = self.seed, "seeding counter without condition");
                self.table
                    .write(&key.pk, &key.sk, counter_attributes(self.seed))
                    .await?;
                Ok(self.seed)
            }
            BootstrapMode::Conditional => {
                let created = self.create_if_absent(key).await?;
                debug!(collection, created, "counter bootstrapped");
                self.increment(key).await
            }
        }
    }
}

fn counter_attributes(value: i64) -> Attributes {
    let mut attributes = Attributes::new();
    attributes.insert(ATTR_INCREMENT.to_string(), Value::from(value));
    attributes
}
