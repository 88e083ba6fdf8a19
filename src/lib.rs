//! # univrs-resource
//!
//! Single-table resource storage for schema-less REST collections.
//!
//! Resources are addressed by hierarchical path (`/projects/10004321`) and
//! stored in one key-range table:
//!
//! - **Path-derived keys**: partition = first three segments, sort = full path
//! - **Sequential ids**: one atomic counter item per collection
//! - **Unique markers**: indexed marker items guard declared-unique fields
//! - **Pluggable tables**: any backend implementing [`KeyRangeTable`]
//!
//! ## Backends
//!
//! - [`MemoryTable`]: In-memory table (testing and development)
//! - [`SqliteTable`]: Embedded SQLite database
//! - `DynamoDbTable`: Amazon DynamoDB (`dynamodb` feature)
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use serde_json::json;
//! use std::sync::Arc;
//! use univrs_resource::{MemoryTable, ResourceStore};
//!
//! #[tokio::main]
//! async fn main() -> univrs_resource::Result<()> {
//!     let store = ResourceStore::new(Arc::new(MemoryTable::new()));
//!
//!     let body = json!({"name": "apollo", "unique": "name"});
//!     let project = store
//!         .create("/projects", body.as_object().cloned().unwrap_or_default())
//!         .await?;
//!     println!("created {}", project["path"]);
//!
//!     for item in store.list("/projects").await? {
//!         println!("{:?}", item);
//!     }
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration
//!
//! ```rust,no_run
//! use univrs_resource::{ResourceStore, StoreConfig};
//!
//! #[tokio::main]
//! async fn main() -> univrs_resource::Result<()> {
//!     let config = StoreConfig::sqlite("./data/nocode.db").with_timeout(5_000);
//!     let store = ResourceStore::open(&config).await?;
//!
//!     store.provision("/projects").await?;
//!     store.close().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod counter;
pub mod deadline;
#[cfg(feature = "dynamodb")]
pub mod dynamodb;
pub mod error;
pub mod handler;
pub mod item;
pub mod keys;
pub mod memory;
pub mod resource;
pub mod sqlite;
pub mod table;
pub mod unique;

// Re-export main types
pub use config::{BackendConfig, StoreConfig, DEFAULT_TABLE_NAME};
pub use counter::{BootstrapMode, CounterAllocator, COUNTER_SEED};
pub use deadline::DeadlineTable;
#[cfg(feature = "dynamodb")]
pub use dynamodb::{DynamoDbConfig, DynamoDbTable};
pub use error::{Result, StoreError};
pub use handler::{dispatch, respond, Operation, Response};
pub use item::{Attributes, Item};
pub use keys::{partition_key, sort_key, CollectionScope, ItemKey, KEY_SEPARATOR};
pub use memory::MemoryTable;
pub use resource::ResourceStore;
pub use sqlite::SqliteTable;
pub use table::{KeyRangeTable, ReturnValues};
pub use unique::{UniqueConstraint, UniqueIndexGuard};

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::config::StoreConfig;
    pub use crate::error::{Result, StoreError};
    pub use crate::item::{Attributes, Item};
    pub use crate::memory::MemoryTable;
    pub use crate::resource::ResourceStore;
    pub use crate::sqlite::SqliteTable;
    pub use crate::table::{KeyRangeTable, ReturnValues};
}
