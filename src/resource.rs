//! ResourceStore - the four logical operations over one shared table.
//!
//! Orchestrates key derivation, id allocation and unique markers:
//!
//! - `list`: one range query over the collection's members
//! - `create`: check, allocate, claim markers, write
//! - `update`: claim new markers, partial update, retire stale markers
//! - `delete`: remove the item, optionally retire its markers
//!
//! Nothing is cached in process; every call goes to the table.

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::{BackendConfig, StoreConfig};
use crate::counter::CounterAllocator;
use crate::deadline::DeadlineTable;
use crate::error::{Result, StoreError};
use crate::item::{
    merge, now_millis, strip_internal, Attributes, ATTR_CREATED_AT, ATTR_ID, ATTR_PATH,
    ATTR_UPDATED_AT,
};
use crate::keys::{self, CollectionScope, ItemKey};
use crate::memory::MemoryTable;
use crate::sqlite::SqliteTable;
use crate::table::{KeyRangeTable, ReturnValues};
use crate::unique::{self, UniqueConstraint, UniqueIndexGuard};

/// Resource store over a single key-range table.
#[derive(Clone)]
pub struct ResourceStore {
    table: Arc<dyn KeyRangeTable>,
    counters: CounterAllocator,
    guard: UniqueIndexGuard,
    check_unique_on_update: bool,
    cascade_unique_markers: bool,
}

impl ResourceStore {
    /// Store over `table` with default settings.
    pub fn new(table: Arc<dyn KeyRangeTable>) -> Self {
        Self::with_config(table, &StoreConfig::default())
    }

    /// Store over `table` with the behavioural settings of `config`.
    ///
    /// `config.backend` is ignored; the table is supplied by the caller.
    pub fn with_config(table: Arc<dyn KeyRangeTable>, config: &StoreConfig) -> Self {
        let table: Arc<dyn KeyRangeTable> = match config.operation_timeout_ms {
            Some(ms) => Arc::new(DeadlineTable::new(table, Duration::from_millis(ms))),
            None => table,
        };
        Self {
            counters: CounterAllocator::new(table.clone())
                .with_mode(config.bootstrap)
                .with_seed(config.counter_seed),
            guard: UniqueIndexGuard::new(table.clone()),
            table,
            check_unique_on_update: config.check_unique_on_update,
            cascade_unique_markers: config.cascade_unique_markers,
        }
    }

    /// Open the backend named by `config` and build a store over it.
    pub async fn open(config: &StoreConfig) -> Result<Self> {
        config.validate()?;
        let table: Arc<dyn KeyRangeTable> = match &config.backend {
            BackendConfig::Memory => Arc::new(MemoryTable::new()),
            BackendConfig::Sqlite { path } => Arc::new(SqliteTable::open(path).await?),
            #[cfg(feature = "dynamodb")]
            BackendConfig::DynamoDb(dynamo) => {
                let sdk_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
                Arc::new(crate::dynamodb::DynamoDbTable::new(&sdk_config, dynamo.clone()).await?)
            }
        };
        info!(backend = ?config.backend, "resource store opened");
        Ok(Self::with_config(table, config))
    }

    /// Close the underlying table.
    pub async fn close(&self) {
        self.table.close().await;
    }

    /// The id allocator used by this store.
    pub fn counters(&self) -> &CounterAllocator {
        &self.counters
    }

    /// The unique guard used by this store.
    pub fn guard(&self) -> &UniqueIndexGuard {
        &self.guard
    }

    /// Everything addressed by `path`: the resource at `path` itself, if one
    /// exists, followed by its direct members ordered by sort key.
    ///
    /// For a top-level collection such as `/projects` only members are
    /// returned.
    pub async fn list(&self, path: &str) -> Result<Vec<Attributes>> {
        let scope = CollectionScope::of(path)?;

        let mut listed = Vec::new();
        if keys::segments(path)?.len() > 1 {
            listed.extend(self.get(path).await?);
        }

        let items = self.table.range_query(&scope.pk, &scope.prefix).await?;
        listed.extend(
            items
                .into_iter()
                .filter(|item| scope.is_member(&item.sk))
                .map(|item| item.into_public()),
        );
        Ok(listed)
    }

    /// The resource at `path`, if it exists.
    pub async fn get(&self, path: &str) -> Result<Option<Attributes>> {
        let key = ItemKey::resource(path)?;
        Ok(self
            .table
            .get(&key.pk, &key.sk)
            .await?
            .map(|item| item.into_public()))
    }

    /// Create a resource in `collection` and return its stored attributes.
    pub async fn create(&self, collection: &str, body: Attributes) -> Result<Attributes> {
        let collection = keys::normalize(collection)?;
        let mut body = sanitize(body);
        let constraints = unique::constraints(&body)?;

        for constraint in &constraints {
            if self.guard.check(&collection, constraint, None).await? {
                return Err(violation(&collection, constraint));
            }
        }

        let id = self.counters.allocate(&collection).await?;
        let path = format!("{collection}/{id}");
        let key = ItemKey::resource(&path)?;

        let claimed = self.claim_all(&collection, &constraints, &path).await?;

        body.insert(ATTR_ID.to_string(), Value::from(id));
        body.insert(ATTR_PATH.to_string(), Value::from(path.clone()));
        body.insert(ATTR_CREATED_AT.to_string(), Value::from(now_millis()));

        if let Err(err) = self.table.replace(&key.pk, &key.sk, body.clone()).await {
            self.retire_all(&collection, &claimed, &path).await;
            return Err(err.into_persist_failed());
        }

        debug!(path = %path, id, "resource created");
        Ok(strip_internal(body))
    }

    /// Update the named attributes of the resource at `path`.
    ///
    /// Creates the resource if it does not exist. Returns the merged result.
    pub async fn update(&self, path: &str, body: Attributes) -> Result<Attributes> {
        let path = keys::normalize(path)?;
        let key = ItemKey::resource(&path)?;
        let (collection, _) = keys::split_parent(&path)?;

        let mut body = sanitize(body);
        body.remove(ATTR_ID);
        body.remove(ATTR_CREATED_AT);

        let current = self
            .table
            .get(&key.pk, &key.sk)
            .await?
            .map(|item| item.into_public())
            .unwrap_or_default();
        let held = unique::constraints(&current)?;

        let mut merged = current;
        merge(&mut merged, body.clone());
        let wanted = unique::constraints(&merged)?;

        let added: Vec<UniqueConstraint> = wanted
            .iter()
            .filter(|c| !held.contains(c))
            .cloned()
            .collect();
        if self.check_unique_on_update {
            for constraint in &added {
                if self.guard.check(&collection, constraint, Some(&path)).await? {
                    return Err(violation(&collection, constraint));
                }
            }
        }
        let claimed = self.claim_all(&collection, &added, &path).await?;

        body.insert(ATTR_PATH.to_string(), Value::from(path.clone()));
        body.insert(ATTR_UPDATED_AT.to_string(), Value::from(now_millis()));

        let updated = match self
            .table
            .partial_update(&key.pk, &key.sk, body, ReturnValues::AllNew)
            .await
        {
            Ok(updated) => updated,
            Err(err) => {
                self.retire_all(&collection, &claimed, &path).await;
                return Err(err.into_persist_failed());
            }
        };

        let stale: Vec<UniqueConstraint> =
            held.into_iter().filter(|c| !wanted.contains(c)).collect();
        self.retire_all(&collection, &stale, &path).await;

        debug!(path = %path, claimed = claimed.len(), retired = stale.len(), "resource updated");
        Ok(strip_internal(updated))
    }

    /// Delete the resource at `path`. Deleting a missing resource succeeds.
    ///
    /// With `cascade_unique_markers` disabled, markers owned by the resource
    /// stay behind and keep blocking their values.
    pub async fn delete(&self, path: &str) -> Result<bool> {
        let path = keys::normalize(path)?;
        let key = ItemKey::resource(&path)?;

        let held = if self.cascade_unique_markers {
            match self.table.get(&key.pk, &key.sk).await? {
                Some(item) => match unique::constraints(&item.attributes) {
                    Ok(held) => held,
                    Err(err) => {
                        warn!(path = %path, error = %err, "skipping unique marker cleanup");
                        Vec::new()
                    }
                },
                None => Vec::new(),
            }
        } else {
            Vec::new()
        };

        self.table.remove(&key.pk, &key.sk).await?;

        if !held.is_empty() {
            let (collection, _) = keys::split_parent(&path)?;
            self.retire_all(&collection, &held, &path).await;
        }
        debug!(path = %path, "resource deleted");
        Ok(true)
    }

    /// Create the id counter for `collection` ahead of first use.
    pub async fn provision(&self, collection: &str) -> Result<bool> {
        self.counters.provision(&keys::normalize(collection)?).await
    }

    /// Claim every constraint, undoing earlier claims if one fails.
    async fn claim_all(
        &self,
        collection: &str,
        constraints: &[UniqueConstraint],
        owner: &str,
    ) -> Result<Vec<UniqueConstraint>> {
        let mut claimed = Vec::with_capacity(constraints.len());
        for constraint in constraints {
            if let Err(err) = self.guard.claim(collection, constraint, owner).await {
                self.retire_all(collection, &claimed, owner).await;
                return Err(err);
            }
            claimed.push(constraint.clone());
        }
        Ok(claimed)
    }

    async fn retire_all(&self, collection: &str, constraints: &[UniqueConstraint], owner: &str) {
        for constraint in constraints {
            self.guard.retire(collection, constraint, owner).await;
        }
    }
}

/// Drop the internal key attributes a caller must not set.
fn sanitize(body: Attributes) -> Attributes {
    strip_internal(body)
}

fn violation(collection: &str, constraint: &UniqueConstraint) -> StoreError {
    StoreError::UniqueConstraintViolation {
        collection: collection.to_string(),
        field: constraint.field.clone(),
        value: constraint.value.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn attrs(value: Value) -> Attributes {
        value.as_object().cloned().unwrap()
    }

    fn store() -> (ResourceStore, Arc<MemoryTable>) {
        let table = Arc::new(MemoryTable::new());
        (ResourceStore::new(table.clone()), table)
    }

    #[tokio::test]
    async fn test_create_stamps_id_and_path() {
        let (store, _) = store();

        let created = store
            .create("/projects", attrs(json!({"name": "X"})))
            .await
            .unwrap();
        assert_eq!(created["id"], 10004321);
        assert_eq!(created["path"], "/projects/10004321");
        assert_eq!(created["name"], "X");
        assert!(created["createdAt"].as_u64().unwrap() > 0);
        assert!(!created.contains_key("PK"));
        assert!(!created.contains_key("SK"));
    }

    #[tokio::test]
    async fn test_create_ignores_caller_keys() {
        let (store, _) = store();

        let created = store
            .create(
                "/projects",
                attrs(json!({"PK": "evil", "SK": "evil", "SK2": "evil", "name": "X"})),
            )
            .await
            .unwrap();

        let fetched = store.get(created["path"].as_str().unwrap()).await.unwrap();
        assert_eq!(fetched, Some(created));
    }

    #[tokio::test]
    async fn test_list_excludes_counter_and_markers() {
        let (store, table) = store();

        store
            .create("/projects", attrs(json!({"name": "A", "unique": "name"})))
            .await
            .unwrap();
        store
            .create("/projects", attrs(json!({"name": "B", "unique": "name"})))
            .await
            .unwrap();
        store
            .create("/projects/10004321/tasks", attrs(json!({"title": "t"})))
            .await
            .unwrap();

        // two resources, two markers, one counter
        assert_eq!(table.range_query("projects", "").await.unwrap().len(), 5);

        let listed = store.list("/projects").await.unwrap();
        let names: Vec<_> = listed.iter().map(|a| a["name"].clone()).collect();
        assert_eq!(names, vec![json!("A"), json!("B")]);

        let tasks = store.list("/projects/10004321/tasks").await.unwrap();
        assert_eq!(tasks.len(), 1);
    }

    #[tokio::test]
    async fn test_create_rejects_duplicate() {
        let (store, table) = store();

        store
            .create("/projects", attrs(json!({"name": "X", "unique": "name"})))
            .await
            .unwrap();
        let before = table.len();

        let err = store
            .create("/projects", attrs(json!({"name": "X", "unique": "name"})))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::UniqueConstraintViolation { .. }));
        assert_eq!(table.len(), before);
        assert_eq!(store.list("/projects").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_update_merges_and_stamps() {
        let (store, _) = store();

        let created = store
            .create("/projects", attrs(json!({"name": "X", "size": 1})))
            .await
            .unwrap();
        let path = created["path"].as_str().unwrap().to_string();

        let updated = store
            .update(&path, attrs(json!({"size": 2, "id": 1})))
            .await
            .unwrap();
        assert_eq!(updated["name"], "X");
        assert_eq!(updated["size"], 2);
        assert_eq!(updated["id"], created["id"]);
        assert!(updated.contains_key("updatedAt"));
        assert_eq!(updated["createdAt"], created["createdAt"]);
    }

    #[tokio::test]
    async fn test_update_to_taken_value_is_rejected() {
        let (store, _) = store();

        store
            .create("/projects", attrs(json!({"name": "A", "unique": "name"})))
            .await
            .unwrap();
        let b = store
            .create("/projects", attrs(json!({"name": "B", "unique": "name"})))
            .await
            .unwrap();
        let b_path = b["path"].as_str().unwrap();

        let err = store
            .update(b_path, attrs(json!({"name": "A"})))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::UniqueConstraintViolation { .. }));

        let unchanged = store.get(b_path).await.unwrap().unwrap();
        assert_eq!(unchanged["name"], "B");
    }

    #[tokio::test]
    async fn test_update_same_value_is_not_a_violation() {
        let (store, _) = store();

        let a = store
            .create("/projects", attrs(json!({"name": "A", "unique": "name"})))
            .await
            .unwrap();
        let path = a["path"].as_str().unwrap();

        store
            .update(path, attrs(json!({"name": "A", "note": "same"})))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_update_retires_old_marker() {
        let (store, _) = store();

        let a = store
            .create("/projects", attrs(json!({"name": "old", "unique": "name"})))
            .await
            .unwrap();
        store
            .update(a["path"].as_str().unwrap(), attrs(json!({"name": "new"})))
            .await
            .unwrap();

        store
            .create("/projects", attrs(json!({"name": "old", "unique": "name"})))
            .await
            .unwrap();
        let err = store
            .create("/projects", attrs(json!({"name": "new", "unique": "name"})))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::UniqueConstraintViolation { .. }));
    }

    #[tokio::test]
    async fn test_update_creates_missing_resource() {
        let (store, _) = store();

        let updated = store
            .update("/projects/custom", attrs(json!({"name": "C"})))
            .await
            .unwrap();
        assert_eq!(updated["path"], "/projects/custom");
        assert_eq!(store.list("/projects").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_then_list() {
        let (store, _) = store();

        let a = store
            .create("/projects", attrs(json!({"name": "A"})))
            .await
            .unwrap();
        let path = a["path"].as_str().unwrap();

        assert!(store.delete(path).await.unwrap());
        assert!(store.list("/projects").await.unwrap().is_empty());
        assert!(store.get(path).await.unwrap().is_none());
        // idempotent
        assert!(store.delete(path).await.unwrap());
    }

    #[tokio::test]
    async fn test_list_on_resource_path_includes_resource() {
        let (store, _) = store();

        let project = store
            .create("/projects", attrs(json!({"name": "A"})))
            .await
            .unwrap();
        let path = project["path"].as_str().unwrap().to_string();
        let task = store
            .create(&format!("{path}/tasks"), attrs(json!({"title": "t"})))
            .await
            .unwrap();

        assert_eq!(store.list(&path).await.unwrap(), vec![project]);
        assert_eq!(
            store.list(&format!("{path}/tasks")).await.unwrap(),
            vec![task]
        );
        assert!(store.list("/projects/404").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_with_malformed_declaration_still_deletes() {
        let (store, table) = store();

        let key = ItemKey::resource("/projects/1").unwrap();
        table
            .replace(&key.pk, &key.sk, attrs(json!({"name": "A", "unique": 7})))
            .await
            .unwrap();

        assert!(store.delete("/projects/1").await.unwrap());
        assert!(store.get("/projects/1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_cascades_markers() {
        let (store, _) = store();

        let a = store
            .create("/projects", attrs(json!({"name": "A", "unique": "name"})))
            .await
            .unwrap();
        store.delete(a["path"].as_str().unwrap()).await.unwrap();

        store
            .create("/projects", attrs(json!({"name": "A", "unique": "name"})))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_delete_without_cascade_keeps_marker() {
        let table = Arc::new(MemoryTable::new());
        let store =
            ResourceStore::with_config(table, &StoreConfig::default().with_cascade(false));

        let a = store
            .create("/projects", attrs(json!({"name": "A", "unique": "name"})))
            .await
            .unwrap();
        store.delete(a["path"].as_str().unwrap()).await.unwrap();

        let err = store
            .create("/projects", attrs(json!({"name": "A", "unique": "name"})))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::UniqueConstraintViolation { .. }));
    }

    #[tokio::test]
    async fn test_invalid_paths_fail_fast() {
        let (store, table) = store();

        assert!(matches!(
            store.create("projects", Attributes::new()).await,
            Err(StoreError::InvalidPath(_))
        ));
        assert!(matches!(
            store.update("/projects", Attributes::new()).await,
            Err(StoreError::InvalidPath(_))
        ));
        assert!(matches!(
            store.delete("/").await,
            Err(StoreError::InvalidPath(_))
        ));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_unique_declaration() {
        let (store, table) = store();

        let err = store
            .create("/projects", attrs(json!({"name": "A", "unique": {"x": 1}})))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidBody(_)));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_provision() {
        let (store, _) = store();

        assert!(store.provision("/projects/").await.unwrap());
        let created = store
            .create("/projects", attrs(json!({"name": "A"})))
            .await
            .unwrap();
        assert_eq!(created["id"], 10004321);
    }

    #[tokio::test]
    async fn test_trailing_slash_collection() {
        let (store, _) = store();

        let created = store
            .create("/projects/", attrs(json!({"name": "A"})))
            .await
            .unwrap();
        assert_eq!(created["path"], "/projects/10004321");
        assert_eq!(store.list("/projects").await.unwrap().len(), 1);
    }
}
