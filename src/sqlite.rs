//! SQLite key-range table.
//!
//! Features:
//! - WAL mode for concurrent readers
//! - `(pk, sk)` primary key, partial index on `(pk, sk2)` as the equality index
//! - attribute bags stored as JSON text
//! - single-statement atomic increments via SQLite JSON functions

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{Result, StoreError};
use crate::item::{merge, sk2_of, Attributes, Item};
use crate::table::{validate_key, KeyRangeTable, ReturnValues};

/// SQLite implementation of KeyRangeTable.
///
/// Uses WAL mode for performance and durability. Lock contention surfaces as
/// `Throttled` and may be retried by the caller.
pub struct SqliteTable {
    pool: SqlitePool,
}

impl SqliteTable {
    /// Open or create a SQLite table at the given path.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!("Opening SQLite table at {:?}", path);

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))
            .map_err(|e| StoreError::StoreUnavailable(e.to_string()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::StoreUnavailable(e.to_string()))?;

        let table = Self { pool };
        table.init_schema().await?;
        Ok(table)
    }

    /// Create an in-memory SQLite table (for testing).
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| StoreError::StoreUnavailable(e.to_string()))?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::StoreUnavailable(e.to_string()))?;

        let table = Self { pool };
        table.init_schema().await?;
        Ok(table)
    }

    /// Initialize the database schema.
    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS items (
                pk TEXT NOT NULL,
                sk TEXT NOT NULL,
                sk2 TEXT,
                attributes TEXT NOT NULL,
                PRIMARY KEY (pk, sk)
            );

            CREATE INDEX IF NOT EXISTS idx_items_pk_sk2 ON items(pk, sk2) WHERE sk2 IS NOT NULL;
            "#,
        )
        .execute(&self.pool)
        .await?;

        debug!("SQLite schema initialized");
        Ok(())
    }

    fn decode(pk: String, sk: String, attributes: &str) -> Result<Item> {
        let attributes: Attributes = serde_json::from_str(attributes)?;
        Ok(Item { pk, sk, attributes })
    }

    fn json_path(attribute: &str) -> String {
        format!("$.\"{}\"", attribute.replace('"', "\\\""))
    }
}

#[async_trait]
impl KeyRangeTable for SqliteTable {
    async fn range_query(&self, pk: &str, sk_prefix: &str) -> Result<Vec<Item>> {
        let rows: Vec<(String, String, String)> = sqlx::query_as(
            "SELECT pk, sk, attributes FROM items \
             WHERE pk = ? AND substr(sk, 1, length(?)) = ? ORDER BY sk",
        )
        .bind(pk)
        .bind(sk_prefix)
        .bind(sk_prefix)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(pk, sk, attrs)| Self::decode(pk, sk, &attrs))
            .collect()
    }

    async fn equality_query(&self, pk: &str, sk2: &str) -> Result<Vec<Item>> {
        let rows: Vec<(String, String, String)> = sqlx::query_as(
            "SELECT pk, sk, attributes FROM items WHERE pk = ? AND sk2 = ? ORDER BY sk",
        )
        .bind(pk)
        .bind(sk2)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(pk, sk, attrs)| Self::decode(pk, sk, &attrs))
            .collect()
    }

    async fn get(&self, pk: &str, sk: &str) -> Result<Option<Item>> {
        validate_key(pk, sk)?;

        let row: Option<(String,)> =
            sqlx::query_as("SELECT attributes FROM items WHERE pk = ? AND sk = ?")
                .bind(pk)
                .bind(sk)
                .fetch_optional(&self.pool)
                .await?;

        row.map(|(attrs,)| Self::decode(pk.to_string(), sk.to_string(), &attrs))
            .transpose()
    }

    async fn replace(&self, pk: &str, sk: &str, attributes: Attributes) -> Result<()> {
        validate_key(pk, sk)?;

        let sk2 = sk2_of(&attributes).map(str::to_string);
        let encoded = serde_json::to_string(&attributes)?;

        sqlx::query(
            r#"
            INSERT INTO items (pk, sk, sk2, attributes)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(pk, sk) DO UPDATE SET
                sk2 = excluded.sk2,
                attributes = excluded.attributes
            "#,
        )
        .bind(pk)
        .bind(sk)
        .bind(sk2)
        .bind(encoded)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn put_if_absent(&self, pk: &str, sk: &str, attributes: Attributes) -> Result<bool> {
        validate_key(pk, sk)?;

        let sk2 = sk2_of(&attributes).map(str::to_string);
        let encoded = serde_json::to_string(&attributes)?;

        let result = sqlx::query(
            "INSERT INTO items (pk, sk, sk2, attributes) VALUES (?, ?, ?, ?) \
             ON CONFLICT(pk, sk) DO NOTHING",
        )
        .bind(pk)
        .bind(sk)
        .bind(sk2)
        .bind(encoded)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn partial_update(
        &self,
        pk: &str,
        sk: &str,
        attributes: Attributes,
        returns: ReturnValues,
    ) -> Result<Attributes> {
        validate_key(pk, sk)?;

        // Write lock held from the first read; contention waits on busy_timeout.
        let mut tx = self.pool.begin_with("BEGIN IMMEDIATE").await?;

        let row: Option<(String,)> =
            sqlx::query_as("SELECT attributes FROM items WHERE pk = ? AND sk = ?")
                .bind(pk)
                .bind(sk)
                .fetch_optional(&mut *tx)
                .await?;

        let old: Attributes = match row {
            Some((attrs,)) => serde_json::from_str(&attrs)?,
            None => Attributes::new(),
        };
        let mut new = old.clone();
        merge(&mut new, attributes);

        let sk2 = sk2_of(&new).map(str::to_string);
        let encoded = serde_json::to_string(&new)?;

        sqlx::query(
            r#"
            INSERT INTO items (pk, sk, sk2, attributes)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(pk, sk) DO UPDATE SET
                sk2 = excluded.sk2,
                attributes = excluded.attributes
            "#,
        )
        .bind(pk)
        .bind(sk)
        .bind(sk2)
        .bind(encoded)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(match returns {
            ReturnValues::None => Attributes::new(),
            ReturnValues::AllOld => old,
            ReturnValues::AllNew => new,
        })
    }

    async fn increment(&self, pk: &str, sk: &str, attribute: &str, by: i64) -> Result<i64> {
        validate_key(pk, sk)?;

        let path = Self::json_path(attribute);
        let row: Option<(i64,)> = sqlx::query_as(
            r#"
            UPDATE items
            SET attributes = json_set(attributes, ?1, json_extract(attributes, ?1) + ?2)
            WHERE pk = ?3 AND sk = ?4 AND json_type(attributes, ?1) = 'integer'
            RETURNING json_extract(attributes, ?1)
            "#,
        )
        .bind(&path)
        .bind(by)
        .bind(pk)
        .bind(sk)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|(value,)| value)
            .ok_or_else(|| StoreError::CounterUninitialized(format!("{pk}/{sk}")))
    }

    async fn remove(&self, pk: &str, sk: &str) -> Result<()> {
        validate_key(pk, sk)?;

        sqlx::query("DELETE FROM items WHERE pk = ? AND sk = ?")
            .bind(pk)
            .bind(sk)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn attrs(value: Value) -> Attributes {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_sqlite_replace_and_get() {
        let table = SqliteTable::in_memory().await.unwrap();

        table
            .replace("projects", "projects#1", attrs(json!({"name": "X", "n": 2})))
            .await
            .unwrap();

        let item = table.get("projects", "projects#1").await.unwrap().unwrap();
        assert_eq!(item.sk, "projects#1");
        assert_eq!(item.attributes, attrs(json!({"name": "X", "n": 2})));
    }

    #[tokio::test]
    async fn test_sqlite_remove() {
        let table = SqliteTable::in_memory().await.unwrap();

        table.replace("p", "s", Attributes::new()).await.unwrap();
        table.remove("p", "s").await.unwrap();
        assert!(table.get("p", "s").await.unwrap().is_none());
        table.remove("p", "s").await.unwrap();
    }

    #[tokio::test]
    async fn test_sqlite_range_query() {
        let table = SqliteTable::in_memory().await.unwrap();

        table.replace("projects", "projects#2", Attributes::new()).await.unwrap();
        table.replace("projects", "projects#1", Attributes::new()).await.unwrap();
        table.replace("projects", "other#1", Attributes::new()).await.unwrap();

        let items = table.range_query("projects", "projects#").await.unwrap();
        let sks: Vec<_> = items.iter().map(|i| i.sk.as_str()).collect();
        assert_eq!(sks, vec!["projects#1", "projects#2"]);
    }

    #[tokio::test]
    async fn test_sqlite_prefix_is_literal() {
        let table = SqliteTable::in_memory().await.unwrap();

        table.replace("p", "a%b", Attributes::new()).await.unwrap();
        table.replace("p", "axb", Attributes::new()).await.unwrap();

        let items = table.range_query("p", "a%").await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].sk, "a%b");
    }

    #[tokio::test]
    async fn test_sqlite_equality_query() {
        let table = SqliteTable::in_memory().await.unwrap();

        table
            .replace("p", "m1", attrs(json!({"SK2": "name#X", "Owner": "/p/1"})))
            .await
            .unwrap();
        table
            .replace("p", "m2", attrs(json!({"SK2": "name#Y"})))
            .await
            .unwrap();

        let items = table.equality_query("p", "name#X").await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].attributes["Owner"], "/p/1");
    }

    #[tokio::test]
    async fn test_sqlite_put_if_absent() {
        let table = SqliteTable::in_memory().await.unwrap();

        assert!(table.put_if_absent("p", "s", attrs(json!({"v": 1}))).await.unwrap());
        assert!(!table.put_if_absent("p", "s", attrs(json!({"v": 2}))).await.unwrap());

        let item = table.get("p", "s").await.unwrap().unwrap();
        assert_eq!(item.attributes["v"], 1);
    }

    #[tokio::test]
    async fn test_sqlite_partial_update() {
        let table = SqliteTable::in_memory().await.unwrap();

        table
            .replace("p", "s", attrs(json!({"a": 1, "b": 2})))
            .await
            .unwrap();

        let old = table
            .partial_update("p", "s", attrs(json!({"b": 3})), ReturnValues::AllOld)
            .await
            .unwrap();
        assert_eq!(old, attrs(json!({"a": 1, "b": 2})));

        let new = table
            .partial_update("p", "s", attrs(json!({"c": 4})), ReturnValues::AllNew)
            .await
            .unwrap();
        assert_eq!(new, attrs(json!({"a": 1, "b": 3, "c": 4})));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_sqlite_concurrent_partial_updates_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let table = SqliteTable::open(dir.path().join("items.db")).await.unwrap();
        let table = std::sync::Arc::new(table);
        table.replace("p", "s", Attributes::new()).await.unwrap();

        let handles: Vec<_> = (0..100)
            .map(|i| {
                let table = table.clone();
                let mut body = Attributes::new();
                body.insert(format!("f{i}"), json!(i));
                tokio::spawn(async move {
                    table
                        .partial_update("p", "s", body, ReturnValues::None)
                        .await
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        // no lost updates: every writer's field survived
        let item = table.get("p", "s").await.unwrap().unwrap();
        assert_eq!(item.attributes.len(), 100);
    }

    #[tokio::test]
    async fn test_sqlite_increment() {
        let table = SqliteTable::in_memory().await.unwrap();

        let err = table.increment("p", "c", "Increment", 1).await.unwrap_err();
        assert!(matches!(err, StoreError::CounterUninitialized(_)));

        table
            .replace("p", "c", attrs(json!({"Increment": 10004320})))
            .await
            .unwrap();
        assert_eq!(
            table.increment("p", "c", "Increment", 1).await.unwrap(),
            10004321
        );
        assert_eq!(
            table.increment("p", "c", "Increment", 1).await.unwrap(),
            10004322
        );

        let item = table.get("p", "c").await.unwrap().unwrap();
        assert_eq!(item.attributes["Increment"], 10004322);
    }

    #[tokio::test]
    async fn test_sqlite_open_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("items.db");

        {
            let table = SqliteTable::open(&path).await.unwrap();
            table
                .replace("p", "s", attrs(json!({"kept": true})))
                .await
                .unwrap();
            table.close().await;
        }

        let table = SqliteTable::open(&path).await.unwrap();
        let item = table.get("p", "s").await.unwrap().unwrap();
        assert_eq!(item.attributes["kept"], true);
    }
}
