//! Unique value enforcement within a collection.
//!
//! A resource declares its unique fields in its own `unique` attribute, either
//! a single field name or an array of names. For every declared field present
//! in the body the store keeps one marker item:
//!
//! ```text
//! PK    = PK(collection)
//! SK    = SK(collection)#unique#<field>#<value>
//! SK2   = SK                      (secondary index equality key)
//! Owner = /collection/<id>        (owning resource path)
//! ```
//!
//! [`UniqueIndexGuard::check`] is the advisory query-then-decide test on the
//! `(PK, SK2)` index. It can race with a concurrent writer and the index may
//! lag the table. [`UniqueIndexGuard::claim`] is the authoritative step: a
//! conditional create of the marker that fails if another resource owns it.

use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{Result, StoreError};
use crate::item::{Attributes, Item, ATTR_OWNER, ATTR_SK2, ATTR_UNIQUE};
use crate::keys::ItemKey;
use crate::table::KeyRangeTable;

/// A `field = value` pair that must be unique within its collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UniqueConstraint {
    pub field: String,
    /// Value as keyed in the marker: strings verbatim, anything else as JSON.
    pub value: String,
}

impl UniqueConstraint {
    pub fn new(field: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            value: value.into(),
        }
    }

    fn violation(&self, collection: &str) -> StoreError {
        StoreError::UniqueConstraintViolation {
            collection: collection.to_string(),
            field: self.field.clone(),
            value: self.value.clone(),
        }
    }
}

/// Names of the fields declared unique by an attribute bag.
pub fn declared_fields(attributes: &Attributes) -> Result<Vec<String>> {
    match attributes.get(ATTR_UNIQUE) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::String(field)) => Ok(vec![field.clone()]),
        Some(Value::Array(fields)) => fields
            .iter()
            .map(|field| {
                field.as_str().map(str::to_string).ok_or_else(|| {
                    StoreError::InvalidBody(format!(
                        "'{ATTR_UNIQUE}' entries must be field names, got {field}"
                    ))
                })
            })
            .collect(),
        Some(other) => Err(StoreError::InvalidBody(format!(
            "'{ATTR_UNIQUE}' must be a field name or a list of field names, got {other}"
        ))),
    }
}

/// Constraints imposed by an attribute bag.
///
/// Declared fields that are absent or null impose nothing.
pub fn constraints(attributes: &Attributes) -> Result<Vec<UniqueConstraint>> {
    let mut constraints = Vec::new();
    for field in declared_fields(attributes)? {
        let value = match attributes.get(&field) {
            None | Some(Value::Null) => continue,
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
        };
        let constraint = UniqueConstraint::new(field, value);
        if !constraints.contains(&constraint) {
            constraints.push(constraint);
        }
    }
    Ok(constraints)
}

fn owner_of(item: &Item) -> Option<&str> {
    item.attributes.get(ATTR_OWNER).and_then(Value::as_str)
}

/// Enforces at-most-one owner per unique value within a collection.
#[derive(Clone)]
pub struct UniqueIndexGuard {
    table: Arc<dyn KeyRangeTable>,
}

impl UniqueIndexGuard {
    pub fn new(table: Arc<dyn KeyRangeTable>) -> Self {
        Self { table }
    }

    /// Returns true if another resource already holds `constraint`.
    ///
    /// Matches owned by `exclude` (the resource being updated) are ignored.
    pub async fn check(
        &self,
        collection: &str,
        constraint: &UniqueConstraint,
        exclude: Option<&str>,
    ) -> Result<bool> {
        let key = ItemKey::unique_marker(collection, &constraint.field, &constraint.value)?;
        let matches = self.table.equality_query(&key.pk, &key.sk).await?;

        let violation = matches
            .iter()
            .any(|item| exclude.is_none() || owner_of(item) != exclude);
        debug!(
            collection,
            field = %constraint.field,
            matches = matches.len(),
            violation,
            "unique check"
        );
        Ok(violation)
    }

    /// Claim `constraint` for `owner`.
    ///
    /// Succeeds if the marker was created or is already owned by `owner`;
    /// fails with `UniqueConstraintViolation` otherwise.
    pub async fn claim(
        &self,
        collection: &str,
        constraint: &UniqueConstraint,
        owner: &str,
    ) -> Result<()> {
        let key = ItemKey::unique_marker(collection, &constraint.field, &constraint.value)?;

        // Second pass covers a marker released between our create and read.
        for _ in 0..2 {
            if self
                .table
                .put_if_absent(&key.pk, &key.sk, marker_attributes(&key, constraint, owner))
                .await?
            {
                return Ok(());
            }
            match self.table.get(&key.pk, &key.sk).await? {
                Some(existing) if owner_of(&existing) == Some(owner) => return Ok(()),
                Some(_) => return Err(constraint.violation(collection)),
                None => continue,
            }
        }
        Err(constraint.violation(collection))
    }

    /// Delete the marker for `constraint` if it is owned by `owner`.
    pub async fn release(
        &self,
        collection: &str,
        constraint: &UniqueConstraint,
        owner: &str,
    ) -> Result<()> {
        let key = ItemKey::unique_marker(collection, &constraint.field, &constraint.value)?;
        match self.table.get(&key.pk, &key.sk).await? {
            Some(existing) if owner_of(&existing) == Some(owner) => {
                self.table.remove(&key.pk, &key.sk).await
            }
            _ => Ok(()),
        }
    }

    /// Best-effort [`release`](Self::release); failures are logged, not returned.
    pub async fn retire(&self, collection: &str, constraint: &UniqueConstraint, owner: &str) {
        if let Err(err) = self.release(collection, constraint, owner).await {
            warn!(
                collection,
                owner,
                field = %constraint.field,
                error = %err,
                "failed to retire unique marker"
            );
        }
    }
}

fn marker_attributes(key: &ItemKey, constraint: &UniqueConstraint, owner: &str) -> Attributes {
    let mut attributes = Attributes::new();
    attributes.insert(ATTR_SK2.to_string(), Value::from(key.sk.clone()));
    attributes.insert(ATTR_OWNER.to_string(), Value::from(owner));
    attributes.insert("field".to_string(), Value::from(constraint.field.clone()));
    attributes.insert("value".to_string(), Value::from(constraint.value.clone()));
    attributes
}
