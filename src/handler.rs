//! Request dispatch for transport adapters.
//!
//! An adapter (HTTP, queue consumer, CLI) supplies an [`Operation`], a path
//! and an optional JSON body, and turns the outcome into a [`Response`].
//! Origin checks, CORS and framing stay in the adapter.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::str::FromStr;

use crate::error::{Result, StoreError};
use crate::item::Attributes;
use crate::resource::ResourceStore;

/// Logical operation requested by an adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    List,
    Get,
    Create,
    Update,
    Delete,
}

impl Operation {
    /// Map an HTTP method to an operation.
    ///
    /// `GET` lists, which on a resource path yields the resource itself; use
    /// [`Operation::Get`] explicitly for a single optional read.
    pub fn from_method(method: &str) -> Result<Self> {
        match method.to_ascii_uppercase().as_str() {
            "GET" => Ok(Operation::List),
            "POST" => Ok(Operation::Create),
            "PUT" | "PATCH" => Ok(Operation::Update),
            "DELETE" => Ok(Operation::Delete),
            other => Err(StoreError::InvalidBody(format!(
                "unsupported method: {other:?}"
            ))),
        }
    }
}

impl FromStr for Operation {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "list" => Ok(Operation::List),
            "get" => Ok(Operation::Get),
            "create" => Ok(Operation::Create),
            "update" => Ok(Operation::Update),
            "delete" => Ok(Operation::Delete),
            other => Err(StoreError::InvalidBody(format!(
                "unknown operation: {other:?}"
            ))),
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::List => "list",
            Operation::Get => "get",
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
        };
        f.write_str(name)
    }
}

/// Status code and JSON body for an adapter to send back.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Response {
    pub status: u16,
    pub body: Value,
}

impl Response {
    fn ok(body: Value) -> Self {
        Self { status: 200, body }
    }
}

/// Run `op` against `store`.
pub async fn dispatch(
    store: &ResourceStore,
    op: Operation,
    path: &str,
    body: Option<Value>,
) -> Result<Value> {
    match op {
        Operation::List => {
            let items = store.list(path).await?;
            Ok(Value::Array(items.into_iter().map(Value::Object).collect()))
        }
        Operation::Get => Ok(store
            .get(path)
            .await?
            .map(Value::Object)
            .unwrap_or(Value::Null)),
        Operation::Create => {
            let created = store.create(path, object_body(body)?).await?;
            Ok(Value::Object(created))
        }
        Operation::Update => {
            let updated = store.update(path, object_body(body)?).await?;
            Ok(Value::Object(updated))
        }
        Operation::Delete => {
            store.delete(path).await?;
            Ok(json!({ "deleted": path }))
        }
    }
}

/// Turn a dispatch outcome into a response.
pub fn respond(result: Result<Value>) -> Response {
    match result {
        Ok(body) => Response::ok(body),
        Err(err) => Response {
            status: err.status_code(),
            body: json!({ "error": err.to_string() }),
        },
    }
}

fn object_body(body: Option<Value>) -> Result<Attributes> {
    match body {
        Some(Value::Object(attributes)) => Ok(attributes),
        Some(other) => Err(StoreError::InvalidBody(format!(
            "body must be a JSON object, got {other}"
        ))),
        None => Err(StoreError::InvalidBody("body is required".to_string())),
    }
}
