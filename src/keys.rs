//! Path to key translation.
//!
//! Every partition and sort key in the table is derived here. A path such as
//! `/users/42/orders/7` maps to:
//!
//! - partition key `users#42#orders` (first three segments)
//! - sort key `users#42#orders#7` (all segments)
//!
//! Segments are escaped before joining so that a raw `#` can never act as a
//! separator and a raw segment can never forge an internal suffix:
//!
//! | raw               | escaped      |
//! |-------------------|--------------|
//! | `%`               | `%25`        |
//! | `#`               | `%23`        |
//! | `counter` (whole) | `%63ounter`  |
//! | `unique` (whole)  | `%75nique`   |

use std::borrow::Cow;

use crate::error::{Result, StoreError};

/// Separator placed between escaped segments in partition and sort keys.
pub const KEY_SEPARATOR: char = '#';

/// Number of leading segments that form the partition key.
pub const PARTITION_DEPTH: usize = 3;

/// Maximum path length in bytes.
pub const MAX_PATH_LENGTH: usize = 1024;

/// Sort key suffix of a collection's counter item.
pub const COUNTER_SUFFIX: &str = "counter";

/// Sort key tag introducing a unique-marker item.
pub const UNIQUE_TAG: &str = "unique";

const RESERVED_SEGMENTS: [&str; 2] = [COUNTER_SUFFIX, UNIQUE_TAG];

/// Split a path into its raw segments.
///
/// The path must start with `/`, contain at least one segment and no empty
/// segments. One trailing `/` is tolerated.
pub fn segments(path: &str) -> Result<Vec<&str>> {
    if path.len() > MAX_PATH_LENGTH {
        return Err(StoreError::InvalidPath(format!(
            "path exceeds maximum length of {} bytes",
            MAX_PATH_LENGTH
        )));
    }
    let trimmed = path
        .strip_prefix('/')
        .ok_or_else(|| StoreError::InvalidPath(format!("path must start with '/': {path:?}")))?;
    let trimmed = trimmed.strip_suffix('/').unwrap_or(trimmed);
    if trimmed.is_empty() {
        return Err(StoreError::InvalidPath(format!(
            "path has no segments: {path:?}"
        )));
    }

    let segments: Vec<&str> = trimmed.split('/').collect();
    if segments.iter().any(|s| s.is_empty()) {
        return Err(StoreError::InvalidPath(format!(
            "path contains an empty segment: {path:?}"
        )));
    }
    Ok(segments)
}

/// Escape a single raw segment (or any free-form key component).
pub fn escape_segment(segment: &str) -> Cow<'_, str> {
    if RESERVED_SEGMENTS.contains(&segment) {
        let mut chars = segment.chars();
        // reserved words are ASCII
        let first = chars.next().map(|c| c as u32).unwrap_or_default();
        return Cow::Owned(format!("%{:02X}{}", first, chars.as_str()));
    }
    if !segment.contains(['%', KEY_SEPARATOR]) {
        return Cow::Borrowed(segment);
    }

    let mut escaped = String::with_capacity(segment.len() + 4);
    for c in segment.chars() {
        match c {
            '%' => escaped.push_str("%25"),
            KEY_SEPARATOR => escaped.push_str("%23"),
            c => escaped.push(c),
        }
    }
    Cow::Owned(escaped)
}

fn join_escaped<'a>(parts: impl Iterator<Item = &'a str>) -> String {
    let mut key = String::new();
    for (i, part) in parts.enumerate() {
        if i > 0 {
            key.push(KEY_SEPARATOR);
        }
        key.push_str(&escape_segment(part));
    }
    key
}

/// Partition key of a path: the first three segments joined by the separator.
pub fn partition_key(path: &str) -> Result<String> {
    let segments = segments(path)?;
    Ok(join_escaped(segments.into_iter().take(PARTITION_DEPTH)))
}

/// Sort key of a path: all segments joined by the separator.
pub fn sort_key(path: &str) -> Result<String> {
    let segments = segments(path)?;
    Ok(join_escaped(segments.into_iter()))
}

/// Split a resource path into its parent collection path and final segment.
pub fn split_parent(path: &str) -> Result<(String, String)> {
    let segments = segments(path)?;
    match segments.split_last() {
        Some((last, parent)) if !parent.is_empty() => {
            Ok((format!("/{}", parent.join("/")), (*last).to_string()))
        }
        _ => Err(StoreError::InvalidPath(format!(
            "resource path needs a parent collection: {path:?}"
        ))),
    }
}

/// Normalized form of a path (leading `/`, no trailing `/`).
pub fn normalize(path: &str) -> Result<String> {
    Ok(format!("/{}", segments(path)?.join("/")))
}

/// Primary key of a single item.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ItemKey {
    pub pk: String,
    pub sk: String,
}

impl ItemKey {
    /// Key of the resource stored at `path`.
    ///
    /// The item lives in its parent collection's partition so that listing
    /// the collection is a single range query.
    pub fn resource(path: &str) -> Result<Self> {
        let (collection, _) = split_parent(path)?;
        Ok(Self {
            pk: partition_key(&collection)?,
            sk: sort_key(path)?,
        })
    }

    /// Key of the id counter for a collection.
    pub fn counter(collection: &str) -> Result<Self> {
        Ok(Self {
            pk: partition_key(collection)?,
            sk: format!("{}{}{}", sort_key(collection)?, KEY_SEPARATOR, COUNTER_SUFFIX),
        })
    }

    /// Key of the marker guarding `field = value` within a collection.
    ///
    /// The sort key doubles as the marker's `SK2` index value.
    pub fn unique_marker(collection: &str, field: &str, value: &str) -> Result<Self> {
        Ok(Self {
            pk: partition_key(collection)?,
            sk: format!(
                "{coll}{sep}{tag}{sep}{field}{sep}{value}",
                coll = sort_key(collection)?,
                sep = KEY_SEPARATOR,
                tag = UNIQUE_TAG,
                field = escape_segment(field),
                value = escape_segment(value),
            ),
        })
    }
}

/// Range-query scope covering the members of a collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionScope {
    pub pk: String,
    /// Sort key prefix shared by every member: `SK(collection)#`.
    pub prefix: String,
}

impl CollectionScope {
    pub fn of(collection: &str) -> Result<Self> {
        Ok(Self {
            pk: partition_key(collection)?,
            prefix: format!("{}{}", sort_key(collection)?, KEY_SEPARATOR),
        })
    }

    /// Returns true if `sk` names a direct member resource of the collection.
    ///
    /// Excludes nested descendants, the counter item and unique markers.
    pub fn is_member(&self, sk: &str) -> bool {
        match sk.strip_prefix(&self.prefix) {
            Some(rest) => {
                !rest.is_empty() && !rest.contains(KEY_SEPARATOR) && rest != COUNTER_SUFFIX
            }
            None => false,
        }
    }
}
