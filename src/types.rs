//! Core type definitions shared across the cluster.
//!
//! # Key Types
//!
//! - [`DatabaseId`]: user-assigned identifier of one backend
//! - [`NodeAddress`]: address of one cooperating middleware node
//! - [`SchemaMap`]: tables per schema, discovered from a backend's catalog
//!
//! # Examples
//!
//! ```rust
//! use tandem::types::{DatabaseId, SchemaMap, TableRef};
//!
//! let id = DatabaseId::new("primary");
//! assert_eq!(id.as_str(), "primary");
//!
//! let schema_map = SchemaMap::from_tables(vec![
//!     TableRef::new(Some("public"), "orders"),
//!     TableRef::new(Some("public"), "customers"),
//!     TableRef::new(None::<&str>, "audit"),
//! ]);
//! assert_eq!(schema_map.table_count(), 3);
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Unique identifier for a backend database within a cluster.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DatabaseId(String);

impl DatabaseId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DatabaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DatabaseId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for DatabaseId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Address of a middleware node participating in group communication.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeAddress(String);

impl NodeAddress {
    pub fn new(addr: impl Into<String>) -> Self {
        Self(addr.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeAddress {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Transaction isolation levels a connection can be switched to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

/// A table reported by a backend's catalog.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableRef {
    /// Owning schema; `None` when the backend has no schema concept.
    pub schema: Option<String>,
    /// Table name.
    pub name: String,
}

impl TableRef {
    pub fn new(schema: Option<impl Into<String>>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.map(Into::into),
            name: name.into(),
        }
    }
}

/// Tables grouped by schema, in catalog order within each schema.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaMap {
    schemas: BTreeMap<Option<String>, Vec<String>>,
}

impl SchemaMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a schema map from catalog rows.
    pub fn from_tables(tables: impl IntoIterator<Item = TableRef>) -> Self {
        let mut map = Self::new();
        for table in tables {
            map.insert(table);
        }
        map
    }

    pub fn insert(&mut self, table: TableRef) {
        self.schemas.entry(table.schema).or_default().push(table.name);
    }

    /// Iterate over `(schema, tables)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (Option<&str>, &[String])> {
        self.schemas
            .iter()
            .map(|(schema, tables)| (schema.as_deref(), tables.as_slice()))
    }

    /// Iterate over every table, schema-qualified.
    pub fn tables(&self) -> impl Iterator<Item = (Option<&str>, &str)> {
        self.schemas.iter().flat_map(|(schema, tables)| {
            tables.iter().map(move |t| (schema.as_deref(), t.as_str()))
        })
    }

    pub fn table_count(&self) -> usize {
        self.schemas.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }
}
