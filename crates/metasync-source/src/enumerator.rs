//! Source enumerator traits and the normalized shapes they return

use serde::{Deserialize, Serialize};
use std::fmt;

/// A database on a source server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseInfo {
    pub name: String,

    /// Engine-owned database (templates, internal catalogs)
    #[serde(default)]
    pub is_system: bool,
}

impl DatabaseInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), is_system: false }
    }
}

/// A schema inside one database
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaInfo {
    pub name: String,

    /// `pg_catalog`, `INFORMATION_SCHEMA` and the like
    #[serde(default)]
    pub is_system: bool,
}

impl SchemaInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), is_system: false }
    }
}

/// Whether a relation is catalogued as a TABLE or a VIEW node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TableKind {
    #[default]
    Table,
    View,
}

impl TableKind {
    /// Classify an engine-reported relation type
    pub fn from_table_type(table_type: &str) -> Self {
        if table_type.to_ascii_uppercase().contains("VIEW") {
            Self::View
        } else {
            Self::Table
        }
    }
}

/// A table or view inside one schema
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableInfo {
    pub name: String,

    #[serde(default)]
    pub kind: TableKind,

    /// Engine-reported relation type, e.g. `BASE TABLE`, `VIEW`, `MATERIALIZED VIEW`
    pub table_type: String,

    /// Raw SQL text for views, when the engine exposes it
    #[serde(default)]
    pub view_definition: Option<String>,

    #[serde(default)]
    pub is_system: bool,
}

impl TableInfo {
    pub fn table(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: TableKind::Table,
            table_type: "BASE TABLE".to_string(),
            view_definition: None,
            is_system: false,
        }
    }

    pub fn view(name: impl Into<String>, definition: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: TableKind::View,
            table_type: "VIEW".to_string(),
            view_definition: Some(definition.into()),
            is_system: false,
        }
    }

    pub fn is_view(&self) -> bool {
        self.kind == TableKind::View
    }
}

/// A column of a table or view
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
    pub is_nullable: bool,

    /// 1-based position within the relation
    pub ordinal_position: i32,
}

impl ColumnInfo {
    pub fn new(
        name: impl Into<String>,
        data_type: impl Into<String>,
        is_nullable: bool,
        ordinal_position: i32,
    ) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            is_nullable,
            ordinal_position,
        }
    }
}

/// Errors raised by source enumerators
///
/// Driver-specific failures are mapped into these variants inside each
/// enumerator. Network and authentication failures surface as
/// [`SourceError::Connectivity`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SourceError {
    #[error("Connectivity fault: {0}")]
    Connectivity(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Query failed: {0}")]
    QueryError(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl SourceError {
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Connectivity(_))
    }
}

/// Identifies an object on a source for error messages
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectPath<'a> {
    pub database: &'a str,
    pub schema: Option<&'a str>,
    pub table: Option<&'a str>,
}

impl fmt::Display for ObjectPath<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.database)?;
        if let Some(schema) = self.schema {
            write!(f, ".{}", schema)?;
        }
        if let Some(table) = self.table {
            write!(f, ".{}", table)?;
        }
        Ok(())
    }
}

/// Server-level entry point of a source engine
///
/// Implementations never filter by name: the engine re-applies scope
/// patterns uniformly after every listing.
#[async_trait::async_trait]
pub trait SourceEnumerator: Send + Sync {
    /// Engine name recorded on the server node (e.g. "postgres")
    fn engine(&self) -> &'static str;

    /// Check credentials and reachability
    async fn test_connection(&self) -> Result<(), SourceError>;

    /// `ListDatabases(serverConn)`
    async fn list_databases(&self) -> Result<Vec<DatabaseInfo>, SourceError>;

    /// Open the single connection used for one database's crawl
    ///
    /// The connection is released when the returned session is dropped.
    async fn open_database(&self, database: &str) -> Result<Box<dyn DatabaseSession>, SourceError>;
}

/// One open connection to one database
#[async_trait::async_trait]
pub trait DatabaseSession: Send + Sync {
    fn database(&self) -> &str;

    /// `ListSchemas(dbConn)`
    async fn list_schemas(&self) -> Result<Vec<SchemaInfo>, SourceError>;

    /// `ListTables(dbConn, schema, includeViews, includeSystemObjects)`
    async fn list_tables(
        &self,
        schema: &str,
        include_views: bool,
        include_system_objects: bool,
    ) -> Result<Vec<TableInfo>, SourceError>;

    /// `ListColumns(dbConn, schema, table)`, ordered by ordinal position
    async fn list_columns(&self, schema: &str, table: &str) -> Result<Vec<ColumnInfo>, SourceError>;

    /// Engine statistic; `None` when the engine has no estimate
    async fn estimate_row_count(&self, schema: &str, table: &str) -> Result<Option<i64>, SourceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_path_display() {
        let path = ObjectPath { database: "db", schema: Some("sales"), table: Some("orders") };
        assert_eq!(path.to_string(), "db.sales.orders");

        let path = ObjectPath { database: "db", schema: None, table: None };
        assert_eq!(path.to_string(), "db");
    }

    #[test]
    fn only_connectivity_is_connectivity() {
        assert!(SourceError::Connectivity("down".into()).is_connectivity());
        assert!(!SourceError::PermissionDenied("no".into()).is_connectivity());
    }

    #[test]
    fn view_kinds_from_table_type() {
        assert_eq!(TableKind::from_table_type("BASE TABLE"), TableKind::Table);
        assert_eq!(TableKind::from_table_type("EXTERNAL TABLE"), TableKind::Table);
        assert_eq!(TableKind::from_table_type("VIEW"), TableKind::View);
        assert_eq!(TableKind::from_table_type("materialized view"), TableKind::View);
    }

    #[test]
    fn table_info_constructors() {
        let t = TableInfo::table("orders");
        assert!(!t.is_view());
        assert_eq!(t.table_type, "BASE TABLE");

        let v = TableInfo::view("orders_v", "SELECT * FROM orders");
        assert!(v.is_view());
        assert_eq!(v.view_definition.as_deref(), Some("SELECT * FROM orders"));
    }
}
