//! PostgreSQL source enumerator using the system catalogs
//!
//! Databases come from `pg_database`, schemas from `pg_namespace`, relations
//! from `pg_class` and columns from `pg_attribute`. The catalogs are used
//! instead of `information_schema` because the latter hides objects the
//! crawling role has no privileges on, which would read as deletions.
//! It works with:
//! - PostgreSQL 9.4+
//! - Amazon Redshift
//! - Other PostgreSQL-compatible databases exposing `pg_catalog`
//!
//! ## Usage
//!
//! ```rust,ignore
//! let source = PostgresSource::new("localhost", 5432, "crawler")
//!     .with_password("secret")
//!     .with_tls(true);
//!
//! let databases = source.list_databases().await?;
//! let session = source.open_database("analytics").await?;
//! let schemas = session.list_schemas().await?;
//! ```
//!
//! Reference: https://www.postgresql.org/docs/current/catalogs.html

use crate::enumerator::{DatabaseInfo, DatabaseSession, SourceEnumerator, SourceError};

#[cfg(feature = "postgres")]
use crate::enumerator::{ColumnInfo, ObjectPath, SchemaInfo, TableInfo, TableKind};

#[cfg(feature = "postgres")]
use tokio_postgres::{Client, Config as PgConfig, NoTls};

#[cfg(feature = "postgres")]
use postgres_native_tls::MakeTlsConnector;

#[cfg(feature = "postgres")]
use native_tls::TlsConnector;

#[cfg(not(feature = "postgres"))]
const DISABLED: &str = "PostgreSQL support not compiled. Rebuild with: cargo build --features postgres";

/// PostgreSQL source enumerator
///
/// Holds connection parameters only. `list_databases` opens a short-lived
/// connection to the maintenance database; `open_database` opens the one
/// connection used for a database's crawl.
#[derive(Clone)]
pub struct PostgresSource {
    host: String,
    port: u16,
    user: String,
    password: Option<String>,
    tls: bool,

    /// Database used to list the others (usually `postgres`)
    maintenance_database: String,
}

impl PostgresSource {
    pub fn new(host: impl Into<String>, port: u16, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            user: user.into(),
            password: None,
            tls: false,
            maintenance_database: "postgres".to_string(),
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_tls(mut self, tls: bool) -> Self {
        self.tls = tls;
        self
    }

    pub fn with_maintenance_database(mut self, database: impl Into<String>) -> Self {
        self.maintenance_database = database.into();
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Schemas owned by the server itself
    pub fn is_system_schema(name: &str) -> bool {
        name == "pg_catalog"
            || name == "information_schema"
            || name.starts_with("pg_toast")
            || name.starts_with("pg_temp_")
    }

    /// Map a `pg_class.relkind` to a relation type, or `None` for
    /// indexes, sequences and other non-relations
    pub fn relation_type(relkind: &str) -> Option<&'static str> {
        match relkind {
            "r" => Some("BASE TABLE"),
            "p" => Some("PARTITIONED TABLE"),
            "f" => Some("FOREIGN TABLE"),
            "v" => Some("VIEW"),
            "m" => Some("MATERIALIZED VIEW"),
            _ => None,
        }
    }

    #[cfg(feature = "postgres")]
    async fn connect(&self, database: &str) -> Result<Client, SourceError> {
        let mut config = PgConfig::new();
        config
            .host(&self.host)
            .port(self.port)
            .user(&self.user)
            .dbname(database)
            .application_name("metasync");
        if let Some(password) = &self.password {
            config.password(password);
        }

        let endpoint = format!("{}:{}/{}", self.host, self.port, database);

        if self.tls {
            let connector = TlsConnector::builder()
                .build()
                .map_err(|e| SourceError::ConfigError(format!("Failed to create TLS connector: {}", e)))?;
            let (client, connection) = config
                .connect(MakeTlsConnector::new(connector))
                .await
                .map_err(|e| SourceError::Connectivity(format!("Failed to connect to {} with TLS: {}", endpoint, e)))?;
            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    tracing::warn!(endpoint = %endpoint, error = %e, "PostgreSQL TLS connection error");
                }
            });
            Ok(client)
        } else {
            let (client, connection) = config
                .connect(NoTls)
                .await
                .map_err(|e| SourceError::Connectivity(format!("Failed to connect to {}: {}", endpoint, e)))?;
            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    tracing::warn!(endpoint = %endpoint, error = %e, "PostgreSQL connection error");
                }
            });
            Ok(client)
        }
    }
}

/// Normalize a query error
#[cfg(feature = "postgres")]
fn classify(err: tokio_postgres::Error, object: &str) -> SourceError {
    use tokio_postgres::error::SqlState;

    if err.is_closed() {
        return SourceError::Connectivity(format!("{}: connection closed: {}", object, err));
    }

    match err.code() {
        None => SourceError::Connectivity(format!("{}: {}", object, err)),
        Some(code) if *code == SqlState::INSUFFICIENT_PRIVILEGE => {
            SourceError::PermissionDenied(format!("Cannot access {}: {}", object, err))
        }
        Some(code)
            if *code == SqlState::UNDEFINED_TABLE
                || *code == SqlState::INVALID_SCHEMA_NAME
                || *code == SqlState::INVALID_CATALOG_NAME =>
        {
            SourceError::NotFound(format!("{}: {}", object, err))
        }
        Some(code)
            if *code == SqlState::ADMIN_SHUTDOWN
                || *code == SqlState::CANNOT_CONNECT_NOW
                || *code == SqlState::INVALID_PASSWORD
                || *code == SqlState::INVALID_AUTHORIZATION_SPECIFICATION =>
        {
            SourceError::Connectivity(format!("{}: {}", object, err))
        }
        Some(_) => SourceError::QueryError(format!("{}: {}", object, err)),
    }
}

#[async_trait::async_trait]
impl SourceEnumerator for PostgresSource {
    fn engine(&self) -> &'static str {
        "postgres"
    }

    #[cfg(feature = "postgres")]
    async fn test_connection(&self) -> Result<(), SourceError> {
        let client = self.connect(&self.maintenance_database).await?;
        client
            .query("SELECT 1", &[])
            .await
            .map_err(|e| classify(e, &self.maintenance_database))?;
        Ok(())
    }

    #[cfg(not(feature = "postgres"))]
    async fn test_connection(&self) -> Result<(), SourceError> {
        Err(SourceError::ConfigError(DISABLED.to_string()))
    }

    #[cfg(feature = "postgres")]
    async fn list_databases(&self) -> Result<Vec<DatabaseInfo>, SourceError> {
        let client = self.connect(&self.maintenance_database).await?;
        let rows = client
            .query(
                "SELECT datname::text, datistemplate FROM pg_database WHERE datallowconn ORDER BY datname",
                &[],
            )
            .await
            .map_err(|e| classify(e, "pg_database"))?;

        Ok(rows
            .iter()
            .map(|row| DatabaseInfo {
                name: row.get(0),
                is_system: row.get(1),
            })
            .collect())
    }

    #[cfg(not(feature = "postgres"))]
    async fn list_databases(&self) -> Result<Vec<DatabaseInfo>, SourceError> {
        Err(SourceError::ConfigError(DISABLED.to_string()))
    }

    #[cfg(feature = "postgres")]
    async fn open_database(&self, database: &str) -> Result<Box<dyn DatabaseSession>, SourceError> {
        let client = self.connect(database).await?;
        Ok(Box::new(PostgresSession {
            client,
            database: database.to_string(),
        }))
    }

    #[cfg(not(feature = "postgres"))]
    async fn open_database(&self, _database: &str) -> Result<Box<dyn DatabaseSession>, SourceError> {
        Err(SourceError::ConfigError(DISABLED.to_string()))
    }
}

/// One connection to one database
///
/// Dropping the client closes the connection and ends its background task.
#[cfg(feature = "postgres")]
struct PostgresSession {
    client: Client,
    database: String,
}

#[cfg(feature = "postgres")]
impl PostgresSession {
    fn path<'a>(&'a self, schema: &'a str, table: Option<&'a str>) -> String {
        ObjectPath { database: &self.database, schema: Some(schema), table }.to_string()
    }

    async fn relation_exists(&self, schema: &str, table: &str) -> Result<bool, SourceError> {
        let row = self
            .client
            .query_opt(
                "SELECT 1 FROM pg_class c JOIN pg_namespace n ON n.oid = c.relnamespace \
                 WHERE n.nspname = $1 AND c.relname = $2",
                &[&schema, &table],
            )
            .await
            .map_err(|e| classify(e, &self.path(schema, Some(table))))?;
        Ok(row.is_some())
    }
}

#[cfg(feature = "postgres")]
#[async_trait::async_trait]
impl DatabaseSession for PostgresSession {
    fn database(&self) -> &str {
        &self.database
    }

    async fn list_schemas(&self) -> Result<Vec<SchemaInfo>, SourceError> {
        let rows = self
            .client
            .query("SELECT nspname::text FROM pg_namespace ORDER BY nspname", &[])
            .await
            .map_err(|e| classify(e, &self.database))?;

        Ok(rows
            .iter()
            .map(|row| {
                let name: String = row.get(0);
                let is_system = PostgresSource::is_system_schema(&name);
                SchemaInfo { name, is_system }
            })
            .collect())
    }

    async fn list_tables(
        &self,
        schema: &str,
        include_views: bool,
        include_system_objects: bool,
    ) -> Result<Vec<TableInfo>, SourceError> {
        let is_system = PostgresSource::is_system_schema(schema);
        if is_system && !include_system_objects {
            return Ok(Vec::new());
        }

        let rows = self
            .client
            .query(
                "SELECT c.relname::text, c.relkind::text, \
                        CASE WHEN c.relkind IN ('v', 'm') THEN pg_get_viewdef(c.oid) END \
                 FROM pg_class c JOIN pg_namespace n ON n.oid = c.relnamespace \
                 WHERE n.nspname = $1 AND c.relkind IN ('r', 'p', 'f', 'v', 'm') \
                 ORDER BY c.relname",
                &[&schema],
            )
            .await
            .map_err(|e| classify(e, &self.path(schema, None)))?;

        let mut tables = Vec::with_capacity(rows.len());
        for row in rows {
            let relkind: String = row.get(1);
            let Some(table_type) = PostgresSource::relation_type(&relkind) else {
                continue;
            };
            let kind = TableKind::from_table_type(table_type);
            if kind == TableKind::View && !include_views {
                continue;
            }
            tables.push(TableInfo {
                name: row.get(0),
                kind,
                table_type: table_type.to_string(),
                view_definition: row.get(2),
                is_system,
            });
        }
        Ok(tables)
    }

    async fn list_columns(&self, schema: &str, table: &str) -> Result<Vec<ColumnInfo>, SourceError> {
        let rows = self
            .client
            .query(
                "SELECT a.attname::text, format_type(a.atttypid, a.atttypmod), \
                        NOT a.attnotnull, a.attnum::int4 \
                 FROM pg_attribute a \
                 JOIN pg_class c ON c.oid = a.attrelid \
                 JOIN pg_namespace n ON n.oid = c.relnamespace \
                 WHERE n.nspname = $1 AND c.relname = $2 \
                   AND a.attnum > 0 AND NOT a.attisdropped \
                 ORDER BY a.attnum",
                &[&schema, &table],
            )
            .await
            .map_err(|e| classify(e, &self.path(schema, Some(table))))?;

        if rows.is_empty() && !self.relation_exists(schema, table).await? {
            return Err(SourceError::NotFound(self.path(schema, Some(table))));
        }

        Ok(rows
            .iter()
            .map(|row| ColumnInfo {
                name: row.get(0),
                data_type: row.get(1),
                is_nullable: row.get(2),
                ordinal_position: row.get(3),
            })
            .collect())
    }

    async fn estimate_row_count(&self, schema: &str, table: &str) -> Result<Option<i64>, SourceError> {
        let row = self
            .client
            .query_opt(
                "SELECT c.reltuples::bigint FROM pg_class c \
                 JOIN pg_namespace n ON n.oid = c.relnamespace \
                 WHERE n.nspname = $1 AND c.relname = $2",
                &[&schema, &table],
            )
            .await
            .map_err(|e| classify(e, &self.path(schema, Some(table))))?;

        // reltuples is -1 until the table is first analyzed
        Ok(row.map(|r| r.get::<_, i64>(0)).filter(|n| *n >= 0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_schemas() {
        assert!(PostgresSource::is_system_schema("pg_catalog"));
        assert!(PostgresSource::is_system_schema("information_schema"));
        assert!(PostgresSource::is_system_schema("pg_toast"));
        assert!(PostgresSource::is_system_schema("pg_toast_temp_1"));
        assert!(PostgresSource::is_system_schema("pg_temp_3"));
        assert!(!PostgresSource::is_system_schema("public"));
        assert!(!PostgresSource::is_system_schema("pg_analytics"));
    }

    #[test]
    fn relation_types() {
        assert_eq!(PostgresSource::relation_type("r"), Some("BASE TABLE"));
        assert_eq!(PostgresSource::relation_type("p"), Some("PARTITIONED TABLE"));
        assert_eq!(PostgresSource::relation_type("f"), Some("FOREIGN TABLE"));
        assert_eq!(PostgresSource::relation_type("v"), Some("VIEW"));
        assert_eq!(PostgresSource::relation_type("m"), Some("MATERIALIZED VIEW"));
        assert_eq!(PostgresSource::relation_type("i"), None);
        assert_eq!(PostgresSource::relation_type("S"), None);
    }

    #[test]
    fn builder_settings() {
        let source = PostgresSource::new("db.internal", 6432, "crawler")
            .with_password("pw")
            .with_tls(true)
            .with_maintenance_database("template1");
        assert_eq!(source.host(), "db.internal");
        assert_eq!(source.port(), 6432);
        assert_eq!(source.engine(), "postgres");
    }

    #[cfg(not(feature = "postgres"))]
    #[tokio::test]
    async fn disabled_feature_reports_config_error() {
        let source = PostgresSource::new("localhost", 5432, "crawler");
        assert!(matches!(source.list_databases().await, Err(SourceError::ConfigError(_))));
        assert!(matches!(source.open_database("x").await, Err(SourceError::ConfigError(_))));
    }
}
