//! Snowflake source enumerator using INFORMATION_SCHEMA
//!
//! Databases are listed from `SNOWFLAKE.INFORMATION_SCHEMA.DATABASES` and
//! everything below from the per-database `INFORMATION_SCHEMA` views. The
//! crawling role needs:
//! - USAGE on each database and schema to be catalogued
//! - SELECT on the INFORMATION_SCHEMA views
//!
//! ## Authentication Methods
//!
//! 1. Password authentication (username/password)
//! 2. Key-pair authentication (private key PEM)
//!
//! ## Usage
//!
//! ```rust,ignore
//! let source = SnowflakeSource::with_password("xy12345.us-east-1", "crawler", "secret")
//!     .with_warehouse("COMPUTE_WH")
//!     .with_role("CATALOG_READER");
//!
//! let databases = source.list_databases().await?;
//! ```
//!
//! Reference: https://docs.snowflake.com/en/sql-reference/info-schema

use crate::enumerator::{DatabaseInfo, DatabaseSession, SourceEnumerator, SourceError};

#[cfg(feature = "snowflake")]
use crate::enumerator::{ColumnInfo, ObjectPath, SchemaInfo, TableInfo, TableKind};

#[cfg(feature = "snowflake")]
use snowflake_api::{QueryResult, SnowflakeApi};

#[cfg(feature = "snowflake")]
use arrow_array::cast::AsArray;

#[cfg(feature = "snowflake")]
use arrow_array::Array;

#[cfg(not(feature = "snowflake"))]
const DISABLED: &str = "Snowflake support not compiled. Rebuild with: cargo build --features snowflake";

/// Snowflake authentication credentials
#[derive(Clone)]
pub enum SnowflakeCredentials {
    /// Password-based authentication
    Password(String),
    /// Key-pair authentication (PEM format private key)
    PrivateKey(String),
}

/// Snowflake source enumerator
///
/// Every call to `open_database` authenticates a fresh API session bound to
/// that database; the session is closed when it is dropped.
#[derive(Clone)]
pub struct SnowflakeSource {
    account: String,
    username: String,
    credentials: SnowflakeCredentials,
    warehouse: Option<String>,
    role: Option<String>,
}

impl SnowflakeSource {
    pub fn with_password(
        account: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            account: account.into(),
            username: username.into(),
            credentials: SnowflakeCredentials::Password(password.into()),
            warehouse: None,
            role: None,
        }
    }

    pub fn with_key_pair(
        account: impl Into<String>,
        username: impl Into<String>,
        private_key_pem: impl Into<String>,
    ) -> Self {
        Self {
            account: account.into(),
            username: username.into(),
            credentials: SnowflakeCredentials::PrivateKey(private_key_pem.into()),
            warehouse: None,
            role: None,
        }
    }

    /// Set the warehouse used to run catalog queries
    pub fn with_warehouse(mut self, warehouse: impl Into<String>) -> Self {
        self.warehouse = Some(warehouse.into());
        self
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    /// Render a string literal for a catalog query
    pub fn quote_literal(value: &str) -> String {
        format!("'{}'", value.replace('\'', "''"))
    }

    /// Render a quoted identifier
    pub fn quote_ident(value: &str) -> String {
        format!("\"{}\"", value.replace('"', "\"\""))
    }

    /// Build the full column type, e.g. `NUMBER(38,0)` or `VARCHAR(16777216)`
    pub fn full_data_type(
        data_type: &str,
        precision: Option<&str>,
        scale: Option<&str>,
        char_length: Option<&str>,
    ) -> String {
        match data_type {
            "NUMBER" => match (precision, scale) {
                (Some(p), Some(s)) => format!("NUMBER({},{})", p, s),
                (Some(p), None) => format!("NUMBER({})", p),
                _ => data_type.to_string(),
            },
            "TEXT" | "VARCHAR" | "BINARY" => match char_length {
                Some(len) => format!("{}({})", data_type, len),
                None => data_type.to_string(),
            },
            _ => data_type.to_string(),
        }
    }

    /// Map a driver error message to a normalized error
    pub fn classify_message(message: &str, object: &str) -> SourceError {
        let lower = message.to_lowercase();
        if lower.contains("does not exist") || lower.contains("not found") {
            SourceError::NotFound(format!("{}: {}", object, message))
        } else if lower.contains("insufficient privileges") || lower.contains("not authorized") {
            SourceError::PermissionDenied(format!("Cannot access {}: {}", object, message))
        } else if lower.contains("authentication")
            || lower.contains("incorrect username or password")
            || lower.contains("connection")
            || lower.contains("timed out")
            || lower.contains("session")
        {
            SourceError::Connectivity(format!("{}: {}", object, message))
        } else {
            SourceError::QueryError(format!("{}: {}", object, message))
        }
    }

    #[cfg(feature = "snowflake")]
    fn connect(&self, database: Option<&str>) -> Result<SnowflakeApi, SourceError> {
        let api = match &self.credentials {
            SnowflakeCredentials::Password(password) => SnowflakeApi::with_password_auth(
                &self.account,
                self.warehouse.as_deref(),
                database,
                None, // schema
                &self.username,
                self.role.as_deref(),
                password,
            ),
            SnowflakeCredentials::PrivateKey(private_key_pem) => SnowflakeApi::with_certificate_auth(
                &self.account,
                self.warehouse.as_deref(),
                database,
                None, // schema
                &self.username,
                self.role.as_deref(),
                private_key_pem,
            ),
        };

        api.map_err(|e| {
            SourceError::Connectivity(format!("Failed to authenticate with Snowflake account {}: {}", self.account, e))
        })
    }
}

/// Run a query and read the named columns as strings
///
/// Numeric columns must be cast to VARCHAR in the SQL text.
#[cfg(feature = "snowflake")]
async fn query_strings(
    api: &SnowflakeApi,
    sql: &str,
    columns: &[&str],
    object: &str,
) -> Result<Vec<Vec<Option<String>>>, SourceError> {
    let result = api
        .exec(sql)
        .await
        .map_err(|e| SnowflakeSource::classify_message(&e.to_string(), object))?;

    let mut rows = Vec::new();
    match result {
        QueryResult::Arrow(batches) => {
            for batch in batches {
                let schema = batch.schema();
                let mut arrays = Vec::with_capacity(columns.len());
                for name in columns {
                    let idx = schema
                        .index_of(name)
                        .map_err(|_| SourceError::InvalidResponse(format!("Missing {} column", name)))?;
                    let array = batch.column(idx).as_string_opt::<i32>().ok_or_else(|| {
                        SourceError::InvalidResponse(format!("Column {} is not a string column", name))
                    })?;
                    arrays.push(array);
                }

                for row_idx in 0..batch.num_rows() {
                    rows.push(
                        arrays
                            .iter()
                            .map(|a| if a.is_null(row_idx) { None } else { Some(a.value(row_idx).to_string()) })
                            .collect(),
                    );
                }
            }
        }
        QueryResult::Json(_) => {
            return Err(SourceError::InvalidResponse("Unexpected JSON result format".to_string()));
        }
        QueryResult::Empty => {}
    }
    Ok(rows)
}

#[cfg(feature = "snowflake")]
fn required(row: &[Option<String>], idx: usize, column: &str) -> Result<String, SourceError> {
    row.get(idx)
        .cloned()
        .flatten()
        .ok_or_else(|| SourceError::InvalidResponse(format!("NULL {} in catalog row", column)))
}

#[async_trait::async_trait]
impl SourceEnumerator for SnowflakeSource {
    fn engine(&self) -> &'static str {
        "snowflake"
    }

    #[cfg(feature = "snowflake")]
    async fn test_connection(&self) -> Result<(), SourceError> {
        let api = self.connect(None)?;
        api.exec("SELECT 1")
            .await
            .map_err(|e| SourceError::Connectivity(format!("Connection test failed: {}", e)))?;
        Ok(())
    }

    #[cfg(not(feature = "snowflake"))]
    async fn test_connection(&self) -> Result<(), SourceError> {
        Err(SourceError::ConfigError(DISABLED.to_string()))
    }

    #[cfg(feature = "snowflake")]
    async fn list_databases(&self) -> Result<Vec<DatabaseInfo>, SourceError> {
        let api = self.connect(None)?;
        let rows = query_strings(
            &api,
            "SELECT DATABASE_NAME, TYPE FROM SNOWFLAKE.INFORMATION_SCHEMA.DATABASES ORDER BY DATABASE_NAME",
            &["DATABASE_NAME", "TYPE"],
            "SNOWFLAKE.INFORMATION_SCHEMA.DATABASES",
        )
        .await?;

        rows.iter()
            .map(|row| {
                let name = required(row, 0, "DATABASE_NAME")?;
                let kind = row.get(1).cloned().flatten().unwrap_or_default();
                let is_system = name == "SNOWFLAKE" || kind.eq_ignore_ascii_case("APPLICATION");
                Ok(DatabaseInfo { name, is_system })
            })
            .collect()
    }

    #[cfg(not(feature = "snowflake"))]
    async fn list_databases(&self) -> Result<Vec<DatabaseInfo>, SourceError> {
        Err(SourceError::ConfigError(DISABLED.to_string()))
    }

    #[cfg(feature = "snowflake")]
    async fn open_database(&self, database: &str) -> Result<Box<dyn DatabaseSession>, SourceError> {
        let api = self.connect(Some(database))?;
        Ok(Box::new(SnowflakeSession {
            api,
            database: database.to_string(),
        }))
    }

    #[cfg(not(feature = "snowflake"))]
    async fn open_database(&self, _database: &str) -> Result<Box<dyn DatabaseSession>, SourceError> {
        Err(SourceError::ConfigError(DISABLED.to_string()))
    }
}

#[cfg(feature = "snowflake")]
struct SnowflakeSession {
    api: SnowflakeApi,
    database: String,
}

#[cfg(feature = "snowflake")]
impl SnowflakeSession {
    fn info_schema(&self, view: &str) -> String {
        format!("{}.INFORMATION_SCHEMA.{}", SnowflakeSource::quote_ident(&self.database), view)
    }

    fn path<'a>(&'a self, schema: &'a str, table: Option<&'a str>) -> String {
        ObjectPath { database: &self.database, schema: Some(schema), table }.to_string()
    }
}

#[cfg(feature = "snowflake")]
#[async_trait::async_trait]
impl DatabaseSession for SnowflakeSession {
    fn database(&self) -> &str {
        &self.database
    }

    async fn list_schemas(&self) -> Result<Vec<SchemaInfo>, SourceError> {
        let sql = format!("SELECT SCHEMA_NAME FROM {} ORDER BY SCHEMA_NAME", self.info_schema("SCHEMATA"));
        let rows = query_strings(&self.api, &sql, &["SCHEMA_NAME"], &self.database).await?;

        rows.iter()
            .map(|row| {
                let name = required(row, 0, "SCHEMA_NAME")?;
                let is_system = name == "INFORMATION_SCHEMA";
                Ok(SchemaInfo { name, is_system })
            })
            .collect()
    }

    async fn list_tables(
        &self,
        schema: &str,
        include_views: bool,
        include_system_objects: bool,
    ) -> Result<Vec<TableInfo>, SourceError> {
        let is_system = schema == "INFORMATION_SCHEMA";
        if is_system && !include_system_objects {
            return Ok(Vec::new());
        }

        let sql = format!(
            r#"
            SELECT t.TABLE_NAME, t.TABLE_TYPE, v.VIEW_DEFINITION
            FROM {} t
            LEFT JOIN {} v
              ON v.TABLE_SCHEMA = t.TABLE_SCHEMA AND v.TABLE_NAME = t.TABLE_NAME
            WHERE t.TABLE_SCHEMA = {}
            ORDER BY t.TABLE_NAME
            "#,
            self.info_schema("TABLES"),
            self.info_schema("VIEWS"),
            SnowflakeSource::quote_literal(schema),
        );
        let rows = query_strings(
            &self.api,
            &sql,
            &["TABLE_NAME", "TABLE_TYPE", "VIEW_DEFINITION"],
            &self.path(schema, None),
        )
        .await?;

        let mut tables = Vec::with_capacity(rows.len());
        for row in &rows {
            let table_type = required(row, 1, "TABLE_TYPE")?;
            let kind = TableKind::from_table_type(&table_type);
            if kind == TableKind::View && !include_views {
                continue;
            }
            tables.push(TableInfo {
                name: required(row, 0, "TABLE_NAME")?,
                kind,
                table_type,
                view_definition: row.get(2).cloned().flatten(),
                is_system,
            });
        }
        Ok(tables)
    }

    async fn list_columns(&self, schema: &str, table: &str) -> Result<Vec<ColumnInfo>, SourceError> {
        let sql = format!(
            r#"
            SELECT
                COLUMN_NAME,
                DATA_TYPE,
                IS_NULLABLE,
                ORDINAL_POSITION::VARCHAR AS ORDINAL_POSITION,
                NUMERIC_PRECISION::VARCHAR AS NUMERIC_PRECISION,
                NUMERIC_SCALE::VARCHAR AS NUMERIC_SCALE,
                CHARACTER_MAXIMUM_LENGTH::VARCHAR AS CHARACTER_MAXIMUM_LENGTH
            FROM {}
            WHERE TABLE_SCHEMA = {}
              AND TABLE_NAME = {}
            ORDER BY ORDINAL_POSITION
            "#,
            self.info_schema("COLUMNS"),
            SnowflakeSource::quote_literal(schema),
            SnowflakeSource::quote_literal(table),
        );
        let object = self.path(schema, Some(table));
        let rows = query_strings(
            &self.api,
            &sql,
            &[
                "COLUMN_NAME",
                "DATA_TYPE",
                "IS_NULLABLE",
                "ORDINAL_POSITION",
                "NUMERIC_PRECISION",
                "NUMERIC_SCALE",
                "CHARACTER_MAXIMUM_LENGTH",
            ],
            &object,
        )
        .await?;

        if rows.is_empty() {
            return Err(SourceError::NotFound(format!("Table {} not found or has no columns", object)));
        }

        rows.iter()
            .map(|row| {
                let data_type = required(row, 1, "DATA_TYPE")?;
                let ordinal = required(row, 3, "ORDINAL_POSITION")?;
                Ok(ColumnInfo {
                    name: required(row, 0, "COLUMN_NAME")?,
                    data_type: SnowflakeSource::full_data_type(
                        &data_type,
                        row[4].as_deref(),
                        row[5].as_deref(),
                        row[6].as_deref(),
                    ),
                    is_nullable: required(row, 2, "IS_NULLABLE")?.eq_ignore_ascii_case("YES"),
                    ordinal_position: ordinal.parse().map_err(|_| {
                        SourceError::InvalidResponse(format!("Invalid ORDINAL_POSITION {}", ordinal))
                    })?,
                })
            })
            .collect()
    }

    async fn estimate_row_count(&self, schema: &str, table: &str) -> Result<Option<i64>, SourceError> {
        let sql = format!(
            "SELECT ROW_COUNT::VARCHAR AS ROW_COUNT FROM {} WHERE TABLE_SCHEMA = {} AND TABLE_NAME = {}",
            self.info_schema("TABLES"),
            SnowflakeSource::quote_literal(schema),
            SnowflakeSource::quote_literal(table),
        );
        let rows = query_strings(&self.api, &sql, &["ROW_COUNT"], &self.path(schema, Some(table))).await?;

        Ok(rows
            .first()
            .and_then(|row| row.first().cloned().flatten())
            .and_then(|n| n.parse().ok()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quoting() {
        assert_eq!(SnowflakeSource::quote_literal("SALES"), "'SALES'");
        assert_eq!(SnowflakeSource::quote_literal("O'BRIEN"), "'O''BRIEN'");
        assert_eq!(SnowflakeSource::quote_ident("my db"), "\"my db\"");
        assert_eq!(SnowflakeSource::quote_ident("a\"b"), "\"a\"\"b\"");
    }

    #[test]
    fn full_data_types() {
        assert_eq!(SnowflakeSource::full_data_type("NUMBER", Some("38"), Some("0"), None), "NUMBER(38,0)");
        assert_eq!(SnowflakeSource::full_data_type("NUMBER", Some("10"), None, None), "NUMBER(10)");
        assert_eq!(SnowflakeSource::full_data_type("NUMBER", None, None, None), "NUMBER");
        assert_eq!(SnowflakeSource::full_data_type("TEXT", None, None, Some("256")), "TEXT(256)");
        assert_eq!(SnowflakeSource::full_data_type("TIMESTAMP_NTZ", None, None, None), "TIMESTAMP_NTZ");
    }

    #[test]
    fn error_classification() {
        assert!(matches!(
            SnowflakeSource::classify_message("Object 'X' does not exist or not authorized", "db.x"),
            SourceError::NotFound(_)
        ));
        assert!(matches!(
            SnowflakeSource::classify_message("SQL access control error: Insufficient privileges", "db"),
            SourceError::PermissionDenied(_)
        ));
        assert!(matches!(
            SnowflakeSource::classify_message("Incorrect username or password was specified", "acct"),
            SourceError::Connectivity(_)
        ));
        assert!(matches!(
            SnowflakeSource::classify_message("SQL compilation error", "db"),
            SourceError::QueryError(_)
        ));
    }

    #[test]
    fn source_identity() {
        let source = SnowflakeSource::with_password("xy12345", "crawler", "pw").with_warehouse("WH");
        assert_eq!(source.account(), "xy12345");
        assert_eq!(source.engine(), "snowflake");
    }

    #[cfg(not(feature = "snowflake"))]
    #[tokio::test]
    async fn disabled_feature_reports_config_error() {
        let source = SnowflakeSource::with_key_pair("xy12345", "crawler", "pem");
        assert!(matches!(source.test_connection().await, Err(SourceError::ConfigError(_))));
    }
}
