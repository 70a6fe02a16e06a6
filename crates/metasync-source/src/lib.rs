//! Source enumerators for catalog synchronization
//!
//! This crate lists databases, schemas, tables, views and columns from a
//! source server and normalizes them into shared shapes. Enumerators never
//! filter by name; scope patterns are applied by the sync engine.
//!
//! ## Features
//!
//! Enable engine support via Cargo features:
//! - `postgres` - PostgreSQL/Redshift support
//! - `snowflake` - Snowflake support
//! - `all-sources` - All source enumerators
//!
//! [`MockSource`] is always available and backs fixture-driven crawls.
//!
//! ## Example
//!
//! ```rust,ignore
//! use metasync_source::{PostgresSource, SourceEnumerator};
//!
//! let source = PostgresSource::new("localhost", 5432, "crawler").with_password("secret");
//! for db in source.list_databases().await? {
//!     let session = source.open_database(&db.name).await?;
//!     let schemas = session.list_schemas().await?;
//! }
//! ```

pub mod enumerator;
pub mod mock;
pub mod postgres;
pub mod snowflake;

pub use enumerator::{
    ColumnInfo, DatabaseInfo, DatabaseSession, ObjectPath, SchemaInfo, SourceEnumerator, SourceError,
    TableInfo, TableKind,
};
pub use mock::{FaultPoint, MockSource, MockSourceBuilder, SourceFixture, TableFixture};
pub use postgres::PostgresSource;
pub use snowflake::{SnowflakeCredentials, SnowflakeSource};
