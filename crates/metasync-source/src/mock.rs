//! In-memory source for testing and fixture-driven crawls
//!
//! This source serves databases, schemas, tables and columns from a
//! [`SourceFixture`] without connecting to any server. It's useful for:
//! - Unit and scenario testing of the sync engine
//! - Crawling a JSON fixture from the CLI without credentials
//! - Simulating connectivity and permission faults at any level
//!
//! ## Usage
//!
//! ```rust,ignore
//! use metasync_source::{MockSource, TableFixture, ColumnInfo};
//!
//! let source = MockSource::builder()
//!     .table("D1", "S1", TableFixture::table("T1", vec![
//!         ColumnInfo::new("id", "integer", false, 1),
//!         ColumnInfo::new("name", "text", true, 2),
//!     ]))
//!     .build();
//!
//! // Mutate the source between runs
//! source.drop_column("D1", "S1", "T1", "name").await;
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::enumerator::{
    ColumnInfo, DatabaseInfo, DatabaseSession, ObjectPath, SchemaInfo, SourceEnumerator, SourceError,
    TableInfo,
};

/// Whole-source description, loadable from JSON
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceFixture {
    #[serde(default)]
    pub databases: Vec<DatabaseFixture>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseFixture {
    pub name: String,

    #[serde(default)]
    pub is_system: bool,

    #[serde(default)]
    pub schemas: Vec<SchemaFixture>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaFixture {
    pub name: String,

    #[serde(default)]
    pub is_system: bool,

    #[serde(default)]
    pub tables: Vec<TableFixture>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableFixture {
    #[serde(flatten)]
    pub info: TableInfo,

    #[serde(default)]
    pub row_count: Option<i64>,

    #[serde(default)]
    pub columns: Vec<ColumnInfo>,
}

impl TableFixture {
    pub fn new(info: TableInfo) -> Self {
        Self { info, row_count: None, columns: Vec::new() }
    }

    /// A base table with the given columns
    pub fn table(name: &str, columns: Vec<ColumnInfo>) -> Self {
        Self::new(TableInfo::table(name)).with_columns(columns)
    }

    /// A view with the given definition and columns
    pub fn view(name: &str, definition: &str, columns: Vec<ColumnInfo>) -> Self {
        Self::new(TableInfo::view(name, definition)).with_columns(columns)
    }

    pub fn with_columns(mut self, columns: Vec<ColumnInfo>) -> Self {
        self.columns = columns;
        self
    }

    pub fn with_row_count(mut self, rows: i64) -> Self {
        self.row_count = Some(rows);
        self
    }
}

impl SourceFixture {
    /// Load a fixture from a JSON file
    pub fn from_file(path: &Path) -> Result<Self, SourceError> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            SourceError::ConfigError(format!("Cannot read fixture {}: {}", path.display(), e))
        })?;
        Self::from_json(&contents)
    }

    pub fn from_json(json: &str) -> Result<Self, SourceError> {
        serde_json::from_str(json)
            .map_err(|e| SourceError::ConfigError(format!("Invalid source fixture: {}", e)))
    }

    fn database(&self, name: &str) -> Option<&DatabaseFixture> {
        self.databases.iter().find(|d| d.name == name)
    }

    fn database_mut(&mut self, name: &str) -> &mut DatabaseFixture {
        if let Some(pos) = self.databases.iter().position(|d| d.name == name) {
            &mut self.databases[pos]
        } else {
            self.databases.push(DatabaseFixture {
                name: name.to_string(),
                is_system: false,
                schemas: Vec::new(),
            });
            let last = self.databases.len() - 1;
            &mut self.databases[last]
        }
    }

    fn schema(&self, database: &str, schema: &str) -> Option<&SchemaFixture> {
        self.database(database)?.schemas.iter().find(|s| s.name == schema)
    }

    fn schema_mut(&mut self, database: &str, schema: &str) -> &mut SchemaFixture {
        let db = self.database_mut(database);
        if let Some(pos) = db.schemas.iter().position(|s| s.name == schema) {
            &mut db.schemas[pos]
        } else {
            db.schemas.push(SchemaFixture {
                name: schema.to_string(),
                is_system: false,
                tables: Vec::new(),
            });
            let last = db.schemas.len() - 1;
            &mut db.schemas[last]
        }
    }

    fn table(&self, database: &str, schema: &str, table: &str) -> Option<&TableFixture> {
        self.schema(database, schema)?.tables.iter().find(|t| t.info.name == table)
    }

    fn table_mut(&mut self, database: &str, schema: &str, table: &str) -> Option<&mut TableFixture> {
        self.databases
            .iter_mut()
            .find(|d| d.name == database)?
            .schemas
            .iter_mut()
            .find(|s| s.name == schema)?
            .tables
            .iter_mut()
            .find(|t| t.info.name == table)
    }

    fn put_table(&mut self, database: &str, schema: &str, table: TableFixture) {
        let tables = &mut self.schema_mut(database, schema).tables;
        match tables.iter().position(|t| t.info.name == table.info.name) {
            Some(pos) => tables[pos] = table,
            None => tables.push(table),
        }
    }
}

/// Where an injected fault fires
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    ListDatabases,
    OpenDatabase { database: String },
    ListSchemas { database: String },
    ListTables { database: String, schema: String },
    ListColumns { database: String, schema: String, table: String },
    RowCount { database: String, schema: String, table: String },
}

impl FaultPoint {
    pub fn open_database(database: &str) -> Self {
        Self::OpenDatabase { database: database.to_string() }
    }

    pub fn list_schemas(database: &str) -> Self {
        Self::ListSchemas { database: database.to_string() }
    }

    pub fn list_tables(database: &str, schema: &str) -> Self {
        Self::ListTables { database: database.to_string(), schema: schema.to_string() }
    }

    pub fn list_columns(database: &str, schema: &str, table: &str) -> Self {
        Self::ListColumns {
            database: database.to_string(),
            schema: schema.to_string(),
            table: table.to_string(),
        }
    }

    pub fn row_count(database: &str, schema: &str, table: &str) -> Self {
        Self::RowCount {
            database: database.to_string(),
            schema: schema.to_string(),
            table: table.to_string(),
        }
    }
}

/// Mock source enumerator
///
/// Clones share state, so a test can keep one handle to mutate the source
/// between runs while the coordinator holds another.
#[derive(Clone)]
pub struct MockSource {
    fixture: Arc<RwLock<SourceFixture>>,
    faults: Arc<RwLock<HashMap<FaultPoint, SourceError>>>,

    /// Sessions currently open
    open_sessions: Arc<AtomicUsize>,

    /// Sessions ever opened
    sessions_opened: Arc<AtomicUsize>,

    /// Simulated query latency (milliseconds)
    latency_ms: u64,
}

impl MockSource {
    pub fn new() -> Self {
        Self::from_fixture(SourceFixture::default())
    }

    pub fn from_fixture(fixture: SourceFixture) -> Self {
        Self {
            fixture: Arc::new(RwLock::new(fixture)),
            faults: Arc::new(RwLock::new(HashMap::new())),
            open_sessions: Arc::new(AtomicUsize::new(0)),
            sessions_opened: Arc::new(AtomicUsize::new(0)),
            latency_ms: 0,
        }
    }

    pub fn builder() -> MockSourceBuilder {
        MockSourceBuilder::new()
    }

    pub fn with_latency(mut self, latency_ms: u64) -> Self {
        self.latency_ms = latency_ms;
        self
    }

    pub async fn add_database(&self, database: &str) {
        self.fixture.write().await.database_mut(database);
    }

    pub async fn drop_database(&self, database: &str) {
        self.fixture.write().await.databases.retain(|d| d.name != database);
    }

    pub async fn add_schema(&self, database: &str, schema: &str) {
        self.fixture.write().await.schema_mut(database, schema);
    }

    pub async fn drop_schema(&self, database: &str, schema: &str) {
        let mut fixture = self.fixture.write().await;
        if let Some(db) = fixture.databases.iter_mut().find(|d| d.name == database) {
            db.schemas.retain(|s| s.name != schema);
        }
    }

    /// Add or replace a table
    pub async fn put_table(&self, database: &str, schema: &str, table: TableFixture) {
        self.fixture.write().await.put_table(database, schema, table);
    }

    pub async fn drop_table(&self, database: &str, schema: &str, table: &str) {
        let mut fixture = self.fixture.write().await;
        fixture.schema_mut(database, schema).tables.retain(|t| t.info.name != table);
    }

    /// Add or replace a column
    pub async fn put_column(&self, database: &str, schema: &str, table: &str, column: ColumnInfo) {
        let mut fixture = self.fixture.write().await;
        if let Some(t) = fixture.table_mut(database, schema, table) {
            match t.columns.iter().position(|c| c.name == column.name) {
                Some(pos) => t.columns[pos] = column,
                None => t.columns.push(column),
            }
        }
    }

    pub async fn drop_column(&self, database: &str, schema: &str, table: &str, column: &str) {
        let mut fixture = self.fixture.write().await;
        if let Some(t) = fixture.table_mut(database, schema, table) {
            t.columns.retain(|c| c.name != column);
        }
    }

    pub async fn set_view_definition(&self, database: &str, schema: &str, view: &str, definition: &str) {
        let mut fixture = self.fixture.write().await;
        if let Some(t) = fixture.table_mut(database, schema, view) {
            t.info.view_definition = Some(definition.to_string());
        }
    }

    /// Make the operation at `point` fail with `error` until cleared
    pub async fn inject_fault(&self, point: FaultPoint, error: SourceError) {
        self.faults.write().await.insert(point, error);
    }

    pub async fn clear_fault(&self, point: &FaultPoint) {
        self.faults.write().await.remove(point);
    }

    pub async fn clear_faults(&self) {
        self.faults.write().await.clear();
    }

    pub fn open_session_count(&self) -> usize {
        self.open_sessions.load(Ordering::SeqCst)
    }

    pub fn sessions_opened(&self) -> usize {
        self.sessions_opened.load(Ordering::SeqCst)
    }

    /// Current fixture contents
    pub async fn snapshot(&self) -> SourceFixture {
        self.fixture.read().await.clone()
    }

    async fn check_fault(&self, point: FaultPoint) -> Result<(), SourceError> {
        self.simulate_latency().await;
        match self.faults.read().await.get(&point) {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    async fn simulate_latency(&self) {
        if self.latency_ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(self.latency_ms)).await;
        }
    }
}

impl Default for MockSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl SourceEnumerator for MockSource {
    fn engine(&self) -> &'static str {
        "mock"
    }

    async fn test_connection(&self) -> Result<(), SourceError> {
        self.check_fault(FaultPoint::ListDatabases).await
    }

    async fn list_databases(&self) -> Result<Vec<DatabaseInfo>, SourceError> {
        self.check_fault(FaultPoint::ListDatabases).await?;
        Ok(self
            .fixture
            .read()
            .await
            .databases
            .iter()
            .map(|d| DatabaseInfo { name: d.name.clone(), is_system: d.is_system })
            .collect())
    }

    async fn open_database(&self, database: &str) -> Result<Box<dyn DatabaseSession>, SourceError> {
        self.check_fault(FaultPoint::open_database(database)).await?;
        if self.fixture.read().await.database(database).is_none() {
            return Err(SourceError::Connectivity(format!("database {} does not exist", database)));
        }

        self.open_sessions.fetch_add(1, Ordering::SeqCst);
        self.sessions_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockSession {
            source: self.clone(),
            database: database.to_string(),
        }))
    }
}

/// Session over one fixture database; releases its slot on drop
struct MockSession {
    source: MockSource,
    database: String,
}

impl Drop for MockSession {
    fn drop(&mut self) {
        self.source.open_sessions.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl DatabaseSession for MockSession {
    fn database(&self) -> &str {
        &self.database
    }

    async fn list_schemas(&self) -> Result<Vec<SchemaInfo>, SourceError> {
        self.source.check_fault(FaultPoint::list_schemas(&self.database)).await?;
        let fixture = self.source.fixture.read().await;
        let db = fixture
            .database(&self.database)
            .ok_or_else(|| SourceError::NotFound(self.database.clone()))?;
        Ok(db
            .schemas
            .iter()
            .map(|s| SchemaInfo { name: s.name.clone(), is_system: s.is_system })
            .collect())
    }

    async fn list_tables(
        &self,
        schema: &str,
        include_views: bool,
        include_system_objects: bool,
    ) -> Result<Vec<TableInfo>, SourceError> {
        self.source.check_fault(FaultPoint::list_tables(&self.database, schema)).await?;
        let fixture = self.source.fixture.read().await;
        let found = fixture.schema(&self.database, schema).ok_or_else(|| {
            SourceError::NotFound(
                ObjectPath { database: &self.database, schema: Some(schema), table: None }.to_string(),
            )
        })?;
        Ok(found
            .tables
            .iter()
            .filter(|t| include_views || !t.info.is_view())
            .filter(|t| include_system_objects || !t.info.is_system)
            .map(|t| t.info.clone())
            .collect())
    }

    async fn list_columns(&self, schema: &str, table: &str) -> Result<Vec<ColumnInfo>, SourceError> {
        self.source
            .check_fault(FaultPoint::list_columns(&self.database, schema, table))
            .await?;
        let fixture = self.source.fixture.read().await;
        let found = fixture.table(&self.database, schema, table).ok_or_else(|| {
            SourceError::NotFound(
                ObjectPath { database: &self.database, schema: Some(schema), table: Some(table) }
                    .to_string(),
            )
        })?;
        let mut columns = found.columns.clone();
        columns.sort_by_key(|c| c.ordinal_position);
        Ok(columns)
    }

    async fn estimate_row_count(&self, schema: &str, table: &str) -> Result<Option<i64>, SourceError> {
        self.source
            .check_fault(FaultPoint::row_count(&self.database, schema, table))
            .await?;
        let fixture = self.source.fixture.read().await;
        Ok(fixture.table(&self.database, schema, table).and_then(|t| t.row_count))
    }
}

/// Builder for creating a MockSource with predefined objects
pub struct MockSourceBuilder {
    fixture: SourceFixture,
    faults: HashMap<FaultPoint, SourceError>,
    latency_ms: u64,
}

impl MockSourceBuilder {
    pub fn new() -> Self {
        Self {
            fixture: SourceFixture::default(),
            faults: HashMap::new(),
            latency_ms: 0,
        }
    }

    pub fn database(mut self, database: &str) -> Self {
        self.fixture.database_mut(database);
        self
    }

    pub fn system_database(mut self, database: &str) -> Self {
        self.fixture.database_mut(database).is_system = true;
        self
    }

    pub fn schema(mut self, database: &str, schema: &str) -> Self {
        self.fixture.schema_mut(database, schema);
        self
    }

    pub fn system_schema(mut self, database: &str, schema: &str) -> Self {
        self.fixture.schema_mut(database, schema).is_system = true;
        self
    }

    pub fn table(mut self, database: &str, schema: &str, table: TableFixture) -> Self {
        self.fixture.put_table(database, schema, table);
        self
    }

    pub fn fault(mut self, point: FaultPoint, error: SourceError) -> Self {
        self.faults.insert(point, error);
        self
    }

    pub fn latency(mut self, latency_ms: u64) -> Self {
        self.latency_ms = latency_ms;
        self
    }

    pub fn build(self) -> MockSource {
        let source = MockSource::from_fixture(self.fixture).with_latency(self.latency_ms);
        MockSource {
            faults: Arc::new(RwLock::new(self.faults)),
            ..source
        }
    }
}

impl Default for MockSourceBuilder {
    fn default() -> Self {
        Self::new()
    }
}
