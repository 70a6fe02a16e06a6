//! Test fixtures for sync scenarios
//!
//! A [`Harness`] wires a shared [`MockSource`] and [`MemoryNodeStore`] to a
//! coordinator so a test can run, mutate the source and run again.

#![allow(dead_code)]

use std::sync::Arc;

use metasync_core::{NodeType, PolicyConfig, ScopeDescriptor};
use metasync_engine::{RunCoordinator, RunReport, RunRequest};
use metasync_source::{ColumnInfo, MockSource, TableFixture};
use metasync_store::{MemoryNodeStore, NodeStore};
use tokio_util::sync::CancellationToken;

pub const HOST: &str = "h";

pub struct Harness {
    pub source: MockSource,
    pub store: Arc<MemoryNodeStore>,
    pub coordinator: RunCoordinator,
}

impl Harness {
    pub fn new(source: MockSource) -> Self {
        Self::with_policy(source, PolicyConfig::default())
    }

    pub fn with_policy(source: MockSource, policy: PolicyConfig) -> Self {
        let store = Arc::new(MemoryNodeStore::new());
        let coordinator = RunCoordinator::new(store.clone(), Arc::new(source.clone()), policy);
        Self { source, store, coordinator }
    }

    pub async fn run(&self, request: RunRequest) -> RunReport {
        self.coordinator.run(request).await.unwrap()
    }

    pub async fn run_with_cancel(&self, request: RunRequest, cancel: CancellationToken) -> RunReport {
        self.coordinator.run_with_cancel(request, cancel).await.unwrap()
    }

    pub async fn is_current(&self, node_type: NodeType, qualified_name: &str) -> bool {
        self.store
            .current_node(node_type, qualified_name)
            .await
            .unwrap()
            .is_some()
    }

    pub async fn version_count(&self, node_type: NodeType, qualified_name: &str) -> usize {
        self.store.node_history(node_type, qualified_name).await.unwrap().len()
    }
}

/// Request over `scope` against the test host
pub fn request(scope: ScopeDescriptor) -> RunRequest {
    RunRequest::new("local", HOST, scope)
}

/// The `D1/S1/*` scope
pub fn d1_s1() -> ScopeDescriptor {
    ScopeDescriptor::default()
        .with_databases("D1")
        .with_schemas("S1")
        .with_tables("*")
}

pub fn id_name_columns() -> Vec<ColumnInfo> {
    vec![
        ColumnInfo::new("id", "integer", false, 1),
        ColumnInfo::new("name", "text", true, 2),
    ]
}

/// `D1.S1.T1(id int, name text)`
pub fn seeded() -> MockSource {
    MockSource::builder()
        .table("D1", "S1", TableFixture::table("T1", id_name_columns()))
        .build()
}

/// `D1.S1` holding `tables`, each with id/name columns
pub fn schema_with_tables(tables: &[&str]) -> MockSource {
    tables
        .iter()
        .fold(MockSource::builder(), |builder, table| {
            builder.table("D1", "S1", TableFixture::table(table, id_name_columns()))
        })
        .build()
}
