//! Temporal diff of enumerated objects against the node store
//!
//! For every object the diff builds its qualified name from the resolved
//! parent, maps the normalized source shape onto node attributes and lets
//! the store decide between insert, heartbeat and supersede. The outcome is
//! recorded in the run's progress counters.

use std::sync::Arc;
use std::time::Duration;

use metasync_core::{
    content_hash, qualified, ChangeKind, EntityKind, NodeAttributes, NodeDraft, NodeRef, RunId, UpsertOutcome,
};
use metasync_source::{ColumnInfo, DatabaseInfo, SchemaInfo, TableInfo, TableKind};
use metasync_store::{NodeStore, StoreError};

use crate::progress::RunProgress;

/// Applies the versioning rule for one run
pub struct TemporalDiff {
    store: Arc<dyn NodeStore>,
    progress: Arc<RunProgress>,
    run_id: RunId,

    /// Extra attempts after a concurrent-write conflict
    retry_attempts: u32,
}

impl TemporalDiff {
    pub fn new(store: Arc<dyn NodeStore>, progress: Arc<RunProgress>, run_id: RunId, retry_attempts: u32) -> Self {
        Self { store, progress, run_id, retry_attempts }
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Qualified name of a child of `parent`
    pub fn child_name(parent: &NodeRef, name: &str) -> String {
        qualified::child(parent.node_type, &parent.qualified_name, name)
    }

    /// Upsert the server root; servers are not counted
    pub async fn sync_server(&self, host: &str, qualified_name: &str, engine: &str) -> Result<NodeRef, StoreError> {
        let draft = NodeDraft::new(
            host,
            qualified_name,
            None,
            NodeAttributes::Server { host: host.to_string(), engine: engine.to_string() },
        );
        Ok(self.upsert(&draft).await?.node)
    }

    pub async fn sync_database(&self, server: &NodeRef, database: &DatabaseInfo) -> Result<NodeRef, StoreError> {
        let draft = NodeDraft::new(
            database.name.as_str(),
            Self::child_name(server, &database.name),
            Some(server.clone()),
            NodeAttributes::Database,
        );
        Ok(self.upsert(&draft).await?.node)
    }

    pub async fn sync_schema(&self, database: &NodeRef, schema: &SchemaInfo) -> Result<NodeRef, StoreError> {
        let draft = NodeDraft::new(
            schema.name.as_str(),
            Self::child_name(database, &schema.name),
            Some(database.clone()),
            NodeAttributes::Schema,
        );
        Ok(self.upsert(&draft).await?.node)
    }

    /// Upsert a table or view; the relation kind decides the node type
    pub async fn sync_table(&self, schema: &NodeRef, table: &TableInfo) -> Result<NodeRef, StoreError> {
        let table_type = table.table_type.clone();
        let attributes = match table.kind {
            TableKind::Table => NodeAttributes::Table { table_type },
            TableKind::View => NodeAttributes::View { table_type },
        };
        let draft = NodeDraft::new(
            table.name.as_str(),
            Self::child_name(schema, &table.name),
            Some(schema.clone()),
            attributes,
        );
        Ok(self.upsert(&draft).await?.node)
    }

    /// Version a view's SQL by the SHA-256 of its raw text
    pub async fn sync_view_definition(&self, view: &NodeRef, sql_text: &str) -> Result<ChangeKind, StoreError> {
        let hash = content_hash(sql_text);
        let mut attempt = 0;
        let change = loop {
            match self.store.upsert_view_definition(view, sql_text, &hash, self.run_id).await {
                Err(e) if e.is_conflict() && attempt < self.retry_attempts => {
                    attempt += 1;
                    backoff(attempt).await;
                }
                other => break other?,
            }
        };

        tracing::debug!(
            run_id = self.run_id,
            qualified_name = %view.qualified_name,
            change = %change,
            "View definition"
        );
        self.progress.record(EntityKind::ViewDefinition, change);
        Ok(change)
    }

    pub async fn sync_column(&self, table: &NodeRef, column: &ColumnInfo) -> Result<NodeRef, StoreError> {
        let draft = NodeDraft::new(
            column.name.as_str(),
            Self::child_name(table, &column.name),
            Some(table.clone()),
            NodeAttributes::Column {
                data_type: column.data_type.clone(),
                is_nullable: column.is_nullable,
                ordinal_position: column.ordinal_position,
            },
        );
        Ok(self.upsert(&draft).await?.node)
    }

    async fn upsert(&self, draft: &NodeDraft) -> Result<UpsertOutcome, StoreError> {
        let mut attempt = 0;
        let outcome = loop {
            match self.store.upsert_node(draft, self.run_id).await {
                Err(e) if e.is_conflict() && attempt < self.retry_attempts => {
                    attempt += 1;
                    tracing::debug!(
                        run_id = self.run_id,
                        qualified_name = %draft.qualified_name,
                        attempt,
                        "Retrying after write conflict"
                    );
                    backoff(attempt).await;
                }
                other => break other?,
            }
        };

        tracing::debug!(
            run_id = self.run_id,
            node_type = %draft.node_type(),
            qualified_name = %draft.qualified_name,
            change = %outcome.change,
            "Node"
        );
        if let Some(kind) = EntityKind::for_node_type(draft.node_type()) {
            self.progress.record(kind, outcome.change);
        }
        Ok(outcome)
    }
}

async fn backoff(attempt: u32) {
    tokio::time::sleep(Duration::from_millis(10 * u64::from(attempt))).await;
}
