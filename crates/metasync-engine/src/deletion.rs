//! Deletion passes
//!
//! A pass compares the current children of one parent with the identities
//! (type and qualified name) observed under it during this run and closes
//! the rest. When a pass closes
//! a node that itself has children, those children get their own pass with
//! nothing observed, one level at a time, until the vanished subtree is
//! fully closed. The store never cascades on its own.

use std::collections::HashSet;

use metasync_core::{EntityKind, NodeKey, NodeRef, RunId};
use metasync_store::{NodeStore, StoreError};

use crate::progress::RunProgress;

/// Deletion passes for one run
pub struct DeletionPass<'a> {
    store: &'a dyn NodeStore,
    progress: &'a RunProgress,
    run_id: RunId,
}

impl<'a> DeletionPass<'a> {
    pub fn new(store: &'a dyn NodeStore, progress: &'a RunProgress, run_id: RunId) -> Self {
        Self { store, progress, run_id }
    }

    /// Close the children of `parent` not in `observed`, then their subtrees
    ///
    /// Returns the number of nodes closed across every level.
    pub async fn run(&self, parent: &NodeRef, observed: &HashSet<NodeKey>) -> Result<u64, StoreError> {
        let mut total = 0;
        let mut worklist = self.pass(parent, observed).await?;
        total += worklist.len() as u64;

        let nothing_observed = HashSet::new();
        while let Some(vanished) = worklist.pop() {
            let deleted = self.pass(&vanished, &nothing_observed).await?;
            total += deleted.len() as u64;
            worklist.extend(deleted);
        }

        Ok(total)
    }

    async fn pass(&self, parent: &NodeRef, observed: &HashSet<NodeKey>) -> Result<Vec<NodeRef>, StoreError> {
        let child_types = parent.node_type.child_types();
        if child_types.is_empty() {
            return Ok(Vec::new());
        }

        let deleted = self
            .store
            .mark_missing_as_deleted(parent, child_types, observed, self.run_id)
            .await?;

        for node in &deleted {
            tracing::info!(
                run_id = self.run_id,
                node_type = %node.node_type,
                qualified_name = %node.qualified_name,
                "Marked deleted"
            );
            if let Some(kind) = EntityKind::for_node_type(node.node_type) {
                self.progress.record_deleted(kind, 1);
            }
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::TemporalDiff;
    use metasync_core::{NewRun, NodeType, ScopeDescriptor};
    use metasync_source::{ColumnInfo, DatabaseInfo, SchemaInfo, TableInfo};
    use metasync_store::MemoryNodeStore;
    use std::sync::Arc;

    async fn start(store: &Arc<MemoryNodeStore>) -> RunId {
        store
            .start_run(NewRun {
                connection: "test".to_string(),
                scope: ScopeDescriptor::default(),
                log_reference: None,
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn vanished_schema_closes_its_subtree() {
        let store = Arc::new(MemoryNodeStore::new());
        let run1 = start(&store).await;
        let progress = Arc::new(RunProgress::new());
        let diff = TemporalDiff::new(store.clone(), progress.clone(), run1, 0);

        let server = diff.sync_server("h", "h", "mock").await.unwrap();
        let db = diff.sync_database(&server, &DatabaseInfo::new("D1")).await.unwrap();
        let keep = diff.sync_schema(&db, &SchemaInfo::new("keep")).await.unwrap();
        let gone = diff.sync_schema(&db, &SchemaInfo::new("gone")).await.unwrap();
        for schema in [&keep, &gone] {
            let table = diff.sync_table(schema, &TableInfo::table("T1")).await.unwrap();
            diff.sync_column(&table, &ColumnInfo::new("id", "integer", false, 1)).await.unwrap();
            diff.sync_column(&table, &ColumnInfo::new("name", "text", true, 2)).await.unwrap();
        }

        let run2 = start(&store).await;
        let progress = RunProgress::new();
        let observed: HashSet<NodeKey> = [keep.key()].into_iter().collect();
        let closed = DeletionPass::new(&*store, &progress, run2).run(&db, &observed).await.unwrap();

        // gone, gone.T1, gone.T1.id, gone.T1.name
        assert_eq!(closed, 4);
        let counters = progress.snapshot();
        assert_eq!(counters.schemas.deleted, 1);
        assert_eq!(counters.tables.deleted, 1);
        assert_eq!(counters.columns.deleted, 2);

        assert!(store.current_node(NodeType::Column, "h/D1.gone.T1.id").await.unwrap().is_none());
        assert!(store.current_node(NodeType::Column, "h/D1.keep.T1.id").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn columns_have_no_children() {
        let store = MemoryNodeStore::new();
        let progress = RunProgress::new();
        let column = NodeRef { id: 1, node_type: NodeType::Column, qualified_name: "h/D1.S1.T1.id".to_string() };
        let closed = DeletionPass::new(&store, &progress, 1).run(&column, &HashSet::new()).await.unwrap();
        assert_eq!(closed, 0);
    }
}
