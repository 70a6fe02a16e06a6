//! The node store contract

use std::collections::HashSet;

use metasync_core::{
    CatalogRun, ChangeKind, NewRun, Node, NodeDraft, NodeId, NodeKey, NodeRef, NodeType, RunCounters, RunId,
    UpsertOutcome, ViewDefinition,
};

use crate::error::StoreError;

/// Persistence for nodes, view definitions and catalog runs
///
/// Implementations must make each `upsert_node` atomic per
/// `(node_type, qualified_name)`: the close of the previous current row and
/// the insert of its successor either both happen or neither does, and at
/// most one row per key is ever current. A writer that loses a race reports
/// [`StoreError::Conflict`] and the caller retries.
#[async_trait::async_trait]
pub trait NodeStore: Send + Sync {
    /// Backend name for logs (e.g. "memory", "postgres")
    fn backend(&self) -> &'static str;

    // Run lifecycle

    /// `StartRun(scopeDescriptor) -> runId`; the run starts as `running`
    async fn start_run(&self, new_run: NewRun) -> Result<RunId, StoreError>;

    /// `UpdateRunProgress(runId, counters)`
    async fn update_run_progress(&self, run_id: RunId, counters: &RunCounters) -> Result<(), StoreError>;

    /// `CompleteRun(runId, finalCounters)`
    async fn complete_run(&self, run_id: RunId, counters: &RunCounters) -> Result<(), StoreError>;

    /// `FailRun(runId, errorMessage)`, keeping the counters reached so far
    async fn fail_run(&self, run_id: RunId, counters: &RunCounters, error_message: &str) -> Result<(), StoreError>;

    /// Move a run to `aborted` with the reason recorded as its error message
    async fn abort_run(&self, run_id: RunId, counters: &RunCounters, reason: &str) -> Result<(), StoreError>;

    async fn get_run(&self, run_id: RunId) -> Result<CatalogRun, StoreError>;

    /// Most recent runs first
    async fn list_runs(&self, limit: usize) -> Result<Vec<CatalogRun>, StoreError>;

    // Nodes

    /// `UpsertNode(type, qualifiedName, attrs, runId) -> (nodeId, created, changed)`
    async fn upsert_node(&self, draft: &NodeDraft, run_id: RunId) -> Result<UpsertOutcome, StoreError>;

    /// Version a view's SQL text by content hash
    async fn upsert_view_definition(
        &self,
        view: &NodeRef,
        sql_text: &str,
        content_hash: &str,
        run_id: RunId,
    ) -> Result<ChangeKind, StoreError>;

    /// Cache a row-count estimate on a table's current detail record
    ///
    /// This is not a version change.
    async fn record_row_count(&self, node_id: NodeId, estimate: i64) -> Result<(), StoreError>;

    /// `MarkMissingAsDeleted(parentNodeId, observedQualifiedNames, runId)`
    ///
    /// Closes every current child of `parent` whose type is in `child_types`,
    /// whose `(type, qualified_name)` is not in `observed`, and which was not
    /// already seen during `run_id`. A child belongs to `parent` only when its
    /// parent link has the same type and name, so a view never adopts the
    /// columns of a dropped table it replaced. Only direct children are examined. Returns the
    /// closed nodes so the caller can run their own children's passes.
    async fn mark_missing_as_deleted(
        &self,
        parent: &NodeRef,
        child_types: &[NodeType],
        observed: &HashSet<NodeKey>,
        run_id: RunId,
    ) -> Result<Vec<NodeRef>, StoreError>;

    // Queries

    async fn current_node(&self, node_type: NodeType, qualified_name: &str) -> Result<Option<Node>, StoreError>;

    /// Every version of one identity, oldest first
    async fn node_history(&self, node_type: NodeType, qualified_name: &str) -> Result<Vec<Node>, StoreError>;

    /// Current nodes whose parent has the given qualified name
    async fn current_children(
        &self,
        parent_qualified_name: &str,
        child_types: &[NodeType],
    ) -> Result<Vec<Node>, StoreError>;

    async fn current_view_definition(&self, view_qualified_name: &str) -> Result<Option<ViewDefinition>, StoreError>;

    /// Every definition version of one view, oldest first
    async fn view_definition_history(&self, view_qualified_name: &str) -> Result<Vec<ViewDefinition>, StoreError>;
}
