//! Run coordinator
//!
//! Drives one catalog run for one connection: opens the run record, walks
//! the source level by level, hands every object to the [`TemporalDiff`],
//! runs a deletion pass per parent scope once its level has been listed,
//! and finally moves the run to a terminal status.
//!
//! Schemas of one database are crawled by a bounded pool of workers sharing
//! that database's single source session. Per-object faults are isolated;
//! only an unreachable store, a failed server listing or cancellation end
//! the run early.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use metasync_core::{
    matches, CompiledScope, ConnectionConfig, NewRun, NodeKey, NodeRef, NodeType, PolicyConfig, RunCounters,
    RunId, RunStatus, ScopeDescriptor,
};
use metasync_source::{DatabaseInfo, DatabaseSession, SourceEnumerator, TableInfo};
use metasync_store::{NodeStore, StoreError};

use crate::deletion::DeletionPass;
use crate::diff::TemporalDiff;
use crate::error::SyncError;
use crate::progress::RunProgress;

const UNFILTERED_REASON: &str =
    "unfiltered scope blocked by policy: set a schema or table filter, or enable policy.allow_unfiltered";
const EMPTY_SCOPE_REASON: &str = "no database matched the scope";
const CANCELLED_REASON: &str = "cancelled";

/// What to crawl in one run
#[derive(Debug, Clone, PartialEq)]
pub struct RunRequest {
    /// Connection name recorded on the run
    pub connection: String,

    /// Host recorded on the server node
    pub server_host: String,

    /// Qualified name of the server root node
    pub server_qualified_name: String,

    pub scope: ScopeDescriptor,

    /// Extra database filter from the connection descriptor
    pub default_database: Option<String>,

    pub log_reference: Option<String>,
}

impl RunRequest {
    pub fn new(connection: impl Into<String>, host: impl Into<String>, scope: ScopeDescriptor) -> Self {
        let host = host.into();
        Self {
            connection: connection.into(),
            server_qualified_name: metasync_core::qualified::server(&host, None),
            server_host: host,
            scope,
            default_database: None,
            log_reference: None,
        }
    }

    /// Build a request from a configured connection
    pub fn from_connection(connection: &ConnectionConfig) -> Self {
        let host = if !connection.host.is_empty() {
            connection.host.clone()
        } else {
            connection.account.clone().unwrap_or_else(|| connection.name.clone())
        };
        Self {
            connection: connection.name.clone(),
            server_host: host,
            server_qualified_name: connection.server_qualified_name(),
            scope: connection.scope.clone(),
            default_database: connection.default_database.clone(),
            log_reference: None,
        }
    }

    pub fn with_default_database(mut self, patterns: impl Into<String>) -> Self {
        self.default_database = Some(patterns.into());
        self
    }

    pub fn with_log_reference(mut self, log_reference: impl Into<String>) -> Self {
        self.log_reference = Some(log_reference.into());
        self
    }
}

/// Outcome of one run as seen by the caller
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub run_id: RunId,
    pub connection: String,
    pub status: RunStatus,
    pub counters: RunCounters,
    pub error_message: Option<String>,

    /// Databases skipped because of a source fault
    pub skipped_databases: Vec<String>,
}

impl RunReport {
    pub fn is_failed(&self) -> bool {
        self.status == RunStatus::Failed
    }
}

enum CrawlOutcome {
    Completed,
    EmptyScope,
}

/// Orchestrates catalog runs against one source and one store
pub struct RunCoordinator {
    store: Arc<dyn NodeStore>,
    source: Arc<dyn SourceEnumerator>,
    policy: PolicyConfig,
}

impl RunCoordinator {
    pub fn new(store: Arc<dyn NodeStore>, source: Arc<dyn SourceEnumerator>, policy: PolicyConfig) -> Self {
        Self { store, source, policy }
    }

    /// Run to a terminal status without external cancellation
    pub async fn run(&self, request: RunRequest) -> Result<RunReport, SyncError> {
        self.run_with_cancel(request, CancellationToken::new()).await
    }

    /// Run to a terminal status, checking `cancel` between entity operations
    ///
    /// Returns `Err` only when the run record itself cannot be created. Every
    /// later fault is reflected in the report's status instead.
    pub async fn run_with_cancel(&self, request: RunRequest, cancel: CancellationToken) -> Result<RunReport, SyncError> {
        let run_id = self
            .store
            .start_run(NewRun {
                connection: request.connection.clone(),
                scope: request.scope.clone(),
                log_reference: request.log_reference.clone(),
            })
            .await?;

        tracing::info!(
            run_id,
            connection = %request.connection,
            server = %request.server_qualified_name,
            store = self.store.backend(),
            "Catalog run started"
        );

        let progress = Arc::new(RunProgress::new());

        if !self.policy.allow_unfiltered && request.scope.is_unfiltered() {
            tracing::warn!(run_id, connection = %request.connection, "{}", UNFILTERED_REASON);
            return Ok(self
                .finish(&request, run_id, &progress, RunStatus::Aborted, Some(UNFILTERED_REASON.to_string()), Vec::new())
                .await);
        }

        let ctx = RunContext {
            run_id,
            diff: Arc::new(TemporalDiff::new(
                self.store.clone(),
                progress.clone(),
                run_id,
                self.policy.store_retry_attempts,
            )),
            store: self.store.clone(),
            progress: progress.clone(),
            scope: Arc::new(request.scope.compile()),
            collect_row_counts: self.policy.collect_row_counts,
            cancel,
        };

        let mut skipped_databases = Vec::new();
        let outcome = self.crawl(&request, &ctx, &mut skipped_databases).await;

        let (status, message) = match outcome {
            Ok(CrawlOutcome::Completed) => (RunStatus::Completed, None),
            Ok(CrawlOutcome::EmptyScope) => {
                tracing::warn!(run_id, connection = %request.connection, "{}", EMPTY_SCOPE_REASON);
                (RunStatus::Aborted, Some(EMPTY_SCOPE_REASON.to_string()))
            }
            Err(SyncError::Cancelled) => {
                tracing::warn!(run_id, connection = %request.connection, "Catalog run cancelled");
                (RunStatus::Aborted, Some(CANCELLED_REASON.to_string()))
            }
            Err(e) => {
                tracing::error!(run_id, connection = %request.connection, error = %e, "Catalog run failed");
                (RunStatus::Failed, Some(e.to_string()))
            }
        };

        Ok(self.finish(&request, run_id, &progress, status, message, skipped_databases).await)
    }

    /// Write the terminal status and build the report
    async fn finish(
        &self,
        request: &RunRequest,
        run_id: RunId,
        progress: &RunProgress,
        mut status: RunStatus,
        mut message: Option<String>,
        skipped_databases: Vec<String>,
    ) -> RunReport {
        let counters = progress.snapshot();
        let reason = message.clone().unwrap_or_default();

        let finished = match status {
            RunStatus::Completed => self.store.complete_run(run_id, &counters).await,
            RunStatus::Aborted => self.store.abort_run(run_id, &counters, &reason).await,
            _ => self.store.fail_run(run_id, &counters, &reason).await,
        };

        if let Err(e) = finished {
            tracing::error!(run_id, error = %e, "Could not record final run status");
            if status != RunStatus::Failed {
                message = Some(format!("could not record run status {}: {}", status, e));
            }
            status = RunStatus::Failed;
        }

        tracing::info!(
            run_id,
            connection = %request.connection,
            status = %status,
            totals = %counters.totals(),
            skipped = counters.skipped,
            "Catalog run finished"
        );

        RunReport {
            run_id,
            connection: request.connection.clone(),
            status,
            counters,
            error_message: message,
            skipped_databases,
        }
    }

    async fn crawl(
        &self,
        request: &RunRequest,
        ctx: &RunContext,
        skipped_databases: &mut Vec<String>,
    ) -> Result<CrawlOutcome, SyncError> {
        ctx.checkpoint()?;

        let databases: Vec<DatabaseInfo> = self
            .source
            .list_databases()
            .await?
            .into_iter()
            .filter(|db| {
                ctx.scope.admits_database(&db.name, db.is_system)
                    && matches(&db.name, request.default_database.as_deref())
            })
            .collect();

        if databases.is_empty() {
            return Ok(CrawlOutcome::EmptyScope);
        }

        let server = ctx
            .diff
            .sync_server(&request.server_host, &request.server_qualified_name, self.source.engine())
            .await?;

        let mut observed = HashSet::new();
        for database in &databases {
            ctx.checkpoint()?;

            let qualified_name = TemporalDiff::child_name(&server, &database.name);
            observed.insert((NodeType::Database, qualified_name.clone()));

            let synced = ctx.diff.sync_database(&server, database).await;
            let Some(node) = ctx.isolate(synced, &qualified_name)? else {
                continue;
            };

            tracing::info!(run_id = ctx.run_id, database = %database.name, "Crawling database");
            match self.crawl_database(ctx, database, &node).await {
                Ok(()) => {}
                Err(SyncError::Source(e)) => {
                    tracing::warn!(
                        run_id = ctx.run_id,
                        database = %database.name,
                        error = %e,
                        "Skipping database"
                    );
                    ctx.progress.record_skipped();
                    skipped_databases.push(database.name.clone());
                }
                Err(e) => return Err(e),
            }
            ctx.flush_progress().await?;
        }

        ctx.checkpoint()?;
        ctx.delete_missing(&server, &observed).await?;
        Ok(CrawlOutcome::Completed)
    }

    /// Crawl one database over a single session
    ///
    /// A source error returned from here means the database was not listed
    /// and nothing under it was deleted.
    async fn crawl_database(
        &self,
        ctx: &RunContext,
        database: &DatabaseInfo,
        node: &NodeRef,
    ) -> Result<(), SyncError> {
        // Dropped on every exit path, releasing the connection
        let session: Arc<dyn DatabaseSession> = Arc::from(self.source.open_database(&database.name).await?);
        let schemas = session.list_schemas().await?;

        let semaphore = Arc::new(Semaphore::new(self.policy.max_concurrent_schemas.max(1)));
        let mut workers = JoinSet::new();
        let mut observed = HashSet::new();

        for schema in schemas
            .iter()
            .filter(|s| ctx.scope.admits_schema(&s.name, s.is_system))
        {
            ctx.checkpoint()?;

            let qualified_name = TemporalDiff::child_name(node, &schema.name);
            observed.insert((NodeType::Schema, qualified_name.clone()));

            let synced = ctx.diff.sync_schema(node, schema).await;
            let Some(schema_node) = ctx.isolate(synced, &qualified_name)? else {
                continue;
            };

            let worker = SchemaWorker {
                ctx: ctx.clone(),
                session: session.clone(),
                schema_name: schema.name.clone(),
                schema: schema_node,
            };
            let semaphore = semaphore.clone();
            workers.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|e| SyncError::Worker(e.to_string()))?;
                worker.run().await
            });
        }

        let mut failure = None;
        while let Some(joined) = workers.join_next().await {
            let result = match joined {
                Ok(result) => result,
                Err(e) if e.is_cancelled() => Ok(()),
                Err(e) => Err(SyncError::Worker(e.to_string())),
            };
            if let Err(e) = result {
                if failure.is_none() {
                    workers.abort_all();
                    failure = Some(e);
                }
            }
        }
        if let Some(e) = failure {
            return Err(e);
        }

        ctx.checkpoint()?;
        ctx.delete_missing(node, &observed).await
    }
}

/// Per-run state shared with schema workers
#[derive(Clone)]
struct RunContext {
    run_id: RunId,
    diff: Arc<TemporalDiff>,
    store: Arc<dyn NodeStore>,
    progress: Arc<RunProgress>,
    scope: Arc<CompiledScope>,
    collect_row_counts: bool,
    cancel: CancellationToken,
}

impl RunContext {
    fn checkpoint(&self) -> Result<(), SyncError> {
        if self.cancel.is_cancelled() {
            Err(SyncError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Turn a non-fatal store fault into a skip
    fn isolate<T>(&self, result: Result<T, StoreError>, qualified_name: &str) -> Result<Option<T>, SyncError> {
        match result {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.is_fatal() => Err(e.into()),
            Err(e) => {
                tracing::warn!(
                    run_id = self.run_id,
                    qualified_name = %qualified_name,
                    error = %e,
                    "Skipping object after store fault"
                );
                self.progress.record_skipped();
                Ok(None)
            }
        }
    }

    async fn delete_missing(&self, parent: &NodeRef, observed: &HashSet<NodeKey>) -> Result<(), SyncError> {
        let result = DeletionPass::new(&*self.store, &self.progress, self.run_id)
            .run(parent, observed)
            .await;
        self.isolate(result, &parent.qualified_name).map(|_| ())
    }

    /// Publish the counters reached so far on the run record
    async fn flush_progress(&self) -> Result<(), SyncError> {
        let counters = self.progress.snapshot();
        match self.store.update_run_progress(self.run_id, &counters).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_fatal() => Err(e.into()),
            Err(e) => {
                tracing::warn!(run_id = self.run_id, error = %e, "Could not publish run progress");
                Ok(())
            }
        }
    }
}

/// Crawls the tables of one schema
struct SchemaWorker {
    ctx: RunContext,
    session: Arc<dyn DatabaseSession>,
    schema_name: String,
    schema: NodeRef,
}

impl SchemaWorker {
    async fn run(self) -> Result<(), SyncError> {
        let ctx = &self.ctx;
        let tables = match self
            .session
            .list_tables(&self.schema_name, ctx.scope.include_views, ctx.scope.include_system_objects)
            .await
        {
            Ok(tables) => tables,
            Err(e) => {
                tracing::warn!(
                    run_id = ctx.run_id,
                    database = %self.session.database(),
                    schema = %self.schema_name,
                    error = %e,
                    "Skipping schema"
                );
                ctx.progress.record_skipped();
                return Ok(());
            }
        };

        let mut observed = HashSet::new();
        for table in tables
            .iter()
            .filter(|t| ctx.scope.admits_table(&t.name, t.is_view(), t.is_system))
        {
            ctx.checkpoint()?;

            let qualified_name = TemporalDiff::child_name(&self.schema, &table.name);
            let relation_type = if table.is_view() { NodeType::View } else { NodeType::Table };
            observed.insert((relation_type, qualified_name.clone()));

            let synced = ctx.diff.sync_table(&self.schema, table).await;
            let Some(node) = ctx.isolate(synced, &qualified_name)? else {
                continue;
            };

            if let (true, Some(sql)) = (table.is_view(), table.view_definition.as_deref()) {
                let synced = ctx.diff.sync_view_definition(&node, sql).await;
                ctx.isolate(synced, &qualified_name)?;
            }

            self.sync_columns(table, &node).await?;

            if ctx.collect_row_counts && !table.is_view() {
                self.collect_row_count(table, &node).await;
            }

            ctx.flush_progress().await?;
        }

        ctx.checkpoint()?;
        ctx.delete_missing(&self.schema, &observed).await
    }

    async fn sync_columns(&self, table: &TableInfo, node: &NodeRef) -> Result<(), SyncError> {
        let ctx = &self.ctx;
        let columns = match self.session.list_columns(&self.schema_name, &table.name).await {
            Ok(columns) => columns,
            Err(e) => {
                tracing::warn!(
                    run_id = ctx.run_id,
                    qualified_name = %node.qualified_name,
                    error = %e,
                    "Skipping columns"
                );
                ctx.progress.record_skipped();
                return Ok(());
            }
        };

        let mut observed = HashSet::new();
        for column in &columns {
            let qualified_name = TemporalDiff::child_name(node, &column.name);
            observed.insert((NodeType::Column, qualified_name.clone()));
            let synced = ctx.diff.sync_column(node, column).await;
            ctx.isolate(synced, &qualified_name)?;
        }

        ctx.delete_missing(node, &observed).await
    }

    /// Best-effort statistic; failures are logged and ignored
    async fn collect_row_count(&self, table: &TableInfo, node: &NodeRef) {
        let ctx = &self.ctx;
        let estimate = match self.session.estimate_row_count(&self.schema_name, &table.name).await {
            Ok(Some(estimate)) => estimate,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(
                    run_id = ctx.run_id,
                    qualified_name = %node.qualified_name,
                    error = %e,
                    "Row count unavailable"
                );
                return;
            }
        };

        if let Err(e) = ctx.store.record_row_count(node.id, estimate).await {
            tracing::warn!(
                run_id = ctx.run_id,
                qualified_name = %node.qualified_name,
                error = %e,
                "Could not record row count"
            );
        }
    }
}
