//! PostgreSQL node store
//!
//! Nodes, their detail records, view definitions and runs live in four
//! tables created on connect. A partial unique index on
//! `(node_type, qualified_name) WHERE is_current` enforces the one current
//! row per identity; every upsert runs in its own transaction and locks the
//! current row with `SELECT ... FOR UPDATE`. Two writers inserting the same
//! new identity collide on the index and the loser sees
//! [`StoreError::Conflict`].
//!
//! ## Usage
//!
//! ```rust,ignore
//! let store = PostgresNodeStore::connect("postgres://catalog@localhost/metasync").await?;
//! let run_id = store.start_run(new_run).await?;
//! ```

use std::collections::HashSet;

use metasync_core::{
    CatalogRun, ChangeKind, NewRun, Node, NodeDraft, NodeId, NodeKey, NodeRef, NodeType, RunCounters, RunId,
    UpsertOutcome, ViewDefinition,
};

use crate::error::StoreError;
use crate::store::NodeStore;

#[cfg(feature = "postgres")]
use chrono::{DateTime, Utc};

#[cfg(feature = "postgres")]
use metasync_core::{NodeAttributes, NodeDetail, RunStatus, ScopeDescriptor, VersionDecision};

#[cfg(feature = "postgres")]
use tokio::sync::Mutex;

#[cfg(feature = "postgres")]
use tokio_postgres::{config::SslMode, Client, Config as PgConfig, NoTls, Row};

#[cfg(feature = "postgres")]
use postgres_native_tls::MakeTlsConnector;

#[cfg(feature = "postgres")]
use native_tls::TlsConnector;

#[cfg(not(feature = "postgres"))]
const DISABLED: &str = "PostgreSQL store not compiled. Rebuild with: cargo build --features postgres";

#[cfg(feature = "postgres")]
const SCHEMA_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS metasync_runs (
    id              BIGSERIAL PRIMARY KEY,
    connection      TEXT NOT NULL,
    scope           TEXT NOT NULL,
    status          TEXT NOT NULL,
    started_at      TIMESTAMPTZ NOT NULL,
    completed_at    TIMESTAMPTZ,
    counters        TEXT NOT NULL,
    error_message   TEXT,
    log_reference   TEXT
);

CREATE TABLE IF NOT EXISTS metasync_nodes (
    id              BIGSERIAL PRIMARY KEY,
    node_type       TEXT NOT NULL,
    name            TEXT NOT NULL,
    qualified_name  TEXT NOT NULL,
    description     TEXT,
    is_current      BOOLEAN NOT NULL,
    created_in_run  BIGINT NOT NULL REFERENCES metasync_runs (id),
    last_seen_run   BIGINT NOT NULL REFERENCES metasync_runs (id),
    deleted_in_run  BIGINT REFERENCES metasync_runs (id),
    created_at      TIMESTAMPTZ NOT NULL,
    updated_at      TIMESTAMPTZ NOT NULL,
    deleted_at      TIMESTAMPTZ,
    CHECK (deleted_in_run IS NULL OR NOT is_current)
);

CREATE UNIQUE INDEX IF NOT EXISTS metasync_nodes_current
    ON metasync_nodes (node_type, qualified_name) WHERE is_current;

CREATE TABLE IF NOT EXISTS metasync_node_details (
    node_id                 BIGINT PRIMARY KEY REFERENCES metasync_nodes (id),
    parent_id               BIGINT REFERENCES metasync_nodes (id),
    parent_type             TEXT,
    parent_qualified_name   TEXT,
    attributes              TEXT NOT NULL,
    row_count_estimate      BIGINT
);

CREATE INDEX IF NOT EXISTS metasync_node_details_parent
    ON metasync_node_details (parent_qualified_name);

CREATE TABLE IF NOT EXISTS metasync_view_definitions (
    id                  BIGSERIAL PRIMARY KEY,
    view_qualified_name TEXT NOT NULL,
    view_node_id        BIGINT NOT NULL REFERENCES metasync_nodes (id),
    sql_text            TEXT NOT NULL,
    content_hash        TEXT NOT NULL,
    is_current          BOOLEAN NOT NULL,
    created_in_run      BIGINT NOT NULL REFERENCES metasync_runs (id),
    last_seen_run       BIGINT NOT NULL REFERENCES metasync_runs (id),
    deleted_in_run      BIGINT REFERENCES metasync_runs (id),
    created_at          TIMESTAMPTZ NOT NULL,
    deleted_at          TIMESTAMPTZ
);

CREATE UNIQUE INDEX IF NOT EXISTS metasync_view_definitions_current
    ON metasync_view_definitions (view_qualified_name) WHERE is_current;
"#;

#[cfg(feature = "postgres")]
const NODE_COLUMNS: &str = "n.id, n.node_type, n.name, n.qualified_name, n.description, n.is_current, \
    n.created_in_run, n.last_seen_run, n.deleted_in_run, n.created_at, n.updated_at, n.deleted_at, \
    d.parent_id, d.parent_type, d.parent_qualified_name, d.attributes, d.row_count_estimate";

#[cfg(feature = "postgres")]
const RUN_COLUMNS: &str =
    "id, connection, scope, status, started_at, completed_at, counters, error_message, log_reference";

#[cfg(feature = "postgres")]
const DEFINITION_COLUMNS: &str = "id, view_qualified_name, view_node_id, sql_text, content_hash, is_current, \
    created_in_run, last_seen_run, deleted_in_run, created_at, deleted_at";

/// PostgreSQL-backed [`NodeStore`]
pub struct PostgresNodeStore {
    #[cfg(feature = "postgres")]
    client: Mutex<Client>,

    #[cfg(not(feature = "postgres"))]
    _phantom: std::marker::PhantomData<()>,
}

impl PostgresNodeStore {
    /// Connect and create the catalog tables if missing
    ///
    /// TLS is used when the URL asks for `sslmode=require`.
    #[cfg(feature = "postgres")]
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let config: PgConfig = url
            .parse()
            .map_err(|e| StoreError::Unavailable(format!("Invalid store URL: {}", e)))?;

        let client = if config.get_ssl_mode() == SslMode::Require {
            let connector = TlsConnector::builder()
                .build()
                .map_err(|e| StoreError::Unavailable(format!("Failed to create TLS connector: {}", e)))?;
            let (client, connection) = config
                .connect(MakeTlsConnector::new(connector))
                .await
                .map_err(|e| StoreError::Unavailable(format!("Failed to connect to catalog store: {}", e)))?;
            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    tracing::error!(error = %e, "Catalog store connection error");
                }
            });
            client
        } else {
            let (client, connection) = config
                .connect(NoTls)
                .await
                .map_err(|e| StoreError::Unavailable(format!("Failed to connect to catalog store: {}", e)))?;
            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    tracing::error!(error = %e, "Catalog store connection error");
                }
            });
            client
        };

        client
            .batch_execute(SCHEMA_DDL)
            .await
            .map_err(|e| classify(e, "catalog schema"))?;

        Ok(Self { client: Mutex::new(client) })
    }

    #[cfg(not(feature = "postgres"))]
    pub async fn connect(_url: &str) -> Result<Self, StoreError> {
        Err(StoreError::Unavailable(DISABLED.to_string()))
    }
}

/// Normalize a driver error; `context` names the entity being written
#[cfg(feature = "postgres")]
fn classify(err: tokio_postgres::Error, context: &str) -> StoreError {
    use tokio_postgres::error::SqlState;

    if err.is_closed() {
        return StoreError::Unavailable(format!("connection closed: {}", err));
    }
    match err.code() {
        None => StoreError::Unavailable(err.to_string()),
        Some(code)
            if *code == SqlState::ADMIN_SHUTDOWN
                || *code == SqlState::CRASH_SHUTDOWN
                || *code == SqlState::CANNOT_CONNECT_NOW =>
        {
            StoreError::Unavailable(err.to_string())
        }
        Some(_) => StoreError::Write { qualified_name: context.to_string(), message: err.to_string() },
    }
}

/// Like [`classify`], but a unique violation is a lost race on `(node_type, qualified_name)`
#[cfg(feature = "postgres")]
fn classify_upsert(err: tokio_postgres::Error, node_type: NodeType, qualified_name: &str) -> StoreError {
    use tokio_postgres::error::SqlState;

    if err.code() == Some(&SqlState::UNIQUE_VIOLATION) {
        return StoreError::Conflict { node_type, qualified_name: qualified_name.to_string() };
    }
    classify(err, qualified_name)
}

#[cfg(feature = "postgres")]
fn parse_node_type(value: &str) -> Result<NodeType, StoreError> {
    value.parse().map_err(StoreError::Serialization)
}

#[cfg(feature = "postgres")]
fn node_from_row(row: &Row) -> Result<Node, StoreError> {
    let parent_id: Option<i64> = row.get(12);
    let parent_type: Option<String> = row.get(13);
    let parent_qualified_name: Option<String> = row.get(14);
    let parent = match (parent_id, parent_type, parent_qualified_name) {
        (Some(id), Some(node_type), Some(qualified_name)) => Some(NodeRef {
            id,
            node_type: parse_node_type(&node_type)?,
            qualified_name,
        }),
        _ => None,
    };

    let node_type: String = row.get(1);
    let attributes: String = row.get(15);
    let attributes: NodeAttributes = serde_json::from_str(&attributes)?;

    Ok(Node {
        id: row.get(0),
        node_type: parse_node_type(&node_type)?,
        name: row.get(2),
        qualified_name: row.get(3),
        description: row.get(4),
        is_current: row.get(5),
        created_in_run: row.get(6),
        last_seen_run: row.get(7),
        deleted_in_run: row.get(8),
        created_at: row.get(9),
        updated_at: row.get(10),
        deleted_at: row.get(11),
        detail: NodeDetail { parent, attributes, row_count_estimate: row.get(16) },
    })
}

#[cfg(feature = "postgres")]
fn run_from_row(row: &Row) -> Result<CatalogRun, StoreError> {
    let scope: String = row.get(2);
    let status: String = row.get(3);
    let counters: String = row.get(6);
    Ok(CatalogRun {
        id: row.get(0),
        connection: row.get(1),
        scope: serde_json::from_str::<ScopeDescriptor>(&scope)?,
        status: status.parse().map_err(StoreError::Serialization)?,
        started_at: row.get(4),
        completed_at: row.get(5),
        counters: serde_json::from_str(&counters)?,
        error_message: row.get(7),
        log_reference: row.get(8),
    })
}

#[cfg(feature = "postgres")]
fn definition_from_row(row: &Row) -> ViewDefinition {
    ViewDefinition {
        id: row.get(0),
        view_qualified_name: row.get(1),
        view_node_id: row.get(2),
        sql_text: row.get(3),
        content_hash: row.get(4),
        is_current: row.get(5),
        created_in_run: row.get(6),
        last_seen_run: row.get(7),
        deleted_in_run: row.get(8),
        created_at: row.get(9),
        deleted_at: row.get(10),
    }
}

#[cfg(feature = "postgres")]
fn type_names(types: &[NodeType]) -> Vec<String> {
    types.iter().map(|t| t.as_str().to_string()).collect()
}

#[cfg(feature = "postgres")]
impl PostgresNodeStore {
    async fn finish_run(
        &self,
        run_id: RunId,
        status: RunStatus,
        counters: &RunCounters,
        message: Option<&str>,
    ) -> Result<(), StoreError> {
        let context = format!("run {}", run_id);
        let counters = serde_json::to_string(counters)?;
        let mut client = self.client.lock().await;
        let tx = client.transaction().await.map_err(|e| classify(e, &context))?;

        let row = tx
            .query_opt("SELECT status FROM metasync_runs WHERE id = $1 FOR UPDATE", &[&run_id])
            .await
            .map_err(|e| classify(e, &context))?
            .ok_or(StoreError::RunNotFound(run_id))?;
        let current: String = row.get(0);
        let current: RunStatus = current.parse().map_err(StoreError::Serialization)?;
        if !current.can_transition_to(status) {
            return Err(StoreError::InvalidRunTransition { run_id, from: current, to: status });
        }

        tx.execute(
            "UPDATE metasync_runs SET status = $2, counters = $3, error_message = $4, completed_at = $5 \
             WHERE id = $1",
            &[&run_id, &status.as_str(), &counters, &message, &Utc::now()],
        )
        .await
        .map_err(|e| classify(e, &context))?;
        tx.commit().await.map_err(|e| classify(e, &context))
    }
}

#[async_trait::async_trait]
impl NodeStore for PostgresNodeStore {
    fn backend(&self) -> &'static str {
        "postgres"
    }

    #[cfg(feature = "postgres")]
    async fn start_run(&self, new_run: NewRun) -> Result<RunId, StoreError> {
        let scope = serde_json::to_string(&new_run.scope)?;
        let counters = serde_json::to_string(&RunCounters::default())?;
        let client = self.client.lock().await;
        let row = client
            .query_one(
                "INSERT INTO metasync_runs (connection, scope, status, started_at, counters, log_reference) \
                 VALUES ($1, $2, $3, $4, $5, $6) RETURNING id",
                &[
                    &new_run.connection,
                    &scope,
                    &RunStatus::Running.as_str(),
                    &Utc::now(),
                    &counters,
                    &new_run.log_reference,
                ],
            )
            .await
            .map_err(|e| classify(e, &new_run.connection))?;
        Ok(row.get(0))
    }

    #[cfg(feature = "postgres")]
    async fn update_run_progress(&self, run_id: RunId, counters: &RunCounters) -> Result<(), StoreError> {
        let context = format!("run {}", run_id);
        let counters = serde_json::to_string(counters)?;
        let client = self.client.lock().await;
        let updated = client
            .execute(
                "UPDATE metasync_runs SET counters = $2 WHERE id = $1 AND status = 'running'",
                &[&run_id, &counters],
            )
            .await
            .map_err(|e| classify(e, &context))?;
        drop(client);

        if updated == 0 {
            let run = self.get_run(run_id).await?;
            return Err(StoreError::InvalidRunTransition { run_id, from: run.status, to: RunStatus::Running });
        }
        Ok(())
    }

    #[cfg(feature = "postgres")]
    async fn complete_run(&self, run_id: RunId, counters: &RunCounters) -> Result<(), StoreError> {
        self.finish_run(run_id, RunStatus::Completed, counters, None).await
    }

    #[cfg(feature = "postgres")]
    async fn fail_run(&self, run_id: RunId, counters: &RunCounters, error_message: &str) -> Result<(), StoreError> {
        self.finish_run(run_id, RunStatus::Failed, counters, Some(error_message)).await
    }

    #[cfg(feature = "postgres")]
    async fn abort_run(&self, run_id: RunId, counters: &RunCounters, reason: &str) -> Result<(), StoreError> {
        self.finish_run(run_id, RunStatus::Aborted, counters, Some(reason)).await
    }

    #[cfg(feature = "postgres")]
    async fn get_run(&self, run_id: RunId) -> Result<CatalogRun, StoreError> {
        let client = self.client.lock().await;
        let row = client
            .query_opt(&format!("SELECT {} FROM metasync_runs WHERE id = $1", RUN_COLUMNS), &[&run_id])
            .await
            .map_err(|e| classify(e, &format!("run {}", run_id)))?
            .ok_or(StoreError::RunNotFound(run_id))?;
        run_from_row(&row)
    }

    #[cfg(feature = "postgres")]
    async fn list_runs(&self, limit: usize) -> Result<Vec<CatalogRun>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let client = self.client.lock().await;
        let rows = client
            .query(
                &format!("SELECT {} FROM metasync_runs ORDER BY id DESC LIMIT $1", RUN_COLUMNS),
                &[&limit],
            )
            .await
            .map_err(|e| classify(e, "runs"))?;
        rows.iter().map(run_from_row).collect()
    }

    #[cfg(feature = "postgres")]
    async fn upsert_node(&self, draft: &NodeDraft, run_id: RunId) -> Result<UpsertOutcome, StoreError> {
        let node_type = draft.node_type();
        let qn = draft.qualified_name.as_str();
        let attributes = serde_json::to_string(&draft.attributes)?;
        let now = Utc::now();

        let mut client = self.client.lock().await;
        let tx = client.transaction().await.map_err(|e| classify(e, qn))?;

        let current = tx
            .query_opt(
                "SELECT n.id, n.description, d.attributes, d.row_count_estimate, d.parent_id \
                 FROM metasync_nodes n JOIN metasync_node_details d ON d.node_id = n.id \
                 WHERE n.node_type = $1 AND n.qualified_name = $2 AND n.is_current \
                 FOR UPDATE OF n",
                &[&node_type.as_str(), &qn],
            )
            .await
            .map_err(|e| classify_upsert(e, node_type, qn))?;

        let previous = match &current {
            Some(row) => {
                let id: NodeId = row.get(0);
                let description: Option<String> = row.get(1);
                let attributes: String = row.get(2);
                let attributes: NodeAttributes = serde_json::from_str(&attributes)?;
                let row_count: Option<i64> = row.get(3);
                let parent_id: Option<NodeId> = row.get(4);
                Some((id, description, attributes, row_count, parent_id))
            }
            None => None,
        };

        let decision = VersionDecision::evaluate(previous.as_ref().map(|p| &p.2), &draft.attributes);

        let (description, row_count) = match (decision, &previous) {
            (VersionDecision::Heartbeat, Some((id, .., parent_id))) => {
                tx.execute("UPDATE metasync_nodes SET last_seen_run = $2 WHERE id = $1", &[id, &run_id])
                    .await
                    .map_err(|e| classify(e, qn))?;
                let observed_parent = draft.parent.as_ref().map(|p| p.id);
                if observed_parent != *parent_id {
                    let parent_type = draft.parent.as_ref().map(|p| p.node_type.as_str());
                    let parent_qn = draft.parent.as_ref().map(|p| p.qualified_name.as_str());
                    tx.execute(
                        "UPDATE metasync_node_details SET parent_id = $2, parent_type = $3, \
                         parent_qualified_name = $4 WHERE node_id = $1",
                        &[id, &observed_parent, &parent_type, &parent_qn],
                    )
                    .await
                    .map_err(|e| classify(e, qn))?;
                }
                tx.commit().await.map_err(|e| classify(e, qn))?;
                return Ok(UpsertOutcome {
                    node: NodeRef { id: *id, node_type, qualified_name: draft.qualified_name.clone() },
                    change: ChangeKind::Unchanged,
                });
            }
            (VersionDecision::Supersede, Some((id, description, _, row_count, _))) => {
                tx.execute(
                    "UPDATE metasync_nodes SET is_current = FALSE, updated_at = $2 WHERE id = $1",
                    &[id, &now],
                )
                .await
                .map_err(|e| classify(e, qn))?;
                (description.clone(), *row_count)
            }
            _ => (None, None),
        };

        let row = tx
            .query_one(
                "INSERT INTO metasync_nodes \
                 (node_type, name, qualified_name, description, is_current, created_in_run, last_seen_run, \
                  created_at, updated_at) \
                 VALUES ($1, $2, $3, $4, TRUE, $5, $5, $6, $6) RETURNING id",
                &[&node_type.as_str(), &draft.name, &qn, &description, &run_id, &now],
            )
            .await
            .map_err(|e| classify_upsert(e, node_type, qn))?;
        let id: NodeId = row.get(0);

        let parent_id = draft.parent.as_ref().map(|p| p.id);
        let parent_type = draft.parent.as_ref().map(|p| p.node_type.as_str());
        let parent_qn = draft.parent.as_ref().map(|p| p.qualified_name.as_str());
        tx.execute(
            "INSERT INTO metasync_node_details \
             (node_id, parent_id, parent_type, parent_qualified_name, attributes, row_count_estimate) \
             VALUES ($1, $2, $3, $4, $5, $6)",
            &[&id, &parent_id, &parent_type, &parent_qn, &attributes, &row_count],
        )
        .await
        .map_err(|e| classify(e, qn))?;

        tx.commit().await.map_err(|e| classify_upsert(e, node_type, qn))?;

        Ok(UpsertOutcome {
            node: NodeRef { id, node_type, qualified_name: draft.qualified_name.clone() },
            change: decision.change_kind(),
        })
    }

    #[cfg(feature = "postgres")]
    async fn upsert_view_definition(
        &self,
        view: &NodeRef,
        sql_text: &str,
        content_hash: &str,
        run_id: RunId,
    ) -> Result<ChangeKind, StoreError> {
        let qn = view.qualified_name.as_str();
        let mut client = self.client.lock().await;
        let tx = client.transaction().await.map_err(|e| classify(e, qn))?;

        let current = tx
            .query_opt(
                "SELECT id, content_hash FROM metasync_view_definitions \
                 WHERE view_qualified_name = $1 AND is_current FOR UPDATE",
                &[&qn],
            )
            .await
            .map_err(|e| classify(e, qn))?;
        let current: Option<(i64, String)> = current.map(|row| (row.get(0), row.get(1)));

        let decision = VersionDecision::evaluate_hash(current.as_ref().map(|c| c.1.as_str()), content_hash);
        match (decision, &current) {
            (VersionDecision::Heartbeat, Some((id, _))) => {
                tx.execute(
                    "UPDATE metasync_view_definitions SET last_seen_run = $2, view_node_id = $3 WHERE id = $1",
                    &[id, &run_id, &view.id],
                )
                .await
                .map_err(|e| classify(e, qn))?;
            }
            (VersionDecision::Supersede, Some((id, _))) => {
                tx.execute("UPDATE metasync_view_definitions SET is_current = FALSE WHERE id = $1", &[id])
                    .await
                    .map_err(|e| classify(e, qn))?;
            }
            _ => {}
        }

        if decision != VersionDecision::Heartbeat {
            tx.execute(
                "INSERT INTO metasync_view_definitions \
                 (view_qualified_name, view_node_id, sql_text, content_hash, is_current, created_in_run, \
                  last_seen_run, created_at) \
                 VALUES ($1, $2, $3, $4, TRUE, $5, $5, $6)",
                &[&qn, &view.id, &sql_text, &content_hash, &run_id, &Utc::now()],
            )
            .await
            .map_err(|e| classify_upsert(e, view.node_type, qn))?;
        }

        tx.commit().await.map_err(|e| classify_upsert(e, view.node_type, qn))?;
        Ok(decision.change_kind())
    }

    #[cfg(feature = "postgres")]
    async fn record_row_count(&self, node_id: NodeId, estimate: i64) -> Result<(), StoreError> {
        let context = format!("node {}", node_id);
        let client = self.client.lock().await;
        client
            .execute(
                "UPDATE metasync_node_details SET row_count_estimate = $2 WHERE node_id = $1",
                &[&node_id, &estimate],
            )
            .await
            .map_err(|e| classify(e, &context))?;
        Ok(())
    }

    #[cfg(feature = "postgres")]
    async fn mark_missing_as_deleted(
        &self,
        parent: &NodeRef,
        child_types: &[NodeType],
        observed: &HashSet<NodeKey>,
        run_id: RunId,
    ) -> Result<Vec<NodeRef>, StoreError> {
        let qn = parent.qualified_name.as_str();
        let types = type_names(child_types);
        let now: DateTime<Utc> = Utc::now();

        let mut client = self.client.lock().await;
        let tx = client.transaction().await.map_err(|e| classify(e, qn))?;

        let rows = tx
            .query(
                "SELECT n.id, n.node_type, n.qualified_name \
                 FROM metasync_nodes n JOIN metasync_node_details d ON d.node_id = n.id \
                 WHERE n.is_current AND d.parent_qualified_name = $1 AND d.parent_type = $4 \
                   AND n.node_type = ANY($2) AND n.last_seen_run <> $3 \
                 ORDER BY n.qualified_name \
                 FOR UPDATE OF n",
                &[&qn, &types, &run_id, &parent.node_type.as_str()],
            )
            .await
            .map_err(|e| classify(e, qn))?;

        let mut deleted = Vec::new();
        for row in &rows {
            let node_type: String = row.get(1);
            let key: NodeKey = (parse_node_type(&node_type)?, row.get(2));
            if observed.contains(&key) {
                continue;
            }
            let (node_type, qualified_name) = key;
            let node = NodeRef { id: row.get(0), node_type, qualified_name };

            tx.execute(
                "UPDATE metasync_nodes SET is_current = FALSE, deleted_in_run = $2, deleted_at = $3, \
                 updated_at = $3 WHERE id = $1",
                &[&node.id, &run_id, &now],
            )
            .await
            .map_err(|e| classify(e, &node.qualified_name))?;

            if node.node_type == NodeType::View {
                tx.execute(
                    "UPDATE metasync_view_definitions SET is_current = FALSE, deleted_in_run = $2, \
                     deleted_at = $3 WHERE view_qualified_name = $1 AND is_current",
                    &[&node.qualified_name, &run_id, &now],
                )
                .await
                .map_err(|e| classify(e, &node.qualified_name))?;
            }
            deleted.push(node);
        }

        tx.commit().await.map_err(|e| classify(e, qn))?;
        Ok(deleted)
    }

    #[cfg(feature = "postgres")]
    async fn current_node(&self, node_type: NodeType, qualified_name: &str) -> Result<Option<Node>, StoreError> {
        let client = self.client.lock().await;
        let row = client
            .query_opt(
                &format!(
                    "SELECT {} FROM metasync_nodes n JOIN metasync_node_details d ON d.node_id = n.id \
                     WHERE n.node_type = $1 AND n.qualified_name = $2 AND n.is_current",
                    NODE_COLUMNS
                ),
                &[&node_type.as_str(), &qualified_name],
            )
            .await
            .map_err(|e| classify(e, qualified_name))?;
        row.as_ref().map(node_from_row).transpose()
    }

    #[cfg(feature = "postgres")]
    async fn node_history(&self, node_type: NodeType, qualified_name: &str) -> Result<Vec<Node>, StoreError> {
        let client = self.client.lock().await;
        let rows = client
            .query(
                &format!(
                    "SELECT {} FROM metasync_nodes n JOIN metasync_node_details d ON d.node_id = n.id \
                     WHERE n.node_type = $1 AND n.qualified_name = $2 ORDER BY n.id",
                    NODE_COLUMNS
                ),
                &[&node_type.as_str(), &qualified_name],
            )
            .await
            .map_err(|e| classify(e, qualified_name))?;
        rows.iter().map(node_from_row).collect()
    }

    #[cfg(feature = "postgres")]
    async fn current_children(
        &self,
        parent_qualified_name: &str,
        child_types: &[NodeType],
    ) -> Result<Vec<Node>, StoreError> {
        let types = type_names(child_types);
        let client = self.client.lock().await;
        let rows = client
            .query(
                &format!(
                    "SELECT {} FROM metasync_nodes n JOIN metasync_node_details d ON d.node_id = n.id \
                     WHERE n.is_current AND d.parent_qualified_name = $1 AND n.node_type = ANY($2) \
                     ORDER BY n.qualified_name",
                    NODE_COLUMNS
                ),
                &[&parent_qualified_name, &types],
            )
            .await
            .map_err(|e| classify(e, parent_qualified_name))?;
        rows.iter().map(node_from_row).collect()
    }

    #[cfg(feature = "postgres")]
    async fn current_view_definition(&self, view_qualified_name: &str) -> Result<Option<ViewDefinition>, StoreError> {
        let client = self.client.lock().await;
        let row = client
            .query_opt(
                &format!(
                    "SELECT {} FROM metasync_view_definitions WHERE view_qualified_name = $1 AND is_current",
                    DEFINITION_COLUMNS
                ),
                &[&view_qualified_name],
            )
            .await
            .map_err(|e| classify(e, view_qualified_name))?;
        Ok(row.as_ref().map(definition_from_row))
    }

    #[cfg(feature = "postgres")]
    async fn view_definition_history(&self, view_qualified_name: &str) -> Result<Vec<ViewDefinition>, StoreError> {
        let client = self.client.lock().await;
        let rows = client
            .query(
                &format!(
                    "SELECT {} FROM metasync_view_definitions WHERE view_qualified_name = $1 ORDER BY id",
                    DEFINITION_COLUMNS
                ),
                &[&view_qualified_name],
            )
            .await
            .map_err(|e| classify(e, view_qualified_name))?;
        Ok(rows.iter().map(definition_from_row).collect())
    }

    // Without the feature the store cannot be constructed; these only satisfy the trait

    #[cfg(not(feature = "postgres"))]
    async fn start_run(&self, _new_run: NewRun) -> Result<RunId, StoreError> {
        Err(StoreError::Unavailable(DISABLED.to_string()))
    }

    #[cfg(not(feature = "postgres"))]
    async fn update_run_progress(&self, _run_id: RunId, _counters: &RunCounters) -> Result<(), StoreError> {
        Err(StoreError::Unavailable(DISABLED.to_string()))
    }

    #[cfg(not(feature = "postgres"))]
    async fn complete_run(&self, _run_id: RunId, _counters: &RunCounters) -> Result<(), StoreError> {
        Err(StoreError::Unavailable(DISABLED.to_string()))
    }

    #[cfg(not(feature = "postgres"))]
    async fn fail_run(&self, _run_id: RunId, _counters: &RunCounters, _error_message: &str) -> Result<(), StoreError> {
        Err(StoreError::Unavailable(DISABLED.to_string()))
    }

    #[cfg(not(feature = "postgres"))]
    async fn abort_run(&self, _run_id: RunId, _counters: &RunCounters, _reason: &str) -> Result<(), StoreError> {
        Err(StoreError::Unavailable(DISABLED.to_string()))
    }

    #[cfg(not(feature = "postgres"))]
    async fn get_run(&self, _run_id: RunId) -> Result<CatalogRun, StoreError> {
        Err(StoreError::Unavailable(DISABLED.to_string()))
    }

    #[cfg(not(feature = "postgres"))]
    async fn list_runs(&self, _limit: usize) -> Result<Vec<CatalogRun>, StoreError> {
        Err(StoreError::Unavailable(DISABLED.to_string()))
    }

    #[cfg(not(feature = "postgres"))]
    async fn upsert_node(&self, _draft: &NodeDraft, _run_id: RunId) -> Result<UpsertOutcome, StoreError> {
        Err(StoreError::Unavailable(DISABLED.to_string()))
    }

    #[cfg(not(feature = "postgres"))]
    async fn upsert_view_definition(
        &self,
        _view: &NodeRef,
        _sql_text: &str,
        _content_hash: &str,
        _run_id: RunId,
    ) -> Result<ChangeKind, StoreError> {
        Err(StoreError::Unavailable(DISABLED.to_string()))
    }

    #[cfg(not(feature = "postgres"))]
    async fn record_row_count(&self, _node_id: NodeId, _estimate: i64) -> Result<(), StoreError> {
        Err(StoreError::Unavailable(DISABLED.to_string()))
    }

    #[cfg(not(feature = "postgres"))]
    async fn mark_missing_as_deleted(
        &self,
        _parent: &NodeRef,
        _child_types: &[NodeType],
        _observed: &HashSet<NodeKey>,
        _run_id: RunId,
    ) -> Result<Vec<NodeRef>, StoreError> {
        Err(StoreError::Unavailable(DISABLED.to_string()))
    }

    #[cfg(not(feature = "postgres"))]
    async fn current_node(&self, _node_type: NodeType, _qualified_name: &str) -> Result<Option<Node>, StoreError> {
        Err(StoreError::Unavailable(DISABLED.to_string()))
    }

    #[cfg(not(feature = "postgres"))]
    async fn node_history(&self, _node_type: NodeType, _qualified_name: &str) -> Result<Vec<Node>, StoreError> {
        Err(StoreError::Unavailable(DISABLED.to_string()))
    }

    #[cfg(not(feature = "postgres"))]
    async fn current_children(
        &self,
        _parent_qualified_name: &str,
        _child_types: &[NodeType],
    ) -> Result<Vec<Node>, StoreError> {
        Err(StoreError::Unavailable(DISABLED.to_string()))
    }

    #[cfg(not(feature = "postgres"))]
    async fn current_view_definition(&self, _view_qualified_name: &str) -> Result<Option<ViewDefinition>, StoreError> {
        Err(StoreError::Unavailable(DISABLED.to_string()))
    }

    #[cfg(not(feature = "postgres"))]
    async fn view_definition_history(&self, _view_qualified_name: &str) -> Result<Vec<ViewDefinition>, StoreError> {
        Err(StoreError::Unavailable(DISABLED.to_string()))
    }
}
