//! End-to-end sync scenarios
//!
//! Every test crawls an in-memory source into an in-memory store through the
//! run coordinator, mutates the source and crawls again.

mod fixtures;

use std::time::Duration;

use fixtures::{d1_s1, id_name_columns, request, schema_with_tables, seeded, Harness};
use metasync_core::{EntityCounters, NodeType, PolicyConfig, RunStatus, ScopeDescriptor};
use metasync_engine::{RunCoordinator, RunRequest};
use metasync_source::{ColumnInfo, FaultPoint, MockSource, SourceError, TableFixture};
use metasync_store::{MemoryNodeStore, NodeStore};
use pretty_assertions::{assert_eq, assert_ne};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn totals(added: u64, updated: u64, deleted: u64, unchanged: u64) -> EntityCounters {
    EntityCounters { added, updated, deleted, unchanged }
}

// =============================================================================
// Versioning
// =============================================================================

#[tokio::test]
async fn three_run_lifecycle() {
    let h = Harness::new(seeded());

    // Run 1: D1, S1, T1, T1.id, T1.name
    let run1 = h.run(request(d1_s1())).await;
    assert_eq!(run1.status, RunStatus::Completed);
    assert_eq!(run1.counters.totals(), totals(5, 0, 0, 0));
    assert_eq!(run1.counters.columns.added, 2);
    assert!(h.is_current(NodeType::Column, "h/D1.S1.T1.name").await);

    // Run 2: drop name, add age
    h.source.drop_column("D1", "S1", "T1", "name").await;
    h.source
        .put_column("D1", "S1", "T1", ColumnInfo::new("age", "integer", true, 2))
        .await;
    let run2 = h.run(request(d1_s1())).await;
    assert_eq!(run2.status, RunStatus::Completed);
    assert_eq!(run2.counters.columns, totals(1, 0, 1, 1));
    assert_eq!(run2.counters.tables, totals(0, 0, 0, 1));
    assert_eq!(run2.counters.totals(), totals(1, 0, 1, 4));

    let name = h.store.node_history(NodeType::Column, "h/D1.S1.T1.name").await.unwrap();
    assert_eq!(name.len(), 1);
    assert!(!name[0].is_current);
    assert_eq!(name[0].deleted_in_run, Some(run2.run_id));
    assert!(name[0].deleted_at.is_some());

    let table = h.store.current_node(NodeType::Table, "h/D1.S1.T1").await.unwrap().unwrap();
    assert_eq!(table.created_in_run, run1.run_id);
    assert_eq!(table.last_seen_run, run2.run_id);

    // Run 3: nothing changed
    let run3 = h.run(request(d1_s1())).await;
    assert_eq!(run3.status, RunStatus::Completed);
    assert_eq!(run3.counters.totals(), totals(0, 0, 0, 5));
}

#[tokio::test]
async fn second_run_over_unchanged_source_only_heartbeats() {
    let source = MockSource::builder()
        .table("D1", "S1", TableFixture::table("T1", id_name_columns()))
        .table("D1", "S1", TableFixture::view("V1", "SELECT id FROM S1.T1", vec![ColumnInfo::new("id", "integer", false, 1)]))
        .table("D1", "S2", TableFixture::table("T2", id_name_columns()))
        .build();
    let h = Harness::new(source);
    let scope = ScopeDescriptor::default().with_schemas("S*");

    let first = h.run(request(scope.clone())).await;
    assert_eq!(first.counters.views.added, 1);
    assert_eq!(first.counters.view_definitions.added, 1);
    let nodes_after_first = h.store.node_count().await;

    let second = h.run(request(scope)).await;
    let totals = second.counters.totals();
    assert_eq!(totals.added, 0);
    assert_eq!(totals.updated, 0);
    assert_eq!(totals.deleted, 0);
    assert_eq!(totals.unchanged, first.counters.totals().added);
    assert_eq!(second.counters.view_definitions.unchanged, 1);
    assert_eq!(h.store.node_count().await, nodes_after_first);
}

#[tokio::test]
async fn changed_column_versions_alone() {
    let source = MockSource::builder()
        .table(
            "D1",
            "S1",
            TableFixture::table(
                "T1",
                vec![
                    ColumnInfo::new("id", "integer", false, 1),
                    ColumnInfo::new("name", "text", true, 2),
                    ColumnInfo::new("email", "text", true, 3),
                ],
            ),
        )
        .build();
    let h = Harness::new(source);
    h.run(request(d1_s1())).await;

    h.source
        .put_column("D1", "S1", "T1", ColumnInfo::new("name", "varchar(64)", true, 2))
        .await;
    let run2 = h.run(request(d1_s1())).await;

    assert_eq!(run2.counters.columns, totals(0, 1, 0, 2));
    assert_eq!(run2.counters.tables, totals(0, 0, 0, 1));
    assert_eq!(h.version_count(NodeType::Column, "h/D1.S1.T1.name").await, 2);
    assert_eq!(h.version_count(NodeType::Column, "h/D1.S1.T1.id").await, 1);
    assert_eq!(h.version_count(NodeType::Column, "h/D1.S1.T1.email").await, 1);

    let history = h.store.node_history(NodeType::Column, "h/D1.S1.T1.name").await.unwrap();
    assert!(!history[0].is_current);
    assert_eq!(history[0].deleted_in_run, None);
    assert!(history[1].is_current);
    assert_eq!(history[1].created_in_run, run2.run_id);
}

#[tokio::test]
async fn dropped_table_closes_only_its_subtree() {
    let h = Harness::new(schema_with_tables(&["T1", "T2", "T3"]));
    h.run(request(d1_s1())).await;

    h.source.drop_table("D1", "S1", "T2").await;
    let run2 = h.run(request(d1_s1())).await;

    assert_eq!(run2.status, RunStatus::Completed);
    assert_eq!(run2.counters.tables, totals(0, 0, 1, 2));
    assert_eq!(run2.counters.columns, totals(0, 0, 2, 4));
    assert!(!h.is_current(NodeType::Table, "h/D1.S1.T2").await);
    assert!(!h.is_current(NodeType::Column, "h/D1.S1.T2.id").await);
    for table in ["T1", "T3"] {
        let qualified_name = format!("h/D1.S1.{}", table);
        assert!(h.is_current(NodeType::Table, &qualified_name).await);
        assert_eq!(h.version_count(NodeType::Table, &qualified_name).await, 1);
    }
}

#[tokio::test]
async fn vanished_schema_closes_every_level_below() {
    let source = MockSource::builder()
        .table("D1", "S1", TableFixture::table("T1", id_name_columns()))
        .table("D1", "S2", TableFixture::table("T1", id_name_columns()))
        .table("D1", "S2", TableFixture::table("T2", id_name_columns()))
        .build();
    let h = Harness::new(source);
    let scope = ScopeDescriptor::default().with_schemas("S*");
    h.run(request(scope.clone())).await;

    h.source.drop_schema("D1", "S2").await;
    let run2 = h.run(request(scope)).await;

    assert_eq!(run2.counters.schemas.deleted, 1);
    assert_eq!(run2.counters.tables.deleted, 2);
    assert_eq!(run2.counters.columns.deleted, 4);
    assert!(h.is_current(NodeType::Column, "h/D1.S1.T1.id").await);
    assert!(!h.is_current(NodeType::Column, "h/D1.S2.T2.name").await);
}

#[tokio::test]
async fn view_definition_versions_on_raw_text() {
    let source = MockSource::builder()
        .table("D1", "S1", TableFixture::view("V1", "SELECT 1", vec![ColumnInfo::new("x", "integer", true, 1)]))
        .build();
    let h = Harness::new(source);
    h.run(request(d1_s1())).await;

    // Whitespace alone counts as a change
    h.source.set_view_definition("D1", "S1", "V1", "SELECT  1").await;
    let run2 = h.run(request(d1_s1())).await;

    assert_eq!(run2.counters.view_definitions, totals(0, 1, 0, 0));
    assert_eq!(run2.counters.views, totals(0, 0, 0, 1));
    let history = h.store.view_definition_history("h/D1.S1.V1").await.unwrap();
    assert_eq!(history.len(), 2);
    let current = h.store.current_view_definition("h/D1.S1.V1").await.unwrap().unwrap();
    assert_eq!(current.sql_text, "SELECT  1");
}

#[tokio::test]
async fn relation_replaced_by_view_closes_the_table() {
    let h = Harness::new(seeded());
    h.run(request(d1_s1())).await;

    h.source
        .put_table("D1", "S1", TableFixture::view("T1", "SELECT id, name FROM T0", id_name_columns()))
        .await;
    let run2 = h.run(request(d1_s1())).await;

    assert_eq!(run2.status, RunStatus::Completed);
    assert_eq!(run2.counters.tables, totals(0, 0, 1, 0));
    assert_eq!(run2.counters.views, totals(1, 0, 0, 0));
    assert_eq!(run2.counters.columns, totals(0, 0, 0, 2));
    assert!(!h.is_current(NodeType::Table, "h/D1.S1.T1").await);
    assert!(h.is_current(NodeType::View, "h/D1.S1.T1").await);

    let column = h.store.current_node(NodeType::Column, "h/D1.S1.T1.id").await.unwrap().unwrap();
    assert_eq!(column.detail.parent.map(|p| p.node_type), Some(NodeType::View));

    let run3 = h.run(request(d1_s1())).await;
    assert_eq!(run3.counters.tables, totals(0, 0, 0, 0));
    assert_eq!(run3.counters.views, totals(0, 0, 0, 1));
    assert_eq!(run3.counters.columns, totals(0, 0, 0, 2));
    assert!(!h.is_current(NodeType::Table, "h/D1.S1.T1").await);
}

#[tokio::test]
async fn dotted_names_keep_distinct_identities() {
    let source = MockSource::builder()
        .table("D1", "a", TableFixture::table("b.c", id_name_columns()))
        .table("D1", "a.b", TableFixture::table("c", id_name_columns()))
        .build();
    let h = Harness::new(source);
    let scope = ScopeDescriptor::default().with_databases("D1").with_schemas("a*");

    let run1 = h.run(request(scope.clone())).await;
    assert_eq!(run1.counters.tables, totals(2, 0, 0, 0));
    assert_eq!(run1.counters.columns, totals(4, 0, 0, 0));
    assert!(h.is_current(NodeType::Table, "h/D1.a.\"b.c\"").await);
    assert!(h.is_current(NodeType::Table, "h/D1.\"a.b\".c").await);

    let run2 = h.run(request(scope)).await;
    assert_eq!(run2.counters.tables, totals(0, 0, 0, 2));
    assert_eq!(run2.counters.columns, totals(0, 0, 0, 4));
}

// =============================================================================
// Scope and policy
// =============================================================================

#[tokio::test]
async fn unfiltered_scope_is_aborted_without_writes() {
    let h = Harness::new(seeded());

    let report = h.run(request(ScopeDescriptor::default().with_databases("D1"))).await;

    assert_eq!(report.status, RunStatus::Aborted);
    assert!(report.error_message.unwrap().contains("unfiltered"));
    assert_eq!(h.store.node_count().await, 0);
    assert_eq!(h.source.sessions_opened(), 0);

    let run = h.store.get_run(report.run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Aborted);
    assert!(run.completed_at.is_some());
}

#[tokio::test]
async fn unfiltered_scope_runs_when_policy_allows() {
    let policy = PolicyConfig { allow_unfiltered: true, ..PolicyConfig::default() };
    let h = Harness::with_policy(seeded(), policy);

    let report = h.run(request(ScopeDescriptor::default())).await;
    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.counters.totals().added, 5);
}

#[tokio::test]
async fn empty_scope_is_aborted_without_writes() {
    let h = Harness::new(seeded());

    let report = h
        .run(request(ScopeDescriptor::default().with_databases("nope").with_schemas("S1")))
        .await;

    assert_eq!(report.status, RunStatus::Aborted);
    assert_eq!(report.error_message.as_deref(), Some("no database matched the scope"));
    assert_eq!(h.store.node_count().await, 0);
}

#[tokio::test]
async fn patterns_select_whole_names_case_insensitively() {
    let mut builder = MockSource::builder();
    for schema in ["sales_orders", "SALES_2020", "hr_employees", "my_sales_orders"] {
        builder = builder.table("D1", schema, TableFixture::table("t", id_name_columns()));
    }
    let h = Harness::new(builder.build());

    h.run(request(ScopeDescriptor::default().with_schemas("sales_*"))).await;

    let schemas: Vec<String> = h
        .store
        .current_children("h/D1", &[NodeType::Schema])
        .await
        .unwrap()
        .into_iter()
        .map(|n| n.name)
        .collect();
    assert_eq!(schemas, vec!["SALES_2020".to_string(), "sales_orders".to_string()]);
}

#[tokio::test]
async fn default_database_narrows_the_scope() {
    let source = MockSource::builder()
        .table("D1", "S1", TableFixture::table("T1", id_name_columns()))
        .table("D2", "S1", TableFixture::table("T1", id_name_columns()))
        .build();
    let h = Harness::new(source);

    let report = h
        .run(request(ScopeDescriptor::default().with_schemas("S1")).with_default_database("D2"))
        .await;

    assert_eq!(report.counters.databases.added, 1);
    assert!(h.is_current(NodeType::Database, "h/D2").await);
    assert!(!h.is_current(NodeType::Database, "h/D1").await);
}

#[tokio::test]
async fn system_objects_are_skipped_by_default() {
    let source = MockSource::builder()
        .system_database("template1")
        .table("D1", "S1", TableFixture::table("T1", id_name_columns()))
        .system_schema("D1", "pg_catalog")
        .build();
    let h = Harness::new(source);

    let report = h.run(request(ScopeDescriptor::default().with_tables("*1"))).await;

    assert_eq!(report.status, RunStatus::Completed);
    assert!(!h.is_current(NodeType::Database, "h/template1").await);
    assert!(!h.is_current(NodeType::Schema, "h/D1.pg_catalog").await);
    assert!(h.is_current(NodeType::Table, "h/D1.S1.T1").await);
}

// =============================================================================
// Fault isolation
// =============================================================================

#[tokio::test]
async fn unreachable_database_is_skipped_not_deleted() {
    let source = MockSource::builder()
        .table("D1", "S1", TableFixture::table("T1", id_name_columns()))
        .table("D2", "S1", TableFixture::table("T1", id_name_columns()))
        .build();
    let h = Harness::new(source);
    let scope = ScopeDescriptor::default().with_schemas("S1");
    h.run(request(scope.clone())).await;

    h.source
        .inject_fault(FaultPoint::open_database("D2"), SourceError::Connectivity("timeout".into()))
        .await;
    let report = h.run(request(scope)).await;

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.skipped_databases, vec!["D2".to_string()]);
    assert_eq!(report.counters.skipped, 1);
    assert_eq!(report.counters.totals().deleted, 0);
    assert!(h.is_current(NodeType::Table, "h/D2.S1.T1").await);
    assert!(h.is_current(NodeType::Database, "h/D2").await);
}

#[tokio::test]
async fn unreadable_columns_are_skipped_not_deleted() {
    let h = Harness::new(schema_with_tables(&["T1", "T2"]));
    h.run(request(d1_s1())).await;

    h.source.drop_column("D1", "S1", "T1", "name").await;
    h.source
        .inject_fault(
            FaultPoint::list_columns("D1", "S1", "T1"),
            SourceError::PermissionDenied("T1".into()),
        )
        .await;
    let report = h.run(request(d1_s1())).await;

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.counters.skipped, 1);
    assert_eq!(report.counters.columns, totals(0, 0, 0, 2));
    assert!(h.is_current(NodeType::Column, "h/D1.S1.T1.name").await);
}

#[tokio::test]
async fn unlistable_schema_keeps_its_tables() {
    let h = Harness::new(schema_with_tables(&["T1"]));
    h.run(request(d1_s1())).await;

    h.source
        .inject_fault(FaultPoint::list_tables("D1", "S1"), SourceError::QueryError("boom".into()))
        .await;
    let report = h.run(request(d1_s1())).await;

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.counters.skipped, 1);
    assert!(h.is_current(NodeType::Table, "h/D1.S1.T1").await);
}

#[tokio::test]
async fn write_fault_on_one_table_is_isolated() {
    let h = Harness::new(schema_with_tables(&["T1", "T2"]));
    h.store.fail_writes_for("h/D1.S1.T2");

    let report = h.run(request(d1_s1())).await;

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.counters.skipped, 1);
    assert_eq!(report.counters.tables.added, 1);
    assert!(h.is_current(NodeType::Column, "h/D1.S1.T1.id").await);
    assert!(!h.is_current(NodeType::Table, "h/D1.S1.T2").await);
}

#[tokio::test]
async fn unavailable_store_fails_the_run_and_keeps_writes() {
    let h = Harness::new(seeded());
    // server, D1 and S1 go through; T1 does not
    h.store.set_unavailable_after(3);

    let report = h.run(request(d1_s1())).await;

    assert_eq!(report.status, RunStatus::Failed);
    assert!(report.error_message.unwrap().contains("unavailable"));
    assert_eq!(report.counters.databases.added, 1);
    assert_eq!(report.counters.schemas.added, 1);
    assert_eq!(h.store.current_node_count().await, 3);
    assert!(h.is_current(NodeType::Schema, "h/D1.S1").await);

    let run = h.store.get_run(report.run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.counters, report.counters);
    assert_eq!(h.source.open_session_count(), 0);
}

#[tokio::test]
async fn failed_server_listing_fails_the_run() {
    let h = Harness::new(seeded());
    h.source
        .inject_fault(FaultPoint::ListDatabases, SourceError::Connectivity("refused".into()))
        .await;

    let report = h.run(request(d1_s1())).await;

    assert_eq!(report.status, RunStatus::Failed);
    assert!(report.error_message.unwrap().contains("refused"));
    assert_eq!(h.store.node_count().await, 0);
}

#[tokio::test]
async fn write_conflicts_are_retried() {
    let h = Harness::new(seeded());
    h.store.conflict_on("h/D1.S1.T1", 2);

    let report = h.run(request(d1_s1())).await;

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.counters.skipped, 0);
    assert_eq!(report.counters.tables.added, 1);
}

#[tokio::test]
async fn persistent_conflict_becomes_a_skip() {
    let policy = PolicyConfig { store_retry_attempts: 1, ..PolicyConfig::default() };
    let h = Harness::with_policy(seeded(), policy);
    h.store.conflict_on("h/D1.S1.T1", 5);

    let report = h.run(request(d1_s1())).await;

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.counters.skipped, 1);
    assert_eq!(report.counters.tables.added, 0);
    assert_eq!(report.counters.columns.added, 0);
}

// =============================================================================
// Resources, cancellation and progress
// =============================================================================

#[tokio::test]
async fn sessions_are_released_on_every_path() {
    let source = MockSource::builder()
        .table("D1", "S1", TableFixture::table("T1", id_name_columns()))
        .table("D2", "S1", TableFixture::table("T1", id_name_columns()))
        .table("D3", "S1", TableFixture::table("T1", id_name_columns()))
        .fault(FaultPoint::list_schemas("D2"), SourceError::PermissionDenied("D2".into()))
        .fault(
            FaultPoint::list_columns("D3", "S1", "T1"),
            SourceError::Connectivity("reset".into()),
        )
        .build();
    let h = Harness::new(source);

    let report = h.run(request(ScopeDescriptor::default().with_schemas("S1"))).await;

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.skipped_databases, vec!["D2".to_string()]);
    assert_eq!(h.source.sessions_opened(), 3);
    assert_eq!(h.source.open_session_count(), 0);
}

#[tokio::test]
async fn cancelled_before_start_is_aborted() {
    let h = Harness::new(seeded());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let report = h.run_with_cancel(request(d1_s1()), cancel).await;

    assert_eq!(report.status, RunStatus::Aborted);
    assert_eq!(report.error_message.as_deref(), Some("cancelled"));
    assert_eq!(h.store.node_count().await, 0);
}

#[tokio::test]
async fn cancelled_mid_run_keeps_counters() {
    let mut builder = MockSource::builder().latency(20);
    for i in 0..30 {
        builder = builder.table("D1", "S1", TableFixture::table(&format!("T{}", i), id_name_columns()));
    }
    let h = Harness::new(builder.build());

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        trigger.cancel();
    });

    let report = h.run_with_cancel(request(ScopeDescriptor::default().with_schemas("S1")), cancel).await;

    assert_eq!(report.status, RunStatus::Aborted);
    assert_eq!(report.error_message.as_deref(), Some("cancelled"));
    assert_eq!(report.counters.databases.added, 1);
    assert!(report.counters.tables.added < 30);
    assert_eq!(report.counters.totals().deleted, 0);
    assert_eq!(h.source.open_session_count(), 0);

    let run = h.store.get_run(report.run_id).await.unwrap();
    assert_eq!(run.counters, report.counters);
}

#[tokio::test]
async fn progress_is_published_on_the_run() {
    let h = Harness::new(schema_with_tables(&["T1", "T2"]));

    let report = h.run(request(d1_s1())).await;

    let run = h.store.get_run(report.run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.counters, report.counters);
    assert_eq!(run.counters.tables.added, 2);
    assert_eq!(run.connection, "local");
}

#[tokio::test]
async fn row_counts_are_recorded_without_versioning() {
    let source = MockSource::builder()
        .table("D1", "S1", TableFixture::table("T1", id_name_columns()).with_row_count(1200))
        .table("D1", "S1", TableFixture::table("T2", id_name_columns()).with_row_count(7))
        .fault(
            FaultPoint::row_count("D1", "S1", "T2"),
            SourceError::PermissionDenied("pg_class".into()),
        )
        .build();
    let policy = PolicyConfig { collect_row_counts: true, ..PolicyConfig::default() };
    let h = Harness::with_policy(source, policy);

    let report = h.run(request(d1_s1())).await;
    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.counters.skipped, 0);

    let t1 = h.store.current_node(NodeType::Table, "h/D1.S1.T1").await.unwrap().unwrap();
    assert_eq!(t1.detail.row_count_estimate, Some(1200));
    let t2 = h.store.current_node(NodeType::Table, "h/D1.S1.T2").await.unwrap().unwrap();
    assert_eq!(t2.detail.row_count_estimate, None);
    assert_eq!(h.version_count(NodeType::Table, "h/D1.S1.T1").await, 1);
}

#[tokio::test]
async fn concurrent_connections_share_one_store() {
    let store = Arc::new(MemoryNodeStore::new());
    let east = RunCoordinator::new(store.clone(), Arc::new(seeded()), PolicyConfig::default());
    let west = RunCoordinator::new(store.clone(), Arc::new(schema_with_tables(&["T1", "T2"])), PolicyConfig::default());

    let (a, b) = tokio::join!(
        east.run(RunRequest::new("east", "east.db", d1_s1())),
        west.run(RunRequest::new("west", "west.db", d1_s1())),
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(a.status, RunStatus::Completed);
    assert_eq!(b.status, RunStatus::Completed);
    assert_ne!(a.run_id, b.run_id);
    assert!(store.current_node(NodeType::Table, "east.db/D1.S1.T1").await.unwrap().is_some());
    assert!(store.current_node(NodeType::Table, "west.db/D1.S1.T2").await.unwrap().is_some());
    assert_eq!(store.list_runs(10).await.unwrap().len(), 2);
}
