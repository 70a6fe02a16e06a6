//! In-memory node store with JSON snapshot persistence
//!
//! Backs tests and the default CLI build. All state sits behind one async
//! `RwLock`, so every upsert is atomic per key. The whole store can be
//! written to and reloaded from a JSON file between invocations. A store
//! opened with [`MemoryNodeStore::open`] also rewrites that file whenever a
//! run starts, publishes progress or finishes, so an interrupted process
//! leaves its committed work and the in-flight run record on disk.
//!
//! Write faults can be injected for testing:
//! - [`MemoryNodeStore::set_unavailable`] makes node writes fail as if the
//!   store had gone away
//! - [`MemoryNodeStore::fail_writes_for`] fails writes to one qualified name
//! - [`MemoryNodeStore::conflict_on`] reports concurrent-write conflicts

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::sync::RwLock;

use metasync_core::{
    CatalogRun, ChangeKind, NewRun, Node, NodeDetail, NodeDraft, NodeId, NodeKey, NodeRef, NodeType, RunCounters,
    RunId, RunStatus, UpsertOutcome, VersionDecision, ViewDefinition,
};

use crate::error::StoreError;
use crate::store::NodeStore;

/// Serializable image of a whole store
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreSnapshot {
    #[serde(default)]
    pub nodes: Vec<Node>,

    #[serde(default)]
    pub runs: Vec<CatalogRun>,

    #[serde(default)]
    pub view_definitions: Vec<ViewDefinition>,
}

#[derive(Default)]
struct State {
    nodes: BTreeMap<NodeId, Node>,

    /// `(type, qualified_name)` -> id of the current row
    current: HashMap<NodeKey, NodeId>,

    runs: BTreeMap<RunId, CatalogRun>,

    view_definitions: BTreeMap<i64, ViewDefinition>,

    /// view qualified name -> id of the current definition
    current_definitions: HashMap<String, i64>,

    next_node_id: NodeId,
    next_run_id: RunId,
    next_definition_id: i64,
}

impl State {
    fn from_snapshot(snapshot: StoreSnapshot) -> Result<Self, StoreError> {
        let mut state = State::default();

        for node in snapshot.nodes {
            if node.is_current {
                let key = (node.node_type, node.qualified_name.clone());
                if state.current.insert(key, node.id).is_some() {
                    return Err(StoreError::Serialization(format!(
                        "snapshot has two current {} rows for {}",
                        node.node_type, node.qualified_name
                    )));
                }
            }
            state.next_node_id = state.next_node_id.max(node.id);
            state.nodes.insert(node.id, node);
        }

        for run in snapshot.runs {
            state.next_run_id = state.next_run_id.max(run.id);
            state.runs.insert(run.id, run);
        }

        for definition in snapshot.view_definitions {
            if definition.is_current {
                state
                    .current_definitions
                    .insert(definition.view_qualified_name.clone(), definition.id);
            }
            state.next_definition_id = state.next_definition_id.max(definition.id);
            state.view_definitions.insert(definition.id, definition);
        }

        Ok(state)
    }

    fn to_snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            nodes: self.nodes.values().cloned().collect(),
            runs: self.runs.values().cloned().collect(),
            view_definitions: self.view_definitions.values().cloned().collect(),
        }
    }

    fn current_node(&self, node_type: NodeType, qualified_name: &str) -> Option<&Node> {
        self.current
            .get(&(node_type, qualified_name.to_string()))
            .and_then(|id| self.nodes.get(id))
    }

    fn run_mut(&mut self, run_id: RunId) -> Result<&mut CatalogRun, StoreError> {
        self.runs.get_mut(&run_id).ok_or(StoreError::RunNotFound(run_id))
    }

    fn finish_run(
        &mut self,
        run_id: RunId,
        status: RunStatus,
        counters: &RunCounters,
        message: Option<&str>,
    ) -> Result<(), StoreError> {
        let run = self.run_mut(run_id)?;
        if !run.status.can_transition_to(status) {
            return Err(StoreError::InvalidRunTransition { run_id, from: run.status, to: status });
        }
        run.status = status;
        run.counters = *counters;
        run.completed_at = Some(Utc::now());
        run.error_message = message.map(str::to_string);
        Ok(())
    }

    fn close_view_definition(&mut self, view_qualified_name: &str, run_id: RunId) {
        if let Some(id) = self.current_definitions.remove(view_qualified_name) {
            if let Some(definition) = self.view_definitions.get_mut(&id) {
                definition.is_current = false;
                definition.deleted_in_run = Some(run_id);
                definition.deleted_at = Some(Utc::now());
            }
        }
    }
}

/// Injected write faults
#[derive(Default)]
struct Faults {
    /// Node writes left before the store turns unavailable
    writes_until_unavailable: Option<usize>,

    failing: HashSet<String>,

    conflicts: HashMap<String, usize>,
}

/// In-memory [`NodeStore`]
pub struct MemoryNodeStore {
    state: RwLock<State>,
    faults: Mutex<Faults>,

    /// Snapshot rewritten on run checkpoints
    autosave: Option<PathBuf>,

    /// Serializes snapshot writers
    save_lock: tokio::sync::Mutex<()>,
}

impl MemoryNodeStore {
    pub fn new() -> Self {
        Self::with_state(State::default())
    }

    pub fn from_snapshot(snapshot: StoreSnapshot) -> Result<Self, StoreError> {
        Ok(Self::with_state(State::from_snapshot(snapshot)?))
    }

    fn with_state(state: State) -> Self {
        Self {
            state: RwLock::new(state),
            faults: Mutex::new(Faults::default()),
            autosave: None,
            save_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Load from `path` and keep it up to date at every run checkpoint
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let mut store = Self::load(path)?;
        store.autosave = Some(path.to_path_buf());
        Ok(store)
    }

    pub fn autosave_path(&self) -> Option<&Path> {
        self.autosave.as_deref()
    }

    /// Load a store from a JSON snapshot, or start empty if the file is absent
    pub fn load(path: &Path) -> Result<Self, StoreError> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "No store snapshot, starting empty");
            return Ok(Self::new());
        }
        let contents = std::fs::read_to_string(path)?;
        let snapshot: StoreSnapshot = serde_json::from_str(&contents)?;
        tracing::debug!(
            path = %path.display(),
            nodes = snapshot.nodes.len(),
            runs = snapshot.runs.len(),
            "Loaded store snapshot"
        );
        Self::from_snapshot(snapshot)
    }

    /// Write the whole store to a JSON snapshot
    ///
    /// The file is replaced atomically, so a reader never sees a partial
    /// snapshot.
    pub async fn persist(&self, path: &Path) -> Result<(), StoreError> {
        let _guard = self.save_lock.lock().await;
        let snapshot = self.snapshot().await;
        let contents = serde_json::to_string_pretty(&snapshot)?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let staging = path.with_extension("json.tmp");
        std::fs::write(&staging, contents)?;
        std::fs::rename(&staging, path)?;
        Ok(())
    }

    /// Rewrite the autosave snapshot, if any
    ///
    /// A failed write is logged and left for the next checkpoint; the
    /// in-memory state stays authoritative.
    async fn checkpoint(&self) {
        let Some(path) = &self.autosave else {
            return;
        };
        if let Err(e) = self.persist(path).await {
            tracing::warn!(path = %path.display(), error = %e, "Could not write store snapshot");
        }
    }

    pub async fn snapshot(&self) -> StoreSnapshot {
        self.state.read().await.to_snapshot()
    }

    /// Total rows, current and historical
    pub async fn node_count(&self) -> usize {
        self.state.read().await.nodes.len()
    }

    pub async fn current_node_count(&self) -> usize {
        self.state.read().await.current.len()
    }

    /// Make node writes fail with [`StoreError::Unavailable`]
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock_faults().writes_until_unavailable = unavailable.then_some(0);
    }

    /// Allow `writes` more node writes, then behave as unavailable
    pub fn set_unavailable_after(&self, writes: usize) {
        self.lock_faults().writes_until_unavailable = Some(writes);
    }

    /// Fail every write to `qualified_name` with [`StoreError::Write`]
    pub fn fail_writes_for(&self, qualified_name: &str) {
        self.lock_faults().failing.insert(qualified_name.to_string());
    }

    /// Report a conflict on the next `times` upserts of `qualified_name`
    pub fn conflict_on(&self, qualified_name: &str, times: usize) {
        self.lock_faults().conflicts.insert(qualified_name.to_string(), times);
    }

    pub fn clear_faults(&self) {
        *self.lock_faults() = Faults::default();
    }

    fn lock_faults(&self) -> std::sync::MutexGuard<'_, Faults> {
        // A poisoned lock only means a test panicked while holding it
        self.faults.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_write(&self, node_type: NodeType, qualified_name: &str) -> Result<(), StoreError> {
        let mut faults = self.lock_faults();

        match faults.writes_until_unavailable {
            Some(0) => return Err(StoreError::Unavailable("memory store is offline".to_string())),
            Some(n) => faults.writes_until_unavailable = Some(n - 1),
            None => {}
        }

        if faults.failing.contains(qualified_name) {
            return Err(StoreError::Write {
                qualified_name: qualified_name.to_string(),
                message: "injected write fault".to_string(),
            });
        }

        if let Some(remaining) = faults.conflicts.get_mut(qualified_name) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(StoreError::Conflict { node_type, qualified_name: qualified_name.to_string() });
            }
        }

        Ok(())
    }
}

impl Default for MemoryNodeStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl NodeStore for MemoryNodeStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn start_run(&self, new_run: NewRun) -> Result<RunId, StoreError> {
        let run_id = {
            let mut state = self.state.write().await;
            state.next_run_id += 1;
            let run_id = state.next_run_id;
            state.runs.insert(run_id, CatalogRun::start(run_id, new_run));
            run_id
        };
        self.checkpoint().await;
        Ok(run_id)
    }

    async fn update_run_progress(&self, run_id: RunId, counters: &RunCounters) -> Result<(), StoreError> {
        {
            let mut state = self.state.write().await;
            let run = state.run_mut(run_id)?;
            if run.status.is_terminal() {
                return Err(StoreError::InvalidRunTransition { run_id, from: run.status, to: RunStatus::Running });
            }
            run.counters = *counters;
        }
        self.checkpoint().await;
        Ok(())
    }

    async fn complete_run(&self, run_id: RunId, counters: &RunCounters) -> Result<(), StoreError> {
        self.state.write().await.finish_run(run_id, RunStatus::Completed, counters, None)?;
        self.checkpoint().await;
        Ok(())
    }

    async fn fail_run(&self, run_id: RunId, counters: &RunCounters, error_message: &str) -> Result<(), StoreError> {
        self.state
            .write()
            .await
            .finish_run(run_id, RunStatus::Failed, counters, Some(error_message))?;
        self.checkpoint().await;
        Ok(())
    }

    async fn abort_run(&self, run_id: RunId, counters: &RunCounters, reason: &str) -> Result<(), StoreError> {
        self.state
            .write()
            .await
            .finish_run(run_id, RunStatus::Aborted, counters, Some(reason))?;
        self.checkpoint().await;
        Ok(())
    }

    async fn get_run(&self, run_id: RunId) -> Result<CatalogRun, StoreError> {
        self.state
            .read()
            .await
            .runs
            .get(&run_id)
            .cloned()
            .ok_or(StoreError::RunNotFound(run_id))
    }

    async fn list_runs(&self, limit: usize) -> Result<Vec<CatalogRun>, StoreError> {
        Ok(self.state.read().await.runs.values().rev().take(limit).cloned().collect())
    }

    async fn upsert_node(&self, draft: &NodeDraft, run_id: RunId) -> Result<UpsertOutcome, StoreError> {
        let node_type = draft.node_type();
        self.check_write(node_type, &draft.qualified_name)?;

        let mut state = self.state.write().await;
        let now = Utc::now();
        let key = (node_type, draft.qualified_name.clone());

        let current = state.current.get(&key).and_then(|id| state.nodes.get(id)).cloned();
        let decision = VersionDecision::evaluate(current.as_ref().map(|n| &n.detail.attributes), &draft.attributes);

        let description = match (&decision, &current) {
            (VersionDecision::Heartbeat, Some(node)) => {
                if let Some(row) = state.nodes.get_mut(&node.id) {
                    row.last_seen_run = run_id;
                    row.detail.parent = draft.parent.clone();
                }
                return Ok(UpsertOutcome { node: node.node_ref(), change: ChangeKind::Unchanged });
            }
            (VersionDecision::Supersede, Some(node)) => {
                if let Some(row) = state.nodes.get_mut(&node.id) {
                    row.is_current = false;
                    row.updated_at = now;
                }
                node.description.clone()
            }
            _ => None,
        };

        state.next_node_id += 1;
        let id = state.next_node_id;
        let node = Node {
            id,
            node_type,
            name: draft.name.clone(),
            qualified_name: draft.qualified_name.clone(),
            description,
            is_current: true,
            created_in_run: run_id,
            last_seen_run: run_id,
            deleted_in_run: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
            detail: NodeDetail {
                parent: draft.parent.clone(),
                attributes: draft.attributes.clone(),
                row_count_estimate: current.and_then(|n| n.detail.row_count_estimate),
            },
        };
        let node_ref = node.node_ref();
        state.nodes.insert(id, node);
        state.current.insert(key, id);

        Ok(UpsertOutcome { node: node_ref, change: decision.change_kind() })
    }

    async fn upsert_view_definition(
        &self,
        view: &NodeRef,
        sql_text: &str,
        content_hash: &str,
        run_id: RunId,
    ) -> Result<ChangeKind, StoreError> {
        self.check_write(view.node_type, &view.qualified_name)?;

        let mut state = self.state.write().await;
        let now = Utc::now();

        let current_id = state.current_definitions.get(&view.qualified_name).copied();
        let current_hash = current_id
            .and_then(|id| state.view_definitions.get(&id))
            .map(|d| d.content_hash.clone());
        let decision = VersionDecision::evaluate_hash(current_hash.as_deref(), content_hash);

        match (decision, current_id) {
            (VersionDecision::Heartbeat, Some(id)) => {
                if let Some(definition) = state.view_definitions.get_mut(&id) {
                    definition.last_seen_run = run_id;
                    definition.view_node_id = view.id;
                }
                return Ok(ChangeKind::Unchanged);
            }
            (VersionDecision::Supersede, Some(id)) => {
                if let Some(definition) = state.view_definitions.get_mut(&id) {
                    definition.is_current = false;
                }
            }
            _ => {}
        }

        state.next_definition_id += 1;
        let id = state.next_definition_id;
        state.view_definitions.insert(
            id,
            ViewDefinition {
                id,
                view_qualified_name: view.qualified_name.clone(),
                view_node_id: view.id,
                sql_text: sql_text.to_string(),
                content_hash: content_hash.to_string(),
                is_current: true,
                created_in_run: run_id,
                last_seen_run: run_id,
                deleted_in_run: None,
                created_at: now,
                deleted_at: None,
            },
        );
        state.current_definitions.insert(view.qualified_name.clone(), id);

        Ok(decision.change_kind())
    }

    async fn record_row_count(&self, node_id: NodeId, estimate: i64) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let node = state.nodes.get_mut(&node_id).ok_or_else(|| StoreError::Write {
            qualified_name: format!("node {}", node_id),
            message: "no such node".to_string(),
        })?;
        self.check_write(node.node_type, &node.qualified_name)?;
        node.detail.row_count_estimate = Some(estimate);
        Ok(())
    }

    async fn mark_missing_as_deleted(
        &self,
        parent: &NodeRef,
        child_types: &[NodeType],
        observed: &HashSet<NodeKey>,
        run_id: RunId,
    ) -> Result<Vec<NodeRef>, StoreError> {
        self.check_write(parent.node_type, &parent.qualified_name)?;

        let mut state = self.state.write().await;
        let now = Utc::now();

        let missing: Vec<NodeId> = state
            .current
            .values()
            .filter_map(|id| state.nodes.get(id))
            .filter(|n| child_types.contains(&n.node_type))
            .filter(|n| {
                n.detail
                    .parent
                    .as_ref()
                    .is_some_and(|p| p.node_type == parent.node_type && p.qualified_name == parent.qualified_name)
            })
            .filter(|n| n.last_seen_run != run_id)
            .filter(|n| !observed.contains(&(n.node_type, n.qualified_name.clone())))
            .map(|n| n.id)
            .collect();

        let mut deleted = Vec::with_capacity(missing.len());
        for id in missing {
            let Some(node) = state.nodes.get_mut(&id) else {
                continue;
            };
            node.is_current = false;
            node.deleted_in_run = Some(run_id);
            node.deleted_at = Some(now);
            node.updated_at = now;
            let node_ref = node.node_ref();

            state.current.remove(&(node_ref.node_type, node_ref.qualified_name.clone()));
            if node_ref.node_type == NodeType::View {
                state.close_view_definition(&node_ref.qualified_name, run_id);
            }
            deleted.push(node_ref);
        }

        deleted.sort_by(|a, b| a.qualified_name.cmp(&b.qualified_name));
        Ok(deleted)
    }

    async fn current_node(&self, node_type: NodeType, qualified_name: &str) -> Result<Option<Node>, StoreError> {
        Ok(self.state.read().await.current_node(node_type, qualified_name).cloned())
    }

    async fn node_history(&self, node_type: NodeType, qualified_name: &str) -> Result<Vec<Node>, StoreError> {
        Ok(self
            .state
            .read()
            .await
            .nodes
            .values()
            .filter(|n| n.node_type == node_type && n.qualified_name == qualified_name)
            .cloned()
            .collect())
    }

    async fn current_children(
        &self,
        parent_qualified_name: &str,
        child_types: &[NodeType],
    ) -> Result<Vec<Node>, StoreError> {
        let state = self.state.read().await;
        let mut children: Vec<Node> = state
            .current
            .values()
            .filter_map(|id| state.nodes.get(id))
            .filter(|n| child_types.contains(&n.node_type))
            .filter(|n| n.parent_qualified_name() == Some(parent_qualified_name))
            .cloned()
            .collect();
        children.sort_by(|a, b| a.qualified_name.cmp(&b.qualified_name));
        Ok(children)
    }

    async fn current_view_definition(&self, view_qualified_name: &str) -> Result<Option<ViewDefinition>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .current_definitions
            .get(view_qualified_name)
            .and_then(|id| state.view_definitions.get(id))
            .cloned())
    }

    async fn view_definition_history(&self, view_qualified_name: &str) -> Result<Vec<ViewDefinition>, StoreError> {
        Ok(self
            .state
            .read()
            .await
            .view_definitions
            .values()
            .filter(|d| d.view_qualified_name == view_qualified_name)
            .cloned()
            .collect())
    }
}
