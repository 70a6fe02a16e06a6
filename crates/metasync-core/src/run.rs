//! Catalog runs, their lifecycle and counters

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::node::NodeType;
use crate::scope::ScopeDescriptor;

/// Catalog-assigned run identifier
pub type RunId = i64;

/// Run state machine: `running -> completed | failed | aborted`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Aborted,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }

    /// Only `running` may move, and only to a terminal state
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        *self == RunStatus::Running && next.is_terminal()
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "aborted" => Ok(Self::Aborted),
            other => Err(format!("unknown run status '{}'", other)),
        }
    }
}

/// Counter bucket kinds tracked per run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Database,
    Schema,
    Table,
    View,
    Column,
    ViewDefinition,
}

impl EntityKind {
    pub const ALL: [EntityKind; 6] = [
        EntityKind::Database,
        EntityKind::Schema,
        EntityKind::Table,
        EntityKind::View,
        EntityKind::Column,
        EntityKind::ViewDefinition,
    ];

    /// Counter bucket for a node type; servers are not counted
    pub fn for_node_type(node_type: NodeType) -> Option<Self> {
        match node_type {
            NodeType::Server => None,
            NodeType::Database => Some(Self::Database),
            NodeType::Schema => Some(Self::Schema),
            NodeType::Table => Some(Self::Table),
            NodeType::View => Some(Self::View),
            NodeType::Column => Some(Self::Column),
        }
    }
}

/// add / update / delete / unchanged counts for one entity type
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityCounters {
    pub added: u64,
    pub updated: u64,
    pub deleted: u64,
    pub unchanged: u64,
}

impl EntityCounters {
    fn merge(&mut self, other: &EntityCounters) {
        self.added += other.added;
        self.updated += other.updated;
        self.deleted += other.deleted;
        self.unchanged += other.unchanged;
    }
}

impl fmt::Display for EntityCounters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "+{} ~{} -{} ={}",
            self.added, self.updated, self.deleted, self.unchanged
        )
    }
}

/// Per-entity-type progress of a run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounters {
    pub databases: EntityCounters,
    pub schemas: EntityCounters,
    pub tables: EntityCounters,
    pub views: EntityCounters,
    pub columns: EntityCounters,
    pub view_definitions: EntityCounters,

    /// Objects skipped because of an isolated fault
    #[serde(default)]
    pub skipped: u64,
}

impl RunCounters {
    pub fn get(&self, kind: EntityKind) -> &EntityCounters {
        match kind {
            EntityKind::Database => &self.databases,
            EntityKind::Schema => &self.schemas,
            EntityKind::Table => &self.tables,
            EntityKind::View => &self.views,
            EntityKind::Column => &self.columns,
            EntityKind::ViewDefinition => &self.view_definitions,
        }
    }

    pub fn get_mut(&mut self, kind: EntityKind) -> &mut EntityCounters {
        match kind {
            EntityKind::Database => &mut self.databases,
            EntityKind::Schema => &mut self.schemas,
            EntityKind::Table => &mut self.tables,
            EntityKind::View => &mut self.views,
            EntityKind::Column => &mut self.columns,
            EntityKind::ViewDefinition => &mut self.view_definitions,
        }
    }

    /// Sum over every entity type
    pub fn totals(&self) -> EntityCounters {
        let mut total = EntityCounters::default();
        for kind in EntityKind::ALL {
            total.merge(self.get(kind));
        }
        total
    }
}

/// Parameters recorded when a run starts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewRun {
    /// Name of the connection descriptor the run crawls
    pub connection: String,

    pub scope: ScopeDescriptor,

    /// Where the run's log output is persisted, if anywhere
    pub log_reference: Option<String>,
}

/// One synchronization execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogRun {
    pub id: RunId,
    pub connection: String,
    pub scope: ScopeDescriptor,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub counters: RunCounters,
    pub error_message: Option<String>,
    pub log_reference: Option<String>,
}

impl CatalogRun {
    pub fn start(id: RunId, new_run: NewRun) -> Self {
        Self {
            id,
            connection: new_run.connection,
            scope: new_run.scope,
            status: RunStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            counters: RunCounters::default(),
            error_message: None,
            log_reference: new_run.log_reference,
        }
    }
}
