//! Catalog nodes, detail records and version decisions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::run::RunId;

/// Catalog-assigned node identifier (one per version row)
pub type NodeId = i64;

/// Kind of catalogued entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NodeType {
    Server,
    Database,
    Schema,
    Table,
    View,
    Column,
}

impl NodeType {
    /// All node types, parents before children
    pub const ALL: [NodeType; 6] = [
        NodeType::Server,
        NodeType::Database,
        NodeType::Schema,
        NodeType::Table,
        NodeType::View,
        NodeType::Column,
    ];

    /// Stable persisted name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Server => "SERVER",
            Self::Database => "DATABASE",
            Self::Schema => "SCHEMA",
            Self::Table => "TABLE",
            Self::View => "VIEW",
            Self::Column => "COLUMN",
        }
    }

    /// Node types that live directly under a node of this type
    pub fn child_types(&self) -> &'static [NodeType] {
        match self {
            Self::Server => &[NodeType::Database],
            Self::Database => &[NodeType::Schema],
            Self::Schema => &[NodeType::Table, NodeType::View],
            Self::Table | Self::View => &[NodeType::Column],
            Self::Column => &[],
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "SERVER" => Ok(Self::Server),
            "DATABASE" => Ok(Self::Database),
            "SCHEMA" => Ok(Self::Schema),
            "TABLE" => Ok(Self::Table),
            "VIEW" => Ok(Self::View),
            "COLUMN" => Ok(Self::Column),
            other => Err(format!("unknown node type '{}'", other)),
        }
    }
}

/// Lightweight handle to one node version
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeRef {
    pub id: NodeId,
    pub node_type: NodeType,
    pub qualified_name: String,
}

impl NodeRef {
    pub fn key(&self) -> NodeKey {
        (self.node_type, self.qualified_name.clone())
    }
}

/// Identity of an entity across versions: qualified names are unique per type
pub type NodeKey = (NodeType, String);

/// Type-specific attributes carried by the detail record
///
/// Every field listed here is a tracked field: a difference in any of them
/// produces a new node version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeAttributes {
    Server { host: String, engine: String },
    Database,
    Schema,
    Table { table_type: String },
    View { table_type: String },
    Column { data_type: String, is_nullable: bool, ordinal_position: i32 },
}

impl NodeAttributes {
    /// The node type these attributes belong to
    pub fn node_type(&self) -> NodeType {
        match self {
            Self::Server { .. } => NodeType::Server,
            Self::Database => NodeType::Database,
            Self::Schema => NodeType::Schema,
            Self::Table { .. } => NodeType::Table,
            Self::View { .. } => NodeType::View,
            Self::Column { .. } => NodeType::Column,
        }
    }

    /// Compare tracked fields against the attributes of the current version
    pub fn has_changed_from(&self, previous: &NodeAttributes) -> bool {
        match (self, previous) {
            (
                Self::Server { host, engine },
                Self::Server { host: prev_host, engine: prev_engine },
            ) => host != prev_host || engine != prev_engine,
            (Self::Database, Self::Database) => false,
            (Self::Schema, Self::Schema) => false,
            (Self::Table { table_type }, Self::Table { table_type: prev })
            | (Self::View { table_type }, Self::View { table_type: prev }) => table_type != prev,
            (
                Self::Column { data_type, is_nullable, ordinal_position },
                Self::Column {
                    data_type: prev_type,
                    is_nullable: prev_nullable,
                    ordinal_position: prev_position,
                },
            ) => data_type != prev_type || is_nullable != prev_nullable || ordinal_position != prev_position,
            _ => true,
        }
    }
}

/// 1:1 extension of a node version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDetail {
    /// Parent version this node was last seen under (None for servers)
    pub parent: Option<NodeRef>,

    pub attributes: NodeAttributes,

    /// Best-effort statistic, never versioned
    #[serde(default)]
    pub row_count_estimate: Option<i64>,
}

/// One version row of a catalogued entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub node_type: NodeType,
    pub name: String,
    pub qualified_name: String,

    /// Owned by the description-enrichment subsystem
    pub description: Option<String>,

    pub is_current: bool,
    pub created_in_run: RunId,
    pub last_seen_run: RunId,
    pub deleted_in_run: Option<RunId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub detail: NodeDetail,
}

impl Node {
    pub fn node_ref(&self) -> NodeRef {
        NodeRef {
            id: self.id,
            node_type: self.node_type,
            qualified_name: self.qualified_name.clone(),
        }
    }

    /// Qualified name of the parent scope, if any
    pub fn parent_qualified_name(&self) -> Option<&str> {
        self.detail.parent.as_ref().map(|p| p.qualified_name.as_str())
    }
}

/// An observed entity, ready to be reconciled against the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeDraft {
    pub name: String,
    pub qualified_name: String,
    pub parent: Option<NodeRef>,
    pub attributes: NodeAttributes,
}

impl NodeDraft {
    pub fn new(
        name: impl Into<String>,
        qualified_name: impl Into<String>,
        parent: Option<NodeRef>,
        attributes: NodeAttributes,
    ) -> Self {
        Self {
            name: name.into(),
            qualified_name: qualified_name.into(),
            parent,
            attributes,
        }
    }

    pub fn node_type(&self) -> NodeType {
        self.attributes.node_type()
    }
}

/// What reconciling one observation did to the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Added,
    Updated,
    Unchanged,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Added => write!(f, "added"),
            Self::Updated => write!(f, "updated"),
            Self::Unchanged => write!(f, "unchanged"),
        }
    }
}

/// Result of `NodeStore::upsert_node`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpsertOutcome {
    /// The version that is current after the upsert
    pub node: NodeRef,
    pub change: ChangeKind,
}

impl UpsertOutcome {
    pub fn created(&self) -> bool {
        self.change == ChangeKind::Added
    }

    pub fn changed(&self) -> bool {
        self.change == ChangeKind::Updated
    }
}

/// Add / update / unchanged rule applied to every observation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionDecision {
    /// No current row: insert a new identity
    Insert,

    /// Current row matches: bump `last_seen_run` only
    Heartbeat,

    /// Current row differs: close it and insert a new version
    Supersede,
}

impl VersionDecision {
    pub fn evaluate(current: Option<&NodeAttributes>, observed: &NodeAttributes) -> Self {
        match current {
            None => Self::Insert,
            Some(previous) if observed.has_changed_from(previous) => Self::Supersede,
            Some(_) => Self::Heartbeat,
        }
    }

    pub fn change_kind(&self) -> ChangeKind {
        match self {
            Self::Insert => ChangeKind::Added,
            Self::Heartbeat => ChangeKind::Unchanged,
            Self::Supersede => ChangeKind::Updated,
        }
    }

    /// Same rule for content-hashed values such as view definitions
    pub fn evaluate_hash(current_hash: Option<&str>, observed_hash: &str) -> Self {
        match current_hash {
            None => Self::Insert,
            Some(hash) if hash != observed_hash => Self::Supersede,
            Some(_) => Self::Heartbeat,
        }
    }
}

/// Versioned snapshot of a view's SQL text
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewDefinition {
    pub id: i64,
    pub view_qualified_name: String,
    pub view_node_id: NodeId,
    pub sql_text: String,

    /// Hex SHA-256 of `sql_text`
    pub content_hash: String,

    pub is_current: bool,
    pub created_in_run: RunId,
    pub last_seen_run: RunId,
    pub deleted_in_run: Option<RunId>,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}
