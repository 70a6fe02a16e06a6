//! Metasync Core
//!
//! Domain model shared by every metasync crate: catalog nodes and their
//! versioned detail records, catalog runs and their counters, scope
//! descriptors, name patterns and the TOML configuration.
//!
//! Node type names and run status names are persisted by the stores.
//! Never rename them.

pub mod config;
pub mod hash;
pub mod node;
pub mod pattern;
pub mod qualified;
pub mod run;
pub mod scope;

pub use config::{Config, ConfigError, ConnectionConfig, EngineKind, PolicyConfig, StoreConfig, StoreKind};
pub use hash::content_hash;
pub use node::{
    ChangeKind, Node, NodeAttributes, NodeDetail, NodeDraft, NodeId, NodeKey, NodeRef, NodeType, UpsertOutcome,
    VersionDecision, ViewDefinition,
};
pub use pattern::{matches, PatternList};
pub use run::{CatalogRun, EntityCounters, EntityKind, NewRun, RunCounters, RunId, RunStatus};
pub use scope::{CompiledScope, ScopeDescriptor};
