//! Metasync engine - catalog synchronization
//!
//! This crate implements the temporal sync of a source server into a node
//! store:
//! - Temporal diff: identity resolution and add / update / unchanged versioning
//! - Deletion passes scoped to one parent at a time
//! - Run coordination: lifecycle, bounded schema workers, cancellation

pub mod coordinator;
pub mod deletion;
pub mod diff;
pub mod error;
pub mod progress;

pub use coordinator::{RunCoordinator, RunReport, RunRequest};
pub use deletion::DeletionPass;
pub use diff::TemporalDiff;
pub use error::SyncError;
pub use progress::RunProgress;
