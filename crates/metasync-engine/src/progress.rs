//! Run progress shared by concurrent schema workers

use std::sync::atomic::{AtomicU64, Ordering};

use metasync_core::{ChangeKind, EntityCounters, EntityKind, RunCounters};

#[derive(Default)]
struct AtomicEntityCounters {
    added: AtomicU64,
    updated: AtomicU64,
    deleted: AtomicU64,
    unchanged: AtomicU64,
}

impl AtomicEntityCounters {
    fn load(&self) -> EntityCounters {
        EntityCounters {
            added: self.added.load(Ordering::Relaxed),
            updated: self.updated.load(Ordering::Relaxed),
            deleted: self.deleted.load(Ordering::Relaxed),
            unchanged: self.unchanged.load(Ordering::Relaxed),
        }
    }
}

/// Lock-free counters for one run
///
/// Workers record into it concurrently; [`RunProgress::snapshot`] produces
/// the plain [`RunCounters`] value written to the store.
#[derive(Default)]
pub struct RunProgress {
    entities: [AtomicEntityCounters; 6],
    skipped: AtomicU64,
}

fn slot(kind: EntityKind) -> usize {
    match kind {
        EntityKind::Database => 0,
        EntityKind::Schema => 1,
        EntityKind::Table => 2,
        EntityKind::View => 3,
        EntityKind::Column => 4,
        EntityKind::ViewDefinition => 5,
    }
}

impl RunProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, kind: EntityKind, change: ChangeKind) {
        let counters = &self.entities[slot(kind)];
        let counter = match change {
            ChangeKind::Added => &counters.added,
            ChangeKind::Updated => &counters.updated,
            ChangeKind::Unchanged => &counters.unchanged,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_deleted(&self, kind: EntityKind, count: u64) {
        self.entities[slot(kind)].deleted.fetch_add(count, Ordering::Relaxed);
    }

    /// Count an object skipped because of an isolated fault
    pub fn record_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> RunCounters {
        let mut counters = RunCounters::default();
        for kind in EntityKind::ALL {
            *counters.get_mut(kind) = self.entities[slot(kind)].load();
        }
        counters.skipped = self.skipped.load(Ordering::Relaxed);
        counters
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn records_into_the_right_bucket() {
        let progress = RunProgress::new();
        progress.record(EntityKind::Column, ChangeKind::Added);
        progress.record(EntityKind::Column, ChangeKind::Added);
        progress.record(EntityKind::Table, ChangeKind::Unchanged);
        progress.record(EntityKind::ViewDefinition, ChangeKind::Updated);
        progress.record_deleted(EntityKind::Column, 3);
        progress.record_skipped();

        let counters = progress.snapshot();
        assert_eq!(counters.columns.added, 2);
        assert_eq!(counters.columns.deleted, 3);
        assert_eq!(counters.tables.unchanged, 1);
        assert_eq!(counters.view_definitions.updated, 1);
        assert_eq!(counters.skipped, 1);
        assert_eq!(counters.totals(), EntityCounters { added: 2, updated: 1, deleted: 3, unchanged: 1 });
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_workers_lose_no_updates() {
        let progress = Arc::new(RunProgress::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let progress = progress.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..1000 {
                    progress.record(EntityKind::Column, ChangeKind::Unchanged);
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(progress.snapshot().columns.unchanged, 8000);
    }
}
