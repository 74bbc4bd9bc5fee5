// =============================================================================
// Leaf Manager — dedup registry with refcounted lifecycles
// =============================================================================
//
// One leaf per distinct parameter fingerprint, no matter how many composites
// reference it. Each leaf gets a background task that serializes its updates;
// releasing the last reference aborts the task and drops the leaf.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::alert::leaf::{Leaf, LeafSpec};
use crate::alert::leaves::build_leaf;
use crate::store::MetricStore;

struct LeafEntry {
    leaf: Arc<dyn Leaf>,
    refcount: usize,
    task: JoinHandle<()>,
}

/// Registry keyed by leaf fingerprint.
pub struct LeafManager {
    store: Arc<MetricStore>,
    leaves: Mutex<HashMap<String, LeafEntry>>,
}

impl LeafManager {
    pub fn new(store: Arc<MetricStore>) -> Self {
        Self {
            store,
            leaves: Mutex::new(HashMap::new()),
        }
    }

    /// Return the leaf for `spec`, creating it (and its update task) on first
    /// reference. Every call must be paired with a later [`release`].
    ///
    /// [`release`]: LeafManager::release
    pub fn acquire(&self, spec: LeafSpec) -> Arc<dyn Leaf> {
        let fingerprint = spec.fingerprint();
        let mut leaves = self.leaves.lock();

        if let Some(entry) = leaves.get_mut(&fingerprint) {
            entry.refcount += 1;
            debug!(leaf = %fingerprint, refcount = entry.refcount, "leaf reference added");
            return entry.leaf.clone();
        }

        let leaf = build_leaf(spec);
        let task = {
            let leaf = leaf.clone();
            let store = self.store.clone();
            let fingerprint = fingerprint.clone();
            tokio::spawn(async move {
                let interval = leaf.poll_interval();
                loop {
                    // Errors are confined to this leaf's tick; the task lives on.
                    if let Err(e) = leaf.update(&store).await {
                        warn!(leaf = %fingerprint, error = %e, "leaf update failed");
                    }
                    tokio::time::sleep(interval).await;
                }
            })
        };

        info!(leaf = %fingerprint, spec = %leaf.spec().canonical(), "leaf created");
        leaves.insert(
            fingerprint,
            LeafEntry {
                leaf: leaf.clone(),
                refcount: 1,
                task,
            },
        );
        leaf
    }

    /// Drop one reference; the last one destroys the leaf and its task.
    pub fn release(&self, fingerprint: &str) {
        let mut leaves = self.leaves.lock();
        let Some(entry) = leaves.get_mut(fingerprint) else {
            warn!(leaf = %fingerprint, "release of unknown leaf ignored");
            return;
        };
        entry.refcount -= 1;
        if entry.refcount == 0 {
            let entry = leaves.remove(fingerprint).expect("entry exists");
            entry.task.abort();
            info!(leaf = %fingerprint, "leaf destroyed (no references left)");
        }
    }

    /// One synchronous update pass over every leaf. Used as the startup
    /// warm-up so the first composite tick never reads empty snapshots.
    pub async fn refresh_all(&self) {
        let snapshot: Vec<Arc<dyn Leaf>> = {
            let leaves = self.leaves.lock();
            leaves.values().map(|e| e.leaf.clone()).collect()
        };
        for leaf in snapshot {
            if let Err(e) = leaf.update(&self.store).await {
                warn!(leaf = %leaf.fingerprint(), error = %e, "leaf refresh failed");
            }
        }
    }

    pub fn len(&self) -> usize {
        self.leaves.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current refcount of a leaf (0 when absent).
    pub fn refcount(&self, fingerprint: &str) -> usize {
        self.leaves
            .lock()
            .get(fingerprint)
            .map(|e| e.refcount)
            .unwrap_or(0)
    }
}
