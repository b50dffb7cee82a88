//! Partition ownership as seen by this node
//!
//! The coordination service that decides ownership lives outside the runtime.
//! It publishes complete snapshots into an [`AssignmentView`]; readers always
//! see one whole snapshot, never a half-applied update.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// One partition's owner
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClusterNode {
    /// Partition owned by the node
    pub partition_id: u32,
    /// Host name or IP
    pub host: String,
    /// TCP port of the node's listener
    pub port: u16,
}

impl ClusterNode {
    /// Create a node entry
    pub fn new(partition_id: u32, host: impl Into<String>, port: u16) -> Self {
        Self {
            partition_id,
            host: host.into(),
            port,
        }
    }

    /// `host:port` of the node's listener
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for ClusterNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "partition {} @ {}:{}", self.partition_id, self.host, self.port)
    }
}

/// Immutable partition → node table
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssignmentSnapshot {
    version: u64,
    nodes: BTreeMap<u32, ClusterNode>,
}

impl AssignmentSnapshot {
    /// Build a snapshot; a later entry for the same partition wins
    pub fn new(version: u64, nodes: impl IntoIterator<Item = ClusterNode>) -> Self {
        Self {
            version,
            nodes: nodes
                .into_iter()
                .map(|node| (node.partition_id, node))
                .collect(),
        }
    }

    /// Version stamped by the coordination service
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Owner of a partition
    pub fn node_for(&self, partition: u32) -> Option<&ClusterNode> {
        self.nodes.get(&partition)
    }

    /// Partitions whose owner listens on `host:port`
    pub fn partitions_at(&self, host: &str, port: u16) -> Vec<u32> {
        self.nodes
            .values()
            .filter(|node| node.host == host && node.port == port)
            .map(|node| node.partition_id)
            .collect()
    }

    /// All entries ordered by partition
    pub fn nodes(&self) -> impl Iterator<Item = &ClusterNode> {
        self.nodes.values()
    }

    /// Number of assigned partitions
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether no partition is assigned
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Callback invoked with each newly published snapshot
pub type AssignmentListener = Box<dyn Fn(&AssignmentSnapshot) + Send + Sync>;

/// Read-only query interface consumed by the transport
pub trait Assignment: Send + Sync {
    /// Node currently owning `partition`
    fn current_node_for(&self, partition: u32) -> Option<ClusterNode>;

    /// Register a change-notification callback
    fn subscribe(&self, listener: AssignmentListener);
}

/// Snapshot holder refreshed wholesale by the coordination service
#[derive(Default)]
pub struct AssignmentView {
    current: RwLock<Arc<AssignmentSnapshot>>,
    listeners: Mutex<Vec<AssignmentListener>>,
}

impl AssignmentView {
    /// Create a view starting from `snapshot`
    pub fn new(snapshot: AssignmentSnapshot) -> Self {
        Self {
            current: RwLock::new(Arc::new(snapshot)),
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Create a view from a static node list at version 0
    pub fn from_nodes(nodes: impl IntoIterator<Item = ClusterNode>) -> Self {
        Self::new(AssignmentSnapshot::new(0, nodes))
    }

    /// Current snapshot
    pub fn snapshot(&self) -> Arc<AssignmentSnapshot> {
        Arc::clone(&self.current.read())
    }

    /// Publish a new snapshot and notify subscribers.
    ///
    /// Snapshots older than the current one are ignored.
    pub fn replace(&self, snapshot: AssignmentSnapshot) -> bool {
        let published = {
            let mut current = self.current.write();
            if snapshot.version < current.version {
                debug!(
                    current = current.version,
                    offered = snapshot.version,
                    "ignoring stale assignment snapshot"
                );
                return false;
            }
            let published = Arc::new(snapshot);
            *current = Arc::clone(&published);
            published
        };

        info!(
            version = published.version,
            partitions = published.len(),
            "assignment updated"
        );
        for listener in self.listeners.lock().iter() {
            listener(&published);
        }
        true
    }
}

impl Assignment for AssignmentView {
    fn current_node_for(&self, partition: u32) -> Option<ClusterNode> {
        self.current.read().node_for(partition).cloned()
    }

    fn subscribe(&self, listener: AssignmentListener) {
        self.listeners.lock().push(listener);
    }
}

impl fmt::Debug for AssignmentView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AssignmentView")
            .field("current", &*self.current.read())
            .field("listeners", &self.listeners.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn two_nodes() -> Vec<ClusterNode> {
        vec![
            ClusterNode::new(0, "10.0.0.1", 7000),
            ClusterNode::new(1, "10.0.0.2", 7000),
            ClusterNode::new(2, "10.0.0.1", 7000),
        ]
    }

    #[test]
    fn test_lookup_and_local_partitions() {
        let view = AssignmentView::from_nodes(two_nodes());
        assert_eq!(
            view.current_node_for(1).unwrap().address(),
            "10.0.0.2:7000"
        );
        assert!(view.current_node_for(9).is_none());
        assert_eq!(view.snapshot().partitions_at("10.0.0.1", 7000), vec![0, 2]);
    }

    #[test]
    fn test_replace_is_wholesale_and_notifies() {
        let view = AssignmentView::from_nodes(two_nodes());
        let seen = Arc::new(AtomicU64::new(0));
        let seen_clone = Arc::clone(&seen);
        view.subscribe(Box::new(move |snapshot| {
            seen_clone.store(snapshot.version(), Ordering::SeqCst);
        }));

        let before = view.snapshot();
        assert!(view.replace(AssignmentSnapshot::new(
            5,
            vec![ClusterNode::new(0, "10.0.0.3", 7001)]
        )));

        // Readers holding the old snapshot keep a consistent table.
        assert_eq!(before.len(), 3);
        assert_eq!(view.snapshot().len(), 1);
        assert!(view.current_node_for(1).is_none());
        assert_eq!(seen.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_stale_snapshot_ignored() {
        let view = AssignmentView::new(AssignmentSnapshot::new(3, two_nodes()));
        assert!(!view.replace(AssignmentSnapshot::new(2, Vec::new())));
        assert_eq!(view.snapshot().version(), 3);
    }
}
