//! Node directory: who we are and whom we talk to.

use nodesync_protocol::{CommunicationType, Node};
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// Resolves node identity and the communication targets of the local node.
pub trait NodeDirectory: Send + Sync {
    /// The local node.
    fn local_node(&self) -> Node;

    /// Looks up a node by id.
    fn find_node(&self, node_id: &str) -> Option<Node>;

    /// Nodes the local node communicates with for `kind`.
    fn targets(&self, kind: CommunicationType) -> Vec<Node>;

    /// Channels synchronized between nodes.
    fn channels(&self) -> Vec<String>;
}

/// A directory configured in code.
pub struct StaticNodeDirectory {
    local: Node,
    inner: RwLock<DirectoryInner>,
}

#[derive(Default)]
struct DirectoryInner {
    nodes: BTreeMap<String, Node>,
    push_targets: Vec<String>,
    pull_sources: Vec<String>,
    channels: Vec<String>,
}

impl StaticNodeDirectory {
    /// Creates a directory with the `default` channel.
    pub fn new(local: Node) -> Self {
        Self {
            local,
            inner: RwLock::new(DirectoryInner {
                channels: vec!["default".to_string()],
                ..DirectoryInner::default()
            }),
        }
    }

    /// Replaces the channel list.
    pub fn with_channels<I, S>(self, channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inner.write().channels = channels.into_iter().map(Into::into).collect();
        self
    }

    /// Registers a node the local node pushes to.
    pub fn with_push_target(self, node: Node) -> Self {
        self.add_push_target(node);
        self
    }

    /// Registers a node the local node pulls from.
    pub fn with_pull_source(self, node: Node) -> Self {
        self.add_pull_source(node);
        self
    }

    /// Registers a node without a communication role.
    pub fn with_node(self, node: Node) -> Self {
        self.inner.write().nodes.insert(node.node_id.clone(), node);
        self
    }

    /// Adds a push target at runtime.
    pub fn add_push_target(&self, node: Node) {
        let mut inner = self.inner.write();
        if !inner.push_targets.contains(&node.node_id) {
            inner.push_targets.push(node.node_id.clone());
        }
        inner.nodes.insert(node.node_id.clone(), node);
    }

    /// Adds a pull source at runtime.
    pub fn add_pull_source(&self, node: Node) {
        let mut inner = self.inner.write();
        if !inner.pull_sources.contains(&node.node_id) {
            inner.pull_sources.push(node.node_id.clone());
        }
        inner.nodes.insert(node.node_id.clone(), node);
    }

    /// Forgets a node entirely.
    pub fn remove_node(&self, node_id: &str) -> bool {
        let mut inner = self.inner.write();
        inner.push_targets.retain(|id| id != node_id);
        inner.pull_sources.retain(|id| id != node_id);
        inner.nodes.remove(node_id).is_some()
    }

    /// Enables or disables synchronization with a node.
    pub fn set_sync_enabled(&self, node_id: &str, enabled: bool) -> bool {
        match self.inner.write().nodes.get_mut(node_id) {
            Some(node) => {
                node.sync_enabled = enabled;
                true
            }
            None => false,
        }
    }
}

impl NodeDirectory for StaticNodeDirectory {
    fn local_node(&self) -> Node {
        self.local.clone()
    }

    fn find_node(&self, node_id: &str) -> Option<Node> {
        if node_id == self.local.node_id {
            return Some(self.local.clone());
        }
        self.inner.read().nodes.get(node_id).cloned()
    }

    fn targets(&self, kind: CommunicationType) -> Vec<Node> {
        let inner = self.inner.read();
        let ids: Vec<&String> = match kind {
            CommunicationType::Push => inner.push_targets.iter().collect(),
            CommunicationType::Pull => inner.pull_sources.iter().collect(),
            CommunicationType::Extract => inner.nodes.keys().collect(),
        };
        ids.into_iter()
            .filter_map(|id| inner.nodes.get(id))
            .filter(|node| node.sync_enabled)
            .cloned()
            .collect()
    }

    fn channels(&self) -> Vec<String> {
        self.inner.read().channels.clone()
    }
}
