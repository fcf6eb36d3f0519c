//! Node identity.

use serde::{Deserialize, Serialize};

/// A participating database endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Node id.
    pub node_id: String,
    /// Node group.
    pub group_id: String,
    /// Where the node accepts sync requests.
    pub sync_url: String,
    /// Credential presented when talking to this node.
    pub security_token: Vec<u8>,
    /// Whether the node takes part in sync.
    pub sync_enabled: bool,
}

impl Node {
    /// Creates an enabled node with no credential.
    pub fn new(node_id: impl Into<String>, group_id: impl Into<String>) -> Self {
        let node_id = node_id.into();
        Self {
            sync_url: format!("loopback://{}", node_id),
            node_id,
            group_id: group_id.into(),
            security_token: Vec::new(),
            sync_enabled: true,
        }
    }

    /// Sets the sync url.
    pub fn with_sync_url(mut self, url: impl Into<String>) -> Self {
        self.sync_url = url.into();
        self
    }

    /// Sets the credential.
    pub fn with_security_token(mut self, token: Vec<u8>) -> Self {
        self.security_token = token;
        self
    }

    /// Enables or disables sync.
    pub fn with_sync_enabled(mut self, enabled: bool) -> Self {
        self.sync_enabled = enabled;
        self
    }
}
