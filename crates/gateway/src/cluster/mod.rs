//! Cluster coordination: advisory-lock leader election, the node
//! directory, and cross-node task forwarding.

mod forward;
mod leader;
mod nodes;

pub use forward::forward_frame;
pub use leader::LeaderElection;
pub use nodes::{ClusterNode, MemoryNodeDirectory, NodeDirectory, PgNodeDirectory};

use std::sync::Arc;
use std::time::Duration;

use aegis_domain::config::ClusterConfig;
use aegis_domain::{Error, Result};
use aegis_protocol::ClientFrame;

/// The cluster face the task router sees.
pub struct ClusterCoordinator {
    config: ClusterConfig,
    leader: Option<Arc<LeaderElection>>,
    directory: Arc<dyn NodeDirectory>,
    /// Internal auth token used when dialing peer nodes.
    internal_token: Option<String>,
}

impl ClusterCoordinator {
    pub fn new(
        config: ClusterConfig,
        leader: Option<Arc<LeaderElection>>,
        directory: Arc<dyn NodeDirectory>,
        internal_token: Option<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            leader,
            directory,
            internal_token,
        })
    }

    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    pub fn is_leader(&self) -> bool {
        // Single-node deployments are always their own leader.
        self.leader.as_ref().map(|l| l.is_leader()).unwrap_or(true)
    }

    pub fn directory(&self) -> &Arc<dyn NodeDirectory> {
        &self.directory
    }

    /// Record this node as alive (heartbeat job).
    pub async fn heartbeat(&self) -> Result<()> {
        self.directory
            .upsert(ClusterNode {
                node_id: self.config.node_id.clone(),
                ws_url: self.config.ws_url.clone(),
                last_seen_at: chrono::Utc::now(),
            })
            .await
    }

    /// Forward a task frame to the node hosting `node_id`'s agents and
    /// await the correlated response.
    pub async fn forward(&self, node_id: &str, frame: ClientFrame) -> Result<ClientFrame> {
        let node = self
            .directory
            .get(node_id)
            .await?
            .ok_or_else(|| Error::Cluster(format!("unknown node '{node_id}'")))?;
        let token = self
            .internal_token
            .as_deref()
            .ok_or_else(|| Error::Cluster("INTERNAL_AUTH_TOKEN not configured".into()))?;
        forward_frame(
            &node.ws_url,
            token,
            frame,
            Duration::from_millis(self.config.forward_timeout_ms),
        )
        .await
    }
}
