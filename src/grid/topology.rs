//! Ownership topology and the transport seam between nodes, plus an
//! in-process cluster harness that wires several nodes through a local
//! transport.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::grid::backup::BackupCommand;
use crate::grid::command::{Command, CommandResult};
use crate::grid::encoding::GridValue;
use crate::grid::entry::Notifier;
use crate::grid::node::GridNode;
use crate::utils::GridError;

use async_trait::async_trait;

/// Node identifier within a cluster.
pub type NodeId = u8;

/// Maps keys to their owner list under the current topology. The first
/// owner is the primary; the rest are backups.
pub trait TopologyOracle: Send + Sync {
    fn owners_of(&self, key: &GridValue) -> Vec<NodeId>;

    fn current_topology_id(&self) -> u64;
}

/// Fixed-membership topology: owners are picked by key hash, rotating
/// through the member list. The topology id can be bumped to simulate a
/// rebalance.
pub struct StaticTopology {
    id: AtomicU64,
    nodes: Vec<NodeId>,
    replication: usize,
}

impl StaticTopology {
    pub fn new(
        nodes: Vec<NodeId>,
        replication: usize,
    ) -> Result<Self, GridError> {
        if nodes.is_empty() {
            return Err(GridError::msg("topology needs at least one node"));
        }
        if replication == 0 || replication > nodes.len() {
            return Err(GridError::Msg(format!(
                "invalid replication degree {} for {} nodes",
                replication,
                nodes.len()
            )));
        }
        Ok(StaticTopology {
            id: AtomicU64::new(1),
            nodes,
            replication,
        })
    }

    /// Advance the topology id, invalidating commands stamped before.
    pub fn bump(&self) -> u64 {
        self.id.fetch_add(1, Ordering::AcqRel) + 1
    }
}

impl TopologyOracle for StaticTopology {
    fn owners_of(&self, key: &GridValue) -> Vec<NodeId> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let start = (hasher.finish() as usize) % self.nodes.len();
        (0..self.replication)
            .map(|i| self.nodes[(start + i) % self.nodes.len()])
            .collect()
    }

    fn current_topology_id(&self) -> u64 {
        self.id.load(Ordering::Acquire)
    }
}

/// A command crossing the node boundary.
pub enum RemoteCommand {
    /// A client write forwarded to the key's primary owner.
    Invoke(Command),
    /// A sequenced backup write from a primary to a backup owner.
    Backup(BackupCommand),
}

/// Reply to a `RemoteCommand`.
pub enum RemoteResponse {
    Result(CommandResult),
    None,
}

/// Node-to-node messaging seam.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(
        &self,
        to: NodeId,
        cmd: RemoteCommand,
    ) -> Result<RemoteResponse, GridError>;
}

/// In-process transport: delivers directly into the target node's receive
/// path. Used by the local cluster harness and tests.
#[derive(Default)]
pub struct LocalTransport {
    nodes: Mutex<HashMap<NodeId, Arc<GridNode>>>,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, node: Arc<GridNode>) {
        self.nodes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(node.id, node);
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn send(
        &self,
        to: NodeId,
        cmd: RemoteCommand,
    ) -> Result<RemoteResponse, GridError> {
        let node = {
            let nodes =
                self.nodes.lock().unwrap_or_else(PoisonError::into_inner);
            nodes.get(&to).cloned()
        };
        match node {
            Some(node) => node.on_receive(cmd).await,
            None => Err(GridError::Msg(format!(
                "no route to node {}",
                to
            ))),
        }
    }
}

/// A set of nodes sharing one static topology and one local transport.
/// The notification sink is cluster-wide so each logical event is observed
/// once, from wherever the primary applied it.
pub struct LocalCluster {
    nodes: Vec<Arc<GridNode>>,
    topology: Arc<StaticTopology>,
    notifier: Arc<Notifier>,
}

impl LocalCluster {
    pub fn new(
        population: u8,
        replication: usize,
        config_str: Option<&str>,
    ) -> Result<Self, GridError> {
        let topology = Arc::new(StaticTopology::new(
            (0..population).collect(),
            replication,
        )?);
        let notifier = Arc::new(Notifier::new());
        let transport = Arc::new(LocalTransport::new());

        let mut nodes = Vec::new();
        for id in 0..population {
            let node = GridNode::new(
                id,
                topology.clone(),
                notifier.clone(),
                config_str,
            )?;
            node.set_transport(transport.clone())?;
            transport.register(node.clone());
            nodes.push(node);
        }
        Ok(LocalCluster {
            nodes,
            topology,
            notifier,
        })
    }

    pub fn node(&self, id: NodeId) -> Arc<GridNode> {
        self.nodes[id as usize].clone()
    }

    pub fn topology(&self) -> Arc<StaticTopology> {
        self.topology.clone()
    }

    pub fn notifier(&self) -> Arc<Notifier> {
        self.notifier.clone()
    }

    /// Primary owner of a storage-form key.
    pub fn primary_of(&self, key: &GridValue) -> Result<NodeId, GridError> {
        self.topology
            .owners_of(key)
            .first()
            .copied()
            .ok_or_else(|| GridError::msg("no owners under current topology"))
    }
}

#[cfg(test)]
mod topology_tests {
    use super::*;

    #[test]
    fn owners_are_stable_and_distinct() -> Result<(), GridError> {
        let topo = StaticTopology::new(vec![0, 1, 2], 2)?;
        let key = GridValue::text("some-key");
        let owners = topo.owners_of(&key);
        assert_eq!(owners.len(), 2);
        assert_ne!(owners[0], owners[1]);
        assert_eq!(owners, topo.owners_of(&key));
        Ok(())
    }

    #[test]
    fn bump_advances_topology_id() -> Result<(), GridError> {
        let topo = StaticTopology::new(vec![0], 1)?;
        assert_eq!(topo.current_topology_id(), 1);
        assert_eq!(topo.bump(), 2);
        assert_eq!(topo.current_topology_id(), 2);
        Ok(())
    }

    #[test]
    fn degenerate_topologies_are_rejected() {
        assert!(StaticTopology::new(vec![], 1).is_err());
        assert!(StaticTopology::new(vec![0, 1], 3).is_err());
    }
}
