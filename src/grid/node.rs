//! One grid node: configuration, the data container, the per-key lock
//! table, and the write invocation pipeline (ownership routing, locking,
//! perform/commit, backup fan-out, and the backup apply path).

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;

use tokio::sync::Mutex as AsyncMutex;

use crate::grid::backup::{
    Backlog, BackupCommand, BackupOp, BackupSequencer,
};
use crate::grid::command::{
    Command, CommandFlags, CommandResult, FnRegistry, InvocationCtx,
    WriteOp,
};
use crate::grid::encoding::{EntryCodec, GridValue};
use crate::grid::entry::{DataContainer, EntryView, Notifier};
use crate::grid::locking::LockTable;
use crate::grid::topology::{
    LocalTransport, NodeId, RemoteCommand, RemoteResponse, StaticTopology,
    TopologyOracle, Transport,
};
use crate::utils::GridError;

/// Configuration parameters of a grid node.
#[derive(Debug, Clone)]
pub struct GridConfig {
    /// Transaction isolation level: "repeatable_read" or "read_committed".
    pub isolation_level: String,

    /// Whether transactions validate read versions at commit time.
    pub write_skew_check: bool,

    /// Cache mode: "local" or "repl".
    pub cache_mode: String,

    /// Whether backup writes are awaited before the write returns.
    pub sync_backups: bool,

    /// Per-key lock acquisition timeout in millisecs.
    pub lock_timeout_ms: u64,

    /// How many times a write is retried after a topology mismatch.
    pub stale_retries: u32,

    /// Whether previous-value returns may be skipped for speed.
    pub unreliable_return_values: bool,
}

#[allow(clippy::derivable_impls)]
impl Default for GridConfig {
    fn default() -> Self {
        GridConfig {
            isolation_level: "repeatable_read".into(),
            write_skew_check: true,
            cache_mode: "local".into(),
            sync_backups: false,
            lock_timeout_ms: 10_000,
            stale_retries: 3,
            unreliable_return_values: false,
        }
    }
}

impl GridConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    /// Whether transactional reads record entry versions for commit-time
    /// validation. Version recording only pays off when this node is the
    /// sole authority for its entries and the caller sees real return
    /// values.
    pub fn mark_reads(&self) -> bool {
        self.cache_mode == "local"
            && self.write_skew_check
            && self.isolation_level == "repeatable_read"
            && !self.unreliable_return_values
    }
}

/// One node of the grid. Holds the entry store and runs the write
/// pipeline; shared by reference between the caller-facing surfaces and
/// the transport.
pub struct GridNode {
    pub id: NodeId,
    pub config: GridConfig,

    codec: EntryCodec,
    container: Mutex<DataContainer>,
    locks: LockTable,
    sequencer: BackupSequencer,
    backlogs: Mutex<HashMap<NodeId, Arc<AsyncMutex<Backlog>>>>,

    topology: Arc<dyn TopologyOracle>,
    transport: OnceLock<Arc<dyn Transport>>,
    notifier: Arc<Notifier>,
    fns: FnRegistry,
}

impl GridNode {
    /// Create a node within a given topology. The transport is wired
    /// separately once all peers exist.
    pub fn new(
        id: NodeId,
        topology: Arc<dyn TopologyOracle>,
        notifier: Arc<Notifier>,
        config_str: Option<&str>,
    ) -> Result<Arc<Self>, GridError> {
        let config = parsed_config!(config_str => GridConfig;
                                    isolation_level, write_skew_check,
                                    cache_mode, sync_backups,
                                    lock_timeout_ms, stale_retries,
                                    unreliable_return_values)?;
        Ok(Arc::new(GridNode {
            id,
            config,
            codec: EntryCodec::utf8(),
            container: Mutex::new(DataContainer::new()),
            locks: LockTable::new(),
            sequencer: BackupSequencer::new(),
            backlogs: Mutex::new(HashMap::new()),
            topology,
            transport: OnceLock::new(),
            notifier,
            fns: FnRegistry::new(),
        }))
    }

    /// Single-node setup owning every key; the common unclustered case.
    pub fn standalone(
        config_str: Option<&str>,
    ) -> Result<Arc<Self>, GridError> {
        let topology = Arc::new(StaticTopology::new(vec![0], 1)?);
        let notifier = Arc::new(Notifier::new());
        let node = GridNode::new(0, topology, notifier, config_str)?;
        let transport = Arc::new(LocalTransport::new());
        transport.register(node.clone());
        node.set_transport(transport)?;
        Ok(node)
    }

    pub fn set_transport(
        &self,
        transport: Arc<dyn Transport>,
    ) -> Result<(), GridError> {
        self.transport
            .set(transport)
            .map_err(|_| GridError::msg("transport already wired"))
    }

    fn transport(&self) -> Result<Arc<dyn Transport>, GridError> {
        self.transport
            .get()
            .cloned()
            .ok_or_else(|| GridError::msg("transport not wired"))
    }

    pub fn codec(&self) -> &EntryCodec {
        &self.codec
    }

    pub fn notifier(&self) -> Arc<Notifier> {
        self.notifier.clone()
    }

    pub fn fns(&self) -> &FnRegistry {
        &self.fns
    }

    pub fn locks(&self) -> &LockTable {
        &self.locks
    }

    pub fn register_merge_fn(
        &self,
        name: impl Into<String>,
        f: impl Fn(&GridValue, &GridValue) -> Option<GridValue>
            + Send
            + Sync
            + 'static,
    ) {
        self.fns.register(name, f);
    }

    /// Number of entries stored locally.
    pub fn estimate_size(&self) -> usize {
        self.container
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Stored version of a storage-form key; 0 when absent.
    pub fn stored_version(&self, key: &GridValue) -> u64 {
        self.container
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .version_of(key)
    }

    /// Stored entry (value + metadata) of a storage-form key.
    pub fn stored_entry(
        &self,
        key: &GridValue,
    ) -> Option<crate::grid::entry::GridEntry> {
        self.container
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .lookup(key)
            .cloned()
    }

    /// Snapshot of the locally stored key set.
    pub fn stored_keys(&self) -> Vec<GridValue> {
        self.container
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
    }

    /// Primary owner of a storage-form key under the current topology.
    pub fn primary_of(&self, key: &GridValue) -> Result<NodeId, GridError> {
        self.topology
            .owners_of(key)
            .first()
            .copied()
            .ok_or_else(|| GridError::msg("no owners under current topology"))
    }

    /// Route a command to the primary owner of its key and run it there.
    /// Retries a bounded number of times when the primary rejects the
    /// command over a topology mismatch.
    pub async fn invoke(
        self: &Arc<Self>,
        mut cmd: Command,
    ) -> Result<CommandResult, GridError> {
        let mut retries = self.config.stale_retries;
        loop {
            cmd.topology_id = self.topology.current_topology_id();
            let primary = self.primary_of(cmd.key())?;

            let result = if primary == self.id {
                self.invoke_local(cmd.clone(), true).await
            } else {
                pf_trace!(
                    "forwarding {:?} to primary {}",
                    cmd,
                    primary
                );
                match self
                    .transport()?
                    .send(primary, RemoteCommand::Invoke(cmd.clone()))
                    .await
                {
                    Ok(RemoteResponse::Result(r)) => Ok(r),
                    Ok(RemoteResponse::None) => Ok(CommandResult::None),
                    Err(e) => Err(e),
                }
            };

            match result {
                Err(GridError::StaleTopology { seen, current })
                    if retries > 0 =>
                {
                    pf_debug!(
                        "topology moved {} -> {}, retrying",
                        seen,
                        current
                    );
                    retries -= 1;
                }
                other => return other,
            }
        }
    }

    /// Handle a command arriving over the transport.
    pub async fn on_receive(
        self: &Arc<Self>,
        cmd: RemoteCommand,
    ) -> Result<RemoteResponse, GridError> {
        match cmd {
            RemoteCommand::Invoke(cmd) => {
                let current = self.topology.current_topology_id();
                if cmd.topology_id != current {
                    return Err(GridError::StaleTopology {
                        seen: cmd.topology_id,
                        current,
                    });
                }
                let result = self.invoke_local(cmd, true).await?;
                Ok(RemoteResponse::Result(result))
            }
            RemoteCommand::Backup(bcmd) => {
                self.on_backup(bcmd).await?;
                Ok(RemoteResponse::None)
            }
        }
    }

    /// Run a command on this node: lock, perform against a fresh entry
    /// view, commit, replicate. The per-key lock is held across backup
    /// sequencing so channel order matches apply order.
    pub async fn invoke_local(
        self: &Arc<Self>,
        cmd: Command,
        local_origin: bool,
    ) -> Result<CommandResult, GridError> {
        let key = cmd.key().clone();
        let locked =
            cmd.is_write() && !cmd.flags.has(CommandFlags::SKIP_LOCKING);
        if locked {
            self.locks
                .acquire(&key, cmd.invocation_id, self.config.lock_timeout())
                .await?;
        }

        let outcome = match self.apply(&cmd, local_origin) {
            Ok((result, Some(view))) => {
                match self.replicate(&cmd, &view).await {
                    Ok(()) => Ok(result),
                    Err(e) => Err(e),
                }
            }
            Ok((result, None)) => Ok(result),
            Err(e) => Err(e),
        };

        if locked {
            self.locks.release(&key, cmd.invocation_id);
        }
        outcome
    }

    /// Wrap, perform, commit. Returns the committed dirty view (if any)
    /// for the replication step.
    fn apply(
        &self,
        cmd: &Command,
        local_origin: bool,
    ) -> Result<(CommandResult, Option<EntryView>), GridError> {
        let key = cmd.key();
        let mut ctx = InvocationCtx::new(cmd.invocation_id, local_origin);
        {
            let container = self
                .container
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            ctx.wrap_entry(key.clone(), container.lookup(key));
        }

        let result = cmd.perform(&mut ctx, &self.notifier)?;

        let Some(view) = ctx.take_view(key) else {
            return Ok((result, None));
        };
        if !view.is_dirty() {
            return Ok((result, None));
        }
        self.container
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .commit(&view);
        Ok((result, Some(view)))
    }

    /// Fan the applied write out to the backup owners of its key. Sync
    /// mode propagates the first send failure to the caller; async mode
    /// detaches the sends and logs failures.
    async fn replicate(
        self: &Arc<Self>,
        cmd: &Command,
        view: &EntryView,
    ) -> Result<(), GridError> {
        if cmd.flags.has(CommandFlags::SKIP_REPLICATION) {
            return Ok(());
        }
        let backups: Vec<NodeId> = self
            .topology
            .owners_of(cmd.key())
            .into_iter()
            .skip(1)
            .filter(|b| *b != self.id)
            .collect();
        if backups.is_empty() {
            return Ok(());
        }
        let Some(op) = backup_op_for(cmd, view) else {
            return Ok(());
        };

        let transport = self.transport()?;
        for backup in backups {
            let bcmd = BackupCommand {
                op: op.clone(),
                primary: self.id,
                invocation_id: cmd.invocation_id,
                topology_id: cmd.topology_id,
                flags: cmd.flags.without_local_only(),
                sequence: self.sequencer.next_for(backup),
            };
            if self.config.sync_backups {
                transport
                    .send(backup, RemoteCommand::Backup(bcmd))
                    .await?;
            } else {
                let transport = transport.clone();
                tokio::spawn(async move {
                    if let Err(e) = transport
                        .send(backup, RemoteCommand::Backup(bcmd))
                        .await
                    {
                        pf_warn!("backup write to {} failed: {}", backup, e);
                    }
                });
            }
        }
        Ok(())
    }

    /// Apply one backup arrival: restore channel order through the
    /// backlog, then run every ready command through the local pipeline
    /// without locking or further replication. The channel mutex stays
    /// held from admission through apply, so two arrivals racing on the
    /// same channel cannot commit out of sequence order.
    pub async fn on_backup(
        self: &Arc<Self>,
        bcmd: BackupCommand,
    ) -> Result<(), GridError> {
        let channel = {
            let mut backlogs = self
                .backlogs
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            backlogs.entry(bcmd.primary).or_default().clone()
        };
        let mut backlog = channel.lock().await;
        let ready = backlog.admit(bcmd);
        for cmd in ready {
            match cmd.bind(&self.fns) {
                Ok(bound) => {
                    if let Err(e) = self.invoke_local(bound, false).await {
                        pf_error!("backup apply failed: {}", e);
                    }
                }
                Err(e) => {
                    pf_error!("cannot bind backup command: {}", e);
                }
            }
        }
        Ok(())
    }
}

/// Wire payload for a committed write. Conditional operations already
/// resolved on the primary ship their materialized effect; merges ship
/// value + remap name and re-run deterministically on the backup.
fn backup_op_for(cmd: &Command, view: &EntryView) -> Option<BackupOp> {
    match &cmd.op {
        WriteOp::Write {
            key,
            value,
            metadata,
            ..
        } => Some(BackupOp::Write {
            key: key.clone(),
            value: value.clone(),
            metadata: metadata.clone(),
        }),
        WriteOp::Remove { key } => {
            Some(BackupOp::Remove { key: key.clone() })
        }
        WriteOp::RemoveExpired { key, value } => {
            Some(BackupOp::RemoveExpired {
                key: key.clone(),
                value: value.clone(),
            })
        }
        WriteOp::Replace {
            key,
            value,
            metadata,
            ..
        } => Some(BackupOp::Replace {
            key: key.clone(),
            value: value.clone(),
            metadata: metadata.clone(),
        }),
        WriteOp::Merge {
            key,
            value,
            remap,
            metadata,
        } => Some(BackupOp::Merge {
            key: key.clone(),
            value: value.clone(),
            remap: remap.name.clone(),
            metadata: metadata.clone(),
        }),
        WriteOp::WriteOnly { key, .. } | WriteOp::ReadWrite { key, .. } => {
            if view.removed {
                Some(BackupOp::Remove { key: key.clone() })
            } else if view.changed {
                view.value.as_ref().map(|value| BackupOp::Write {
                    key: key.clone(),
                    value: value.clone(),
                    metadata: view.metadata.clone(),
                })
            } else {
                None
            }
        }
        WriteOp::ReadOnly { .. } => None,
    }
}

#[cfg(test)]
mod node_tests {
    use super::*;
    use crate::grid::command::CommandInvocationId;
    use crate::grid::entry::Metadata;
    use crate::grid::topology::LocalCluster;

    fn write_cmd(
        key: &GridValue,
        value: &str,
        origin: NodeId,
    ) -> Command {
        Command::new(
            WriteOp::Write {
                key: key.clone(),
                value: GridValue::text(value),
                metadata: Metadata::default(),
                if_absent: false,
            },
            0,
            origin,
        )
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn standalone_write_and_remove() -> Result<(), GridError> {
        let node = GridNode::standalone(None)?;
        let key = node.codec().key_to_storage(&GridValue::text("k"))?;
        let value = node.codec().value_to_storage(&GridValue::text("v"))?;

        let cmd = Command::new(
            WriteOp::Write {
                key: key.clone(),
                value: value.clone(),
                metadata: Metadata::default(),
                if_absent: false,
            },
            0,
            node.id,
        );
        match node.invoke(cmd).await? {
            CommandResult::Write { applied, previous } => {
                assert!(applied && previous.is_none());
            }
            r => panic!("unexpected result {:?}", r),
        }
        assert_eq!(node.stored_version(&key), 1);

        let cmd =
            Command::new(WriteOp::Remove { key: key.clone() }, 0, node.id);
        match node.invoke(cmd).await? {
            CommandResult::Remove { previous } => {
                assert_eq!(previous, Some(value));
            }
            r => panic!("unexpected result {:?}", r),
        }
        assert_eq!(node.estimate_size(), 0);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 3)]
    async fn write_converges_on_backup_owner() -> Result<(), GridError> {
        let cluster =
            LocalCluster::new(3, 2, Some("sync_backups = true"))?;
        let origin = cluster.node(0);
        let key =
            origin.codec().key_to_storage(&GridValue::text("routed"))?;
        let value =
            origin.codec().value_to_storage(&GridValue::text("v"))?;

        let cmd = Command::new(
            WriteOp::Write {
                key: key.clone(),
                value: value.clone(),
                metadata: Metadata::default(),
                if_absent: false,
            },
            0,
            origin.id,
        );
        origin.invoke(cmd).await?;

        // every owner must store the value; non-owners must not
        let owners = cluster.topology().owners_of(&key);
        for id in 0..3u8 {
            let stored = cluster.node(id).stored_entry(&key);
            if owners.contains(&id) {
                assert_eq!(stored.map(|e| e.value), Some(value.clone()));
            } else {
                assert!(stored.is_none());
            }
        }
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn reordered_backups_converge() -> Result<(), GridError> {
        crate::utils::logger_init();
        let node = GridNode::standalone(None)?;
        let key = node.codec().key_to_storage(&GridValue::text("k"))?;
        let v1 = node.codec().value_to_storage(&GridValue::text("v1"))?;
        let v2 = node.codec().value_to_storage(&GridValue::text("v2"))?;

        let bcmd = |seq: u64, value: &GridValue| BackupCommand {
            op: BackupOp::Write {
                key: key.clone(),
                value: value.clone(),
                metadata: Metadata::default(),
            },
            primary: 5,
            invocation_id: CommandInvocationId::generate(5),
            topology_id: 1,
            flags: CommandFlags::empty(),
            sequence: seq,
        };

        // second write arrives first; nothing applies until the gap fills
        node.on_backup(bcmd(2, &v2)).await?;
        assert!(node.stored_entry(&key).is_none());
        node.on_backup(bcmd(1, &v1)).await?;
        assert_eq!(node.stored_entry(&key).map(|e| e.value), Some(v2.clone()));

        // redelivery of either is a no-op
        node.on_backup(bcmd(1, &v1)).await?;
        assert_eq!(node.stored_entry(&key).map(|e| e.value), Some(v2));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_backup_arrivals_apply_in_order(
    ) -> Result<(), GridError> {
        crate::utils::logger_init();
        for _ in 0..2000 {
            let node = GridNode::standalone(None)?;
            let key = node.codec().key_to_storage(&GridValue::text("k"))?;
            let v1 =
                node.codec().value_to_storage(&GridValue::text("v1"))?;
            let v2 =
                node.codec().value_to_storage(&GridValue::text("v2"))?;

            let bcmd = |seq: u64, value: &GridValue| BackupCommand {
                op: BackupOp::Write {
                    key: key.clone(),
                    value: value.clone(),
                    metadata: Metadata::default(),
                },
                primary: 5,
                invocation_id: CommandInvocationId::generate(5),
                topology_id: 1,
                flags: CommandFlags::empty(),
                sequence: seq,
            };

            // both arrivals race on the same channel; whichever task wins
            // the interleaving, seq 2 must end up as the stored value
            let first = {
                let node = node.clone();
                let bcmd = bcmd(1, &v1);
                tokio::spawn(async move { node.on_backup(bcmd).await })
            };
            let second = {
                let node = node.clone();
                let bcmd = bcmd(2, &v2);
                tokio::spawn(async move { node.on_backup(bcmd).await })
            };
            first.await??;
            second.await??;

            assert_eq!(
                node.stored_entry(&key).map(|e| e.value),
                Some(v2)
            );
        }
        Ok(())
    }

    /// Node 0 of a two-node ownership pair, with node 1 left unroutable.
    fn half_wired_node(
        config_str: Option<&str>,
    ) -> Result<Arc<GridNode>, GridError> {
        let topology = Arc::new(StaticTopology::new(vec![0, 1], 2)?);
        let node = GridNode::new(
            0,
            topology,
            Arc::new(Notifier::new()),
            config_str,
        )?;
        let transport = Arc::new(LocalTransport::new());
        transport.register(node.clone());
        node.set_transport(transport)?;
        Ok(node)
    }

    fn key_primary_here(node: &GridNode) -> Result<GridValue, GridError> {
        for i in 0..64 {
            let key = node
                .codec()
                .key_to_storage(&GridValue::text(format!("k{}", i)))?;
            if node.primary_of(&key)? == node.id {
                return Ok(key);
            }
        }
        Err(GridError::msg("no locally-owned key found"))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn sync_backup_failure_fails_the_write() -> Result<(), GridError>
    {
        let node = half_wired_node(Some("sync_backups = true"))?;
        let key = key_primary_here(&node)?;

        let cmd = write_cmd(&key, "v", node.id);
        match node.invoke(cmd).await {
            Err(GridError::Msg(s)) => assert!(s.contains("no route")),
            other => panic!("unexpected outcome {:?}", other),
        }
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn async_backup_failure_leaves_write_ok() -> Result<(), GridError>
    {
        crate::utils::logger_init();
        let node = half_wired_node(None)?;
        let key = key_primary_here(&node)?;

        let cmd = write_cmd(&key, "v", node.id);
        node.invoke(cmd).await?;
        assert_eq!(node.stored_version(&key), 1);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn empty_owner_list_is_an_error() -> Result<(), GridError> {
        struct NoOwners;
        impl TopologyOracle for NoOwners {
            fn owners_of(&self, _key: &GridValue) -> Vec<NodeId> {
                Vec::new()
            }
            fn current_topology_id(&self) -> u64 {
                1
            }
        }

        let node = GridNode::new(
            0,
            Arc::new(NoOwners),
            Arc::new(Notifier::new()),
            None,
        )?;
        let key = node.codec().key_to_storage(&GridValue::text("k"))?;
        match node.invoke(write_cmd(&key, "v", 0)).await {
            Err(GridError::Msg(s)) => assert!(s.contains("no owners")),
            other => panic!("unexpected outcome {:?}", other),
        }
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stale_topology_is_rejected() -> Result<(), GridError> {
        let cluster = LocalCluster::new(2, 1, None)?;
        let node = cluster.node(0);
        let key = node.codec().key_to_storage(&GridValue::text("k"))?;

        let mut cmd = write_cmd(&key, "v", 1);
        cmd.topology_id = cluster.topology().current_topology_id();
        cluster.topology().bump();

        match node.on_receive(RemoteCommand::Invoke(cmd)).await {
            Err(GridError::StaleTopology { seen, current }) => {
                assert_eq!(current, seen + 1);
            }
            other => panic!("unexpected outcome {:?}", other.is_ok()),
        }
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn merge_reruns_on_backup_owner() -> Result<(), GridError> {
        let cluster =
            LocalCluster::new(2, 2, Some("sync_backups = true"))?;
        for id in 0..2u8 {
            cluster.node(id).register_merge_fn(
                "concat",
                |old, new| match (old, new) {
                    (GridValue::Wrapped(a), GridValue::Wrapped(b)) => {
                        let mut joined = a.to_vec();
                        joined.extend_from_slice(b);
                        Some(GridValue::Wrapped(joined.into()))
                    }
                    _ => Some(new.clone()),
                },
            );
        }

        let node = cluster.node(0);
        let key = node.codec().key_to_storage(&GridValue::text("m"))?;
        let base = node.codec().value_to_storage(&GridValue::text("ab"))?;
        let tail = node.codec().value_to_storage(&GridValue::text("cd"))?;

        let put = Command::new(
            WriteOp::Write {
                key: key.clone(),
                value: base,
                metadata: Metadata::default(),
                if_absent: false,
            },
            0,
            node.id,
        );
        node.invoke(put).await?;

        let merge = Command::new(
            WriteOp::Merge {
                key: key.clone(),
                value: tail,
                remap: node.fns().resolve("concat")?,
                metadata: Metadata::default(),
            },
            0,
            node.id,
        );
        node.invoke(merge).await?;

        let expect = node
            .codec()
            .value_to_storage(&GridValue::text("abcd"))?;
        for id in cluster.topology().owners_of(&key) {
            assert_eq!(
                cluster.node(id).stored_entry(&key).map(|e| e.value),
                Some(expect.clone())
            );
        }
        Ok(())
    }
}
