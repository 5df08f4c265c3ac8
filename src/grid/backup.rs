//! Backup replication protocol: the wire form of applied writes fanned out
//! to backup owners, per-channel FIFO sequencing on the sending side, and
//! the receiving-side backlog that restores order and drops duplicates.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, PoisonError};

use crate::grid::command::{
    Command, CommandFlags, CommandInvocationId, FnRegistry, WriteOp,
};
use crate::grid::encoding::GridValue;
use crate::grid::entry::Metadata;
use crate::grid::topology::NodeId;
use crate::utils::GridError;

use serde::{Deserialize, Serialize};

/// Operation payload of a backup write. Only the final effect travels;
/// conditional and functional operations are resolved on the primary and
/// shipped as their materialized outcome (merge keeps its remap name so
/// the backup re-runs the same deterministic function).
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub enum BackupOp {
    Write {
        key: GridValue,
        value: GridValue,
        metadata: Metadata,
    },
    Remove {
        key: GridValue,
    },
    RemoveExpired {
        key: GridValue,
        value: GridValue,
    },
    Replace {
        key: GridValue,
        value: GridValue,
        metadata: Metadata,
    },
    Merge {
        key: GridValue,
        value: GridValue,
        remap: String,
        metadata: Metadata,
    },
}

impl BackupOp {
    pub fn key(&self) -> &GridValue {
        match self {
            BackupOp::Write { key, .. }
            | BackupOp::Remove { key }
            | BackupOp::RemoveExpired { key, .. }
            | BackupOp::Replace { key, .. }
            | BackupOp::Merge { key, .. } => key,
        }
    }
}

/// One sequenced backup write from a primary to one backup owner.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct BackupCommand {
    pub op: BackupOp,
    /// The primary that applied the write; identifies the FIFO channel.
    pub primary: NodeId,
    pub invocation_id: CommandInvocationId,
    pub topology_id: u64,
    pub flags: CommandFlags,
    /// Position in the (primary, backup) channel, starting at 1.
    pub sequence: u64,
}

impl BackupCommand {
    pub fn encode(&self) -> Result<Vec<u8>, GridError> {
        Ok(rmp_serde::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, GridError> {
        Ok(rmp_serde::from_slice(bytes)?)
    }

    /// Rebuild an executable command for the backup apply path. Backup
    /// applies skip locking (the backlog already serializes the channel),
    /// apply unconditionally, and never replicate further.
    pub fn bind(self, registry: &FnRegistry) -> Result<Command, GridError> {
        let op = match self.op {
            BackupOp::Write {
                key,
                value,
                metadata,
            } => WriteOp::Write {
                key,
                value,
                metadata,
                if_absent: false,
            },
            BackupOp::Remove { key } => WriteOp::Remove { key },
            BackupOp::RemoveExpired { key, value } => {
                WriteOp::RemoveExpired { key, value }
            }
            BackupOp::Replace {
                key,
                value,
                metadata,
            } => WriteOp::Replace {
                key,
                expected: None,
                value,
                metadata,
            },
            BackupOp::Merge {
                key,
                value,
                remap,
                metadata,
            } => WriteOp::Merge {
                key,
                value,
                remap: registry.resolve(&remap)?,
                metadata,
            },
        };
        Ok(Command {
            op,
            flags: self
                .flags
                .with(CommandFlags::SKIP_LOCKING)
                .with(CommandFlags::SKIP_REPLICATION)
                .with(CommandFlags::MATCH_ALWAYS),
            topology_id: self.topology_id,
            invocation_id: self.invocation_id,
        })
    }
}

/// Sending-side sequence counters, one per backup peer.
#[derive(Default)]
pub struct BackupSequencer {
    next: Mutex<HashMap<NodeId, u64>>,
}

impl BackupSequencer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next sequence number on the channel towards `backup`.
    pub fn next_for(&self, backup: NodeId) -> u64 {
        let mut next =
            self.next.lock().unwrap_or_else(PoisonError::into_inner);
        let seq = next.entry(backup).or_insert(1);
        let out = *seq;
        *seq += 1;
        out
    }
}

/// Receiving-side reorder buffer for one primary's channel. Out-of-order
/// arrivals are buffered; duplicates (sequence already applied) are
/// dropped, which makes redelivery idempotent.
pub struct Backlog {
    next_seq: u64,
    pending: BTreeMap<u64, BackupCommand>,
}

impl Default for Backlog {
    fn default() -> Self {
        Self::new()
    }
}

impl Backlog {
    pub fn new() -> Self {
        Backlog {
            next_seq: 1,
            pending: BTreeMap::new(),
        }
    }

    /// Admit one arrival and return every command now ready to apply, in
    /// sequence order.
    pub fn admit(&mut self, cmd: BackupCommand) -> Vec<BackupCommand> {
        if cmd.sequence < self.next_seq {
            pf_debug!(
                "dropping duplicate backup seq {} from {} (next {})",
                cmd.sequence,
                cmd.primary,
                self.next_seq
            );
            return Vec::new();
        }
        self.pending.insert(cmd.sequence, cmd);

        let mut ready = Vec::new();
        while let Some(cmd) = self.pending.remove(&self.next_seq) {
            self.next_seq += 1;
            ready.push(cmd);
        }
        ready
    }

    /// How many arrivals are parked waiting for a gap to fill.
    pub fn parked(&self) -> usize {
        self.pending.len()
    }
}
