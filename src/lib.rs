//! Public interface to the gridkv library: a replicated in-memory
//! key/value data grid with per-key primary ownership, sequenced backup
//! replication, optimistic transactions, typed functional evaluation, and
//! a clustered lock primitive derived from the grid itself.

#[macro_use]
pub mod utils;

pub mod grid;

pub mod cache;
pub mod functional;
pub mod lock;

pub use crate::utils::{logger_init, GridError, Timer, ME};

pub use crate::grid::{
    Backlog, BackupCommand, BackupOp, BackupSequencer, ByteArrayWrapper,
    Command, CommandDescriptor, CommandFlags, CommandInvocationId,
    CommandResult, DataContainer, Encoder, EntryCodec, EntryEvent,
    EntryView, EventKind, FnRegistry, GridConfig, GridEntry, GridNode,
    GridValue, IdentityEncoder, LocalCluster, LocalTransport, LockTable,
    Metadata, NamedMergeFn, NodeId, Notifier, OpDescriptor,
    ReadEntryView, ReadWriteEntryView, RemoteCommand, RemoteResponse,
    StaticTopology, Subscription, TopologyOracle, Transport, Utf8Encoder,
    WriteEntryView, WriteOp, Wrapper,
};

pub use crate::cache::{Cache, Transaction};
pub use crate::functional::{ReadOnlyMap, ReadWriteMap, WriteOnlyMap};
pub use crate::lock::{
    ClusteredLock, ClusteredLockManager, ClusteredLockValue, LockState,
};
