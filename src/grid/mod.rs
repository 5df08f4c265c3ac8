//! gridkv's node-side core modules: encoding, entries, commands, per-key
//! locking, backup replication, topology/transport seams, and the node
//! invocation pipeline.

pub mod backup;
pub mod command;
pub mod encoding;
pub mod entry;
pub mod locking;
pub mod node;
pub mod topology;

pub use backup::{Backlog, BackupCommand, BackupOp, BackupSequencer};
pub use command::{
    Command, CommandDescriptor, CommandFlags, CommandInvocationId,
    CommandResult, FnRegistry, NamedMergeFn, OpDescriptor, ReadEntryView,
    ReadWriteEntryView, WriteEntryView, WriteOp,
};
pub use encoding::{
    ByteArrayWrapper, Encoder, EntryCodec, GridValue, IdentityEncoder,
    Utf8Encoder, Wrapper,
};
pub use entry::{
    DataContainer, EntryEvent, EntryView, EventKind, GridEntry, Metadata,
    Notifier, Subscription,
};
pub use locking::LockTable;
pub use node::{GridConfig, GridNode};
pub use topology::{
    LocalCluster, LocalTransport, NodeId, RemoteCommand, RemoteResponse,
    StaticTopology, TopologyOracle, Transport,
};
