//! The command model: a closed set of mutation kinds, performed against
//! per-invocation entry views. Commands are immutable after construction
//! and carry no collaborator handles; remote construction is two-phase
//! (decode a pure-data descriptor, then bind it against a function
//! registry).

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::grid::encoding::GridValue;
use crate::grid::entry::{EntryView, GridEntry, Metadata, Notifier};
use crate::grid::topology::NodeId;
use crate::utils::GridError;

use serde::{Deserialize, Serialize};

/// Behavioral modifier bit-set carried by every command.
#[derive(
    Debug, PartialEq, Eq, Clone, Copy, Default, Serialize, Deserialize,
)]
pub struct CommandFlags(u64);

impl CommandFlags {
    /// Do not acquire the per-key lock; the caller already serialized
    /// access (backup applies, transactional commits holding locks).
    pub const SKIP_LOCKING: u64 = 1 << 0;
    /// Do not fan the applied write out to backup owners.
    pub const SKIP_REPLICATION: u64 = 1 << 1;
    /// The caller does not care about the previous value.
    pub const IGNORE_RETURN_VALUES: u64 = 1 << 2;
    /// Apply unconditionally even if a conditional operation's expected
    /// state does not match; backups must converge.
    pub const MATCH_ALWAYS: u64 = 1 << 3;

    // flags meaningful only on the node that set them; stripped before a
    // backup command goes on the wire
    const LOCAL_ONLY: u64 =
        Self::SKIP_LOCKING | Self::SKIP_REPLICATION | Self::MATCH_ALWAYS;

    pub fn empty() -> Self {
        CommandFlags(0)
    }

    pub fn with(self, flag: u64) -> Self {
        CommandFlags(self.0 | flag)
    }

    pub fn has(&self, flag: u64) -> bool {
        self.0 & flag != 0
    }

    /// Copy of these flags with the local-only set stripped.
    pub fn without_local_only(self) -> Self {
        CommandFlags(self.0 & !Self::LOCAL_ONLY)
    }
}

/// Globally unique id of one command invocation: originating node plus a
/// per-process monotonic counter. Used for idempotence, ack correlation,
/// and as the lock-owner identity of non-transactional writes.
#[derive(
    Debug, PartialEq, Eq, Hash, Clone, Copy, Serialize, Deserialize,
)]
pub struct CommandInvocationId {
    pub origin: NodeId,
    pub seq: u64,
}

static NEXT_INVOCATION_SEQ: AtomicU64 = AtomicU64::new(1);

impl CommandInvocationId {
    pub fn generate(origin: NodeId) -> Self {
        CommandInvocationId {
            origin,
            seq: NEXT_INVOCATION_SEQ.fetch_add(1, Ordering::AcqRel),
        }
    }
}

impl fmt::Display for CommandInvocationId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.origin, self.seq)
    }
}

/// Read-only view of one entry handed to read functions.
pub struct ReadEntryView<'a> {
    view: &'a EntryView,
}

impl ReadEntryView<'_> {
    pub fn key(&self) -> &GridValue {
        &self.view.key
    }

    pub fn find(&self) -> Option<&GridValue> {
        self.view.value.as_ref()
    }

    pub fn version(&self) -> u64 {
        self.view.metadata.version
    }

    pub fn metadata(&self) -> &Metadata {
        &self.view.metadata
    }
}

/// Write-only view of one entry handed to write consumers.
pub struct WriteEntryView<'a> {
    view: &'a mut EntryView,
}

impl WriteEntryView<'_> {
    pub fn set(&mut self, value: GridValue) {
        self.view.set_value(value);
    }

    pub fn remove(&mut self) {
        if self.view.value.is_some() {
            self.view.remove_value();
        }
    }
}

/// Read-write view: observe the entry, then mutate it.
pub struct ReadWriteEntryView<'a> {
    view: &'a mut EntryView,
}

impl ReadWriteEntryView<'_> {
    pub fn key(&self) -> &GridValue {
        &self.view.key
    }

    pub fn find(&self) -> Option<&GridValue> {
        self.view.value.as_ref()
    }

    pub fn version(&self) -> u64 {
        self.view.metadata.version
    }

    pub fn metadata(&self) -> &Metadata {
        &self.view.metadata
    }

    pub fn set(&mut self, value: GridValue) {
        self.view.set_value(value);
    }

    pub fn remove(&mut self) {
        if self.view.value.is_some() {
            self.view.remove_value();
        }
    }
}

/// Type-erased result of a user-supplied function; the typed evaluator
/// wrapper downcasts it back.
pub type FnOut = Box<dyn Any + Send>;

pub type ReadFn = Arc<dyn Fn(ReadEntryView<'_>) -> FnOut + Send + Sync>;
pub type WriteFn = Arc<dyn Fn(&mut WriteEntryView<'_>) + Send + Sync>;
pub type ReadWriteFn =
    Arc<dyn Fn(&mut ReadWriteEntryView<'_>) -> FnOut + Send + Sync>;
pub type MergeFn =
    Arc<dyn Fn(&GridValue, &GridValue) -> Option<GridValue> + Send + Sync>;

/// A merge remapping function paired with its registry name, so the wire
/// form of a merge command can be rebuilt on the receiving node.
#[derive(Clone)]
pub struct NamedMergeFn {
    pub name: String,
    f: MergeFn,
}

impl NamedMergeFn {
    pub fn new(
        name: impl Into<String>,
        f: impl Fn(&GridValue, &GridValue) -> Option<GridValue>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        NamedMergeFn {
            name: name.into(),
            f: Arc::new(f),
        }
    }

    pub fn apply(
        &self,
        old_value: &GridValue,
        value: &GridValue,
    ) -> Option<GridValue> {
        (self.f)(old_value, value)
    }
}

impl fmt::Debug for NamedMergeFn {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "NamedMergeFn({})", self.name)
    }
}

/// Registry of named merge functions; decoded commands resolve their
/// remapping function here at bind time instead of carrying live closures
/// over the wire.
#[derive(Clone, Default)]
pub struct FnRegistry {
    fns: Arc<Mutex<HashMap<String, MergeFn>>>,
}

impl FnRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        name: impl Into<String>,
        f: impl Fn(&GridValue, &GridValue) -> Option<GridValue>
            + Send
            + Sync
            + 'static,
    ) {
        self.fns
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.into(), Arc::new(f));
    }

    pub fn resolve(&self, name: &str) -> Result<NamedMergeFn, GridError> {
        let fns = self.fns.lock().unwrap_or_else(PoisonError::into_inner);
        match fns.get(name) {
            Some(f) => Ok(NamedMergeFn {
                name: name.into(),
                f: f.clone(),
            }),
            None => Err(GridError::Msg(format!(
                "merge function '{}' not registered",
                name
            ))),
        }
    }
}

/// Closed set of operation kinds a command can describe. Keys and values
/// are in storage form by the time an op is built.
#[derive(Clone)]
pub enum WriteOp {
    /// Unconditional put, or put-if-absent when `if_absent` is set.
    Write {
        key: GridValue,
        value: GridValue,
        metadata: Metadata,
        if_absent: bool,
    },
    /// Remove if present.
    Remove { key: GridValue },
    /// Remove only if the stored value still equals the expired value seen
    /// by the expiration reaper.
    RemoveExpired { key: GridValue, value: GridValue },
    /// Replace the stored value, conditionally on `expected` if given,
    /// otherwise only if some value is present.
    Replace {
        key: GridValue,
        expected: Option<GridValue>,
        value: GridValue,
        metadata: Metadata,
    },
    /// Map-merge of `value` into the stored value through `remap`.
    Merge {
        key: GridValue,
        value: GridValue,
        remap: NamedMergeFn,
        metadata: Metadata,
    },
    /// Apply a read-only function to the entry.
    ReadOnly { key: GridValue, f: ReadFn },
    /// Apply a write-only consumer to the entry.
    WriteOnly { key: GridValue, f: WriteFn },
    /// Apply a read-write function to the entry.
    ReadWrite { key: GridValue, f: ReadWriteFn },
}

impl WriteOp {
    pub fn key(&self) -> &GridValue {
        match self {
            WriteOp::Write { key, .. }
            | WriteOp::Remove { key }
            | WriteOp::RemoveExpired { key, .. }
            | WriteOp::Replace { key, .. }
            | WriteOp::Merge { key, .. }
            | WriteOp::ReadOnly { key, .. }
            | WriteOp::WriteOnly { key, .. }
            | WriteOp::ReadWrite { key, .. } => key,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            WriteOp::Write { .. } => "write",
            WriteOp::Remove { .. } => "remove",
            WriteOp::RemoveExpired { .. } => "remove-expired",
            WriteOp::Replace { .. } => "replace",
            WriteOp::Merge { .. } => "merge",
            WriteOp::ReadOnly { .. } => "read-only",
            WriteOp::WriteOnly { .. } => "write-only",
            WriteOp::ReadWrite { .. } => "read-write",
        }
    }

    /// Whether this op may mutate the entry.
    pub fn is_write(&self) -> bool {
        !matches!(self, WriteOp::ReadOnly { .. })
    }
}

impl fmt::Debug for WriteOp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}({:?})", self.kind(), self.key())
    }
}

/// Caller-visible outcome of performing one command. Values are still in
/// storage form; the evaluator decodes them.
pub enum CommandResult {
    Write {
        previous: Option<GridValue>,
        applied: bool,
    },
    Remove {
        previous: Option<GridValue>,
    },
    Expired {
        applied: bool,
    },
    Replace {
        applied: bool,
    },
    Merge {
        current: Option<GridValue>,
    },
    /// Write-only function completed.
    Done,
    /// Type-erased output of a read-only or read-write function.
    Out(FnOut),
    /// Backups return no value.
    None,
}

impl fmt::Debug for CommandResult {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CommandResult::Write { previous, applied } => write!(
                f,
                "Write {{ previous: {:?}, applied: {} }}",
                previous, applied
            ),
            CommandResult::Remove { previous } => {
                write!(f, "Remove {{ previous: {:?} }}", previous)
            }
            CommandResult::Expired { applied } => {
                write!(f, "Expired {{ applied: {} }}", applied)
            }
            CommandResult::Replace { applied } => {
                write!(f, "Replace {{ applied: {} }}", applied)
            }
            CommandResult::Merge { current } => {
                write!(f, "Merge {{ current: {:?} }}", current)
            }
            CommandResult::Done => write!(f, "Done"),
            CommandResult::Out(_) => write!(f, "Out(..)"),
            CommandResult::None => write!(f, "None"),
        }
    }
}

/// Per-invocation context: the wrapped entry views a command may touch,
/// plus the lock-owner identity tied to the invocation.
pub struct InvocationCtx {
    entries: HashMap<GridValue, EntryView>,
    pub lock_owner: CommandInvocationId,
    /// Whether this invocation originated on this node. Backup-applied
    /// commands run with this unset and fire no notifications; events fire
    /// exactly once, on the primary.
    pub local_origin: bool,
}

impl InvocationCtx {
    pub fn new(lock_owner: CommandInvocationId, local_origin: bool) -> Self {
        InvocationCtx {
            entries: HashMap::new(),
            lock_owner,
            local_origin,
        }
    }

    /// Fetch an entry into the context as a mutable view. Must happen
    /// before the command is performed.
    pub fn wrap_entry(&mut self, key: GridValue, existing: Option<&GridEntry>) {
        self.entries
            .entry(key.clone())
            .or_insert_with(|| EntryView::wrap(key, existing));
    }

    pub fn lookup_entry(&self, key: &GridValue) -> Option<&EntryView> {
        self.entries.get(key)
    }

    pub fn lookup_entry_mut(
        &mut self,
        key: &GridValue,
    ) -> Option<&mut EntryView> {
        self.entries.get_mut(key)
    }

    pub fn take_view(&mut self, key: &GridValue) -> Option<EntryView> {
        self.entries.remove(key)
    }
}

fn entry_not_wrapped(key: &GridValue) -> GridError {
    GridError::EntryNotWrapped(format!(
        "{:?} missing from invocation context",
        key
    ))
}

/// An immutable-after-construction description of one mutation, executed
/// by the owning node's pipeline.
#[derive(Clone)]
pub struct Command {
    pub op: WriteOp,
    pub flags: CommandFlags,
    pub topology_id: u64,
    pub invocation_id: CommandInvocationId,
}

impl Command {
    pub fn new(op: WriteOp, topology_id: u64, origin: NodeId) -> Self {
        Command {
            op,
            flags: CommandFlags::empty(),
            topology_id,
            invocation_id: CommandInvocationId::generate(origin),
        }
    }

    pub fn with_flags(mut self, flags: CommandFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn key(&self) -> &GridValue {
        self.op.key()
    }

    /// Key set this command touches.
    pub fn targets(&self) -> Vec<&GridValue> {
        vec![self.op.key()]
    }

    pub fn is_write(&self) -> bool {
        self.op.is_write()
    }

    /// Apply the mutation to the wrapped entry view and produce the
    /// caller-visible result. The entry must have been fetched into the
    /// context first; anything else is a pipeline contract violation.
    pub fn perform(
        &self,
        ctx: &mut InvocationCtx,
        notifier: &Notifier,
    ) -> Result<CommandResult, GridError> {
        let notify = ctx.local_origin;
        let match_always = self.flags.has(CommandFlags::MATCH_ALWAYS);

        match &self.op {
            WriteOp::Write {
                key,
                value,
                metadata,
                if_absent,
            } => {
                let view = ctx
                    .lookup_entry_mut(key)
                    .ok_or_else(|| entry_not_wrapped(key))?;
                let previous = view.value.clone();
                if *if_absent && previous.is_some() && !match_always {
                    return Ok(CommandResult::Write {
                        previous,
                        applied: false,
                    });
                }
                if notify {
                    if previous.is_none() {
                        notifier.notify_created(key, value, metadata);
                    } else {
                        notifier.notify_modified(key, value, metadata);
                    }
                }
                update_metadata(view, metadata);
                view.set_value(value.clone());
                Ok(CommandResult::Write {
                    previous,
                    applied: true,
                })
            }

            WriteOp::Remove { key } => {
                let view = ctx
                    .lookup_entry_mut(key)
                    .ok_or_else(|| entry_not_wrapped(key))?;
                let previous = view.value.clone();
                if previous.is_none() {
                    return Ok(CommandResult::Remove { previous: None });
                }
                if notify {
                    notifier.notify_removed(
                        key,
                        previous.as_ref(),
                        &view.metadata,
                    );
                }
                view.remove_value();
                Ok(CommandResult::Remove { previous })
            }

            WriteOp::RemoveExpired { key, value } => {
                let view = ctx
                    .lookup_entry_mut(key)
                    .ok_or_else(|| entry_not_wrapped(key))?;
                let matches = match_always
                    || view.value.as_ref() == Some(value);
                if !matches || view.value.is_none() {
                    return Ok(CommandResult::Expired { applied: false });
                }
                if notify {
                    notifier.notify_removed(
                        key,
                        view.value.as_ref(),
                        &view.metadata,
                    );
                }
                view.remove_value();
                view.expired = true;
                Ok(CommandResult::Expired { applied: true })
            }

            WriteOp::Replace {
                key,
                expected,
                value,
                metadata,
            } => {
                let view = ctx
                    .lookup_entry_mut(key)
                    .ok_or_else(|| entry_not_wrapped(key))?;
                let previous = view.value.clone();
                let matches = match_always
                    || match expected {
                        None => previous.is_some(),
                        Some(e) => previous.as_ref() == Some(e),
                    };
                if !matches {
                    return Ok(CommandResult::Replace { applied: false });
                }
                if notify {
                    if previous.is_none() {
                        notifier.notify_created(key, value, metadata);
                    } else {
                        notifier.notify_modified(key, value, metadata);
                    }
                }
                update_metadata(view, metadata);
                view.set_value(value.clone());
                Ok(CommandResult::Replace { applied: true })
            }

            WriteOp::Merge {
                key,
                value,
                remap,
                metadata,
            } => {
                let view = ctx
                    .lookup_entry_mut(key)
                    .ok_or_else(|| entry_not_wrapped(key))?;
                match view.value.clone() {
                    Some(old_value) => {
                        match remap.apply(&old_value, value) {
                            Some(new_value) => {
                                // replace the stored value; notify before
                                // mutating the view
                                if notify {
                                    notifier.notify_modified(
                                        key, &new_value, metadata,
                                    );
                                }
                                update_metadata(view, metadata);
                                view.set_value(new_value.clone());
                                Ok(CommandResult::Merge {
                                    current: Some(new_value),
                                })
                            }
                            None => {
                                // a missing remap result removes the entry
                                if notify {
                                    notifier.notify_removed(
                                        key,
                                        Some(&old_value),
                                        &view.metadata,
                                    );
                                }
                                view.remove_value();
                                Ok(CommandResult::Merge { current: None })
                            }
                        }
                    }
                    None => {
                        // no stored value; just install the given one
                        if notify {
                            notifier.notify_created(key, value, metadata);
                        }
                        update_metadata(view, metadata);
                        view.set_value(value.clone());
                        Ok(CommandResult::Merge {
                            current: Some(value.clone()),
                        })
                    }
                }
            }

            WriteOp::ReadOnly { key, f } => {
                let view = ctx
                    .lookup_entry(key)
                    .ok_or_else(|| entry_not_wrapped(key))?;
                Ok(CommandResult::Out(f(ReadEntryView { view })))
            }

            WriteOp::WriteOnly { key, f } => {
                let view = ctx
                    .lookup_entry_mut(key)
                    .ok_or_else(|| entry_not_wrapped(key))?;
                let existed = view.value.clone();
                f(&mut WriteEntryView { view: &mut *view });
                if notify {
                    notify_functional(notifier, view, existed);
                }
                Ok(CommandResult::Done)
            }

            WriteOp::ReadWrite { key, f } => {
                let view = ctx
                    .lookup_entry_mut(key)
                    .ok_or_else(|| entry_not_wrapped(key))?;
                let existed = view.value.clone();
                let out = f(&mut ReadWriteEntryView { view: &mut *view });
                if notify {
                    notify_functional(notifier, view, existed);
                }
                Ok(CommandResult::Out(out))
            }
        }
    }

    /// Pure-data wire form of this command. Functional commands carry live
    /// closures and cannot be described; they only travel in-process.
    pub fn describe(&self) -> Result<CommandDescriptor, GridError> {
        let op = match &self.op {
            WriteOp::Write {
                key,
                value,
                metadata,
                if_absent,
            } => OpDescriptor::Write {
                key: key.clone(),
                value: value.clone(),
                metadata: metadata.clone(),
                if_absent: *if_absent,
            },
            WriteOp::Remove { key } => {
                OpDescriptor::Remove { key: key.clone() }
            }
            WriteOp::RemoveExpired { key, value } => {
                OpDescriptor::RemoveExpired {
                    key: key.clone(),
                    value: value.clone(),
                }
            }
            WriteOp::Replace {
                key,
                expected,
                value,
                metadata,
            } => OpDescriptor::Replace {
                key: key.clone(),
                expected: expected.clone(),
                value: value.clone(),
                metadata: metadata.clone(),
            },
            WriteOp::Merge {
                key,
                value,
                remap,
                metadata,
            } => OpDescriptor::Merge {
                key: key.clone(),
                value: value.clone(),
                remap: remap.name.clone(),
                metadata: metadata.clone(),
            },
            WriteOp::ReadOnly { .. }
            | WriteOp::WriteOnly { .. }
            | WriteOp::ReadWrite { .. } => {
                return Err(GridError::msg(
                    "functional commands cannot be serialized",
                ));
            }
        };
        Ok(CommandDescriptor {
            op,
            flags: self.flags.without_local_only(),
            topology_id: self.topology_id,
            invocation_id: self.invocation_id,
        })
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Command {{ op: {:?}, topology: {}, id: {} }}",
            self.op, self.topology_id, self.invocation_id
        )
    }
}

/// Apply a command's metadata (expiration policy) onto the view; the
/// version stamp stays container-managed.
fn update_metadata(view: &mut EntryView, metadata: &Metadata) {
    view.metadata.lifespan = metadata.lifespan;
    view.metadata.max_idle = metadata.max_idle;
}

/// Fire the appropriate post-hoc event for an opaque functional mutation.
fn notify_functional(
    notifier: &Notifier,
    view: &EntryView,
    existed: Option<GridValue>,
) {
    if view.removed && existed.is_some() {
        notifier.notify_removed(&view.key, existed.as_ref(), &view.metadata);
    } else if view.changed {
        if let Some(value) = &view.value {
            if existed.is_none() {
                notifier.notify_created(&view.key, value, &view.metadata);
            } else {
                notifier.notify_modified(&view.key, value, &view.metadata);
            }
        }
    }
}

/// Pure-data wire form of a data command's operation.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub enum OpDescriptor {
    Write {
        key: GridValue,
        value: GridValue,
        metadata: Metadata,
        if_absent: bool,
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
        expected: Option<GridValue>,
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

/// Serializable companion of `Command`: pure data, no capabilities.
/// `decode` then `bind` rebuilds an executable command on the receiving
/// node.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct CommandDescriptor {
    pub op: OpDescriptor,
    pub flags: CommandFlags,
    pub topology_id: u64,
    pub invocation_id: CommandInvocationId,
}

impl CommandDescriptor {
    pub fn encode(&self) -> Result<Vec<u8>, GridError> {
        Ok(rmp_serde::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, GridError> {
        Ok(rmp_serde::from_slice(bytes)?)
    }

    /// Attach capabilities (the merge function registry) and produce an
    /// executable command.
    pub fn bind(self, registry: &FnRegistry) -> Result<Command, GridError> {
        let op = match self.op {
            OpDescriptor::Write {
                key,
                value,
                metadata,
                if_absent,
            } => WriteOp::Write {
                key,
                value,
                metadata,
                if_absent,
            },
            OpDescriptor::Remove { key } => WriteOp::Remove { key },
            OpDescriptor::RemoveExpired { key, value } => {
                WriteOp::RemoveExpired { key, value }
            }
            OpDescriptor::Replace {
                key,
                expected,
                value,
                metadata,
            } => WriteOp::Replace {
                key,
                expected,
                value,
                metadata,
            },
            OpDescriptor::Merge {
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
            flags: self.flags,
            topology_id: self.topology_id,
            invocation_id: self.invocation_id,
        })
    }
}
