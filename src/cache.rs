//! Caller-facing cache surface: basic key/value operations in client
//! media form, plus an optimistic transaction runner with commit-time
//! write-skew validation.

use std::collections::HashMap;
use std::sync::Arc;

use crate::functional::ReadOnlyMap;
use crate::grid::command::{
    Command, CommandFlags, CommandInvocationId, CommandResult, NamedMergeFn,
    WriteOp,
};
use crate::grid::encoding::GridValue;
use crate::grid::entry::Metadata;
use crate::grid::node::GridNode;
use crate::utils::GridError;

/// A cache handle over one grid node. Values cross this surface in client
/// media form; the codec converts at the boundary.
#[derive(Clone)]
pub struct Cache {
    node: Arc<GridNode>,
}

impl Cache {
    pub fn new(node: Arc<GridNode>) -> Self {
        Cache { node }
    }

    pub fn node(&self) -> &Arc<GridNode> {
        &self.node
    }

    fn data_cmd(&self, op: WriteOp) -> Command {
        Command::new(op, 0, self.node.id)
    }

    /// Store `value` under `key`, returning the previous value if any.
    pub async fn save(
        &self,
        key: &GridValue,
        value: &GridValue,
    ) -> Result<Option<GridValue>, GridError> {
        let cmd = self.data_cmd(WriteOp::Write {
            key: self.node.codec().key_to_storage(key)?,
            value: self.node.codec().value_to_storage(value)?,
            metadata: Metadata::default(),
            if_absent: false,
        });
        match self.node.invoke(cmd).await? {
            CommandResult::Write { previous, .. } => {
                self.node.codec().value_from_storage(previous.as_ref())
            }
            r => Err(unexpected(r)),
        }
    }

    /// Store `value` under `key` only if the key is absent. Returns
    /// whether the insert took effect.
    pub async fn insert(
        &self,
        key: &GridValue,
        value: &GridValue,
    ) -> Result<bool, GridError> {
        let cmd = self.data_cmd(WriteOp::Write {
            key: self.node.codec().key_to_storage(key)?,
            value: self.node.codec().value_to_storage(value)?,
            metadata: Metadata::default(),
            if_absent: true,
        });
        match self.node.invoke(cmd).await? {
            CommandResult::Write { applied, .. } => Ok(applied),
            r => Err(unexpected(r)),
        }
    }

    pub async fn get(
        &self,
        key: &GridValue,
    ) -> Result<Option<GridValue>, GridError> {
        let stored = ReadOnlyMap::new(self.node.clone())
            .eval(key, |view| view.find().cloned())
            .await?;
        self.node.codec().value_from_storage(stored.as_ref())
    }

    /// Value plus its stored metadata (version and expiration policy).
    pub async fn get_with_metadata(
        &self,
        key: &GridValue,
    ) -> Result<Option<(GridValue, Metadata)>, GridError> {
        let stored = ReadOnlyMap::new(self.node.clone())
            .eval(key, |view| {
                view.find().cloned().map(|v| (v, view.metadata().clone()))
            })
            .await?;
        match stored {
            None => Ok(None),
            Some((v, meta)) => {
                match self.node.codec().value_from_storage(Some(&v))? {
                    Some(v) => Ok(Some((v, meta))),
                    None => Ok(None),
                }
            }
        }
    }

    /// Remove `key`, returning the previous value if any.
    pub async fn delete(
        &self,
        key: &GridValue,
    ) -> Result<Option<GridValue>, GridError> {
        let cmd = self.data_cmd(WriteOp::Remove {
            key: self.node.codec().key_to_storage(key)?,
        });
        match self.node.invoke(cmd).await? {
            CommandResult::Remove { previous } => {
                self.node.codec().value_from_storage(previous.as_ref())
            }
            r => Err(unexpected(r)),
        }
    }

    /// Replace the value of `key`, conditionally on `expected` if given,
    /// otherwise only if some value is present.
    pub async fn replace(
        &self,
        key: &GridValue,
        expected: Option<&GridValue>,
        value: &GridValue,
    ) -> Result<bool, GridError> {
        let expected = match expected {
            None => None,
            Some(e) => Some(self.node.codec().value_to_storage(e)?),
        };
        let cmd = self.data_cmd(WriteOp::Replace {
            key: self.node.codec().key_to_storage(key)?,
            expected,
            value: self.node.codec().value_to_storage(value)?,
            metadata: Metadata::default(),
        });
        match self.node.invoke(cmd).await? {
            CommandResult::Replace { applied } => Ok(applied),
            r => Err(unexpected(r)),
        }
    }

    /// Merge `value` into the stored value through `remap`; a missing
    /// remap result removes the entry. Returns the value now stored.
    pub async fn merge(
        &self,
        key: &GridValue,
        value: &GridValue,
        remap: NamedMergeFn,
    ) -> Result<Option<GridValue>, GridError> {
        let cmd = self.data_cmd(WriteOp::Merge {
            key: self.node.codec().key_to_storage(key)?,
            value: self.node.codec().value_to_storage(value)?,
            remap,
            metadata: Metadata::default(),
        });
        match self.node.invoke(cmd).await? {
            CommandResult::Merge { current } => {
                self.node.codec().value_from_storage(current.as_ref())
            }
            r => Err(unexpected(r)),
        }
    }

    /// Remove `key` only if its value still equals `seen` (the value
    /// observed expired by the reaper). Returns whether removal applied.
    pub async fn remove_expired(
        &self,
        key: &GridValue,
        seen: &GridValue,
    ) -> Result<bool, GridError> {
        let cmd = self.data_cmd(WriteOp::RemoveExpired {
            key: self.node.codec().key_to_storage(key)?,
            value: self.node.codec().value_to_storage(seen)?,
        });
        match self.node.invoke(cmd).await? {
            CommandResult::Expired { applied } => Ok(applied),
            r => Err(unexpected(r)),
        }
    }

    /// Number of entries stored on this node.
    pub fn estimate_size(&self) -> usize {
        self.node.estimate_size()
    }

    /// Start an optimistic transaction against this cache.
    pub fn begin(&self) -> Transaction {
        Transaction {
            node: self.node.clone(),
            id: CommandInvocationId::generate(self.node.id),
            reads: HashMap::new(),
            writes: Vec::new(),
        }
    }
}

fn unexpected(r: CommandResult) -> GridError {
    GridError::Msg(format!("unexpected command result {:?}", r))
}

/// An optimistic transaction: reads record entry versions, writes are
/// buffered, and commit acquires all touched locks, validates the read
/// versions, and applies the buffer. Locks are only ever taken at commit;
/// explicit lock calls are rejected.
pub struct Transaction {
    node: Arc<GridNode>,
    id: CommandInvocationId,
    reads: HashMap<GridValue, u64>,
    writes: Vec<WriteOp>,
}

impl Transaction {
    /// Transactional read with read-your-writes over the buffered ops.
    /// Reads of stored entries record the entry version for commit-time
    /// validation (when the configuration calls for it).
    pub async fn get(
        &mut self,
        key: &GridValue,
    ) -> Result<Option<GridValue>, GridError> {
        let storage_key = self.node.codec().key_to_storage(key)?;

        for op in self.writes.iter().rev() {
            if op.key() != &storage_key {
                continue;
            }
            match op {
                WriteOp::Write { value, .. }
                | WriteOp::Replace { value, .. } => {
                    return self
                        .node
                        .codec()
                        .value_from_storage(Some(value));
                }
                WriteOp::Remove { .. } => return Ok(None),
                _ => break,
            }
        }

        let stored = self.node.stored_entry(&storage_key);
        if self.node.config.mark_reads() {
            let version =
                stored.as_ref().map_or(0, |e| e.metadata.version);
            self.reads.insert(storage_key, version);
        }
        match stored {
            None => Ok(None),
            Some(e) => {
                self.node.codec().value_from_storage(Some(&e.value))
            }
        }
    }

    /// Buffer a write of `value` under `key`.
    pub fn put(
        &mut self,
        key: &GridValue,
        value: &GridValue,
    ) -> Result<(), GridError> {
        self.writes.push(WriteOp::Write {
            key: self.node.codec().key_to_storage(key)?,
            value: self.node.codec().value_to_storage(value)?,
            metadata: Metadata::default(),
            if_absent: false,
        });
        Ok(())
    }

    /// Buffer a removal of `key`.
    pub fn remove(&mut self, key: &GridValue) -> Result<(), GridError> {
        self.writes.push(WriteOp::Remove {
            key: self.node.codec().key_to_storage(key)?,
        });
        Ok(())
    }

    /// Explicit per-key locking is a pessimistic-cache feature; under
    /// optimistic concurrency it is an API misuse.
    pub fn lock(&mut self, _key: &GridValue) -> Result<(), GridError> {
        Err(GridError::InvalidUsage(
            "explicit lock calls are not allowed with optimistic caches"
                .into(),
        ))
    }

    /// Acquire every touched lock in deterministic order, validate read
    /// versions, apply the buffered writes, release. Any failure rolls
    /// the whole transaction back with nothing applied.
    pub async fn commit(self) -> Result<(), GridError> {
        let mut keys: Vec<GridValue> =
            self.writes.iter().map(|op| op.key().clone()).collect();
        keys.sort();
        keys.dedup();

        let mut acquired: Vec<&GridValue> = Vec::new();
        for key in &keys {
            if let Err(e) = self
                .node
                .locks()
                .acquire(key, self.id, self.node.config.lock_timeout())
                .await
            {
                for key in acquired {
                    self.node.locks().release(key, self.id);
                }
                return Err(e);
            }
            acquired.push(key);
        }

        // write-skew validation against the recorded read versions
        if self.node.config.mark_reads() {
            for (key, recorded) in &self.reads {
                let current = self.node.stored_version(key);
                if current != *recorded {
                    for key in &keys {
                        self.node.locks().release(key, self.id);
                    }
                    return Err(GridError::WriteSkew(format!(
                        "{:?} moved from version {} to {}",
                        key, recorded, current
                    )));
                }
            }
        }

        let mut outcome = Ok(());
        for op in self.writes {
            // locks acquired above live on this node; a write routed to a
            // remote primary must still take that primary's per-key lock
            let flags = match self.node.primary_of(op.key()) {
                Ok(primary) if primary == self.node.id => {
                    CommandFlags::empty().with(CommandFlags::SKIP_LOCKING)
                }
                Ok(_) => CommandFlags::empty(),
                Err(e) => {
                    outcome = Err(e);
                    break;
                }
            };
            let cmd = Command {
                op,
                flags,
                topology_id: 0,
                invocation_id: self.id,
            };
            if let Err(e) = self.node.invoke(cmd).await {
                outcome = Err(e);
                break;
            }
        }
        for key in &keys {
            self.node.locks().release(key, self.id);
        }
        outcome
    }

    /// Drop the transaction without applying anything.
    pub fn rollback(self) {}
}

#[cfg(test)]
mod cache_tests {
    use super::*;

    fn fresh_cache() -> Result<Cache, GridError> {
        Ok(Cache::new(GridNode::standalone(None)?))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn save_get_delete_round_trip() -> Result<(), GridError> {
        let cache = fresh_cache()?;
        let key = GridValue::text("animal");
        assert_eq!(cache.get(&key).await?, None);

        let prev = cache.save(&key, &GridValue::text("raccoon")).await?;
        assert_eq!(prev, None);
        assert_eq!(
            cache.get(&key).await?,
            Some(GridValue::text("raccoon"))
        );

        let prev = cache.delete(&key).await?;
        assert_eq!(prev, Some(GridValue::text("raccoon")));
        assert_eq!(cache.get(&key).await?, None);
        assert_eq!(cache.estimate_size(), 0);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn insert_applies_only_once() -> Result<(), GridError> {
        let cache = fresh_cache()?;
        let key = GridValue::text("k");
        assert!(cache.insert(&key, &GridValue::text("v1")).await?);
        assert!(!cache.insert(&key, &GridValue::text("v2")).await?);
        assert_eq!(cache.get(&key).await?, Some(GridValue::text("v1")));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn replace_checks_expected() -> Result<(), GridError> {
        let cache = fresh_cache()?;
        let key = GridValue::text("k");
        // replace on an absent key does nothing
        assert!(
            !cache.replace(&key, None, &GridValue::text("v1")).await?
        );

        cache.save(&key, &GridValue::text("v1")).await?;
        assert!(!cache
            .replace(
                &key,
                Some(&GridValue::text("other")),
                &GridValue::text("v2")
            )
            .await?);
        assert!(cache
            .replace(
                &key,
                Some(&GridValue::text("v1")),
                &GridValue::text("v2")
            )
            .await?);
        assert_eq!(cache.get(&key).await?, Some(GridValue::text("v2")));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn merge_combines_and_removes() -> Result<(), GridError> {
        let cache = fresh_cache()?;
        let key = GridValue::text("k");
        let concat = NamedMergeFn::new("concat", |old, new| {
            match (old, new) {
                (GridValue::Wrapped(a), GridValue::Wrapped(b)) => {
                    let mut joined = a.to_vec();
                    joined.extend_from_slice(b);
                    Some(GridValue::Wrapped(joined.into()))
                }
                _ => Some(new.clone()),
            }
        });

        let current = cache
            .merge(&key, &GridValue::text("ab"), concat.clone())
            .await?;
        assert_eq!(current, Some(GridValue::text("ab")));
        let current = cache
            .merge(&key, &GridValue::text("cd"), concat)
            .await?;
        assert_eq!(current, Some(GridValue::text("abcd")));

        let tombstone = NamedMergeFn::new("tombstone", |_, _| None);
        let current = cache
            .merge(&key, &GridValue::text("x"), tombstone)
            .await?;
        assert_eq!(current, None);
        assert_eq!(cache.get(&key).await?, None);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn remove_expired_matches_seen_value() -> Result<(), GridError> {
        let cache = fresh_cache()?;
        let key = GridValue::text("k");
        cache.save(&key, &GridValue::text("v2")).await?;
        // the reaper saw a value that has since been overwritten
        assert!(
            !cache.remove_expired(&key, &GridValue::text("v1")).await?
        );
        assert!(
            cache.remove_expired(&key, &GridValue::text("v2")).await?
        );
        assert_eq!(cache.get(&key).await?, None);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn size_counts_distinct_saves() -> Result<(), GridError> {
        let cache = fresh_cache()?;
        for i in 0..10 {
            cache
                .save(
                    &GridValue::text(format!("key-{}", i)),
                    &GridValue::text("v"),
                )
                .await?;
        }
        assert_eq!(cache.estimate_size(), 10);
        // overwrites do not grow the store
        cache
            .save(&GridValue::text("key-3"), &GridValue::text("v2"))
            .await?;
        assert_eq!(cache.estimate_size(), 10);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn transaction_commit_applies_buffer() -> Result<(), GridError> {
        let cache = fresh_cache()?;
        let k1 = GridValue::text("k1");
        let k2 = GridValue::text("k2");
        cache.save(&k2, &GridValue::text("old")).await?;

        let mut tx = cache.begin();
        tx.put(&k1, &GridValue::text("v1"))?;
        tx.remove(&k2)?;
        // read-your-writes before commit; nothing visible outside yet
        assert_eq!(tx.get(&k1).await?, Some(GridValue::text("v1")));
        assert_eq!(cache.get(&k1).await?, None);

        tx.commit().await?;
        assert_eq!(cache.get(&k1).await?, Some(GridValue::text("v1")));
        assert_eq!(cache.get(&k2).await?, None);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn write_skew_is_detected_at_commit() -> Result<(), GridError> {
        let cache = fresh_cache()?;
        let key = GridValue::text("balance");
        cache.save(&key, &GridValue::text("100")).await?;

        let mut tx = cache.begin();
        assert_eq!(tx.get(&key).await?, Some(GridValue::text("100")));

        // a concurrent writer moves the entry under the transaction
        cache.save(&key, &GridValue::text("50")).await?;

        tx.put(&key, &GridValue::text("0"))?;
        match tx.commit().await {
            Err(GridError::WriteSkew(_)) => {}
            other => panic!("expected write skew, got {:?}", other),
        }
        // nothing from the rolled-back transaction is visible
        assert_eq!(cache.get(&key).await?, Some(GridValue::text("50")));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn explicit_lock_is_invalid_usage() -> Result<(), GridError> {
        let cache = fresh_cache()?;
        let mut tx = cache.begin();
        match tx.lock(&GridValue::text("k")) {
            Err(GridError::InvalidUsage(_)) => {}
            other => panic!("expected invalid usage, got {:?}", other),
        }
        tx.rollback();
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn replicated_commit_locks_on_the_primary(
    ) -> Result<(), GridError> {
        use crate::grid::topology::LocalCluster;
        use std::time::Duration;

        let cluster = LocalCluster::new(
            2,
            1,
            Some("cache_mode = 'repl'\nlock_timeout_ms = 200"),
        )?;
        let cache = Cache::new(cluster.node(0));

        // a key whose primary is the other node
        let mut found = None;
        for i in 0..64 {
            let key = GridValue::text(format!("k{}", i));
            let skey = cluster.node(0).codec().key_to_storage(&key)?;
            if cluster.primary_of(&skey)? == 1 {
                found = Some((key, skey));
                break;
            }
        }
        let (key, skey) = found
            .ok_or_else(|| GridError::msg("no remote-owned key found"))?;

        // a competing holder on the primary must block the commit there
        let holder = CommandInvocationId::generate(1);
        cluster
            .node(1)
            .locks()
            .acquire(&skey, holder, Duration::from_millis(50))
            .await?;

        let mut tx = cache.begin();
        tx.put(&key, &GridValue::text("v"))?;
        assert!(tx.commit().await.is_err());
        assert_eq!(cache.get(&key).await?, None);

        // once the holder releases, the commit lands on the primary
        cluster.node(1).locks().release(&skey, holder);
        let mut tx = cache.begin();
        tx.put(&key, &GridValue::text("v"))?;
        tx.commit().await?;
        assert_eq!(cluster.node(1).stored_version(&skey), 1);
        assert_eq!(cache.get(&key).await?, Some(GridValue::text("v")));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unread_transaction_commits_blind() -> Result<(), GridError> {
        let cache = fresh_cache()?;
        let key = GridValue::text("k");
        cache.save(&key, &GridValue::text("v1")).await?;

        // no reads recorded, so a concurrent bump cannot skew it
        let mut tx = cache.begin();
        tx.put(&key, &GridValue::text("v2"))?;
        cache.save(&key, &GridValue::text("v1.5")).await?;
        tx.commit().await?;
        assert_eq!(cache.get(&key).await?, Some(GridValue::text("v2")));
        Ok(())
    }
}
