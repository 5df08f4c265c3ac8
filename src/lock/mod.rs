//! Clustered lock derived from the grid: the lock state lives in a cache
//! entry and every transition goes through read-write entry functions, so
//! mutual exclusion holds across every node that sees the entry. Waiters
//! queue locally and are woken by the entry's released-state change event.

mod functions;

pub use functions::{ClusteredLockValue, LockState};

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::cache::Cache;
use crate::functional::ReadWriteMap;
use crate::grid::encoding::GridValue;
use crate::grid::entry::{EventKind, Notifier, Subscription};
use crate::grid::node::GridNode;
use crate::utils::{GridError, Timer};

use functions::{
    force_release_function, is_locked_by_function, is_locked_function,
    lock_function, unlock_function,
};
use tokio::sync::oneshot;

fn lock_key(name: &str) -> GridValue {
    GridValue::text(format!("lock#{}", name))
}

fn new_request_id() -> String {
    format!("req-{:016x}", rand::random::<u64>())
}

fn protocol_err(name: &str) -> GridError {
    GridError::ClusteredLock(format!(
        "lock '{}' has a corrupt stored state",
        name
    ))
}

/// One waiting acquire attempt. Completes exactly once: with the acquire
/// outcome, with `false` on timeout, or with an error.
struct TryLockRequest {
    request_id: String,
    tx: Mutex<Option<oneshot::Sender<Result<bool, GridError>>>>,
    scheduled: AtomicBool,
}

impl TryLockRequest {
    fn new(tx: oneshot::Sender<Result<bool, GridError>>) -> Arc<Self> {
        Arc::new(TryLockRequest {
            request_id: new_request_id(),
            tx: Mutex::new(Some(tx)),
            scheduled: AtomicBool::new(false),
        })
    }

    fn is_done(&self) -> bool {
        self.tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    fn complete(&self, result: Result<bool, GridError>) {
        if let Some(tx) = self
            .tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            let _ = tx.send(result);
        }
    }

    /// Arm the timeout once; later calls are no-ops.
    fn ensure_scheduled(self: &Arc<Self>, timeout: Duration) {
        if self.scheduled.swap(true, Ordering::AcqRel) {
            return;
        }
        let request = self.clone();
        tokio::spawn(async move {
            let mut timer = Timer::new();
            if timer.restart(timeout).is_ok() {
                timer.timeout().await;
            }
            request.complete(Ok(false));
        });
    }
}

/// Handle to one named clustered lock.
pub struct ClusteredLock {
    name: String,
    /// Storage-form key of the lock entry; also the event filter key.
    key: GridValue,
    /// This holder's identity, stored into the lock value on acquire.
    owner: String,
    rw: ReadWriteMap,
    pending: Mutex<VecDeque<Arc<TryLockRequest>>>,
    subscription: Mutex<Option<Subscription>>,
}

impl ClusteredLock {
    fn new(
        name: String,
        owner: String,
        rw: ReadWriteMap,
        notifier: Arc<Notifier>,
    ) -> Result<Arc<Self>, GridError> {
        let key = rw.node().codec().key_to_storage(&lock_key(&name))?;
        let lock = Arc::new(ClusteredLock {
            name,
            key: key.clone(),
            owner,
            rw,
            pending: Mutex::new(VecDeque::new()),
            subscription: Mutex::new(None),
        });

        // wake the local waiter queue whenever the entry transitions into
        // the released state, wherever in the cluster that happened
        let weak = Arc::downgrade(&lock);
        let sub = notifier.subscribe(
            move |ev| {
                ev.kind == EventKind::Modified
                    && ev.key == key
                    && ev
                        .value
                        .as_ref()
                        .and_then(|v| ClusteredLockValue::decode(v).ok())
                        .map(|v| v.state == LockState::Released)
                        .unwrap_or(false)
            },
            move |_| {
                if let Some(lock) = weak.upgrade() {
                    tokio::spawn(async move {
                        lock.retry_next().await;
                    });
                }
            },
        );
        *lock
            .subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(sub);
        Ok(lock)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Single acquire attempt; never waits.
    pub async fn try_lock(&self) -> Result<bool, GridError> {
        let f = lock_function(new_request_id(), self.owner.clone());
        self.rewrap(self.rw.eval(&self.key, f).await)
    }

    /// Acquire attempt that waits up to `timeout`, woken by released-state
    /// changes of the lock entry.
    pub async fn try_lock_timeout(
        self: &Arc<Self>,
        timeout: Duration,
    ) -> Result<bool, GridError> {
        if timeout.is_zero() {
            return self.try_lock().await;
        }
        let (tx, rx) = oneshot::channel();
        let request = TryLockRequest::new(tx);
        request.ensure_scheduled(timeout);
        // queue before the attempt so a release racing the attempt still
        // finds this request
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(request.clone());
        self.attempt(&request).await;
        rx.await?
    }

    /// Release the lock if this handle's identity holds it; anyone else's
    /// release is a no-op.
    pub async fn unlock(&self) -> Result<(), GridError> {
        let f = unlock_function(self.owner.clone());
        self.rewrap(self.rw.eval(&self.key, f).await)
    }

    pub async fn is_locked(&self) -> Result<bool, GridError> {
        self.rewrap(self.rw.eval(&self.key, is_locked_function()).await)
    }

    pub async fn is_locked_by_me(&self) -> Result<bool, GridError> {
        let f = is_locked_by_function(self.owner.clone());
        self.rewrap(self.rw.eval(&self.key, f).await)
    }

    fn rewrap<T>(
        &self,
        result: Result<Option<T>, GridError>,
    ) -> Result<T, GridError> {
        match result {
            Ok(Some(v)) => Ok(v),
            Ok(None) => Err(protocol_err(&self.name)),
            Err(e) => Err(GridError::ClusteredLock(format!(
                "lock '{}': {}",
                self.name, e
            ))),
        }
    }

    /// Run one acquire attempt for a queued request. A lost attempt stays
    /// queued for the next release wake-up.
    async fn attempt(&self, request: &Arc<TryLockRequest>) {
        let f = lock_function(
            request.request_id.clone(),
            self.owner.clone(),
        );
        match self.rw.eval(&self.key, f).await {
            Ok(Some(true)) => {
                request.complete(Ok(true));
                self.prune();
            }
            Ok(Some(false)) => {}
            Ok(None) => {
                request.complete(Err(protocol_err(&self.name)));
                self.prune();
            }
            Err(e) => {
                request.complete(Err(GridError::ClusteredLock(format!(
                    "lock '{}': {}",
                    self.name, e
                ))));
                self.prune();
            }
        }
    }

    /// Release wake-up: hand the lock to the first still-live waiter.
    async fn retry_next(self: &Arc<Self>) {
        loop {
            let request = {
                let mut pending = self
                    .pending
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                pending.retain(|r| !r.is_done());
                pending.front().cloned()
            };
            let Some(request) = request else {
                return;
            };
            self.attempt(&request).await;
            if !request.is_done() {
                // lock is held again; wait for the next release
                return;
            }
            // the request resolved (won or failed); give the next waiter
            // a chance only if the lock is actually free again
            if matches!(self.is_locked().await, Ok(true)) {
                return;
            }
        }
    }

    fn prune(&self) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|r| !r.is_done());
    }
}

impl Drop for ClusteredLock {
    fn drop(&mut self) {
        if let Some(sub) = self
            .subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            sub.cancel();
        }
    }
}

/// Per-node factory and registry of clustered locks. Each manager carries
/// its own holder identity, so two managers contend even on the same node.
pub struct ClusteredLockManager {
    cache: Cache,
    owner: String,
    locks: Mutex<HashMap<String, Arc<ClusteredLock>>>,
}

impl ClusteredLockManager {
    pub fn new(node: Arc<GridNode>) -> Self {
        let owner =
            format!("holder-{}-{:08x}", node.id, rand::random::<u32>());
        ClusteredLockManager {
            cache: Cache::new(node),
            owner,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Create (or look up) the named lock, installing its free state into
    /// the grid if the entry does not exist yet.
    pub async fn define_lock(
        &self,
        name: &str,
    ) -> Result<Arc<ClusteredLock>, GridError> {
        if let Some(lock) = self
            .locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
        {
            return Ok(lock.clone());
        }

        let node = self.cache.node().clone();
        let rw = ReadWriteMap::new(node.clone());
        let free = ClusteredLockValue::free().encode()?;
        rw.eval(&lock_key(name), move |view| {
            if view.find().is_none() {
                view.set(free.clone());
            }
        })
        .await?;

        let lock = ClusteredLock::new(
            name.to_string(),
            self.owner.clone(),
            rw,
            node.notifier(),
        )?;
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), lock.clone());
        Ok(lock)
    }

    pub fn get(&self, name: &str) -> Option<Arc<ClusteredLock>> {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Administrative release regardless of holder; returns whether a
    /// held lock was freed.
    pub async fn force_release(
        &self,
        name: &str,
    ) -> Result<bool, GridError> {
        let rw = ReadWriteMap::new(self.cache.node().clone());
        match rw.eval(&lock_key(name), force_release_function()).await {
            Ok(Some(freed)) => Ok(freed),
            Ok(None) => Err(protocol_err(name)),
            Err(e) => Err(GridError::ClusteredLock(format!(
                "lock '{}': {}",
                name, e
            ))),
        }
    }
}
