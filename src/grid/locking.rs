//! Per-key lock table with FIFO handoff. Waiters park on a oneshot
//! channel; release transfers ownership to the first live waiter directly,
//! so a released lock is never observably free while someone queues.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use crate::grid::command::CommandInvocationId;
use crate::grid::encoding::GridValue;
use crate::utils::GridError;

use tokio::sync::oneshot;
use tokio::time;

struct KeyLock {
    owner: CommandInvocationId,
    waiters: VecDeque<(CommandInvocationId, oneshot::Sender<()>)>,
}

/// One node's lock table. Keys lock independently; acquisition by the same
/// invocation id is reentrant.
#[derive(Default)]
pub struct LockTable {
    locks: Mutex<HashMap<GridValue, KeyLock>>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock on `key` for `owner`, waiting up to `timeout`.
    pub async fn acquire(
        &self,
        key: &GridValue,
        owner: CommandInvocationId,
        timeout: Duration,
    ) -> Result<(), GridError> {
        let rx = {
            let mut locks =
                self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            match locks.get_mut(key) {
                None => {
                    locks.insert(
                        key.clone(),
                        KeyLock {
                            owner,
                            waiters: VecDeque::new(),
                        },
                    );
                    return Ok(());
                }
                Some(kl) if kl.owner == owner => return Ok(()),
                Some(kl) => {
                    let (tx, rx) = oneshot::channel();
                    kl.waiters.push_back((owner, tx));
                    rx
                }
            }
        };

        match time::timeout(timeout, rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) | Err(_) => {
                self.abandon_wait(key, owner);
                Err(GridError::Msg(format!(
                    "lock on {:?} not acquired within {:?}",
                    key, timeout
                )))
            }
        }
    }

    /// Release the lock on `key` if `owner` holds it, handing ownership to
    /// the first waiter still listening. A release by a non-owner is a
    /// no-op.
    pub fn release(&self, key: &GridValue, owner: CommandInvocationId) {
        let mut locks =
            self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(kl) = locks.get_mut(key) else {
            return;
        };
        if kl.owner != owner {
            return;
        }
        while let Some((next, tx)) = kl.waiters.pop_front() {
            kl.owner = next;
            if tx.send(()).is_ok() {
                return;
            }
            // receiver gave up between enqueue and handoff; skip it
        }
        locks.remove(key);
    }

    /// Whether `owner` currently holds the lock on `key`.
    pub fn holds(&self, key: &GridValue, owner: CommandInvocationId) -> bool {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .map(|kl| kl.owner == owner)
            .unwrap_or(false)
    }

    /// Back out of a wait after a timeout. If the handoff raced the timeout
    /// and this owner already got the lock, pass it right along.
    fn abandon_wait(&self, key: &GridValue, owner: CommandInvocationId) {
        let handed_over = {
            let mut locks =
                self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            match locks.get_mut(key) {
                None => false,
                Some(kl) if kl.owner == owner => true,
                Some(kl) => {
                    kl.waiters.retain(|(w, _)| *w != owner);
                    false
                }
            }
        };
        if handed_over {
            self.release(key, owner);
        }
    }
}
