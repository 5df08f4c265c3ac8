//! The clustered lock's stored state machine and the read-write entry
//! functions that advance it. Every function returns `Option`: a missing
//! result means the stored value was not a lock state, which callers
//! surface as a lock-protocol error.

use crate::grid::command::ReadWriteEntryView;
use crate::grid::encoding::GridValue;
use crate::utils::GridError;

use serde::{Deserialize, Serialize};

/// State of one clustered lock.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub enum LockState {
    /// Defined but never acquired.
    Free,
    Acquired,
    /// Released after being held; the transition subscribers wake on.
    Released,
}

/// The value stored under a clustered lock's key.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct ClusteredLockValue {
    pub state: LockState,
    /// Id of the acquire request that got the lock.
    pub request_id: Option<String>,
    /// Identity of the current holder.
    pub owner: Option<String>,
}

impl ClusteredLockValue {
    pub fn free() -> Self {
        ClusteredLockValue {
            state: LockState::Free,
            request_id: None,
            owner: None,
        }
    }

    pub fn encode(&self) -> Result<GridValue, GridError> {
        Ok(GridValue::Wrapped(rmp_serde::to_vec(self)?.into()))
    }

    pub fn decode(v: &GridValue) -> Result<Self, GridError> {
        match v {
            GridValue::Wrapped(b) | GridValue::Blob(b) => {
                Ok(rmp_serde::from_slice(b)?)
            }
            GridValue::Utf8(_) => {
                Err(GridError::msg("lock value stored as text media"))
            }
        }
    }
}

fn current_state(
    view: &ReadWriteEntryView<'_>,
) -> Option<ClusteredLockValue> {
    match view.find() {
        None => Some(ClusteredLockValue::free()),
        Some(v) => ClusteredLockValue::decode(v).ok(),
    }
}

/// Acquire attempt: takes the lock unless it is currently held. Returns
/// whether the attempt won.
pub fn lock_function(
    request_id: String,
    owner: String,
) -> impl Fn(&mut ReadWriteEntryView<'_>) -> Option<bool>
       + Send
       + Sync
       + 'static {
    move |view| {
        let current = current_state(view)?;
        if current.state == LockState::Acquired {
            return Some(false);
        }
        let next = ClusteredLockValue {
            state: LockState::Acquired,
            request_id: Some(request_id.clone()),
            owner: Some(owner.clone()),
        };
        view.set(next.encode().ok()?);
        Some(true)
    }
}

/// Release by the given holder; a release by anyone else is a no-op.
pub fn unlock_function(
    owner: String,
) -> impl Fn(&mut ReadWriteEntryView<'_>) -> Option<()>
       + Send
       + Sync
       + 'static {
    move |view| {
        let current = current_state(view)?;
        if current.state != LockState::Acquired
            || current.owner.as_deref() != Some(owner.as_str())
        {
            return Some(());
        }
        let next = ClusteredLockValue {
            state: LockState::Released,
            request_id: current.request_id,
            owner: None,
        };
        view.set(next.encode().ok()?);
        Some(())
    }
}

/// Administrative release regardless of holder. Returns whether a held
/// lock was actually freed.
pub fn force_release_function(
) -> impl Fn(&mut ReadWriteEntryView<'_>) -> Option<bool>
       + Send
       + Sync
       + 'static {
    move |view| {
        let current = current_state(view)?;
        if current.state != LockState::Acquired {
            return Some(false);
        }
        let next = ClusteredLockValue {
            state: LockState::Released,
            request_id: current.request_id,
            owner: None,
        };
        view.set(next.encode().ok()?);
        Some(true)
    }
}

/// Whether the lock is currently held (by anyone).
pub fn is_locked_function(
) -> impl Fn(&mut ReadWriteEntryView<'_>) -> Option<bool>
       + Send
       + Sync
       + 'static {
    move |view| {
        let current = current_state(view)?;
        Some(current.state == LockState::Acquired)
    }
}

/// Whether the lock is currently held by the given identity.
pub fn is_locked_by_function(
    owner: String,
) -> impl Fn(&mut ReadWriteEntryView<'_>) -> Option<bool>
       + Send
       + Sync
       + 'static {
    move |view| {
        let current = current_state(view)?;
        Some(
            current.state == LockState::Acquired
                && current.owner.as_deref() == Some(owner.as_str()),
        )
    }
}

#[cfg(test)]
mod functions_tests {
    use super::*;

    #[test]
    fn value_round_trip() -> Result<(), GridError> {
        let value = ClusteredLockValue {
            state: LockState::Acquired,
            request_id: Some("req-1".into()),
            owner: Some("node0".into()),
        };
        let decoded = ClusteredLockValue::decode(&value.encode()?)?;
        assert_eq!(decoded, value);
        Ok(())
    }

    #[test]
    fn text_media_is_not_a_lock_value() {
        assert!(
            ClusteredLockValue::decode(&GridValue::text("nope")).is_err()
        );
    }
}
