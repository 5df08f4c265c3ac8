//! Entries, metadata, per-invocation entry views, the in-memory data
//! container, and the notification sink with its subscription interface.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use crate::grid::encoding::GridValue;

use serde::{Deserialize, Serialize};

/// Version stamp plus expiration policy attached to every stored entry.
///
/// Version 0 is reserved for "never stored"; the container bumps the version
/// on every committed mutation.
#[derive(
    Debug, PartialEq, Eq, Clone, Default, Serialize, Deserialize,
)]
pub struct Metadata {
    pub version: u64,
    pub lifespan: Option<Duration>,
    pub max_idle: Option<Duration>,
}

/// One stored key's value and metadata.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct GridEntry {
    pub value: GridValue,
    pub metadata: Metadata,
}

/// Mutable per-invocation view of one entry. Commands mutate the view; the
/// pipeline commits it back to the container at the end of a successful
/// pass and then discards it.
#[derive(Debug, Clone)]
pub struct EntryView {
    pub key: GridValue,
    pub value: Option<GridValue>,
    pub metadata: Metadata,

    // internal flags valid for one pipeline pass only
    pub created: bool,
    pub changed: bool,
    pub removed: bool,
    pub expired: bool,
}

impl EntryView {
    /// Materialize a view of the given key from its stored entry (or of an
    /// absent entry).
    pub fn wrap(key: GridValue, existing: Option<&GridEntry>) -> Self {
        EntryView {
            key,
            value: existing.map(|e| e.value.clone()),
            metadata: existing.map(|e| e.metadata.clone()).unwrap_or_default(),
            created: false,
            changed: false,
            removed: false,
            expired: false,
        }
    }

    /// Install a new value into the view.
    pub fn set_value(&mut self, value: GridValue) {
        if self.value.is_none() || self.removed {
            self.created = true;
            self.removed = false;
            self.expired = false;
        }
        self.changed = true;
        self.value = Some(value);
    }

    /// Mark the viewed entry removed.
    pub fn remove_value(&mut self) {
        self.changed = true;
        self.removed = true;
        self.created = false;
        self.value = None;
    }

    /// Whether this pass mutated the entry at all.
    pub fn is_dirty(&self) -> bool {
        self.changed || self.removed
    }
}

/// The in-memory entry store of one node, keyed by storage-form keys.
#[derive(Debug, Default)]
pub struct DataContainer {
    entries: HashMap<GridValue, GridEntry>,
}

impl DataContainer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, key: &GridValue) -> Option<&GridEntry> {
        self.entries.get(key)
    }

    /// Stored version of a key; 0 when absent.
    pub fn version_of(&self, key: &GridValue) -> u64 {
        self.entries.get(key).map_or(0, |e| e.metadata.version)
    }

    /// Snapshot of the current key set. Concurrent inserts after the
    /// snapshot are not reflected.
    pub fn keys(&self) -> Vec<GridValue> {
        self.entries.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Commit a finished entry view back into the container, bumping the
    /// entry version. Views that mutated nothing are a no-op. Returns the
    /// metadata now stored for the key (`None` after a remove).
    pub fn commit(&mut self, view: &EntryView) -> Option<Metadata> {
        if view.removed {
            self.entries.remove(&view.key);
            return None;
        }
        if !view.changed {
            return self.entries.get(&view.key).map(|e| e.metadata.clone());
        }
        let version = self.version_of(&view.key) + 1;
        let metadata = Metadata {
            version,
            ..view.metadata.clone()
        };
        // a changed view without a value would be a remove, handled above
        let Some(value) = view.value.clone() else {
            return None;
        };
        self.entries.insert(
            view.key.clone(),
            GridEntry {
                value,
                metadata: metadata.clone(),
            },
        );
        Some(metadata)
    }
}

/// Entry change event kinds delivered to subscribers.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum EventKind {
    Created,
    Modified,
    Removed,
}

/// One entry change event. Fired before the mutation is applied to the
/// entry view (`pre` is true), mirroring the pipeline's notification order.
#[derive(Debug, Clone)]
pub struct EntryEvent {
    pub kind: EventKind,
    pub key: GridValue,
    pub value: Option<GridValue>,
    pub metadata: Metadata,
    pub pre: bool,
}

type EventFilter = Arc<dyn Fn(&EntryEvent) -> bool + Send + Sync>;
type EventCallback = Arc<dyn Fn(&EntryEvent) + Send + Sync>;

/// Notification sink with an explicit subscription interface: subscribers
/// register a predicate and a callback and get back a cancellation handle.
/// Delivery is fire-and-forget; a subscriber cannot abort the write that
/// produced the event.
pub struct Notifier {
    subs: Mutex<HashMap<u64, (EventFilter, EventCallback)>>,
    next_id: AtomicU64,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier {
    pub fn new() -> Self {
        Notifier {
            subs: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a subscriber. Events matching `filter` are handed to
    /// `callback` in the notifying task's context; callbacks must not
    /// block.
    pub fn subscribe(
        self: &Arc<Self>,
        filter: impl Fn(&EntryEvent) -> bool + Send + Sync + 'static,
        callback: impl Fn(&EntryEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::AcqRel);
        self.subs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, (Arc::new(filter), Arc::new(callback)));
        Subscription {
            id,
            notifier: Arc::downgrade(self),
        }
    }

    fn unsubscribe(&self, id: u64) {
        self.subs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }

    /// Deliver an event to all matching subscribers. Callbacks run outside
    /// the subscriber-table lock so they may subscribe or cancel freely.
    pub fn notify(&self, event: &EntryEvent) {
        let matching: Vec<EventCallback> = {
            let subs =
                self.subs.lock().unwrap_or_else(PoisonError::into_inner);
            subs.values()
                .filter(|(f, _)| f(event))
                .map(|(_, cb)| cb.clone())
                .collect()
        };
        for cb in matching {
            cb(event);
        }
    }

    pub fn notify_created(
        &self,
        key: &GridValue,
        value: &GridValue,
        metadata: &Metadata,
    ) {
        self.notify(&EntryEvent {
            kind: EventKind::Created,
            key: key.clone(),
            value: Some(value.clone()),
            metadata: metadata.clone(),
            pre: true,
        });
    }

    pub fn notify_modified(
        &self,
        key: &GridValue,
        value: &GridValue,
        metadata: &Metadata,
    ) {
        self.notify(&EntryEvent {
            kind: EventKind::Modified,
            key: key.clone(),
            value: Some(value.clone()),
            metadata: metadata.clone(),
            pre: true,
        });
    }

    pub fn notify_removed(
        &self,
        key: &GridValue,
        old_value: Option<&GridValue>,
        metadata: &Metadata,
    ) {
        self.notify(&EntryEvent {
            kind: EventKind::Removed,
            key: key.clone(),
            value: old_value.cloned(),
            metadata: metadata.clone(),
            pre: true,
        });
    }
}

/// Cancellation handle returned by `Notifier::subscribe`.
pub struct Subscription {
    id: u64,
    notifier: Weak<Notifier>,
}

impl Subscription {
    pub fn cancel(&self) {
        if let Some(notifier) = self.notifier.upgrade() {
            notifier.unsubscribe(self.id);
        }
    }
}

#[cfg(test)]
mod entry_tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn stored(v: &str, version: u64) -> GridEntry {
        GridEntry {
            value: GridValue::text(v),
            metadata: Metadata {
                version,
                ..Default::default()
            },
        }
    }

    #[test]
    fn view_set_and_remove_flags() {
        let mut view = EntryView::wrap(GridValue::text("k"), None);
        assert!(!view.is_dirty());
        view.set_value(GridValue::text("v"));
        assert!(view.created && view.changed && !view.removed);
        view.remove_value();
        assert!(view.removed && view.value.is_none());
    }

    #[test]
    fn commit_bumps_version() {
        let mut container = DataContainer::new();
        let key = GridValue::text("k");
        let mut view = EntryView::wrap(key.clone(), None);
        view.set_value(GridValue::text("v1"));
        let meta = container.commit(&view).unwrap();
        assert_eq!(meta.version, 1);

        let mut view =
            EntryView::wrap(key.clone(), container.lookup(&key));
        view.set_value(GridValue::text("v2"));
        let meta = container.commit(&view).unwrap();
        assert_eq!(meta.version, 2);
        assert_eq!(container.lookup(&key).unwrap().value, GridValue::text("v2"));
    }

    #[test]
    fn commit_remove_drops_entry() {
        let mut container = DataContainer::new();
        let key = GridValue::text("k");
        let mut view = EntryView::wrap(key.clone(), Some(&stored("v", 3)));
        view.remove_value();
        assert!(container.commit(&view).is_none());
        assert!(container.lookup(&key).is_none());
        assert_eq!(container.version_of(&key), 0);
    }

    #[test]
    fn subscription_filters_and_cancels() {
        let notifier = Arc::new(Notifier::new());
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_cb = hits.clone();
        let sub = notifier.subscribe(
            |ev| ev.kind == EventKind::Removed,
            move |_| {
                hits_cb.fetch_add(1, Ordering::SeqCst);
            },
        );

        let key = GridValue::text("k");
        let meta = Metadata::default();
        notifier.notify_created(&key, &GridValue::text("v"), &meta);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        notifier.notify_removed(&key, None, &meta);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        sub.cancel();
        notifier.notify_removed(&key, None, &meta);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
