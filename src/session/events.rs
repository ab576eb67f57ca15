//! Observer hub: synchronous fan-out of session notifications.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crate::webrtc::RemoteParticipant;

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;
type CallbackList<T> = Mutex<Vec<(u64, Callback<T>)>>;

/// Subscriber list for one event.
pub struct Observers<T: ?Sized> {
    next_id: AtomicU64,
    callbacks: Arc<CallbackList<T>>,
}

impl<T: ?Sized + 'static> Default for Observers<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ?Sized + 'static> Observers<T> {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            callbacks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let callback: Callback<T> = Arc::new(callback);
        self.callbacks.lock().push((id, callback));

        let list: Weak<CallbackList<T>> = Arc::downgrade(&self.callbacks);
        Subscription {
            remove: Some(Box::new(move || {
                if let Some(list) = list.upgrade() {
                    list.lock().retain(|(entry, _)| *entry != id);
                }
            })),
        }
    }

    /// Invoke every subscriber in registration order.
    /// The list is snapshotted first so callbacks may subscribe or unsubscribe.
    pub fn emit(&self, value: &T) {
        let snapshot: Vec<Callback<T>> = self
            .callbacks
            .lock()
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();
        for callback in snapshot {
            callback(value);
        }
    }

    pub fn len(&self) -> usize {
        self.callbacks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.callbacks.lock().clear();
    }
}

/// Handle returned on registration. Dropping it keeps the callback registered.
#[must_use = "keep the subscription to be able to unsubscribe"]
pub struct Subscription {
    remove: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// A handle that is attached to nothing
    pub(crate) fn inert() -> Self {
        Self { remove: None }
    }

    pub fn unsubscribe(mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.remove.is_some())
            .finish()
    }
}

/// Every notification a session emits
#[derive(Default)]
pub struct SessionEvents {
    pub participant_added: Observers<RemoteParticipant>,
    pub participant_removed: Observers<str>,
    pub mute_changed: Observers<bool>,
}

impl SessionEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&self) {
        self.participant_added.clear();
        self.participant_removed.clear();
        self.mute_changed.clear();
    }
}
