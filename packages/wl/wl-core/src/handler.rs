//! Listener lists for fanning decoded events out to application code.
//!
//! A protocol object embeds one [`Listeners`] per event type and calls
//! [`Listeners::emit`] after decoding. Application code attaches closures,
//! either permanently ([`Listeners::add`]), for a single event
//! ([`Listeners::once`]), or as a channel ([`Listeners::subscribe`]).
//!
//! ```
//! use std::sync::{Arc, atomic::{AtomicU32, Ordering}};
//! use wl_core::handler::Listeners;
//!
//! let done = Listeners::<u32>::new();
//! let seen = Arc::new(AtomicU32::new(0));
//! let seen_by_listener = seen.clone();
//! done.once(move |serial| seen_by_listener.store(*serial, Ordering::SeqCst));
//!
//! assert_eq!(done.emit(&7), 1);
//! assert_eq!(done.emit(&8), 0);
//! assert_eq!(seen.load(Ordering::SeqCst), 7);
//! ```

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

type Callback<E> = Arc<Mutex<dyn FnMut(&E) + Send>>;

/// Identifies a listener so that it can be removed again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

struct Listener<E> {
    id: ListenerId,
    once: bool,
    callback: Callback<E>,
}

impl<E> Clone for Listener<E> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            once: self.once,
            callback: self.callback.clone(),
        }
    }
}

struct ListenersInner<E> {
    next_id: u64,
    listeners: Vec<Listener<E>>,
}

/// A thread-safe list of callbacks for events of type `E`.
///
/// Callbacks run on the thread that calls [`emit`](Self::emit) and without
/// the list locked, so a callback may add or remove listeners (including on
/// the same list). Changes made during an emission apply from the next one.
pub struct Listeners<E> {
    inner: Mutex<ListenersInner<E>>,
}

impl<E> Listeners<E> {
    /// Creates an empty listener list.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(ListenersInner {
                next_id: 0,
                listeners: Vec::new(),
            }),
        }
    }

    fn insert(&self, once: bool, callback: Callback<E>) -> ListenerId {
        let mut inner = self.inner.lock();
        let id = ListenerId(inner.next_id);
        inner.next_id += 1;
        inner.listeners.push(Listener { id, once, callback });
        id
    }

    /// Adds a listener that is called for every emitted event.
    pub fn add(&self, callback: impl FnMut(&E) + Send + 'static) -> ListenerId {
        self.insert(false, Arc::new(Mutex::new(callback)))
    }

    /// Adds a listener that is called for the next emitted event only.
    pub fn once(&self, callback: impl FnOnce(&E) + Send + 'static) -> ListenerId {
        let mut callback = Some(callback);
        self.insert(
            true,
            Arc::new(Mutex::new(move |event: &E| {
                if let Some(callback) = callback.take() {
                    callback(event);
                }
            })),
        )
    }

    /// Removes a listener. Returns `false` if it was already gone.
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.listeners.len();
        inner.listeners.retain(|listener| listener.id != id);
        inner.listeners.len() != before
    }

    /// Calls every listener with `event` and returns how many were called.
    ///
    /// Single-shot listeners are removed before they run.
    pub fn emit(&self, event: &E) -> usize {
        let snapshot = {
            let mut inner = self.inner.lock();
            let snapshot = inner.listeners.clone();
            inner.listeners.retain(|listener| !listener.once);
            snapshot
        };

        for listener in &snapshot {
            let mut callback = listener.callback.lock();
            (*callback)(event);
        }
        snapshot.len()
    }

    /// Returns the number of attached listeners.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().listeners.len()
    }

    /// Returns `true` if no listeners are attached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<E: Clone + Send + 'static> Listeners<E> {
    /// Forwards every emitted event into a channel.
    ///
    /// The listener stays attached after the receiver is dropped; remove it
    /// with the returned id.
    pub fn subscribe(&self) -> (ListenerId, mpsc::UnboundedReceiver<E>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let id = self.add(move |event: &E| {
            drop(sender.send(event.clone()));
        });
        (id, receiver)
    }
}

impl<E> Default for Listeners<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> std::fmt::Debug for Listeners<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listeners")
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use super::Listeners;

    #[test]
    fn multi_shot_listeners_see_every_event() {
        let listeners = Listeners::<u32>::new();
        let total = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let total = total.clone();
            listeners.add(move |value| {
                total.fetch_add(*value as usize, Ordering::SeqCst);
            });
        }

        assert_eq!(listeners.emit(&2), 3);
        assert_eq!(listeners.emit(&1), 3);
        assert_eq!(total.load(Ordering::SeqCst), 9);
    }

    #[test]
    fn once_and_remove() {
        let listeners = Listeners::<()>::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = calls.clone();
        listeners.once(move |()| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let counter = calls.clone();
        let id = listeners.add(move |()| {
            counter.fetch_add(10, Ordering::SeqCst);
        });
        assert_eq!(listeners.len(), 2);

        listeners.emit(&());
        assert_eq!(calls.load(Ordering::SeqCst), 11);
        assert_eq!(listeners.len(), 1);

        assert!(listeners.remove(id));
        assert!(!listeners.remove(id));
        assert!(listeners.is_empty());
        assert_eq!(listeners.emit(&()), 0);
    }

    #[test]
    fn callbacks_may_modify_their_own_list() {
        let listeners = Arc::new(Listeners::<u8>::new());
        let inner = listeners.clone();
        listeners.once(move |_| {
            inner.add(|_| {});
        });

        assert_eq!(listeners.emit(&0), 1);
        assert_eq!(listeners.len(), 1);
    }

    #[tokio::test]
    async fn subscribe_forwards_clones() {
        let listeners = Listeners::<String>::new();
        let (id, mut receiver) = listeners.subscribe();

        listeners.emit(&"wl_seat".to_string());
        listeners.emit(&"wl_output".to_string());
        assert_eq!(receiver.recv().await.as_deref(), Some("wl_seat"));
        assert_eq!(receiver.recv().await.as_deref(), Some("wl_output"));

        assert!(listeners.remove(id));
        drop(listeners);
        assert_eq!(receiver.recv().await, None);
    }
}
