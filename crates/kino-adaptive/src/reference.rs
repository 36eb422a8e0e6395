//! Observable shared values
//!
//! A [`SharedReference`] holds the latest value of something that changes over
//! time (a playback observation, a bitrate constraint, the last estimate) and
//! lets interested parties either await changes through a `watch` receiver or
//! register synchronous callbacks that live until their cancellation token is
//! cancelled.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

type Callback<T> = Box<dyn FnMut(&T) + Send>;

struct Listener<T> {
    cancel: CancellationToken,
    callback: Arc<Mutex<Callback<T>>>,
}

struct Inner<T> {
    tx: watch::Sender<T>,
    listeners: Mutex<Vec<Listener<T>>>,
}

/// Cloneable handle to an observable value
pub struct SharedReference<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for SharedReference<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for SharedReference<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("SharedReference")
            .field(&*self.inner.tx.borrow())
            .finish()
    }
}

impl<T: Clone + Send + Sync + 'static> SharedReference<T> {
    pub fn new(value: T) -> Self {
        let (tx, _) = watch::channel(value);
        Self {
            inner: Arc::new(Inner {
                tx,
                listeners: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Current value
    pub fn get(&self) -> T {
        self.inner.tx.borrow().clone()
    }

    /// Replace the value and notify every live listener
    pub fn set(&self, value: T) {
        self.inner.tx.send_replace(value.clone());
        self.notify(&value);
    }

    /// Mutate the value in place and notify every live listener
    pub fn update(&self, f: impl FnOnce(&mut T)) {
        let mut value = self.get();
        f(&mut value);
        self.set(value);
    }

    /// Receiver that wakes up on every `set`
    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.inner.tx.subscribe()
    }

    /// Register a callback invoked synchronously on every future `set`, and
    /// immediately with the current value when `emit_current` is true.
    ///
    /// The callback is dropped once `cancel` is cancelled.
    pub fn on_update<F>(&self, callback: F, cancel: CancellationToken, emit_current: bool)
    where
        F: FnMut(&T) + Send + 'static,
    {
        if cancel.is_cancelled() {
            return;
        }
        let callback: Arc<Mutex<Callback<T>>> = Arc::new(Mutex::new(Box::new(callback)));
        if emit_current {
            let current = self.get();
            let mut guard = callback.lock();
            (&mut **guard)(&current);
        }
        self.inner.listeners.lock().push(Listener { cancel, callback });
    }

    /// Number of registered callbacks that have not been cancelled yet
    pub fn listener_count(&self) -> usize {
        self.inner
            .listeners
            .lock()
            .iter()
            .filter(|l| !l.cancel.is_cancelled())
            .count()
    }

    fn notify(&self, value: &T) {
        // Callbacks run without the list lock so that they may register or
        // cancel other listeners.
        let callbacks: Vec<_> = {
            let mut listeners = self.inner.listeners.lock();
            listeners.retain(|l| !l.cancel.is_cancelled());
            listeners
                .iter()
                .map(|l| (l.cancel.clone(), Arc::clone(&l.callback)))
                .collect()
        };
        for (cancel, callback) in callbacks {
            if cancel.is_cancelled() {
                continue;
            }
            // A callback setting the reference it listens to is not re-entered
            if let Some(mut guard) = callback.try_lock() {
                (&mut **guard)(value);
            }
        }
    }
}

impl<T: Clone + PartialEq + Send + Sync + 'static> SharedReference<T> {
    /// Like [`set`](Self::set) but does nothing when the value is unchanged.
    /// Returns whether listeners were notified.
    pub fn set_if_changed(&self, value: T) -> bool {
        if *self.inner.tx.borrow() == value {
            return false;
        }
        self.set(value);
        true
    }
}
