//! Publish/subscribe for values observed by the rendering layer and chat.
//!
//! An [`Observable`] holds the current value and a list of callbacks. Every
//! [`Observable::publish`] stores the new value and invokes the callbacks
//! synchronously, in registration order. Dropping the returned
//! [`Subscription`] unregisters the callback.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::sync::mpsc;

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Inner<T> {
    value: Mutex<T>,
    observers: Mutex<Vec<(u64, Callback<T>)>>,
    // Serializes publishers so every observer sees transitions in the same order.
    publishing: Mutex<()>,
    next_id: AtomicU64,
}

fn lock<U>(mutex: &Mutex<U>) -> MutexGuard<'_, U> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A current value plus change notification. Clones share the same value.
pub struct Observable<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Observable<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> Observable<T> {
    pub fn new(initial: T) -> Self {
        Self {
            inner: Arc::new(Inner {
                value: Mutex::new(initial),
                observers: Mutex::new(Vec::new()),
                publishing: Mutex::new(()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// The value most recently published.
    pub fn get(&self) -> T {
        lock(&self.inner.value).clone()
    }

    /// Store `value` and notify every observer. Callbacks must not publish
    /// to the same observable.
    pub fn publish(&self, value: T) {
        let _order = lock(&self.inner.publishing);
        *lock(&self.inner.value) = value.clone();
        let observers: Vec<Callback<T>> = lock(&self.inner.observers)
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();
        for observer in observers {
            observer(&value);
        }
    }

    /// Register a callback invoked on every subsequent publish.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.inner.observers).push((id, Arc::new(callback)));
        let weak: Weak<Inner<T>> = Arc::downgrade(&self.inner);
        Subscription {
            cancel: Some(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    lock(&inner.observers).retain(|(other, _)| *other != id);
                }
            })),
        }
    }

    /// Forward every subsequent publish into an unbounded channel.
    pub fn subscribe_channel(&self) -> (mpsc::UnboundedReceiver<T>, Subscription) {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = self.subscribe(move |value: &T| {
            let _ = tx.send(value.clone());
        });
        (rx, subscription)
    }

    pub fn observer_count(&self) -> usize {
        lock(&self.inner.observers).len()
    }
}

/// Registration handle; the callback is removed when this is dropped.
#[must_use = "dropping a Subscription unregisters the observer"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// Unregister now. Equivalent to dropping the handle.
    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}
