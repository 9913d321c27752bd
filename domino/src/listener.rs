//! Ordered callback registry shared by the queue objects.
//!
//! Listeners are called in registration order. The same closure may be registered more than
//! once, every registration gets its own entry and its own [`ListenerHandle`].
use anyhow::Result;
use log::error;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

/// A listener gets a reference of the dispatched value. An error returned by a listener, or a
/// panic in it, is logged and doesn't stop the other listeners.
pub type ListenerFn<T> = dyn Fn(&T) -> Result<()> + Send + Sync;

type Entries<T> = Vec<(u64, Arc<ListenerFn<T>>)>;

struct Inner<T> {
    next_id: u64,
    entries: Entries<T>,
}

pub(crate) struct Listeners<T> {
    inner: Arc<Mutex<Inner<T>>>,
}

/// Deregistration capability returned when a listener is registered.
///
/// Dropping the handle keeps the listener registered, only [`ListenerHandle::remove`] takes it
/// out.
pub struct ListenerHandle {
    id: u64,
    remover: Weak<dyn Remove + Send + Sync>,
}

trait Remove {
    fn remove(&self, id: u64) -> bool;
}

impl<T> Remove for Mutex<Inner<T>> {
    fn remove(&self, id: u64) -> bool {
        let mut inner = lock(self);
        let before = inner.entries.len();

        inner.entries.retain(|(entry_id, _)| *entry_id != id);

        inner.entries.len() != before
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ListenerHandle {
    /// Remove the listener. Returns `false` if it had been removed already, or the queue object
    /// is gone.
    pub fn remove(&self) -> bool {
        match self.remover.upgrade() {
            Some(remover) => remover.remove(self.id),
            None => false,
        }
    }
}

impl<T: 'static> Listeners<T> {
    pub(crate) fn new() -> Self {
        Listeners {
            inner: Arc::new(Mutex::new(Inner {
                next_id: 0,
                entries: vec![],
            })),
        }
    }

    pub(crate) fn add<F>(&self, callback: F) -> ListenerHandle
    where
        F: Fn(&T) -> Result<()> + Send + Sync + 'static,
    {
        let id = {
            let mut inner = lock(&self.inner);
            let id = inner.next_id;

            inner.next_id += 1;
            inner.entries.push((id, Arc::new(callback)));

            id
        };

        let remover: Arc<dyn Remove + Send + Sync> = self.inner.clone();

        ListenerHandle {
            id,
            remover: Arc::downgrade(&remover),
        }
    }

    pub(crate) fn len(&self) -> usize {
        lock(&self.inner).entries.len()
    }

    /// Call every registered listener with `value` in registration order. The registry is not
    /// locked during the calls, so a listener can remove itself or register others; those
    /// changes take effect from the next dispatch.
    ///
    /// Returns the number of failed listeners.
    pub(crate) fn dispatch(&self, value: &T) -> usize {
        let snapshot: Vec<Arc<ListenerFn<T>>> = lock(&self.inner).entries.iter().map(|(_, f)| f.clone()).collect();
        let mut failed = 0;

        for listener in snapshot {
            match panic::catch_unwind(AssertUnwindSafe(|| listener(value))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!("Listener failed {:?}", e);

                    failed += 1;
                }
                Err(_) => {
                    error!("Listener panicked");

                    failed += 1;
                }
            }
        }

        failed
    }
}
