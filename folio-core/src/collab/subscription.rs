//! Explicit subscribe/unsubscribe handles for model observers.

use std::sync::{Arc, Mutex, MutexGuard, Weak};

/// Ordered list of callbacks keyed by subscription id.
pub(crate) struct Registry<F: ?Sized> {
    inner: Arc<Mutex<RegistryInner<F>>>,
}

struct RegistryInner<F: ?Sized> {
    next_id: u64,
    entries: Vec<(u64, Arc<F>)>,
}

impl<F: ?Sized + Send + Sync + 'static> Registry<F> {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(RegistryInner {
                next_id: 0,
                entries: Vec::new(),
            })),
        }
    }

    pub(crate) fn add(&self, callback: Arc<F>) -> Subscription {
        let id = {
            let mut inner = lock(&self.inner);
            let id = inner.next_id;
            inner.next_id += 1;
            inner.entries.push((id, callback));
            id
        };
        let weak: Weak<Mutex<RegistryInner<F>>> = Arc::downgrade(&self.inner);
        Subscription {
            detach: Some(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    lock(&inner).entries.retain(|(entry, _)| *entry != id);
                }
            })),
        }
    }

    /// Callbacks in registration order. Cloned so they run without the lock held.
    pub(crate) fn snapshot(&self) -> Vec<Arc<F>> {
        lock(&self.inner)
            .entries
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        lock(&self.inner).entries.len()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Handle returned by `subscribe`. The callback stays registered until this
/// handle is dropped or [`Subscription::unsubscribe`] is called.
#[must_use = "dropping a Subscription detaches the callback"]
pub struct Subscription {
    detach: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("attached", &self.detach.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_drop_detaches() {
        let registry: Registry<dyn Fn() + Send + Sync> = Registry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let sub = registry.add(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        for cb in registry.snapshot() {
            cb();
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        drop(sub);
        assert_eq!(registry.len(), 0);
        assert!(registry.snapshot().is_empty());
    }

    #[test]
    fn test_unsubscribe_only_removes_own_entry() {
        let registry: Registry<dyn Fn() + Send + Sync> = Registry::new();
        let a = registry.add(Arc::new(|| {}));
        let _b = registry.add(Arc::new(|| {}));
        assert_eq!(registry.len(), 2);
        a.unsubscribe();
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_subscription_outlives_registry() {
        let registry: Registry<dyn Fn() + Send + Sync> = Registry::new();
        let sub = registry.add(Arc::new(|| {}));
        drop(registry);
        drop(sub);
    }
}
