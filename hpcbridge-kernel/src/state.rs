use arc_swap::ArcSwap;
use std::sync::Arc;

/// A value replaced wholesale and read lock-free.
///
/// Readers get an `Arc` snapshot that stays valid even if a writer publishes
/// a new value right after; nobody ever observes a half-built value.
pub struct Published<T> {
    inner: Arc<ArcSwap<T>>,
}

impl<T> Clone for Published<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T> Published<T> {
    pub fn new(value: T) -> Self {
        Self { inner: Arc::new(ArcSwap::from_pointee(value)) }
    }

    pub fn load(&self) -> Arc<T> {
        self.inner.load_full()
    }

    /// Swap in a new value, returning the previous one.
    pub fn publish(&self, value: T) -> Arc<T> {
        self.inner.swap(Arc::new(value))
    }

    /// Read-copy-update; `f` may run more than once under contention.
    pub fn update<F>(&self, f: F)
    where
        F: Fn(&T) -> T,
    {
        self.inner.rcu(|current| Arc::new(f(current)));
    }
}
