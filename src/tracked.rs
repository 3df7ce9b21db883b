use parking_lot::Mutex;
use std::fmt;
use std::ops::Deref;

type Callback = Box<dyn FnOnce() + Send>;

/// A value that announces its own destruction.
///
/// `Arc<Tracked<V>>` behaves like `Arc<V>`, but callbacks registered through
/// [`on_drop`](Tracked::on_drop) run once the value is destroyed, which for a shared value is
/// when its last strong reference goes away. [`GrowableCache`](crate::GrowableCache) uses this to
/// free a slot as soon as its value dies instead of waiting for a lookup to stumble over it.
///
/// Callbacks run exactly once, in registration order, on whichever thread drops the value.
///
/// # Examples
///
/// ```
/// use std::sync::atomic::{AtomicBool, Ordering};
/// use std::sync::Arc;
/// use weak_cache::Tracked;
///
/// static DROPPED: AtomicBool = AtomicBool::new(false);
///
/// let value = Arc::new(Tracked::new(5));
/// value.on_drop(|| DROPPED.store(true, Ordering::SeqCst));
/// assert_eq!(**value, 5);
///
/// drop(value);
/// assert!(DROPPED.load(Ordering::SeqCst));
/// ```
pub struct Tracked<V> {
    value: V,
    on_drop: Mutex<Vec<Callback>>,
}

impl<V> Tracked<V> {
    /// Wraps `value` with no callbacks registered.
    pub fn new(value: V) -> Self {
        Self {
            value,
            on_drop: Mutex::new(Vec::new()),
        }
    }

    /// Registers `f` to run when this value is destroyed.
    pub fn on_drop<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.on_drop.lock().push(Box::new(f));
    }

    pub(crate) fn pending_callbacks(&self) -> usize {
        self.on_drop.lock().len()
    }
}

impl<V> Deref for Tracked<V> {
    type Target = V;

    fn deref(&self) -> &V {
        &self.value
    }
}

impl<V> AsRef<V> for Tracked<V> {
    fn as_ref(&self) -> &V {
        &self.value
    }
}

impl<V> From<V> for Tracked<V> {
    fn from(value: V) -> Self {
        Self::new(value)
    }
}

impl<V> Drop for Tracked<V> {
    fn drop(&mut self) {
        for callback in self.on_drop.get_mut().drain(..) {
            callback();
        }
    }
}

impl<V> fmt::Debug for Tracked<V>
where
    V: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tracked")
            .field("value", &self.value)
            .field("callbacks", &self.pending_callbacks())
            .finish()
    }
}
