use std::sync::{Arc, Mutex};

/// Single-producer snapshot cell. The producer swaps in a fresh `Arc`, readers
/// clone the current one; the lock is held only for the pointer copy.
#[derive(Debug)]
pub struct Published<T> {
    slot: Mutex<Arc<T>>,
}

impl<T> Published<T> {
    pub fn new(initial: T) -> Self {
        Self {
            slot: Mutex::new(Arc::new(initial)),
        }
    }

    pub fn publish(&self, value: T) {
        let next = Arc::new(value);
        match self.slot.lock() {
            Ok(mut slot) => *slot = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
    }

    pub fn snapshot(&self) -> Arc<T> {
        match self.slot.lock() {
            Ok(slot) => Arc::clone(&slot),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }
}

impl<T: Clone> Published<T> {
    /// Copy the current value, let `f` edit it, publish the result.
    /// Only the owning producer calls this, so there is no lost update.
    pub fn update(&self, f: impl FnOnce(&mut T)) {
        let mut next = (*self.snapshot()).clone();
        f(&mut next);
        self.publish(next);
    }
}

impl<T: Default> Default for Published<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}
