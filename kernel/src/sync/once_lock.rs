//! Write-once global cell for boot-initialized singletons.

use core::sync::atomic::{AtomicPtr, Ordering};

use alloc::boxed::Box;

/// A cell that can be written to only once.
///
/// Used for singletons created during boot (the mounted filesystem, the
/// block device) and read for the rest of the kernel's lifetime. Works in
/// no_std; the stored value is heap-allocated and leaked into `'static`.
pub struct OnceLock<T> {
    inner: AtomicPtr<T>,
}

impl<T> OnceLock<T> {
    pub const fn new() -> Self {
        Self {
            inner: AtomicPtr::new(core::ptr::null_mut()),
        }
    }

    /// Get the value if initialized.
    pub fn get(&self) -> Option<&'static T> {
        let ptr = self.inner.load(Ordering::Acquire);
        if ptr.is_null() {
            None
        } else {
            // SAFETY: a non-null pointer was stored by `set` from
            // `Box::into_raw`, so it points to a live, leaked T. The
            // Acquire load pairs with the Release in `set`, making the
            // pointee's initialization visible.
            Some(unsafe { &*ptr })
        }
    }

    /// Initialize the cell. Returns `Err(value)` if already initialized.
    pub fn set(&self, value: T) -> Result<(), T> {
        let ptr = Box::into_raw(Box::new(value));
        match self.inner.compare_exchange(
            core::ptr::null_mut(),
            ptr,
            Ordering::Release,
            Ordering::Acquire,
        ) {
            Ok(_) => Ok(()),
            Err(_) => {
                // SAFETY: `ptr` came from `Box::into_raw` above and was
                // never published (the exchange failed), so reclaiming it
                // here is the only way to avoid leaking the allocation.
                let boxed = unsafe { Box::from_raw(ptr) };
                Err(*boxed)
            }
        }
    }
}

impl<T> Default for OnceLock<T> {
    fn default() -> Self {
        Self::new()
    }
}

// SAFETY: the inner value is behind an AtomicPtr with acquire/release
// ordering; sending the lock only transfers the (leaked) allocation.
unsafe impl<T: Send> Send for OnceLock<T> {}
// SAFETY: `get` hands out shared references only after the Release store
// in `set`, so concurrent readers observe a fully initialized value.
unsafe impl<T: Send + Sync> Sync for OnceLock<T> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_once() {
        let lock = OnceLock::new();
        assert!(lock.get().is_none());
        assert!(lock.set(7).is_ok());
        assert_eq!(*lock.get().unwrap(), 7);
        assert_eq!(lock.set(9), Err(9));
        assert_eq!(*lock.get().unwrap(), 7);
    }
}
