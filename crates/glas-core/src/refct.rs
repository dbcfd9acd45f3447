//! Reference-count handles for host-owned objects.
//!
//! A handle pairs an opaque object pointer with an update callback;
//! a missing callback marks an unmanaged object. Handles crossing the
//! API boundary are pre-incremented: whoever receives one owes exactly
//! one decrement. The callback must be safe to invoke from any thread.

use std::ffi::c_void;

pub type RefctUpdate = unsafe fn(obj: *mut c_void, incref: bool);

/// An owned reference to a host object. Dropping the handle releases
/// the reference; cloning takes a new one.
pub struct Refct {
    update: Option<RefctUpdate>,
    obj: *mut c_void,
}

// The update callback is required to be thread-safe and the object
// pointer is never dereferenced by the runtime.
unsafe impl Send for Refct {}
unsafe impl Sync for Refct {}

impl Refct {
    /// Adopt a managed reference. The caller has already incremented
    /// the count on our behalf.
    ///
    /// # Safety
    /// `update` must tolerate concurrent calls and `obj` must stay
    /// valid until the final decrement.
    pub unsafe fn managed(obj: *mut c_void, update: RefctUpdate) -> Refct {
        Refct {
            update: Some(update),
            obj,
        }
    }

    /// Wrap an object with no ownership protocol.
    pub fn unmanaged(obj: *mut c_void) -> Refct {
        Refct { update: None, obj }
    }

    pub fn obj(&self) -> *mut c_void {
        self.obj
    }

    /// Stable address used for identity comparison and hashing.
    pub fn addr(&self) -> usize {
        self.obj as usize
    }

    pub fn is_managed(&self) -> bool {
        self.update.is_some()
    }

    /// Take an extra reference and hand it back as a fresh handle, for
    /// returning across the API boundary.
    pub fn export(&self) -> Refct {
        self.clone()
    }
}

impl Clone for Refct {
    fn clone(&self) -> Refct {
        if let Some(update) = self.update {
            unsafe { update(self.obj, true) };
        }
        Refct {
            update: self.update,
            obj: self.obj,
        }
    }
}

impl Drop for Refct {
    fn drop(&mut self) {
        if let Some(update) = self.update {
            unsafe { update(self.obj, false) };
        }
    }
}

impl std::fmt::Debug for Refct {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Refct({:p}, {})",
            self.obj,
            if self.is_managed() {
                "managed"
            } else {
                "unmanaged"
            }
        )
    }
}

/// Hand a heap buffer to the refcount protocol, for zero-copy exports
/// of runtime-owned bytes. The buffer is freed on the final decrement.
pub fn refct_for_bytes(bytes: std::sync::Arc<[u8]>) -> Refct {
    unsafe fn update(obj: *mut c_void, incref: bool) {
        let ptr = obj as *const BytesBox;
        if incref {
            unsafe { std::sync::Arc::increment_strong_count(ptr) };
        } else {
            unsafe { std::sync::Arc::decrement_strong_count(ptr) };
        }
    }
    let boxed: std::sync::Arc<BytesBox> = std::sync::Arc::new(BytesBox { bytes });
    let raw = std::sync::Arc::into_raw(boxed) as *mut c_void;
    unsafe { Refct::managed(raw, update) }
}

struct BytesBox {
    bytes: std::sync::Arc<[u8]>,
}

/// Borrow the bytes behind a handle produced by [`refct_for_bytes`].
///
/// # Safety
/// `refct` must originate from `refct_for_bytes` and outlive the
/// returned slice.
pub unsafe fn bytes_of_refct(refct: &Refct) -> &[u8] {
    let boxed = unsafe { &*(refct.obj() as *const BytesBox) };
    &boxed.bytes
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};

    static COUNT: AtomicI64 = AtomicI64::new(0);

    unsafe fn counting_update(_obj: *mut c_void, incref: bool) {
        if incref {
            COUNT.fetch_add(1, Ordering::SeqCst);
        } else {
            COUNT.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn clone_and_drop_balance() {
        COUNT.store(1, Ordering::SeqCst); // caller pre-incremented
        let h = unsafe { Refct::managed(std::ptr::null_mut(), counting_update) };
        let h2 = h.clone();
        assert_eq!(COUNT.load(Ordering::SeqCst), 2);
        drop(h);
        drop(h2);
        assert_eq!(COUNT.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn unmanaged_is_inert() {
        let h = Refct::unmanaged(0x1234 as *mut c_void);
        assert!(!h.is_managed());
        assert_eq!(h.addr(), 0x1234);
        let _ = h.clone();
    }

    #[test]
    fn bytes_refct_roundtrip() {
        let data: std::sync::Arc<[u8]> = b"payload".as_slice().into();
        let h = refct_for_bytes(data);
        let h2 = h.clone();
        assert_eq!(unsafe { bytes_of_refct(&h) }, b"payload");
        drop(h);
        assert_eq!(unsafe { bytes_of_refct(&h2) }, b"payload");
    }
}
