//! Reference-counted object runtime.
//!
//! The original C library prepends a `{refcount, destroy}` header to every
//! heap allocation and detects double-free / use-after-free by logging
//! rather than aborting. Rust's `Arc` already gives us the safe, correct
//! half of this for free; what doesn't come for free is the audit
//! contract: decrement-below-zero and increment-of-deleted are user
//! errors we want to observe, not undefined behaviour.
//!
//! [`Ref<T>`] wraps `Arc<T>` and layers an explicit, loggable refcount
//! audit on top, so callers that hand out raw counts (as `cacheobj`,
//! `filecache`, and the namespace all do) get "log, don't crash"
//! behaviour on misuse instead of a silent double-free.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// A reference-counted object with an auditable count, mirroring the
/// `new_obj`/`ref`/`unref` trio of the C runtime this is built on.
///
/// `Ref<T>` is cheap to clone (one `Arc` clone); the audit counter is
/// separate bookkeeping used only by [`Ref::ref_count`] and the
/// double-free detector in [`Ref::unref`].
pub struct Ref<T> {
    inner: Arc<Inner<T>>,
}

struct Inner<T> {
    payload: T,
    count: AtomicI64,
}

impl<T> Ref<T> {
    /// `new_obj(size, destroy)`: allocate with refcount 1. The destructor
    /// is just `T::drop`; Rust's drop glue plays the role the explicit
    /// `destroy(p)` function pointer used to.
    pub fn new(payload: T) -> Self {
        Ref { inner: Arc::new(Inner { payload, count: AtomicI64::new(1) }) }
    }

    /// `ref(p)`: increment the audit counter and return a new handle
    /// sharing the same payload.
    pub fn ref_clone(&self) -> Self {
        let prev = self.inner.count.fetch_add(1, Ordering::AcqRel);
        if prev <= 0 {
            tracing::error!(
                prev_count = prev,
                "ref() on an object whose audited refcount was already <= 0 (use-after-free)"
            );
        }
        Ref { inner: Arc::clone(&self.inner) }
    }

    /// `unref(p)`: decrement the audit counter. Actual deallocation is
    /// left to `Arc`'s drop glue (equivalent to "at zero, call destroy
    /// then free"); this method's job is purely the audit: a decrement
    /// that takes the count below zero is logged, not fatal.
    pub fn unref(self) {
        let prev = self.inner.count.fetch_sub(1, Ordering::AcqRel);
        if prev <= 0 {
            tracing::error!(
                prev_count = prev,
                "unref() on an object whose audited refcount was already <= 0 (double free)"
            );
        }
    }

    /// Current audit count. Not the same as `Arc::strong_count`: this
    /// tracks the explicit ref/unref discipline, which callers may use
    /// more loosely than raw `Arc` cloning (e.g. a cache may `ref_clone`
    /// once per logical hand-out but keep a single `Arc` clone around).
    pub fn ref_count(&self) -> i64 {
        self.inner.count.load(Ordering::Acquire)
    }

    pub fn get(&self) -> &T {
        &self.inner.payload
    }
}

impl<T> Clone for Ref<T> {
    /// Plain `Clone` does *not* touch the audit counter --- use
    /// [`Ref::ref_clone`] when the ref-counting discipline matters (e.g.
    /// when mirroring `__av_ref_obj`/`__av_unref_obj` call sites).
    /// Structural sharing via `Clone` (e.g. moving a `Ref` into a
    /// collection) is just `Arc::clone`.
    fn clone(&self) -> Self {
        Ref { inner: Arc::clone(&self.inner) }
    }
}

impl<T> std::ops::Deref for Ref<T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.inner.payload
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Ref<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ref")
            .field("payload", &self.inner.payload)
            .field("count", &self.ref_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn ref_clone_increments_and_unref_decrements() {
        let r = Ref::new(42u32);
        assert_eq!(r.ref_count(), 1);
        let r2 = r.ref_clone();
        assert_eq!(r.ref_count(), 2);
        r2.unref();
        assert_eq!(r.ref_count(), 1);
    }

    #[test]
    fn destructor_runs_when_last_arc_drops() {
        struct Counted(Arc<AtomicUsize>);
        impl Drop for Counted {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
        let drops = Arc::new(AtomicUsize::new(0));
        let r = Ref::new(Counted(Arc::clone(&drops)));
        let r2 = r.ref_clone();
        drop(r);
        assert_eq!(drops.load(Ordering::SeqCst), 0);
        drop(r2);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn double_unref_is_logged_not_fatal() {
        let r = Ref::new(1u8);
        let r2 = r.ref_clone();
        r2.unref();
        // Deliberately over-unref: must not panic/abort --- the log
        // message is the contract, not a fatal error.
        let r3 = r.ref_clone();
        r3.unref();
        r.unref();
    }
}
