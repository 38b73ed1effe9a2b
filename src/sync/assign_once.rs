use parking_lot::Mutex;
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, Ordering};

/// A thread-safe reference that can be assigned once and never changes
/// again.
///
/// Writers serialize on an internal lock and double-check; losers observe
/// "already assigned" and make no state change. Reads never take the lock:
/// a published flag is the release fence for the stored value.
pub struct AssignOnce<T> {
    ready: AtomicBool,
    write: Mutex<()>,
    slot: UnsafeCell<Option<T>>,
}

// Safety: the slot is written exactly once, under the write lock, before
// `ready` is released; afterwards it is read-only.
unsafe impl<T: Send> Send for AssignOnce<T> {}
unsafe impl<T: Send + Sync> Sync for AssignOnce<T> {}

impl<T> Default for AssignOnce<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> AssignOnce<T> {
    pub fn new() -> Self {
        Self {
            ready: AtomicBool::new(false),
            write: Mutex::new(()),
            slot: UnsafeCell::new(None),
        }
    }

    /// Attempts to assign `value`. Returns `false` (dropping `value`) if a
    /// value is already present.
    pub fn try_assign(&self, value: T) -> bool {
        self.try_assign_with(|| value)
    }

    /// Attempts to assign the value produced by `supplier`. The supplier
    /// only runs when the assignment actually takes place, so it may have
    /// side effects.
    pub fn try_assign_with(&self, supplier: impl FnOnce() -> T) -> bool {
        if self.is_assigned() {
            return false;
        }
        let _write = self.write.lock();
        if self.is_assigned() {
            return false;
        }
        // Safety: write lock held, ready still false, no readers yet.
        unsafe { *self.slot.get() = Some(supplier()) };
        self.ready.store(true, Ordering::Release);
        true
    }

    /// Attempts to assign a value derived from a context object, returning
    /// the context on success. Neither closure runs when a value is already
    /// present.
    ///
    /// This shape exists for out-parameter call sites that need to hand the
    /// context (e.g. a timer handle) back to the caller that triggered the
    /// assignment.
    pub fn try_assign_with_context<Ctx>(
        &self,
        context: impl FnOnce() -> Ctx,
        value: impl FnOnce(&Ctx) -> T,
    ) -> Option<Ctx> {
        if self.is_assigned() {
            return None;
        }
        let _write = self.write.lock();
        if self.is_assigned() {
            return None;
        }
        let context = context();
        // Safety: as in `try_assign_with`.
        unsafe { *self.slot.get() = Some(value(&context)) };
        self.ready.store(true, Ordering::Release);
        Some(context)
    }

    /// Whether a value has been assigned. Once `true`, every subsequent
    /// [`get`](Self::get) succeeds; `false` gives no guarantee about a
    /// subsequent `try_assign`.
    pub fn is_assigned(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// The assigned value, or `None` when nothing has been assigned yet.
    pub fn get(&self) -> Option<&T> {
        if self.is_assigned() {
            // Safety: ready was released after the one-and-only write.
            unsafe { (*self.slot.get()).as_ref() }
        } else {
            None
        }
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for AssignOnce<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.get() {
            Some(value) => f.debug_tuple("AssignOnce").field(value).finish(),
            None => f.write_str("AssignOnce(<unassigned>)"),
        }
    }
}
