use parking_lot::Mutex;
use std::cell::UnsafeCell;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

type Supplier<T> = Box<dyn FnOnce() -> T + Send>;

struct LazyInner<T> {
    ready: AtomicBool,
    // Holds the supplier until it fires; taking it is the "this value is
    // being (or has been) produced" marker.
    supplier: Mutex<Option<Supplier<T>>>,
    value: UnsafeCell<Option<T>>,
}

// Safety: the value cell is written exactly once, under the supplier lock,
// before `ready` is released; afterwards it is read-only.
unsafe impl<T: Send> Send for LazyInner<T> {}
unsafe impl<T: Send + Sync> Sync for LazyInner<T> {}

/// A memoized supplier: the stored closure runs at most once, on the first
/// [`get`](Self::get), and the produced value is cached.
///
/// Handles are cheap clones sharing the same cell, which is what lets
/// [`map`](Self::map) build derived lazies without consuming the base.
pub struct Lazy<T> {
    inner: Arc<LazyInner<T>>,
}

impl<T> Clone for Lazy<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + Sync + 'static> Lazy<T> {
    pub fn new(supplier: impl FnOnce() -> T + Send + 'static) -> Self {
        Self {
            inner: Arc::new(LazyInner {
                ready: AtomicBool::new(false),
                supplier: Mutex::new(Some(Box::new(supplier))),
                value: UnsafeCell::new(None),
            }),
        }
    }

    /// The stored value, producing it on first use.
    ///
    /// Contended first calls serialize on an internal lock; once the value
    /// is present no call ever takes the lock again.
    pub fn get(&self) -> &T {
        if self.inner.ready.load(Ordering::Acquire) {
            // Safety: ready was released after the one-and-only write.
            return unsafe { (*self.inner.value.get()).as_ref().unwrap_unchecked() };
        }

        let mut supplier = self.inner.supplier.lock();
        if !self.inner.ready.load(Ordering::Acquire) {
            let supplier = supplier
                .take()
                .expect("FATAL: lazy supplier lost without a published value");
            // Safety: lock held, ready still false, no readers yet.
            unsafe { *self.inner.value.get() = Some(supplier()) };
            self.inner.ready.store(true, Ordering::Release);
        }
        drop(supplier);

        // Safety: ready is now set.
        unsafe { (*self.inner.value.get()).as_ref().unwrap_unchecked() }
    }

    /// Whether the value has already been produced.
    pub fn is_present(&self) -> bool {
        self.inner.ready.load(Ordering::Acquire)
    }

    /// Runs `action` with the value only if it has already been produced;
    /// never triggers the supplier.
    pub fn if_present(&self, action: impl FnOnce(&T)) {
        if self.is_present() {
            action(self.get());
        }
    }

    /// A derived lazy holding `mapper(base_value)`, memoized independently.
    /// Resolving the derived lazy resolves this one.
    pub fn map<V: Send + Sync + 'static>(
        &self,
        mapper: impl FnOnce(&T) -> V + Send + 'static,
    ) -> Lazy<V> {
        let base = self.clone();
        Lazy::new(move || mapper(base.get()))
    }
}

impl<T: std::fmt::Debug + Send + Sync + 'static> std::fmt::Debug for Lazy<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_present() {
            f.debug_tuple("Lazy").field(self.get()).finish()
        } else {
            f.write_str("Lazy(<pending>)")
        }
    }
}

const UNINIT: u8 = 0;
const READY: u8 = 1;
const CLOSED: u8 = 2;

/// The value of a closed [`CloseableLazy`] can no longer be retrieved.
#[derive(thiserror::Error, Debug, Clone)]
#[error("lazy value was already closed")]
pub struct LazyClosed;

/// A [`Lazy`] with an explicit close step.
///
/// [`close`](Self::close) runs the close function exactly once, and only if
/// the value was actually produced; a never-resolved lazy closes without
/// side effects. After closing, [`get`](Self::get) fails. The value itself
/// stays allocated until the cell is dropped, so references handed out
/// before the close remain valid.
pub struct CloseableLazy<T> {
    state: AtomicU8,
    lock: Mutex<Slots<T>>,
    value: UnsafeCell<Option<T>>,
}

struct Slots<T> {
    supplier: Option<Supplier<T>>,
    close: Option<Box<dyn FnOnce(&T) + Send>>,
}

// Safety: same single-writer publication protocol as `LazyInner`.
unsafe impl<T: Send> Send for CloseableLazy<T> {}
unsafe impl<T: Send + Sync> Sync for CloseableLazy<T> {}

impl<T: Send + Sync + 'static> CloseableLazy<T> {
    pub fn new(
        supplier: impl FnOnce() -> T + Send + 'static,
        close: impl FnOnce(&T) + Send + 'static,
    ) -> Self {
        Self {
            state: AtomicU8::new(UNINIT),
            lock: Mutex::new(Slots {
                supplier: Some(Box::new(supplier)),
                close: Some(Box::new(close)),
            }),
            value: UnsafeCell::new(None),
        }
    }

    /// The stored value, producing it on first use.
    pub fn get(&self) -> Result<&T, LazyClosed> {
        match self.state.load(Ordering::Acquire) {
            // Safety: READY was released after the one-and-only write and
            // the value outlives the cell even after a close.
            READY => return Ok(unsafe { (*self.value.get()).as_ref().unwrap_unchecked() }),
            CLOSED => return Err(LazyClosed),
            _ => {}
        }

        let mut slots = self.lock.lock();
        match self.state.load(Ordering::Acquire) {
            READY => {}
            CLOSED => return Err(LazyClosed),
            _ => {
                let supplier = slots
                    .supplier
                    .take()
                    .expect("FATAL: closeable lazy supplier lost without a published value");
                // Safety: lock held, state still UNINIT, no readers yet.
                unsafe { *self.value.get() = Some(supplier()) };
                self.state.store(READY, Ordering::Release);
            }
        }
        drop(slots);

        // Safety: state is READY.
        Ok(unsafe { (*self.value.get()).as_ref().unwrap_unchecked() })
    }

    /// Runs the close function on the value, if and only if the value was
    /// produced. Calling `close` more than once has no effect.
    pub fn close(&self) {
        let mut slots = self.lock.lock();
        let state = self.state.load(Ordering::Acquire);
        if state == CLOSED {
            return;
        }
        if state == READY {
            if let Some(close) = slots.close.take() {
                // Safety: READY, value present and immutable.
                let value = unsafe { (*self.value.get()).as_ref().unwrap_unchecked() };
                close(value);
            }
        }
        // A value that was never produced must never be produced later.
        slots.supplier = None;
        self.state.store(CLOSED, Ordering::Release);
    }

    /// Whether the value has been produced and not yet closed.
    pub fn is_open(&self) -> bool {
        self.state.load(Ordering::Acquire) == READY
    }

    /// Runs `action` with the value only while it is present and the cell
    /// has not been closed.
    pub fn if_open(&self, action: impl FnOnce(&T)) {
        // The value cannot transition to CLOSED mid-action holding a live
        // reference safely, so take the close lock around the callback.
        let _slots = self.lock.lock();
        if self.state.load(Ordering::Acquire) == READY {
            // Safety: READY, value present.
            action(unsafe { (*self.value.get()).as_ref().unwrap_unchecked() });
        }
    }
}

/// A lazy cell whose supplier arrives at the call site of the first read.
///
/// Useful for caching a value inside a function without deciding up front
/// how it is produced.
pub struct InlineLazy<T> {
    ready: AtomicBool,
    lock: Mutex<()>,
    value: UnsafeCell<Option<T>>,
}

// Safety: same single-writer publication protocol as `LazyInner`.
unsafe impl<T: Send> Send for InlineLazy<T> {}
unsafe impl<T: Send + Sync> Sync for InlineLazy<T> {}

impl<T> Default for InlineLazy<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> InlineLazy<T> {
    pub fn new() -> Self {
        Self {
            ready: AtomicBool::new(false),
            lock: Mutex::new(()),
            value: UnsafeCell::new(None),
        }
    }

    /// Returns the stored value, producing it with `supplier` if this is the
    /// first call. Later calls ignore their supplier entirely.
    pub fn get_or_init(&self, supplier: impl FnOnce() -> T) -> &T {
        if !self.ready.load(Ordering::Acquire) {
            let _lock = self.lock.lock();
            if !self.ready.load(Ordering::Acquire) {
                // Safety: lock held, ready still false, no readers yet.
                unsafe { *self.value.get() = Some(supplier()) };
                self.ready.store(true, Ordering::Release);
            }
        }
        // Safety: ready was released after the one-and-only write.
        unsafe { (*self.value.get()).as_ref().unwrap_unchecked() }
    }

    /// The stored value, or `None` when no supplier has run yet.
    pub fn try_get(&self) -> Option<&T> {
        if self.ready.load(Ordering::Acquire) {
            // Safety: as in `get_or_init`.
            unsafe { (*self.value.get()).as_ref() }
        } else {
            None
        }
    }

    /// Whether a supplier has run and defined the value.
    pub fn is_defined(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn supplier_runs_at_most_once_under_contention() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counted = runs.clone();
        let lazy = Lazy::new(move || {
            counted.fetch_add(1, Ordering::SeqCst);
            thread::sleep(std::time::Duration::from_millis(5));
            21
        });

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let lazy = lazy.clone();
                thread::spawn(move || *lazy.get())
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), 21);
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn map_resolves_the_base() {
        let base = Lazy::new(|| 10_u32);
        let mapped = base.map(|n| n * 2);
        assert!(!base.is_present());
        assert_eq!(*mapped.get(), 20);
        assert!(base.is_present());
    }

    #[test]
    fn if_present_never_triggers_the_supplier() {
        let lazy = Lazy::new(|| unreachable!("supplier must not run"));
        lazy.if_present(|_: &u32| unreachable!("no value yet"));
        assert!(!lazy.is_present());
    }

    #[test]
    fn closeable_close_runs_once_and_only_if_created() {
        let closed = Arc::new(AtomicUsize::new(0));
        let counted = closed.clone();
        let lazy = CloseableLazy::new(|| 5_u32, move |_| {
            counted.fetch_add(1, Ordering::SeqCst);
        });
        // Never resolved: closing must not run the close function.
        lazy.close();
        assert_eq!(closed.load(Ordering::SeqCst), 0);
        assert!(matches!(lazy.get(), Err(LazyClosed)));

        let closed = Arc::new(AtomicUsize::new(0));
        let counted = closed.clone();
        let lazy = CloseableLazy::new(|| 5_u32, move |_| {
            counted.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(*lazy.get().unwrap(), 5);
        lazy.close();
        lazy.close();
        assert_eq!(closed.load(Ordering::SeqCst), 1);
        assert!(matches!(lazy.get(), Err(LazyClosed)));
    }

    #[test]
    fn inline_lazy_ignores_later_suppliers() {
        let lazy = InlineLazy::new();
        assert!(!lazy.is_defined());
        assert_eq!(*lazy.get_or_init(|| 1), 1);
        assert_eq!(*lazy.get_or_init(|| 2), 1);
        assert_eq!(lazy.try_get(), Some(&1));
    }
}
