use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Something a blocked thread can be woken through. Implemented by the
/// awaiter so that an interrupt can kick a thread out of its wait loop.
pub(crate) trait Wake: Send + Sync {
    fn wake_all(&self);
}

struct State {
    flag: AtomicBool,
    // The wait gate the owning thread is currently blocked on, if any.
    // Registered for the duration of an interruptible wait.
    target: Mutex<Option<Arc<dyn Wake>>>,
}

impl State {
    fn new() -> Self {
        Self {
            flag: AtomicBool::new(false),
            target: Mutex::new(None),
        }
    }
}

thread_local! {
    static CURRENT: Arc<State> = Arc::new(State::new());
}

/// A handle to one thread's interrupt flag.
///
/// Rust threads cannot be interrupted by the runtime, so this crate carries
/// its own cooperative facility: a thread obtains its handle with
/// [`Interrupt::current`] and hands it to whoever may want to abort its
/// blocking waits. Interruptible waits consume the flag and return an
/// interrupted error; uninterruptible waits ignore the flag and leave it
/// set for a later interruptible operation to observe.
#[derive(Clone)]
pub struct Interrupt {
    state: Arc<State>,
}

impl Interrupt {
    /// The interrupt handle of the calling thread.
    pub fn current() -> Self {
        Self {
            state: CURRENT.with(Arc::clone),
        }
    }

    /// Sets the interrupt flag of the owning thread and wakes it if it is
    /// blocked in one of this crate's interruptible waits.
    ///
    /// Idempotent; interrupting an already interrupted thread has no
    /// additional effect.
    pub fn interrupt(&self) {
        self.state.flag.store(true, Ordering::SeqCst);
        // Clone the target out so the wakeup does not run under our lock.
        let target = self.state.target.lock().clone();
        if let Some(target) = target {
            target.wake_all();
        }
    }

    /// Whether the owning thread's interrupt flag is currently set. Does not
    /// consume the flag.
    pub fn is_interrupted(&self) -> bool {
        self.state.flag.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for Interrupt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interrupt")
            .field("interrupted", &self.is_interrupted())
            .finish()
    }
}

/// Consumes and returns the calling thread's interrupt flag.
pub fn take_interrupted() -> bool {
    CURRENT.with(|s| s.flag.swap(false, Ordering::SeqCst))
}

/// Reads the calling thread's interrupt flag without consuming it.
pub fn is_interrupted() -> bool {
    CURRENT.with(|s| s.flag.load(Ordering::SeqCst))
}

/// Registers `target` as the calling thread's wake target for the duration
/// of the returned guard. Interruptible waits install their gate here before
/// blocking so `interrupt()` can reach them.
pub(crate) fn register_target(target: Arc<dyn Wake>) -> TargetGuard {
    let previous = CURRENT.with(|s| s.target.lock().replace(target));
    TargetGuard { previous }
}

pub(crate) struct TargetGuard {
    previous: Option<Arc<dyn Wake>>,
}

impl Drop for TargetGuard {
    fn drop(&mut self) {
        CURRENT.with(|s| *s.target.lock() = self.previous.take());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn flag_is_per_thread() {
        Interrupt::current().interrupt();
        let other = thread::spawn(|| is_interrupted()).join().unwrap();
        assert!(!other);
        assert!(take_interrupted());
        assert!(!is_interrupted());
    }

    #[test]
    fn interrupt_from_another_thread() {
        let (tx, rx) = std::sync::mpsc::channel();
        let handle = thread::spawn(move || {
            tx.send(Interrupt::current()).unwrap();
            while !is_interrupted() {
                thread::sleep(Duration::from_millis(1));
            }
            take_interrupted()
        });
        rx.recv().unwrap().interrupt();
        assert!(handle.join().unwrap());
    }
}
