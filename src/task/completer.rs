use crate::task::blocking::BlockingCore;
use crate::task::error::{BindError, Cancelled, Failure, SignalError};
use std::cell::UnsafeCell;
use std::hint;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

const UNSET: u8 = 0;
const SETTING: u8 = 1;
const SET: u8 = 2;

/// The producer half of a completer/task pair.
///
/// A completer is created unbound; handing it to
/// [`start_blocking`](crate::tasks::start_blocking) binds it to a freshly
/// created running task, and binding happens at most once. Afterwards the
/// producer signals the outcome:
///
/// - [`signal_success`](Self::signal_success) /
///   [`signal_failure`](Self::signal_failure) return whether this signal
///   won the completion, and raise [`SignalError::Cancelled`] when a third
///   party cancelled the task out from under the producer.
/// - The `try_signal_*` variants swallow exactly that cancellation signal
///   and report it as a lost completion instead; every other error still
///   propagates.
///
/// Handles are cheap clones sharing the same pairing; signals from any
/// clone race like signals from different threads.
pub struct Completer<T> {
    inner: Arc<CompleterInner<T>>,
}

struct CompleterInner<T> {
    state: AtomicU8,
    // Written once inside the SETTING window, read-only from SET on.
    task: UnsafeCell<Option<Arc<BlockingCore<T>>>>,
}

// Safety: the task cell is written exactly once inside the SETTING window
// that the binder claimed by CAS, and only read after SET is observed.
unsafe impl<T: Send + Sync> Send for CompleterInner<T> {}
unsafe impl<T: Send + Sync> Sync for CompleterInner<T> {}

impl<T> Clone for Completer<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + Sync + 'static> Default for Completer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + Sync + 'static> Completer<T> {
    /// Creates a completer that is not associated with any task yet.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CompleterInner {
                state: AtomicU8::new(UNSET),
                task: UnsafeCell::new(None),
            }),
        }
    }

    // Pairs this completer with a task core. Called by the task factory.
    pub(crate) fn bind(&self, core: Arc<BlockingCore<T>>) -> Result<(), BindError> {
        if self
            .inner
            .state
            .compare_exchange(UNSET, SETTING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(BindError);
        }

        // Safety: we own the SETTING window.
        unsafe { *self.inner.task.get() = Some(core) };

        if self
            .inner
            .state
            .compare_exchange(SETTING, SET, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            panic!("FATAL: completer SETTING state modified by concurrent thread");
        }
        Ok(())
    }

    // Signals require SET; a signal racing the bind spins through the
    // SETTING window (a single field write).
    fn core(&self) -> Result<&Arc<BlockingCore<T>>, SignalError> {
        if self.inner.state.load(Ordering::Acquire) == UNSET {
            return Err(SignalError::Unbound);
        }
        while self.inner.state.load(Ordering::Acquire) != SET {
            hint::spin_loop();
        }
        // Safety: SET published after the one-and-only write.
        Ok(unsafe { (*self.inner.task.get()).as_ref().unwrap_unchecked() })
    }

    /// Attempts to complete the paired task with `value`.
    ///
    /// `Ok(true)` if this signal completed the task, `Ok(false)` if another
    /// success or failure already had. Raises [`SignalError::Unbound`] on an
    /// unbound completer and [`SignalError::Cancelled`] when the task was
    /// cancelled concurrently.
    pub fn signal_success(&self, value: T) -> Result<bool, SignalError> {
        let core = self.core()?;
        core.succeed(value).map_err(SignalError::Cancelled)
    }

    /// Attempts to fail the paired task with `cause`. Same contract as
    /// [`signal_success`](Self::signal_success).
    pub fn signal_failure(&self, cause: impl Into<anyhow::Error>) -> Result<bool, SignalError> {
        self.signal_failure_shared(Failure::new(cause))
    }

    // Failure signalling that preserves an existing shared cause; used by
    // chaining to forward the same failure instance.
    pub(crate) fn signal_failure_shared(&self, failure: Failure) -> Result<bool, SignalError> {
        let core = self.core()?;
        core.fail(failure).map_err(SignalError::Cancelled)
    }

    /// As [`signal_success`](Self::signal_success), but a concurrent
    /// cancellation is reported as `Ok(false)` instead of an error.
    pub fn try_signal_success(&self, value: T) -> Result<bool, SignalError> {
        match self.signal_success(value) {
            Err(SignalError::Cancelled(_)) => Ok(false),
            other => other,
        }
    }

    /// As [`signal_failure`](Self::signal_failure), swallowing only the
    /// concurrent-cancellation signal.
    pub fn try_signal_failure(&self, cause: impl Into<anyhow::Error>) -> Result<bool, SignalError> {
        self.try_signal_failure_shared(Failure::new(cause))
    }

    pub(crate) fn try_signal_failure_shared(&self, failure: Failure) -> Result<bool, SignalError> {
        match self.signal_failure_shared(failure) {
            Err(SignalError::Cancelled(_)) => Ok(false),
            other => other,
        }
    }

    /// Whether the paired task has been cancelled. `false` while unbound.
    pub fn is_cancelled(&self) -> bool {
        match self.core() {
            Ok(core) => core.is_cancelled(),
            Err(_) => false,
        }
    }

    /// The cancellation cause of the paired task, if it was cancelled.
    pub fn cancellation_error(&self) -> Option<Cancelled> {
        self.core().ok()?.cancellation_error()
    }
}

impl<T> std::fmt::Debug for Completer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self.inner.state.load(Ordering::Acquire) {
            UNSET => "unbound",
            SETTING => "binding",
            _ => "bound",
        };
        f.debug_struct("Completer").field("state", &state).finish()
    }
}
