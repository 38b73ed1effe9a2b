use crate::cancel::CancelCondition;
use crate::sync::{Awaiter, Permit, SubscriptionHandler};
use crate::task::error::{Cancelled, CheckError, Failure, Payload, WaitError};
use crate::task::state::{
    CANCEL_MASK, CANCELLED, CANCELLING, FAILED, FAILED_MASK, FAILING, StateCell, SUCCEEDING,
    SUCCESS, SUCCESS_MASK, WAITING,
};
use crate::task::{Task, TaskState};
use std::cell::UnsafeCell;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// The shared core of a blocking task: the state machine, the terminal
/// fields, the wait gate and the four subscription channels.
///
/// Terminal fields are guarded by the state protocol: they are written
/// exactly once, inside the XXX_ING window that the writer claimed with a
/// CAS, and become readable once the valid bit is published. Readers that
/// observe an outcome mask without the valid bit spin for the handful of
/// atomic writes the window contains.
pub(crate) struct BlockingCore<T> {
    state: StateCell,
    consumed: AtomicBool,
    // A task created shielded refuses every cancellation attempt.
    shielded: bool,

    result: UnsafeCell<Option<Arc<T>>>,
    failure: UnsafeCell<Option<Failure>>,
    cancellation: UnsafeCell<Option<Cancelled>>,

    awaiter: Awaiter,
    on_success: SubscriptionHandler<T>,
    on_failure: SubscriptionHandler<Failure>,
    on_cancelled: SubscriptionHandler<Cancelled>,
    on_completion: SubscriptionHandler<Task<T>>,
}

// Safety: the terminal cells follow the single-writer protocol described
// above; everything else is atomics, the awaiter and the handlers, all of
// which are thread-safe on their own.
unsafe impl<T: Send + Sync> Send for BlockingCore<T> {}
unsafe impl<T: Send + Sync> Sync for BlockingCore<T> {}

impl<T: Send + Sync + 'static> BlockingCore<T> {
    pub(crate) fn new(shielded: bool) -> Arc<Self> {
        Arc::new(Self {
            state: StateCell::new_running(),
            consumed: AtomicBool::new(false),
            shielded,
            result: UnsafeCell::new(None),
            failure: UnsafeCell::new(None),
            cancellation: UnsafeCell::new(None),
            awaiter: Awaiter::new(),
            on_success: SubscriptionHandler::new(),
            on_failure: SubscriptionHandler::new(),
            on_cancelled: SubscriptionHandler::new(),
            on_completion: SubscriptionHandler::new(),
        })
    }

    // === termination protocol ===

    /// Completes the task successfully. `Ok(false)` means another
    /// completion won; `Err` means the task was cancelled by a third party
    /// (reported once the cancellation is stable).
    pub(crate) fn succeed(self: &Arc<Self>, value: T) -> Result<bool, Cancelled> {
        if let Err(observed) = self.state.begin_terminal(SUCCEEDING) {
            return self.lost_completion(observed);
        }

        let value = Arc::new(value);
        // Safety: we own the SUCCEEDING window.
        unsafe { *self.result.get() = Some(value.clone()) };
        self.awaiter.signal_all(Permit::MASTER);
        self.state.finish_terminal(SUCCEEDING, SUCCESS);

        self.on_success.execute(|| value);
        self.fire_completion();
        Ok(true)
    }

    /// Completes the task with a failure. Same contract as
    /// [`succeed`](Self::succeed).
    pub(crate) fn fail(self: &Arc<Self>, failure: Failure) -> Result<bool, Cancelled> {
        if let Err(observed) = self.state.begin_terminal(FAILING) {
            return self.lost_completion(observed);
        }

        // Safety: we own the FAILING window.
        unsafe { *self.failure.get() = Some(failure.clone()) };
        self.awaiter.signal_all(Permit::MASTER);
        self.state.finish_terminal(FAILING, FAILED);

        self.on_failure.execute(|| Arc::new(failure));
        self.fire_completion();
        Ok(true)
    }

    // A completion attempt that lost the CAS either lost to another
    // completion (benign, the caller returns false) or to a cancellation,
    // which the completer must surface to its caller.
    fn lost_completion(&self, observed: u8) -> Result<bool, Cancelled> {
        if observed & CANCEL_MASK != 0 {
            self.state.spin_until_valid();
            Err(self.cancellation_field())
        } else {
            Ok(false)
        }
    }

    /// Cancels the task. Returns `false` when the task is shielded or
    /// already completing.
    pub(crate) fn cancel(self: &Arc<Self>, payload: Option<Payload>) -> bool {
        if self.shielded {
            return false;
        }
        if self.state.begin_terminal(CANCELLING).is_err() {
            return false;
        }

        let cause = Cancelled::new("blocking task cancelled", payload);
        // Safety: we own the CANCELLING window.
        unsafe { *self.cancellation.get() = Some(cause.clone()) };
        self.awaiter.signal_all(Permit::MASTER);
        self.state.finish_terminal(CANCELLING, CANCELLED);

        self.on_cancelled.execute(|| Arc::new(cause));
        self.fire_completion();
        true
    }

    fn fire_completion(self: &Arc<Self>) {
        let task = Task::from_blocking(self.clone());
        self.on_completion.execute(|| Arc::new(task));
    }

    // === observers ===

    pub(crate) fn state(&self) -> TaskState {
        let state = self.state.load();
        if state == WAITING {
            TaskState::Running
        } else if state & CANCEL_MASK != 0 {
            TaskState::Cancelled
        } else if state & SUCCESS_MASK != 0 {
            TaskState::Success
        } else {
            TaskState::Failed
        }
    }

    pub(crate) fn is_done(&self) -> bool {
        self.state.load() != WAITING
    }

    pub(crate) fn is_running(&self) -> bool {
        self.state.load() == WAITING
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.state.load() & CANCEL_MASK != 0
    }

    pub(crate) fn is_successful(&self) -> bool {
        self.state.load() & SUCCESS_MASK != 0
    }

    pub(crate) fn is_failed(&self) -> bool {
        self.state.load() & FAILED_MASK != 0
    }

    pub(crate) fn is_shielded(&self) -> bool {
        self.shielded
    }

    /// The result, present only when the task completed successfully.
    /// Spins through the SUCCEEDING window so a present outcome is always
    /// fully published.
    pub(crate) fn finished_result(&self) -> Option<Arc<T>> {
        if self.state.load() & SUCCESS_MASK == 0 {
            return None;
        }
        self.state.spin_until_valid();
        // Safety: stable SUCCESS, field immutable.
        unsafe { (*self.result.get()).clone() }
    }

    /// Raw result read: `None` unless the stable SUCCESS state is already
    /// published.
    pub(crate) fn result(&self) -> Option<Arc<T>> {
        let state = self.state.load();
        if state == SUCCESS {
            // Safety: stable SUCCESS, field immutable.
            unsafe { (*self.result.get()).clone() }
        } else {
            None
        }
    }

    /// The failure cause, regardless of whether it was already consumed.
    pub(crate) fn failure(&self) -> Option<Failure> {
        if self.state.load() & FAILED_MASK == 0 {
            return None;
        }
        self.state.spin_until_valid();
        // Safety: stable FAILED, field immutable.
        unsafe { (*self.failure.get()).clone() }
    }

    pub(crate) fn has_unconsumed_failure(&self) -> bool {
        self.is_failed() && !self.consumed.load(Ordering::Acquire)
    }

    pub(crate) fn cancellation_error(&self) -> Option<Cancelled> {
        if self.state.load() & CANCEL_MASK == 0 {
            return None;
        }
        self.state.spin_until_valid();
        Some(self.cancellation_field())
    }

    fn cancellation_field(&self) -> Cancelled {
        // Safety: stable CANCELLED, field immutable.
        unsafe { (*self.cancellation.get()).clone() }
            .expect("FATAL: CANCELLED state without a cancellation cause")
    }

    fn failure_field(&self) -> Failure {
        // Safety: stable FAILED, field immutable.
        unsafe { (*self.failure.get()).clone() }.expect("FATAL: FAILED state without a failure")
    }

    // === failure consumption ===

    fn consume(&self) -> bool {
        self.consumed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Re-raises the stored failure exactly once across all checkers.
    pub(crate) fn check_failure(&self) -> Result<(), Failure> {
        if self.state.load() & FAILED_MASK == 0 {
            return Ok(());
        }
        self.state.spin_until_valid();
        if self.consume() {
            return Err(self.failure_field());
        }
        Ok(())
    }

    /// As [`check_failure`](Self::check_failure), but only consumes and
    /// re-raises when the stored cause is of type `E`.
    pub(crate) fn check_failure_of<E>(&self) -> Result<(), Failure>
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        if self.state.load() & FAILED_MASK == 0 {
            return Ok(());
        }
        self.state.spin_until_valid();
        let failure = self.failure_field();
        if failure.is::<E>() && self.consume() {
            return Err(failure);
        }
        Ok(())
    }

    /// Raises on both failure (consuming, wrapped) and cancellation.
    pub(crate) fn check_success(&self) -> Result<(), CheckError> {
        let state = self.state.load();
        if state & CANCEL_MASK != 0 {
            self.state.spin_until_valid();
            return Err(CheckError::Cancelled(self.cancellation_field()));
        }
        if state & FAILED_MASK != 0 {
            self.state.spin_until_valid();
            if self.consume() {
                return Err(CheckError::Failed(self.failure_field()));
            }
        }
        Ok(())
    }

    // === waiting ===

    pub(crate) fn wait(&self, timeout: Option<Duration>, interruptible: bool) -> Result<(), WaitError> {
        match (timeout, interruptible) {
            (None, true) => self.awaiter.wait(Permit::MASTER).map(|_| ()),
            (None, false) => {
                self.awaiter.wait_uninterruptibly(Permit::MASTER);
                Ok(())
            }
            (Some(timeout), true) => self.awaiter.wait_timeout(Permit::MASTER, timeout).map(|_| ()),
            (Some(timeout), false) => self
                .awaiter
                .wait_timeout_uninterruptibly(Permit::MASTER, timeout)
                .map(|_| ()),
        }
    }

    pub(crate) fn wait_cancellable(
        &self,
        condition: &CancelCondition,
        timeout: Option<Duration>,
        interruptible: bool,
    ) -> Result<(), WaitError> {
        // A condition that was cancelled before the call began aborts the
        // wait without parking (and without consuming its action slot).
        if condition.is_cancelled() {
            return Err(WaitError::Cancelled(condition.cancellation_error_blocking()));
        }

        let permit = condition.permit();
        let gate = self.awaiter.clone();
        if !condition.bind_action(move |_| {
            gate.signal_all(permit);
            true
        }) {
            return Err(WaitError::ConditionBound);
        }

        let woken_by = match (timeout, interruptible) {
            (None, true) => self.awaiter.wait(permit)?,
            (None, false) => self.awaiter.wait_uninterruptibly(permit),
            (Some(timeout), true) => self.awaiter.wait_timeout(permit, timeout)?,
            (Some(timeout), false) => self.awaiter.wait_timeout_uninterruptibly(permit, timeout)?,
        };

        if woken_by == permit {
            // The cancel action signalled us before the cause was published;
            // bridge the bounded gap.
            return Err(WaitError::Cancelled(condition.cancellation_error_blocking()));
        }
        Ok(())
    }

    // === subscriptions ===

    pub(crate) fn on_success(&self) -> &SubscriptionHandler<T> {
        &self.on_success
    }

    pub(crate) fn on_failure(&self) -> &SubscriptionHandler<Failure> {
        &self.on_failure
    }

    pub(crate) fn on_cancelled(&self) -> &SubscriptionHandler<Cancelled> {
        &self.on_cancelled
    }

    pub(crate) fn on_completion(&self) -> &SubscriptionHandler<Task<T>> {
        &self.on_completion
    }
}
