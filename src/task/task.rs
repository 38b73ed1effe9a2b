use crate::cancel::CancelCondition;
use crate::exec::{self, Executor};
use crate::task::blocking::BlockingCore;
use crate::task::done::DoneCore;
use crate::task::error::{Cancelled, CheckError, Failure, Payload, WaitError};
use crate::task::future::TaskFuture;
use crate::task::TaskState;
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

enum Inner<T> {
    Blocking(Arc<BlockingCore<T>>),
    Done(Arc<DoneCore<T>>),
}

/// A handle to a computation that terminates in exactly one of success,
/// failure or cancellation.
///
/// Handles are cheap clones sharing one underlying task; every method is
/// thread-safe. The producer side lives on the paired
/// [`Completer`](crate::Completer); a task handle can only observe,
/// subscribe and cancel.
///
/// # Waiting
///
/// The `wait*` family blocks the calling thread until the task reaches a
/// terminal state. Variants differ along two axes: an optional deadline,
/// and whether the wait honors the cooperative
/// [`Interrupt`](crate::Interrupt) facility. A wait never reports the
/// *outcome* of the task; read it afterwards with
/// [`check_failure`](Self::check_failure) /
/// [`check_success`](Self::check_success) /
/// [`finished_result`](Self::finished_result).
///
/// # Subscriptions
///
/// The `on_*` family registers callbacks that run exactly once when (or
/// immediately if) the task reaches the matching terminal state. Inline
/// variants run on the completing thread; subscribers must not block it and
/// must not re-subscribe to the same task from inside the callback. Panics
/// in subscribers are isolated and reported through `tracing`.
pub struct Task<T> {
    inner: Inner<T>,
}

impl<T> Clone for Task<T> {
    fn clone(&self) -> Self {
        let inner = match &self.inner {
            Inner::Blocking(core) => Inner::Blocking(core.clone()),
            Inner::Done(core) => Inner::Done(core.clone()),
        };
        Self { inner }
    }
}

impl<T: Send + Sync + 'static> Task<T> {
    pub(crate) fn from_blocking(core: Arc<BlockingCore<T>>) -> Self {
        Self {
            inner: Inner::Blocking(core),
        }
    }

    pub(crate) fn from_done(core: Arc<DoneCore<T>>) -> Self {
        Self {
            inner: Inner::Done(core),
        }
    }

    pub(crate) fn new_success(value: T) -> Self {
        Self::from_done(Arc::new(DoneCore::Success(Arc::new(value))))
    }

    pub(crate) fn new_failed(failure: Failure) -> Self {
        Self::from_done(Arc::new(DoneCore::Failed {
            failure,
            consumed: AtomicBool::new(false),
        }))
    }

    pub(crate) fn new_cancelled(cause: Cancelled) -> Self {
        Self::from_done(Arc::new(DoneCore::Cancelled(cause)))
    }

    // === state ===

    /// The current lifecycle state.
    pub fn state(&self) -> TaskState {
        match &self.inner {
            Inner::Blocking(core) => core.state(),
            Inner::Done(core) => core.state(),
        }
    }

    /// Whether the task reached (or is in the act of publishing) a terminal
    /// state. Once `true`, stays `true` forever.
    pub fn is_done(&self) -> bool {
        match &self.inner {
            Inner::Blocking(core) => core.is_done(),
            Inner::Done(_) => true,
        }
    }

    /// Whether the task is still running. The inverse of
    /// [`is_done`](Self::is_done) for this task family.
    pub fn is_running(&self) -> bool {
        match &self.inner {
            Inner::Blocking(core) => core.is_running(),
            Inner::Done(_) => false,
        }
    }

    /// Whether the task was cancelled before completion.
    pub fn is_cancelled(&self) -> bool {
        match &self.inner {
            Inner::Blocking(core) => core.is_cancelled(),
            Inner::Done(core) => core.is_cancelled(),
        }
    }

    /// Whether the task completed with a result.
    pub fn is_successful(&self) -> bool {
        match &self.inner {
            Inner::Blocking(core) => core.is_successful(),
            Inner::Done(core) => core.is_successful(),
        }
    }

    /// Whether the task failed with an error.
    pub fn is_failed(&self) -> bool {
        match &self.inner {
            Inner::Blocking(core) => core.is_failed(),
            Inner::Done(core) => core.is_failed(),
        }
    }

    /// Whether the task was cancelled before it ever started. Always
    /// `false` for this task family, which is running from birth.
    pub fn is_prevented(&self) -> bool {
        false
    }

    /// Whether the task was terminal at creation time.
    pub fn is_synchronous(&self) -> bool {
        matches!(self.inner, Inner::Done(_))
    }

    /// Whether cancellation can no longer take effect.
    pub fn is_cancellation_expired(&self) -> bool {
        match &self.inner {
            Inner::Blocking(core) => core.is_shielded() || core.is_done(),
            Inner::Done(_) => true,
        }
    }

    // === waiting ===

    /// Blocks until the task is done. Fails only with
    /// [`WaitError::Interrupted`].
    pub fn wait(&self) -> Result<&Self, WaitError> {
        match &self.inner {
            Inner::Blocking(core) => core.wait(None, true)?,
            Inner::Done(core) => core.wait(true)?,
        }
        Ok(self)
    }

    /// Blocks until the task is done, ignoring interruption. An interrupt
    /// arriving during the wait is left pending on the thread's flag.
    pub fn wait_uninterruptible(&self) -> &Self {
        match &self.inner {
            Inner::Blocking(core) => {
                // Infallible: no deadline, no interruption.
                let _ = core.wait(None, false);
            }
            Inner::Done(core) => {
                let _ = core.wait(false);
            }
        }
        self
    }

    /// Blocks until the task is done or `timeout` elapses. A timeout does
    /// not affect the task state.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<&Self, WaitError> {
        match &self.inner {
            Inner::Blocking(core) => core.wait(Some(timeout), true)?,
            Inner::Done(core) => core.wait(true)?,
        }
        Ok(self)
    }

    /// Timed wait that ignores interruption.
    pub fn wait_timeout_uninterruptible(&self, timeout: Duration) -> Result<&Self, WaitError> {
        match &self.inner {
            Inner::Blocking(core) => core.wait(Some(timeout), false)?,
            Inner::Done(core) => core.wait(false)?,
        }
        Ok(self)
    }

    /// Blocks until the task is done or `condition` is cancelled.
    ///
    /// The condition is an out parameter: its action slot is bound to this
    /// wait, and a condition that is already bound fails the call with
    /// [`WaitError::ConditionBound`]. A condition cancelled before the call
    /// begins aborts immediately without parking. Cancelling the condition
    /// aborts the *wait*, not the task.
    pub fn wait_cancellable(&self, condition: &CancelCondition) -> Result<&Self, WaitError> {
        match &self.inner {
            Inner::Blocking(core) => core.wait_cancellable(condition, None, true)?,
            Inner::Done(core) => core.wait(true)?,
        }
        Ok(self)
    }

    /// As [`wait_cancellable`](Self::wait_cancellable), ignoring
    /// interruption.
    pub fn wait_cancellable_uninterruptible(
        &self,
        condition: &CancelCondition,
    ) -> Result<&Self, WaitError> {
        match &self.inner {
            Inner::Blocking(core) => core.wait_cancellable(condition, None, false)?,
            Inner::Done(core) => core.wait(false)?,
        }
        Ok(self)
    }

    /// Blocks until the task is done, `timeout` elapses, or `condition` is
    /// cancelled.
    pub fn wait_timeout_cancellable(
        &self,
        timeout: Duration,
        condition: &CancelCondition,
    ) -> Result<&Self, WaitError> {
        match &self.inner {
            Inner::Blocking(core) => core.wait_cancellable(condition, Some(timeout), true)?,
            Inner::Done(core) => core.wait(true)?,
        }
        Ok(self)
    }

    /// As [`wait_timeout_cancellable`](Self::wait_timeout_cancellable),
    /// ignoring interruption.
    pub fn wait_timeout_cancellable_uninterruptible(
        &self,
        timeout: Duration,
        condition: &CancelCondition,
    ) -> Result<&Self, WaitError> {
        match &self.inner {
            Inner::Blocking(core) => core.wait_cancellable(condition, Some(timeout), false)?,
            Inner::Done(core) => core.wait(false)?,
        }
        Ok(self)
    }

    // === results and failures ===

    /// The result value, present only when the task completed successfully.
    /// Running, failed and cancelled tasks all report `None`.
    pub fn finished_result(&self) -> Option<Arc<T>> {
        match &self.inner {
            Inner::Blocking(core) => core.finished_result(),
            Inner::Done(core) => core.result(),
        }
    }

    /// Raw, non-waiting read of the result slot.
    pub fn result(&self) -> Option<Arc<T>> {
        match &self.inner {
            Inner::Blocking(core) => core.result(),
            Inner::Done(core) => core.result(),
        }
    }

    /// Re-raises the failure that caused this task to fail, consuming it:
    /// across all checker calls, exactly one observes the error. Returns
    /// `Ok` for every other state and for an already consumed failure.
    pub fn check_failure(&self) -> Result<&Self, Failure> {
        match &self.inner {
            Inner::Blocking(core) => core.check_failure()?,
            Inner::Done(core) => core.check_failure()?,
        }
        Ok(self)
    }

    /// As [`check_failure`](Self::check_failure), but only consumes and
    /// re-raises failures whose cause is of type `E`; any other failure is
    /// left unconsumed.
    pub fn check_failure_of<E>(&self) -> Result<&Self, Failure>
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        match &self.inner {
            Inner::Blocking(core) => core.check_failure_of::<E>()?,
            Inner::Done(core) => core.check_failure_of::<E>()?,
        }
        Ok(self)
    }

    /// Raises when the task did not succeed: a wrapped (consuming) failure,
    /// or the cancellation cause.
    pub fn check_success(&self) -> Result<&Self, CheckError> {
        match &self.inner {
            Inner::Blocking(core) => core.check_success()?,
            Inner::Done(core) => core.check_success()?,
        }
        Ok(self)
    }

    /// The failure cause, if the task failed. Non-consuming: keeps
    /// returning the same cause even after a checker consumed it.
    pub fn failure(&self) -> Option<Failure> {
        match &self.inner {
            Inner::Blocking(core) => core.failure(),
            Inner::Done(core) => core.failure(),
        }
    }

    /// The failure cause, if the task failed with an error of type `E`.
    pub fn failure_of<E>(&self) -> Option<Failure>
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.failure().filter(|failure| failure.is::<E>())
    }

    /// Whether a checker can still re-raise the stored failure.
    pub fn has_unconsumed_failure(&self) -> bool {
        match &self.inner {
            Inner::Blocking(core) => core.has_unconsumed_failure(),
            Inner::Done(core) => core.has_unconsumed_failure(),
        }
    }

    /// The cancellation cause, if the task was cancelled.
    pub fn cancellation_error(&self) -> Option<Cancelled> {
        match &self.inner {
            Inner::Blocking(core) => core.cancellation_error(),
            Inner::Done(core) => core.cancellation_error(),
        }
    }

    // === cancellation ===

    /// Attempts to cancel the task without a payload.
    pub fn cancel(&self) -> bool {
        self.cancel_opt(None)
    }

    /// Attempts to cancel the task, attaching `payload` to the cause.
    pub fn cancel_with(&self, payload: impl Any + Send + Sync) -> bool {
        self.cancel_opt(Some(Arc::new(payload)))
    }

    pub(crate) fn cancel_opt(&self, payload: Option<Payload>) -> bool {
        match &self.inner {
            Inner::Blocking(core) => core.cancel(payload),
            Inner::Done(_) => false,
        }
    }

    /// Cancels only while the task is executing. This family is running
    /// from birth, so this is [`cancel`](Self::cancel).
    pub fn cancel_if_running(&self) -> bool {
        self.cancel()
    }

    /// As [`cancel_if_running`](Self::cancel_if_running) with a payload.
    pub fn cancel_if_running_with(&self, payload: impl Any + Send + Sync) -> bool {
        self.cancel_with(payload)
    }

    /// Cancels only before the task has started. Never succeeds for this
    /// family; reserved for startable task kinds.
    pub fn cancel_if_not_started(&self) -> bool {
        false
    }

    /// As [`cancel_if_not_started`](Self::cancel_if_not_started) with a
    /// payload.
    pub fn cancel_if_not_started_with(&self, _payload: impl Any + Send + Sync) -> bool {
        false
    }

    // === subscriptions ===

    /// Runs `action` with the result when the task succeeds; immediately on
    /// the calling thread if it already did.
    pub fn on_success(&self, action: impl FnOnce(&T) + Send + 'static) -> &Self {
        match &self.inner {
            Inner::Blocking(core) => core.on_success().subscribe(action),
            Inner::Done(core) => core.on_success(action, None),
        }
        self
    }

    /// As [`on_success`](Self::on_success), delivered on the global
    /// executor.
    pub fn on_success_async(&self, action: impl FnOnce(&T) + Send + 'static) -> &Self {
        self.on_success_async_on(action, exec::global())
    }

    /// As [`on_success`](Self::on_success), delivered on `executor`.
    pub fn on_success_async_on(
        &self,
        action: impl FnOnce(&T) + Send + 'static,
        executor: Arc<dyn Executor>,
    ) -> &Self {
        match &self.inner {
            Inner::Blocking(core) => core.on_success().subscribe_async(action, executor),
            Inner::Done(core) => core.on_success(action, Some(executor)),
        }
        self
    }

    /// Runs `action` with the failure cause when the task fails.
    pub fn on_failure(&self, action: impl FnOnce(&Failure) + Send + 'static) -> &Self {
        match &self.inner {
            Inner::Blocking(core) => core.on_failure().subscribe(action),
            Inner::Done(core) => core.on_failure(action, None),
        }
        self
    }

    /// As [`on_failure`](Self::on_failure), delivered on the global
    /// executor.
    pub fn on_failure_async(&self, action: impl FnOnce(&Failure) + Send + 'static) -> &Self {
        self.on_failure_async_on(action, exec::global())
    }

    /// As [`on_failure`](Self::on_failure), delivered on `executor`.
    pub fn on_failure_async_on(
        &self,
        action: impl FnOnce(&Failure) + Send + 'static,
        executor: Arc<dyn Executor>,
    ) -> &Self {
        match &self.inner {
            Inner::Blocking(core) => core.on_failure().subscribe_async(action, executor),
            Inner::Done(core) => core.on_failure(action, Some(executor)),
        }
        self
    }

    /// Runs `action` with the cancellation cause when the task is
    /// cancelled.
    pub fn on_cancelled(&self, action: impl FnOnce(&Cancelled) + Send + 'static) -> &Self {
        match &self.inner {
            Inner::Blocking(core) => core.on_cancelled().subscribe(action),
            Inner::Done(core) => core.on_cancelled(action, None),
        }
        self
    }

    /// As [`on_cancelled`](Self::on_cancelled), delivered on the global
    /// executor.
    pub fn on_cancelled_async(&self, action: impl FnOnce(&Cancelled) + Send + 'static) -> &Self {
        self.on_cancelled_async_on(action, exec::global())
    }

    /// As [`on_cancelled`](Self::on_cancelled), delivered on `executor`.
    pub fn on_cancelled_async_on(
        &self,
        action: impl FnOnce(&Cancelled) + Send + 'static,
        executor: Arc<dyn Executor>,
    ) -> &Self {
        match &self.inner {
            Inner::Blocking(core) => core.on_cancelled().subscribe_async(action, executor),
            Inner::Done(core) => core.on_cancelled(action, Some(executor)),
        }
        self
    }

    /// Runs `action` with this task when it reaches any terminal state.
    /// Fires after the outcome-specific channel of the same completion.
    pub fn on_completion(&self, action: impl FnOnce(&Task<T>) + Send + 'static) -> &Self {
        match &self.inner {
            Inner::Blocking(core) => core.on_completion().subscribe(action),
            Inner::Done(core) => core.on_completion(action, None),
        }
        self
    }

    /// As [`on_completion`](Self::on_completion), delivered on the global
    /// executor.
    pub fn on_completion_async(&self, action: impl FnOnce(&Task<T>) + Send + 'static) -> &Self {
        self.on_completion_async_on(action, exec::global())
    }

    /// As [`on_completion`](Self::on_completion), delivered on `executor`.
    pub fn on_completion_async_on(
        &self,
        action: impl FnOnce(&Task<T>) + Send + 'static,
        executor: Arc<dyn Executor>,
    ) -> &Self {
        match &self.inner {
            Inner::Blocking(core) => core.on_completion().subscribe_async(action, executor),
            Inner::Done(core) => core.on_completion(action, Some(executor)),
        }
        self
    }

    /// Adapts this task to a [`std::future::Future`] resolving to the
    /// task's outcome. Failure observation through the future is
    /// non-consuming.
    pub fn into_future(self) -> TaskFuture<T> {
        TaskFuture::new(self)
    }
}

impl<T: Send + Sync + 'static> std::future::IntoFuture for Task<T> {
    type Output = Result<Arc<T>, CheckError>;
    type IntoFuture = TaskFuture<T>;

    fn into_future(self) -> TaskFuture<T> {
        TaskFuture::new(self)
    }
}

impl<T> fmt::Debug for Task<T>
where
    T: Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("state", &self.state())
            .field("synchronous", &self.is_synchronous())
            .finish()
    }
}
