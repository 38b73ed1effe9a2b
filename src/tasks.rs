use crate::exec::{self, Executor};
use crate::task::blocking::BlockingCore;
use crate::task::error::{BindError, Cancelled, Failure, panic_payload_as_str};
use crate::task::{Completer, Task};
use crate::time::{self, TimerError};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

/// A task that is already successful with `value`.
pub fn success<T: Send + Sync + 'static>(value: T) -> Task<T> {
    Task::new_success(value)
}

/// A successful task without a meaningful result.
pub fn success_unit() -> Task<()> {
    success(())
}

/// A task that is already failed with `cause`.
pub fn failed<T: Send + Sync + 'static>(cause: impl Into<anyhow::Error>) -> Task<T> {
    Task::new_failed(Failure::new(cause))
}

/// A task that is already cancelled, without a payload.
pub fn cancelled<T: Send + Sync + 'static>() -> Task<T> {
    Task::new_cancelled(Cancelled::new("task cancelled at creation time", None))
}

/// A task that is already cancelled, carrying `payload`.
pub fn cancelled_with<T: Send + Sync + 'static>(payload: impl Any + Send + Sync) -> Task<T> {
    Task::new_cancelled(Cancelled::new(
        "task cancelled at creation time",
        Some(Arc::new(payload)),
    ))
}

/// Creates a running task paired with `completer`.
///
/// The completer is an out parameter: it is bound to the new task, and a
/// completer that was already used for another task fails with
/// [`BindError`].
pub fn start_blocking<T: Send + Sync + 'static>(
    completer: &Completer<T>,
) -> Result<Task<T>, BindError> {
    start_blocking_inner(completer, false)
}

/// As [`start_blocking`], but the task refuses every cancellation attempt;
/// only the completer can finish it.
pub fn start_blocking_shielded<T: Send + Sync + 'static>(
    completer: &Completer<T>,
) -> Result<Task<T>, BindError> {
    start_blocking_inner(completer, true)
}

fn start_blocking_inner<T: Send + Sync + 'static>(
    completer: &Completer<T>,
    shielded: bool,
) -> Result<Task<T>, BindError> {
    let core = BlockingCore::new(shielded);
    completer.bind(core.clone())?;
    Ok(Task::from_blocking(core))
}

/// A task that never completes on its own; it can only be cancelled.
pub fn waiting<T: Send + Sync + 'static>() -> Task<T> {
    Task::from_blocking(BlockingCore::new(false))
}

/// A task that succeeds (without a result) once `timeout` elapses, driven
/// by the [global timer](crate::time::global) instead of a blocked thread.
/// Cancelling the task before the deadline wins over the timer signal.
pub fn delay(timeout: Duration) -> Result<Task<()>, TimerError> {
    succeed_after((), timeout)
}

/// A task that is cancelled once `timeout` elapses.
pub fn cancel_after<T: Send + Sync + 'static>(timeout: Duration) -> Result<Task<T>, TimerError> {
    let task = waiting();
    let timed = task.clone();
    time::global().schedule_once(
        move || {
            timed.cancel();
        },
        timeout,
    )?;
    Ok(task)
}

/// As [`cancel_after`], attaching `payload` to the cancellation cause.
pub fn cancel_after_with<T: Send + Sync + 'static>(
    payload: impl Any + Send + Sync,
    timeout: Duration,
) -> Result<Task<T>, TimerError> {
    let task = waiting();
    let timed = task.clone();
    let payload = Arc::new(payload);
    time::global().schedule_once(
        move || {
            timed.cancel_opt(Some(payload));
        },
        timeout,
    )?;
    Ok(task)
}

/// A task that fails with `cause` once `timeout` elapses.
pub fn fail_after<T: Send + Sync + 'static>(
    cause: impl Into<anyhow::Error>,
    timeout: Duration,
) -> Result<Task<T>, TimerError> {
    let completer = Completer::new();
    let task = start_blocking(&completer).expect("fresh completer cannot be bound");
    let failure = Failure::new(cause);
    time::global().schedule_once(
        move || {
            let _ = completer.try_signal_failure_shared(failure);
        },
        timeout,
    )?;
    Ok(task)
}

/// A task that succeeds with `value` once `timeout` elapses.
pub fn succeed_after<T: Send + Sync + 'static>(
    value: T,
    timeout: Duration,
) -> Result<Task<T>, TimerError> {
    let completer = Completer::new();
    let task = start_blocking(&completer).expect("fresh completer cannot be bound");
    time::global().schedule_once(
        move || {
            let _ = completer.try_signal_success(value);
        },
        timeout,
    )?;
    Ok(task)
}

/// Composes a new task from `inner` with `operation` applied to its result.
///
/// - Inner success runs `operation` on the completing thread; its return
///   value completes the outer task. A panic in the operation fails the
///   outer task instead.
/// - Inner failure is forwarded as the same failure instance.
/// - Cancellation propagates in both directions, carrying the payload.
///
/// Both tasks hold each other alive through the cancellation wiring until
/// one of them completes; a chained pair that never completes and is never
/// cancelled stays allocated.
pub fn chain<I, V>(inner: &Task<I>, operation: impl FnOnce(&I) -> V + Send + 'static) -> Task<V>
where
    I: Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    wire_chain(inner, operation, None)
}

/// As [`chain`], but the mapping step and the forwarding run on the global
/// executor instead of the thread that completes `inner`.
pub fn chain_async<I, V>(
    inner: &Task<I>,
    operation: impl FnOnce(&I) -> V + Send + 'static,
) -> Task<V>
where
    I: Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    wire_chain(inner, operation, Some(exec::global()))
}

/// As [`chain_async`], with an explicit executor.
pub fn chain_async_on<I, V>(
    inner: &Task<I>,
    operation: impl FnOnce(&I) -> V + Send + 'static,
    executor: Arc<dyn Executor>,
) -> Task<V>
where
    I: Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    wire_chain(inner, operation, Some(executor))
}

fn wire_chain<I, V>(
    inner: &Task<I>,
    operation: impl FnOnce(&I) -> V + Send + 'static,
    executor: Option<Arc<dyn Executor>>,
) -> Task<V>
where
    I: Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    let completer = Completer::new();
    let outer = start_blocking(&completer).expect("fresh completer cannot be bound");

    let map = {
        let completer = completer.clone();
        move |value: &I| match panic::catch_unwind(AssertUnwindSafe(|| operation(value))) {
            Ok(mapped) => {
                let _ = completer.try_signal_success(mapped);
            }
            Err(payload) => {
                let message = panic_payload_as_str(&payload)
                    .unwrap_or("<non-string panic payload>")
                    .to_string();
                let _ = completer
                    .try_signal_failure(anyhow::anyhow!("chained operation panicked: {message}"));
            }
        }
    };
    let forward = move |failure: &Failure| {
        let _ = completer.try_signal_failure_shared(failure.clone());
    };
    let cancel_outer = {
        let outer = outer.clone();
        move |cause: &Cancelled| {
            outer.cancel_opt(cause.payload_arc());
        }
    };
    let cancel_inner = {
        let inner = inner.clone();
        move |cause: &Cancelled| {
            inner.cancel_opt(cause.payload_arc());
        }
    };

    match executor {
        None => {
            inner.on_success(map);
            inner.on_failure(forward);
            inner.on_cancelled(cancel_outer);
            outer.on_cancelled(cancel_inner);
        }
        Some(executor) => {
            inner.on_success_async_on(map, executor.clone());
            inner.on_failure_async_on(forward, executor.clone());
            inner.on_cancelled_async_on(cancel_outer, executor.clone());
            outer.on_cancelled_async_on(cancel_inner, executor);
        }
    }
    outer
}
