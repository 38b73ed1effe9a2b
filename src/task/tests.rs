use super::*;
use crate::cancel::CancelCondition;
use crate::sync::Interrupt;
use crate::task::error::{CheckError, SignalError, WaitError};
use crate::tasks::{
    self, cancelled, chain, chain_async_on, delay, failed, start_blocking,
    start_blocking_shielded, succeed_after, success, waiting,
};
use crate::test_utils::{InlineExecutor, RejectingExecutor};
use anyhow::Result;
use parking_lot::Mutex;
use rstest::rstest;
use static_assertions::assert_impl_all;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

assert_impl_all!(Task<u32>: Send, Sync, Clone);
assert_impl_all!(Completer<u32>: Send, Sync, Clone);
assert_impl_all!(CancelCondition: Send, Sync, Clone);
assert_impl_all!(crate::sync::Awaiter: Send, Sync, Clone);
assert_impl_all!(Interrupt: Send, Sync, Clone);

// === end-to-end scenarios ===

#[test]
fn completer_success_end_to_end() -> Result<()> {
    let completer = Completer::new();
    let task = start_blocking(&completer)?;

    let producer = completer.clone();
    let handle = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        producer.signal_success(42_u32)
    });

    let result = task.wait()?.finished_result();
    assert_eq!(result.as_deref(), Some(&42));
    assert_eq!(task.state(), TaskState::Success);
    assert!(handle.join().unwrap()?);
    Ok(())
}

#[test]
fn completer_failure_is_consumed_exactly_once() -> Result<()> {
    let completer = Completer::new();
    let task: Task<u32> = start_blocking(&completer)?;

    assert!(completer.signal_failure(anyhow::anyhow!("boom"))?);
    task.wait()?;

    let raised = task.check_failure();
    assert!(raised.is_err());
    assert!(!task.has_unconsumed_failure());
    assert!(task.check_failure().is_ok(), "second check returns normally");
    assert!(
        task.failure().is_some(),
        "non-consuming accessor still reports the cause"
    );
    Ok(())
}

#[test]
fn cancellation_races_completion_with_exactly_one_winner() -> Result<()> {
    for _ in 0..64 {
        let completer = Completer::new();
        let task = start_blocking(&completer)?;

        let producer = completer.clone();
        let signaller = thread::spawn(move || producer.signal_success(1_u32));
        let canceller = {
            let task = task.clone();
            thread::spawn(move || task.cancel_with("stop"))
        };

        let signalled = signaller.join().unwrap();
        let cancelled = canceller.join().unwrap();

        match task.state() {
            TaskState::Success => {
                assert!(matches!(signalled, Ok(true)));
                assert!(!cancelled);
                assert_eq!(task.finished_result().as_deref(), Some(&1));
            }
            TaskState::Cancelled => {
                assert!(cancelled);
                match signalled {
                    Err(SignalError::Cancelled(cause)) => {
                        assert_eq!(cause.payload_as::<&str>(), Some(&"stop"));
                    }
                    other => panic!("signal must observe the cancellation, got {other:?}"),
                }
                let cause = task.cancellation_error().unwrap();
                assert_eq!(cause.payload_as::<&str>(), Some(&"stop"));
            }
            other => panic!("no other outcome is permissible, got {other:?}"),
        }
    }
    Ok(())
}

#[test]
fn wait_with_cancel_condition_aborts_the_wait_not_the_task() -> Result<()> {
    let completer = Completer::new();
    let task: Task<u32> = start_blocking(&completer)?;
    let condition = CancelCondition::new();

    let canceller = condition.clone();
    let handle = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        canceller.cancel()
    });

    let start = Instant::now();
    let result = task.wait_cancellable(&condition);
    assert!(matches!(result, Err(WaitError::Cancelled(_))));
    assert!(start.elapsed() >= Duration::from_millis(15));

    assert_eq!(task.state(), TaskState::Running);
    assert!(!task.is_cancelled());
    assert!(condition.is_cancelled());
    assert!(handle.join().unwrap());
    Ok(())
}

#[test]
fn chain_maps_results_and_propagates_cancellation_to_the_inner_task() -> Result<()> {
    let task = chain(&succeed_after(10_u32, Duration::from_millis(5))?, |x| x * 2);
    assert_eq!(task.wait()?.finished_result().as_deref(), Some(&20));

    let inner: Task<u32> = waiting();
    let outer = chain(&inner, |x| *x);
    assert!(outer.cancel_with("x"));
    assert!(inner.is_cancelled(), "cancellation propagates to the inner task");
    assert_eq!(
        inner.cancellation_error().unwrap().payload_as::<&str>(),
        Some(&"x")
    );
    Ok(())
}

#[test]
fn delay_times_out_then_completes() -> Result<()> {
    let task = delay(Duration::from_millis(100))?;
    assert!(matches!(
        task.wait_timeout(Duration::from_millis(10)),
        Err(WaitError::Timeout)
    ));
    task.wait_timeout(Duration::from_millis(400))?;
    assert!(task.is_successful());
    Ok(())
}

// === invariants ===

#[test]
fn terminal_predicates_are_mutually_exclusive_and_monotone() -> Result<()> {
    let completer = Completer::new();
    let task = start_blocking(&completer)?;
    assert!(task.is_running() && !task.is_done());

    completer.signal_success(7_u32)?;
    assert!(task.is_done());
    let exclusive = [task.is_successful(), task.is_failed(), task.is_cancelled()];
    assert_eq!(exclusive.iter().filter(|set| **set).count(), 1);

    // Later mutation attempts change nothing.
    assert!(!task.cancel());
    assert!(matches!(
        completer.signal_failure(anyhow::anyhow!("late")),
        Ok(false)
    ));
    assert!(task.is_done() && task.is_successful());
    Ok(())
}

#[test]
fn subscribers_run_exactly_once_before_and_after_completion() -> Result<()> {
    let completer = Completer::new();
    let task = start_blocking(&completer)?;

    let runs = Arc::new(AtomicUsize::new(0));
    let early = runs.clone();
    task.on_success(move |value| {
        assert_eq!(*value, 3);
        early.fetch_add(1, Ordering::SeqCst);
    });

    completer.signal_success(3_u32)?;

    let late = runs.clone();
    task.on_success(move |value| {
        assert_eq!(*value, 3);
        late.fetch_add(1, Ordering::SeqCst);
    });

    assert_eq!(runs.load(Ordering::SeqCst), 2);
    Ok(())
}

#[test]
fn outcome_channel_fires_before_completion_channel() -> Result<()> {
    let completer = Completer::new();
    let task: Task<u32> = start_blocking(&completer)?;

    let order = Arc::new(Mutex::new(Vec::new()));
    let cancelled_order = order.clone();
    task.on_cancelled(move |_| cancelled_order.lock().push("cancelled"));
    let completion_order = order.clone();
    task.on_completion(move |completed| {
        assert!(completed.is_done());
        completion_order.lock().push("completion");
    });

    assert!(task.cancel());
    assert_eq!(*order.lock(), vec!["cancelled", "completion"]);
    Ok(())
}

#[test]
fn completer_binds_at_most_once() -> Result<()> {
    let completer: Completer<u32> = Completer::new();
    let _task = start_blocking(&completer)?;
    assert!(start_blocking(&completer).is_err());
    Ok(())
}

#[test]
fn unbound_completer_rejects_signals() {
    let completer: Completer<u32> = Completer::new();
    assert!(matches!(
        completer.signal_success(1),
        Err(SignalError::Unbound)
    ));
    assert!(matches!(
        completer.try_signal_failure(anyhow::anyhow!("x")),
        Err(SignalError::Unbound)
    ));
    assert!(!completer.is_cancelled());
}

#[test]
fn try_signals_swallow_only_the_cancellation() -> Result<()> {
    let completer = Completer::new();
    let task = start_blocking(&completer)?;
    assert!(task.cancel());

    assert!(matches!(completer.try_signal_success(5_u32), Ok(false)));
    assert!(matches!(
        completer.try_signal_failure(anyhow::anyhow!("x")),
        Ok(false)
    ));
    assert!(matches!(
        completer.signal_success(5_u32),
        Err(SignalError::Cancelled(_))
    ));
    Ok(())
}

// === boundaries ===

#[rstest]
#[case::success(success(1_i32))]
#[case::failed(failed(anyhow::anyhow!("x")))]
#[case::cancelled(cancelled())]
fn done_tasks_reject_cancellation(#[case] task: Task<i32>) {
    assert!(!task.cancel());
    assert!(!task.cancel_if_running());
    assert!(!task.cancel_if_not_started());
    assert!(task.is_done());
    assert!(task.is_synchronous());
    assert!(task.is_cancellation_expired());
}

#[test]
fn finished_result_is_present_only_on_success() -> Result<()> {
    let completer = Completer::new();
    let running: Task<u32> = start_blocking(&completer)?;
    assert!(running.finished_result().is_none());

    let cancelled_task: Task<u32> = cancelled();
    assert!(cancelled_task.finished_result().is_none());

    let failed_task: Task<u32> = failed(anyhow::anyhow!("x"));
    assert!(failed_task.finished_result().is_none());

    assert_eq!(success(9_u32).finished_result().as_deref(), Some(&9));
    Ok(())
}

#[test]
fn precancelled_condition_aborts_the_wait_without_parking() -> Result<()> {
    let condition = CancelCondition::new();
    condition.bind_action(|_| true);
    assert!(condition.cancel_with("early"));

    let task: Task<u32> = waiting();
    let start = Instant::now();
    match task.wait_cancellable(&condition) {
        Err(WaitError::Cancelled(cause)) => {
            assert_eq!(cause.payload_as::<&str>(), Some(&"early"));
        }
        other => panic!("expected cancellation, got {other:?}"),
    }
    assert!(start.elapsed() < Duration::from_millis(50));
    Ok(())
}

#[test]
fn bound_condition_fails_the_wait_as_an_out_parameter() {
    let condition = CancelCondition::new();
    assert!(condition.bind_action(|_| true));

    let task: Task<u32> = waiting();
    assert!(matches!(
        task.wait_timeout_cancellable(Duration::from_millis(10), &condition),
        Err(WaitError::ConditionBound)
    ));
}

#[test]
fn check_success_raises_cancellation_and_wrapped_failure() -> Result<()> {
    let cancelled_task: Task<u32> = cancelled_with_payload("why");
    match cancelled_task.check_success() {
        Err(CheckError::Cancelled(cause)) => {
            assert_eq!(cause.payload_as::<&str>(), Some(&"why"));
        }
        other => panic!("expected cancellation, got {other:?}"),
    }

    let failed_task: Task<u32> = failed(anyhow::anyhow!("root cause"));
    match failed_task.check_success() {
        Err(CheckError::Failed(failure)) => {
            assert!(format!("{failure}").contains("root cause"));
        }
        other => panic!("expected failure, got {other:?}"),
    }
    // The wrap consumed the stored failure.
    assert!(!failed_task.has_unconsumed_failure());
    assert!(failed_task.check_success().is_ok());
    Ok(())
}

fn cancelled_with_payload(payload: &'static str) -> Task<u32> {
    tasks::cancelled_with(payload)
}

#[test]
fn typed_checker_leaves_unrelated_failures_unconsumed() -> Result<()> {
    #[derive(thiserror::Error, Debug)]
    #[error("io-ish")]
    struct IoLike;

    let task: Task<u32> = failed(anyhow::anyhow!("plain"));
    assert!(task.check_failure_of::<IoLike>()?.has_unconsumed_failure());

    let typed: Task<u32> = failed(anyhow::Error::new(IoLike));
    assert!(typed.check_failure_of::<IoLike>().is_err());
    assert!(!typed.has_unconsumed_failure());
    Ok(())
}

#[test]
fn chain_forwards_the_same_failure_instance() -> Result<()> {
    let completer = Completer::new();
    let inner: Task<u32> = start_blocking(&completer)?;
    let outer = chain(&inner, |x| *x);

    completer.signal_failure(anyhow::anyhow!("shared"))?;
    outer.wait()?;

    let inner_failure = inner.failure().unwrap();
    let outer_failure = outer.failure().unwrap();
    assert!(inner_failure.same_cause(&outer_failure));
    Ok(())
}

#[test]
fn chain_panic_fails_the_outer_task() -> Result<()> {
    let inner = success(2_u32);
    let outer: Task<u32> = chain(&inner, |_| panic!("mapper exploded"));
    outer.wait()?;
    assert!(outer.is_failed());
    assert!(format!("{}", outer.failure().unwrap()).contains("mapper exploded"));
    Ok(())
}

#[test]
fn chain_async_runs_on_the_provided_executor() -> Result<()> {
    let executor = InlineExecutor::new();
    let completer = Completer::new();
    let inner: Task<u32> = start_blocking(&completer)?;
    let outer = chain_async_on(&inner, |x| x + 1, executor.clone());

    completer.signal_success(4)?;
    outer.wait()?;
    assert_eq!(outer.finished_result().as_deref(), Some(&5));
    assert!(executor.submitted() >= 1);
    Ok(())
}

#[test]
fn rejected_async_subscriber_does_not_disturb_completion() -> Result<()> {
    let completer = Completer::new();
    let task = start_blocking(&completer)?;
    let ran = Arc::new(AtomicUsize::new(0));
    let sink = ran.clone();
    task.on_success_async_on(
        move |_| {
            sink.fetch_add(1, Ordering::SeqCst);
        },
        Arc::new(RejectingExecutor),
    );

    assert!(completer.signal_success(1_u32)?);
    assert_eq!(task.state(), TaskState::Success);
    assert_eq!(ran.load(Ordering::SeqCst), 0, "rejected job is dropped");
    Ok(())
}

#[test]
fn shielded_task_ignores_cancellation() -> Result<()> {
    let completer = Completer::new();
    let task = start_blocking_shielded(&completer)?;
    assert!(task.is_cancellation_expired());
    assert!(!task.cancel_with("no"));
    assert!(task.is_running());

    completer.signal_success(11_u32)?;
    assert_eq!(task.finished_result().as_deref(), Some(&11));
    Ok(())
}

#[test]
fn interrupt_aborts_an_interruptible_task_wait() -> Result<()> {
    let task: Task<u32> = waiting();
    let (tx, rx) = std::sync::mpsc::channel();
    let waiter = task.clone();
    let handle = thread::spawn(move || {
        tx.send(Interrupt::current()).unwrap();
        waiter.wait().err()
    });
    thread::sleep(Duration::from_millis(20));
    rx.recv().unwrap().interrupt();
    assert!(matches!(handle.join().unwrap(), Some(WaitError::Interrupted)));
    assert!(task.is_running(), "an interrupted wait leaves the task alone");
    Ok(())
}

#[test]
fn waiting_task_completes_only_through_cancellation() {
    let task: Task<u32> = waiting();
    assert!(matches!(
        task.wait_timeout(Duration::from_millis(20)),
        Err(WaitError::Timeout)
    ));
    assert!(task.cancel());
    assert!(task.wait_timeout(Duration::from_millis(20)).is_ok());
    assert_eq!(task.state(), TaskState::Cancelled);
}

#[test]
fn cancel_after_cancels_with_the_payload() -> Result<()> {
    let task: Task<u32> = tasks::cancel_after_with("deadline", Duration::from_millis(10))?;
    task.wait()?;
    assert!(task.is_cancelled());
    assert_eq!(
        task.cancellation_error().unwrap().payload_as::<&str>(),
        Some(&"deadline")
    );
    Ok(())
}

#[test]
fn fail_after_fails_with_the_cause() -> Result<()> {
    let task: Task<u32> = tasks::fail_after(anyhow::anyhow!("too late"), Duration::from_millis(10))?;
    task.wait()?;
    assert!(task.is_failed());
    assert!(format!("{}", task.failure().unwrap()).contains("too late"));
    Ok(())
}

#[test]
fn zero_delay_succeed_after_round_trips_the_value() -> Result<()> {
    let task = succeed_after(99_u32, Duration::ZERO)?;
    assert_eq!(task.wait()?.finished_result().as_deref(), Some(&99));
    Ok(())
}

#[test]
fn chaining_a_done_task_applies_the_operation_inline() -> Result<()> {
    let task = chain(&success(21_u32), |x| x * 2);
    assert_eq!(task.wait()?.finished_result().as_deref(), Some(&42));
    Ok(())
}

#[test]
fn every_waiter_wakes_on_completion() -> Result<()> {
    let completer = Completer::new();
    let task = start_blocking(&completer)?;

    let waiters: Vec<_> = (0..4)
        .map(|_| {
            let task = task.clone();
            thread::spawn(move || task.wait().map(|t| t.finished_result()).ok().flatten())
        })
        .collect();

    thread::sleep(Duration::from_millis(20));
    completer.signal_success(6_u32)?;

    for waiter in waiters {
        assert_eq!(waiter.join().unwrap().as_deref(), Some(&6));
    }
    Ok(())
}
