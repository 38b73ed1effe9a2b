use crate::cancel::CancelCondition;
use crate::exec::Job;
use crate::sync::{Awaiter, Permit};
use crate::task::error::{WaitError, panic_payload_as_str};
use parking_lot::{Condvar, Mutex};
use std::collections::BinaryHeap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

/// Errors raised by timer operations.
#[derive(thiserror::Error, Debug, Clone)]
pub enum TimerError {
    /// The timer is shut down and no longer accepts schedules.
    #[error("timer is shut down and rejected the schedule")]
    Rejected,

    /// The cancel condition passed as an out parameter was already bound to
    /// another action.
    #[error("cancel condition was already bound to an action")]
    ConditionBound,

    /// The scheduler thread did not exit before the deadline.
    #[error("timed out waiting for timer shutdown")]
    ShutdownTimeout,

    /// Interrupted while waiting for the scheduler thread to exit.
    #[error("interrupted while waiting for timer shutdown")]
    Interrupted,
}

struct TimerEntry {
    deadline: Instant,
    // Taken exactly once, by the scheduler thread when due or by a cancel.
    job: Mutex<Option<Job>>,
    cancelled: AtomicBool,
}

impl TimerEntry {
    fn take_job(&self) -> Option<Job> {
        self.job.lock().take()
    }
}

/// A handle to one scheduled job.
#[derive(Clone)]
pub struct TimerHandle {
    entry: Arc<TimerEntry>,
}

impl TimerHandle {
    /// Time left until the job fires; zero once the deadline has passed.
    pub fn time_remaining(&self) -> Duration {
        self.entry.deadline.saturating_duration_since(Instant::now())
    }

    /// Prevents the job from running. Returns `true` only when the job had
    /// not run (and had not been cancelled) yet.
    pub fn cancel(&self) -> bool {
        if self.entry.take_job().is_some() {
            self.entry.cancelled.store(true, Ordering::SeqCst);
            true
        } else {
            false
        }
    }

    /// Whether this schedule was cancelled before it fired.
    pub fn is_cancelled(&self) -> bool {
        self.entry.cancelled.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerHandle")
            .field("remaining", &self.time_remaining())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

// Heap entry: earliest deadline first, FIFO among equal deadlines.
struct QueuedEntry {
    seq: u64,
    entry: Arc<TimerEntry>,
}

impl PartialEq for QueuedEntry {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}
impl Eq for QueuedEntry {}

impl PartialOrd for QueuedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // BinaryHeap is a max-heap; invert so the earliest deadline (then
        // the earliest submission) is popped first.
        other
            .entry
            .deadline
            .cmp(&self.entry.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Phase {
    Accepting,
    // Shut down: no new schedules, pending deadlines still fire.
    Draining,
    // Force-shut down: pending schedules were dropped.
    Halted,
}

struct TimerState {
    queue: BinaryHeap<QueuedEntry>,
    phase: Phase,
    next_seq: u64,
}

struct TimerShared {
    state: Mutex<TimerState>,
    cond: Condvar,
}

/// A one-shot job scheduler backed by a single named thread.
///
/// Time-based tasks (`delay`, `succeed_after`, ...) all go through the
/// process-wide [`global`] instance so that a timer never costs more than
/// one parked thread. Shutdown is terminal: a shut-down timer rejects every
/// new schedule.
pub struct Timer {
    shared: Arc<TimerShared>,
    done: Awaiter,
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

impl Timer {
    /// Creates a timer with its own scheduler thread.
    pub fn new() -> Self {
        Self::with_thread_name("taskling-timer")
    }

    pub(crate) fn with_thread_name(name: &str) -> Self {
        let shared = Arc::new(TimerShared {
            state: Mutex::new(TimerState {
                queue: BinaryHeap::new(),
                phase: Phase::Accepting,
                next_seq: 0,
            }),
            cond: Condvar::new(),
        });
        let done = Awaiter::new();

        let worker_shared = shared.clone();
        let worker_done = done.clone();
        thread::Builder::new()
            .name(name.to_string())
            .spawn(move || scheduler_loop(&worker_shared, &worker_done))
            .unwrap_or_else(|error| panic!("failed to spawn timer thread {name}: {error}"));

        tracing::debug!(thread_name = name, "timer started");
        Self { shared, done }
    }

    /// Schedules `job` to run once after `timeout` on the scheduler thread.
    pub fn schedule_once(
        &self,
        job: impl FnOnce() + Send + 'static,
        timeout: Duration,
    ) -> Result<TimerHandle, TimerError> {
        let mut state = self.shared.state.lock();
        if state.phase != Phase::Accepting {
            return Err(TimerError::Rejected);
        }

        let entry = Arc::new(TimerEntry {
            deadline: Instant::now() + timeout,
            job: Mutex::new(Some(Box::new(job))),
            cancelled: AtomicBool::new(false),
        });
        let seq = state.next_seq;
        state.next_seq += 1;
        state.queue.push(QueuedEntry {
            seq,
            entry: entry.clone(),
        });
        drop(state);
        self.shared.cond.notify_all();

        Ok(TimerHandle { entry })
    }

    /// Schedules `job` and binds `condition`'s cancel action to the
    /// resulting handle: cancelling the condition prevents the job from
    /// running. A condition that is already bound fails the schedule with
    /// [`TimerError::ConditionBound`] and the job is never scheduled.
    pub fn schedule_once_bound(
        &self,
        job: impl FnOnce() + Send + 'static,
        condition: &CancelCondition,
        timeout: Duration,
    ) -> Result<TimerHandle, TimerError> {
        // Bind first: a used condition must fail the call before anything
        // is scheduled.
        let scheduled = condition.bind_action_with_context(
            || self.schedule_once(job, timeout),
            |scheduled| match scheduled {
                Ok(handle) => {
                    let handle = handle.clone();
                    Box::new(move |_| handle.cancel())
                }
                Err(_) => Box::new(|_| false),
            },
        );
        match scheduled {
            None => Err(TimerError::ConditionBound),
            Some(result) => result,
        }
    }

    /// Stops accepting schedules. Already queued deadlines still fire; the
    /// scheduler thread exits once the queue is empty.
    pub fn shutdown(&self) {
        let mut state = self.shared.state.lock();
        if state.phase == Phase::Accepting {
            state.phase = Phase::Draining;
        }
        drop(state);
        self.shared.cond.notify_all();
    }

    /// Stops accepting schedules and waits until the scheduler thread has
    /// exited, up to `timeout`.
    pub fn await_shutdown(&self, timeout: Duration) -> Result<(), TimerError> {
        self.shutdown();
        match self.done.wait_timeout(Permit::MASTER, timeout) {
            Ok(_) => Ok(()),
            Err(WaitError::Timeout) => Err(TimerError::ShutdownTimeout),
            Err(_) => Err(TimerError::Interrupted),
        }
    }

    /// Stops accepting schedules and drops every pending one. Jobs already
    /// being executed run to completion.
    pub fn force_shutdown(&self) {
        let mut state = self.shared.state.lock();
        state.phase = Phase::Halted;
        state.queue.clear();
        drop(state);
        self.shared.cond.notify_all();
    }

    /// Whether a subsequent schedule can be expected to succeed.
    pub fn is_accepting_tasks(&self) -> bool {
        self.shared.state.lock().phase == Phase::Accepting
    }
}

fn scheduler_loop(shared: &TimerShared, done: &Awaiter) {
    let mut state = shared.state.lock();
    loop {
        if state.phase == Phase::Halted {
            break;
        }

        // Collect everything due, then run it outside the lock so that
        // schedules and cancels never wait on user jobs.
        let now = Instant::now();
        let mut due = Vec::new();
        while state
            .queue
            .peek()
            .is_some_and(|queued| queued.entry.deadline <= now)
        {
            due.push(state.queue.pop().expect("peeked entry disappeared").entry);
        }

        if !due.is_empty() {
            drop(state);
            for entry in due {
                if let Some(job) = entry.take_job() {
                    run_timer_job(job);
                }
            }
            state = shared.state.lock();
            continue;
        }

        if state.phase == Phase::Draining && state.queue.is_empty() {
            break;
        }

        match state.queue.peek().map(|queued| queued.entry.deadline) {
            Some(deadline) => {
                let _ = shared.cond.wait_until(&mut state, deadline);
            }
            None => shared.cond.wait(&mut state),
        }
    }
    drop(state);

    tracing::debug!("timer thread exiting");
    done.signal_all(Permit::MASTER);
}

fn run_timer_job(job: Job) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
        let message = panic_payload_as_str(&payload).unwrap_or("<non-string panic payload>");
        tracing::error!(panic = message, "timer job panicked");
    }
}

/// The process-wide timer behind the time-based task factories. Lazily
/// started on first use; shutting it down is terminal for the whole
/// process.
pub fn global() -> &'static Timer {
    static GLOBAL: OnceLock<Timer> = OnceLock::new();
    GLOBAL.get_or_init(Timer::new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn jobs_fire_in_deadline_order() {
        let timer = Timer::with_thread_name("timer-order");
        let (tx, rx) = mpsc::channel();
        for (label, delay_ms) in [("slow", 40_u64), ("fast", 10), ("mid", 25)] {
            let tx = tx.clone();
            timer
                .schedule_once(move || tx.send(label).unwrap(), Duration::from_millis(delay_ms))
                .unwrap();
        }
        let order: Vec<_> = (0..3).map(|_| rx.recv().unwrap()).collect();
        assert_eq!(order, vec!["fast", "mid", "slow"]);
        timer.await_shutdown(Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn cancelled_schedule_never_fires() {
        let timer = Timer::with_thread_name("timer-cancel");
        let (tx, rx) = mpsc::channel::<()>();
        let handle = timer
            .schedule_once(move || tx.send(()).unwrap(), Duration::from_millis(20))
            .unwrap();
        assert!(handle.cancel());
        assert!(!handle.cancel(), "second cancel reports failure");
        assert!(handle.is_cancelled());
        assert!(rx.recv_timeout(Duration::from_millis(60)).is_err());
        timer.await_shutdown(Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn condition_bound_schedule_is_cancelled_through_the_condition() {
        let timer = Timer::with_thread_name("timer-cond");
        let (tx, rx) = mpsc::channel::<()>();
        let condition = CancelCondition::new();
        let handle = timer
            .schedule_once_bound(
                move || tx.send(()).unwrap(),
                &condition,
                Duration::from_millis(30),
            )
            .unwrap();
        assert!(condition.cancel());
        assert!(handle.is_cancelled());
        assert!(rx.recv_timeout(Duration::from_millis(80)).is_err());
        timer.await_shutdown(Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn bound_schedule_rejects_a_used_condition() {
        let timer = Timer::with_thread_name("timer-cond-used");
        let condition = CancelCondition::new();
        assert!(condition.bind_action(|_| true));
        let (tx, rx) = mpsc::channel::<()>();
        let result = timer.schedule_once_bound(
            move || tx.send(()).unwrap(),
            &condition,
            Duration::from_millis(5),
        );
        assert!(matches!(result, Err(TimerError::ConditionBound)));
        assert!(
            rx.recv_timeout(Duration::from_millis(40)).is_err(),
            "job bound to a used condition must never run"
        );
        timer.await_shutdown(Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn shutdown_rejects_new_schedules_but_drains_pending_ones() {
        let timer = Timer::with_thread_name("timer-shutdown");
        let (tx, rx) = mpsc::channel();
        let tx2 = tx.clone();
        timer
            .schedule_once(move || tx2.send(1).unwrap(), Duration::from_millis(15))
            .unwrap();
        timer.shutdown();
        assert!(!timer.is_accepting_tasks());
        assert!(matches!(
            timer.schedule_once(move || tx.send(2).unwrap(), Duration::from_millis(1)),
            Err(TimerError::Rejected)
        ));
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), 1);
        timer.await_shutdown(Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn force_shutdown_drops_pending_schedules() {
        let timer = Timer::with_thread_name("timer-force");
        let (tx, rx) = mpsc::channel::<()>();
        timer
            .schedule_once(move || tx.send(()).unwrap(), Duration::from_millis(30))
            .unwrap();
        timer.force_shutdown();
        timer.await_shutdown(Duration::from_secs(1)).unwrap();
        assert!(rx.recv_timeout(Duration::from_millis(80)).is_err());
    }
}
