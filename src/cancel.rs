use crate::exec::{self, Executor};
use crate::sync::{AssignOnce, Permit, SubscriptionHandler};
use crate::task::error::{Cancelled, Payload};
use std::any::Any;
use std::hint;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

const IDLE: u8 = 0;
const TESTING: u8 = 1;
const RUNNING: u8 = 2;
const EXECUTED: u8 = 3;
// RUNNING and EXECUTED both carry this bit: the cancellation went through.
const EXPIRED_MASK: u8 = 2;

pub(crate) type CancelAction = Box<dyn Fn(&Cancelled) -> bool + Send + Sync>;

struct Inner {
    state: AtomicU8,
    // The action decides whether a requested cancellation actually takes
    // effect. Bound at most once; without it `cancel` is a no-op.
    action: AssignOnce<CancelAction>,
    cause: AssignOnce<Cancelled>,
    handlers: SubscriptionHandler<Cancelled>,
}

/// A one-shot cancellation signal that any observer can trigger.
///
/// A condition starts idle and unbound. Passing it to a blocking API (a
/// cancellable wait, a timer schedule) binds its *cancel action*, the
/// predicate that decides whether a requested cancellation succeeds. The
/// action slot is write-once: a condition can be associated with exactly
/// one operation, and reusing it fails that operation with an
/// out-parameter-state error.
///
/// [`cancel`](Self::cancel) succeeds at most once. A successful cancel
/// publishes its cause before any subscriber runs, so handlers (and threads
/// woken by the action) always observe a complete cancellation.
#[derive(Clone)]
pub struct CancelCondition {
    inner: Arc<Inner>,
}

impl Default for CancelCondition {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelCondition {
    /// Creates a standalone condition, not yet associated with any action.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: AtomicU8::new(IDLE),
                action: AssignOnce::new(),
                cause: AssignOnce::new(),
                handlers: SubscriptionHandler::new(),
            }),
        }
    }

    // Write-once binding of the cancel action. Returns false on the second
    // attempt; the caller translates that into its out-parameter error.
    pub(crate) fn bind_action(
        &self,
        action: impl Fn(&Cancelled) -> bool + Send + Sync + 'static,
    ) -> bool {
        self.inner.action.try_assign(Box::new(action))
    }

    // Binding for out-parameter call sites that create the guarded resource
    // together with the action. Neither closure runs when the slot is taken;
    // the context is handed back to the caller on success.
    pub(crate) fn bind_action_with_context<Ctx>(
        &self,
        context: impl FnOnce() -> Ctx,
        action: impl FnOnce(&Ctx) -> CancelAction,
    ) -> Option<Ctx> {
        self.inner.action.try_assign_with_context(context, action)
    }

    /// Requests cancellation without a payload.
    pub fn cancel(&self) -> bool {
        self.cancel_opt(None)
    }

    /// Requests cancellation, attaching `payload` to the resulting
    /// [`Cancelled`] cause.
    pub fn cancel_with(&self, payload: impl Any + Send + Sync) -> bool {
        self.cancel_opt(Some(Arc::new(payload)))
    }

    pub(crate) fn cancel_opt(&self, payload: Option<Payload>) -> bool {
        // No bound action means there is nothing to cancel.
        let Some(action) = self.inner.action.get() else {
            return false;
        };

        loop {
            match self
                .inner
                .state
                .compare_exchange(IDLE, TESTING, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(observed) if observed & EXPIRED_MASK != 0 => {
                    // Someone else already cancelled successfully.
                    return false;
                }
                // A concurrent cancel is in its TESTING window; it either
                // wins (EXPIRED) or backs off to IDLE.
                Err(_) => hint::spin_loop(),
            }
        }

        let cause = Cancelled::new("operation cancelled by condition", payload);
        if action(&cause) {
            if self
                .inner
                .state
                .compare_exchange(TESTING, RUNNING, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                panic!("FATAL: cancel condition TESTING state modified by concurrent thread");
            }

            // The cause must be readable before any handler runs.
            if !self.inner.cause.try_assign(cause.clone()) {
                panic!("FATAL: cancel condition cause assigned twice");
            }
            if !self.inner.handlers.execute(|| Arc::new(cause)) {
                panic!("FATAL: cancel condition handlers executed twice");
            }

            if self
                .inner
                .state
                .compare_exchange(RUNNING, EXECUTED, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                panic!("FATAL: cancel condition RUNNING state modified by concurrent thread");
            }
            true
        } else {
            // The action refused; release the condition for later attempts.
            if self
                .inner
                .state
                .compare_exchange(TESTING, IDLE, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                panic!("FATAL: cancel condition TESTING state modified by concurrent thread");
            }
            false
        }
    }

    /// Whether a cancellation has gone through.
    pub fn is_cancelled(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) & EXPIRED_MASK != 0
    }

    /// The cause of the successful cancellation, `None` while
    /// [`is_cancelled`](Self::is_cancelled) is false.
    pub fn cancellation_error(&self) -> Option<Cancelled> {
        self.inner.cause.get().cloned()
    }

    // For threads woken by the cancel action: the action runs before the
    // cause is published, so a woken waiter may arrive a few atomic writes
    // early. Bounded spin, no user code in the window.
    pub(crate) fn cancellation_error_blocking(&self) -> Cancelled {
        loop {
            if let Some(cause) = self.inner.cause.get() {
                return cause.clone();
            }
            hint::spin_loop();
        }
    }

    /// Adds a handler that runs when this condition is cancelled, or
    /// immediately on the calling thread if it already was.
    pub fn on_cancelled(&self, action: impl FnOnce(&Cancelled) + Send + 'static) -> &Self {
        self.inner.handlers.subscribe(action);
        self
    }

    /// As [`on_cancelled`](Self::on_cancelled), but the handler is submitted
    /// to the global executor instead of running on the cancelling thread.
    pub fn on_cancelled_async(&self, action: impl FnOnce(&Cancelled) + Send + 'static) -> &Self {
        self.on_cancelled_async_on(action, exec::global())
    }

    /// As [`on_cancelled`](Self::on_cancelled), but the handler is submitted
    /// to `executor`.
    pub fn on_cancelled_async_on(
        &self,
        action: impl FnOnce(&Cancelled) + Send + 'static,
        executor: Arc<dyn Executor>,
    ) -> &Self {
        self.inner.handlers.subscribe_async(action, executor);
        self
    }

    // The identity of this condition as an awaiter permit key.
    pub(crate) fn permit(&self) -> Permit {
        Permit::from_raw(Arc::as_ptr(&self.inner) as usize)
    }
}

impl std::fmt::Debug for CancelCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelCondition")
            .field("bound", &self.inner.action.is_assigned())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn cancel_without_action_is_a_noop() {
        let condition = CancelCondition::new();
        assert!(!condition.cancel());
        assert!(!condition.is_cancelled());
        assert!(condition.cancellation_error().is_none());
    }

    #[test]
    fn action_binds_once() {
        let condition = CancelCondition::new();
        assert!(condition.bind_action(|_| true));
        assert!(!condition.bind_action(|_| true));
    }

    #[test]
    fn cancel_succeeds_at_most_once() {
        let condition = CancelCondition::new();
        condition.bind_action(|_| true);
        assert!(condition.cancel_with("stop"));
        assert!(!condition.cancel_with("again"));
        let cause = condition.cancellation_error().unwrap();
        assert_eq!(cause.payload_as::<&str>(), Some(&"stop"));
    }

    #[test]
    fn refusing_action_leaves_the_condition_reusable() {
        let condition = CancelCondition::new();
        let attempts = Arc::new(AtomicUsize::new(0));
        let counted = attempts.clone();
        condition.bind_action(move |_| counted.fetch_add(1, Ordering::SeqCst) > 0);
        assert!(!condition.cancel());
        assert!(!condition.is_cancelled());
        assert!(condition.cancel());
        assert!(condition.is_cancelled());
    }

    #[test]
    fn cause_is_published_before_handlers_run() {
        let condition = CancelCondition::new();
        condition.bind_action(|_| true);
        let observed = condition.clone();
        let saw_cause = Arc::new(AtomicUsize::new(0));
        let sink = saw_cause.clone();
        condition.on_cancelled(move |cause| {
            assert!(observed.cancellation_error().is_some());
            sink.store(
                cause.payload_as::<u32>().copied().unwrap_or(0) as usize,
                Ordering::SeqCst,
            );
        });
        assert!(condition.cancel_with(9_u32));
        assert_eq!(saw_cause.load(Ordering::SeqCst), 9);
    }

    #[test]
    fn late_subscriber_runs_inline_with_the_cause() {
        let condition = CancelCondition::new();
        condition.bind_action(|_| true);
        condition.cancel_with("late");
        let seen = Arc::new(AtomicUsize::new(0));
        let sink = seen.clone();
        condition.on_cancelled(move |cause| {
            assert_eq!(cause.payload_as::<&str>(), Some(&"late"));
            sink.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
