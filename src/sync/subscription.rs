use crate::exec::Executor;
use crate::task::error::panic_payload_as_str;
use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::hint;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

const COLLECTING: u8 = 0;
const ADDING: u8 = 1;
const RUNNING: u8 = 2;
const EXPIRED: u8 = 3;
// RUNNING and EXPIRED both carry this bit: once set, the context latch is
// (being) published and new subscribers run synchronously.
const EXECUTED_MASK: u8 = 2;

type Callback<C> = Box<dyn FnOnce(Arc<C>) + Send>;

/// A one-shot fan-out of a context value to a list of subscribers.
///
/// Subscribers registered before [`execute`](Self::execute) are queued and
/// run in subscription order, on the executing thread, with the context
/// latched exactly once. Subscribers registered afterwards run immediately
/// on their own thread with the same latched context. Either way every
/// subscriber runs exactly once.
///
/// Lock-free: a four-state CAS cell guards the queue and the context latch.
/// The ADDING and RUNNING windows contain no suspension points beyond the
/// subscriber callbacks themselves, so competing threads spin.
///
/// Subscribers must not re-enter `subscribe` or `execute` on the same
/// handler from within their callback; doing so spins forever. Panics from
/// subscribers are caught and reported through `tracing`, never propagated
/// to the notifying thread.
pub struct SubscriptionHandler<C> {
    state: AtomicU8,
    // Guarded by `state`: mutated only inside the ADDING / RUNNING windows.
    queue: UnsafeCell<VecDeque<Callback<C>>>,
    // Written once inside the RUNNING window, immutable from EXPIRED on.
    context: UnsafeCell<Option<Arc<C>>>,
}

// Safety: the queue and the context cell are only touched by the single
// thread that won the ADDING or RUNNING state; after EXPIRED the context is
// read-only. Callbacks are Send, contexts are shared across threads.
unsafe impl<C: Send + Sync> Send for SubscriptionHandler<C> {}
unsafe impl<C: Send + Sync> Sync for SubscriptionHandler<C> {}

impl<C: Send + Sync + 'static> Default for SubscriptionHandler<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Send + Sync + 'static> SubscriptionHandler<C> {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(COLLECTING),
            queue: UnsafeCell::new(VecDeque::new()),
            context: UnsafeCell::new(None),
        }
    }

    /// Adds a subscriber, or runs it immediately if the handler has already
    /// executed.
    pub fn subscribe<F>(&self, action: F)
    where
        F: FnOnce(&C) + Send + 'static,
    {
        self.subscribe_raw(Box::new(move |context| action(&context)));
    }

    /// Adds a subscriber that is handed off to `executor` at notification
    /// time instead of running on the notifying thread.
    pub fn subscribe_async<F>(&self, action: F, executor: Arc<dyn Executor>)
    where
        F: FnOnce(&C) + Send + 'static,
    {
        self.subscribe_raw(Box::new(move |context| {
            let submitted = executor.execute(Box::new(move || action(&context)));
            if let Err(error) = submitted {
                tracing::error!(%error, "async subscriber dropped: executor rejected job");
            }
        }));
    }

    fn subscribe_raw(&self, action: Callback<C>) {
        loop {
            match self
                .state
                .compare_exchange(COLLECTING, ADDING, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(observed) if observed & EXECUTED_MASK != 0 => {
                    // Executed (or executing): wait for the drain to finish
                    // so the context is published, then run synchronously.
                    while self.state.load(Ordering::Acquire) == RUNNING {
                        hint::spin_loop();
                    }
                    // Safety: state is EXPIRED, context was latched by the
                    // executing thread and is immutable from here on.
                    let context = unsafe { (*self.context.get()).clone() }
                        .expect("FATAL: EXPIRED subscription handler without context");
                    run_isolated(action, context);
                    return;
                }
                Err(_) => hint::spin_loop(),
            }
        }

        // Safety: we own the ADDING window; no other thread touches the
        // queue until we CAS back to COLLECTING.
        unsafe { (*self.queue.get()).push_back(action) };

        if self
            .state
            .compare_exchange(ADDING, COLLECTING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            panic!("FATAL: subscription handler ADDING state modified by concurrent thread");
        }
    }

    /// Latches the context and runs every queued subscriber in FIFO order on
    /// the calling thread. Returns `false` without side effects when the
    /// handler has already executed; the supplier is then never called.
    pub fn execute(&self, context: impl FnOnce() -> Arc<C>) -> bool {
        loop {
            match self
                .state
                .compare_exchange(COLLECTING, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(EXPIRED) => return false,
                // ADDING or a concurrent RUNNING: spin until the short
                // window resolves.
                Err(_) => hint::spin_loop(),
            }
        }

        // Safety: we own the RUNNING window; subscribers and competing
        // executors spin until we publish EXPIRED.
        let context = context();
        unsafe { *self.context.get() = Some(context.clone()) };
        let drained: Vec<Callback<C>> = unsafe { (*self.queue.get()).drain(..).collect() };

        for action in drained {
            run_isolated(action, context.clone());
        }

        if self
            .state
            .compare_exchange(RUNNING, EXPIRED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            panic!("FATAL: subscription handler RUNNING state modified by concurrent thread");
        }
        true
    }

    /// Whether [`execute`](Self::execute) has already run (or is running).
    pub fn has_been_executed(&self) -> bool {
        self.state.load(Ordering::Acquire) & EXECUTED_MASK != 0
    }
}

impl<C> std::fmt::Debug for SubscriptionHandler<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self.state.load(Ordering::Acquire) {
            COLLECTING => "collecting",
            ADDING => "adding",
            RUNNING => "running",
            _ => "expired",
        };
        f.debug_struct("SubscriptionHandler")
            .field("state", &state)
            .finish()
    }
}

// Subscriber callbacks run to completion; a panicking subscriber must not
// poison the notifier or starve later subscribers.
pub(crate) fn run_isolated<C>(action: Callback<C>, context: Arc<C>) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| action(context))) {
        let message = panic_payload_as_str(&payload).unwrap_or("<non-string panic payload>");
        tracing::error!(panic = message, "subscriber panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn queued_subscribers_run_in_order_with_latched_context() {
        let handler: SubscriptionHandler<u32> = SubscriptionHandler::new();
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        for i in 0..3 {
            let seen = seen.clone();
            handler.subscribe(move |context| seen.lock().push((i, *context)));
        }
        assert!(handler.execute(|| Arc::new(42)));
        assert_eq!(*seen.lock(), vec![(0, 42), (1, 42), (2, 42)]);
    }

    #[test]
    fn execute_runs_at_most_once() {
        let handler: SubscriptionHandler<u32> = SubscriptionHandler::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = calls.clone();
        handler.subscribe(move |_| {
            counted.fetch_add(1, Ordering::SeqCst);
        });
        assert!(handler.execute(|| Arc::new(1)));
        assert!(!handler.execute(|| unreachable!("context supplier on expired handler")));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn late_subscriber_runs_synchronously() {
        let handler: SubscriptionHandler<u32> = SubscriptionHandler::new();
        assert!(handler.execute(|| Arc::new(7)));
        let seen = Arc::new(AtomicUsize::new(0));
        let sink = seen.clone();
        handler.subscribe(move |context| sink.store(*context as usize, Ordering::SeqCst));
        assert_eq!(seen.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn panicking_subscriber_does_not_poison_the_handler() {
        let handler: SubscriptionHandler<u32> = SubscriptionHandler::new();
        let reached = Arc::new(AtomicUsize::new(0));
        handler.subscribe(|_| panic!("boom"));
        let sink = reached.clone();
        handler.subscribe(move |_| {
            sink.fetch_add(1, Ordering::SeqCst);
        });
        assert!(handler.execute(|| Arc::new(0)));
        assert_eq!(reached.load(Ordering::SeqCst), 1);
        assert!(handler.has_been_executed());
    }
}
