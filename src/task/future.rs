use crate::task::Task;
use crate::task::error::CheckError;
use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

/// Adapts a [`Task`] to a [`Future`].
///
/// The first poll registers a completion subscriber that wakes the stored
/// waker; later polls only refresh the waker. Resolves to the task's
/// result, or to the failure / cancellation cause. Observing a failure this
/// way does not consume it.
pub struct TaskFuture<T> {
    task: Task<T>,
    waker: Arc<Mutex<Option<Waker>>>,
    registered: bool,
}

impl<T: Send + Sync + 'static> TaskFuture<T> {
    pub(crate) fn new(task: Task<T>) -> Self {
        Self {
            task,
            waker: Arc::new(Mutex::new(None)),
            registered: false,
        }
    }

    fn outcome(&self) -> Option<Result<Arc<T>, CheckError>> {
        if !self.task.is_done() {
            return None;
        }
        if let Some(value) = self.task.finished_result() {
            return Some(Ok(value));
        }
        if let Some(cause) = self.task.cancellation_error() {
            return Some(Err(CheckError::Cancelled(cause)));
        }
        // Done without result or cancellation: the failure is (being)
        // published; `failure()` bridges the remaining window.
        let failure = self
            .task
            .failure()
            .expect("FATAL: task done without result, failure or cancellation");
        Some(Err(CheckError::Failed(failure)))
    }
}

impl<T: Send + Sync + 'static> Future for TaskFuture<T> {
    type Output = Result<Arc<T>, CheckError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        // Store the waker before subscribing so a completion racing the
        // first poll cannot miss it.
        *this.waker.lock() = Some(cx.waker().clone());

        if !this.registered {
            this.registered = true;
            let waker = this.waker.clone();
            this.task.on_completion(move |_| {
                if let Some(waker) = waker.lock().take() {
                    waker.wake();
                }
            });
        }

        match this.outcome() {
            Some(outcome) => Poll::Ready(outcome),
            None => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Completer;
    use crate::tasks;
    use std::thread;
    use std::time::Duration;

    // Minimal single-future executor; the crate deliberately has no async
    // runtime of its own.
    fn block_on<F: Future>(mut future: F) -> F::Output {
        use std::sync::mpsc;
        use std::task::{RawWaker, RawWakerVTable, Waker};

        fn vtable() -> &'static RawWakerVTable {
            &RawWakerVTable::new(
                |data| RawWaker::new(data, vtable()),
                |data| unsafe {
                    let sender = &*(data as *const mpsc::Sender<()>);
                    let _ = sender.send(());
                },
                |data| unsafe {
                    let sender = &*(data as *const mpsc::Sender<()>);
                    let _ = sender.send(());
                },
                |_| {},
            )
        }

        let (tx, rx) = mpsc::channel::<()>();
        let tx = Box::leak(Box::new(tx));
        let waker = unsafe {
            Waker::from_raw(RawWaker::new(
                tx as *const mpsc::Sender<()> as *const (),
                vtable(),
            ))
        };
        let mut cx = Context::from_waker(&waker);
        // Safety: the future never moves out of this frame.
        let mut future = unsafe { Pin::new_unchecked(&mut future) };
        loop {
            match future.as_mut().poll(&mut cx) {
                Poll::Ready(output) => return output,
                Poll::Pending => rx.recv().expect("waker dropped without waking"),
            }
        }
    }

    #[test]
    fn future_resolves_with_the_result() {
        let completer = Completer::new();
        let task = tasks::start_blocking(&completer).unwrap();
        let producer = completer.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            producer.signal_success(5_u32).unwrap();
        });
        let value = block_on(task.into_future()).unwrap();
        assert_eq!(*value, 5);
    }

    #[test]
    fn future_surfaces_cancellation() {
        let task: Task<u32> = tasks::cancelled_with("gone");
        let outcome = block_on(task.into_future());
        match outcome {
            Err(CheckError::Cancelled(cause)) => {
                assert_eq!(cause.payload_as::<&str>(), Some(&"gone"));
            }
            other => panic!("expected cancellation, got {other:?}"),
        }
    }

    #[test]
    fn future_does_not_consume_the_failure() {
        let task: Task<u32> = tasks::failed(anyhow::anyhow!("boom"));
        assert!(matches!(
            block_on(task.clone().into_future()),
            Err(CheckError::Failed(_))
        ));
        assert!(task.has_unconsumed_failure());
    }
}
