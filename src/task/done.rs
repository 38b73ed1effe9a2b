use crate::exec::Executor;
use crate::sync::interrupt;
use crate::sync::run_isolated;
use crate::task::error::{Cancelled, CheckError, Failure, WaitError};
use crate::task::{Task, TaskState};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// A task that was already terminal when it was created.
///
/// Answers every query without synchronization, rejects cancellation, and
/// runs subscriber callbacks inline (or submits them straight to the
/// executor), since its terminal state is eternal.
pub(crate) enum DoneCore<T> {
    Success(Arc<T>),
    Failed {
        failure: Failure,
        consumed: AtomicBool,
    },
    Cancelled(Cancelled),
}

impl<T: Send + Sync + 'static> DoneCore<T> {
    pub(crate) fn state(&self) -> TaskState {
        match self {
            DoneCore::Success(_) => TaskState::Success,
            DoneCore::Failed { .. } => TaskState::Failed,
            DoneCore::Cancelled(_) => TaskState::Cancelled,
        }
    }

    pub(crate) fn is_successful(&self) -> bool {
        matches!(self, DoneCore::Success(_))
    }

    pub(crate) fn is_failed(&self) -> bool {
        matches!(self, DoneCore::Failed { .. })
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        matches!(self, DoneCore::Cancelled(_))
    }

    // Waiting on a finished task only has to honor the interrupt contract:
    // an interruptible wait with the flag already set fails without
    // parking.
    pub(crate) fn wait(&self, interruptible: bool) -> Result<(), WaitError> {
        if interruptible && interrupt::take_interrupted() {
            return Err(WaitError::Interrupted);
        }
        Ok(())
    }

    pub(crate) fn result(&self) -> Option<Arc<T>> {
        match self {
            DoneCore::Success(value) => Some(value.clone()),
            _ => None,
        }
    }

    pub(crate) fn failure(&self) -> Option<Failure> {
        match self {
            DoneCore::Failed { failure, .. } => Some(failure.clone()),
            _ => None,
        }
    }

    pub(crate) fn has_unconsumed_failure(&self) -> bool {
        match self {
            DoneCore::Failed { consumed, .. } => !consumed.load(Ordering::Acquire),
            _ => false,
        }
    }

    pub(crate) fn cancellation_error(&self) -> Option<Cancelled> {
        match self {
            DoneCore::Cancelled(cause) => Some(cause.clone()),
            _ => None,
        }
    }

    fn consume(consumed: &AtomicBool) -> bool {
        consumed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn check_failure(&self) -> Result<(), Failure> {
        match self {
            DoneCore::Failed { failure, consumed } if Self::consume(consumed) => {
                Err(failure.clone())
            }
            _ => Ok(()),
        }
    }

    pub(crate) fn check_failure_of<E>(&self) -> Result<(), Failure>
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        match self {
            DoneCore::Failed { failure, consumed }
                if failure.is::<E>() && Self::consume(consumed) =>
            {
                Err(failure.clone())
            }
            _ => Ok(()),
        }
    }

    pub(crate) fn check_success(&self) -> Result<(), CheckError> {
        match self {
            DoneCore::Success(_) => Ok(()),
            DoneCore::Cancelled(cause) => Err(CheckError::Cancelled(cause.clone())),
            DoneCore::Failed { failure, consumed } => {
                if Self::consume(consumed) {
                    Err(CheckError::Failed(failure.clone()))
                } else {
                    Ok(())
                }
            }
        }
    }

    // === subscriptions: the matching channel fires immediately ===

    pub(crate) fn on_success(
        &self,
        action: impl FnOnce(&T) + Send + 'static,
        executor: Option<Arc<dyn Executor>>,
    ) {
        if let DoneCore::Success(value) = self {
            deliver(action, value.clone(), executor);
        }
    }

    pub(crate) fn on_failure(
        &self,
        action: impl FnOnce(&Failure) + Send + 'static,
        executor: Option<Arc<dyn Executor>>,
    ) {
        if let DoneCore::Failed { failure, .. } = self {
            deliver(action, Arc::new(failure.clone()), executor);
        }
    }

    pub(crate) fn on_cancelled(
        &self,
        action: impl FnOnce(&Cancelled) + Send + 'static,
        executor: Option<Arc<dyn Executor>>,
    ) {
        if let DoneCore::Cancelled(cause) = self {
            deliver(action, Arc::new(cause.clone()), executor);
        }
    }

    pub(crate) fn on_completion(
        self: &Arc<Self>,
        action: impl FnOnce(&Task<T>) + Send + 'static,
        executor: Option<Arc<dyn Executor>>,
    ) {
        deliver(action, Arc::new(Task::from_done(self.clone())), executor);
    }
}

// Inline or executor delivery with the same panic isolation the queued
// channels get.
fn deliver<C: Send + Sync + 'static>(
    action: impl FnOnce(&C) + Send + 'static,
    context: Arc<C>,
    executor: Option<Arc<dyn Executor>>,
) {
    match executor {
        None => run_isolated(Box::new(move |context: Arc<C>| action(&context)), context),
        Some(executor) => {
            let submitted = executor.execute(Box::new(move || action(&context)));
            if let Err(error) = submitted {
                tracing::error!(%error, "async subscriber dropped: executor rejected job");
            }
        }
    }
}
