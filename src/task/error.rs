use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Arbitrary user data attached to a cancellation request.
///
/// The payload travels inside the [`Cancelled`] error and is shared between
/// every observer of the cancellation (chained tasks forward the same
/// allocation).
pub type Payload = Arc<dyn Any + Send + Sync>;

/// The error raised when a task or a waiting operation was cancelled.
///
/// Carries the optional payload object that was passed to the `cancel_with`
/// call responsible for the cancellation. Cloning is cheap; all clones share
/// the payload allocation.
#[derive(Clone)]
pub struct Cancelled {
    message: &'static str,
    payload: Option<Payload>,
}

impl Cancelled {
    pub(crate) fn new(message: &'static str, payload: Option<Payload>) -> Self {
        Self { message, payload }
    }

    /// The payload object attached to this cancellation, if any.
    pub fn payload(&self) -> Option<&(dyn Any + Send + Sync)> {
        self.payload.as_deref()
    }

    /// The payload downcast to a concrete type.
    ///
    /// Returns `None` when no payload is attached or when the payload is of
    /// a different type.
    pub fn payload_as<P: Any>(&self) -> Option<&P> {
        self.payload.as_deref()?.downcast_ref::<P>()
    }

    /// Whether a payload object is attached at all.
    pub fn has_payload(&self) -> bool {
        self.payload.is_some()
    }

    // Shared handle to the payload, used to forward the same allocation
    // through chained cancellations.
    pub(crate) fn payload_arc(&self) -> Option<Payload> {
        self.payload.clone()
    }
}

impl fmt::Display for Cancelled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message)
    }
}

impl fmt::Debug for Cancelled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cancelled")
            .field("message", &self.message)
            .field("has_payload", &self.payload.is_some())
            .finish()
    }
}

impl std::error::Error for Cancelled {}

/// The reason a task failed.
///
/// Wraps the underlying cause as a shared [`anyhow::Error`] so that the same
/// failure instance can be observed by every consumer of the task and
/// forwarded unchanged through task chains.
#[derive(Clone)]
pub struct Failure(Arc<anyhow::Error>);

impl Failure {
    pub fn new(cause: impl Into<anyhow::Error>) -> Self {
        Self(Arc::new(cause.into()))
    }

    /// Whether the underlying cause is of type `E`.
    pub fn is<E>(&self) -> bool
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.0.is::<E>()
    }

    /// The underlying cause downcast to a concrete error type.
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.0.downcast_ref::<E>()
    }

    /// Whether two failures share the same underlying cause allocation.
    pub fn same_cause(&self, other: &Failure) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Debug for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl std::error::Error for Failure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        let cause: &(dyn std::error::Error + Send + Sync + 'static) = self.0.as_ref().as_ref();
        Some(cause)
    }
}

impl From<anyhow::Error> for Failure {
    fn from(cause: anyhow::Error) -> Self {
        Self(Arc::new(cause))
    }
}

/// Errors raised by the blocking wait family.
#[derive(thiserror::Error, Debug, Clone)]
pub enum WaitError {
    /// The waiting thread was interrupted, or its interrupt flag was already
    /// set on entry. The flag is consumed.
    #[error("waiting thread was interrupted")]
    Interrupted,

    /// The deadline passed before the task completed. The task state is not
    /// affected.
    #[error("timed out before the task completed")]
    Timeout,

    /// The wait was aborted by the cancel condition passed to it. This does
    /// *not* mean the awaited task was cancelled.
    #[error("wait aborted by cancel condition")]
    Cancelled(Cancelled),

    /// The cancel condition passed as an out parameter was already bound to
    /// another action.
    #[error("cancel condition was already bound to an action")]
    ConditionBound,
}

/// Errors raised when signalling a [`Completer`](crate::Completer).
#[derive(thiserror::Error, Debug, Clone)]
pub enum SignalError {
    /// The completer has not been bound to a task yet.
    #[error("completer is not bound to any task")]
    Unbound,

    /// A third party cancelled the task while the signal was in flight. The
    /// `try_signal_*` variants swallow this case.
    #[error("task was cancelled while signalling completion")]
    Cancelled(Cancelled),
}

/// A completer was used to construct a second task.
#[derive(thiserror::Error, Debug, Clone)]
#[error("completer was already used for another task")]
pub struct BindError;

/// The composite error raised by `check_success` and the future adapter.
#[derive(thiserror::Error, Debug, Clone)]
pub enum CheckError {
    /// The task failed; the original cause is attached.
    #[error("task failed with an error")]
    Failed(#[source] Failure),

    /// The task was cancelled before completion.
    #[error("task was cancelled before completion")]
    Cancelled(Cancelled),
}

// Best-effort extraction of a panic message for the log channel.
pub(crate) fn panic_payload_as_str(payload: &Box<dyn Any + Send>) -> Option<&str> {
    payload
        .downcast_ref::<&'static str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
}
