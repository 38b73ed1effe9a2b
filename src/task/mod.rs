// Public API
mod task;
pub use self::task::Task;

mod completer;
pub use self::completer::Completer;

pub mod error;

mod future;
pub use self::future::TaskFuture;

// Internals
pub(crate) mod blocking;
pub(crate) mod done;
mod state;

#[cfg(test)]
mod tests;

/// The lifecycle state of a [`Task`].
///
/// The three terminal states are mutually exclusive and permanent: a task
/// that left [`Running`](TaskState::Running) never changes state again.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum TaskState {
    /// The task has not reached a terminal state yet.
    Running,
    /// The task completed with a result.
    Success,
    /// The task failed with an error.
    Failed,
    /// The task was cancelled before completion.
    Cancelled,
}

impl TaskState {
    /// Whether this is one of the three terminal states.
    pub fn is_terminal(self) -> bool {
        self != TaskState::Running
    }
}
