pub mod cancel;
pub use cancel::CancelCondition;

pub mod exec;
pub use exec::Executor;

pub mod sync;
pub use sync::{AssignOnce, Awaiter, CloseableLazy, InlineLazy, Interrupt, Lazy, Permit};

pub mod task;
pub use task::error::{BindError, Cancelled, CheckError, Failure, SignalError, WaitError};
pub use task::{Completer, Task, TaskState};

pub mod tasks;
pub use tasks::{
    cancel_after, cancel_after_with, cancelled, cancelled_with, chain, chain_async,
    chain_async_on, delay, fail_after, failed, start_blocking, start_blocking_shielded,
    succeed_after, success, success_unit, waiting,
};

pub mod time;

#[cfg(test)]
pub(crate) mod test_utils;
