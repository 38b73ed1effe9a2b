use crate::exec::{ExecError, Executor, Job};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

// Runs every job on the submitting thread. Makes async-subscription tests
// deterministic without a pool in the way.
pub(crate) struct InlineExecutor {
    submitted: AtomicUsize,
}

impl InlineExecutor {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            submitted: AtomicUsize::new(0),
        })
    }

    pub(crate) fn submitted(&self) -> usize {
        self.submitted.load(Ordering::SeqCst)
    }
}

impl Executor for InlineExecutor {
    fn execute(&self, job: Job) -> Result<(), ExecError> {
        self.submitted.fetch_add(1, Ordering::SeqCst);
        job();
        Ok(())
    }

    fn is_accepting(&self) -> bool {
        true
    }
}

// An executor that drops everything, for exercising rejection paths.
pub(crate) struct RejectingExecutor;

impl Executor for RejectingExecutor {
    fn execute(&self, _job: Job) -> Result<(), ExecError> {
        Err(ExecError::Rejected)
    }

    fn is_accepting(&self) -> bool {
        false
    }
}
