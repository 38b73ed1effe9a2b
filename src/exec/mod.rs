use crate::task::error::panic_payload_as_str;
use crossbeam_deque::{Injector, Steal};
use parking_lot::{Condvar, Mutex};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

/// A unit of work handed to an executor.
pub type Job = Box<dyn FnOnce() + Send>;

/// Errors raised by executor operations.
#[derive(thiserror::Error, Debug, Clone)]
pub enum ExecError {
    /// The executor is shut down; the job was dropped.
    #[error("executor is shut down and rejected the job")]
    Rejected,

    /// The global executor was already initialized (either explicitly or by
    /// first use) when a builder tried to install a configuration.
    #[error("global executor is already initialized")]
    AlreadyInitialized,

    /// Worker threads did not drain and exit before the deadline.
    #[error("timed out waiting for executor shutdown")]
    ShutdownTimeout,
}

/// Something that runs jobs on behalf of the library.
///
/// The crate never blocks inside `execute`: asynchronous subscribers are
/// submitted at notification time and the notifying thread moves on.
pub trait Executor: Send + Sync {
    /// Submits a job. Fails with [`ExecError::Rejected`] when the executor
    /// no longer accepts work; the job is dropped in that case.
    fn execute(&self, job: Job) -> Result<(), ExecError>;

    /// Whether a subsequent [`execute`](Self::execute) can be expected to
    /// succeed.
    fn is_accepting(&self) -> bool;
}

struct PoolShared {
    injector: Injector<Job>,
    accepting: AtomicBool,
    // Worker count moves to zero on shutdown; the condvar announces both
    // new work and worker exits.
    live_workers: AtomicUsize,
    lock: Mutex<()>,
    cond: Condvar,
}

/// A fixed pool of named worker threads fed from a shared injector queue.
///
/// This is the default home for `*_async` subscription callbacks. Workers
/// run queued jobs to completion even after [`shutdown`](Self::shutdown)
/// begins; shutdown only stops new submissions.
pub struct ThreadPool {
    shared: Arc<PoolShared>,
}

impl ThreadPool {
    fn start(worker_threads: usize, thread_name: &str) -> Self {
        let shared = Arc::new(PoolShared {
            injector: Injector::new(),
            accepting: AtomicBool::new(true),
            live_workers: AtomicUsize::new(worker_threads),
            lock: Mutex::new(()),
            cond: Condvar::new(),
        });

        for index in 0..worker_threads {
            let shared = shared.clone();
            let name = format!("{thread_name}-{index}");
            thread::Builder::new()
                .name(name.clone())
                .spawn(move || worker_loop(&shared))
                .unwrap_or_else(|error| panic!("failed to spawn executor worker {name}: {error}"));
        }

        tracing::debug!(worker_threads, thread_name, "executor pool started");
        Self { shared }
    }

    /// Stops accepting jobs, lets the workers drain the queue and waits for
    /// them to exit.
    pub fn shutdown(&self, timeout: Duration) -> Result<(), ExecError> {
        self.shared.accepting.store(false, Ordering::SeqCst);
        let deadline = Instant::now() + timeout;

        let mut guard = self.shared.lock.lock();
        self.shared.cond.notify_all();
        while self.shared.live_workers.load(Ordering::SeqCst) > 0 {
            if self.shared.cond.wait_until(&mut guard, deadline).timed_out() {
                return Err(ExecError::ShutdownTimeout);
            }
        }
        tracing::debug!("executor pool shut down");
        Ok(())
    }
}

impl Executor for ThreadPool {
    fn execute(&self, job: Job) -> Result<(), ExecError> {
        if !self.shared.accepting.load(Ordering::SeqCst) {
            return Err(ExecError::Rejected);
        }
        self.shared.injector.push(job);
        // Pair the push with the lock so a worker checking for work cannot
        // slip between our push and our notify.
        let _guard = self.shared.lock.lock();
        self.shared.cond.notify_one();
        Ok(())
    }

    fn is_accepting(&self) -> bool {
        self.shared.accepting.load(Ordering::SeqCst)
    }
}

fn worker_loop(shared: &PoolShared) {
    loop {
        match shared.injector.steal() {
            Steal::Success(job) => run_job(job),
            Steal::Retry => continue,
            Steal::Empty => {
                let mut guard = shared.lock.lock();
                // Re-check under the lock: a producer pushes before it
                // notifies under this same lock.
                if !shared.injector.is_empty() {
                    continue;
                }
                if !shared.accepting.load(Ordering::SeqCst) {
                    break;
                }
                shared.cond.wait(&mut guard);
            }
        }
    }

    shared.live_workers.fetch_sub(1, Ordering::SeqCst);
    let _guard = shared.lock.lock();
    shared.cond.notify_all();
}

// A panicking job must not take its worker thread down with it.
fn run_job(job: Job) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
        let message = panic_payload_as_str(&payload).unwrap_or("<non-string panic payload>");
        tracing::error!(panic = message, "executor job panicked");
    }
}

/// Configuration for the global executor pool. Must be installed before the
/// pool's first use.
pub struct Builder {
    worker_threads: usize,
    thread_name: String,
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl Builder {
    pub fn new() -> Self {
        Self {
            worker_threads: default_worker_threads(),
            thread_name: "taskling".to_string(),
        }
    }

    /// The number of worker threads. Defaults to the machine's available
    /// parallelism.
    pub fn worker_threads(mut self, count: usize) -> Self {
        self.worker_threads = count.max(1);
        self
    }

    /// The prefix for worker thread names (`<prefix>-<index>`).
    pub fn thread_name(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name = prefix.into();
        self
    }

    /// Builds a standalone pool owned by the caller.
    pub fn build(self) -> ThreadPool {
        ThreadPool::start(self.worker_threads, &self.thread_name)
    }

    /// Installs this configuration as the process-wide global executor.
    /// Fails if the global executor already exists.
    pub fn try_install(self) -> Result<(), ExecError> {
        let mut installed = false;
        global_cell().get_or_init(|| {
            installed = true;
            Arc::new(self.build())
        });
        if installed {
            Ok(())
        } else {
            Err(ExecError::AlreadyInitialized)
        }
    }
}

fn default_worker_threads() -> usize {
    thread::available_parallelism().map(usize::from).unwrap_or(2)
}

fn global_cell() -> &'static OnceLock<Arc<ThreadPool>> {
    static GLOBAL: OnceLock<Arc<ThreadPool>> = OnceLock::new();
    &GLOBAL
}

/// The process-wide executor used when an `*_async` subscription does not
/// name one. Lazily initialized on first use with the default
/// [`Builder`] configuration.
pub fn global() -> Arc<dyn Executor> {
    global_cell()
        .get_or_init(|| Arc::new(Builder::new().build()))
        .clone()
}

/// Shuts the global executor down. Terminal: later submissions through
/// [`global`] are rejected. A no-op when the pool was never initialized.
pub fn shutdown(timeout: Duration) -> Result<(), ExecError> {
    match global_cell().get() {
        Some(pool) => pool.shutdown(timeout),
        None => Ok(()),
    }
}
