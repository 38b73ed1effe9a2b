use crate::sync::interrupt::{self, Wake};
use crate::task::error::WaitError;
use parking_lot::{Condvar, Mutex};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// The key a thread waits on.
///
/// The master permit matches every wait; a keyed permit only wakes waiters
/// that passed the same key. Keys are derived from the identity of the
/// object that signals them (a cancel condition), never from user input.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct Permit(usize);

impl Permit {
    /// The well-known permit that matches every waiter of an [`Awaiter`].
    pub const MASTER: Permit = Permit(0);

    // Keys come from heap addresses, which are never zero and stay unique
    // for as long as the keyed object is alive.
    pub(crate) fn from_raw(key: usize) -> Permit {
        debug_assert_ne!(key, 0);
        Permit(key)
    }
}

#[derive(Default)]
struct Board {
    master: bool,
    keys: HashSet<usize>,
}

impl Board {
    // A permit, once granted, stays granted: completion and cancellation are
    // both one-shot events, and waits that begin after the event must not
    // park.
    fn granted(&self, permit: Permit) -> Option<Permit> {
        if self.master {
            Some(Permit::MASTER)
        } else if permit != Permit::MASTER && self.keys.contains(&permit.0) {
            Some(permit)
        } else {
            None
        }
    }
}

struct Shared {
    board: Mutex<Board>,
    cond: Condvar,
}

impl Wake for Shared {
    fn wake_all(&self) {
        // Taking the monitor before notifying closes the window between a
        // waiter's flag check and its sleep.
        let _board = self.board.lock();
        self.cond.notify_all();
    }
}

/// A wait/notify gate for threads, keyed by permits.
///
/// Threads block in one of the `wait*` methods until the permit they wait
/// on (or the master permit) is signalled, the optional deadline passes, or
/// the thread is interrupted. Signals are latched: signalling before the
/// wait begins lets the wait return immediately, and signalling twice is a
/// no-op.
///
/// The task machinery signals the master permit exactly once, on completion;
/// cancel conditions signal their own identity key.
#[derive(Clone)]
pub struct Awaiter {
    shared: Arc<Shared>,
}

impl Default for Awaiter {
    fn default() -> Self {
        Self::new()
    }
}

impl Awaiter {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                board: Mutex::new(Board::default()),
                cond: Condvar::new(),
            }),
        }
    }

    /// Grants `permit` to all current and future waiters that wait on it.
    /// Granting the master permit releases every waiter regardless of key.
    pub fn signal_all(&self, permit: Permit) {
        let mut board = self.shared.board.lock();
        if permit == Permit::MASTER {
            board.master = true;
        } else {
            board.keys.insert(permit.0);
        }
        drop(board);
        self.shared.cond.notify_all();
    }

    /// Blocks until `permit` or the master permit is granted. Returns the
    /// permit that released the wait; the master permit wins when both are
    /// granted.
    pub fn wait(&self, permit: Permit) -> Result<Permit, WaitError> {
        self.wait_inner(permit, None, true)
    }

    /// Like [`wait`](Self::wait), but ignores interruption. An interrupt
    /// arriving during the wait leaves the thread's flag set for a later
    /// interruptible operation.
    pub fn wait_uninterruptibly(&self, permit: Permit) -> Permit {
        match self.wait_inner(permit, None, false) {
            Ok(p) => p,
            // Without a deadline and without interruption there is nothing
            // left that could end the wait early.
            Err(_) => unreachable!("untimed uninterruptible wait cannot fail"),
        }
    }

    /// Blocks until the permit is granted or `timeout` elapses.
    pub fn wait_timeout(&self, permit: Permit, timeout: Duration) -> Result<Permit, WaitError> {
        self.wait_inner(permit, Some(Instant::now() + timeout), true)
    }

    /// Timed wait that ignores interruption.
    pub fn wait_timeout_uninterruptibly(
        &self,
        permit: Permit,
        timeout: Duration,
    ) -> Result<Permit, WaitError> {
        self.wait_inner(permit, Some(Instant::now() + timeout), false)
    }

    fn wait_inner(
        &self,
        permit: Permit,
        deadline: Option<Instant>,
        interruptible: bool,
    ) -> Result<Permit, WaitError> {
        // Interrupt status set on entry fails the wait without parking.
        if interruptible && interrupt::take_interrupted() {
            return Err(WaitError::Interrupted);
        }

        let _target = interruptible.then(|| {
            interrupt::register_target(self.shared.clone() as Arc<dyn Wake>)
        });

        let mut board = self.shared.board.lock();
        loop {
            if let Some(granted) = board.granted(permit) {
                return Ok(granted);
            }
            if interruptible && interrupt::take_interrupted() {
                return Err(WaitError::Interrupted);
            }

            match deadline {
                Some(deadline) => {
                    if self.shared.cond.wait_until(&mut board, deadline).timed_out() {
                        // A signal may have slipped in right at the deadline.
                        if let Some(granted) = board.granted(permit) {
                            return Ok(granted);
                        }
                        return Err(WaitError::Timeout);
                    }
                }
                None => self.shared.cond.wait(&mut board),
            }
        }
    }
}

impl std::fmt::Debug for Awaiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let board = self.shared.board.lock();
        f.debug_struct("Awaiter")
            .field("master", &board.master)
            .field("keys", &board.keys.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::Interrupt;
    use std::thread;

    #[test]
    fn master_permit_is_latched() {
        let awaiter = Awaiter::new();
        awaiter.signal_all(Permit::MASTER);
        assert_eq!(awaiter.wait(Permit::MASTER).unwrap(), Permit::MASTER);
        assert_eq!(
            awaiter.wait(Permit::from_raw(7)).unwrap(),
            Permit::MASTER,
            "master releases keyed waits too"
        );
    }

    #[test]
    fn keyed_signal_releases_only_its_key() {
        let awaiter = Awaiter::new();
        awaiter.signal_all(Permit::from_raw(7));
        assert_eq!(
            awaiter.wait(Permit::from_raw(7)).unwrap(),
            Permit::from_raw(7)
        );
        assert!(matches!(
            awaiter.wait_timeout(Permit::from_raw(9), Duration::from_millis(10)),
            Err(WaitError::Timeout)
        ));
    }

    #[test]
    fn wait_released_from_another_thread() {
        let awaiter = Awaiter::new();
        let signaller = awaiter.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            signaller.signal_all(Permit::MASTER);
        });
        assert_eq!(awaiter.wait(Permit::MASTER).unwrap(), Permit::MASTER);
        handle.join().unwrap();
    }

    #[test]
    fn timed_wait_times_out() {
        let awaiter = Awaiter::new();
        let start = Instant::now();
        let result = awaiter.wait_timeout(Permit::MASTER, Duration::from_millis(20));
        assert!(matches!(result, Err(WaitError::Timeout)));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn interrupt_aborts_wait_and_consumes_flag() {
        let awaiter = Awaiter::new();
        let (tx, rx) = std::sync::mpsc::channel();
        let waiter = awaiter.clone();
        let handle = thread::spawn(move || {
            tx.send(Interrupt::current()).unwrap();
            let result = waiter.wait(Permit::MASTER);
            (result, crate::sync::interrupt::is_interrupted())
        });
        thread::sleep(Duration::from_millis(20));
        rx.recv().unwrap().interrupt();
        let (result, still_set) = handle.join().unwrap();
        assert!(matches!(result, Err(WaitError::Interrupted)));
        assert!(!still_set, "interruptible wait consumes the flag");
    }

    #[test]
    fn uninterruptible_wait_rearms_the_flag() {
        let awaiter = Awaiter::new();
        let (tx, rx) = std::sync::mpsc::channel();
        let waiter = awaiter.clone();
        let releaser = awaiter.clone();
        let handle = thread::spawn(move || {
            tx.send(Interrupt::current()).unwrap();
            let permit = waiter.wait_uninterruptibly(Permit::MASTER);
            (permit, crate::sync::interrupt::take_interrupted())
        });
        let interrupt = rx.recv().unwrap();
        thread::sleep(Duration::from_millis(10));
        interrupt.interrupt();
        thread::sleep(Duration::from_millis(10));
        releaser.signal_all(Permit::MASTER);
        let (permit, flag_was_set) = handle.join().unwrap();
        assert_eq!(permit, Permit::MASTER);
        assert!(flag_was_set, "uninterruptible wait leaves the flag set");
    }
}
