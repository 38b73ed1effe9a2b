use std::hint;
use std::sync::atomic::{AtomicU8, Ordering};

// Two orthogonal dimensions packed into one byte: which outcome was chosen,
// and whether the outcome fields are valid (written and published). The
// transient XXX_ING states have the outcome bit set but not the valid bit.
pub(crate) const WAITING: u8 = 0b0001;
pub(crate) const CANCELLING: u8 = 0b0010;
pub(crate) const CANCELLED: u8 = 0b0011;
pub(crate) const SUCCEEDING: u8 = 0b0100;
pub(crate) const SUCCESS: u8 = 0b0101;
pub(crate) const FAILING: u8 = 0b1000;
pub(crate) const FAILED: u8 = 0b1001;

pub(crate) const VALID_MASK: u8 = 0b0001;
pub(crate) const CANCEL_MASK: u8 = 0b0010;
pub(crate) const SUCCESS_MASK: u8 = 0b0100;
pub(crate) const FAILED_MASK: u8 = 0b1000;

/// The lifecycle state cell of a blocking task.
///
/// Exactly one completion attempt wins the `WAITING -> XXX_ING` transition.
/// The window between that CAS and the stable `XXX` state contains only the
/// terminal field write and the awaiter signal (no user code, no syscall),
/// so readers may spin on it.
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub(crate) fn new_running() -> Self {
        Self(AtomicU8::new(WAITING))
    }

    pub(crate) fn load(&self) -> u8 {
        self.0.load(Ordering::Acquire)
    }

    /// Attempts to claim the terminal outcome `transient` (one of the
    /// XXX_ING states). Losing returns the state observed instead.
    pub(crate) fn begin_terminal(&self, transient: u8) -> Result<(), u8> {
        debug_assert_eq!(transient & VALID_MASK, 0);
        match self
            .0
            .compare_exchange(WAITING, transient, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => Ok(()),
            Err(observed) => Err(observed),
        }
    }

    /// Publishes the stable terminal state. The release ordering makes the
    /// terminal field writes visible to every observer that acquires the
    /// state afterwards.
    pub(crate) fn finish_terminal(&self, transient: u8, stable: u8) {
        debug_assert_eq!(transient | VALID_MASK, stable);
        if self
            .0
            .compare_exchange(transient, stable, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            panic!("FATAL: task terminal state modified by concurrent thread");
        }
    }

    /// Spins until the valid bit is set and returns the stable state. Only
    /// call after observing an outcome mask; the spin is bounded by the
    /// writer's field-write window.
    pub(crate) fn spin_until_valid(&self) -> u8 {
        loop {
            let state = self.load();
            if state & VALID_MASK != 0 {
                return state;
            }
            hint::spin_loop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_one_completion_attempt_wins() {
        let cell = StateCell::new_running();
        assert!(cell.begin_terminal(SUCCEEDING).is_ok());
        assert_eq!(cell.begin_terminal(CANCELLING), Err(SUCCEEDING));
        cell.finish_terminal(SUCCEEDING, SUCCESS);
        assert_eq!(cell.begin_terminal(FAILING), Err(SUCCESS));
        assert_eq!(cell.load(), SUCCESS);
    }

    #[test]
    #[should_panic(expected = "FATAL")]
    fn finishing_from_the_wrong_transient_is_fatal() {
        let cell = StateCell::new_running();
        cell.finish_terminal(CANCELLING, CANCELLED);
    }
}
