mod timer;
pub use self::timer::{Timer, TimerError, TimerHandle, global};
