mod assign_once;
pub use self::assign_once::AssignOnce;

mod awaiter;
pub use self::awaiter::{Awaiter, Permit};

pub mod interrupt;
pub use self::interrupt::Interrupt;

mod lazy;
pub use self::lazy::{CloseableLazy, InlineLazy, Lazy, LazyClosed};

mod subscription;
pub use self::subscription::SubscriptionHandler;
pub(crate) use self::subscription::run_isolated;
