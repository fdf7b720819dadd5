//! The reliability layer: idempotency guard, fan-in checker, hard-stopper,
//! and retry policy.

mod fan_in;
mod idempotency;
mod retry;
mod stopper;

pub use fan_in::FanInChecker;
pub use idempotency::{Gate, IdempotencyGuard};
pub use retry::RetryPolicy;
pub use stopper::HardStopper;
