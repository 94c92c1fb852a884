//! `dvrk-kernel` – command/acknowledgment synchronization core.
//!
//! Turns fire-and-forget topics into blocking, timeout-bounded commands that
//! a test script can issue one after the other.
//!
//! # Modules
//!
//! - [`latch`] – [`EventLatch`][latch::EventLatch]: last value plus a
//!   clearable signal, awaited with a timeout.  The only state shared between
//!   delivery tasks and the command task.
//! - [`session`] – [`ArmSession`][session::ArmSession]: owns one latch per
//!   monitored channel of an arm and exposes `request_state_and_wait`,
//!   `home_and_wait` and `send_goal_and_wait`.
//! - [`shutdown`] – [`ShutdownSignal`][shutdown::ShutdownSignal]: the orderly
//!   shutdown request raised when a failure is classified as fatal.

pub mod latch;
pub mod session;
pub mod shutdown;

pub use latch::EventLatch;
pub use session::{ArmSession, DEFAULT_HOMING_ATTEMPTS, DEFAULT_WAIT_TIMEOUT};
pub use shutdown::ShutdownSignal;
