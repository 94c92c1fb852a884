//! `dvrk-hal` – arm endpoints.
//!
//! The real arm lives behind the console and its transport; this crate
//! provides the in-process stand-in used by CI and by the CLI's default run.
//!
//! # Modules
//!
//! - [`sim`] – [`SimArm`]: a simulated arm that answers state requests,
//!   homing, goals and direct joint commands on the bus.

pub mod sim;

pub use sim::{SimArm, SimArmConfig};
