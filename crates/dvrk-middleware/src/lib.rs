//! `dvrk-middleware` – topic transport for the arm test stack.
//!
//! Routes payloads between the command side and the (real or simulated) arm
//! without caring what they mean.
//!
//! # Modules
//!
//! - [`bus`] – headless, topic-based publish/subscribe bus built on Tokio
//!   broadcast channels, with optional latching.
//! - [`adapter`] – [`BusAdapter`]: publish by topic, route inbound topics to
//!   nonblocking handlers.
//! - [`topics`] – [`ArmTopics`]: the `<namespace>/<arm>/<channel>` naming
//!   scheme.

pub mod adapter;
pub mod bus;
pub mod topics;

pub use adapter::BusAdapter;
pub use bus::{EventBus, TopicReceiver};
pub use topics::{ArmTopics, DEFAULT_NAMESPACE};
