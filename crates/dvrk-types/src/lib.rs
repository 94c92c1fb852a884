//! `dvrk-types` – shared vocabulary for the arm test stack.
//!
//! Everything that crosses a crate boundary lives here: the operating-state
//! token reported by the arm, the joint and cartesian payloads, the
//! [`BusMessage`] envelope routed by the middleware, and the global
//! [`ArmError`].

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Well-known operating-state tokens.
///
/// The core never enumerates the arm's full vocabulary; these are only the
/// tokens the test sequence requests or waits for.
pub mod states {
    /// Reported before the first state message arrives.
    pub const UNINITIALIZED: &str = "uninitialized";
    /// Command token that starts the homing procedure.
    pub const HOME: &str = "Home";
    pub const HOMING_POWERING: &str = "DVRK_HOMING_POWERING";
    pub const HOMING_CALIBRATING_ARM: &str = "DVRK_HOMING_CALIBRATING_ARM";
    /// Final state of a successful homing.
    pub const READY: &str = "DVRK_READY";
    pub const POSITION_JOINT: &str = "DVRK_POSITION_JOINT";
    pub const POSITION_GOAL_JOINT: &str = "DVRK_POSITION_GOAL_JOINT";
    pub const POSITION_CARTESIAN: &str = "DVRK_POSITION_CARTESIAN";
}

/// The arm's externally reported mode/phase.
///
/// Opaque to the core: it is only ever compared for equality against a
/// requested target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperatingState(String);

impl OperatingState {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// The state held before the arm has reported anything.
    pub fn unknown() -> Self {
        Self::new(states::UNINITIALIZED)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `true` once the arm reports [`states::READY`].
    pub fn is_ready(&self) -> bool {
        self.0 == states::READY
    }
}

impl Default for OperatingState {
    fn default() -> Self {
        Self::unknown()
    }
}

impl fmt::Display for OperatingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for OperatingState {
    fn from(token: &str) -> Self {
        Self::new(token)
    }
}

impl From<String> for OperatingState {
    fn from(token: String) -> Self {
        Self(token)
    }
}

impl PartialEq<str> for OperatingState {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for OperatingState {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

/// Ordered joint positions (radians for revolute joints, metres for
/// prismatic ones). The joint count depends on the arm model.
pub type JointVector = Vec<f64>;

/// Cartesian position in metres.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Point3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

/// Unit quaternion orientation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quaternion {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub w: f64,
}

impl Default for Quaternion {
    fn default() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            z: 0.0,
            w: 1.0,
        }
    }
}

/// 6-DOF tool pose: position plus orientation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CartesianPose {
    pub position: Point3,
    pub orientation: Quaternion,
}

/// Payload kinds carried on the arm topics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data")]
pub enum Payload {
    /// A state token (`set_robot_state`, `robot_state`).
    Text(String),
    /// `goal_reached`.
    Flag(bool),
    /// Joint commands and joint feedback.
    Joints(JointVector),
    /// Cartesian feedback.
    Pose(CartesianPose),
}

impl Payload {
    /// Short name of the variant, used in diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Text(_) => "text",
            Payload::Flag(_) => "flag",
            Payload::Joints(_) => "joints",
            Payload::Pose(_) => "pose",
        }
    }

    pub fn into_text(self) -> Option<String> {
        match self {
            Payload::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn into_flag(self) -> Option<bool> {
        match self {
            Payload::Flag(b) => Some(b),
            _ => None,
        }
    }

    pub fn into_joints(self) -> Option<JointVector> {
        match self {
            Payload::Joints(j) => Some(j),
            _ => None,
        }
    }

    pub fn into_pose(self) -> Option<CartesianPose> {
        match self {
            Payload::Pose(p) => Some(p),
            _ => None,
        }
    }
}

/// Envelope routed by the event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusMessage {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// Full topic name, e.g. `/dvrk/ECM/robot_state`.
    pub topic: String,
    /// Publisher identity, e.g. `"dvrk-kernel::session"`.
    pub source: String,
    pub payload: Payload,
}

impl BusMessage {
    pub fn new(topic: impl Into<String>, source: impl Into<String>, payload: Payload) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            topic: topic.into(),
            source: source.into(),
            payload,
        }
    }
}

/// Global error type for the command protocol, the bus and configuration.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ArmError {
    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    #[error("failed to reach state {target} (last observed: {observed})")]
    UnreachedState {
        target: OperatingState,
        observed: OperatingState,
    },

    #[error("homing gave up after {attempts} attempt(s) (last observed: {last_state})")]
    HomingExhausted {
        attempts: u32,
        last_state: OperatingState,
    },

    #[error("goal not reached: {label}")]
    GoalNotReached { label: String },

    #[error("invalid feedback: {0}")]
    InvalidFeedback(String),

    #[error("shutdown requested: {0}")]
    ShutdownRequested(String),

    #[error("bus channel error: {0}")]
    Channel(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl ArmError {
    /// Whether the failure must stop the sequence and request shutdown.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ArmError::Timeout { .. }
                | ArmError::UnreachedState { .. }
                | ArmError::HomingExhausted { .. }
                | ArmError::GoalNotReached { .. }
                | ArmError::InvalidFeedback(_)
        )
    }
}
