//! In-process simulated arm for CI/CD testing without physical hardware.
//!
//! [`SimArm`] subscribes to an arm's command topics on the [`EventBus`] and
//! answers the way the console does: state requests are acknowledged on
//! `robot_state`, homing walks through a configurable list of states, goals
//! are acknowledged on `goal_reached`, and joint/cartesian feedback is
//! published (latched) whenever it changes and optionally at a fixed period.
//!
//! Every command it receives is recorded so tests can assert on exactly what
//! the command side published.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use dvrk_hal::{SimArm, SimArmConfig};
//! use dvrk_middleware::{ArmTopics, EventBus};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let bus = Arc::new(EventBus::default());
//! let sim = SimArm::spawn(bus, ArmTopics::for_arm("ECM"), SimArmConfig::default())
//!     .expect("sim arm must start inside a runtime");
//! assert_eq!(sim.joints().len(), 4);
//! # }
//! ```

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use dvrk_middleware::{ArmTopics, BusAdapter, EventBus};
use dvrk_types::{
    ArmError, CartesianPose, JointVector, OperatingState, Payload, Point3, states,
};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

const SOURCE: &str = "dvrk-hal::sim";

// ────────────────────────────────────────────────────────────────────────────
// Configuration
// ────────────────────────────────────────────────────────────────────────────

/// Behaviour of a [`SimArm`].
#[derive(Debug, Clone)]
pub struct SimArmConfig {
    /// Joint positions at start-up.  The default is a 4-joint endoscope arm
    /// with the insertion joint (index 2) at 5 cm.
    pub initial_joints: JointVector,
    /// Cartesian feedback published by the arm.
    pub initial_pose: CartesianPose,
    /// States reported, one per `step_delay`, after a `Home` request.
    pub homing_sequence: Vec<String>,
    /// Delay before each reply.
    pub step_delay: Duration,
    /// Outcome reported on `goal_reached`.
    pub goal_outcome: bool,
    /// When set, every non-homing state request is answered with this token
    /// instead of the requested one.
    pub state_override: Option<String>,
    /// Period of unsolicited feedback publishing; `None` publishes feedback
    /// only when it changes.
    pub feedback_period: Option<Duration>,
    /// Record commands but never reply or publish feedback.
    pub silent: bool,
}

impl SimArmConfig {
    /// An arm that records commands and never answers.
    pub fn silent() -> Self {
        Self {
            silent: true,
            feedback_period: None,
            ..Self::default()
        }
    }
}

impl Default for SimArmConfig {
    fn default() -> Self {
        Self {
            initial_joints: vec![0.0, 0.0, 0.05, 0.0],
            initial_pose: CartesianPose {
                position: Point3 {
                    x: 0.0,
                    y: 0.0,
                    z: -0.05,
                },
                ..CartesianPose::default()
            },
            homing_sequence: vec![
                states::HOMING_POWERING.to_string(),
                states::HOMING_CALIBRATING_ARM.to_string(),
                states::READY.to_string(),
            ],
            step_delay: Duration::from_millis(200),
            goal_outcome: true,
            state_override: None,
            feedback_period: Some(Duration::from_millis(10)),
            silent: false,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Simulated arm
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct SimState {
    state: OperatingState,
    joints: JointVector,
    pose: CartesianPose,
    goal_outcome: bool,
    silent: bool,
    state_requests: Vec<String>,
    joint_commands: Vec<JointVector>,
    goal_commands: Vec<JointVector>,
}

/// Replies on the bus on behalf of the simulated arm.  Cloned into every
/// handler and reply task.
#[derive(Clone)]
struct Responder {
    publisher: Arc<BusAdapter>,
    topics: ArmTopics,
    config: Arc<SimArmConfig>,
    state: Arc<Mutex<SimState>>,
}

impl Responder {
    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, topic: String, payload: Payload) {
        if let Err(e) = self.publisher.publish(&topic, payload) {
            warn!(error = %e, "sim publish failed");
        }
    }

    fn publish_feedback(&self) {
        let (joints, pose) = {
            let s = self.lock();
            (s.joints.clone(), s.pose)
        };
        for (topic, payload) in [
            (self.topics.position_joint_desired(), Payload::Joints(joints)),
            (self.topics.position_cartesian_desired(), Payload::Pose(pose)),
        ] {
            if let Err(e) = self.publisher.publish_latched(&topic, payload) {
                warn!(error = %e, "sim feedback publish failed");
            }
        }
    }

    fn report_state(&self, token: &str) {
        self.lock().state = OperatingState::from(token);
        debug!(state = token, "sim state");
        self.publish(self.topics.robot_state(), Payload::Text(token.to_string()));
    }

    fn on_state_request(&self, token: String) {
        let silent = {
            let mut s = self.lock();
            s.state_requests.push(token.clone());
            s.silent
        };
        if silent {
            return;
        }

        let responder = self.clone();
        if token == states::HOME {
            tokio::spawn(async move {
                for step in responder.config.homing_sequence.iter() {
                    tokio::time::sleep(responder.config.step_delay).await;
                    responder.report_state(step);
                }
            });
        } else {
            let answer = self.config.state_override.clone().unwrap_or(token);
            tokio::spawn(async move {
                tokio::time::sleep(responder.config.step_delay).await;
                responder.report_state(&answer);
                if answer == states::POSITION_CARTESIAN {
                    responder.publish_feedback();
                }
            });
        }
    }

    fn on_joint_command(&self, joints: JointVector) {
        let silent = {
            let mut s = self.lock();
            s.joint_commands.push(joints.clone());
            s.joints = joints;
            s.silent
        };
        if !silent {
            self.publish_feedback();
        }
    }

    fn on_goal_command(&self, goal: JointVector) {
        let (silent, outcome) = {
            let mut s = self.lock();
            s.goal_commands.push(goal.clone());
            (s.silent, s.goal_outcome)
        };
        if silent {
            return;
        }
        let responder = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(responder.config.step_delay).await;
            if outcome {
                responder.lock().joints = goal;
                responder.publish_feedback();
            }
            responder.publish(responder.topics.goal_reached(), Payload::Flag(outcome));
        });
    }
}

/// A simulated arm answering on one arm's topics.
///
/// Command subscriptions and the periodic feedback task stop when the
/// `SimArm` is dropped; replies already scheduled still go out.
pub struct SimArm {
    responder: Responder,
    _adapter: BusAdapter,
    feedback: Option<JoinHandle<()>>,
}

impl SimArm {
    /// Subscribe to the command topics of `topics` and start answering.
    ///
    /// # Errors
    ///
    /// [`ArmError::Channel`] when called outside a Tokio runtime.
    pub fn spawn(
        bus: Arc<EventBus>,
        topics: ArmTopics,
        config: SimArmConfig,
    ) -> Result<Self, ArmError> {
        let state = SimState {
            state: OperatingState::unknown(),
            joints: config.initial_joints.clone(),
            pose: config.initial_pose,
            goal_outcome: config.goal_outcome,
            silent: config.silent,
            state_requests: Vec::new(),
            joint_commands: Vec::new(),
            goal_commands: Vec::new(),
        };
        let responder = Responder {
            publisher: Arc::new(BusAdapter::new(Arc::clone(&bus), SOURCE)),
            topics: topics.clone(),
            config: Arc::new(config),
            state: Arc::new(Mutex::new(state)),
        };

        let mut adapter = BusAdapter::new(bus, SOURCE);
        let r = responder.clone();
        adapter.subscribe(&topics.set_robot_state(), move |payload| {
            match payload.into_text() {
                Some(token) => r.on_state_request(token),
                None => warn!("sim: set_robot_state expects a state token"),
            }
        })?;
        let r = responder.clone();
        adapter.subscribe(&topics.set_position_joint(), move |payload| {
            match payload.into_joints() {
                Some(joints) => r.on_joint_command(joints),
                None => warn!("sim: set_position_joint expects joints"),
            }
        })?;
        let r = responder.clone();
        adapter.subscribe(&topics.set_position_goal_joint(), move |payload| {
            match payload.into_joints() {
                Some(goal) => r.on_goal_command(goal),
                None => warn!("sim: set_position_goal_joint expects joints"),
            }
        })?;

        if !responder.config.silent {
            responder.publish_feedback();
        }
        let feedback = responder.config.feedback_period.map(|period| {
            let r = responder.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    ticker.tick().await;
                    if !r.lock().silent {
                        r.publish_feedback();
                    }
                }
            })
        });

        info!(arm = %topics.arm(), "simulated arm started");
        Ok(Self {
            responder,
            _adapter: adapter,
            feedback,
        })
    }

    /// Every token received on `set_robot_state`, in order.
    pub fn state_requests(&self) -> Vec<String> {
        self.responder.lock().state_requests.clone()
    }

    /// Every direct joint command received, in order.
    pub fn joint_commands(&self) -> Vec<JointVector> {
        self.responder.lock().joint_commands.clone()
    }

    /// Every goal-joint command received, in order.
    pub fn goal_commands(&self) -> Vec<JointVector> {
        self.responder.lock().goal_commands.clone()
    }

    /// Current simulated joint positions.
    pub fn joints(&self) -> JointVector {
        self.responder.lock().joints.clone()
    }

    /// Last state the simulated arm reported.
    pub fn state(&self) -> OperatingState {
        self.responder.lock().state.clone()
    }

    /// Change the outcome reported for subsequent goals.
    pub fn set_goal_outcome(&self, reached: bool) {
        self.responder.lock().goal_outcome = reached;
    }

    /// Stop (or resume) answering commands.
    pub fn set_silent(&self, silent: bool) {
        self.responder.lock().silent = silent;
    }

    /// Move the simulated joints without a command and publish feedback.
    pub fn set_joints(&self, joints: JointVector) {
        let silent = {
            let mut s = self.responder.lock();
            s.joints = joints;
            s.silent
        };
        if !silent {
            self.responder.publish_feedback();
        }
    }
}

impl Drop for SimArm {
    fn drop(&mut self) {
        if let Some(feedback) = self.feedback.take() {
            feedback.abort();
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
