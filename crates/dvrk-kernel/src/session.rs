//! [`ArmSession`] – blocking, timeout-bounded command protocol for one arm.
//!
//! The arm is driven over fire-and-forget topics and reports back
//! asynchronously.  The session turns that into calls a test script can
//! `await` one after the other:
//!
//! 1. **clear** the latch of the channel that will acknowledge the command,
//! 2. **publish** the command,
//! 3. **wait** on the latch, bounded by a timeout,
//! 4. **classify** the latest observed value.
//!
//! | Operation | Acknowledged by | Failure |
//! |---|---|---|
//! | [`request_state_and_wait`][ArmSession::request_state_and_wait] | `robot_state` | [`ArmError::UnreachedState`] |
//! | [`home_and_wait`][ArmSession::home_and_wait] | `robot_state` (several) | [`ArmError::HomingExhausted`] |
//! | [`send_goal_and_wait`][ArmSession::send_goal_and_wait] | `goal_reached` | `Ok(false)` |
//!
//! Failures are returned, never acted upon: deciding to shut down is the
//! caller's business.
//!
//! Command operations take `&mut self`, so two of them can never be in
//! flight on the same session at once.

use std::sync::Arc;
use std::time::Duration;

use dvrk_middleware::{ArmTopics, BusAdapter, EventBus};
use dvrk_types::{ArmError, CartesianPose, JointVector, OperatingState, Payload, states};
use tracing::{debug, error, info, instrument, warn};

use crate::latch::EventLatch;

/// Default bound for every blocking wait.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(60);

/// Default number of state transitions tolerated while homing.
pub const DEFAULT_HOMING_ATTEMPTS: u32 = 10;

const SOURCE: &str = "dvrk-kernel::session";

/// Command/acknowledgment session bound to one arm's topics.
///
/// Owns one latch per monitored channel.  Latches are allocated in
/// [`connect`][Self::connect] and live as long as the session.
pub struct ArmSession {
    topics: ArmTopics,
    adapter: BusAdapter,
    state: Arc<EventLatch<OperatingState>>,
    goal_reached: Arc<EventLatch<bool>>,
    joint_feedback: Arc<EventLatch<JointVector>>,
    cartesian_feedback: Arc<EventLatch<CartesianPose>>,
}

impl ArmSession {
    /// Subscribe to the arm's inbound topics and allocate the latches.
    ///
    /// # Errors
    ///
    /// [`ArmError::Channel`] when called outside a Tokio runtime.
    pub fn connect(bus: Arc<EventBus>, topics: ArmTopics) -> Result<Self, ArmError> {
        let mut adapter = BusAdapter::new(bus, SOURCE);

        let state = Arc::new(EventLatch::new(OperatingState::unknown()));
        let goal_reached = Arc::new(EventLatch::new(false));
        let joint_feedback = Arc::new(EventLatch::new(JointVector::new()));
        let cartesian_feedback = Arc::new(EventLatch::new(CartesianPose::default()));

        let topic = topics.robot_state();
        adapter.subscribe(
            &topic,
            forward(Arc::clone(&state), topic.clone(), |p| {
                p.into_text().map(OperatingState::from)
            }),
        )?;
        let topic = topics.goal_reached();
        adapter.subscribe(
            &topic,
            forward(Arc::clone(&goal_reached), topic.clone(), Payload::into_flag),
        )?;
        let topic = topics.position_joint_desired();
        adapter.subscribe(
            &topic,
            forward(Arc::clone(&joint_feedback), topic.clone(), Payload::into_joints),
        )?;
        let topic = topics.position_cartesian_desired();
        adapter.subscribe(
            &topic,
            forward(Arc::clone(&cartesian_feedback), topic.clone(), Payload::into_pose),
        )?;

        info!(arm = %topics.arm(), prefix = %topics.prefix(), "session connected");
        Ok(Self {
            topics,
            adapter,
            state,
            goal_reached,
            joint_feedback,
            cartesian_feedback,
        })
    }

    /// The arm name, e.g. `"ECM"`.
    pub fn arm(&self) -> &str {
        self.topics.arm()
    }

    // -----------------------------------------------------------------------
    // Blocking command API
    // -----------------------------------------------------------------------

    /// Request the operating state `target` and wait up to `timeout` for the
    /// arm to report it.
    ///
    /// # Errors
    ///
    /// [`ArmError::UnreachedState`] when, after the wait, the latest reported
    /// state is not `target`, whether the wait timed out or the arm answered
    /// with a different state.
    #[instrument(skip_all, fields(arm = %self.topics.arm(), requested = %target))]
    pub async fn request_state_and_wait(
        &mut self,
        target: &str,
        timeout: Duration,
    ) -> Result<(), ArmError> {
        self.state.clear();
        self.adapter
            .publish_latched(&self.topics.set_robot_state(), Payload::Text(target.to_string()))?;

        if !self.state.wait_signaled(timeout).await {
            warn!(?timeout, "timed out waiting for a state change");
        }

        let observed = self.state.latest();
        if observed.as_str() != target {
            error!(%observed, "failed to reach state {target}");
            return Err(ArmError::UnreachedState {
                target: OperatingState::from(target),
                observed,
            });
        }
        info!("reached state {target}");
        Ok(())
    }

    /// Request homing and wait for the arm to report
    /// [`DVRK_READY`][states::READY].
    ///
    /// `Home` is published once.  Each attempt is one wait of up to
    /// `per_attempt_timeout`; an intermediate homing state uses up an attempt
    /// and the session keeps waiting without re-publishing.  Returns the
    /// number of attempts consumed.
    ///
    /// # Errors
    ///
    /// [`ArmError::HomingExhausted`] when `max_attempts` waits go by without
    /// the ready state.
    #[instrument(skip_all, fields(arm = %self.topics.arm(), max_attempts = max_attempts))]
    pub async fn home_and_wait(
        &mut self,
        max_attempts: u32,
        per_attempt_timeout: Duration,
    ) -> Result<u32, ArmError> {
        info!("requesting homing");
        self.state.clear();
        self.adapter
            .publish_latched(&self.topics.set_robot_state(), Payload::Text(states::HOME.to_string()))?;

        let mut attempts = 0;
        while attempts < max_attempts {
            attempts += 1;
            self.state.wait_signaled(per_attempt_timeout).await;
            // Read and re-arm in one step so a report landing now is kept for
            // the next attempt instead of being cleared unseen.
            let (observed, signaled) = self.state.take_signal();
            if signaled && observed.is_ready() {
                info!(attempts, "homing complete");
                return Ok(attempts);
            }
            if signaled {
                info!(state = %observed, attempt = attempts, "waiting for state to be {}", states::READY);
            } else {
                warn!(attempt = attempts, timeout = ?per_attempt_timeout, "no state change during homing attempt");
            }
        }

        if let Some(state) = self.state.signaled_value()
            && state.is_ready()
        {
            info!(attempts, "homing complete after the last wait");
            return Ok(attempts);
        }
        let last_state = self.state.latest();
        error!(attempts, %last_state, "failed to reach state {}", states::READY);
        Err(ArmError::HomingExhausted {
            attempts,
            last_state,
        })
    }

    /// Publish a goal-joint command and wait up to `timeout` for
    /// `goal_reached`.
    ///
    /// Returns the reported outcome, or `false` when nothing arrived in time.
    /// A `false` outcome is not an error here.
    ///
    /// # Errors
    ///
    /// Only bus failures.
    #[instrument(skip_all, fields(arm = %self.topics.arm(), joints = goal.len()))]
    pub async fn send_goal_and_wait(
        &mut self,
        goal: &[f64],
        timeout: Duration,
    ) -> Result<bool, ArmError> {
        self.goal_reached.clear();
        self.adapter.publish_latched(
            &self.topics.set_position_goal_joint(),
            Payload::Joints(goal.to_vec()),
        )?;

        if !self.goal_reached.wait_signaled(timeout).await {
            warn!(?timeout, "timed out waiting for goal_reached");
        }
        let reached = self.goal_reached.signaled_value().unwrap_or(false);
        debug!(reached, "goal outcome");
        Ok(reached)
    }

    /// Publish a direct joint-position command.  Not acknowledged.
    pub fn publish_joint_position(&self, positions: &[f64]) -> Result<(), ArmError> {
        self.adapter
            .publish_latched(
                &self.topics.set_position_joint(),
                Payload::Joints(positions.to_vec()),
            )
            .map(|_| ())
    }

    // -----------------------------------------------------------------------
    // Feedback
    // -----------------------------------------------------------------------

    /// Last operating state reported by the arm.
    pub fn current_state(&self) -> OperatingState {
        self.state.latest()
    }

    /// Last joint feedback received since the session started.
    ///
    /// Empty until the first delivery.  No freshness guarantee; see
    /// [`fresh_joint_position`][Self::fresh_joint_position].
    pub fn current_joint_position(&self) -> JointVector {
        self.joint_feedback.latest()
    }

    /// Last cartesian feedback received since the session started.
    pub fn current_cartesian_pose(&self) -> CartesianPose {
        self.cartesian_feedback.latest()
    }

    /// Discard the current joint feedback and wait for the next delivery.
    ///
    /// # Errors
    ///
    /// [`ArmError::Timeout`] when no feedback arrives within `timeout`.
    pub async fn fresh_joint_position(&mut self, timeout: Duration) -> Result<JointVector, ArmError> {
        fresh(&self.joint_feedback, timeout, "fresh_joint_position").await
    }

    /// Discard the current cartesian feedback and wait for the next delivery.
    pub async fn fresh_cartesian_pose(
        &mut self,
        timeout: Duration,
    ) -> Result<CartesianPose, ArmError> {
        fresh(&self.cartesian_feedback, timeout, "fresh_cartesian_pose").await
    }
}

/// Build a delivery handler that extracts `T` from a payload and sets the
/// latch.  Payloads of the wrong kind are dropped.
fn forward<T, F>(
    latch: Arc<EventLatch<T>>,
    topic: String,
    extract: F,
) -> impl FnMut(Payload) + Send + 'static
where
    T: Clone + Send + Sync + 'static,
    F: Fn(Payload) -> Option<T> + Send + 'static,
{
    move |payload| {
        let kind = payload.kind();
        match extract(payload) {
            Some(value) => latch.set(value),
            None => warn!(topic = %topic, kind, "unexpected payload kind; dropped"),
        }
    }
}

async fn fresh<T: Clone>(
    latch: &EventLatch<T>,
    timeout: Duration,
    operation: &str,
) -> Result<T, ArmError> {
    latch.clear();
    latch.wait_signaled(timeout).await;
    latch.signaled_value().ok_or_else(|| {
        warn!(?timeout, "{operation}: no feedback received");
        ArmError::Timeout {
            operation: operation.to_string(),
            after: timeout,
        }
    })
}
