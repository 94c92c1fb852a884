//! [`MotionSequencer`] – the arm exercise, one stage after the other.
//!
//! | Stage | Mode requested | Motion |
//! |---|---|---|
//! | [`Stage::Home`] | `Home` | none, waits for `DVRK_READY` |
//! | [`Stage::JointDirect`] | `DVRK_POSITION_JOINT` | sinusoidal sweep on joints 0 and 1 |
//! | [`Stage::JointGoal`] | `DVRK_POSITION_GOAL_JOINT` | goals at `+A`, `-A`, back to baseline |
//! | [`Stage::CartesianSetup`] | `DVRK_POSITION_CARTESIAN` | optional insertion goal first |
//!
//! A stage only starts once every blocking call of the previous one has
//! returned successfully.  The first failure ends the run; fatal failures
//! are escalated through the [`ShutdownSignal`], and a requested shutdown is
//! honoured before each stage, each goal and each sweep sample.

use std::f64::consts::TAU;
use std::fmt;
use std::time::Duration;

use dvrk_kernel::{ArmSession, DEFAULT_HOMING_ATTEMPTS, DEFAULT_WAIT_TIMEOUT, ShutdownSignal};
use dvrk_types::{ArmError, CartesianPose, JointVector, states};
use tracing::{debug, info, instrument, warn};

/// Default sweep amplitude, ±10°.
pub const DEFAULT_AMPLITUDE: f64 = 10.0 * std::f64::consts::PI / 180.0;

/// Insertion depth the tool must reach before cartesian mode.
pub const DEFAULT_CARTESIAN_THRESHOLD: f64 = 0.12;

// ────────────────────────────────────────────────────────────────────────────
// Configuration
// ────────────────────────────────────────────────────────────────────────────

/// Where a stage takes its joint baseline from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BaselinePolicy {
    /// Last joint feedback received, however old.
    Latest,
    /// Discard the current feedback and wait up to `timeout` for the next one.
    Fresh { timeout: Duration },
}

impl Default for BaselinePolicy {
    fn default() -> Self {
        BaselinePolicy::Fresh {
            timeout: DEFAULT_WAIT_TIMEOUT,
        }
    }
}

/// Knobs of the exercise.
#[derive(Debug, Clone, PartialEq)]
pub struct SequencerConfig {
    /// Bound on every state-change wait, including each homing attempt.
    pub state_timeout: Duration,
    /// Bound on every `goal_reached` wait.
    pub goal_timeout: Duration,
    pub homing_attempts: u32,
    /// Offset applied to joints 0 and 1, in radians.
    pub amplitude: f64,
    pub sweep_duration: Duration,
    pub sweep_rate_hz: u32,
    /// Minimum value of the guard joint before switching to cartesian mode.
    pub cartesian_threshold: f64,
    /// Index of the joint checked against `cartesian_threshold`.
    pub cartesian_guard_joint: usize,
    pub baseline: BaselinePolicy,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            state_timeout: DEFAULT_WAIT_TIMEOUT,
            goal_timeout: DEFAULT_WAIT_TIMEOUT,
            homing_attempts: DEFAULT_HOMING_ATTEMPTS,
            amplitude: DEFAULT_AMPLITUDE,
            sweep_duration: Duration::from_secs(5),
            sweep_rate_hz: 200,
            cartesian_threshold: DEFAULT_CARTESIAN_THRESHOLD,
            cartesian_guard_joint: 2,
            baseline: BaselinePolicy::default(),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Report
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Home,
    JointDirect,
    JointGoal,
    CartesianSetup,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Home => "home",
            Stage::JointDirect => "joint direct",
            Stage::JointGoal => "joint goal",
            Stage::CartesianSetup => "cartesian setup",
        })
    }
}

/// What a run achieved so far.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SequenceReport {
    /// Stages that finished, in order.
    pub completed: Vec<Stage>,
    /// Waits consumed by homing.
    pub homing_attempts: u32,
    /// Samples published by the direct-joint sweep.
    pub sweep_samples: usize,
    /// Cartesian feedback read after the switch to cartesian mode.
    pub cartesian_pose: Option<CartesianPose>,
}

// ────────────────────────────────────────────────────────────────────────────
// Sweep helpers
// ────────────────────────────────────────────────────────────────────────────

/// Number of samples a sweep of `duration` at `rate_hz` publishes.
pub fn sweep_sample_count(duration: Duration, rate_hz: u32) -> usize {
    (duration.as_secs_f64() * f64::from(rate_hz)).round() as usize
}

/// Sample `index` of a `samples`-long sweep: joints 0 and 1 offset by
/// `amplitude * sin(2π·index/samples)`, every other joint left at baseline.
pub fn sweep_sample(baseline: &[f64], amplitude: f64, index: usize, samples: usize) -> JointVector {
    let mut sample = baseline.to_vec();
    if samples == 0 {
        return sample;
    }
    let offset = amplitude * (index as f64 * TAU / samples as f64).sin();
    for joint in sample.iter_mut().take(2) {
        *joint += offset;
    }
    sample
}

fn offset_goal(baseline: &[f64], offset: f64) -> JointVector {
    let mut goal = baseline.to_vec();
    for joint in goal.iter_mut().take(2) {
        *joint += offset;
    }
    goal
}

// ────────────────────────────────────────────────────────────────────────────
// Sequencer
// ────────────────────────────────────────────────────────────────────────────

/// Drives one [`ArmSession`] through the exercise.
pub struct MotionSequencer {
    session: ArmSession,
    config: SequencerConfig,
    shutdown: ShutdownSignal,
    report: SequenceReport,
}

impl MotionSequencer {
    pub fn new(session: ArmSession, config: SequencerConfig, shutdown: ShutdownSignal) -> Self {
        Self {
            session,
            config,
            shutdown,
            report: SequenceReport::default(),
        }
    }

    /// Progress of the current (or last) run; meaningful after a failure too.
    pub fn report(&self) -> &SequenceReport {
        &self.report
    }

    /// Run home → joint direct → joint goal → cartesian setup.
    ///
    /// # Errors
    ///
    /// The first stage failure.  Fatal ones (see [`ArmError::is_fatal`]) have
    /// already requested shutdown when this returns.
    pub async fn run(&mut self) -> Result<SequenceReport, ArmError> {
        self.report = SequenceReport::default();
        info!(arm = %self.session.arm(), "starting sequence");

        self.enter(Stage::Home)?;
        let attempts = self.home().await.map_err(|e| self.escalate(Stage::Home, e))?;
        self.report.homing_attempts = attempts;
        self.report.completed.push(Stage::Home);

        self.enter(Stage::JointDirect)?;
        let samples = self
            .joint_direct()
            .await
            .map_err(|e| self.escalate(Stage::JointDirect, e))?;
        self.report.sweep_samples = samples;
        self.report.completed.push(Stage::JointDirect);

        self.enter(Stage::JointGoal)?;
        self.joint_goal()
            .await
            .map_err(|e| self.escalate(Stage::JointGoal, e))?;
        self.report.completed.push(Stage::JointGoal);

        self.enter(Stage::CartesianSetup)?;
        let pose = self
            .cartesian_setup()
            .await
            .map_err(|e| self.escalate(Stage::CartesianSetup, e))?;
        self.report.cartesian_pose = Some(pose);
        self.report.completed.push(Stage::CartesianSetup);

        info!(arm = %self.session.arm(), "sequence complete");
        Ok(self.report.clone())
    }

    /// Home the arm.  Returns the number of waits it took.
    #[instrument(skip_all, fields(arm = %self.session.arm()))]
    pub async fn home(&mut self) -> Result<u32, ArmError> {
        let attempts = self
            .session
            .home_and_wait(self.config.homing_attempts, self.config.state_timeout)
            .await?;
        info!(attempts, "homing complete");
        Ok(attempts)
    }

    /// Switch to direct joint mode and sweep joints 0 and 1 around the
    /// baseline.  Returns the number of samples published.
    ///
    /// Pacing is best effort: one sleep of `1 / rate` after each publish, no
    /// catch-up when publishing overruns.
    #[instrument(skip_all, fields(arm = %self.session.arm()))]
    pub async fn joint_direct(&mut self) -> Result<usize, ArmError> {
        info!("starting joint direct");
        self.session
            .request_state_and_wait(states::POSITION_JOINT, self.config.state_timeout)
            .await?;
        let baseline = self.baseline().await?;

        let samples = sweep_sample_count(self.config.sweep_duration, self.config.sweep_rate_hz);
        let period = Duration::from_secs(1) / self.config.sweep_rate_hz.max(1);
        debug!(samples, ?period, joints = baseline.len(), "sweeping 2 joints");

        for index in 0..samples {
            self.check_shutdown()?;
            let sample = sweep_sample(&baseline, self.config.amplitude, index, samples);
            self.session.publish_joint_position(&sample)?;
            tokio::time::sleep(period).await;
        }
        info!(samples, "joint direct complete");
        Ok(samples)
    }

    /// Switch to goal joint mode and send three goals, each awaited:
    /// baseline `+A`, baseline `-A`, then the baseline itself.
    #[instrument(skip_all, fields(arm = %self.session.arm()))]
    pub async fn joint_goal(&mut self) -> Result<(), ArmError> {
        info!("starting joint goal");
        self.session
            .request_state_and_wait(states::POSITION_GOAL_JOINT, self.config.state_timeout)
            .await?;
        let baseline = self.baseline().await?;

        let amplitude = self.config.amplitude;
        let goals = [
            ("+amplitude", amplitude),
            ("-amplitude", -amplitude),
            ("baseline", 0.0),
        ];
        for (label, offset) in goals {
            self.check_shutdown()?;
            self.goal(&offset_goal(&baseline, offset), label).await?;
        }
        info!("joint goal complete");
        Ok(())
    }

    /// Make sure the tool is inserted past the threshold, then switch to
    /// cartesian mode.  Returns the cartesian feedback read afterwards.
    #[instrument(skip_all, fields(arm = %self.session.arm()))]
    pub async fn cartesian_setup(&mut self) -> Result<CartesianPose, ArmError> {
        info!("starting cartesian setup");
        let baseline = self.baseline().await?;

        let guard = self.config.cartesian_guard_joint;
        let threshold = self.config.cartesian_threshold;
        if let Some(&insertion) = baseline.get(guard) {
            if insertion < threshold {
                info!(joint = guard, insertion, threshold, "advancing tool past the cannula");
                self.session
                    .request_state_and_wait(states::POSITION_GOAL_JOINT, self.config.state_timeout)
                    .await?;
                let mut goal = baseline.clone();
                goal[guard] = threshold;
                self.check_shutdown()?;
                self.goal(&goal, "insertion guard").await?;
            }
        }

        self.session
            .request_state_and_wait(states::POSITION_CARTESIAN, self.config.state_timeout)
            .await?;
        let pose = match self.config.baseline {
            BaselinePolicy::Latest => self.session.current_cartesian_pose(),
            BaselinePolicy::Fresh { timeout } => self.session.fresh_cartesian_pose(timeout).await?,
        };
        info!(
            x = pose.position.x,
            y = pose.position.y,
            z = pose.position.z,
            "cartesian setup complete"
        );
        Ok(pose)
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    async fn baseline(&mut self) -> Result<JointVector, ArmError> {
        let joints = match self.config.baseline {
            BaselinePolicy::Latest => self.session.current_joint_position(),
            BaselinePolicy::Fresh { timeout } => self.session.fresh_joint_position(timeout).await?,
        };
        if joints.len() < 2 {
            return Err(ArmError::InvalidFeedback(format!(
                "joint baseline has {} joint(s), at least 2 needed",
                joints.len()
            )));
        }
        Ok(joints)
    }

    async fn goal(&mut self, goal: &[f64], label: &str) -> Result<(), ArmError> {
        debug!(label, ?goal, "sending goal");
        if self.session.send_goal_and_wait(goal, self.config.goal_timeout).await? {
            Ok(())
        } else {
            Err(ArmError::GoalNotReached {
                label: label.to_string(),
            })
        }
    }

    fn enter(&self, stage: Stage) -> Result<(), ArmError> {
        self.check_shutdown()?;
        info!(arm = %self.session.arm(), %stage, "entering stage");
        Ok(())
    }

    fn check_shutdown(&self) -> Result<(), ArmError> {
        if self.shutdown.is_requested() {
            return Err(ArmError::ShutdownRequested(
                self.shutdown.reason().unwrap_or_default(),
            ));
        }
        Ok(())
    }

    fn escalate(&self, stage: Stage, err: ArmError) -> ArmError {
        if err.is_fatal() {
            self.shutdown.request(format!("{stage}: {err}"));
        } else {
            warn!(%stage, error = %err, "stage stopped");
        }
        err
    }
}
