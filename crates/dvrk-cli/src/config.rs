//! Configuration – reads/writes `~/.dvrk/config.toml`.
//!
//! Every field has a default, so a missing file or a partial one is fine.
//! `DVRK_CONFIG` points at another file.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use dvrk_hal::SimArmConfig;
use dvrk_middleware::{ArmTopics, DEFAULT_NAMESPACE};
use dvrk_runtime::{BaselinePolicy, SequencerConfig};
use dvrk_types::ArmError;

/// Upper bound on `wait_timeout_secs`: one day.
pub const MAX_WAIT_TIMEOUT_SECS: u64 = 24 * 60 * 60;

/// Upper bound on `sweep_duration_secs`: one hour.
pub const MAX_SWEEP_DURATION_SECS: f64 = 60.0 * 60.0;

/// Upper bound on `sweep_rate_hz`.
pub const MAX_SWEEP_RATE_HZ: u32 = 10_000;

/// Where the joint baseline of each stage comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Baseline {
    /// Last feedback received.
    Latest,
    /// Wait for the next feedback delivery.
    #[default]
    Fresh,
}

/// Behaviour of the simulated arm the CLI drives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimSection {
    #[serde(default = "default_step_delay_ms")]
    pub step_delay_ms: u64,

    /// `0` publishes feedback only when it changes.
    #[serde(default = "default_feedback_period_ms")]
    pub feedback_period_ms: u64,

    #[serde(default = "default_goal_outcome")]
    pub goal_outcome: bool,

    #[serde(default = "default_initial_joints")]
    pub initial_joints: Vec<f64>,

    /// Answer every mode request with this token instead.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_override: Option<String>,
}

/// Persisted configuration stored in `~/.dvrk/config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Arm instance name, e.g. `ECM`, `PSM1`.
    #[serde(default = "default_arm")]
    pub arm: String,

    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Bound on every state, goal and feedback wait.
    #[serde(default = "default_wait_timeout_secs")]
    pub wait_timeout_secs: u64,

    #[serde(default = "default_homing_attempts")]
    pub homing_attempts: u32,

    #[serde(default = "default_amplitude_deg")]
    pub amplitude_deg: f64,

    #[serde(default = "default_sweep_duration_secs")]
    pub sweep_duration_secs: f64,

    #[serde(default = "default_sweep_rate_hz")]
    pub sweep_rate_hz: u32,

    #[serde(default = "default_cartesian_threshold")]
    pub cartesian_threshold: f64,

    #[serde(default = "default_cartesian_guard_joint")]
    pub cartesian_guard_joint: usize,

    #[serde(default)]
    pub baseline: Baseline,

    #[serde(default)]
    pub sim: SimSection,
}

fn default_arm() -> String {
    "ECM".to_string()
}
fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}
fn default_wait_timeout_secs() -> u64 {
    60
}
fn default_homing_attempts() -> u32 {
    10
}
fn default_amplitude_deg() -> f64 {
    10.0
}
fn default_sweep_duration_secs() -> f64 {
    5.0
}
fn default_sweep_rate_hz() -> u32 {
    200
}
fn default_cartesian_threshold() -> f64 {
    0.12
}
fn default_cartesian_guard_joint() -> usize {
    2
}
fn default_step_delay_ms() -> u64 {
    200
}
fn default_feedback_period_ms() -> u64 {
    10
}
fn default_goal_outcome() -> bool {
    true
}
fn default_initial_joints() -> Vec<f64> {
    vec![0.0, 0.0, 0.05, 0.0]
}

impl Default for SimSection {
    fn default() -> Self {
        Self {
            step_delay_ms: default_step_delay_ms(),
            feedback_period_ms: default_feedback_period_ms(),
            goal_outcome: default_goal_outcome(),
            initial_joints: default_initial_joints(),
            state_override: None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            arm: default_arm(),
            namespace: default_namespace(),
            wait_timeout_secs: default_wait_timeout_secs(),
            homing_attempts: default_homing_attempts(),
            amplitude_deg: default_amplitude_deg(),
            sweep_duration_secs: default_sweep_duration_secs(),
            sweep_rate_hz: default_sweep_rate_hz(),
            cartesian_threshold: default_cartesian_threshold(),
            cartesian_guard_joint: default_cartesian_guard_joint(),
            baseline: Baseline::default(),
            sim: SimSection::default(),
        }
    }
}

impl Config {
    /// Reject values the sequencer cannot run with.
    ///
    /// # Errors
    ///
    /// [`ArmError::Config`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ArmError> {
        let fail = |msg: &str| Err(ArmError::Config(msg.to_string()));
        if self.arm.trim().is_empty() || self.arm.contains('/') {
            return fail("arm must be a non-empty name without '/'");
        }
        if !(1..=MAX_WAIT_TIMEOUT_SECS).contains(&self.wait_timeout_secs) {
            return fail("wait_timeout_secs must be between 1 and 86400");
        }
        if self.homing_attempts == 0 {
            return fail("homing_attempts must be at least 1");
        }
        if !(1..=MAX_SWEEP_RATE_HZ).contains(&self.sweep_rate_hz) {
            return fail("sweep_rate_hz must be between 1 and 10000");
        }
        if !(0.0..=MAX_SWEEP_DURATION_SECS).contains(&self.sweep_duration_secs) {
            return fail("sweep_duration_secs must be between 0 and 3600");
        }
        if !self.amplitude_deg.is_finite() {
            return fail("amplitude_deg must be a finite number");
        }
        if !self.cartesian_threshold.is_finite() {
            return fail("cartesian_threshold must be a finite number");
        }
        Ok(())
    }

    pub fn topics(&self) -> ArmTopics {
        ArmTopics::new(&self.namespace, &self.arm)
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_timeout_secs)
    }

    pub fn to_sequencer_config(&self) -> SequencerConfig {
        let timeout = self.wait_timeout();
        SequencerConfig {
            state_timeout: timeout,
            goal_timeout: timeout,
            homing_attempts: self.homing_attempts,
            amplitude: self.amplitude_deg.to_radians(),
            sweep_duration: Duration::try_from_secs_f64(self.sweep_duration_secs)
                .unwrap_or(Duration::ZERO),
            sweep_rate_hz: self.sweep_rate_hz,
            cartesian_threshold: self.cartesian_threshold,
            cartesian_guard_joint: self.cartesian_guard_joint,
            baseline: match self.baseline {
                Baseline::Latest => BaselinePolicy::Latest,
                Baseline::Fresh => BaselinePolicy::Fresh { timeout },
            },
        }
    }

    pub fn to_sim_config(&self) -> SimArmConfig {
        SimArmConfig {
            initial_joints: self.sim.initial_joints.clone(),
            step_delay: Duration::from_millis(self.sim.step_delay_ms),
            goal_outcome: self.sim.goal_outcome,
            state_override: self.sim.state_override.clone(),
            feedback_period: (self.sim.feedback_period_ms > 0)
                .then(|| Duration::from_millis(self.sim.feedback_period_ms)),
            ..SimArmConfig::default()
        }
    }
}

/// `DVRK_CONFIG` if set, otherwise `~/.dvrk/config.toml`.
pub fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var("DVRK_CONFIG") {
        return PathBuf::from(path);
    }
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".dvrk").join("config.toml")
}

/// Load the effective configuration: file (or defaults), then environment
/// overrides, then validation.
pub fn load() -> Result<Config, ArmError> {
    let mut cfg = load_from(&config_path())?.unwrap_or_default();
    apply_env_overrides(&mut cfg);
    cfg.validate()?;
    Ok(cfg)
}

/// Parse the file at `path`.  `None` when it does not exist.
pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, ArmError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path).map_err(|e| {
        ArmError::Config(format!("failed to read config at {}: {e}", path.display()))
    })?;
    let cfg = toml::from_str(&raw).map_err(|e| {
        ArmError::Config(format!("failed to parse config at {}: {e}", path.display()))
    })?;
    Ok(Some(cfg))
}

/// Apply `DVRK_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `DVRK_ARM` | `arm` |
/// | `DVRK_NAMESPACE` | `namespace` |
/// | `DVRK_WAIT_TIMEOUT_SECS` | `wait_timeout_secs` |
/// | `DVRK_SWEEP_RATE_HZ` | `sweep_rate_hz` |
///
/// Unparseable numbers are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("DVRK_ARM") {
        cfg.arm = v;
    }
    if let Ok(v) = std::env::var("DVRK_NAMESPACE") {
        cfg.namespace = v;
    }
    if let Ok(v) = std::env::var("DVRK_WAIT_TIMEOUT_SECS")
        && let Ok(secs) = v.trim().parse::<u64>()
    {
        cfg.wait_timeout_secs = secs;
    }
    if let Ok(v) = std::env::var("DVRK_SWEEP_RATE_HZ")
        && let Ok(rate) = v.trim().parse::<u32>()
    {
        cfg.sweep_rate_hz = rate;
    }
}

/// Write `cfg` to `path`, creating the parent directory if necessary.
pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), ArmError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| ArmError::Config(format!("failed to create config directory: {e}")))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700)).map_err(|e| {
                ArmError::Config(format!("failed to set config directory permissions: {e}"))
            })?;
        }
    }
    let raw = toml::to_string_pretty(cfg)
        .map_err(|e| ArmError::Config(format!("failed to serialize config: {e}")))?;
    fs::write(path, raw).map_err(|e| {
        ArmError::Config(format!("failed to write config at {}: {e}", path.display()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_path_points_to_dvrk_dir() {
        let p = config_path_for_home("/home/testuser");
        assert_eq!(p, PathBuf::from("/home/testuser/.dvrk/config.toml"));
    }

    #[test]
    fn load_from_returns_none_when_missing() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        assert!(load_from(&path).expect("no error").is_none());
    }

    #[test]
    fn roundtrip_default_config() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        save_to(&Config::default(), &path).expect("save");

        let loaded = load_from(&path).expect("load ok").expect("some");
        assert_eq!(loaded, Config::default());
    }

    #[cfg(unix)]
    #[test]
    fn config_directory_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        save_to(&Config::default(), &path).expect("save");

        let mode = std::fs::metadata(path.parent().unwrap())
            .expect("dir metadata")
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(mode, 0o700);
    }

    #[test]
    fn partial_file_keeps_defaults_for_missing_fields() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "arm = \"PSM1\"\nbaseline = \"latest\"\n\n[sim]\ngoal_outcome = false\n",
        )
        .unwrap();

        let cfg = load_from(&path).unwrap().unwrap();
        assert_eq!(cfg.arm, "PSM1");
        assert_eq!(cfg.baseline, Baseline::Latest);
        assert!(!cfg.sim.goal_outcome);
        assert_eq!(cfg.sim.step_delay_ms, 200);
        assert_eq!(cfg.wait_timeout_secs, 60);
        assert_eq!(cfg.sweep_rate_hz, 200);
    }

    #[test]
    fn malformed_file_is_a_config_error() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "sweep_rate_hz = \"fast\"").unwrap();

        assert!(matches!(load_from(&path), Err(ArmError::Config(_))));
    }

    #[test]
    fn validate_rejects_unusable_values() {
        let bad = [
            Config {
                arm: String::new(),
                ..Config::default()
            },
            Config {
                wait_timeout_secs: 0,
                ..Config::default()
            },
            Config {
                sweep_rate_hz: 0,
                ..Config::default()
            },
            Config {
                sweep_duration_secs: -1.0,
                ..Config::default()
            },
            Config {
                homing_attempts: 0,
                ..Config::default()
            },
            Config {
                wait_timeout_secs: u64::MAX,
                ..Config::default()
            },
            Config {
                wait_timeout_secs: MAX_WAIT_TIMEOUT_SECS + 1,
                ..Config::default()
            },
            Config {
                sweep_duration_secs: 1e20,
                ..Config::default()
            },
            Config {
                sweep_duration_secs: f64::NAN,
                ..Config::default()
            },
            Config {
                sweep_rate_hz: u32::MAX,
                ..Config::default()
            },
        ];
        for cfg in bad {
            assert!(matches!(cfg.validate(), Err(ArmError::Config(_))), "{cfg:?}");
        }
        assert_eq!(Config::default().validate(), Ok(()));
    }

    #[test]
    fn limits_are_accepted_and_convert_cleanly() {
        let cfg = Config {
            wait_timeout_secs: MAX_WAIT_TIMEOUT_SECS,
            sweep_duration_secs: MAX_SWEEP_DURATION_SECS,
            sweep_rate_hz: MAX_SWEEP_RATE_HZ,
            ..Config::default()
        };
        assert_eq!(cfg.validate(), Ok(()));
        let seq = cfg.to_sequencer_config();
        assert_eq!(seq.state_timeout, Duration::from_secs(86_400));
        assert_eq!(seq.sweep_duration, Duration::from_secs(3600));
    }

    #[test]
    fn out_of_range_duration_does_not_panic_when_converted() {
        let cfg = Config {
            sweep_duration_secs: 1e20,
            ..Config::default()
        };
        assert!(cfg.validate().is_err());
        assert_eq!(cfg.to_sequencer_config().sweep_duration, Duration::ZERO);
    }

    #[test]
    fn sequencer_config_follows_file_values() {
        let cfg = Config {
            wait_timeout_secs: 5,
            amplitude_deg: 20.0,
            sweep_duration_secs: 1.5,
            baseline: Baseline::Fresh,
            ..Config::default()
        };
        let seq = cfg.to_sequencer_config();
        assert_eq!(seq.state_timeout, Duration::from_secs(5));
        assert_eq!(seq.goal_timeout, Duration::from_secs(5));
        assert!((seq.amplitude - 20.0_f64.to_radians()).abs() < 1e-12);
        assert_eq!(seq.sweep_duration, Duration::from_millis(1500));
        assert_eq!(
            seq.baseline,
            BaselinePolicy::Fresh {
                timeout: Duration::from_secs(5)
            }
        );
    }

    #[test]
    fn zero_feedback_period_disables_periodic_feedback() {
        let mut cfg = Config::default();
        assert_eq!(cfg.to_sim_config().feedback_period, Some(Duration::from_millis(10)));
        cfg.sim.feedback_period_ms = 0;
        assert_eq!(cfg.to_sim_config().feedback_period, None);
    }

    #[test]
    fn topics_use_namespace_and_arm() {
        let cfg = Config {
            arm: "PSM2".into(),
            namespace: "/lab".into(),
            ..Config::default()
        };
        assert_eq!(cfg.topics().robot_state(), "/lab/PSM2/robot_state");
    }

    #[test]
    fn apply_env_overrides_changes_arm() {
        // SAFETY: no other test reads DVRK_ARM.
        unsafe { std::env::set_var("DVRK_ARM", "PSM3") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.arm, "PSM3");
        unsafe { std::env::remove_var("DVRK_ARM") };
    }

    #[test]
    fn apply_env_overrides_changes_namespace() {
        // SAFETY: no other test reads DVRK_NAMESPACE.
        unsafe { std::env::set_var("DVRK_NAMESPACE", "/bench") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.namespace, "/bench");
        unsafe { std::env::remove_var("DVRK_NAMESPACE") };
    }

    #[test]
    fn apply_env_overrides_changes_wait_timeout() {
        // SAFETY: no other test reads DVRK_WAIT_TIMEOUT_SECS.
        unsafe { std::env::set_var("DVRK_WAIT_TIMEOUT_SECS", "15") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.wait_timeout_secs, 15);
        unsafe { std::env::remove_var("DVRK_WAIT_TIMEOUT_SECS") };
    }

    #[test]
    fn apply_env_overrides_ignores_invalid_rate() {
        // SAFETY: no other test reads DVRK_SWEEP_RATE_HZ.
        unsafe { std::env::set_var("DVRK_SWEEP_RATE_HZ", "fast") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.sweep_rate_hz, 200);
        unsafe { std::env::remove_var("DVRK_SWEEP_RATE_HZ") };
    }
}
