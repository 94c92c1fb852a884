//! Topic naming for one arm instance.
//!
//! Every arm exposes the same seven channels under
//! `<namespace>/<arm>/`, e.g. `/dvrk/ECM/robot_state`.
//!
//! | Suffix | Payload | Direction |
//! |---|---|---|
//! | `set_robot_state` | state token | out |
//! | `robot_state` | state token | in |
//! | `goal_reached` | boolean | in |
//! | `set_position_joint` | joint vector | out |
//! | `set_position_goal_joint` | joint vector | out |
//! | `position_joint_desired` | joint vector | in |
//! | `position_cartesian_desired` | pose | in |

/// Namespace used by the dVRK console.
pub const DEFAULT_NAMESPACE: &str = "/dvrk";

/// Fully qualified topic names for a single arm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArmTopics {
    arm: String,
    prefix: String,
}

impl ArmTopics {
    /// Build the topic set for `arm` under `namespace`.
    ///
    /// Leading/trailing slashes on either part are normalised, so `"/dvrk/"`
    /// and `"dvrk"` produce the same names.
    pub fn new(namespace: &str, arm: &str) -> Self {
        let namespace = namespace.trim_matches('/');
        let arm = arm.trim_matches('/');
        let prefix = if namespace.is_empty() {
            format!("/{arm}")
        } else {
            format!("/{namespace}/{arm}")
        };
        Self {
            arm: arm.to_string(),
            prefix,
        }
    }

    /// Topic set for `arm` under [`DEFAULT_NAMESPACE`].
    pub fn for_arm(arm: &str) -> Self {
        Self::new(DEFAULT_NAMESPACE, arm)
    }

    /// The bare arm name, e.g. `"ECM"`.
    pub fn arm(&self) -> &str {
        &self.arm
    }

    /// `<namespace>/<arm>`.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn set_robot_state(&self) -> String {
        self.topic("set_robot_state")
    }

    pub fn robot_state(&self) -> String {
        self.topic("robot_state")
    }

    pub fn goal_reached(&self) -> String {
        self.topic("goal_reached")
    }

    pub fn set_position_joint(&self) -> String {
        self.topic("set_position_joint")
    }

    pub fn set_position_goal_joint(&self) -> String {
        self.topic("set_position_goal_joint")
    }

    pub fn position_joint_desired(&self) -> String {
        self.topic("position_joint_desired")
    }

    pub fn position_cartesian_desired(&self) -> String {
        self.topic("position_cartesian_desired")
    }

    fn topic(&self, suffix: &str) -> String {
        format!("{}/{suffix}", self.prefix)
    }
}
