//! Retry budgets and readiness settings for the convergence loops.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Attempts and pause between attempts for one loop invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryBudget {
    pub max_attempts: u32,
    pub interval_secs: u64,
}

impl RetryBudget {
    pub const fn new(max_attempts: u32, interval_secs: u64) -> Self {
        Self {
            max_attempts,
            interval_secs,
        }
    }

    /// Budget without waits between attempts.
    pub const fn immediate(max_attempts: u32) -> Self {
        Self::new(max_attempts, 0)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

fn default_power() -> RetryBudget {
    RetryBudget::new(10, 5)
}

fn default_network() -> RetryBudget {
    RetryBudget::new(30, 2)
}

fn default_removal() -> RetryBudget {
    RetryBudget::new(10, 10)
}

fn default_readiness_command() -> String {
    "echo ready".to_string()
}

/// Per-loop budgets.
///
/// Network polling uses many short waits; removal waits about twice as long
/// as power transitions because deletes propagate asynchronously.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvergeConfig {
    #[serde(default = "default_power")]
    pub power: RetryBudget,
    #[serde(default = "default_network")]
    pub network: RetryBudget,
    #[serde(default = "default_removal")]
    pub removal: RetryBudget,
    /// Command used to check the guest agent answers.
    #[serde(default = "default_readiness_command")]
    pub readiness_command: String,
}

impl ConvergeConfig {
    /// Same budgets for every loop with no waits. For tests and dry runs.
    pub fn immediate(max_attempts: u32) -> Self {
        let budget = RetryBudget::immediate(max_attempts);
        Self {
            power: budget,
            network: budget,
            removal: budget,
            readiness_command: default_readiness_command(),
        }
    }
}

impl Default for ConvergeConfig {
    fn default() -> Self {
        Self {
            power: default_power(),
            network: default_network(),
            removal: default_removal(),
            readiness_command: default_readiness_command(),
        }
    }
}
