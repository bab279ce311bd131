//! Convergence error types.

use thiserror::Error;

use crate::clients::ClientError;
use crate::model::MachineSnapshot;

/// Desired-state category reconciled independently by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    Specs,
    Toggles,
    SharedFolders,
    Power,
    Network,
    Commands,
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Category::Specs => "specs",
            Category::Toggles => "toggles",
            Category::SharedFolders => "shared-folders",
            Category::Power => "power",
            Category::Network => "network",
            Category::Commands => "commands",
        };
        f.write_str(name)
    }
}

/// Failure of one category during an update pass.
#[derive(Debug)]
pub struct CategoryError {
    pub category: Category,
    pub error: ConvergeError,
}

/// Errors that can occur while converging a machine.
#[derive(Debug, Error)]
pub enum ConvergeError {
    /// Network or timeout failure talking to the control service.
    #[error("transport: {0}")]
    Transport(String),

    /// Machine does not exist.
    #[error("machine not found: {0}")]
    NotFound(String),

    /// Admission check refused a resize. Never retried.
    #[error("insufficient {resource}: requested {requested}, available {available}")]
    Capacity {
        resource: &'static str,
        requested: i64,
        available: i64,
    },

    /// Malformed desired state. Never retried.
    #[error("invalid desired state: {0}")]
    Validation(String),

    /// The service accepted the batch but flagged some of its operations.
    #[error("{failed} of {total} operations rejected: {details}")]
    PartialBatch {
        failed: usize,
        total: usize,
        details: String,
    },

    /// Confirmed failure response for an action that is unsafe to repeat.
    #[error("{action} rejected: {message}")]
    Rejected { action: String, message: String },

    /// Loop ran out of attempts.
    #[error("{loop_name} did not converge after {attempts} attempts{}", describe_last(.last))]
    BudgetExhausted {
        loop_name: &'static str,
        attempts: u32,
        last: Option<Box<MachineSnapshot>>,
    },

    /// Post-provision command exited non-zero.
    #[error("command `{command}` failed with exit code {exit_code}: {stderr}")]
    CommandFailed {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("cancelled")]
    Cancelled,

    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// One or more categories of an update pass failed.
    #[error("{} categories failed: {}", .0.len(), summarize(.0))]
    Categories(Vec<CategoryError>),
}

impl ConvergeError {
    /// Last snapshot observed before the loop gave up, if any.
    pub fn last_snapshot(&self) -> Option<&MachineSnapshot> {
        match self {
            ConvergeError::BudgetExhausted { last, .. } => last.as_deref(),
            _ => None,
        }
    }
}

fn describe_last(last: &Option<Box<MachineSnapshot>>) -> String {
    match last {
        Some(snapshot) => format!(" (last state: {})", snapshot.state),
        None => String::new(),
    }
}

fn summarize(errors: &[CategoryError]) -> String {
    errors
        .iter()
        .map(|e| format!("{}: {}", e.category, e.error))
        .collect::<Vec<_>>()
        .join("; ")
}

impl From<ClientError> for ConvergeError {
    fn from(e: ClientError) -> Self {
        match e {
            ClientError::NotFound(id) => ConvergeError::NotFound(id),
            ClientError::Unavailable(msg) | ClientError::Decode(msg) => {
                ConvergeError::Transport(msg)
            }
            ClientError::Rejected { status, message } => ConvergeError::Rejected {
                action: format!("request (HTTP {})", status),
                message,
            },
        }
    }
}

/// Result type for convergence operations.
pub type Result<T> = std::result::Result<T, ConvergeError>;
