//! Client for the machine control service.
//!
//! The convergence engine only talks to the service through [`MachineClient`];
//! [`HttpMachineClient`] is the production implementation.

pub mod http;

pub use http::HttpMachineClient;

use async_trait::async_trait;
use thiserror::Error;

use crate::batch::{BatchReceipt, OperationBatch};
use crate::model::{CommandOutput, MachineSnapshot, PowerOperation, SystemUsage};

/// Errors returned by the control service client.
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    /// Machine does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Timeout, connection failure or gateway error. Whether the request took
    /// effect is unknown.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// The service answered with a definite failure.
    #[error("rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    /// Response body could not be decoded.
    #[error("decode: {0}")]
    Decode(String),
}

impl ClientError {
    /// True when the request may or may not have been applied.
    ///
    /// Non-idempotent actions are only repeated after this kind of failure.
    pub fn is_unknown_outcome(&self) -> bool {
        matches!(self, ClientError::Unavailable(_))
    }
}

/// Typed access to the machine control service.
#[async_trait]
pub trait MachineClient: Send + Sync {
    /// Fetch a fresh snapshot.
    async fn observe(&self, id: &str) -> Result<MachineSnapshot, ClientError>;

    /// Submit a batch. Per-operation rejections come back in the receipt.
    async fn apply_batch(&self, id: &str, batch: &OperationBatch)
        -> Result<BatchReceipt, ClientError>;

    /// Request a power transition.
    async fn set_power(&self, id: &str, op: PowerOperation) -> Result<(), ClientError>;

    async fn delete(&self, id: &str) -> Result<(), ClientError>;

    /// Run a command through the guest agent.
    async fn run_command(&self, id: &str, command: &str) -> Result<CommandOutput, ClientError>;

    /// Host capacity, used by the admission check.
    async fn system_usage(&self) -> Result<SystemUsage, ClientError>;
}
