//! Operation batches submitted to the control service in one transaction.
//!
//! The batch is an append-only accumulator: it validates that each operation
//! is structurally complete and nothing more. Deciding whether an operation is
//! needed, and whether the host can afford it, happens in the diff engine.

use serde::{Deserialize, Serialize};

use crate::error::{ConvergeError, Result};

/// Configuration groups understood by the control service.
pub mod groups {
    pub const CPU: &str = "cpu";
    pub const MEMORY: &str = "memory";
    pub const SHARED_FOLDER: &str = "shared-folder";
    pub const STARTUP_VIEW: &str = "startup-view";
    pub const ACCELERATION: &str = "passthrough-acceleration";
    pub const PAUSE_IDLE: &str = "pause-idle";
    pub const AUTOSTART: &str = "autostart";
}

/// Operation verbs.
pub mod verbs {
    pub const SET: &str = "set";
    pub const ADD: &str = "add";
    pub const UPDATE: &str = "update";
    pub const DELETE: &str = "delete";
}

/// `key=value` option attached to an operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationOption {
    pub flag: String,
    pub value: String,
}

/// A single atomic change scoped to one configuration group.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub group: String,
    pub operation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<OperationOption>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub flags: Vec<String>,
    /// Set after submission if the service rejected this operation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Operation {
    /// `set` operation carrying a value.
    pub fn set(group: &str, value: impl Into<String>) -> Self {
        Self {
            group: group.to_string(),
            operation: verbs::SET.to_string(),
            value: Some(value.into()),
            ..Default::default()
        }
    }

    pub fn option(mut self, flag: &str, value: impl Into<String>) -> Self {
        self.options.push(OperationOption {
            flag: flag.to_string(),
            value: value.into(),
        });
        self
    }

    pub fn flag(mut self, flag: &str) -> Self {
        self.flags.push(flag.to_string());
        self
    }

    fn validate(&self) -> Result<()> {
        if self.group.trim().is_empty() {
            return Err(ConvergeError::Validation(
                "operation group must not be empty".to_string(),
            ));
        }
        if self.operation.trim().is_empty() {
            return Err(ConvergeError::Validation(format!(
                "operation in group {} must not be empty",
                self.group
            )));
        }
        Ok(())
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.group, self.operation)?;
        if let Some(value) = &self.value {
            write!(f, " {}", value)?;
        }
        Ok(())
    }
}

/// Per-operation outcome reported by the service for a submitted batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchReceipt {
    #[serde(default)]
    pub results: Vec<OperationResult>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationResult {
    /// Index into the submitted batch.
    pub index: usize,
    #[serde(default)]
    pub error: Option<String>,
}

/// Ordered operations sharing an owning principal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationBatch {
    pub owner: String,
    operations: Vec<Operation>,
}

impl OperationBatch {
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            operations: Vec::new(),
        }
    }

    /// Append an operation. Rejects structurally incomplete operations.
    pub fn push(&mut self, op: Operation) -> Result<()> {
        op.validate()?;
        self.operations.push(op);
        Ok(())
    }

    pub fn extend(&mut self, ops: impl IntoIterator<Item = Operation>) -> Result<()> {
        for op in ops {
            self.push(op)?;
        }
        Ok(())
    }

    /// True when the batch holds any operation at all, no-op or not.
    pub fn has_changes(&self) -> bool {
        !self.operations.is_empty()
    }

    pub fn has_errors(&self) -> bool {
        self.operations.iter().any(|op| op.error.is_some())
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    pub fn into_operations(self) -> Vec<Operation> {
        self.operations
    }

    /// Copy per-operation errors from a receipt onto the batch.
    ///
    /// Results pointing past the end of the batch are ignored.
    pub fn record(&mut self, receipt: &BatchReceipt) {
        for result in &receipt.results {
            if let Some(op) = self.operations.get_mut(result.index) {
                op.error = result.error.clone().filter(|e| !e.is_empty());
            }
        }
    }

    /// Fail the pass if any operation was rejected.
    pub fn check(&self) -> Result<()> {
        let failed: Vec<String> = self
            .operations
            .iter()
            .filter_map(|op| op.error.as_ref().map(|e| format!("{} ({})", op, e)))
            .collect();
        if failed.is_empty() {
            return Ok(());
        }
        Err(ConvergeError::PartialBatch {
            failed: failed.len(),
            total: self.operations.len(),
            details: failed.join(", "),
        })
    }
}
