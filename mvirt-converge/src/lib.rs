//! mvirt-converge: drives remote virtual machines from their observed state to
//! a declared desired state.
//!
//! The crate is split into a pure diff engine ([`diff`]), a transport seam
//! ([`clients::MachineClient`]) and the convergence loops that re-observe the
//! machine until a target holds ([`reconciler`]).

pub mod batch;
pub mod clients;
pub mod config;
pub mod diff;
pub mod error;
pub mod model;
pub mod reconciler;

pub use batch::{BatchReceipt, Operation, OperationBatch};
pub use clients::{ClientError, HttpMachineClient, MachineClient};
pub use config::{ConvergeConfig, RetryBudget};
pub use error::{Category, CategoryError, ConvergeError, Result};
pub use model::{DesiredState, MachineSnapshot, PowerState, PowerTarget};
pub use reconciler::{CancelHandle, Cancellation, Orchestrator, ReconcileReport, Removal};
