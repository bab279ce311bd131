//! Convergence loops.
//!
//! A loop repeatedly observes a machine, checks a [`Target`] predicate and
//! lets the target issue a corrective action until the predicate holds or the
//! retry budget runs out. The loop never trusts an action's own success; it
//! always re-observes.

pub mod cancel;
pub mod lifecycle;
pub mod orchestrator;

pub use cancel::{CancelHandle, Cancellation};
pub use lifecycle::{
    ensure_network_ready, ensure_power, ensure_removed, ensure_running, ensure_stopped,
    NetworkTarget, PowerTransition, Removal, RemovalTarget,
};
pub use orchestrator::{Orchestrator, ReconcileReport};

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use crate::clients::{ClientError, MachineClient};
use crate::config::RetryBudget;
use crate::error::{ConvergeError, Result};
use crate::model::MachineSnapshot;

/// What a loop does when the machine is reported missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissingPolicy {
    /// Missing is a hard failure.
    Fail,
    /// Missing is success.
    Accept,
    /// Missing is success once a second observation agrees.
    Confirm,
}

/// Result of asking a target to correct the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Correction {
    /// An action was acknowledged by the service.
    Issued,
    /// Nothing to do but wait.
    Waiting,
}

/// Terminal observation of a successful loop.
#[derive(Debug, Clone, PartialEq)]
pub enum Observation {
    Present(MachineSnapshot),
    Absent,
}

impl Observation {
    pub fn snapshot(&self) -> Option<&MachineSnapshot> {
        match self {
            Observation::Present(s) => Some(s),
            Observation::Absent => None,
        }
    }

    /// Snapshot of a loop that cannot end in `Absent`.
    pub fn into_present(self, id: &str) -> Result<MachineSnapshot> {
        match self {
            Observation::Present(s) => Ok(s),
            Observation::Absent => Err(ConvergeError::NotFound(id.to_string())),
        }
    }
}

/// Predicate plus corrective action driven by [`ensure_state`].
#[async_trait]
pub trait Target: Send + Sync {
    /// Loop name for logs and errors.
    fn name(&self) -> &'static str;

    fn on_missing(&self) -> MissingPolicy {
        MissingPolicy::Fail
    }

    /// Whether the snapshot satisfies the target.
    fn is_done(&self, snapshot: &MachineSnapshot) -> bool;

    /// Move the machine towards the target. Called for every observation that
    /// does not satisfy it; targets remember what they already issued.
    async fn correct(
        &mut self,
        client: &dyn MachineClient,
        id: &str,
        snapshot: &MachineSnapshot,
    ) -> std::result::Result<Correction, ClientError>;

    /// Extra check once the predicate holds, before declaring success.
    async fn confirm(
        &self,
        _client: &dyn MachineClient,
        _id: &str,
        _snapshot: &MachineSnapshot,
    ) -> std::result::Result<bool, ClientError> {
        Ok(true)
    }
}

/// Drive `id` until `target` holds.
///
/// Observation failures and actions with an unknown outcome count against the
/// budget. An action the service definitely refused ends the loop with
/// [`ConvergeError::Rejected`].
pub async fn ensure_state<T: Target + ?Sized>(
    client: &dyn MachineClient,
    id: &str,
    target: &mut T,
    budget: RetryBudget,
    cancel: &Cancellation,
) -> Result<Observation> {
    let name = target.name();
    let max_attempts = budget.max_attempts.max(1);
    let mut attempts = 0u32;
    let mut last: Option<MachineSnapshot> = None;
    let mut confirming_absence = false;

    loop {
        match cancel.guard(client.observe(id)).await? {
            Ok(snapshot) => {
                confirming_absence = false;
                debug!(
                    id = %id,
                    loop_name = name,
                    state = %snapshot.state,
                    attempt = attempts + 1,
                    "Observed machine"
                );

                if target.is_done(&snapshot) {
                    match cancel.guard(target.confirm(client, id, &snapshot)).await? {
                        Ok(true) => {
                            info!(id = %id, loop_name = name, attempts = attempts + 1, "Converged");
                            return Ok(Observation::Present(snapshot));
                        }
                        Ok(false) => {
                            debug!(id = %id, loop_name = name, "Post-condition not met yet")
                        }
                        Err(e) => {
                            debug!(id = %id, loop_name = name, error = %e, "Post-condition failed")
                        }
                    }
                } else {
                    match cancel.guard(target.correct(client, id, &snapshot)).await? {
                        Ok(Correction::Issued) => {
                            info!(
                                id = %id,
                                loop_name = name,
                                state = %snapshot.state,
                                "Corrective action issued"
                            )
                        }
                        Ok(Correction::Waiting) => {}
                        Err(ClientError::NotFound(_)) => {
                            debug!(id = %id, loop_name = name, "Machine vanished during correction")
                        }
                        Err(e) if e.is_unknown_outcome() => {
                            warn!(id = %id, loop_name = name, error = %e, "Action outcome unknown")
                        }
                        Err(e) => {
                            error!(id = %id, loop_name = name, error = %e, "Action rejected");
                            return Err(ConvergeError::Rejected {
                                action: format!("{} on {}", name, id),
                                message: e.to_string(),
                            });
                        }
                    }
                }
                last = Some(snapshot);
            }
            Err(ClientError::NotFound(_)) => match target.on_missing() {
                MissingPolicy::Fail => return Err(ConvergeError::NotFound(id.to_string())),
                MissingPolicy::Accept => return Ok(Observation::Absent),
                MissingPolicy::Confirm if confirming_absence => {
                    info!(id = %id, loop_name = name, "Machine confirmed absent");
                    return Ok(Observation::Absent);
                }
                MissingPolicy::Confirm => {
                    debug!(id = %id, loop_name = name, "Machine not found, confirming");
                    confirming_absence = true;
                    cancel.sleep(budget.interval()).await?;
                    continue;
                }
            },
            Err(e) => {
                warn!(
                    id = %id,
                    loop_name = name,
                    error = %e,
                    attempt = attempts + 1,
                    "Observation failed"
                )
            }
        }

        attempts += 1;
        if attempts >= max_attempts {
            error!(id = %id, loop_name = name, attempts, "Retry budget exhausted");
            return Err(ConvergeError::BudgetExhausted {
                loop_name: name,
                attempts,
                last: last.map(Box::new),
            });
        }
        cancel.sleep(budget.interval()).await?;
    }
}
