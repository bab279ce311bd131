//! Concrete loops: running, stopped, other power targets, removal and
//! network readiness.

use async_trait::async_trait;
use tracing::info;

use super::{ensure_state, Cancellation, Correction, MissingPolicy, Observation, Target};
use crate::clients::{ClientError, MachineClient};
use crate::config::ConvergeConfig;
use crate::error::Result;
use crate::model::{MachineSnapshot, PowerOperation, PowerState, PowerTarget};

/// Next power operation on the way from `current` to `want`.
///
/// Transitional states yield nothing: they are waited out, never acted on.
fn next_step(current: &PowerState, want: &PowerState) -> Option<PowerOperation> {
    use PowerState::*;
    match (current, want) {
        (Other(_), _) => None,
        (c, w) if c == w => None,
        (_, Stopped) => Some(PowerOperation::Stop),
        (Stopped, _) => Some(PowerOperation::Start),
        (Paused | Suspended, _) => Some(PowerOperation::Resume),
        (Running, Paused) => Some(PowerOperation::Pause),
        (Running, Suspended) => Some(PowerOperation::Suspend),
        _ => None,
    }
}

/// Drives the machine to a power state, optionally probing the guest agent
/// before reporting success.
pub struct PowerTransition {
    name: &'static str,
    want: PowerState,
    readiness: Option<String>,
    missing: MissingPolicy,
    issued: Vec<PowerOperation>,
}

impl PowerTransition {
    /// Running, and the guest agent answers the readiness command.
    pub fn running(readiness: impl Into<String>) -> Self {
        Self {
            name: "ensure-running",
            want: PowerState::Running,
            readiness: Some(readiness.into()),
            missing: MissingPolicy::Fail,
            issued: Vec::new(),
        }
    }

    pub fn stopped() -> Self {
        Self {
            name: "ensure-stopped",
            want: PowerState::Stopped,
            readiness: None,
            missing: MissingPolicy::Fail,
            issued: Vec::new(),
        }
    }

    pub fn to(target: PowerTarget) -> Self {
        Self {
            name: "ensure-power",
            want: target.state(),
            readiness: None,
            missing: MissingPolicy::Fail,
            issued: Vec::new(),
        }
    }

    /// Treat a confirmed missing machine as success.
    pub fn allow_missing(mut self) -> Self {
        self.missing = MissingPolicy::Confirm;
        self
    }

    /// Operations acknowledged so far.
    pub fn issued(&self) -> &[PowerOperation] {
        &self.issued
    }
}

#[async_trait]
impl Target for PowerTransition {
    fn name(&self) -> &'static str {
        self.name
    }

    fn on_missing(&self) -> MissingPolicy {
        self.missing
    }

    fn is_done(&self, snapshot: &MachineSnapshot) -> bool {
        snapshot.state == self.want
    }

    async fn correct(
        &mut self,
        client: &dyn MachineClient,
        id: &str,
        snapshot: &MachineSnapshot,
    ) -> std::result::Result<Correction, ClientError> {
        let Some(op) = next_step(&snapshot.state, &self.want) else {
            return Ok(Correction::Waiting);
        };
        // Once acknowledged, an operation is left to propagate.
        if self.issued.contains(&op) {
            return Ok(Correction::Waiting);
        }
        info!(
            id = %id,
            operation = %op,
            from = %snapshot.state,
            to = %self.want,
            "Issuing power operation"
        );
        client.set_power(id, op).await?;
        self.issued.push(op);
        Ok(Correction::Issued)
    }

    async fn confirm(
        &self,
        client: &dyn MachineClient,
        id: &str,
        _snapshot: &MachineSnapshot,
    ) -> std::result::Result<bool, ClientError> {
        match &self.readiness {
            Some(command) => Ok(client.run_command(id, command).await?.succeeded()),
            None => Ok(true),
        }
    }
}

/// Deletes a stopped machine and waits until the service agrees it is gone.
#[derive(Default)]
pub struct RemovalTarget {
    stop_issued: bool,
    delete_acknowledged: bool,
}

impl RemovalTarget {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Target for RemovalTarget {
    fn name(&self) -> &'static str {
        "ensure-removed"
    }

    fn on_missing(&self) -> MissingPolicy {
        MissingPolicy::Confirm
    }

    fn is_done(&self, snapshot: &MachineSnapshot) -> bool {
        self.delete_acknowledged && snapshot.state == PowerState::Stopped
    }

    async fn correct(
        &mut self,
        client: &dyn MachineClient,
        id: &str,
        snapshot: &MachineSnapshot,
    ) -> std::result::Result<Correction, ClientError> {
        // Never delete a machine that is not stopped.
        if snapshot.state != PowerState::Stopped {
            if !snapshot.state.is_stable() || self.stop_issued {
                return Ok(Correction::Waiting);
            }
            info!(id = %id, state = %snapshot.state, "Machine restarted before deletion, stopping");
            client.set_power(id, PowerOperation::Stop).await?;
            self.stop_issued = true;
            return Ok(Correction::Issued);
        }
        if self.delete_acknowledged {
            return Ok(Correction::Waiting);
        }
        info!(id = %id, "Deleting machine");
        match client.delete(id).await {
            Ok(()) | Err(ClientError::NotFound(_)) => {
                self.delete_acknowledged = true;
                Ok(Correction::Issued)
            }
            Err(e) => Err(e),
        }
    }
}

/// Waits for a real network address. Issues nothing.
pub struct NetworkTarget;

#[async_trait]
impl Target for NetworkTarget {
    fn name(&self) -> &'static str {
        "ensure-network-ready"
    }

    fn is_done(&self, snapshot: &MachineSnapshot) -> bool {
        snapshot.network_address().is_some()
    }

    async fn correct(
        &mut self,
        _client: &dyn MachineClient,
        _id: &str,
        _snapshot: &MachineSnapshot,
    ) -> std::result::Result<Correction, ClientError> {
        Ok(Correction::Waiting)
    }
}

/// Outcome of [`ensure_removed`].
#[derive(Debug, Clone, PartialEq)]
pub enum Removal {
    /// The machine was already gone; nothing was deleted.
    AlreadyAbsent,
    /// Deleted by this call.
    Deleted,
}

/// Running, with a responsive guest agent.
pub async fn ensure_running(
    client: &dyn MachineClient,
    id: &str,
    config: &ConvergeConfig,
    cancel: &Cancellation,
) -> Result<MachineSnapshot> {
    let mut target = PowerTransition::running(config.readiness_command.clone());
    ensure_state(client, id, &mut target, config.power, cancel)
        .await?
        .into_present(id)
}

pub async fn ensure_stopped(
    client: &dyn MachineClient,
    id: &str,
    config: &ConvergeConfig,
    cancel: &Cancellation,
) -> Result<MachineSnapshot> {
    let mut target = PowerTransition::stopped();
    ensure_state(client, id, &mut target, config.power, cancel)
        .await?
        .into_present(id)
}

/// Any declared power target. Running goes through [`ensure_running`].
pub async fn ensure_power(
    client: &dyn MachineClient,
    id: &str,
    target: PowerTarget,
    config: &ConvergeConfig,
    cancel: &Cancellation,
) -> Result<MachineSnapshot> {
    match target {
        PowerTarget::Running => ensure_running(client, id, config, cancel).await,
        PowerTarget::Stopped => ensure_stopped(client, id, config, cancel).await,
        other => {
            let mut transition = PowerTransition::to(other);
            ensure_state(client, id, &mut transition, config.power, cancel)
                .await?
                .into_present(id)
        }
    }
}

/// Stop, then delete, then wait until the service no longer knows the machine.
///
/// A machine that is (confirmed) missing up front counts as removed and no
/// delete is issued.
pub async fn ensure_removed(
    client: &dyn MachineClient,
    id: &str,
    config: &ConvergeConfig,
    cancel: &Cancellation,
) -> Result<Removal> {
    let mut stop = PowerTransition::stopped().allow_missing();
    if ensure_state(client, id, &mut stop, config.power, cancel).await? == Observation::Absent {
        info!(id = %id, "Machine already absent");
        return Ok(Removal::AlreadyAbsent);
    }

    let mut removal = RemovalTarget::new();
    ensure_state(client, id, &mut removal, config.removal, cancel).await?;
    info!(id = %id, "Machine removed");
    Ok(Removal::Deleted)
}

/// Poll until the guest reports a usable address.
pub async fn ensure_network_ready(
    client: &dyn MachineClient,
    id: &str,
    config: &ConvergeConfig,
    cancel: &Cancellation,
) -> Result<MachineSnapshot> {
    ensure_state(client, id, &mut NetworkTarget, config.network, cancel)
        .await?
        .into_present(id)
}
