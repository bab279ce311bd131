//! Test doubles for the machine control service.
//!
//! `ScriptedClient` replays a fixed sequence of observations, while
//! `SimulatedHost` keeps an in-memory machine that reacts to operations.

#![allow(dead_code)]

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;

use mvirt_converge::batch::{groups, verbs, BatchReceipt, OperationResult};
use mvirt_converge::model::{
    CommandOutput, Hardware, PowerOperation, PowerState, SharedFolder, SystemUsage, Toggles,
};
use mvirt_converge::{ClientError, MachineClient, MachineSnapshot, OperationBatch, Operation};

/// Call recorded by the fakes.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Observe,
    ApplyBatch(Vec<Operation>),
    SetPower(PowerOperation),
    Delete,
    RunCommand(String),
    SystemUsage,
}

pub fn snapshot(state: PowerState) -> MachineSnapshot {
    MachineSnapshot {
        id: "vm-1".to_string(),
        name: "builder".to_string(),
        state,
        ip_address: None,
        owner: "alice".to_string(),
        hardware: Hardware {
            cpu_count: 2,
            memory_mb: 2048,
            disks: Vec::new(),
        },
        shared_folders: Vec::new(),
        settings: Toggles::default(),
    }
}

pub fn with_ip(mut snapshot: MachineSnapshot, ip: &str) -> MachineSnapshot {
    snapshot.ip_address = Some(ip.to_string());
    snapshot
}

pub fn ok_output(stdout: &str) -> CommandOutput {
    CommandOutput {
        stdout: stdout.to_string(),
        ..Default::default()
    }
}

pub fn failed_output(exit_code: i32, stderr: &str) -> CommandOutput {
    CommandOutput {
        stderr: stderr.to_string(),
        exit_code,
        ..Default::default()
    }
}

pub fn folder(name: &str, path: &str) -> SharedFolder {
    SharedFolder {
        name: name.to_string(),
        path: path.to_string(),
        description: String::new(),
        readonly: false,
        disabled: false,
    }
}

pub fn unavailable() -> ClientError {
    ClientError::Unavailable("503 Service Unavailable".to_string())
}

pub fn not_found() -> ClientError {
    ClientError::NotFound("vm-1".to_string())
}

/// Pops the next scripted response; the last one repeats forever.
fn next<T: Clone>(queue: &Mutex<VecDeque<T>>, fallback: T) -> T {
    let mut queue = queue.lock().unwrap();
    if queue.len() > 1 {
        queue.pop_front().unwrap()
    } else {
        queue.front().cloned().unwrap_or(fallback)
    }
}

/// Replays scripted responses and records every call.
pub struct ScriptedClient {
    observations: Mutex<VecDeque<Result<MachineSnapshot, ClientError>>>,
    commands: Mutex<VecDeque<Result<CommandOutput, ClientError>>>,
    power: Mutex<VecDeque<Result<(), ClientError>>>,
    deletes: Mutex<VecDeque<Result<(), ClientError>>>,
    receipt: Mutex<BatchReceipt>,
    usage: SystemUsage,
    calls: Mutex<Vec<Call>>,
}

impl ScriptedClient {
    pub fn new(observations: Vec<Result<MachineSnapshot, ClientError>>) -> Self {
        Self {
            observations: Mutex::new(observations.into()),
            commands: Mutex::new(VecDeque::new()),
            power: Mutex::new(VecDeque::new()),
            deletes: Mutex::new(VecDeque::new()),
            receipt: Mutex::new(BatchReceipt::default()),
            usage: SystemUsage {
                cpu_total: 16,
                cpu_used: 4,
                memory_total_mb: 32768,
                memory_used_mb: 8192,
            },
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn states(states: &[PowerState]) -> Self {
        Self::new(states.iter().cloned().map(|s| Ok(snapshot(s))).collect())
    }

    pub fn with_commands(self, outputs: Vec<Result<CommandOutput, ClientError>>) -> Self {
        *self.commands.lock().unwrap() = outputs.into();
        self
    }

    pub fn with_power_responses(self, responses: Vec<Result<(), ClientError>>) -> Self {
        *self.power.lock().unwrap() = responses.into();
        self
    }

    pub fn with_delete_responses(self, responses: Vec<Result<(), ClientError>>) -> Self {
        *self.deletes.lock().unwrap() = responses.into();
        self
    }

    pub fn with_receipt(self, receipt: BatchReceipt) -> Self {
        *self.receipt.lock().unwrap() = receipt;
        self
    }

    pub fn with_usage(mut self, usage: SystemUsage) -> Self {
        self.usage = usage;
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, matches: impl Fn(&Call) -> bool) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| matches(c)).count()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl MachineClient for ScriptedClient {
    async fn observe(&self, _id: &str) -> Result<MachineSnapshot, ClientError> {
        self.record(Call::Observe);
        next(&self.observations, Err(not_found()))
    }

    async fn apply_batch(
        &self,
        _id: &str,
        batch: &OperationBatch,
    ) -> Result<BatchReceipt, ClientError> {
        self.record(Call::ApplyBatch(batch.operations().to_vec()));
        Ok(self.receipt.lock().unwrap().clone())
    }

    async fn set_power(&self, _id: &str, op: PowerOperation) -> Result<(), ClientError> {
        self.record(Call::SetPower(op));
        next(&self.power, Ok(()))
    }

    async fn delete(&self, _id: &str) -> Result<(), ClientError> {
        self.record(Call::Delete);
        next(&self.deletes, Ok(()))
    }

    async fn run_command(&self, _id: &str, command: &str) -> Result<CommandOutput, ClientError> {
        self.record(Call::RunCommand(command.to_string()));
        next(&self.commands, Ok(ok_output("ready\n")))
    }

    async fn system_usage(&self) -> Result<SystemUsage, ClientError> {
        self.record(Call::SystemUsage);
        Ok(self.usage)
    }
}

/// In-memory machine that applies operations the way the service would.
///
/// Power operations take effect immediately. A running machine reports a
/// network address.
pub struct SimulatedHost {
    machine: Mutex<Option<MachineSnapshot>>,
    usage: Mutex<SystemUsage>,
    rejected_groups: Mutex<HashSet<String>>,
    failing_commands: Mutex<HashSet<String>>,
    calls: Mutex<Vec<Call>>,
}

impl SimulatedHost {
    pub fn new(machine: MachineSnapshot) -> Self {
        Self {
            machine: Mutex::new(Some(machine)),
            usage: Mutex::new(SystemUsage {
                cpu_total: 16,
                cpu_used: 4,
                memory_total_mb: 32768,
                memory_used_mb: 8192,
            }),
            rejected_groups: Mutex::new(HashSet::new()),
            failing_commands: Mutex::new(HashSet::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn stopped() -> Self {
        Self::new(snapshot(PowerState::Stopped))
    }

    pub fn running() -> Self {
        Self::new(with_ip(snapshot(PowerState::Running), "10.0.0.5"))
    }

    /// Flag every operation in `group` as rejected in batch receipts.
    pub fn reject_group(&self, group: &str) {
        self.rejected_groups.lock().unwrap().insert(group.to_string());
    }

    pub fn fail_command(&self, command: &str) {
        self.failing_commands.lock().unwrap().insert(command.to_string());
    }

    pub fn set_usage(&self, usage: SystemUsage) {
        *self.usage.lock().unwrap() = usage;
    }

    pub fn machine(&self) -> Option<MachineSnapshot> {
        self.machine.lock().unwrap().clone()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    /// Operations submitted across all batches.
    pub fn submitted(&self) -> Vec<Operation> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter_map(|c| match c {
                Call::ApplyBatch(ops) => Some(ops.clone()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    pub fn power_calls(&self) -> Vec<PowerOperation> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter_map(|c| match c {
                Call::SetPower(op) => Some(*op),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

fn option<'a>(op: &'a Operation, flag: &str) -> &'a str {
    op.options
        .iter()
        .find(|o| o.flag == flag)
        .map(|o| o.value.as_str())
        .unwrap_or_default()
}

fn apply(machine: &mut MachineSnapshot, op: &Operation) {
    let value = op.value.clone().unwrap_or_default();
    match op.group.as_str() {
        groups::CPU => machine.hardware.cpu_count = value.parse().unwrap(),
        groups::MEMORY => machine.hardware.memory_mb = value.parse().unwrap(),
        groups::STARTUP_VIEW => machine.settings.start_headless = value == "headless",
        groups::ACCELERATION => machine.settings.passthrough_acceleration = value == "on",
        groups::PAUSE_IDLE => machine.settings.pause_when_idle = value == "on",
        groups::AUTOSTART => machine.settings.autostart_on_host = value == "on",
        groups::SHARED_FOLDER => {
            let folders = &mut machine.shared_folders;
            match op.operation.as_str() {
                verbs::DELETE => folders.retain(|f| f.name != value),
                verbs::UPDATE => {
                    if let Some(f) = folders.iter_mut().find(|f| f.name == value) {
                        f.path = option(op, "path").to_string();
                        f.description = option(op, "description").to_string();
                        f.readonly = option(op, "readonly") == "true";
                        f.disabled = option(op, "disabled") == "true";
                    }
                }
                verbs::ADD => folders.push(SharedFolder {
                    name: value,
                    path: option(op, "path").to_string(),
                    description: option(op, "description").to_string(),
                    readonly: op.flags.iter().any(|f| f == "readonly"),
                    disabled: op.flags.iter().any(|f| f == "disabled"),
                }),
                other => panic!("unexpected folder verb {}", other),
            }
        }
        other => panic!("unexpected group {}", other),
    }
}

#[async_trait]
impl MachineClient for SimulatedHost {
    async fn observe(&self, id: &str) -> Result<MachineSnapshot, ClientError> {
        self.record(Call::Observe);
        self.machine()
            .ok_or_else(|| ClientError::NotFound(id.to_string()))
    }

    async fn apply_batch(
        &self,
        id: &str,
        batch: &OperationBatch,
    ) -> Result<BatchReceipt, ClientError> {
        self.record(Call::ApplyBatch(batch.operations().to_vec()));
        let rejected = self.rejected_groups.lock().unwrap().clone();
        let mut guard = self.machine.lock().unwrap();
        let machine = guard
            .as_mut()
            .ok_or_else(|| ClientError::NotFound(id.to_string()))?;

        let mut receipt = BatchReceipt::default();
        for (index, op) in batch.operations().iter().enumerate() {
            if rejected.contains(&op.group) {
                receipt.results.push(OperationResult {
                    index,
                    error: Some(format!("{} is locked", op.group)),
                });
                continue;
            }
            apply(machine, op);
            receipt.results.push(OperationResult { index, error: None });
        }
        Ok(receipt)
    }

    async fn set_power(&self, id: &str, op: PowerOperation) -> Result<(), ClientError> {
        self.record(Call::SetPower(op));
        let mut guard = self.machine.lock().unwrap();
        let machine = guard
            .as_mut()
            .ok_or_else(|| ClientError::NotFound(id.to_string()))?;
        machine.state = match op {
            PowerOperation::Start | PowerOperation::Resume => PowerState::Running,
            PowerOperation::Stop => PowerState::Stopped,
            PowerOperation::Pause => PowerState::Paused,
            PowerOperation::Suspend => PowerState::Suspended,
        };
        machine.ip_address = match machine.state {
            PowerState::Running => Some("10.0.0.5".to_string()),
            _ => None,
        };
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), ClientError> {
        self.record(Call::Delete);
        let mut guard = self.machine.lock().unwrap();
        match guard.as_ref() {
            None => Err(ClientError::NotFound(id.to_string())),
            Some(m) if m.state != PowerState::Stopped => Err(ClientError::Rejected {
                status: 409,
                message: "machine is not stopped".to_string(),
            }),
            Some(_) => {
                *guard = None;
                Ok(())
            }
        }
    }

    async fn run_command(&self, id: &str, command: &str) -> Result<CommandOutput, ClientError> {
        self.record(Call::RunCommand(command.to_string()));
        let running = self
            .machine()
            .ok_or_else(|| ClientError::NotFound(id.to_string()))?
            .state
            == PowerState::Running;
        if !running {
            return Err(ClientError::Rejected {
                status: 409,
                message: "guest agent not running".to_string(),
            });
        }
        if self.failing_commands.lock().unwrap().contains(command) {
            return Ok(failed_output(2, "command not found"));
        }
        Ok(ok_output(&format!("{}\n", command)))
    }

    async fn system_usage(&self) -> Result<SystemUsage, ClientError> {
        self.record(Call::SystemUsage);
        Ok(*self.usage.lock().unwrap())
    }
}
