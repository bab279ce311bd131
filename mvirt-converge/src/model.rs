//! Observed and desired machine state.
//!
//! A [`MachineSnapshot`] is what the control service reports for a machine at
//! one point in time. A [`DesiredState`] is what the caller wants; each of its
//! categories is wrapped in [`Declared`] so "no opinion" is an explicit branch
//! and never a zero value.

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Addresses the control service reports while a guest has no lease yet.
pub const NETWORK_PLACEHOLDERS: &[&str] = &["", "-", "0.0.0.0", "::"];

/// CPU count applied when a specs block leaves it unset.
pub const DEFAULT_CPU_COUNT: u32 = 2;

/// Memory size (MB) applied when a specs block leaves it unset.
pub const DEFAULT_MEMORY_MB: u64 = 2048;

/// Lifecycle state reported by the hypervisor.
///
/// Anything the service reports outside the four stable states is kept as
/// `Other` and treated as transitional.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum PowerState {
    Stopped,
    Running,
    Paused,
    Suspended,
    Other(String),
}

impl PowerState {
    pub fn as_str(&self) -> &str {
        match self {
            PowerState::Stopped => "stopped",
            PowerState::Running => "running",
            PowerState::Paused => "paused",
            PowerState::Suspended => "suspended",
            PowerState::Other(s) => s,
        }
    }

    /// Stable states are the only ones a corrective action is issued from.
    pub fn is_stable(&self) -> bool {
        !matches!(self, PowerState::Other(_))
    }
}

impl From<String> for PowerState {
    fn from(s: String) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "stopped" => PowerState::Stopped,
            "running" => PowerState::Running,
            "paused" => PowerState::Paused,
            "suspended" => PowerState::Suspended,
            _ => PowerState::Other(s),
        }
    }
}

impl From<PowerState> for String {
    fn from(state: PowerState) -> Self {
        state.as_str().to_string()
    }
}

impl std::fmt::Display for PowerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Power transitions the control service accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerOperation {
    Start,
    Stop,
    Pause,
    Suspend,
    Resume,
}

impl PowerOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            PowerOperation::Start => "start",
            PowerOperation::Stop => "stop",
            PowerOperation::Pause => "pause",
            PowerOperation::Suspend => "suspend",
            PowerOperation::Resume => "resume",
        }
    }
}

impl std::fmt::Display for PowerOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Disk attached to a machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Disk {
    pub name: String,
    #[serde(default)]
    pub size_mb: u64,
}

/// Hardware record nested in a snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hardware {
    pub cpu_count: u32,
    pub memory_mb: u64,
    #[serde(default)]
    pub disks: Vec<Disk>,
}

/// Host directory exposed to the guest, identified by `name`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedFolder {
    pub name: String,
    pub path: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub readonly: bool,
    #[serde(default)]
    pub disabled: bool,
}

/// Boolean machine settings. `Default` is the baseline: everything off.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Toggles {
    pub start_headless: bool,
    pub passthrough_acceleration: bool,
    pub pause_when_idle: bool,
    pub autostart_on_host: bool,
}

/// Point-in-time view of a remote machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineSnapshot {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub state: PowerState,
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub hardware: Hardware,
    #[serde(default)]
    pub shared_folders: Vec<SharedFolder>,
    #[serde(default)]
    pub settings: Toggles,
}

impl MachineSnapshot {
    /// Network address, if the guest has a real one.
    pub fn network_address(&self) -> Option<&str> {
        self.ip_address
            .as_deref()
            .map(str::trim)
            .filter(|addr| !NETWORK_PLACEHOLDERS.contains(addr))
    }
}

/// Host capacity as reported by the control service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemUsage {
    pub cpu_total: u32,
    pub cpu_used: u32,
    pub memory_total_mb: u64,
    pub memory_used_mb: u64,
}

impl SystemUsage {
    pub fn available_cpu(&self) -> i64 {
        i64::from(self.cpu_total) - i64::from(self.cpu_used)
    }

    pub fn available_memory_mb(&self) -> i64 {
        let total = i64::try_from(self.memory_total_mb).unwrap_or(i64::MAX);
        let used = i64::try_from(self.memory_used_mb).unwrap_or(i64::MAX);
        total.saturating_sub(used)
    }
}

/// Output of a command executed inside the guest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub exit_code: i32,
    #[serde(default)]
    pub error: Option<String>,
}

impl CommandOutput {
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0 && self.error.as_deref().map_or(true, str::is_empty)
    }
}

/// A desired-state category that is either declared or left out.
///
/// `Absent` means the caller has no opinion. Whether an absent block resets
/// the machine to its baseline is decided by the orchestrator, never by a
/// default value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Declared<T> {
    Absent,
    Present(T),
}

impl<T> Default for Declared<T> {
    fn default() -> Self {
        Declared::Absent
    }
}

impl<T> Declared<T> {
    pub fn as_option(&self) -> Option<&T> {
        match self {
            Declared::Absent => None,
            Declared::Present(v) => Some(v),
        }
    }

    pub fn is_present(&self) -> bool {
        matches!(self, Declared::Present(_))
    }
}

impl<T> From<Option<T>> for Declared<T> {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => Declared::Present(v),
            None => Declared::Absent,
        }
    }
}

impl<T: Serialize> Serialize for Declared<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.as_option().serialize(serializer)
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for Declared<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Option::<T>::deserialize(deserializer).map(Declared::from)
    }
}

/// CPU and memory targets. Values stay textual until the diff engine parses
/// them, so a malformed value is reported instead of silently defaulted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Specs {
    pub cpu_count: Option<String>,
    pub memory_mb: Option<String>,
}

/// Power state the caller wants the machine to settle in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerTarget {
    Running,
    Stopped,
    Paused,
    Suspended,
}

impl PowerTarget {
    pub fn state(&self) -> PowerState {
        match self {
            PowerTarget::Running => PowerState::Running,
            PowerTarget::Stopped => PowerState::Stopped,
            PowerTarget::Paused => PowerState::Paused,
            PowerTarget::Suspended => PowerState::Suspended,
        }
    }
}

/// Caller-declared target configuration for one machine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredState {
    #[serde(default)]
    pub power: Declared<PowerTarget>,
    #[serde(default)]
    pub specs: Declared<Specs>,
    #[serde(default)]
    pub toggles: Declared<Toggles>,
    #[serde(default)]
    pub shared_folders: Declared<Vec<SharedFolder>>,
    #[serde(default)]
    pub commands: Declared<Vec<String>>,
    /// Wait for a guest network address after the machine is running.
    #[serde(default)]
    pub wait_for_network: bool,
}
