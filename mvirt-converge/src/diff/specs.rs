//! CPU and memory diff with the capacity admission check.

use crate::batch::{groups, Operation};
use crate::error::{ConvergeError, Result};
use crate::model::{Hardware, Specs, SystemUsage, DEFAULT_CPU_COUNT, DEFAULT_MEMORY_MB};

/// Scalar resource managed by the specs category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    Cpu,
    Memory,
}

impl Resource {
    fn group(&self) -> &'static str {
        match self {
            Resource::Cpu => groups::CPU,
            Resource::Memory => groups::MEMORY,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Resource::Cpu => "cpu",
            Resource::Memory => "memory",
        }
    }
}

/// A scalar that has to move from `observed` to `requested`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScalarChange {
    pub resource: Resource,
    pub requested: i64,
    pub observed: i64,
}

impl ScalarChange {
    pub fn operation(&self) -> Operation {
        Operation::set(self.resource.group(), self.requested.to_string())
    }
}

fn parse_scalar(field: &str, value: Option<&str>, default: u64) -> Result<i64> {
    let Some(raw) = value else {
        return Ok(default as i64);
    };
    let parsed: u64 = raw.trim().parse().map_err(|_| {
        ConvergeError::Validation(format!("{}: '{}' is not a whole number", field, raw))
    })?;
    if parsed == 0 {
        return Err(ConvergeError::Validation(format!("{} must be positive", field)));
    }
    i64::try_from(parsed)
        .map_err(|_| ConvergeError::Validation(format!("{}: '{}' is out of range", field, raw)))
}

/// Compare desired specs (defaults applied to unset fields) with the observed
/// hardware. Yields one change per differing scalar.
pub fn diff_specs(desired: &Specs, observed: &Hardware) -> Result<Vec<ScalarChange>> {
    let cpu = parse_scalar(
        "cpu_count",
        desired.cpu_count.as_deref(),
        u64::from(DEFAULT_CPU_COUNT),
    )?;
    let memory = parse_scalar("memory_mb", desired.memory_mb.as_deref(), DEFAULT_MEMORY_MB)?;

    let mut changes = Vec::new();
    if cpu != i64::from(observed.cpu_count) {
        changes.push(ScalarChange {
            resource: Resource::Cpu,
            requested: cpu,
            observed: i64::from(observed.cpu_count),
        });
    }
    if memory != observed.memory_mb as i64 {
        changes.push(ScalarChange {
            resource: Resource::Memory,
            requested: memory,
            observed: observed.memory_mb as i64,
        });
    }
    Ok(changes)
}

/// Refuse any change the host cannot hold with headroom to spare.
///
/// Requesting exactly the remaining capacity is refused.
pub fn admit(changes: &[ScalarChange], usage: &SystemUsage) -> Result<()> {
    for change in changes {
        let available = match change.resource {
            Resource::Cpu => usage.available_cpu(),
            Resource::Memory => usage.available_memory_mb(),
        };
        if available <= change.requested {
            return Err(ConvergeError::Capacity {
                resource: change.resource.label(),
                requested: change.requested,
                available,
            });
        }
    }
    Ok(())
}
