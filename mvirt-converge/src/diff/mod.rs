//! Diff engine - decides per category which operations close the gap between
//! desired and observed state.
//!
//! Everything here is pure: no network calls, no retries.

pub mod shared_folders;
pub mod specs;
pub mod toggles;

pub use shared_folders::{diff_folders, FolderDiff};
pub use specs::{admit, diff_specs, Resource, ScalarChange};
pub use toggles::{creation_toggles, diff_toggles};

use crate::batch::OperationBatch;
use crate::error::Result;
use crate::model::{Declared, DesiredState, MachineSnapshot, SystemUsage};

/// Every operation needed to move `observed` to `desired`, as one batch.
///
/// Absent categories are left alone. Specs changes are admitted against
/// `usage` before they are added.
pub fn diff(
    desired: &DesiredState,
    observed: &MachineSnapshot,
    usage: &SystemUsage,
) -> Result<OperationBatch> {
    let mut batch = OperationBatch::new(observed.owner.clone());

    if let Declared::Present(specs) = &desired.specs {
        let changes = diff_specs(specs, &observed.hardware)?;
        admit(&changes, usage)?;
        batch.extend(changes.iter().map(ScalarChange::operation))?;
    }

    if let Declared::Present(toggles) = &desired.toggles {
        batch.extend(diff_toggles(toggles, &observed.settings))?;
    }

    if let Declared::Present(folders) = &desired.shared_folders {
        batch.extend(diff_folders(folders, &observed.shared_folders)?.operations())?;
    }

    Ok(batch)
}
