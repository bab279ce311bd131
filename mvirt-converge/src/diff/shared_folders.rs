//! Three-way diff of shared folders keyed by name.
//!
//! Entries are matched by name only. A renamed folder shows up as a delete of
//! the old name plus an add of the new one.

use std::collections::{HashMap, HashSet};

use crate::batch::{groups, verbs, Operation};
use crate::error::{ConvergeError, Result};
use crate::model::SharedFolder;

/// Partition of the desired/observed folder sets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FolderDiff {
    pub to_add: Vec<SharedFolder>,
    pub to_update: Vec<SharedFolder>,
    pub to_remove: Vec<String>,
}

impl FolderDiff {
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_update.is_empty() && self.to_remove.is_empty()
    }

    /// Operations in submission order: deletes, then updates, then adds.
    pub fn operations(&self) -> Vec<Operation> {
        let deletes = self.to_remove.iter().map(|name| Operation {
            group: groups::SHARED_FOLDER.to_string(),
            operation: verbs::DELETE.to_string(),
            value: Some(name.clone()),
            ..Default::default()
        });
        let updates = self.to_update.iter().map(|folder| {
            folder_operation(verbs::UPDATE, folder)
                .option("readonly", folder.readonly.to_string())
                .option("disabled", folder.disabled.to_string())
        });
        let adds = self.to_add.iter().map(|folder| {
            let mut op = folder_operation(verbs::ADD, folder);
            if folder.readonly {
                op = op.flag("readonly");
            }
            if folder.disabled {
                op = op.flag("disabled");
            }
            op
        });
        deletes.chain(updates).chain(adds).collect()
    }
}

fn folder_operation(verb: &str, folder: &SharedFolder) -> Operation {
    Operation {
        group: groups::SHARED_FOLDER.to_string(),
        operation: verb.to_string(),
        value: Some(folder.name.clone()),
        ..Default::default()
    }
    .option("path", folder.path.clone())
    .option("description", folder.description.clone())
}

/// Diff desired folders against observed ones.
///
/// An empty `desired` tears down every observed folder. Duplicate names in
/// `desired` are rejected.
pub fn diff_folders(desired: &[SharedFolder], observed: &[SharedFolder]) -> Result<FolderDiff> {
    let mut seen = HashSet::new();
    for folder in desired {
        if folder.name.trim().is_empty() {
            return Err(ConvergeError::Validation(
                "shared folder name must not be empty".to_string(),
            ));
        }
        if !seen.insert(folder.name.as_str()) {
            return Err(ConvergeError::Validation(format!(
                "shared folder '{}' declared twice",
                folder.name
            )));
        }
    }

    let observed_by_name: HashMap<&str, &SharedFolder> =
        observed.iter().map(|f| (f.name.as_str(), f)).collect();

    let mut diff = FolderDiff::default();
    for folder in desired {
        match observed_by_name.get(folder.name.as_str()) {
            None => diff.to_add.push(folder.clone()),
            Some(current) if *current != folder => diff.to_update.push(folder.clone()),
            Some(_) => {}
        }
    }

    let mut removed = HashSet::new();
    for folder in observed {
        if !seen.contains(folder.name.as_str()) && removed.insert(folder.name.as_str()) {
            diff.to_remove.push(folder.name.clone());
        }
    }

    Ok(diff)
}
