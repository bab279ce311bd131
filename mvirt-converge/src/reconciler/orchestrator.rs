//! Lifecycle orchestrator - composes the diff engine and the convergence loops
//! into create and update passes over every desired-state category.

use std::sync::Arc;

use tracing::{error, info, warn};

use super::lifecycle::{
    ensure_network_ready, ensure_power, ensure_removed, ensure_running, ensure_stopped, Removal,
};
use super::Cancellation;
use crate::batch::{Operation, OperationBatch};
use crate::clients::MachineClient;
use crate::config::ConvergeConfig;
use crate::diff::{
    self, admit, creation_toggles, diff_folders, diff_specs, diff_toggles, ScalarChange,
};
use crate::error::{Category, CategoryError, ConvergeError, Result};
use crate::model::{
    CommandOutput, Declared, DesiredState, MachineSnapshot, PowerState, PowerTarget,
    SharedFolder, Specs,
};

/// What a reconcile pass changed.
#[derive(Debug, Clone)]
pub struct ReconcileReport {
    /// Snapshot observed at the end of the pass.
    pub snapshot: MachineSnapshot,
    /// Every operation submitted, with per-operation errors recorded.
    pub operations: Vec<Operation>,
    /// Output of every command executed.
    pub commands: Vec<CommandOutput>,
}

#[derive(Default)]
struct Changes {
    operations: Vec<Operation>,
    commands: Vec<CommandOutput>,
}

/// Entry point for reconciling machines against the control service.
pub struct Orchestrator {
    client: Arc<dyn MachineClient>,
    config: ConvergeConfig,
}

impl Orchestrator {
    pub fn new(client: Arc<dyn MachineClient>, config: ConvergeConfig) -> Self {
        Self { client, config }
    }

    pub fn config(&self) -> &ConvergeConfig {
        &self.config
    }

    fn client(&self) -> &dyn MachineClient {
        self.client.as_ref()
    }

    /// Reconcile `id` towards `desired`.
    ///
    /// Without `previous` this is a create pass: categories run in order and
    /// the first failure stops the pass. With `previous` only categories whose
    /// declaration changed are reconciled, and their failures are collected
    /// into [`ConvergeError::Categories`].
    pub async fn reconcile(
        &self,
        id: &str,
        desired: &DesiredState,
        previous: Option<&DesiredState>,
        cancel: &Cancellation,
    ) -> Result<ReconcileReport> {
        match previous {
            None => self.create(id, desired, cancel).await,
            Some(previous) => self.update(id, desired, previous, cancel).await,
        }
    }

    /// The batch [`Orchestrator::reconcile`] would submit for the declared
    /// categories, without applying it.
    pub async fn plan(
        &self,
        id: &str,
        desired: &DesiredState,
        cancel: &Cancellation,
    ) -> Result<OperationBatch> {
        let observed = self.observe(id, cancel).await?;
        let usage = if desired.specs.is_present() {
            cancel.guard(self.client().system_usage()).await??
        } else {
            Default::default()
        };
        diff::diff(desired, &observed, &usage)
    }

    pub async fn remove(&self, id: &str, cancel: &Cancellation) -> Result<Removal> {
        ensure_removed(self.client(), id, &self.config, cancel).await
    }

    pub async fn wait_for_network(
        &self,
        id: &str,
        cancel: &Cancellation,
    ) -> Result<MachineSnapshot> {
        ensure_network_ready(self.client(), id, &self.config, cancel).await
    }

    async fn observe(&self, id: &str, cancel: &Cancellation) -> Result<MachineSnapshot> {
        Ok(cancel.guard(self.client().observe(id)).await??)
    }

    async fn create(
        &self,
        id: &str,
        desired: &DesiredState,
        cancel: &Cancellation,
    ) -> Result<ReconcileReport> {
        info!(id = %id, "Reconciling new machine");
        let mut changes = Changes::default();
        let mut current = self.observe(id, cancel).await?;
        let was_running = current.state == PowerState::Running;
        let mut stopped = None;

        if let Declared::Present(specs) = &desired.specs {
            let result = self
                .apply_specs(id, specs, &current, &mut stopped, &mut changes, cancel)
                .await;
            if let Err(e) = result {
                if was_running && stopped.is_some() {
                    self.restore_power(id, &desired.power, cancel).await;
                }
                return Err(e);
            }
        }
        let stopped_for_specs = stopped.is_some();
        if let Some(snapshot) = stopped {
            current = snapshot;
        }

        if let Declared::Present(toggles) = &desired.toggles {
            let ops = creation_toggles(toggles, &current.settings);
            self.apply_individually(id, &current.owner, ops, &mut changes, cancel)
                .await?;
        }

        if let Declared::Present(folders) = &desired.shared_folders {
            self.apply_folders(id, folders, &current, &mut changes, cancel)
                .await?;
        }

        let power = resolve_power(&desired.power, was_running && stopped_for_specs);
        self.apply_power(id, power, desired.wait_for_network, cancel)
            .await?;

        if let Declared::Present(commands) = &desired.commands {
            self.run_commands(id, commands, &desired.power, &mut changes, cancel)
                .await?;
        }

        self.finish(id, changes, cancel).await
    }

    async fn update(
        &self,
        id: &str,
        desired: &DesiredState,
        previous: &DesiredState,
        cancel: &Cancellation,
    ) -> Result<ReconcileReport> {
        info!(id = %id, "Reconciling machine update");
        let mut changes = Changes::default();
        let mut errors: Vec<CategoryError> = Vec::new();
        let mut current = self.observe(id, cancel).await?;
        let was_running = current.state == PowerState::Running;
        let mut stopped = None;

        // An omitted block resets the category to its baseline.
        if desired.specs != previous.specs {
            let specs = desired.specs.as_option().cloned().unwrap_or_default();
            if let Err(e) = self
                .apply_specs(id, &specs, &current, &mut stopped, &mut changes, cancel)
                .await
            {
                collect(&mut errors, Category::Specs, e)?;
            }
        }
        // A failed resize may still have stopped the machine; power below
        // brings it back either way.
        let stopped_for_specs = stopped.is_some();
        if let Some(snapshot) = stopped {
            current = snapshot;
        }

        if desired.toggles != previous.toggles {
            let toggles = desired.toggles.as_option().copied().unwrap_or_default();
            let ops = diff_toggles(&toggles, &current.settings);
            if let Err(e) = self
                .apply_individually(id, &current.owner, ops, &mut changes, cancel)
                .await
            {
                collect(&mut errors, Category::Toggles, e)?;
            }
        }

        if desired.shared_folders != previous.shared_folders {
            let folders: &[SharedFolder] = desired
                .shared_folders
                .as_option()
                .map(Vec::as_slice)
                .unwrap_or_default();
            if let Err(e) = self
                .apply_folders(id, folders, &current, &mut changes, cancel)
                .await
            {
                collect(&mut errors, Category::SharedFolders, e)?;
            }
        }

        let network_changed = desired.wait_for_network && !previous.wait_for_network;
        if desired.power != previous.power || stopped_for_specs || network_changed {
            let power = resolve_power(&desired.power, was_running && stopped_for_specs);
            if let Err(e) = self
                .apply_power(id, power, desired.wait_for_network, cancel)
                .await
            {
                collect(&mut errors, Category::Power, e)?;
            }
        }

        // Commands are side effects, not state: they run on every pass.
        if let Declared::Present(commands) = &desired.commands {
            if let Err(e) = self
                .run_commands(id, commands, &desired.power, &mut changes, cancel)
                .await
            {
                collect(&mut errors, Category::Commands, e)?;
            }
        }

        if !errors.is_empty() {
            error!(id = %id, failed = errors.len(), "Update finished with failures");
            return Err(ConvergeError::Categories(errors));
        }
        self.finish(id, changes, cancel).await
    }

    async fn finish(
        &self,
        id: &str,
        changes: Changes,
        cancel: &Cancellation,
    ) -> Result<ReconcileReport> {
        let snapshot = self.observe(id, cancel).await?;
        info!(
            id = %id,
            state = %snapshot.state,
            operations = changes.operations.len(),
            commands = changes.commands.len(),
            "Reconcile complete"
        );
        Ok(ReconcileReport {
            snapshot,
            operations: changes.operations,
            commands: changes.commands,
        })
    }

    /// Resize CPU/memory.
    ///
    /// `stopped` is set as soon as the machine was stopped for the resize, so
    /// the caller sees it even when the batch itself fails.
    async fn apply_specs(
        &self,
        id: &str,
        specs: &Specs,
        current: &MachineSnapshot,
        stopped: &mut Option<MachineSnapshot>,
        changes: &mut Changes,
        cancel: &Cancellation,
    ) -> Result<()> {
        let scalars = diff_specs(specs, &current.hardware)?;
        if scalars.is_empty() {
            return Ok(());
        }

        let usage = cancel.guard(self.client().system_usage()).await??;
        admit(&scalars, &usage)?;

        info!(id = %id, changes = scalars.len(), "Stopping machine to apply specs");
        *stopped = Some(ensure_stopped(self.client(), id, &self.config, cancel).await?);

        let mut batch = OperationBatch::new(current.owner.clone());
        batch.extend(scalars.iter().map(ScalarChange::operation))?;
        self.submit(id, batch, changes, cancel).await
    }

    /// Bring a machine stopped by a failed resize back to its declared power
    /// state, or to running. Failures are logged; the resize error wins.
    async fn restore_power(
        &self,
        id: &str,
        declared: &Declared<PowerTarget>,
        cancel: &Cancellation,
    ) {
        let Some(target) = resolve_power(declared, true) else {
            return;
        };
        info!(id = %id, power = ?target, "Restoring power after failed resize");
        if let Err(e) = ensure_power(self.client(), id, target, &self.config, cancel).await {
            warn!(id = %id, error = %e, "Failed to restore power");
        }
    }

    /// Apply each operation as its own batch, stopping at the first failure.
    async fn apply_individually(
        &self,
        id: &str,
        owner: &str,
        ops: Vec<Operation>,
        changes: &mut Changes,
        cancel: &Cancellation,
    ) -> Result<()> {
        for op in ops {
            let mut batch = OperationBatch::new(owner);
            batch.push(op)?;
            self.submit(id, batch, changes, cancel).await?;
        }
        Ok(())
    }

    async fn apply_folders(
        &self,
        id: &str,
        folders: &[SharedFolder],
        current: &MachineSnapshot,
        changes: &mut Changes,
        cancel: &Cancellation,
    ) -> Result<()> {
        let folder_diff = diff_folders(folders, &current.shared_folders)?;
        if folder_diff.is_empty() {
            return Ok(());
        }
        info!(
            id = %id,
            add = folder_diff.to_add.len(),
            update = folder_diff.to_update.len(),
            remove = folder_diff.to_remove.len(),
            "Reconciling shared folders"
        );
        let mut batch = OperationBatch::new(current.owner.clone());
        batch.extend(folder_diff.operations())?;
        self.submit(id, batch, changes, cancel).await
    }

    async fn apply_power(
        &self,
        id: &str,
        power: Option<PowerTarget>,
        wait_for_network: bool,
        cancel: &Cancellation,
    ) -> Result<()> {
        let snapshot = match power {
            Some(target) => {
                info!(id = %id, power = ?target, "Reconciling power state");
                ensure_power(self.client(), id, target, &self.config, cancel).await?
            }
            None => self.observe(id, cancel).await?,
        };

        if wait_for_network && snapshot.state == PowerState::Running {
            let ready = ensure_network_ready(self.client(), id, &self.config, cancel).await?;
            let address = ready.network_address().unwrap_or_default();
            info!(id = %id, address = %address, "Network ready");
        }
        Ok(())
    }

    /// Run commands on a running machine, then return it to a declared
    /// non-running power state.
    async fn run_commands(
        &self,
        id: &str,
        commands: &[String],
        power: &Declared<PowerTarget>,
        changes: &mut Changes,
        cancel: &Cancellation,
    ) -> Result<()> {
        if commands.is_empty() {
            return Ok(());
        }
        let result = self.execute_commands(id, commands, changes, cancel).await;
        match power {
            Declared::Present(target) if *target != PowerTarget::Running => {
                info!(id = %id, power = ?target, "Returning machine to declared power state");
                let settled = ensure_power(self.client(), id, *target, &self.config, cancel).await;
                result.and(settled.map(drop))
            }
            _ => result,
        }
    }

    async fn execute_commands(
        &self,
        id: &str,
        commands: &[String],
        changes: &mut Changes,
        cancel: &Cancellation,
    ) -> Result<()> {
        ensure_running(self.client(), id, &self.config, cancel).await?;

        for command in commands {
            info!(id = %id, command = %command, "Running command");
            let output = cancel.guard(self.client().run_command(id, command)).await??;
            changes.commands.push(output.clone());
            if !output.succeeded() {
                warn!(
                    id = %id,
                    command = %command,
                    exit_code = output.exit_code,
                    "Command failed"
                );
                return Err(ConvergeError::CommandFailed {
                    command: command.clone(),
                    exit_code: output.exit_code,
                    stderr: output
                        .error
                        .filter(|e| !e.is_empty())
                        .unwrap_or(output.stderr),
                });
            }
        }
        Ok(())
    }

    /// Submit a batch and fail if the service flagged any operation.
    async fn submit(
        &self,
        id: &str,
        mut batch: OperationBatch,
        changes: &mut Changes,
        cancel: &Cancellation,
    ) -> Result<()> {
        if !batch.has_changes() {
            return Ok(());
        }
        info!(id = %id, operations = batch.len(), "Submitting batch");
        let receipt = cancel.guard(self.client().apply_batch(id, &batch)).await??;
        batch.record(&receipt);
        let result = batch.check();
        changes.operations.extend(batch.into_operations());
        result
    }
}

/// Declared target, or back to running when the pass had to stop a running
/// machine and the caller has no opinion.
fn resolve_power(
    declared: &Declared<PowerTarget>,
    restore_running: bool,
) -> Option<PowerTarget> {
    match declared {
        Declared::Present(target) => Some(*target),
        Declared::Absent if restore_running => Some(PowerTarget::Running),
        Declared::Absent => None,
    }
}

/// Record a category failure. Cancellation aborts the whole pass instead.
fn collect(
    errors: &mut Vec<CategoryError>,
    category: Category,
    error: ConvergeError,
) -> Result<()> {
    match error {
        ConvergeError::Cancelled | ConvergeError::DeadlineExceeded => Err(error),
        error => {
            warn!(category = %category, error = %error, "Category failed");
            errors.push(CategoryError { category, error });
            Ok(())
        }
    }
}
