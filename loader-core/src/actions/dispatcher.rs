//! ``src/actions/dispatcher.rs``
//! ============================================================================
//! # Action Dispatcher
//!
//! Resolves the mapped actions for a target and forwards execution to the
//! host's [`ActionsHook`]. Execution failures come back as
//! `ActionHookFailed` for the UI to report; nothing is retried.

use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::actions::mapping::ActionMapping;
use crate::error::{LoaderError, LoaderResult};
use crate::host::{ActionDescriptor, ActionTarget, ActionsHook, UiArea};

#[derive(Clone)]
pub struct ActionDispatcher {
    mapping: Arc<ActionMapping>,
    hook: Arc<dyn ActionsHook>,
}

impl ActionDispatcher {
    #[must_use]
    pub fn new(mapping: Arc<ActionMapping>, hook: Arc<dyn ActionsHook>) -> Self {
        Self { mapping, hook }
    }

    #[must_use]
    pub fn mapping(&self) -> &ActionMapping {
        &self.mapping
    }

    /// Mapped actions only; never fails.
    #[must_use]
    pub fn resolve_actions(&self, target: &ActionTarget) -> Vec<ActionDescriptor> {
        self.mapping.resolve(target)
    }

    /// Concrete action instances from the hook for the mapped identifiers.
    #[instrument(skip(self, target), fields(target = %target.describe()))]
    pub fn list_actions(&self, target: &ActionTarget, ui_area: UiArea) -> LoaderResult<Vec<ActionDescriptor>> {
        let ids = self.mapping.action_ids(target);
        if ids.is_empty() {
            debug!(
                marker = "ACTIONS",
                operation_type = "list_actions",
                "No actions mapped for target"
            );
            return Ok(Vec::new());
        }

        self.hook
            .generate_actions(target, ids, ui_area)
            .map_err(|e| into_hook_failure("generate_actions", e))
    }

    /// Execute one action. Identifiers not mapped for the target are refused.
    #[instrument(skip(self, target, action), fields(target = %target.describe(), action = %action.name))]
    pub fn invoke(&self, target: &ActionTarget, action: &ActionDescriptor) -> LoaderResult<()> {
        self.ensure_mapped(target, action)?;

        info!(
            marker = "ACTIONS",
            operation_type = "execute_action",
            "Executing action"
        );

        self.hook
            .execute_action(target, action)
            .map_err(|e| into_hook_failure(&action.name, e).trace())
    }

    /// Execute a batch in order; the hook stops at the first failure.
    pub fn invoke_many(&self, batch: &[(ActionTarget, ActionDescriptor)]) -> LoaderResult<()> {
        for (target, action) in batch {
            self.ensure_mapped(target, action)?;
        }

        info!(
            marker = "ACTIONS",
            operation_type = "execute_multiple_actions",
            count = batch.len(),
            "Executing action batch"
        );

        self.hook
            .execute_multiple_actions(batch)
            .map_err(|e| into_hook_failure("execute_multiple_actions", e).trace())
    }

    fn ensure_mapped(&self, target: &ActionTarget, action: &ActionDescriptor) -> LoaderResult<()> {
        if self.mapping.action_ids(target).iter().any(|id| *id == action.name) {
            return Ok(());
        }

        warn!(
            marker = "ACTIONS",
            operation_type = "unmapped_action",
            action = %action.name,
            "Refusing action not mapped for target"
        );
        Err(LoaderError::action_hook_failed(
            &action.name,
            format!("not applicable to {}", target.describe()),
        ))
    }
}

fn into_hook_failure(action: &str, error: LoaderError) -> LoaderError {
    match error {
        LoaderError::ActionHookFailed { .. } => error,
        other => LoaderError::action_hook_failed(action, other.to_string()),
    }
}

impl std::fmt::Debug for ActionDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionDispatcher")
            .field("mapping", &self.mapping)
            .finish_non_exhaustive()
    }
}
