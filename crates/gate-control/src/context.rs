//! The current workspace, resolved once at startup.

use serde::Serialize;
use tablegate_core::{ControlError, Result, ScopeType};
use tablegate_storage::ScopeStore;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkspaceContext {
    pub id: i64,
    pub name: String,
}

impl WorkspaceContext {
    /// Look up workspace `id`, failing with `NotFound` if it is absent.
    pub fn resolve<S: ScopeStore + ?Sized>(store: &S, id: i64) -> Result<Self> {
        let scope = store
            .get_scope(ScopeType::Workspace, id)?
            .ok_or_else(|| ControlError::NotFound(format!("workspace {} not found", id)))?;

        info!(workspace_id = scope.id, name = %scope.name, "Resolved current workspace");
        Ok(Self {
            id: scope.id,
            name: scope.name,
        })
    }
}
