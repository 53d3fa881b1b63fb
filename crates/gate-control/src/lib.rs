//! Tablegate Control
//!
//! The access-control and pipeline-ordering engines. A [`ControlPlane`] owns
//! the store handle, the clock, the configuration, and the current workspace,
//! and hands out typed engine views:
//!
//! ```rust,ignore
//! let plane = ControlPlane::new(store, config)?;
//! plane.product_members().apply(user, product_id, Some(MemberRole::Developer), ExpireType::OneYear)?;
//! plane.table_grants().approve(manager, app_id, table_id, true)?;
//! plane.pipeline().attach(manager, request)?;
//! ```
//!
//! Every operation evaluates its guards before the first write and returns the
//! stored row as it reads after the write.

use std::sync::Arc;
use tablegate_core::clock::{Clock, IdGenerator, SequenceIdGenerator, SystemClock};
use tablegate_core::{AppId, ChainKey, ControlError, ResourceType, Result, ScopeType, UserId};
use tablegate_storage::{AccessStore, KeyGuard, KeyedLocks};
use tracing::debug;

pub mod catalog;
pub mod config;
pub mod context;
pub mod grants;
pub mod indexing;
pub mod managers;
pub mod membership;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod pipeline;

pub use config::{ControlConfig, ControlConfigBuilder};
pub use context::WorkspaceContext;
pub use grants::Grants;
pub use indexing::{IndexEvent, IndexQueue, IndexSender, IndexStats};
pub use membership::{MemberView, Memberships};
pub use pipeline::{AttachRequest, Pipeline, TableChains, UpdateRequest};

/// Entry point to the engines.
pub struct ControlPlane<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    config: ControlConfig,
    workspace: Option<WorkspaceContext>,
    indexer: Option<IndexSender>,
    member_locks: KeyedLocks<(ScopeType, i64, UserId)>,
    grant_locks: KeyedLocks<(ResourceType, i64, AppId)>,
    chain_locks: KeyedLocks<ChainKey>,
}

impl<S: AccessStore> ControlPlane<S> {
    /// Create a control plane over `store`.
    ///
    /// Resolves `config.workspace_id`, if set, into the current workspace;
    /// fails with `NotFound` if that workspace does not exist.
    pub fn new(store: Arc<S>, config: ControlConfig) -> Result<Self> {
        config.validate()?;
        let workspace = config
            .workspace_id
            .map(|id| WorkspaceContext::resolve(store.as_ref(), id))
            .transpose()?;

        Ok(Self {
            store,
            clock: Arc::new(SystemClock),
            ids: Arc::new(SequenceIdGenerator::default()),
            config,
            workspace,
            indexer: None,
            member_locks: KeyedLocks::new(),
            grant_locks: KeyedLocks::new(),
            chain_locks: KeyedLocks::new(),
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    /// Send search keywords for created resources to `indexer`.
    pub fn with_indexer(mut self, indexer: IndexSender) -> Self {
        self.indexer = Some(indexer);
        self
    }

    pub fn with_workspace(mut self, workspace: WorkspaceContext) -> Self {
        self.workspace = Some(workspace);
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn config(&self) -> &ControlConfig {
        &self.config
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    /// The current workspace.
    pub fn workspace(&self) -> Result<&WorkspaceContext> {
        self.workspace.as_ref().ok_or_else(|| {
            ControlError::Config("no current workspace is configured".to_string())
        })
    }

    pub(crate) fn now(&self) -> i64 {
        self.clock.unix()
    }

    pub(crate) fn lock_member(
        &self,
        scope: ScopeType,
        scope_id: i64,
        user: UserId,
    ) -> KeyGuard<'_, (ScopeType, i64, UserId)> {
        self.member_locks.lock((scope, scope_id, user))
    }

    pub(crate) fn lock_grant(
        &self,
        resource: ResourceType,
        resource_id: i64,
        app: AppId,
    ) -> KeyGuard<'_, (ResourceType, i64, AppId)> {
        self.grant_locks.lock((resource, resource_id, app))
    }

    /// Lock one or two chains, always in key order.
    pub(crate) fn lock_chains(&self, a: ChainKey, b: ChainKey) -> Vec<KeyGuard<'_, ChainKey>> {
        let (first, second) = if a <= b { (a, b) } else { (b, a) };
        let mut guards = vec![self.chain_locks.lock(first)];
        if first != second {
            guards.push(self.chain_locks.lock(second));
        }
        guards
    }

    pub(crate) fn index(&self, event: IndexEvent) {
        if let Some(indexer) = &self.indexer {
            indexer.enqueue(event);
        }
    }

    /// Run one engine operation, recording its outcome.
    pub(crate) fn observe<T>(&self, operation: &'static str, f: impl FnOnce() -> Result<T>) -> Result<T> {
        #[cfg(feature = "metrics")]
        let start = std::time::Instant::now();

        let result = f();

        #[cfg(feature = "metrics")]
        metrics::record_operation(operation, &result, start.elapsed().as_secs_f64());

        if let Err(e) = &result {
            debug!(operation, code = e.code(), error = %e, "Operation failed");
        }
        result
    }
}

impl<S> std::fmt::Debug for ControlPlane<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlPlane")
            .field("config", &self.config)
            .field("workspace", &self.workspace)
            .field("indexer", &self.indexer.is_some())
            .finish_non_exhaustive()
    }
}
