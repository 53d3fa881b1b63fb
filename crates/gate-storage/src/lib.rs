//! Tablegate Storage
//!
//! Persistence gateway for the control plane. The engines only talk to the
//! traits in this crate; [`SqliteStore`] is the shipped implementation.
//!
//! No trait method spans more than one logical write, and no method opens a
//! transaction on behalf of the caller. Multi-row operations such as chain
//! splices are sequences of individual writes; use [`KeyedLocks`] to keep them
//! from interleaving within one process.

use tablegate_core::{
    AppId, Application, ChainKey, ChainNode, Database, Extension, ExtensionKind, Grant,
    GrantPatch, MemberStatus, Membership, MembershipPatch, NodeId, NodePatch, OnlineStatus, Page,
    PageRequest, ResourceType, Result, Scope, ScopeType, SearchKeyword, SearchKind, TableInfo,
    UserId,
};

mod locks;
mod sqlite;

pub use locks::{KeyGuard, KeyedLocks};
pub use sqlite::SqliteStore;

/// Workspaces, products, and the catalog resources under them.
pub trait ScopeStore {
    fn get_scope(&self, scope_type: ScopeType, id: i64) -> Result<Option<Scope>>;
    /// Insert a scope; `scope.id` is ignored and the assigned id returned.
    fn insert_scope(&self, scope: &Scope) -> Result<i64>;
    fn set_scope_managers(&self, scope_type: ScopeType, id: i64, managers: &[UserId]) -> Result<()>;

    fn get_database(&self, id: i64) -> Result<Option<Database>>;
    fn insert_database(&self, database: &Database) -> Result<i64>;

    fn get_table(&self, id: i64) -> Result<Option<TableInfo>>;
    fn insert_table(&self, table: &TableInfo) -> Result<i64>;

    fn get_application(&self, app_id: AppId) -> Result<Option<Application>>;
    /// Insert an application under its pre-assigned `app_id`.
    fn insert_application(&self, app: &Application) -> Result<()>;
    fn set_application_status(&self, app_id: AppId, status: OnlineStatus) -> Result<()>;
    /// Applications that list `user` as a manager, optionally by status.
    /// `keyword` matches a substring of the name or of the app id.
    fn managed_applications(
        &self,
        user: UserId,
        status: Option<OnlineStatus>,
        keyword: Option<&str>,
    ) -> Result<Vec<Application>>;
}

/// One membership row per (scope, user).
pub trait MembershipStore {
    fn find_membership(
        &self,
        scope_type: ScopeType,
        scope_id: i64,
        user: UserId,
    ) -> Result<Option<Membership>>;
    fn insert_membership(&self, membership: &Membership) -> Result<i64>;
    /// Overwrite the row with `membership.id`.
    fn replace_membership(&self, membership: &Membership) -> Result<()>;
    fn update_membership(&self, id: i64, patch: &MembershipPatch) -> Result<()>;
    /// Rows of one scope ordered by id, optionally limited to `statuses`.
    fn list_memberships(
        &self,
        scope_type: ScopeType,
        scope_id: i64,
        statuses: Option<&[MemberStatus]>,
        page: PageRequest,
    ) -> Result<Page<Membership>>;
}

/// One grant row per (resource, application).
pub trait GrantStore {
    fn find_grant(
        &self,
        resource_type: ResourceType,
        resource_id: i64,
        app_id: AppId,
    ) -> Result<Option<Grant>>;
    fn grants_for_resource(&self, resource_type: ResourceType, resource_id: i64) -> Result<Vec<Grant>>;
    fn insert_grant(&self, grant: &Grant) -> Result<i64>;
    fn update_grant(&self, id: i64, patch: &GrantPatch) -> Result<()>;
    /// Grants on one resource ordered by id. `apps` limits the result to
    /// those applications.
    fn list_grants(
        &self,
        resource_type: ResourceType,
        resource_id: i64,
        apps: Option<&[AppId]>,
        page: PageRequest,
    ) -> Result<Page<Grant>>;
    /// Grants held by one application across every resource of
    /// `resource_type`, ordered by id. `keyword` matches a substring of the
    /// resource name.
    fn list_app_grants(
        &self,
        resource_type: ResourceType,
        app_id: AppId,
        keyword: Option<&str>,
        page: PageRequest,
    ) -> Result<Page<Grant>>;
}

/// The extension registry and the per-table chain rows.
pub trait ChainStore {
    fn get_extension(&self, kind: ExtensionKind, id: i64) -> Result<Option<Extension>>;
    fn insert_extension(&self, extension: &Extension) -> Result<i64>;

    fn get_node(&self, id: NodeId) -> Result<Option<ChainNode>>;
    fn chain_nodes(&self, key: &ChainKey) -> Result<Vec<ChainNode>>;
    fn insert_node(&self, node: &ChainNode, now: i64) -> Result<NodeId>;
    fn set_node_front(&self, id: NodeId, front: NodeId, now: i64) -> Result<()>;
    fn update_node(&self, id: NodeId, patch: &NodePatch, now: i64) -> Result<()>;
    fn delete_node(&self, id: NodeId) -> Result<()>;
}

/// The denormalized keyword index.
pub trait SearchIndexStore {
    /// Insert or replace rows keyed by (kind, subject_id, field, key).
    fn upsert_keywords(&self, rows: &[SearchKeyword]) -> Result<()>;
    fn keywords_for(&self, kind: SearchKind, subject_id: i64) -> Result<Vec<SearchKeyword>>;
}

/// Everything the engines need from persistence.
pub trait AccessStore:
    ScopeStore + MembershipStore + GrantStore + ChainStore + SearchIndexStore + Send + Sync + 'static
{
}

impl<T> AccessStore for T where
    T: ScopeStore + MembershipStore + GrantStore + ChainStore + SearchIndexStore + Send + Sync + 'static
{
}
