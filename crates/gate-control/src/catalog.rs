//! Catalog bootstrap: workspaces, products, databases, tables, applications.
//!
//! Creating a scope also creates permanent joined memberships for its initial
//! managers, so they hold the Manager role from the start.

use crate::indexing::{database_keywords, product_keywords, table_keywords};
use crate::ControlPlane;
use tablegate_core::membership::{ProductScope, ScopePolicy, WorkspaceScope};
use tablegate_core::validation::{dedup_users, validate_name, validate_text};
use tablegate_core::{
    Application, ControlError, Database, ExpireType, MemberRole, MemberStatus, Membership,
    OnlineStatus, Result, Scope, ScopeType, TableInfo, UserId,
};
use tablegate_storage::AccessStore;
use tracing::info;

/// `creator` first, then the other managers without duplicates.
fn with_creator(creator: UserId, managers: &[UserId]) -> Vec<UserId> {
    let mut all = Vec::with_capacity(managers.len() + 1);
    all.push(creator);
    all.extend_from_slice(managers);
    dedup_users(&all)
}

impl<S: AccessStore> ControlPlane<S> {
    fn found_members(&self, scope: &Scope, role: MemberRole) -> Result<()> {
        let now = self.now();
        for user in &scope.managers {
            self.store.insert_membership(&Membership {
                id: 0,
                scope_type: scope.scope_type,
                scope_id: scope.id,
                user_id: *user,
                role,
                status: MemberStatus::Joined,
                join_time: now,
                expire_type: ExpireType::Permanent,
                expire_time: 0,
                out_time: 0,
                pending_role: None,
            })?;
        }
        Ok(())
    }

    fn new_scope(
        &self,
        scope_type: ScopeType,
        creator: UserId,
        name: &str,
        intro: &str,
        managers: &[UserId],
    ) -> Result<Scope> {
        validate_name(name, scope_type.as_str())?;
        validate_text(intro, "intro")?;

        let mut scope = Scope {
            id: 0,
            scope_type,
            name: name.to_string(),
            intro: intro.to_string(),
            creator,
            managers: with_creator(creator, managers),
            status: OnlineStatus::Online,
        };
        scope.id = self.store.insert_scope(&scope)?;
        Ok(scope)
    }

    /// Create a workspace. The creator and `managers` join as its managers.
    pub fn create_workspace(
        &self,
        creator: UserId,
        name: &str,
        intro: &str,
        managers: &[UserId],
    ) -> Result<Scope> {
        self.observe("create_workspace", || {
            let scope = self.new_scope(ScopeType::Workspace, creator, name, intro, managers)?;
            self.found_members(&scope, WorkspaceScope::ROLES[0])?;
            info!(workspace_id = scope.id, name = %scope.name, creator, "Workspace created");
            Ok(scope)
        })
    }

    /// Create a product in the current workspace.
    ///
    /// The creator must be an active workspace member and is always a
    /// manager; every manager joins as a permanent developer.
    pub fn create_product(
        &self,
        creator: UserId,
        name: &str,
        intro: &str,
        managers: &[UserId],
    ) -> Result<Scope> {
        self.observe("create_product", || {
            let workspace = self.workspace()?;
            self.workspace_members().require_member(creator, workspace.id)?;

            let scope = self.new_scope(ScopeType::Product, creator, name, intro, managers)?;
            self.found_members(&scope, ProductScope::ROLES[0])?;
            self.index(product_keywords(&scope));

            info!(product_id = scope.id, workspace_id = workspace.id, name = %scope.name, creator, "Product created");
            Ok(scope)
        })
    }

    /// Create a database under a product the caller manages.
    ///
    /// Listed database managers must be active members of the product.
    pub fn create_database(
        &self,
        user: UserId,
        product_id: i64,
        name: &str,
        managers: &[UserId],
    ) -> Result<Database> {
        self.observe("create_database", || {
            let members = self.product_members();
            members.require_manager(user, product_id)?;
            validate_name(name, "database")?;

            let managers = with_creator(user, managers);
            for manager in &managers {
                members.require_member(*manager, product_id)?;
            }

            let mut database = Database {
                id: 0,
                name: name.to_string(),
                product_id,
                managers,
                status: OnlineStatus::Online,
            };
            database.id = self.store.insert_database(&database)?;
            self.index(database_keywords(&database));

            info!(db_id = database.id, product_id, name = %database.name, user_id = user, "Database created");
            Ok(database)
        })
    }

    /// Create a table under a database the caller manages.
    pub fn create_table(&self, user: UserId, db_id: i64, name: &str) -> Result<TableInfo> {
        self.observe("create_table", || {
            self.require_database_manager(user, db_id)?;
            validate_name(name, "table")?;

            let mut table = TableInfo {
                id: 0,
                name: name.to_string(),
                database_id: db_id,
                status: OnlineStatus::Online,
            };
            table.id = self.store.insert_table(&table)?;
            self.index(table_keywords(&table));

            info!(table_id = table.id, db_id, name = %table.name, user_id = user, "Table created");
            Ok(table)
        })
    }

    /// Register an application under a fresh id. The creator must be an
    /// active member of the current workspace.
    pub fn create_application(
        &self,
        creator: UserId,
        name: &str,
        intro: &str,
        managers: &[UserId],
    ) -> Result<Application> {
        self.observe("create_application", || {
            let workspace = self.workspace()?;
            self.workspace_members().require_member(creator, workspace.id)?;
            validate_name(name, "application")?;
            validate_text(intro, "intro")?;

            let app = Application {
                app_id: self.ids.next_app_id(),
                name: name.to_string(),
                intro: intro.to_string(),
                creator,
                managers: with_creator(creator, managers),
                status: OnlineStatus::Online,
            };
            self.store.insert_application(&app)?;

            info!(app_id = app.app_id, name = %app.name, creator, "Application created");
            Ok(app)
        })
    }

    /// Take an application on or offline. Manager only.
    pub fn set_application_status(&self, user: UserId, app_id: u64, status: OnlineStatus) -> Result<Application> {
        self.observe("set_application_status", || {
            let app = self.require_app_manager(user, app_id)?;
            if app.status == status {
                return Ok(app);
            }
            self.store.set_application_status(app_id, status)?;
            info!(app_id, status = %status, user_id = user, "Application status changed");
            self.store
                .get_application(app_id)?
                .ok_or_else(|| ControlError::NotFound(format!("application {} not found", app_id)))
        })
    }
}
