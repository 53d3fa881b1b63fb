//! Resource manager derivation.
//!
//! A database is managed by the managers of its product, and by users on the
//! database's own manager list who still hold an active product role. Tables
//! have no manager list of their own and defer to their database.

use crate::ControlPlane;
use tablegate_core::membership::{effective_role, require_active, EffectiveRole, ProductScope};
use tablegate_core::{
    AppId, Application, ControlError, Database, Result, Scope, ScopeType, TableInfo, UserId,
};
use tablegate_storage::AccessStore;

impl<S: AccessStore> ControlPlane<S> {
    pub(crate) fn load_scope(&self, scope_type: ScopeType, id: i64) -> Result<Scope> {
        self.store
            .get_scope(scope_type, id)?
            .ok_or_else(|| ControlError::NotFound(format!("{} {} not found", scope_type, id)))
    }

    pub(crate) fn load_database(&self, id: i64) -> Result<Database> {
        self.store
            .get_database(id)?
            .ok_or_else(|| ControlError::NotFound(format!("database {} not found", id)))
    }

    pub(crate) fn load_table(&self, id: i64) -> Result<TableInfo> {
        self.store
            .get_table(id)?
            .ok_or_else(|| ControlError::NotFound(format!("table {} not found", id)))
    }

    /// The user's effective role in the product owning `database`.
    fn product_role(&self, user: UserId, database: &Database) -> Result<(EffectiveRole, Scope)> {
        let product = self.load_scope(ScopeType::Product, database.product_id)?;
        let membership = self
            .store
            .find_membership(ScopeType::Product, product.id, user)?;
        let role = effective_role::<ProductScope>(membership.as_ref(), &product, self.now());
        Ok((role, product))
    }

    /// Check that `user` manages database `db_id`.
    pub fn require_database_manager(&self, user: UserId, db_id: i64) -> Result<Database> {
        let database = self.load_database(db_id)?;
        let (role, product) = self.product_role(user, &database)?;
        require_active(role, user, &product)?;

        if role.is_manager() || database.is_manager(user) {
            Ok(database)
        } else {
            Err(ControlError::NotManager(format!(
                "user {} does not manage database {}",
                user, db_id
            )))
        }
    }

    /// Check that `user` manages table `table_id` through its database.
    pub fn require_table_manager(&self, user: UserId, table_id: i64) -> Result<(TableInfo, Database)> {
        let table = self.load_table(table_id)?;
        let database = self.require_database_manager(user, table.database_id)?;
        Ok((table, database))
    }

    /// Check that `user` is on the manager list of application `app_id`.
    pub fn require_app_manager(&self, user: UserId, app_id: AppId) -> Result<Application> {
        let app = self
            .store
            .get_application(app_id)?
            .ok_or_else(|| ControlError::NotFound(format!("application {} not found", app_id)))?;
        if !app.is_manager(user) {
            return Err(ControlError::NotManager(format!(
                "user {} does not manage application {}",
                user, app_id
            )));
        }
        Ok(app)
    }
}
