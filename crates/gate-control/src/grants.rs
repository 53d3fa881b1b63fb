//! Grant engine for database and table access.

use crate::ControlPlane;
use std::marker::PhantomData;
use tablegate_core::grant::{
    partition_access, plan_request, plan_review, plan_withdraw, AccessPartition, AccessRequest,
    DatabaseGrants, GrantPolicy, RequestPlan, TableGrants,
};
use tablegate_core::validation::{normalize_keyword, normalize_ops, validate_text};
use tablegate_core::{
    AppId, Capability, ControlError, Grant, GrantPatch, GrantStatus, OnlineStatus, Page,
    PageRequest, ResourceType, Result, UserId,
};
use tablegate_storage::AccessStore;
use tracing::info;

/// Grant operations for one resource type.
pub struct Grants<'a, S, P> {
    plane: &'a ControlPlane<S>,
    _policy: PhantomData<P>,
}

impl<S: AccessStore> ControlPlane<S> {
    pub fn grants<P: GrantPolicy>(&self) -> Grants<'_, S, P> {
        Grants {
            plane: self,
            _policy: PhantomData,
        }
    }

    pub fn database_grants(&self) -> Grants<'_, S, DatabaseGrants> {
        self.grants()
    }

    pub fn table_grants(&self) -> Grants<'_, S, TableGrants> {
        self.grants()
    }

    /// The caller's online applications, split by whether they ever
    /// requested access to database `db_id`. `keyword` narrows the
    /// applications by name or app id.
    pub fn app_can_access_database(
        &self,
        user: UserId,
        db_id: i64,
        keyword: Option<&str>,
    ) -> Result<AccessPartition> {
        self.load_database(db_id)?;
        let apps = self.store.managed_applications(
            user,
            Some(OnlineStatus::Online),
            normalize_keyword(keyword)?,
        )?;
        let grants = self.store.grants_for_resource(ResourceType::Database, db_id)?;
        Ok(partition_access(apps, &[], &grants))
    }

    /// The caller's online applications against table `table_id`: covered by
    /// a database grant, never requested, or requested.
    pub fn app_can_access_table(
        &self,
        user: UserId,
        table_id: i64,
        keyword: Option<&str>,
    ) -> Result<AccessPartition> {
        let table = self.load_table(table_id)?;
        let apps = self.store.managed_applications(
            user,
            Some(OnlineStatus::Online),
            normalize_keyword(keyword)?,
        )?;
        let db_grants = self
            .store
            .grants_for_resource(ResourceType::Database, table.database_id)?;
        let grants = self.store.grants_for_resource(ResourceType::Table, table_id)?;
        Ok(partition_access(apps, &db_grants, &grants))
    }
}

impl<'a, S: AccessStore, P: GrantPolicy> Grants<'a, S, P> {
    fn ensure_resource(&self, resource_id: i64) -> Result<()> {
        match P::RESOURCE {
            ResourceType::Database => self.plane.load_database(resource_id).map(|_| ()),
            ResourceType::Table => self.plane.load_table(resource_id).map(|_| ()),
        }
    }

    fn require_resource_manager(&self, user: UserId, resource_id: i64) -> Result<()> {
        match P::RESOURCE {
            ResourceType::Database => self
                .plane
                .require_database_manager(user, resource_id)
                .map(|_| ()),
            ResourceType::Table => self.plane.require_table_manager(user, resource_id).map(|_| ()),
        }
    }

    fn find(&self, app_id: AppId, resource_id: i64) -> Result<Option<Grant>> {
        self.plane.store.find_grant(P::RESOURCE, resource_id, app_id)
    }

    /// The grant of `app_id` on the resource, or `NotFound`.
    pub fn get(&self, app_id: AppId, resource_id: i64) -> Result<Grant> {
        self.find(app_id, resource_id)?.ok_or_else(|| {
            ControlError::NotFound(format!(
                "app {} has no grant on {} {}",
                app_id,
                P::RESOURCE,
                resource_id
            ))
        })
    }

    fn write(&self, grant: &Grant, patch: &GrantPatch) -> Result<Grant> {
        self.plane.store.update_grant(grant.id, patch)?;
        self.get(grant.app_id, grant.resource_id)
    }

    /// Request access for an application the caller manages.
    pub fn request(
        &self,
        user: UserId,
        app_id: AppId,
        resource_id: i64,
        capability: Capability,
        ops: &[String],
        reason: &str,
    ) -> Result<Grant> {
        self.plane.observe("grant_request", || {
            self.plane.require_app_manager(user, app_id)?;
            self.ensure_resource(resource_id)?;
            let ops = normalize_ops(ops)?;
            validate_text(reason, "reason")?;

            let _guard = self.plane.lock_grant(P::RESOURCE, resource_id, app_id);
            let existing = self.find(app_id, resource_id)?;
            let plan = plan_request::<P>(
                existing.as_ref(),
                AccessRequest {
                    resource_id,
                    app_id,
                    capability,
                    ops,
                    reason,
                    user,
                    now: self.plane.now(),
                },
            )?;
            match plan {
                RequestPlan::Insert(grant) => {
                    self.plane.store.insert_grant(&grant)?;
                }
                RequestPlan::Reopen { id, patch } => {
                    self.plane.store.update_grant(id, &patch)?;
                }
            }
            info!(
                resource = %P::RESOURCE,
                resource_id,
                app_id,
                user_id = user,
                capability = capability.as_stored(),
                "Access requested"
            );
            self.get(app_id, resource_id)
        })
    }

    /// Accept or reject a grant under review.
    pub fn approve(&self, reviewer: UserId, app_id: AppId, resource_id: i64, accept: bool) -> Result<Grant> {
        self.plane.observe("grant_approve", || {
            self.require_resource_manager(reviewer, resource_id)?;

            let _guard = self.plane.lock_grant(P::RESOURCE, resource_id, app_id);
            let grant = self.get(app_id, resource_id)?;
            let patch = plan_review(&grant, accept, reviewer, self.plane.now())?;
            let grant = self.write(&grant, &patch)?;
            info!(resource = %P::RESOURCE, resource_id, app_id, reviewer, accept, "Access reviewed");
            Ok(grant)
        })
    }

    /// Cancel a request still under review. Only its applicant may.
    pub fn withdraw(&self, user: UserId, app_id: AppId, resource_id: i64, reason: &str) -> Result<Grant> {
        self.plane.observe("grant_withdraw", || {
            validate_text(reason, "reason")?;

            let _guard = self.plane.lock_grant(P::RESOURCE, resource_id, app_id);
            let grant = self.get(app_id, resource_id)?;
            let patch = plan_withdraw(&grant, user, reason, self.plane.now())?;
            let grant = self.write(&grant, &patch)?;
            info!(resource = %P::RESOURCE, resource_id, app_id, user_id = user, "Access request withdrawn");
            Ok(grant)
        })
    }

    /// Overwrite capability and ops. Status is left as it is, so a
    /// cancelled or rejected row stays that way until re-requested.
    pub fn edit(
        &self,
        manager: UserId,
        app_id: AppId,
        resource_id: i64,
        capability: Capability,
        ops: &[String],
    ) -> Result<Grant> {
        self.plane.observe("grant_edit", || {
            self.require_resource_manager(manager, resource_id)?;
            P::validate_capability(&capability)?;
            let ops = normalize_ops(ops)?;
            P::validate_ops(&ops)?;

            let _guard = self.plane.lock_grant(P::RESOURCE, resource_id, app_id);
            let grant = self.get(app_id, resource_id)?;
            let patch = GrantPatch {
                capability: Some(capability),
                ops: Some(ops),
                updated_at: Some(self.plane.now()),
                ..Default::default()
            };
            let grant = self.write(&grant, &patch)?;
            info!(resource = %P::RESOURCE, resource_id, app_id, manager, "Grant edited");
            Ok(grant)
        })
    }

    /// Switch a grant on or off, bypassing review. Applies at any status; a
    /// manager may turn on a rejected or withdrawn request directly.
    pub fn set_enabled(
        &self,
        manager: UserId,
        app_id: AppId,
        resource_id: i64,
        status: OnlineStatus,
    ) -> Result<Grant> {
        self.plane.observe("grant_set_enabled", || {
            self.require_resource_manager(manager, resource_id)?;

            let _guard = self.plane.lock_grant(P::RESOURCE, resource_id, app_id);
            let grant = self.get(app_id, resource_id)?;
            let patch = GrantPatch {
                status: Some(match status {
                    OnlineStatus::Online => GrantStatus::Normal,
                    OnlineStatus::Offline => GrantStatus::Offline,
                }),
                updated_at: Some(self.plane.now()),
                ..Default::default()
            };
            let grant = self.write(&grant, &patch)?;
            info!(resource = %P::RESOURCE, resource_id, app_id, manager, status = %status, "Grant status set");
            Ok(grant)
        })
    }

    /// Grants on the resource. Resource managers see all of them; anyone else
    /// sees the grants of applications they manage.
    pub fn list(&self, user: UserId, resource_id: i64, page: PageRequest) -> Result<Page<Grant>> {
        self.ensure_resource(resource_id)?;

        match self.require_resource_manager(user, resource_id) {
            Ok(()) => self
                .plane
                .store
                .list_grants(P::RESOURCE, resource_id, None, page),
            Err(
                ControlError::NotManager(_)
                | ControlError::NotMember(_)
                | ControlError::MemberExpired(_),
            ) => {
                let apps: Vec<AppId> = self
                    .plane
                    .store
                    .managed_applications(user, None, None)?
                    .into_iter()
                    .map(|a| a.app_id)
                    .collect();
                self.plane
                    .store
                    .list_grants(P::RESOURCE, resource_id, Some(&apps), page)
            }
            Err(e) => Err(e),
        }
    }

    /// Every grant of `app_id` on this resource kind, for the app's
    /// managers. `keyword` narrows by resource name.
    pub fn list_for_app(
        &self,
        user: UserId,
        app_id: AppId,
        keyword: Option<&str>,
        page: PageRequest,
    ) -> Result<Page<Grant>> {
        self.plane.require_app_manager(user, app_id)?;
        let keyword = normalize_keyword(keyword)?;
        self.plane
            .store
            .list_app_grants(P::RESOURCE, app_id, keyword, page)
    }
}
