//! Membership engine for workspaces and products.
//!
//! [`Memberships`] binds the pure planners in `tablegate_core::membership` to
//! the store. Each operation takes the per-(scope, user) lock, evaluates every
//! guard, performs a single write, and returns the row as stored.

use crate::ControlPlane;
use serde::Serialize;
use std::marker::PhantomData;
use tablegate_core::membership::{
    display_role_status, effective_role, plan_apply, plan_approval, plan_invite, plan_removal,
    plan_role_change, plan_role_change_approval, require_active, require_manager, ApplyPlan,
    EffectiveRole, InvitePlan, ProductScope, ScopePolicy, WorkspaceScope,
};
use tablegate_core::validation::dedup_users;
use tablegate_core::{
    ControlError, ExpireType, MemberRole, MemberStatus, Membership, Page, PageRequest, Result,
    Scope, UserId,
};
use tablegate_storage::AccessStore;
use tracing::{info, warn};

const JOINED: &[MemberStatus] = &[MemberStatus::Joined];

/// One row of a member listing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemberView {
    pub user_id: UserId,
    pub role: EffectiveRole,
    pub status: MemberStatus,
    pub status_code: i8,
    pub join_time: i64,
    pub expire_type: ExpireType,
    pub expire_time: i64,
}

/// Membership operations for one scope type.
pub struct Memberships<'a, S, P> {
    plane: &'a ControlPlane<S>,
    _policy: PhantomData<P>,
}

impl<S: AccessStore> ControlPlane<S> {
    pub fn memberships<P: ScopePolicy>(&self) -> Memberships<'_, S, P> {
        Memberships {
            plane: self,
            _policy: PhantomData,
        }
    }

    pub fn workspace_members(&self) -> Memberships<'_, S, WorkspaceScope> {
        self.memberships()
    }

    pub fn product_members(&self) -> Memberships<'_, S, ProductScope> {
        self.memberships()
    }
}

impl<'a, S: AccessStore, P: ScopePolicy> Memberships<'a, S, P> {
    fn scope(&self, scope_id: i64) -> Result<Scope> {
        self.plane.load_scope(P::SCOPE, scope_id)
    }

    fn find(&self, scope_id: i64, user: UserId) -> Result<Option<Membership>> {
        self.plane.store.find_membership(P::SCOPE, scope_id, user)
    }

    fn reload(&self, scope_id: i64, user: UserId) -> Result<Membership> {
        self.find(scope_id, user)?.ok_or_else(|| {
            ControlError::Other(format!(
                "membership of user {} in {} {} vanished after write",
                user,
                P::SCOPE,
                scope_id
            ))
        })
    }

    fn role_of(&self, scope: &Scope, user: UserId) -> Result<EffectiveRole> {
        let membership = self.find(scope.id, user)?;
        Ok(effective_role::<P>(membership.as_ref(), scope, self.plane.now()))
    }

    /// Fails unless `user` manages the scope.
    fn guard_manager(&self, scope: &Scope, user: UserId) -> Result<()> {
        require_manager(self.role_of(scope, user)?, user, scope)
    }

    /// The user's role in the scope, computed at read time.
    pub fn effective_role(&self, user: UserId, scope_id: i64) -> Result<EffectiveRole> {
        let scope = self.scope(scope_id)?;
        self.role_of(&scope, user)
    }

    /// Fails unless `user` holds an active, unexpired role.
    pub fn require_member(&self, user: UserId, scope_id: i64) -> Result<EffectiveRole> {
        let scope = self.scope(scope_id)?;
        let role = self.role_of(&scope, user)?;
        require_active(role, user, &scope)?;
        Ok(role)
    }

    pub fn require_manager(&self, user: UserId, scope_id: i64) -> Result<()> {
        let scope = self.scope(scope_id)?;
        self.guard_manager(&scope, user)
    }

    /// Apply to join, or renew from inside the renewal window.
    pub fn apply(
        &self,
        user: UserId,
        scope_id: i64,
        role: Option<MemberRole>,
        expire_type: ExpireType,
    ) -> Result<Membership> {
        self.plane.observe("member_apply", || {
            let scope = self.scope(scope_id)?;
            let _guard = self.plane.lock_member(P::SCOPE, scope_id, user);
            let existing = self.find(scope_id, user)?;

            let plan = plan_apply::<P>(
                existing.as_ref(),
                &scope,
                user,
                role,
                expire_type,
                self.plane.now(),
                self.plane.config.renewal_window_secs(),
            )?;
            match plan {
                ApplyPlan::Insert(m) => {
                    self.plane.store.insert_membership(&m)?;
                    info!(scope = %P::SCOPE, scope_id, user_id = user, role = %m.role, "Membership applied");
                }
                ApplyPlan::Reapply(m) => {
                    self.plane.store.replace_membership(&m)?;
                    info!(scope = %P::SCOPE, scope_id, user_id = user, role = %m.role, "Membership re-applied");
                }
                ApplyPlan::Renew { id, patch } => {
                    self.plane.store.update_membership(id, &patch)?;
                    info!(scope = %P::SCOPE, scope_id, user_id = user, "Membership renewal requested");
                }
            }
            self.reload(scope_id, user)
        })
    }

    /// Accept or reject a pending application or renewal.
    pub fn approve(
        &self,
        approver: UserId,
        user: UserId,
        scope_id: i64,
        accept: bool,
    ) -> Result<Membership> {
        self.plane.observe("member_approve", || {
            let scope = self.scope(scope_id)?;
            self.guard_manager(&scope, approver)?;

            let _guard = self.plane.lock_member(P::SCOPE, scope_id, user);
            let m = self.find(scope_id, user)?.ok_or_else(|| {
                ControlError::NotUnderApproval(format!(
                    "user {} has not applied to {} {}",
                    user,
                    P::SCOPE,
                    scope_id
                ))
            })?;

            let patch = plan_approval(&m, accept, self.plane.clock.now())?;
            self.plane.store.update_membership(m.id, &patch)?;
            let renewal = m.status == MemberStatus::PendingRenewal;
            info!(
                scope = %P::SCOPE,
                scope_id,
                user_id = user,
                approver,
                accept,
                renewal,
                "Membership reviewed"
            );
            self.reload(scope_id, user)
        })
    }

    /// Ask to switch to `new_role`. Returns the row unchanged when the role
    /// already matches.
    pub fn apply_role_change(&self, user: UserId, scope_id: i64, new_role: MemberRole) -> Result<Membership> {
        self.plane.observe("member_role_change", || {
            let scope = self.scope(scope_id)?;
            let _guard = self.plane.lock_member(P::SCOPE, scope_id, user);
            let existing = self.find(scope_id, user)?;

            let plan = plan_role_change::<P>(existing.as_ref(), &scope, user, new_role, self.plane.now())?;
            match (plan, existing) {
                (Some(patch), Some(m)) => {
                    self.plane.store.update_membership(m.id, &patch)?;
                    info!(scope = %P::SCOPE, scope_id, user_id = user, role = %new_role, "Role change requested");
                }
                _ => {
                    info!(scope = %P::SCOPE, scope_id, user_id = user, "Role change is a no-op");
                }
            }
            self.reload(scope_id, user)
        })
    }

    pub fn approve_role_change(
        &self,
        approver: UserId,
        user: UserId,
        scope_id: i64,
        accept: bool,
    ) -> Result<Membership> {
        self.plane.observe("member_role_change_approve", || {
            let scope = self.scope(scope_id)?;
            self.guard_manager(&scope, approver)?;

            let _guard = self.plane.lock_member(P::SCOPE, scope_id, user);
            let m = self.find(scope_id, user)?.ok_or_else(|| {
                ControlError::NotUnderApproval(format!("user {} has no pending role change", user))
            })?;

            let patch = plan_role_change_approval(&m, accept)?;
            self.plane.store.update_membership(m.id, &patch)?;
            info!(scope = %P::SCOPE, scope_id, user_id = user, approver, accept, "Role change reviewed");
            self.reload(scope_id, user)
        })
    }

    /// Remove a member. The row is kept with status `quit`.
    pub fn remove(&self, approver: UserId, user: UserId, scope_id: i64, reason: &str) -> Result<Membership> {
        self.plane.observe("member_remove", || {
            let scope = self.scope(scope_id)?;
            self.guard_manager(&scope, approver)?;

            let _guard = self.plane.lock_member(P::SCOPE, scope_id, user);
            let existing = self.find(scope_id, user)?;
            let (id, patch) = plan_removal::<P>(existing.as_ref(), &scope, user, self.plane.now())?;
            self.plane.store.update_membership(id, &patch)?;

            if scope.is_manager(user) {
                warn!(scope = %P::SCOPE, scope_id, user_id = user, "Removed member is still listed as a manager");
            }
            info!(scope = %P::SCOPE, scope_id, user_id = user, approver, reason, "Member removed");
            self.reload(scope_id, user)
        })
    }

    /// Add a member directly, skipping the approval step.
    pub fn invite(
        &self,
        manager: UserId,
        user: UserId,
        scope_id: i64,
        role: Option<MemberRole>,
        expire_type: ExpireType,
    ) -> Result<Membership> {
        self.plane.observe("member_invite", || {
            let scope = self.scope(scope_id)?;
            self.guard_manager(&scope, manager)?;

            let _guard = self.plane.lock_member(P::SCOPE, scope_id, user);
            let existing = self.find(scope_id, user)?;
            let plan = plan_invite::<P>(
                existing.as_ref(),
                &scope,
                user,
                role,
                expire_type,
                self.plane.clock.now(),
                self.plane.config.renewal_window_secs(),
            )?;
            match plan {
                InvitePlan::Insert(m) => {
                    self.plane.store.insert_membership(&m)?;
                }
                InvitePlan::Revive(m) => {
                    self.plane.store.replace_membership(&m)?;
                }
                InvitePlan::Extend { id, patch } => {
                    self.plane.store.update_membership(id, &patch)?;
                }
            }
            info!(scope = %P::SCOPE, scope_id, user_id = user, manager, "Member invited");
            self.reload(scope_id, user)
        })
    }

    /// The (role, status) pair a listing shows for `user`.
    pub fn display(&self, user: UserId, scope_id: i64) -> Result<(EffectiveRole, MemberStatus)> {
        let scope = self.scope(scope_id)?;
        let membership = self.find(scope_id, user)?;
        Ok(display_role_status::<P>(membership.as_ref(), &scope, self.plane.now()))
    }

    /// Members visible to `viewer`: every row for managers, joined rows for
    /// other members.
    pub fn list(&self, viewer: UserId, scope_id: i64, page: PageRequest) -> Result<Page<MemberView>> {
        let scope = self.scope(scope_id)?;
        let role = self.role_of(&scope, viewer)?;
        require_active(role, viewer, &scope)?;

        let filter = if role.is_manager() { None } else { Some(JOINED) };
        let rows = self
            .plane
            .store
            .list_memberships(P::SCOPE, scope_id, filter, page)?;

        let now = self.plane.now();
        let items = rows
            .items
            .iter()
            .map(|m| {
                let (role, status) = display_role_status::<P>(Some(m), &scope, now);
                MemberView {
                    user_id: m.user_id,
                    role,
                    status,
                    status_code: status.code(P::SCOPE),
                    join_time: m.join_time,
                    expire_type: m.expire_type,
                    expire_time: m.expire_time,
                }
            })
            .collect();
        Ok(Page::new(items, rows.total, page))
    }

    /// Replace the scope's manager list. Every listed user must be an active
    /// member.
    pub fn maintain_managers(&self, manager: UserId, scope_id: i64, users: &[UserId]) -> Result<Scope> {
        self.plane.observe("member_maintain_managers", || {
            let scope = self.scope(scope_id)?;
            self.guard_manager(&scope, manager)?;

            let users = dedup_users(users);
            if users.is_empty() {
                return Err(ControlError::InvalidParam(format!(
                    "{} {} needs at least one manager",
                    P::SCOPE,
                    scope_id
                )));
            }
            for user in &users {
                let role = self.role_of(&scope, *user)?;
                require_active(role, *user, &scope)?;
            }

            self.plane
                .store
                .set_scope_managers(P::SCOPE, scope_id, &users)?;
            info!(scope = %P::SCOPE, scope_id, manager, managers = ?users, "Managers updated");
            self.scope(scope_id)
        })
    }
}
