//! Membership state machine.
//!
//! Workspaces and products share one lifecycle, parameterized by a
//! [`ScopePolicy`]. Every `plan_*` function is pure: it inspects the current
//! row and returns the single write the engine should perform, or the error
//! to report without writing anything.

use crate::expiry::{expire_time, in_renewal_window, is_expired};
use crate::model::{
    ExpireType, MemberRole, MemberStatus, Membership, MembershipPatch, Scope, ScopeType, UserId,
};
use crate::{ControlError, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Per-scope membership rules.
pub trait ScopePolicy: Send + Sync + 'static {
    const SCOPE: ScopeType;
    /// Roles a member may hold
    const ROLES: &'static [MemberRole];
    /// Role used when an application does not name one
    const DEFAULT_ROLE: Option<MemberRole>;
    /// Statuses that count as holding a role
    const ACTIVE: &'static [MemberStatus];
    const SUPPORTS_ROLE_CHANGE: bool;

    fn is_active(status: MemberStatus) -> bool {
        Self::ACTIVE.contains(&status)
    }

    fn resolve_role(requested: Option<MemberRole>) -> Result<MemberRole> {
        match requested.or(Self::DEFAULT_ROLE) {
            Some(role) if Self::ROLES.contains(&role) => Ok(role),
            Some(role) => Err(ControlError::InvalidParam(format!(
                "role {} is not valid for a {}",
                role,
                Self::SCOPE
            ))),
            None => Err(ControlError::InvalidParam(format!(
                "a role is required to join a {}",
                Self::SCOPE
            ))),
        }
    }
}

/// Workspace membership: a single role, no role changes.
#[derive(Debug, Clone, Copy)]
pub struct WorkspaceScope;

impl ScopePolicy for WorkspaceScope {
    const SCOPE: ScopeType = ScopeType::Workspace;
    const ROLES: &'static [MemberRole] = &[MemberRole::Member];
    const DEFAULT_ROLE: Option<MemberRole> = Some(MemberRole::Member);
    const ACTIVE: &'static [MemberStatus] = &[MemberStatus::Joined, MemberStatus::PendingRenewal];
    const SUPPORTS_ROLE_CHANGE: bool = false;
}

/// Product membership: developer or operator, with role-change requests.
#[derive(Debug, Clone, Copy)]
pub struct ProductScope;

impl ScopePolicy for ProductScope {
    const SCOPE: ScopeType = ScopeType::Product;
    const ROLES: &'static [MemberRole] = &[MemberRole::Developer, MemberRole::Operator];
    const DEFAULT_ROLE: Option<MemberRole> = None;
    const ACTIVE: &'static [MemberStatus] = &[
        MemberStatus::Joined,
        MemberStatus::PendingRenewal,
        MemberStatus::PendingRoleChange,
    ];
    const SUPPORTS_ROLE_CHANGE: bool = true;
}

/// Role computed at read time from a membership row and its scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EffectiveRole {
    NotJoined,
    Expired,
    Manager,
    Role(MemberRole),
}

impl EffectiveRole {
    pub fn is_manager(&self) -> bool {
        matches!(self, EffectiveRole::Manager)
    }

    /// True for a manager or a member holding a stored role.
    pub fn is_active(&self) -> bool {
        matches!(self, EffectiveRole::Manager | EffectiveRole::Role(_))
    }
}

impl std::fmt::Display for EffectiveRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EffectiveRole::NotJoined => f.write_str("not_joined"),
            EffectiveRole::Expired => f.write_str("expired"),
            EffectiveRole::Manager => f.write_str("manager"),
            EffectiveRole::Role(role) => write!(f, "{}", role),
        }
    }
}

pub fn effective_role<P: ScopePolicy>(
    membership: Option<&Membership>,
    scope: &Scope,
    now: i64,
) -> EffectiveRole {
    let Some(m) = membership else {
        return EffectiveRole::NotJoined;
    };
    if !P::is_active(m.status) {
        return EffectiveRole::NotJoined;
    }
    if is_expired(m.expire_time, now) {
        return EffectiveRole::Expired;
    }
    if scope.is_manager(m.user_id) {
        return EffectiveRole::Manager;
    }
    EffectiveRole::Role(m.role)
}

/// Fails unless `role` is an active, unexpired role.
pub fn require_active(role: EffectiveRole, user: UserId, scope: &Scope) -> Result<()> {
    match role {
        EffectiveRole::NotJoined => Err(ControlError::NotMember(format!(
            "user {} is not a member of {} {}",
            user, scope.scope_type, scope.id
        ))),
        EffectiveRole::Expired => Err(ControlError::MemberExpired(format!(
            "membership of user {} in {} {} has expired",
            user, scope.scope_type, scope.id
        ))),
        EffectiveRole::Manager | EffectiveRole::Role(_) => Ok(()),
    }
}

/// Fails unless `role` is Manager. Non-members get `NotMember` or
/// `MemberExpired` rather than `NotManager`.
pub fn require_manager(role: EffectiveRole, user: UserId, scope: &Scope) -> Result<()> {
    require_active(role, user, scope)?;
    if role.is_manager() {
        Ok(())
    } else {
        Err(ControlError::NotManager(format!(
            "user {} does not manage {} {}",
            user, scope.scope_type, scope.id
        )))
    }
}

/// The (role, status) pair shown in member listings.
///
/// Rows that are not joined or have expired still show the stored role, with
/// a listed manager shown as [`EffectiveRole::Manager`].
pub fn display_role_status<P: ScopePolicy>(
    membership: Option<&Membership>,
    scope: &Scope,
    now: i64,
) -> (EffectiveRole, MemberStatus) {
    let Some(m) = membership else {
        return (EffectiveRole::NotJoined, MemberStatus::NotApplied);
    };
    let stored = if scope.is_manager(m.user_id) {
        EffectiveRole::Manager
    } else {
        EffectiveRole::Role(m.role)
    };

    match effective_role::<P>(Some(m), scope, now) {
        EffectiveRole::NotJoined => match m.status {
            MemberStatus::NotApplied | MemberStatus::Quit => {
                (EffectiveRole::NotJoined, MemberStatus::NotApplied)
            }
            status => (stored, status),
        },
        EffectiveRole::Expired => {
            let status = if m.status == MemberStatus::PendingRenewal {
                MemberStatus::PendingRenewal
            } else {
                MemberStatus::Expired
            };
            (stored, status)
        }
        role => (role, m.status),
    }
}

/// Write produced by [`plan_apply`].
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyPlan {
    /// First application: insert a new row
    Insert(Membership),
    /// Re-application from a not-joined row: replace it in place
    Reapply(Membership),
    /// Renewal request from inside the renewal window
    Renew { id: i64, patch: MembershipPatch },
}

pub fn plan_apply<P: ScopePolicy>(
    existing: Option<&Membership>,
    scope: &Scope,
    user: UserId,
    role: Option<MemberRole>,
    expire_type: ExpireType,
    now: i64,
    renewal_window_secs: i64,
) -> Result<ApplyPlan> {
    let Some(m) = existing else {
        return Ok(ApplyPlan::Insert(Membership {
            id: 0,
            scope_type: P::SCOPE,
            scope_id: scope.id,
            user_id: user,
            role: P::resolve_role(role)?,
            status: MemberStatus::PendingApproval,
            join_time: now,
            expire_type,
            expire_time: 0,
            out_time: 0,
            pending_role: None,
        }));
    };

    let under_approval = || {
        ControlError::UnderApproval(format!(
            "application of user {} to {} {} is already under approval",
            user,
            P::SCOPE,
            scope.id
        ))
    };

    if effective_role::<P>(Some(m), scope, now) == EffectiveRole::NotJoined {
        if m.status.is_pending_approval() {
            return Err(under_approval());
        }
        return Ok(ApplyPlan::Reapply(Membership {
            role: P::resolve_role(role)?,
            status: MemberStatus::PendingApproval,
            join_time: now,
            expire_type,
            expire_time: 0,
            out_time: 0,
            pending_role: None,
            ..m.clone()
        }));
    }

    // Active or expired: only a renewal is possible, and only near expiry.
    if !in_renewal_window(m.expire_time, now, renewal_window_secs) {
        return Err(ControlError::AlreadyMember(format!(
            "user {} is already a member of {} {}",
            user, P::SCOPE, scope.id
        )));
    }
    if m.status.is_pending_approval() {
        return Err(under_approval());
    }

    if let Some(requested) = role {
        if requested != m.role {
            return Err(ControlError::InvalidParam(format!(
                "renewal cannot change role from {} to {}",
                m.role, requested
            )));
        }
    }

    Ok(ApplyPlan::Renew {
        id: m.id,
        patch: MembershipPatch {
            status: Some(MemberStatus::PendingRenewal),
            expire_type: Some(expire_type),
            out_time: Some(0),
            pending_role: Some(None),
            ..Default::default()
        },
    })
}

/// Accept or reject a pending application or renewal.
pub fn plan_approval(m: &Membership, accept: bool, now: DateTime<Utc>) -> Result<MembershipPatch> {
    if !m.status.is_pending_approval() {
        return Err(ControlError::NotUnderApproval(format!(
            "membership of user {} in {} {} is {}",
            m.user_id, m.scope_type, m.scope_id, m.status
        )));
    }

    if !accept {
        return Ok(MembershipPatch {
            status: Some(MemberStatus::Rejected),
            ..Default::default()
        });
    }

    let first_time = m.status == MemberStatus::PendingApproval;
    Ok(MembershipPatch {
        status: Some(MemberStatus::Joined),
        expire_time: Some(expire_time(m.expire_time, m.expire_type, now)),
        join_time: first_time.then(|| now.timestamp()),
        ..Default::default()
    })
}

/// Request a role change. Returns `None` when the role is unchanged.
pub fn plan_role_change<P: ScopePolicy>(
    existing: Option<&Membership>,
    scope: &Scope,
    user: UserId,
    new_role: MemberRole,
    now: i64,
) -> Result<Option<MembershipPatch>> {
    if !P::SUPPORTS_ROLE_CHANGE {
        return Err(ControlError::InvalidParam(format!(
            "{} memberships have no roles to change",
            P::SCOPE
        )));
    }
    let new_role = P::resolve_role(Some(new_role))?;

    require_active(effective_role::<P>(existing, scope, now), user, scope)?;
    let Some(m) = existing else {
        return Err(ControlError::NotMember(format!("user {} has no membership", user)));
    };

    match m.status {
        MemberStatus::Joined => {}
        MemberStatus::PendingRenewal | MemberStatus::PendingRoleChange => {
            return Err(ControlError::UnderApproval(format!(
                "membership of user {} is {}",
                user, m.status
            )))
        }
        status => {
            return Err(ControlError::NotMember(format!(
                "membership of user {} is {}",
                user, status
            )))
        }
    }

    if new_role == m.role {
        return Ok(None);
    }

    Ok(Some(MembershipPatch {
        status: Some(MemberStatus::PendingRoleChange),
        pending_role: Some(Some(new_role)),
        ..Default::default()
    }))
}

pub fn plan_role_change_approval(m: &Membership, accept: bool) -> Result<MembershipPatch> {
    if m.status != MemberStatus::PendingRoleChange {
        return Err(ControlError::NotUnderApproval(format!(
            "user {} has no pending role change",
            m.user_id
        )));
    }

    let role = if accept {
        Some(m.pending_role.ok_or_else(|| {
            ControlError::Other(format!("membership {} has no pending role", m.id))
        })?)
    } else {
        None
    };

    Ok(MembershipPatch {
        role,
        status: Some(MemberStatus::Joined),
        pending_role: Some(None),
        ..Default::default()
    })
}

pub fn plan_removal<P: ScopePolicy>(
    existing: Option<&Membership>,
    scope: &Scope,
    user: UserId,
    now: i64,
) -> Result<(i64, MembershipPatch)> {
    let role = effective_role::<P>(existing, scope, now);
    match existing {
        Some(m) if role != EffectiveRole::NotJoined => Ok((
            m.id,
            MembershipPatch {
                status: Some(MemberStatus::Quit),
                out_time: Some(now),
                pending_role: Some(None),
                ..Default::default()
            },
        )),
        _ => Err(ControlError::NotMember(format!(
            "user {} is not a member of {} {}",
            user, P::SCOPE, scope.id
        ))),
    }
}

/// Write produced by [`plan_invite`].
#[derive(Debug, Clone, PartialEq)]
pub enum InvitePlan {
    Insert(Membership),
    Revive(Membership),
    Extend { id: i64, patch: MembershipPatch },
}

/// Manager-initiated join that skips the approval step.
pub fn plan_invite<P: ScopePolicy>(
    existing: Option<&Membership>,
    scope: &Scope,
    user: UserId,
    role: Option<MemberRole>,
    expire_type: ExpireType,
    now: DateTime<Utc>,
    renewal_window_secs: i64,
) -> Result<InvitePlan> {
    let ts = now.timestamp();
    let joined = |base: Membership| Membership {
        status: MemberStatus::Joined,
        join_time: ts,
        expire_type,
        expire_time: expire_time(0, expire_type, now),
        out_time: 0,
        pending_role: None,
        ..base
    };

    let Some(m) = existing else {
        return Ok(InvitePlan::Insert(joined(Membership {
            id: 0,
            scope_type: P::SCOPE,
            scope_id: scope.id,
            user_id: user,
            role: P::resolve_role(role)?,
            status: MemberStatus::Joined,
            join_time: ts,
            expire_type,
            expire_time: 0,
            out_time: 0,
            pending_role: None,
        })));
    };

    if effective_role::<P>(Some(m), scope, ts) == EffectiveRole::NotJoined {
        let role = P::resolve_role(role)?;
        return Ok(InvitePlan::Revive(joined(Membership { role, ..m.clone() })));
    }

    if !in_renewal_window(m.expire_time, ts, renewal_window_secs) {
        return Err(ControlError::AlreadyMember(format!(
            "user {} is already a member of {} {}",
            user, P::SCOPE, scope.id
        )));
    }

    Ok(InvitePlan::Extend {
        id: m.id,
        patch: MembershipPatch {
            status: Some(MemberStatus::Joined),
            expire_type: Some(expire_type),
            expire_time: Some(expire_time(m.expire_time, expire_type, now)),
            out_time: Some(0),
            pending_role: Some(None),
            ..Default::default()
        },
    })
}
