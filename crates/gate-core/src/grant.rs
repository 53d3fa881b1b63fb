//! Access grant state machine and database-to-table subsumption.

use crate::model::{
    AppId, Application, Capability, Grant, GrantPatch, GrantStatus, ResourceType, UserId,
};
use crate::{ControlError, Result};
use serde::Serialize;
use std::collections::HashMap;

/// Per-resource grant rules.
pub trait GrantPolicy: Send + Sync + 'static {
    const RESOURCE: ResourceType;

    /// Operations an application may be granted on this resource kind.
    const SUPPORTED_OPS: &'static [&'static str];

    /// Every op must be in [`Self::SUPPORTED_OPS`]. Expects normalized ops.
    fn validate_ops(ops: &[String]) -> Result<()> {
        let unsupported: Vec<&str> = ops
            .iter()
            .map(String::as_str)
            .filter(|op| !Self::SUPPORTED_OPS.contains(op))
            .collect();
        if unsupported.is_empty() {
            Ok(())
        } else {
            Err(ControlError::InvalidParam(format!(
                "unsupported {} ops: {} (supported: {})",
                Self::RESOURCE,
                unsupported.join(", "),
                Self::SUPPORTED_OPS.join(", ")
            )))
        }
    }

    /// Capability kind must match the resource.
    fn validate_capability(capability: &Capability) -> Result<()> {
        if capability.resource_type() == Self::RESOURCE {
            Ok(())
        } else {
            Err(ControlError::InvalidParam(format!(
                "a {} capability cannot be granted on a {}",
                capability.resource_type(),
                Self::RESOURCE
            )))
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DatabaseGrants;

impl GrantPolicy for DatabaseGrants {
    const RESOURCE: ResourceType = ResourceType::Database;
    const SUPPORTED_OPS: &'static [&'static str] = &[
        "insert", "replace", "update", "delete", "find", "find_all", "create", "drop",
    ];
}

#[derive(Debug, Clone, Copy)]
pub struct TableGrants;

// Tables are data only; schema ops stay with the database grant.
impl GrantPolicy for TableGrants {
    const RESOURCE: ResourceType = ResourceType::Table;
    const SUPPORTED_OPS: &'static [&'static str] =
        &["insert", "replace", "update", "delete", "find", "find_all"];
}

/// Write produced by [`plan_request`].
#[derive(Debug, Clone, PartialEq)]
pub enum RequestPlan {
    Insert(Grant),
    Reopen { id: i64, patch: GrantPatch },
}

pub struct AccessRequest<'a> {
    pub resource_id: i64,
    pub app_id: AppId,
    pub capability: Capability,
    pub ops: Vec<String>,
    pub reason: &'a str,
    pub user: UserId,
    pub now: i64,
}

pub fn plan_request<P: GrantPolicy>(existing: Option<&Grant>, req: AccessRequest<'_>) -> Result<RequestPlan> {
    P::validate_capability(&req.capability)?;
    P::validate_ops(&req.ops)?;

    let Some(grant) = existing else {
        return Ok(RequestPlan::Insert(Grant {
            id: 0,
            resource_type: P::RESOURCE,
            resource_id: req.resource_id,
            app_id: req.app_id,
            capability: req.capability,
            ops: req.ops,
            status: GrantStatus::Checking,
            apply_user: req.user,
            reason: req.reason.to_string(),
            reviewed_by: None,
            created_at: req.now,
            updated_at: req.now,
        }));
    };

    match grant.status {
        GrantStatus::Normal => Err(ControlError::AlreadyNormal(format!(
            "app {} already has access to {} {}",
            req.app_id,
            P::RESOURCE,
            req.resource_id
        ))),
        GrantStatus::Checking => Err(ControlError::AlreadyChecking(format!(
            "access of app {} to {} {} is under review",
            req.app_id,
            P::RESOURCE,
            req.resource_id
        ))),
        GrantStatus::Offline | GrantStatus::Cancelled | GrantStatus::Rejected => {
            Ok(RequestPlan::Reopen {
                id: grant.id,
                patch: GrantPatch {
                    capability: Some(req.capability),
                    ops: Some(req.ops),
                    status: Some(GrantStatus::Checking),
                    apply_user: Some(req.user),
                    reason: Some(req.reason.to_string()),
                    updated_at: Some(req.now),
                    ..Default::default()
                },
            })
        }
    }
}

pub fn plan_review(grant: &Grant, accept: bool, reviewer: UserId, now: i64) -> Result<GrantPatch> {
    if grant.status != GrantStatus::Checking {
        return Err(ControlError::NotUnderApproval(format!(
            "grant {} is {}",
            grant.id, grant.status
        )));
    }

    Ok(GrantPatch {
        status: Some(if accept {
            GrantStatus::Normal
        } else {
            GrantStatus::Rejected
        }),
        reviewed_by: Some(reviewer),
        updated_at: Some(now),
        ..Default::default()
    })
}

pub fn plan_withdraw(grant: &Grant, user: UserId, reason: &str, now: i64) -> Result<GrantPatch> {
    if grant.apply_user != user {
        return Err(ControlError::PermissionDenied(format!(
            "only the applicant of grant {} may withdraw it",
            grant.id
        )));
    }
    if grant.status != GrantStatus::Checking {
        return Err(ControlError::NotUnderApproval(format!(
            "grant {} is {}",
            grant.id, grant.status
        )));
    }

    Ok(GrantPatch {
        status: Some(GrantStatus::Cancelled),
        reason: Some(reason.to_string()),
        updated_at: Some(now),
        ..Default::default()
    })
}

/// True if a database grant covers every table in its database.
pub fn subsumes_tables(db_grant: &Grant) -> bool {
    db_grant.status == GrantStatus::Normal
        && matches!(db_grant.capability, Capability::Database { root } if root.covers_tables())
}

/// How an application stands against one table.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "access", rename_all = "snake_case")]
pub enum TableAccess {
    /// Covered by a database grant; no table grant needed
    Implicit,
    Unrequested,
    Requested(Grant),
}

impl TableAccess {
    pub fn status_code(&self) -> i8 {
        match self {
            TableAccess::Implicit => GrantStatus::IMPLICIT_CODE,
            TableAccess::Unrequested => GrantStatus::UNREQUESTED_CODE,
            TableAccess::Requested(grant) => grant.status.code(),
        }
    }
}

/// Applications split by their access to one resource.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AccessPartition {
    pub implicit: Vec<Application>,
    pub unrequested: Vec<Application>,
    pub requested: Vec<(Application, Grant)>,
}

impl AccessPartition {
    pub fn len(&self) -> usize {
        self.implicit.len() + self.unrequested.len() + self.requested.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Partition `apps` by access to one resource. Each app lands in exactly one
/// bucket: implicit (only when `db_grants` are given), then unrequested, then
/// requested.
pub fn partition_access(
    apps: Vec<Application>,
    db_grants: &[Grant],
    resource_grants: &[Grant],
) -> AccessPartition {
    let covered: Vec<AppId> = db_grants
        .iter()
        .filter(|g| subsumes_tables(g))
        .map(|g| g.app_id)
        .collect();
    let mut by_app: HashMap<AppId, &Grant> =
        resource_grants.iter().map(|g| (g.app_id, g)).collect();

    let mut partition = AccessPartition::default();
    for app in apps {
        if covered.contains(&app.app_id) {
            partition.implicit.push(app);
        } else if let Some(grant) = by_app.remove(&app.app_id) {
            partition.requested.push((app, grant.clone()));
        } else {
            partition.unrequested.push(app);
        }
    }
    partition
}
