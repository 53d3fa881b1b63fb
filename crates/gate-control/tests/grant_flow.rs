//! Grant lifecycle, resource manager derivation, and database-to-table
//! subsumption.

mod common;

use common::*;
use tablegate_core::grant::TableAccess;
use tablegate_core::{
    Application, Capability, ControlError, DatabaseRoot, GrantStatus, MemberRole, OnlineStatus,
    PageRequest,
};

fn all_privileges() -> Capability {
    Capability::Database {
        root: DatabaseRoot::AllPrivileges,
    }
}

fn query_all() -> Capability {
    Capability::Table { query_all: true }
}

fn app(fx: &Fixture, name: &str, managers: &[u64]) -> Application {
    fx.plane
        .create_application(OWNER, name, "", managers)
        .unwrap()
}

#[test]
fn test_request_and_approve() {
    let fx = Fixture::new();
    let etl = app(&fx, "etl", &[]);
    let grants = fx.plane.database_grants();

    let g = grants
        .request(
            OWNER,
            etl.app_id,
            fx.database.id,
            all_privileges(),
            &ops(&["Find", "insert", "find"]),
            "nightly load",
        )
        .unwrap();
    assert_eq!(g.status, GrantStatus::Checking);
    assert_eq!(g.ops, vec!["find", "insert"]);
    assert_eq!(g.apply_user, OWNER);

    let err = grants
        .request(OWNER, etl.app_id, fx.database.id, all_privileges(), &ops(&["find"]), "")
        .unwrap_err();
    assert!(matches!(err, ControlError::AlreadyChecking(_)));

    let g = grants.approve(OWNER, etl.app_id, fx.database.id, true).unwrap();
    assert_eq!(g.status, GrantStatus::Normal);
    assert_eq!(g.reviewed_by, Some(OWNER));

    let err = grants
        .request(OWNER, etl.app_id, fx.database.id, all_privileges(), &ops(&["find"]), "")
        .unwrap_err();
    assert!(matches!(err, ControlError::AlreadyNormal(_)));
}

#[test]
fn test_request_guards() {
    let fx = Fixture::new();
    let etl = app(&fx, "etl", &[]);
    let grants = fx.plane.table_grants();

    let err = grants
        .request(DEV, etl.app_id, fx.table.id, query_all(), &ops(&["find"]), "")
        .unwrap_err();
    assert!(matches!(err, ControlError::NotManager(_)));

    let err = grants
        .request(OWNER, 42, fx.table.id, query_all(), &ops(&["find"]), "")
        .unwrap_err();
    assert!(matches!(err, ControlError::NotFound(_)));

    let err = grants
        .request(OWNER, etl.app_id, 999, query_all(), &ops(&["find"]), "")
        .unwrap_err();
    assert!(matches!(err, ControlError::NotFound(_)));

    let err = grants
        .request(OWNER, etl.app_id, fx.table.id, all_privileges(), &ops(&["find"]), "")
        .unwrap_err();
    assert!(matches!(err, ControlError::InvalidParam(_)));

    let err = grants
        .request(OWNER, etl.app_id, fx.table.id, query_all(), &[], "")
        .unwrap_err();
    assert!(matches!(err, ControlError::InvalidParam(_)));
}

#[test]
fn test_reject_is_not_reappliable() {
    let fx = Fixture::new();
    let etl = app(&fx, "etl", &[]);
    let grants = fx.plane.table_grants();
    grants
        .request(OWNER, etl.app_id, fx.table.id, query_all(), &ops(&["find"]), "")
        .unwrap();

    let g = grants.approve(OWNER, etl.app_id, fx.table.id, false).unwrap();
    assert_eq!(g.status, GrantStatus::Rejected);
    for _ in 0..2 {
        assert!(matches!(
            grants.approve(OWNER, etl.app_id, fx.table.id, false),
            Err(ControlError::NotUnderApproval(_))
        ));
    }

    // A fresh request reopens the same row
    let reopened = grants
        .request(OWNER, etl.app_id, fx.table.id, query_all(), &ops(&["find"]), "retry")
        .unwrap();
    assert_eq!(reopened.id, g.id);
    assert_eq!(reopened.status, GrantStatus::Checking);
    assert_eq!(reopened.reason, "retry");
}

#[test]
fn test_only_applicant_withdraws() {
    let fx = Fixture::new();
    let bi = app(&fx, "bi", &[DEV]);
    let grants = fx.plane.table_grants();
    grants
        .request(DEV, bi.app_id, fx.table.id, query_all(), &ops(&["find"]), "dashboards")
        .unwrap();

    let err = grants
        .withdraw(OWNER, bi.app_id, fx.table.id, "not mine")
        .unwrap_err();
    assert!(matches!(err, ControlError::PermissionDenied(_)));

    let g = grants
        .withdraw(DEV, bi.app_id, fx.table.id, "no longer needed")
        .unwrap();
    assert_eq!(g.status, GrantStatus::Cancelled);
    assert_eq!(g.reason, "no longer needed");

    assert!(matches!(
        grants.withdraw(DEV, bi.app_id, fx.table.id, ""),
        Err(ControlError::NotUnderApproval(_))
    ));

    // Another manager of the app may reopen it and becomes the applicant
    let g = grants
        .request(OWNER, bi.app_id, fx.table.id, query_all(), &ops(&["find"]), "")
        .unwrap();
    assert_eq!(g.status, GrantStatus::Checking);
    assert_eq!(g.apply_user, OWNER);
}

#[test]
fn test_edit_and_set_enabled_bypass_review() {
    let fx = Fixture::new();
    let etl = app(&fx, "etl", &[]);
    let grants = fx.plane.database_grants();
    grants
        .request(OWNER, etl.app_id, fx.database.id, all_privileges(), &ops(&["find"]), "")
        .unwrap();
    grants.approve(OWNER, etl.app_id, fx.database.id, true).unwrap();

    let narrowed = Capability::Database {
        root: DatabaseRoot::None,
    };
    let g = grants
        .edit(OWNER, etl.app_id, fx.database.id, narrowed, &ops(&["find", "update"]))
        .unwrap();
    assert_eq!(g.status, GrantStatus::Normal);
    assert_eq!(g.capability, narrowed);
    assert_eq!(g.ops, vec!["find", "update"]);

    let g = grants
        .set_enabled(OWNER, etl.app_id, fx.database.id, OnlineStatus::Offline)
        .unwrap();
    assert_eq!(g.status, GrantStatus::Offline);
    let g = grants
        .set_enabled(OWNER, etl.app_id, fx.database.id, OnlineStatus::Online)
        .unwrap();
    assert_eq!(g.status, GrantStatus::Normal);

    fx.join_product(DEV, MemberRole::Developer);
    assert!(matches!(
        grants.edit(DEV, etl.app_id, fx.database.id, narrowed, &ops(&["find"])),
        Err(ControlError::NotManager(_))
    ));
}

#[test]
fn test_edit_and_set_enabled_on_closed_requests() {
    let fx = Fixture::new();
    let etl = app(&fx, "etl", &[]);
    let bi = app(&fx, "bi", &[]);
    let grants = fx.plane.table_grants();
    let restricted = Capability::Table { query_all: false };

    // Rejected: edit rewrites the terms but leaves the row rejected
    grants
        .request(OWNER, etl.app_id, fx.table.id, query_all(), &ops(&["find"]), "")
        .unwrap();
    grants.approve(OWNER, etl.app_id, fx.table.id, false).unwrap();
    let g = grants
        .edit(OWNER, etl.app_id, fx.table.id, restricted, &ops(&["find_all"]))
        .unwrap();
    assert_eq!(g.status, GrantStatus::Rejected);
    assert_eq!(g.capability, restricted);
    assert_eq!(g.ops, vec!["find_all"]);
    assert!(matches!(
        grants.approve(OWNER, etl.app_id, fx.table.id, true),
        Err(ControlError::NotUnderApproval(_))
    ));

    // A manager can still switch a rejected row on directly
    let g = grants
        .set_enabled(OWNER, etl.app_id, fx.table.id, OnlineStatus::Online)
        .unwrap();
    assert_eq!(g.status, GrantStatus::Normal);

    // Cancelled: edit keeps it cancelled, switching off parks it offline
    grants
        .request(OWNER, bi.app_id, fx.table.id, query_all(), &ops(&["find"]), "")
        .unwrap();
    grants.withdraw(OWNER, bi.app_id, fx.table.id, "").unwrap();
    let g = grants
        .edit(OWNER, bi.app_id, fx.table.id, restricted, &ops(&["find", "insert"]))
        .unwrap();
    assert_eq!(g.status, GrantStatus::Cancelled);
    let g = grants
        .set_enabled(OWNER, bi.app_id, fx.table.id, OnlineStatus::Offline)
        .unwrap();
    assert_eq!(g.status, GrantStatus::Offline);

    // Either way a new request reopens the same row for review
    let g = grants
        .request(OWNER, bi.app_id, fx.table.id, query_all(), &ops(&["find"]), "again")
        .unwrap();
    assert_eq!(g.status, GrantStatus::Checking);
}

#[test]
fn test_unsupported_ops_rejected() {
    let fx = Fixture::new();
    let etl = app(&fx, "etl", &[]);
    let db_grants = fx.plane.database_grants();
    let table_grants = fx.plane.table_grants();

    let err = db_grants
        .request(
            OWNER,
            etl.app_id,
            fx.database.id,
            all_privileges(),
            &ops(&["find", "drop_everything"]),
            "",
        )
        .unwrap_err();
    assert!(matches!(err, ControlError::InvalidParam(_)));
    assert!(db_grants.get(etl.app_id, fx.database.id).is_err());

    // Schema ops belong to the database grant
    let err = table_grants
        .request(OWNER, etl.app_id, fx.table.id, query_all(), &ops(&["drop"]), "")
        .unwrap_err();
    assert!(matches!(err, ControlError::InvalidParam(_)));
    db_grants
        .request(OWNER, etl.app_id, fx.database.id, all_privileges(), &ops(&["create", "drop"]), "")
        .unwrap();

    // Edits are held to the same set
    let err = db_grants
        .edit(OWNER, etl.app_id, fx.database.id, all_privileges(), &ops(&["truncate"]))
        .unwrap_err();
    assert!(matches!(err, ControlError::InvalidParam(_)));
    let g = db_grants.get(etl.app_id, fx.database.id).unwrap();
    assert_eq!(g.ops, vec!["create", "drop"]);
}

#[test]
fn test_list_for_app_across_resources() {
    let fx = Fixture::new();
    let etl = app(&fx, "etl", &[DEV]);
    let events_db = fx
        .plane
        .create_database(OWNER, fx.product.id, "events_db", &[])
        .unwrap();
    let db_grants = fx.plane.database_grants();
    for db in [fx.database.id, events_db.id] {
        db_grants
            .request(OWNER, etl.app_id, db, all_privileges(), &ops(&["find"]), "")
            .unwrap();
    }
    fx.plane
        .table_grants()
        .request(OWNER, etl.app_id, fx.table.id, query_all(), &ops(&["find"]), "")
        .unwrap();

    let all = db_grants
        .list_for_app(DEV, etl.app_id, None, PageRequest::default())
        .unwrap();
    assert_eq!(all.total, 2);
    assert!(all.items.iter().all(|g| g.app_id == etl.app_id));

    let events = db_grants
        .list_for_app(OWNER, etl.app_id, Some(" EVENTS "), PageRequest::default())
        .unwrap();
    assert_eq!(events.total, 1);
    assert_eq!(events.items[0].resource_id, events_db.id);

    let tables = fx
        .plane
        .table_grants()
        .list_for_app(OWNER, etl.app_id, Some("orders"), PageRequest::default())
        .unwrap();
    assert_eq!(tables.total, 1);

    assert!(matches!(
        db_grants.list_for_app(OUTSIDER, etl.app_id, None, PageRequest::default()),
        Err(ControlError::NotManager(_))
    ));
    assert!(matches!(
        db_grants.list_for_app(OWNER, 404, None, PageRequest::default()),
        Err(ControlError::NotFound(_))
    ));
}

#[test]
fn test_access_partition_keyword() {
    let fx = Fixture::new();
    let etl = app(&fx, "etl", &[]);
    app(&fx, "bi", &[]);

    let access = fx
        .plane
        .app_can_access_table(OWNER, fx.table.id, Some("et"))
        .unwrap();
    assert_eq!(access.len(), 1);
    assert_eq!(access.unrequested[0].app_id, etl.app_id);

    let by_id = fx
        .plane
        .app_can_access_database(OWNER, fx.database.id, Some(&etl.app_id.to_string()))
        .unwrap();
    assert!(by_id.unrequested.iter().any(|a| a.app_id == etl.app_id));

    let blank = fx
        .plane
        .app_can_access_table(OWNER, fx.table.id, Some("  "))
        .unwrap();
    assert_eq!(blank.len(), 2);
}

#[test]
fn test_database_manager_derivation() {
    let fx = Fixture::new();
    fx.join_product(DEV, MemberRole::Developer);
    let shared = fx
        .plane
        .create_database(OWNER, fx.product.id, "shared_db", &[DEV])
        .unwrap();
    assert_eq!(shared.managers, vec![OWNER, DEV]);

    assert!(fx.plane.require_database_manager(DEV, shared.id).is_ok());
    assert!(matches!(
        fx.plane.require_database_manager(DEV, fx.database.id),
        Err(ControlError::NotManager(_))
    ));
    assert!(matches!(
        fx.plane.require_database_manager(OUTSIDER, shared.id),
        Err(ControlError::NotMember(_))
    ));

    // Tables inherit from their database
    let events = fx.plane.create_table(DEV, shared.id, "events").unwrap();
    assert!(fx.plane.require_table_manager(DEV, events.id).is_ok());

    // Listed managers lose the database once they leave the product
    fx.plane
        .product_members()
        .remove(OWNER, DEV, fx.product.id, "moved teams")
        .unwrap();
    assert!(matches!(
        fx.plane.require_table_manager(DEV, events.id),
        Err(ControlError::NotMember(_))
    ));

    // Database managers must be product members
    assert!(matches!(
        fx.plane
            .create_database(OWNER, fx.product.id, "other_db", &[OUTSIDER]),
        Err(ControlError::NotMember(_))
    ));
}

#[test]
fn test_subsumption() {
    let fx = Fixture::new();
    let etl = app(&fx, "etl", &[]);
    let bi = app(&fx, "bi", &[]);
    let adhoc = app(&fx, "adhoc", &[]);

    let db_grants = fx.plane.database_grants();
    db_grants
        .request(OWNER, etl.app_id, fx.database.id, all_privileges(), &ops(&["find"]), "")
        .unwrap();
    db_grants.approve(OWNER, etl.app_id, fx.database.id, true).unwrap();

    // A root-less database grant does not cover tables
    db_grants
        .request(
            OWNER,
            bi.app_id,
            fx.database.id,
            Capability::Database {
                root: DatabaseRoot::None,
            },
            &ops(&["find"]),
            "",
        )
        .unwrap();
    db_grants.approve(OWNER, bi.app_id, fx.database.id, true).unwrap();

    let table_grants = fx.plane.table_grants();
    table_grants
        .request(OWNER, bi.app_id, fx.table.id, query_all(), &ops(&["find"]), "")
        .unwrap();

    let access = fx.plane.app_can_access_table(OWNER, fx.table.id, None).unwrap();
    assert_eq!(access.len(), 3);
    assert_eq!(access.implicit.len(), 1);
    assert_eq!(access.implicit[0].app_id, etl.app_id);
    assert_eq!(TableAccess::Implicit.status_code(), GrantStatus::IMPLICIT_CODE);
    assert_eq!(access.unrequested.len(), 1);
    assert_eq!(access.unrequested[0].app_id, adhoc.app_id);
    assert_eq!(access.requested.len(), 1);
    assert_eq!(access.requested[0].1.status, GrantStatus::Checking);

    // A redundant table request still goes through
    let redundant = table_grants
        .request(OWNER, etl.app_id, fx.table.id, query_all(), &ops(&["find"]), "")
        .unwrap();
    assert_eq!(redundant.status, GrantStatus::Checking);
    let access = fx.plane.app_can_access_table(OWNER, fx.table.id, None).unwrap();
    assert_eq!(access.implicit.len(), 1);

    // Taking the database grant offline exposes the table grant
    db_grants
        .set_enabled(OWNER, etl.app_id, fx.database.id, OnlineStatus::Offline)
        .unwrap();
    let access = fx.plane.app_can_access_table(OWNER, fx.table.id, None).unwrap();
    assert!(access.implicit.is_empty());
    assert_eq!(access.requested.len(), 2);

    // The database view has no implicit bucket
    let access = fx.plane.app_can_access_database(OWNER, fx.database.id, None).unwrap();
    assert!(access.implicit.is_empty());
    assert_eq!(access.requested.len(), 2);
    assert_eq!(access.unrequested.len(), 1);
}

#[test]
fn test_offline_applications_are_not_candidates() {
    let fx = Fixture::new();
    let etl = app(&fx, "etl", &[]);
    app(&fx, "bi", &[]);

    fx.plane
        .set_application_status(OWNER, etl.app_id, OnlineStatus::Offline)
        .unwrap();
    let access = fx.plane.app_can_access_table(OWNER, fx.table.id, None).unwrap();
    assert_eq!(access.len(), 1);
}

#[test]
fn test_listing_by_role() {
    let fx = Fixture::new();
    let etl = app(&fx, "etl", &[]);
    let bi = app(&fx, "bi", &[DEV]);
    let grants = fx.plane.table_grants();
    grants
        .request(OWNER, etl.app_id, fx.table.id, query_all(), &ops(&["find"]), "")
        .unwrap();
    grants
        .request(DEV, bi.app_id, fx.table.id, query_all(), &ops(&["find"]), "")
        .unwrap();

    let all = grants
        .list(OWNER, fx.table.id, PageRequest::default())
        .unwrap();
    assert_eq!(all.total, 2);

    let mine = grants.list(DEV, fx.table.id, PageRequest::default()).unwrap();
    assert_eq!(mine.total, 1);
    assert_eq!(mine.items[0].app_id, bi.app_id);

    let none = grants
        .list(OUTSIDER, fx.table.id, PageRequest::default())
        .unwrap();
    assert_eq!(none.total, 0);
}

#[test]
fn test_application_requires_workspace_member() {
    let fx = Fixture::new();
    let err = fx
        .plane
        .create_application(OUTSIDER, "rogue", "", &[])
        .unwrap_err();
    assert!(matches!(err, ControlError::NotMember(_)));

    fx.join_workspace(OUTSIDER);
    let app = fx
        .plane
        .create_application(OUTSIDER, "sanctioned", "", &[])
        .unwrap();
    assert!(fx.plane.require_app_manager(OUTSIDER, app.app_id).is_ok());
    assert!(matches!(
        fx.plane.require_app_manager(DEV, app.app_id),
        Err(ControlError::NotManager(_))
    ));
}
