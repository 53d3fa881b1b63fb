//! Membership lifecycle through the engine: apply, approve, renew, expire,
//! role changes, removal, listings.

mod common;

use common::*;
use tablegate_core::membership::EffectiveRole;
use tablegate_core::{ControlError, ExpireType, MemberRole, MemberStatus, PageRequest};

#[test]
fn test_apply_and_approve() {
    let fx = Fixture::new();
    let members = fx.plane.product_members();

    let m = members
        .apply(DEV, fx.product.id, Some(MemberRole::Developer), ExpireType::OneMonth)
        .unwrap();
    assert_eq!(m.status, MemberStatus::PendingApproval);
    assert_eq!(m.join_time, START);
    assert_eq!(
        members.effective_role(DEV, fx.product.id).unwrap(),
        EffectiveRole::NotJoined
    );

    fx.set_time(START + 60);
    let m = members.approve(OWNER, DEV, fx.product.id, true).unwrap();
    assert_eq!(m.status, MemberStatus::Joined);
    assert_eq!(m.join_time, START + 60);
    assert!(m.expire_time > START + 28 * DAY);
    assert_eq!(
        members.effective_role(DEV, fx.product.id).unwrap(),
        EffectiveRole::Role(MemberRole::Developer)
    );
}

#[test]
fn test_product_application_requires_role() {
    let fx = Fixture::new();
    let err = fx
        .plane
        .product_members()
        .apply(DEV, fx.product.id, None, ExpireType::OneMonth)
        .unwrap_err();
    assert!(matches!(err, ControlError::InvalidParam(_)));

    let err = fx
        .plane
        .product_members()
        .apply(DEV, fx.product.id, Some(MemberRole::Member), ExpireType::OneMonth)
        .unwrap_err();
    assert!(matches!(err, ControlError::InvalidParam(_)));
}

#[test]
fn test_only_managers_approve() {
    let fx = Fixture::new();
    let members = fx.plane.product_members();
    fx.join_product(DEV, MemberRole::Developer);
    members
        .apply(APPLICANT, fx.product.id, Some(MemberRole::Operator), ExpireType::OneYear)
        .unwrap();

    let err = members.approve(DEV, APPLICANT, fx.product.id, true).unwrap_err();
    assert!(matches!(err, ControlError::NotManager(_)));

    let err = members
        .approve(OUTSIDER, APPLICANT, fx.product.id, true)
        .unwrap_err();
    assert!(matches!(err, ControlError::NotMember(_)));

    // Nothing was written by the failed attempts
    let m = members.approve(OWNER, APPLICANT, fx.product.id, true).unwrap();
    assert_eq!(m.status, MemberStatus::Joined);
}

#[test]
fn test_approving_without_application_is_not_under_approval() {
    let fx = Fixture::new();
    let err = fx
        .plane
        .product_members()
        .approve(OWNER, APPLICANT, fx.product.id, true)
        .unwrap_err();
    assert!(matches!(err, ControlError::NotUnderApproval(_)));
}

#[test]
fn test_renewal_window() {
    let fx = Fixture::new();
    let members = fx.plane.product_members();
    members
        .apply(DEV, fx.product.id, Some(MemberRole::Developer), ExpireType::OneMonth)
        .unwrap();
    let joined = members.approve(OWNER, DEV, fx.product.id, true).unwrap();
    let expiry = joined.expire_time;

    fx.set_time(expiry - 8 * DAY);
    let err = members
        .apply(DEV, fx.product.id, Some(MemberRole::Developer), ExpireType::OneMonth)
        .unwrap_err();
    assert!(matches!(err, ControlError::AlreadyMember(_)));

    fx.set_time(expiry - 3 * DAY);
    let err = members
        .apply(DEV, fx.product.id, Some(MemberRole::Operator), ExpireType::OneMonth)
        .unwrap_err();
    assert!(matches!(err, ControlError::InvalidParam(_)));

    let renewing = members
        .apply(DEV, fx.product.id, Some(MemberRole::Developer), ExpireType::ThreeMonths)
        .unwrap();
    assert_eq!(renewing.id, joined.id);
    assert_eq!(renewing.status, MemberStatus::PendingRenewal);
    assert_eq!(renewing.role, MemberRole::Developer);
    // Still active while the renewal is pending
    assert!(members
        .effective_role(DEV, fx.product.id)
        .unwrap()
        .is_active());

    let renewed = members.approve(OWNER, DEV, fx.product.id, true).unwrap();
    assert_eq!(renewed.status, MemberStatus::Joined);
    assert_eq!(renewed.join_time, joined.join_time);
    assert!(renewed.expire_time >= expiry + 89 * DAY);
}

#[test]
fn test_expired_member_is_locked_out() {
    let fx = Fixture::new();
    let members = fx.plane.product_members();
    members
        .apply(DEV, fx.product.id, Some(MemberRole::Developer), ExpireType::OneMonth)
        .unwrap();
    let joined = members.approve(OWNER, DEV, fx.product.id, true).unwrap();

    fx.set_time(joined.expire_time + 1);
    assert_eq!(
        members.effective_role(DEV, fx.product.id).unwrap(),
        EffectiveRole::Expired
    );
    assert!(matches!(
        members.require_member(DEV, fx.product.id),
        Err(ControlError::MemberExpired(_))
    ));
    assert_eq!(
        members.display(DEV, fx.product.id).unwrap(),
        (EffectiveRole::Role(MemberRole::Developer), MemberStatus::Expired)
    );

    // Renewal is still possible after expiry
    let renewing = members
        .apply(DEV, fx.product.id, None, ExpireType::OneMonth)
        .unwrap();
    assert_eq!(renewing.status, MemberStatus::PendingRenewal);
    let renewed = members.approve(OWNER, DEV, fx.product.id, true).unwrap();
    assert!(renewed.expire_time > fx.now());
}

#[test]
fn test_manager_override() {
    let fx = Fixture::new();
    let members = fx.plane.product_members();
    fx.join_product(DEV, MemberRole::Developer);
    assert_eq!(
        members.effective_role(DEV, fx.product.id).unwrap(),
        EffectiveRole::Role(MemberRole::Developer)
    );

    let product = members
        .maintain_managers(OWNER, fx.product.id, &[OWNER, DEV, DEV])
        .unwrap();
    assert_eq!(product.managers, vec![OWNER, DEV]);
    assert_eq!(
        members.effective_role(DEV, fx.product.id).unwrap(),
        EffectiveRole::Manager
    );

    // Managers must be members
    let err = members
        .maintain_managers(OWNER, fx.product.id, &[OWNER, OUTSIDER])
        .unwrap_err();
    assert!(matches!(err, ControlError::NotMember(_)));
}

#[test]
fn test_membership_row_is_reused() {
    let fx = Fixture::new();
    let members = fx.plane.product_members();

    let first = members
        .apply(APPLICANT, fx.product.id, Some(MemberRole::Developer), ExpireType::OneMonth)
        .unwrap();
    let err = members
        .apply(APPLICANT, fx.product.id, Some(MemberRole::Developer), ExpireType::OneMonth)
        .unwrap_err();
    assert!(matches!(err, ControlError::UnderApproval(_)));

    let rejected = members.approve(OWNER, APPLICANT, fx.product.id, false).unwrap();
    assert_eq!(rejected.status, MemberStatus::Rejected);
    for _ in 0..2 {
        assert!(matches!(
            members.approve(OWNER, APPLICANT, fx.product.id, false),
            Err(ControlError::NotUnderApproval(_))
        ));
    }

    let again = members
        .apply(APPLICANT, fx.product.id, Some(MemberRole::Operator), ExpireType::OneYear)
        .unwrap();
    assert_eq!(again.id, first.id);
    assert_eq!(again.role, MemberRole::Operator);

    members.approve(OWNER, APPLICANT, fx.product.id, true).unwrap();
    fx.set_time(START + DAY);
    let quit = members
        .remove(OWNER, APPLICANT, fx.product.id, "left the team")
        .unwrap();
    assert_eq!(quit.status, MemberStatus::Quit);
    assert_eq!(quit.out_time, START + DAY);
    assert!(matches!(
        members.remove(OWNER, APPLICANT, fx.product.id, "again"),
        Err(ControlError::NotMember(_))
    ));

    let back = members
        .apply(APPLICANT, fx.product.id, Some(MemberRole::Developer), ExpireType::OneMonth)
        .unwrap();
    assert_eq!(back.id, first.id);
    assert_eq!(back.out_time, 0);

    let page = members
        .list(OWNER, fx.product.id, PageRequest::default())
        .unwrap();
    assert_eq!(page.total, 2);
}

#[test]
fn test_role_change() {
    let fx = Fixture::new();
    let members = fx.plane.product_members();
    fx.join_product(DEV, MemberRole::Developer);

    let same = members
        .apply_role_change(DEV, fx.product.id, MemberRole::Developer)
        .unwrap();
    assert_eq!(same.status, MemberStatus::Joined);

    let pending = members
        .apply_role_change(DEV, fx.product.id, MemberRole::Operator)
        .unwrap();
    assert_eq!(pending.status, MemberStatus::PendingRoleChange);
    assert_eq!(pending.role, MemberRole::Developer);
    assert_eq!(pending.pending_role, Some(MemberRole::Operator));
    assert_eq!(
        members.effective_role(DEV, fx.product.id).unwrap(),
        EffectiveRole::Role(MemberRole::Developer)
    );

    let err = members
        .apply_role_change(DEV, fx.product.id, MemberRole::Operator)
        .unwrap_err();
    assert!(matches!(err, ControlError::UnderApproval(_)));

    let changed = members
        .approve_role_change(OWNER, DEV, fx.product.id, true)
        .unwrap();
    assert_eq!(changed.role, MemberRole::Operator);
    assert_eq!(changed.status, MemberStatus::Joined);
    assert_eq!(changed.pending_role, None);

    assert!(matches!(
        members.approve_role_change(OWNER, DEV, fx.product.id, true),
        Err(ControlError::NotUnderApproval(_))
    ));
}

#[test]
fn test_workspace_has_no_role_changes() {
    let fx = Fixture::new();
    fx.join_workspace(DEV);
    let err = fx
        .plane
        .workspace_members()
        .apply_role_change(DEV, fx.workspace.id, MemberRole::Operator)
        .unwrap_err();
    assert!(matches!(err, ControlError::InvalidParam(_)));
}

#[test]
fn test_listing_visibility() {
    let fx = Fixture::new();
    let members = fx.plane.product_members();
    fx.join_product(DEV, MemberRole::Developer);
    members
        .apply(APPLICANT, fx.product.id, Some(MemberRole::Operator), ExpireType::OneMonth)
        .unwrap();

    let all = members
        .list(OWNER, fx.product.id, PageRequest::default())
        .unwrap();
    assert_eq!(all.total, 3);
    let pending = all
        .items
        .iter()
        .find(|v| v.user_id == APPLICANT)
        .unwrap();
    assert_eq!(pending.status, MemberStatus::PendingApproval);
    assert_eq!(pending.status_code, 1);
    let owner = all.items.iter().find(|v| v.user_id == OWNER).unwrap();
    assert_eq!(owner.role, EffectiveRole::Manager);

    let joined = members
        .list(DEV, fx.product.id, PageRequest::default())
        .unwrap();
    assert_eq!(joined.total, 2);
    assert!(joined.items.iter().all(|v| v.status == MemberStatus::Joined));

    assert!(matches!(
        members.list(OUTSIDER, fx.product.id, PageRequest::default()),
        Err(ControlError::NotMember(_))
    ));
}

#[test]
fn test_invite_skips_approval() {
    let fx = Fixture::new();
    let members = fx.plane.workspace_members();

    let m = members
        .invite(OWNER, DEV, fx.workspace.id, None, ExpireType::HalfYear)
        .unwrap();
    assert_eq!(m.status, MemberStatus::Joined);
    assert_eq!(m.role, MemberRole::Member);
    assert!(m.expire_time > START);

    assert!(matches!(
        members.invite(OWNER, DEV, fx.workspace.id, None, ExpireType::HalfYear),
        Err(ControlError::AlreadyMember(_))
    ));
    assert!(matches!(
        members.invite(DEV, APPLICANT, fx.workspace.id, None, ExpireType::HalfYear),
        Err(ControlError::NotManager(_))
    ));
}

#[test]
fn test_invite_extends_member_near_expiry() {
    let fx = Fixture::new();
    let members = fx.plane.product_members();
    let joined = members
        .invite(OWNER, DEV, fx.product.id, Some(MemberRole::Developer), ExpireType::OneMonth)
        .unwrap();
    let expiry = joined.expire_time;

    // Outside the renewal window a second invite is refused and changes nothing
    fx.set_time(expiry - 10 * DAY);
    assert!(matches!(
        members.invite(OWNER, DEV, fx.product.id, None, ExpireType::OneMonth),
        Err(ControlError::AlreadyMember(_))
    ));
    assert_eq!(
        fx.plane.product_members().display(DEV, fx.product.id).unwrap(),
        (EffectiveRole::Role(MemberRole::Developer), MemberStatus::Joined)
    );

    // Inside it the row is extended from its current expiry
    fx.set_time(expiry - 2 * DAY);
    let extended = members
        .invite(OWNER, DEV, fx.product.id, None, ExpireType::OneMonth)
        .unwrap();
    assert_eq!(extended.id, joined.id);
    assert_eq!(extended.status, MemberStatus::Joined);
    assert_eq!(extended.role, MemberRole::Developer);
    assert_eq!(extended.join_time, joined.join_time);
    assert!(extended.expire_time >= expiry + 28 * DAY);
}

#[test]
fn test_invite_settles_pending_renewal() {
    let fx = Fixture::new();
    let members = fx.plane.product_members();
    let joined = members
        .invite(OWNER, DEV, fx.product.id, Some(MemberRole::Developer), ExpireType::OneMonth)
        .unwrap();

    fx.set_time(joined.expire_time - DAY);
    let renewing = members
        .apply(DEV, fx.product.id, None, ExpireType::OneMonth)
        .unwrap();
    assert_eq!(renewing.status, MemberStatus::PendingRenewal);

    let m = members
        .invite(OWNER, DEV, fx.product.id, None, ExpireType::ThreeMonths)
        .unwrap();
    assert_eq!(m.status, MemberStatus::Joined);
    assert_eq!(m.expire_type, ExpireType::ThreeMonths);
    assert!(m.expire_time > joined.expire_time);
    assert!(matches!(
        members.approve(OWNER, DEV, fx.product.id, true),
        Err(ControlError::NotUnderApproval(_))
    ));
}

#[test]
fn test_unknown_scope_is_not_found() {
    let fx = Fixture::new();
    let err = fx
        .plane
        .product_members()
        .apply(DEV, 999, Some(MemberRole::Developer), ExpireType::OneMonth)
        .unwrap_err();
    assert!(matches!(err, ControlError::NotFound(_)));
}
