//! Chain attach/update/detach against a real store.

mod common;

use common::*;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde_json::json;
use tablegate_control::{AttachRequest, UpdateRequest};
use tablegate_core::chain::ChainViolation;
use tablegate_core::{
    ChainKey, ChainNode, ControlError, Extension, ExtensionKind, NodeId, StageType,
};
use tablegate_storage::ChainStore;

fn register(fx: &Fixture, kind: ExtensionKind, name: &str, stages: Vec<StageType>, online: bool) -> Extension {
    fx.plane
        .pipeline()
        .register_extension(Extension {
            id: 0,
            kind,
            name: name.to_string(),
            versions: vec![1, 2],
            stages,
            online,
        })
        .unwrap()
}

fn key(fx: &Fixture, stage: StageType) -> ChainKey {
    ChainKey {
        table_id: fx.table.id,
        kind: ExtensionKind::Filter,
        stage,
    }
}

fn attach(fx: &Fixture, ext: &Extension, stage: StageType, front: NodeId) -> ChainNode {
    fx.plane
        .pipeline()
        .attach(
            OWNER,
            AttachRequest::new(fx.table.id, ext.kind, ext.id, 1, stage).after(front),
        )
        .unwrap()
}

fn order(fx: &Fixture, stage: StageType) -> Vec<NodeId> {
    fx.plane
        .pipeline()
        .ordered(key(fx, stage))
        .unwrap()
        .iter()
        .map(|n| n.id)
        .collect()
}

fn front_of(fx: &Fixture, id: NodeId) -> NodeId {
    fx.plane.store().get_node(id).unwrap().unwrap().front
}

#[test]
fn test_splice_scenario() {
    let fx = Fixture::new();
    let mask = register(&fx, ExtensionKind::Filter, "mask", vec![], true);

    let h = attach(&fx, &mask, StageType::Pre, 0);
    let a = attach(&fx, &mask, StageType::Pre, h.id);
    let b = attach(&fx, &mask, StageType::Pre, a.id);
    assert_eq!(order(&fx, StageType::Pre), vec![h.id, a.id, b.id]);

    let removed = fx.plane.pipeline().detach(OWNER, a.id).unwrap();
    assert_eq!(removed.id, a.id);
    assert_eq!(front_of(&fx, b.id), h.id);
    assert_eq!(order(&fx, StageType::Pre), vec![h.id, b.id]);

    let c = attach(&fx, &mask, StageType::Pre, h.id);
    assert_eq!(front_of(&fx, b.id), c.id);
    assert_eq!(order(&fx, StageType::Pre), vec![h.id, c.id, b.id]);
}

#[test]
fn test_attach_at_head_pushes_old_head_back() {
    let fx = Fixture::new();
    let mask = register(&fx, ExtensionKind::Filter, "mask", vec![], true);
    let first = attach(&fx, &mask, StageType::Post, 0);
    let second = attach(&fx, &mask, StageType::Post, 0);

    assert_eq!(front_of(&fx, first.id), second.id);
    assert_eq!(order(&fx, StageType::Post), vec![second.id, first.id]);
}

#[test]
fn test_attach_validation() {
    let fx = Fixture::new();
    let pre_only = register(&fx, ExtensionKind::Filter, "pre_only", vec![StageType::Pre], true);
    let retired = register(&fx, ExtensionKind::Filter, "retired", vec![], false);
    let pipeline = fx.plane.pipeline();

    let err = pipeline
        .attach(
            OWNER,
            AttachRequest::new(fx.table.id, ExtensionKind::Filter, pre_only.id, 1, StageType::Pre).after(7),
        )
        .unwrap_err();
    assert!(matches!(err, ControlError::NotFirstInChain(_)));

    let err = pipeline
        .attach(
            OWNER,
            AttachRequest::new(fx.table.id, ExtensionKind::Filter, pre_only.id, 1, StageType::Post),
        )
        .unwrap_err();
    assert!(matches!(err, ControlError::InvalidParam(_)));

    let err = pipeline
        .attach(
            OWNER,
            AttachRequest::new(fx.table.id, ExtensionKind::Filter, pre_only.id, 3, StageType::Pre),
        )
        .unwrap_err();
    assert!(matches!(err, ControlError::InvalidParam(_)));

    let err = pipeline
        .attach(
            OWNER,
            AttachRequest::new(fx.table.id, ExtensionKind::Filter, retired.id, 1, StageType::Pre),
        )
        .unwrap_err();
    assert!(matches!(err, ControlError::InvalidParam(_)));

    // Registered as a filter, so unknown as a plugin
    let err = pipeline
        .attach(
            OWNER,
            AttachRequest::new(fx.table.id, ExtensionKind::Plugin, pre_only.id, 1, StageType::Pre),
        )
        .unwrap_err();
    assert!(matches!(err, ControlError::NotFound(_)));

    let head = attach(&fx, &pre_only, StageType::Pre, 0);
    let err = pipeline
        .attach(
            OWNER,
            AttachRequest::new(fx.table.id, ExtensionKind::Filter, pre_only.id, 1, StageType::Pre)
                .after(head.id + 100),
        )
        .unwrap_err();
    assert!(matches!(err, ControlError::InvalidParam(_)));

    let err = pipeline
        .attach(
            OUTSIDER,
            AttachRequest::new(fx.table.id, ExtensionKind::Filter, pre_only.id, 1, StageType::Pre),
        )
        .unwrap_err();
    assert!(matches!(err, ControlError::NotMember(_)));

    assert_eq!(order(&fx, StageType::Pre), vec![head.id]);
}

#[test]
fn test_reorder_within_chain() {
    let fx = Fixture::new();
    let mask = register(&fx, ExtensionKind::Filter, "mask", vec![], true);
    let a = attach(&fx, &mask, StageType::Pre, 0);
    let b = attach(&fx, &mask, StageType::Pre, a.id);
    let c = attach(&fx, &mask, StageType::Pre, b.id);
    let pipeline = fx.plane.pipeline();

    let moved = pipeline
        .update(
            OWNER,
            c.id,
            UpdateRequest {
                front: Some(a.id),
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(moved.front, a.id);
    assert_eq!(order(&fx, StageType::Pre), vec![a.id, c.id, b.id]);

    // Moving the head behind its successor
    pipeline
        .update(
            OWNER,
            a.id,
            UpdateRequest {
                front: Some(b.id),
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(order(&fx, StageType::Pre), vec![c.id, b.id, a.id]);

    let err = pipeline
        .update(
            OWNER,
            b.id,
            UpdateRequest {
                front: Some(b.id),
                ..Default::default()
            },
        )
        .unwrap_err();
    assert!(matches!(err, ControlError::InvalidParam(_)));
    assert_eq!(order(&fx, StageType::Pre), vec![c.id, b.id, a.id]);
}

#[test]
fn test_update_rejects_own_or_foreign_front() {
    let fx = Fixture::new();
    let mask = register(&fx, ExtensionKind::Filter, "mask", vec![], true);
    let audit = register(&fx, ExtensionKind::Plugin, "audit", vec![], true);
    let a = attach(&fx, &mask, StageType::Pre, 0);
    let b = attach(&fx, &mask, StageType::Pre, a.id);
    let post = attach(&fx, &mask, StageType::Post, 0);
    let deferred = attach(&fx, &mask, StageType::Deferred, 0);
    let plugin = fx
        .plane
        .pipeline()
        .attach(
            OWNER,
            AttachRequest::new(fx.table.id, ExtensionKind::Plugin, audit.id, 1, StageType::Pre),
        )
        .unwrap();
    let pipeline = fx.plane.pipeline();

    let rejected_fronts = [
        (None, a.id),
        (None, post.id),
        (None, plugin.id),
        (Some(StageType::Deferred), a.id),
        (Some(StageType::Deferred), b.id),
    ];
    for (stage, front) in rejected_fronts {
        let err = pipeline
            .update(
                OWNER,
                a.id,
                UpdateRequest {
                    stage,
                    front: Some(front),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(
            matches!(err, ControlError::InvalidParam(_)),
            "stage {:?} front {}: {:?}",
            stage,
            front,
            err
        );
    }

    // Nothing moved
    assert_eq!(order(&fx, StageType::Pre), vec![a.id, b.id]);
    assert_eq!(order(&fx, StageType::Post), vec![post.id]);
    assert_eq!(order(&fx, StageType::Deferred), vec![deferred.id]);
    assert_eq!(front_of(&fx, plugin.id), 0);
    assert_eq!(fx.plane.store().get_node(a.id).unwrap().unwrap().stage, StageType::Pre);
}

#[test]
fn test_move_across_stages() {
    let fx = Fixture::new();
    let mask = register(&fx, ExtensionKind::Filter, "mask", vec![], true);
    let a = attach(&fx, &mask, StageType::Pre, 0);
    let b = attach(&fx, &mask, StageType::Pre, a.id);
    let c = attach(&fx, &mask, StageType::Pre, b.id);
    let pipeline = fx.plane.pipeline();

    let err = pipeline
        .update(
            OWNER,
            b.id,
            UpdateRequest {
                stage: Some(StageType::Deferred),
                front: Some(a.id),
                ..Default::default()
            },
        )
        .unwrap_err();
    assert!(matches!(err, ControlError::NotFirstInChain(_)));

    let moved = pipeline
        .update(
            OWNER,
            b.id,
            UpdateRequest {
                stage: Some(StageType::Deferred),
                front: Some(0),
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(moved.stage, StageType::Deferred);
    assert_eq!(order(&fx, StageType::Pre), vec![a.id, c.id]);
    assert_eq!(order(&fx, StageType::Deferred), vec![b.id]);

    pipeline
        .update(
            OWNER,
            a.id,
            UpdateRequest {
                stage: Some(StageType::Deferred),
                front: Some(b.id),
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(order(&fx, StageType::Pre), vec![c.id]);
    assert_eq!(order(&fx, StageType::Deferred), vec![b.id, a.id]);

    let chains = pipeline
        .table_chains(fx.table.id, ExtensionKind::Filter)
        .unwrap();
    assert_eq!(chains.stage(StageType::Pre).len(), 1);
    assert!(chains.stage(StageType::Post).is_empty());
    assert_eq!(chains.stage(StageType::Deferred).len(), 2);
}

#[test]
fn test_config_update_keeps_position() {
    let fx = Fixture::new();
    let mask = register(&fx, ExtensionKind::Filter, "mask", vec![], true);
    let a = attach(&fx, &mask, StageType::Pre, 0);
    let b = attach(&fx, &mask, StageType::Pre, a.id);

    let updated = fx
        .plane
        .pipeline()
        .update(
            OWNER,
            a.id,
            UpdateRequest {
                extension_version: Some(2),
                enabled: Some(false),
                config: Some(json!({"columns": ["email"]})),
                description: Some("mask emails".to_string()),
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(updated.extension_version, 2);
    assert!(!updated.enabled);
    assert_eq!(updated.config, json!({"columns": ["email"]}));
    assert_eq!(updated.front, 0);
    assert_eq!(order(&fx, StageType::Pre), vec![a.id, b.id]);

    let err = fx
        .plane
        .pipeline()
        .update(
            OWNER,
            a.id,
            UpdateRequest {
                extension_version: Some(9),
                ..Default::default()
            },
        )
        .unwrap_err();
    assert!(matches!(err, ControlError::InvalidParam(_)));
}

#[test]
fn test_filters_and_plugins_are_separate_chains() {
    let fx = Fixture::new();
    let mask = register(&fx, ExtensionKind::Filter, "mask", vec![], true);
    let audit = register(&fx, ExtensionKind::Plugin, "audit", vec![], true);

    let f = attach(&fx, &mask, StageType::Pre, 0);
    let p = attach(&fx, &audit, StageType::Pre, 0);
    assert_eq!(f.front, 0);
    assert_eq!(p.front, 0);
    assert_eq!(front_of(&fx, f.id), 0);

    let plugins = fx
        .plane
        .pipeline()
        .table_chains(fx.table.id, ExtensionKind::Plugin)
        .unwrap();
    assert_eq!(plugins.stage(StageType::Pre).len(), 1);
    assert_eq!(plugins.stage(StageType::Pre)[0].id, p.id);
}

#[test]
fn test_headless_chain_is_reported() {
    let fx = Fixture::new();
    let mask = register(&fx, ExtensionKind::Filter, "mask", vec![], true);
    let a = attach(&fx, &mask, StageType::Pre, 0);
    let b = attach(&fx, &mask, StageType::Pre, a.id);

    // Corrupt the chain into a two-node cycle
    fx.plane.store().set_node_front(a.id, b.id, START).unwrap();

    let err = fx.plane.pipeline().ordered(key(&fx, StageType::Pre)).unwrap_err();
    assert!(matches!(err, ControlError::ChainHeadNotFound(_)));
    assert!(!err.is_user_error());

    let violations = fx.plane.pipeline().verify(key(&fx, StageType::Pre)).unwrap();
    assert!(violations.contains(&ChainViolation::NoHead));
}

#[test]
fn test_empty_chain_reads_empty() {
    let fx = Fixture::new();
    assert!(order(&fx, StageType::Post).is_empty());
    assert!(fx
        .plane
        .pipeline()
        .verify(key(&fx, StageType::Post))
        .unwrap()
        .is_empty());
}

#[test]
fn test_chains_stay_well_formed() {
    let fx = Fixture::new();
    let mask = register(&fx, ExtensionKind::Filter, "mask", vec![], true);
    let pipeline = fx.plane.pipeline();
    let stages = [StageType::Pre, StageType::Post];
    let mut rng = StdRng::seed_from_u64(0x7ab1e);

    for _ in 0..150 {
        let stage = *stages.choose(&mut rng).unwrap();
        let ids = order(&fx, stage);

        match rng.gen_range(0..3) {
            0 => {
                let front = *ids.choose(&mut rng).unwrap_or(&0);
                let front = if rng.gen_bool(0.2) { 0 } else { front };
                attach(&fx, &mask, stage, front);
            }
            1 if !ids.is_empty() => {
                let id = *ids.choose(&mut rng).unwrap();
                pipeline.detach(OWNER, id).unwrap();
            }
            _ if !ids.is_empty() => {
                let id = *ids.choose(&mut rng).unwrap();
                let target = *stages.choose(&mut rng).unwrap();
                let candidates: Vec<NodeId> = order(&fx, target)
                    .into_iter()
                    .filter(|n| *n != id)
                    .collect();
                let front = if candidates.is_empty() || rng.gen_bool(0.2) {
                    0
                } else {
                    *candidates.choose(&mut rng).unwrap()
                };
                pipeline
                    .update(
                        OWNER,
                        id,
                        UpdateRequest {
                            stage: Some(target),
                            front: Some(front),
                            ..Default::default()
                        },
                    )
                    .unwrap();
            }
            _ => {
                attach(&fx, &mask, stage, 0);
            }
        }

        for stage in stages {
            let k = key(&fx, stage);
            assert_eq!(pipeline.verify(k).unwrap(), Vec::<ChainViolation>::new());
            let stored = fx.plane.store().chain_nodes(&k).unwrap().len();
            assert_eq!(order(&fx, stage).len(), stored);
        }
    }
}
