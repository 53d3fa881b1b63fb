//! Pipeline chain manager.
//!
//! Each (table, extension kind, stage) owns one chain of nodes linked through
//! their `front` pointers. Mutations load the chain into a [`ChainIndex`],
//! compute the splice in memory, then persist the front rewrites one row at a
//! time while holding the chain's lock.
//!
//! Rewrites are written before the node's own row changes. A failure half way
//! through leaves the chain visibly broken; [`Pipeline::verify`] reports it.

use crate::ControlPlane;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use tablegate_core::chain::{ChainIndex, ChainViolation, FrontRewrite};
use tablegate_core::validation::{validate_name, validate_text};
use tablegate_core::{
    ChainKey, ChainNode, ControlError, Extension, ExtensionKind, NodeId, NodePatch, Result,
    StageType, UserId,
};
use tablegate_storage::AccessStore;
use tracing::{debug, info, warn};

/// A node to attach to a table's chain.
#[derive(Debug, Clone, PartialEq)]
pub struct AttachRequest {
    pub table_id: i64,
    pub kind: ExtensionKind,
    pub extension_id: i64,
    pub extension_version: i32,
    pub stage: StageType,
    /// Node to run right before the new one; 0 makes it the head
    pub front: NodeId,
    pub enabled: bool,
    pub schedule_config: Value,
    pub config: Value,
    pub description: String,
}

impl AttachRequest {
    pub fn new(table_id: i64, kind: ExtensionKind, extension_id: i64, version: i32, stage: StageType) -> Self {
        Self {
            table_id,
            kind,
            extension_id,
            extension_version: version,
            stage,
            front: 0,
            enabled: true,
            schedule_config: Value::Null,
            config: Value::Null,
            description: String::new(),
        }
    }

    pub fn after(mut self, front: NodeId) -> Self {
        self.front = front;
        self
    }
}

/// Fields to change on an attached node. `None` leaves a field as is.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateRequest {
    pub stage: Option<StageType>,
    pub front: Option<NodeId>,
    pub extension_version: Option<i32>,
    pub enabled: Option<bool>,
    pub schedule_config: Option<Value>,
    pub config: Option<Value>,
    pub description: Option<String>,
}

/// Every stage's chain of one kind on one table, each in execution order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableChains {
    pub table_id: i64,
    pub kind: ExtensionKind,
    pub stages: BTreeMap<StageType, Vec<ChainNode>>,
}

impl TableChains {
    pub fn stage(&self, stage: StageType) -> &[ChainNode] {
        self.stages.get(&stage).map(Vec::as_slice).unwrap_or_default()
    }
}

pub struct Pipeline<'a, S> {
    plane: &'a ControlPlane<S>,
}

impl<S: AccessStore> ControlPlane<S> {
    pub fn pipeline(&self) -> Pipeline<'_, S> {
        Pipeline { plane: self }
    }
}

impl<'a, S: AccessStore> Pipeline<'a, S> {
    /// Add a filter or plugin to the registry.
    pub fn register_extension(&self, extension: Extension) -> Result<Extension> {
        validate_name(&extension.name, "extension")?;
        if extension.versions.is_empty() {
            return Err(ControlError::InvalidParam(format!(
                "extension {} must support at least one version",
                extension.name
            )));
        }

        let id = self.plane.store.insert_extension(&extension)?;
        info!(extension_id = id, kind = %extension.kind, name = %extension.name, "Extension registered");
        Ok(Extension { id, ..extension })
    }

    /// Look up an extension and check it can run `version` at `stage`.
    fn usable_extension(&self, kind: ExtensionKind, id: i64, version: i32, stage: StageType) -> Result<Extension> {
        let ext = self
            .plane
            .store
            .get_extension(kind, id)?
            .ok_or_else(|| ControlError::NotFound(format!("{} {} not found", kind, id)))?;

        if !ext.supports_version(version) {
            return Err(ControlError::InvalidParam(format!(
                "{} {} has no version {}",
                kind, ext.name, version
            )));
        }
        if !ext.online {
            return Err(ControlError::InvalidParam(format!(
                "{} {} is offline",
                kind, ext.name
            )));
        }
        if !ext.supports_stage(stage) {
            return Err(ControlError::InvalidParam(format!(
                "{} {} cannot run at stage {}",
                kind, ext.name, stage
            )));
        }
        Ok(ext)
    }

    fn node(&self, id: NodeId) -> Result<ChainNode> {
        self.plane
            .store
            .get_node(id)?
            .ok_or_else(|| ControlError::NotFound(format!("chain node {} not found", id)))
    }

    fn load(&self, key: ChainKey) -> Result<ChainIndex> {
        Ok(ChainIndex::load(key, self.plane.store.chain_nodes(&key)?))
    }

    /// Persist rewrites, writing each node's final front once.
    fn persist(&self, rewrites: &[FrontRewrite], now: i64) -> Result<()> {
        let mut fronts: BTreeMap<NodeId, NodeId> = BTreeMap::new();
        for rw in rewrites {
            fronts.insert(rw.node_id, rw.front);
        }
        for (node_id, front) in fronts {
            debug!(node_id, front, "Splice rewrite");
            self.plane.store.set_node_front(node_id, front, now)?;
        }
        Ok(())
    }

    fn check_shape(index: &ChainIndex) {
        let violations = index.verify();
        if !violations.is_empty() {
            warn!(chain = %index.key(), ?violations, "Chain is malformed after splice");
        }
    }

    /// Attach a node right after `request.front`. The node that used to follow
    /// that position now follows the new node.
    pub fn attach(&self, user: UserId, request: AttachRequest) -> Result<ChainNode> {
        self.plane.observe("chain_attach", || {
            self.plane.require_table_manager(user, request.table_id)?;
            validate_text(&request.description, "description")?;
            self.usable_extension(
                request.kind,
                request.extension_id,
                request.extension_version,
                request.stage,
            )?;

            let key = ChainKey {
                table_id: request.table_id,
                kind: request.kind,
                stage: request.stage,
            };
            let _guards = self.plane.lock_chains(key, key);
            let mut index = self.load(key)?;
            index.check_front(request.front, None)?;

            let mut node = ChainNode {
                id: 0,
                table_id: request.table_id,
                kind: request.kind,
                stage: request.stage,
                extension_id: request.extension_id,
                extension_version: request.extension_version,
                front: request.front,
                enabled: request.enabled,
                schedule_config: request.schedule_config,
                config: request.config,
                description: request.description,
            };
            let now = self.plane.now();
            node.id = self.plane.store.insert_node(&node, now)?;

            let rewrites = index.splice_in(node.clone())?;
            self.persist(&rewrites, now)?;
            Self::check_shape(&index);

            info!(chain = %key, node_id = node.id, front = node.front, "Chain node attached");
            self.node(node.id)
        })
    }

    /// Update a node. A new stage or front moves it: it is spliced out of its
    /// old chain and into the target chain.
    pub fn update(&self, user: UserId, node_id: NodeId, request: UpdateRequest) -> Result<ChainNode> {
        self.plane.observe("chain_update", || {
            let current = self.node(node_id)?;
            self.plane.require_table_manager(user, current.table_id)?;
            if let Some(description) = &request.description {
                validate_text(description, "description")?;
            }

            let stage = request.stage.unwrap_or(current.stage);
            let version = request.extension_version.unwrap_or(current.extension_version);
            if request.stage.is_some() || request.extension_version.is_some() {
                self.usable_extension(current.kind, current.extension_id, version, stage)?;
            }

            let old_key = current.key();
            let new_key = ChainKey { stage, ..old_key };

            let _guards = self.plane.lock_chains(old_key, new_key);
            let current = self.node(node_id)?;
            if current.key() != old_key {
                return Err(ControlError::Other(format!(
                    "chain node {} moved to {} during update",
                    node_id,
                    current.key()
                )));
            }
            let front = request.front.unwrap_or(current.front);
            let moved = stage != current.stage || front != current.front;

            let now = self.plane.now();
            if moved {
                let mut old_index = self.load(old_key)?;
                let (mut node, mut rewrites) = old_index.splice_out(node_id)?;
                node.stage = stage;
                node.front = front;

                if old_key == new_key {
                    rewrites.extend(old_index.splice_in(node)?);
                    Self::check_shape(&old_index);
                } else {
                    let mut new_index = self.load(new_key)?;
                    rewrites.extend(new_index.splice_in(node)?);
                    Self::check_shape(&old_index);
                    Self::check_shape(&new_index);
                }
                self.persist(&rewrites, now)?;
            }

            let patch = NodePatch {
                stage: (stage != current.stage).then_some(stage),
                front: moved.then_some(front),
                extension_version: request.extension_version,
                enabled: request.enabled,
                schedule_config: request.schedule_config,
                config: request.config,
                description: request.description,
            };
            self.plane.store.update_node(node_id, &patch, now)?;

            info!(chain = %new_key, node_id, front, moved, "Chain node updated");
            self.node(node_id)
        })
    }

    /// Detach a node, closing the gap it leaves. Returns the removed node.
    pub fn detach(&self, user: UserId, node_id: NodeId) -> Result<ChainNode> {
        self.plane.observe("chain_detach", || {
            let current = self.node(node_id)?;
            self.plane.require_table_manager(user, current.table_id)?;

            let key = current.key();
            let _guards = self.plane.lock_chains(key, key);
            let mut index = self.load(key)?;
            let (node, rewrites) = index.splice_out(node_id)?;

            let now = self.plane.now();
            self.persist(&rewrites, now)?;
            self.plane.store.delete_node(node_id)?;
            Self::check_shape(&index);

            info!(chain = %key, node_id, "Chain node detached");
            Ok(node)
        })
    }

    /// Nodes of one chain in execution order. An empty chain reads as empty;
    /// a chain without a head fails with `ChainHeadNotFound`.
    pub fn ordered(&self, key: ChainKey) -> Result<Vec<ChainNode>> {
        self.plane.load_table(key.table_id)?;
        let index = self.load(key)?;
        match index.ordered() {
            Ok(nodes) => {
                if nodes.len() < index.len() {
                    warn!(chain = %key, walked = nodes.len(), stored = index.len(), "Chain walk is truncated");
                }
                Ok(nodes.into_iter().cloned().collect())
            }
            Err(e) => {
                warn!(chain = %key, error = %e, "Chain has no head");
                Err(e)
            }
        }
    }

    pub fn table_chains(&self, table_id: i64, kind: ExtensionKind) -> Result<TableChains> {
        let mut stages = BTreeMap::new();
        for stage in StageType::ALL {
            let nodes = self.ordered(ChainKey {
                table_id,
                kind,
                stage,
            })?;
            stages.insert(stage, nodes);
        }
        Ok(TableChains {
            table_id,
            kind,
            stages,
        })
    }

    /// Structural violations of one chain, empty when it is well formed.
    pub fn verify(&self, key: ChainKey) -> Result<Vec<ChainViolation>> {
        Ok(self.load(key)?.verify())
    }
}
