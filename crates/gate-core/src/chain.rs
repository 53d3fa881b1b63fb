//! In-memory index over one execution chain.
//!
//! Chains are persisted one row per node, each row naming the node that runs
//! immediately before it (`front`, 0 for the head). [`ChainIndex`] loads those
//! rows into an arena keyed by node id with a derived `front -> successors`
//! adjacency map, and computes every splice as a list of [`FrontRewrite`]s the
//! caller persists one row at a time.

use crate::model::{ChainKey, ChainNode, NodeId};
use crate::{ControlError, Result};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Rewrite of one node's `front` pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FrontRewrite {
    pub node_id: NodeId,
    pub front: NodeId,
}

/// Structural problem found by [`ChainIndex::verify`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "violation", rename_all = "snake_case")]
pub enum ChainViolation {
    NoHead,
    MultipleHeads { heads: Vec<NodeId> },
    SelfReference { node_id: NodeId },
    DanglingFront { node_id: NodeId, front: NodeId },
    Fork { front: NodeId, successors: Vec<NodeId> },
    /// Nodes not reachable from the head: orphans or cycle members
    Unreachable { nodes: Vec<NodeId> },
}

impl std::fmt::Display for ChainViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChainViolation::NoHead => write!(f, "no node has front = 0"),
            ChainViolation::MultipleHeads { heads } => write!(f, "multiple heads {:?}", heads),
            ChainViolation::SelfReference { node_id } => {
                write!(f, "node {} points at itself", node_id)
            }
            ChainViolation::DanglingFront { node_id, front } => {
                write!(f, "node {} points at missing node {}", node_id, front)
            }
            ChainViolation::Fork { front, successors } => {
                write!(f, "nodes {:?} all follow {}", successors, front)
            }
            ChainViolation::Unreachable { nodes } => {
                write!(f, "nodes {:?} are unreachable from the head", nodes)
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChainIndex {
    key: ChainKey,
    nodes: BTreeMap<NodeId, ChainNode>,
    successors: HashMap<NodeId, BTreeSet<NodeId>>,
}

impl ChainIndex {
    /// Build the index for `key`. Nodes belonging to other chains are ignored.
    pub fn load(key: ChainKey, nodes: impl IntoIterator<Item = ChainNode>) -> Self {
        let mut index = Self {
            key,
            nodes: BTreeMap::new(),
            successors: HashMap::new(),
        };
        for node in nodes.into_iter().filter(|n| n.key() == key) {
            index.insert(node);
        }
        index
    }

    pub fn key(&self) -> ChainKey {
        self.key
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn get(&self, id: NodeId) -> Option<&ChainNode> {
        self.nodes.get(&id)
    }

    /// Nodes whose `front` is `id`, lowest id first.
    pub fn successors_of(&self, id: NodeId) -> Vec<NodeId> {
        self.successors
            .get(&id)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    fn insert(&mut self, node: ChainNode) {
        self.successors.entry(node.front).or_default().insert(node.id);
        self.nodes.insert(node.id, node);
    }

    fn remove(&mut self, id: NodeId) -> Option<ChainNode> {
        let node = self.nodes.remove(&id)?;
        if let Some(set) = self.successors.get_mut(&node.front) {
            set.remove(&id);
            if set.is_empty() {
                self.successors.remove(&node.front);
            }
        }
        Some(node)
    }

    fn set_front(&mut self, id: NodeId, front: NodeId) {
        if let Some(mut node) = self.remove(id) {
            node.front = front;
            self.insert(node);
        }
    }

    /// Check that a node may be placed after `front`.
    ///
    /// An empty chain only accepts a head. Otherwise `front` must be 0 or a
    /// node of this chain other than `moving`.
    pub fn check_front(&self, front: NodeId, moving: Option<NodeId>) -> Result<()> {
        if moving.is_some_and(|id| id == front) {
            return Err(ControlError::InvalidParam(format!(
                "node {} cannot follow itself",
                front
            )));
        }
        let others = self.nodes.keys().filter(|id| Some(**id) != moving).count();
        if others == 0 {
            if front != 0 {
                return Err(ControlError::NotFirstInChain(format!(
                    "chain {} is empty, the first node must have front 0, got {}",
                    self.key, front
                )));
            }
            return Ok(());
        }
        if front != 0 && !self.contains(front) {
            return Err(ControlError::InvalidParam(format!(
                "front {} is not a node of chain {}",
                front, self.key
            )));
        }
        Ok(())
    }

    /// Insert `node` right after `node.front`. The node that used to follow
    /// that position is re-pointed at `node`.
    pub fn splice_in(&mut self, node: ChainNode) -> Result<Vec<FrontRewrite>> {
        self.check_front(node.front, Some(node.id))?;
        if self.contains(node.id) {
            return Err(ControlError::InvalidParam(format!(
                "node {} is already in chain {}",
                node.id, self.key
            )));
        }

        let rewrites: Vec<FrontRewrite> = self
            .successors_of(node.front)
            .into_iter()
            .map(|id| FrontRewrite {
                node_id: id,
                front: node.id,
            })
            .collect();
        self.insert(node);
        for rw in &rewrites {
            self.set_front(rw.node_id, rw.front);
        }
        Ok(rewrites)
    }

    /// Remove `id`, closing the gap: its successors now follow its front.
    pub fn splice_out(&mut self, id: NodeId) -> Result<(ChainNode, Vec<FrontRewrite>)> {
        let node = self.remove(id).ok_or_else(|| {
            ControlError::NotFound(format!("node {} is not in chain {}", id, self.key))
        })?;

        let rewrites: Vec<FrontRewrite> = self
            .successors_of(id)
            .into_iter()
            .map(|succ| FrontRewrite {
                node_id: succ,
                front: node.front,
            })
            .collect();
        for rw in &rewrites {
            self.set_front(rw.node_id, rw.front);
        }
        Ok((node, rewrites))
    }

    pub fn head(&self) -> Result<&ChainNode> {
        self.successors_of(0)
            .first()
            .and_then(|id| self.nodes.get(id))
            .ok_or_else(|| {
                ControlError::ChainHeadNotFound(format!("chain {} has no head", self.key))
            })
    }

    /// Nodes in execution order.
    ///
    /// Walks from the head following successors. The walk takes at most
    /// `len()` steps, so a corrupted chain yields a truncated list rather
    /// than looping. An empty chain reads as empty.
    pub fn ordered(&self) -> Result<Vec<&ChainNode>> {
        if self.is_empty() {
            return Ok(Vec::new());
        }

        let mut current = self.head()?;
        let mut out = Vec::with_capacity(self.len());
        out.push(current);
        while out.len() < self.len() {
            let Some(next) = self
                .successors_of(current.id)
                .first()
                .and_then(|id| self.nodes.get(id))
            else {
                break;
            };
            out.push(next);
            current = next;
        }
        Ok(out)
    }

    /// Every structural violation, empty for a well-formed chain.
    pub fn verify(&self) -> Vec<ChainViolation> {
        let mut violations = Vec::new();
        if self.is_empty() {
            return violations;
        }

        let heads = self.successors_of(0);
        match heads.len() {
            0 => violations.push(ChainViolation::NoHead),
            1 => {}
            _ => violations.push(ChainViolation::MultipleHeads {
                heads: heads.clone(),
            }),
        }

        for node in self.nodes.values() {
            if node.front == node.id {
                violations.push(ChainViolation::SelfReference { node_id: node.id });
            } else if node.front != 0 && !self.contains(node.front) {
                violations.push(ChainViolation::DanglingFront {
                    node_id: node.id,
                    front: node.front,
                });
            }
        }

        let mut forks: Vec<_> = self
            .successors
            .iter()
            .filter(|(front, succ)| **front != 0 && succ.len() > 1)
            .map(|(front, succ)| ChainViolation::Fork {
                front: *front,
                successors: succ.iter().copied().collect(),
            })
            .collect();
        forks.sort_by_key(|v| match v {
            ChainViolation::Fork { front, .. } => *front,
            _ => 0,
        });
        violations.extend(forks);

        let mut seen = BTreeSet::new();
        let mut stack = heads;
        while let Some(id) = stack.pop() {
            if seen.insert(id) {
                stack.extend(self.successors_of(id));
            }
        }
        let unreachable: Vec<NodeId> = self
            .nodes
            .keys()
            .filter(|id| !seen.contains(id))
            .copied()
            .collect();
        if !unreachable.is_empty() {
            violations.push(ChainViolation::Unreachable { nodes: unreachable });
        }

        violations
    }

    pub fn is_well_formed(&self) -> bool {
        self.verify().is_empty()
    }
}
