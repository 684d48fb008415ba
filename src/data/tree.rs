//! # Tree Topology
//!
//! Rooted tree with indexed nodes. Internal nodes have two or three
//! children; a three-child root is the usual encoding of an unrooted tree.
//! The topology is fixed once built, only branch lengths can change.

use std::collections::HashSet;

use super::NodeIdx;
use crate::error::{FelsenError, Result};

#[derive(Debug, Clone)]
pub struct Tree {
    parents: Vec<Option<NodeIdx>>,
    children: Vec<Vec<NodeIdx>>,
    /// Length of the branch above each node. The root entry is unused.
    branch_lengths: Vec<f64>,
    names: Vec<Option<String>>,
    root: NodeIdx,
    post_order: Vec<NodeIdx>,
    tips: Vec<NodeIdx>,
}

impl Tree {
    /// Build a tree from a parent table (`None` marks the root).
    ///
    /// Children are ordered by ascending node index.
    pub fn from_parents(parents: &[Option<usize>], branch_lengths: &[f64]) -> Result<Self> {
        let n = parents.len();
        if branch_lengths.len() != n {
            return Err(FelsenError::invalid_data(format!(
                "{} branch lengths for {} nodes",
                branch_lengths.len(),
                n
            )));
        }
        if n > u32::MAX as usize {
            return Err(FelsenError::invalid_data("too many nodes"));
        }

        let mut root = None;
        let mut children = vec![Vec::new(); n];
        for (node, parent) in parents.iter().enumerate() {
            match *parent {
                None => {
                    if root.replace(NodeIdx::from(node)).is_some() {
                        return Err(FelsenError::invalid_data("tree has more than one root"));
                    }
                }
                Some(p) if p >= n => {
                    return Err(FelsenError::invalid_data(format!(
                        "node {} has parent {} outside the tree",
                        node, p
                    )));
                }
                Some(p) if p == node => {
                    return Err(FelsenError::invalid_data(format!(
                        "node {} is its own parent",
                        node
                    )));
                }
                Some(p) => children[p].push(NodeIdx::from(node)),
            }
        }
        let root = root.ok_or_else(|| FelsenError::invalid_data("tree has no root"))?;

        for (node, kids) in children.iter().enumerate() {
            if kids.len() == 1 || kids.len() > 3 {
                return Err(FelsenError::invalid_data(format!(
                    "node {} has {} children; internal nodes need 2 or 3",
                    node,
                    kids.len()
                )));
            }
        }
        if children[root.as_usize()].is_empty() {
            return Err(FelsenError::invalid_data("root must be an internal node"));
        }

        let post_order = post_order_from(root, &children);
        if post_order.len() != n {
            return Err(FelsenError::invalid_data(
                "parent table contains a cycle or disconnected nodes",
            ));
        }

        let tips = (0..n)
            .filter(|&i| children[i].is_empty())
            .map(NodeIdx::from)
            .collect();

        Ok(Self {
            parents: parents.iter().map(|p| p.map(NodeIdx::from)).collect(),
            children,
            branch_lengths: branch_lengths.to_vec(),
            names: vec![None; n],
            root,
            post_order,
            tips,
        })
    }

    /// A ladder ("caterpillar") tree over `n_tips` tips, every branch of
    /// length `branch_length`. Tips are `0..n_tips`, the root is the last node.
    pub fn caterpillar(n_tips: usize, branch_length: f64) -> Result<Self> {
        if n_tips < 2 {
            return Err(FelsenError::invalid_data("a tree needs at least two tips"));
        }
        let n = 2 * n_tips - 1;
        let mut parents = vec![None; n];
        // Internal node n_tips + k joins tip k + 1 with the subtree below it.
        parents[0] = Some(n_tips);
        for k in 0..n_tips - 1 {
            parents[k + 1] = Some(n_tips + k);
            if k > 0 {
                parents[n_tips + k - 1] = Some(n_tips + k);
            }
        }
        Self::from_parents(&parents, &vec![branch_length; n])
    }

    /// Attach taxon names to nodes (usually the tips).
    ///
    /// Tip names must be unique, since each one selects an alignment row.
    pub fn with_names(mut self, names: Vec<Option<String>>) -> Result<Self> {
        if names.len() != self.n_nodes() {
            return Err(FelsenError::invalid_data(format!(
                "{} names for {} nodes",
                names.len(),
                self.n_nodes()
            )));
        }
        let mut seen = HashSet::new();
        for &tip in &self.tips {
            if let Some(name) = names[tip.as_usize()].as_deref() {
                if !seen.insert(name) {
                    return Err(FelsenError::invalid_data(format!(
                        "tip name {} appears more than once",
                        name
                    )));
                }
            }
        }
        self.names = names;
        Ok(self)
    }

    pub fn n_nodes(&self) -> usize {
        self.parents.len()
    }

    pub fn n_tips(&self) -> usize {
        self.tips.len()
    }

    pub fn root(&self) -> NodeIdx {
        self.root
    }

    pub fn parent(&self, node: NodeIdx) -> Option<NodeIdx> {
        self.parents[node.as_usize()]
    }

    pub fn children(&self, node: NodeIdx) -> &[NodeIdx] {
        &self.children[node.as_usize()]
    }

    pub fn is_tip(&self, node: NodeIdx) -> bool {
        self.children[node.as_usize()].is_empty()
    }

    pub fn is_root(&self, node: NodeIdx) -> bool {
        node == self.root
    }

    pub fn branch_length(&self, node: NodeIdx) -> f64 {
        self.branch_lengths[node.as_usize()]
    }

    pub fn branch_lengths(&self) -> &[f64] {
        &self.branch_lengths
    }

    /// Replace a branch length, returning the previous value.
    pub fn set_branch_length(&mut self, node: NodeIdx, length: f64) -> Result<f64> {
        let slot = self
            .branch_lengths
            .get_mut(node.as_usize())
            .ok_or_else(|| FelsenError::invalid_data(format!("no node {}", node.0)))?;
        Ok(std::mem::replace(slot, length))
    }

    /// Put back a length previously returned by `set_branch_length`.
    pub(crate) fn restore_branch_length(&mut self, node: NodeIdx, length: f64) {
        self.branch_lengths[node.as_usize()] = length;
    }

    pub fn name(&self, node: NodeIdx) -> Option<&str> {
        self.names[node.as_usize()].as_deref()
    }

    /// Tips in ascending node order.
    pub fn tips(&self) -> &[NodeIdx] {
        &self.tips
    }

    /// Every node, children before parents, root last.
    pub fn post_order(&self) -> &[NodeIdx] {
        &self.post_order
    }

    /// The node itself followed by each ancestor up to the root.
    pub fn path_to_root(&self, node: NodeIdx) -> impl Iterator<Item = NodeIdx> + '_ {
        std::iter::successors(Some(node), move |&n| self.parent(n))
    }
}

fn post_order_from(root: NodeIdx, children: &[Vec<NodeIdx>]) -> Vec<NodeIdx> {
    let mut order = Vec::with_capacity(children.len());
    let mut visited = vec![false; children.len()];
    // (node, children already expanded)
    let mut stack = vec![(root, false)];
    while let Some((node, expanded)) = stack.pop() {
        if expanded {
            order.push(node);
            continue;
        }
        if std::mem::replace(&mut visited[node.as_usize()], true) {
            continue;
        }
        stack.push((node, true));
        for &child in children[node.as_usize()].iter().rev() {
            stack.push((child, false));
        }
    }
    order
}
