//! Quinary Merkle accumulators.
//!
//! The on-chain queues batch leaves into subtrees and merge them into a
//! single root of fixed depth, with empty slots taking the per-level zero
//! value. The coordinator needs the same roots plus inclusion paths, so this
//! tree is kept sparse: only non-zero nodes are stored and every missing
//! node is read from the `zeros` ladder.

use std::collections::HashMap;

use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};

use crate::{hash5, serde_fr_vec, Fr};

pub const TREE_ARITY: usize = 5;

#[derive(Clone, Debug)]
pub struct QuinaryTree {
    depth: usize,
    /// `zeros[l]` is the value of an empty node at level `l` (0 = leaves).
    zeros: Vec<Fr>,
    nodes: HashMap<(usize, u64), Fr>,
    next_index: u64,
}

/// Siblings and positions from a leaf up to (but excluding) the root.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerklePath {
    pub indices: Vec<usize>,
    #[serde(with = "nested_fr")]
    pub siblings: Vec<Vec<Fr>>,
}

impl QuinaryTree {
    pub fn new(depth: usize, zero_leaf: Fr) -> Self {
        let mut zeros = Vec::with_capacity(depth + 1);
        zeros.push(zero_leaf);
        for level in 0..depth {
            let zero = zeros[level];
            zeros.push(hash5([zero; TREE_ARITY]));
        }
        Self {
            depth,
            zeros,
            nodes: HashMap::new(),
            next_index: 0,
        }
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn capacity(&self) -> u64 {
        (TREE_ARITY as u64).saturating_pow(self.depth as u32)
    }

    /// Number of leaves appended so far.
    pub fn len(&self) -> u64 {
        self.next_index
    }

    pub fn is_empty(&self) -> bool {
        self.next_index == 0
    }

    pub fn zero(&self, level: usize) -> Fr {
        self.zeros[level]
    }

    pub fn root(&self) -> Fr {
        self.node(self.depth, 0)
    }

    pub fn leaf(&self, index: u64) -> Fr {
        self.node(0, index)
    }

    /// Append a leaf at the next free index and return that index.
    pub fn insert(&mut self, leaf: Fr) -> Result<u64> {
        let index = self.next_index;
        ensure!(
            index < self.capacity(),
            "tree of depth {} is full ({} leaves)",
            self.depth,
            self.capacity()
        );
        self.write_leaf(index, leaf);
        self.next_index += 1;
        Ok(index)
    }

    /// Overwrite an already inserted leaf.
    pub fn update(&mut self, index: u64, leaf: Fr) -> Result<()> {
        ensure!(
            index < self.next_index,
            "cannot update leaf {} of a tree with {} leaves",
            index,
            self.next_index
        );
        self.write_leaf(index, leaf);
        Ok(())
    }

    pub fn path(&self, index: u64) -> Result<MerklePath> {
        ensure!(
            index < self.capacity(),
            "leaf index {} out of range for depth {}",
            index,
            self.depth
        );
        let mut indices = Vec::with_capacity(self.depth);
        let mut siblings = Vec::with_capacity(self.depth);
        let mut position = index;
        for level in 0..self.depth {
            let offset = (position % TREE_ARITY as u64) as usize;
            let first = position - offset as u64;
            let level_siblings = (0..TREE_ARITY as u64)
                .filter(|k| *k as usize != offset)
                .map(|k| self.node(level, first + k))
                .collect();
            indices.push(offset);
            siblings.push(level_siblings);
            position /= TREE_ARITY as u64;
        }
        Ok(MerklePath { indices, siblings })
    }

    fn node(&self, level: usize, index: u64) -> Fr {
        self.nodes
            .get(&(level, index))
            .copied()
            .unwrap_or(self.zeros[level])
    }

    fn write_leaf(&mut self, index: u64, leaf: Fr) {
        self.nodes.insert((0, index), leaf);
        let mut position = index;
        for level in 0..self.depth {
            let parent = position / TREE_ARITY as u64;
            let first = parent * TREE_ARITY as u64;
            let mut children = [self.zeros[level]; TREE_ARITY];
            for (k, child) in children.iter_mut().enumerate() {
                *child = self.node(level, first + k as u64);
            }
            self.nodes.insert((level + 1, parent), hash5(children));
            position = parent;
        }
    }
}

impl MerklePath {
    /// Recompute the root implied by `leaf` and this path.
    pub fn compute_root(&self, leaf: Fr) -> Fr {
        let mut acc = leaf;
        for (offset, siblings) in self.indices.iter().zip(self.siblings.iter()) {
            let mut children = [acc; TREE_ARITY];
            let mut rest = siblings.iter();
            for (k, child) in children.iter_mut().enumerate() {
                if k != *offset {
                    *child = rest.next().copied().unwrap_or(acc);
                }
            }
            acc = hash5(children);
        }
        acc
    }
}

mod nested_fr {
    use super::serde_fr_vec;
    use crate::Fr;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Serialize, Deserialize)]
    struct Level(#[serde(with = "serde_fr_vec")] Vec<Fr>);

    pub fn serialize<S: Serializer>(values: &[Vec<Fr>], serializer: S) -> Result<S::Ok, S::Error> {
        let levels: Vec<Level> = values.iter().cloned().map(Level).collect();
        levels.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<Vec<Fr>>, D::Error> {
        let levels = Vec::<Level>::deserialize(deserializer)?;
        Ok(levels.into_iter().map(|level| level.0).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use halo2curves_axiom::ff::Field;

    #[test]
    fn empty_tree_root_is_zero_ladder() {
        let tree = QuinaryTree::new(2, Fr::ZERO);
        let level1 = hash5([Fr::ZERO; 5]);
        assert_eq!(tree.root(), hash5([level1; 5]));
        assert!(tree.is_empty());
    }

    #[test]
    fn insert_matches_manual_hashing() {
        let mut tree = QuinaryTree::new(1, Fr::ZERO);
        tree.insert(Fr::from(1u64)).unwrap();
        tree.insert(Fr::from(2u64)).unwrap();
        let expected = hash5([
            Fr::from(1u64),
            Fr::from(2u64),
            Fr::ZERO,
            Fr::ZERO,
            Fr::ZERO,
        ]);
        assert_eq!(tree.root(), expected);
        assert_eq!(tree.len(), 2);
    }

    #[test]
    fn rejects_insert_past_capacity() {
        let mut tree = QuinaryTree::new(1, Fr::ZERO);
        for i in 0..5u64 {
            tree.insert(Fr::from(i + 1)).unwrap();
        }
        assert!(tree.insert(Fr::from(99u64)).is_err());
    }

    #[test]
    fn paths_recompute_root_after_updates() {
        let mut tree = QuinaryTree::new(3, Fr::from(7u64));
        for i in 0..17u64 {
            tree.insert(Fr::from(100 + i)).unwrap();
        }
        tree.update(11, Fr::from(5u64)).unwrap();
        for index in [0u64, 4, 11, 16, 40] {
            let path = tree.path(index).unwrap();
            assert_eq!(path.compute_root(tree.leaf(index)), tree.root());
        }
        assert!(tree.update(17, Fr::ONE).is_err());
    }
}
