//! Unbalanced binary search tree keeper store
//!
//! Nodes live in an arena (`Vec<Node>`) and link to each other by index.
//! Removing a node moves the last arena slot into the hole and relinks it, so
//! the arena stays dense and serializes as a flat list.
//!
//! Condition search walks the tree and skips a subtree whenever the node key
//! proves no key in it can match:
//!
//! | condition  | node key vs bound | visit        |
//! |------------|-------------------|--------------|
//! | EQ         | equal             | none         |
//! | EQ         | greater / less    | left / right |
//! | GT, GTE    | greater           | both         |
//! | GT, GTE    | less or equal     | right        |
//! | LT, LTE    | less              | both         |
//! | LT, LTE    | greater or equal  | left         |
//! | NOT, LIKE  | any               | both         |

use serde::{Deserialize, Serialize};

use hashbrown::HashSet;

use super::{fill_to_full, is_full, DeleteResult, KeeperValue, OrderedStore};
use crate::condition::{ConditionEvaluator, SimpleCondition, SimpleKind};
use crate::value::IndexKey;

/// Subtrees of a node that can still hold matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Left,
    Right,
    Both,
    None,
}

impl Direction {
    fn left(self) -> bool {
        matches!(self, Direction::Left | Direction::Both)
    }

    fn right(self) -> bool {
        matches!(self, Direction::Right | Direction::Both)
    }
}

/// Which subtrees of a node keyed `key` may contain keys matching `condition`.
pub fn direction<U: IndexKey>(key: &U, condition: &SimpleCondition<U>) -> Direction {
    let Some(bound) = condition.value() else {
        // only EQ/NOT take a null bound; no tree key equals null
        return match condition.kind() {
            SimpleKind::Not => Direction::Both,
            _ => Direction::None,
        };
    };
    match condition.kind() {
        SimpleKind::Like | SimpleKind::Not => Direction::Both,
        SimpleKind::Eq => {
            if key == bound {
                Direction::None
            } else if key > bound {
                Direction::Left
            } else {
                Direction::Right
            }
        }
        SimpleKind::Gt | SimpleKind::Gte => {
            if key > bound {
                Direction::Both
            } else {
                Direction::Right
            }
        }
        SimpleKind::Lt | SimpleKind::Lte => {
            if key < bound {
                Direction::Both
            } else {
                Direction::Left
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound(serialize = "U: Serialize, V: Serialize", deserialize = "U: IndexKey, V: KeeperValue"))]
struct Node<U, V: KeeperValue> {
    key: U,
    values: HashSet<V>,
    parent: Option<usize>,
    left: Option<usize>,
    right: Option<usize>,
}

/// Binary search tree from key to value set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound(serialize = "U: Serialize, V: Serialize", deserialize = "U: IndexKey, V: KeeperValue"))]
pub struct BinaryTree<U, V: KeeperValue> {
    nodes: Vec<Node<U, V>>,
    root: Option<usize>,
}

impl<U, V: KeeperValue> Default for BinaryTree<U, V> {
    fn default() -> Self {
        Self { nodes: Vec::new(), root: None }
    }
}

impl<U: IndexKey, V: KeeperValue> BinaryTree<U, V> {
    /// `(node with key, last node visited)`
    fn find(&self, key: &U) -> (Option<usize>, Option<usize>) {
        let mut parent = None;
        let mut current = self.root;
        while let Some(i) = current {
            let node = &self.nodes[i];
            if *key == node.key {
                return (Some(i), parent);
            }
            parent = Some(i);
            current = if *key < node.key { node.left } else { node.right };
        }
        (None, parent)
    }

    fn minimum(&self, mut i: usize) -> usize {
        while let Some(left) = self.nodes[i].left {
            i = left;
        }
        i
    }

    /// Put `to` where `from` hangs in the tree.
    fn transplant(&mut self, from: usize, to: Option<usize>) {
        let parent = self.nodes[from].parent;
        match parent {
            None => self.root = to,
            Some(p) => {
                if self.nodes[p].left == Some(from) {
                    self.nodes[p].left = to;
                } else {
                    self.nodes[p].right = to;
                }
            }
        }
        if let Some(t) = to {
            self.nodes[t].parent = parent;
        }
    }

    /// Drop the unlinked node `i`, moving the last slot into its place.
    fn remove_slot(&mut self, i: usize) {
        let last = self.nodes.len() - 1;
        self.nodes.swap_remove(i);
        if i == last {
            return;
        }
        let moved = Some(i);
        match self.nodes[i].parent {
            None => self.root = moved,
            Some(p) => {
                if self.nodes[p].left == Some(last) {
                    self.nodes[p].left = moved;
                } else {
                    self.nodes[p].right = moved;
                }
            }
        }
        for child in [self.nodes[i].left, self.nodes[i].right].into_iter().flatten() {
            self.nodes[child].parent = moved;
        }
    }

    fn unlink(&mut self, z: usize) {
        let (left, right) = (self.nodes[z].left, self.nodes[z].right);
        match (left, right) {
            (None, _) => self.transplant(z, right),
            (_, None) => self.transplant(z, left),
            (Some(l), Some(r)) => {
                let y = self.minimum(r);
                if self.nodes[y].parent != Some(z) {
                    let y_right = self.nodes[y].right;
                    self.transplant(y, y_right);
                    self.nodes[y].right = Some(r);
                    self.nodes[r].parent = Some(y);
                }
                self.transplant(z, Some(y));
                self.nodes[y].left = Some(l);
                self.nodes[l].parent = Some(y);
            }
        }
        self.remove_slot(z);
    }

    /// Keys in ascending order.
    fn in_order(&self) -> Vec<usize> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut stack = Vec::new();
        let mut current = self.root;
        while current.is_some() || !stack.is_empty() {
            while let Some(i) = current {
                stack.push(i);
                current = self.nodes[i].left;
            }
            if let Some(i) = stack.pop() {
                order.push(i);
                current = self.nodes[i].right;
            }
        }
        order
    }

    /// Longest root-to-leaf path.
    pub fn depth(&self) -> usize {
        let mut deepest = 0;
        let mut stack: Vec<(usize, usize)> = self.root.map(|r| (r, 1)).into_iter().collect();
        while let Some((i, depth)) = stack.pop() {
            deepest = deepest.max(depth);
            for child in [self.nodes[i].left, self.nodes[i].right].into_iter().flatten() {
                stack.push((child, depth + 1));
            }
        }
        deepest
    }
}

impl<U: IndexKey, V: KeeperValue> OrderedStore<U, V> for BinaryTree<U, V> {
    fn insert(&mut self, key: U, value: V) -> bool {
        let (found, parent) = self.find(&key);
        if let Some(i) = found {
            return self.nodes[i].values.insert(value);
        }
        let index = self.nodes.len();
        let mut values = HashSet::new();
        values.insert(value);
        match parent {
            None => self.root = Some(index),
            Some(p) => {
                if key > self.nodes[p].key {
                    self.nodes[p].right = Some(index);
                } else {
                    self.nodes[p].left = Some(index);
                }
            }
        }
        self.nodes.push(Node { key, values, parent, left: None, right: None });
        true
    }

    fn delete(&mut self, key: &U, value: &V) -> DeleteResult {
        let Some(i) = self.find(key).0 else {
            return DeleteResult::NOT;
        };
        if !self.nodes[i].values.remove(value) {
            return DeleteResult::NOT;
        }
        if !self.nodes[i].values.is_empty() {
            return DeleteResult::NOT_FULLY;
        }
        self.unlink(i);
        DeleteResult::FULLY
    }

    fn get(&self, key: &U) -> HashSet<V> {
        match self.find(key).0 {
            Some(i) => self.nodes[i].values.clone(),
            None => HashSet::new(),
        }
    }

    fn search(&self, evaluator: &dyn ConditionEvaluator<U>, condition: &SimpleCondition<U>, out: &mut HashSet<V>, limit: Option<usize>) {
        let mut stack: Vec<usize> = self.root.into_iter().collect();
        while let Some(i) = stack.pop() {
            if is_full(out, limit) {
                return;
            }
            let node = &self.nodes[i];
            if evaluator.check(Some(&node.key), condition) && fill_to_full(out, limit, node.values.iter()) {
                return;
            }
            let direction = direction(&node.key, condition);
            if direction.right() {
                stack.extend(node.right);
            }
            if direction.left() {
                stack.extend(node.left);
            }
        }
    }

    fn key_count(&self) -> usize {
        self.nodes.len()
    }

    fn entries(&self) -> Vec<(U, HashSet<V>)> {
        self.in_order()
            .into_iter()
            .map(|i| (self.nodes[i].key.clone(), self.nodes[i].values.clone()))
            .collect()
    }
}
