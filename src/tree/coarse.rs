use std::cmp;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use super::concurrent_set::ConcurrentSet;
use crate::smr;

struct Node<K> {
    key: K,
    left: Link<K>,
    right: Link<K>,
}

type Link<K> = Option<Box<Node<K>>>;

/// An ordinary unbalanced BST behind a single mutex.
///
/// Every operation serializes on the one lock, which makes this the baseline
/// for the two concurrent trees and the oracle in differential tests. Nodes
/// are freed directly under the lock, so no reclamation service is involved.
pub struct CoarseGrainedTree<K> {
    root: Mutex<Link<K>>,
    len: AtomicUsize,
}

impl<K: Ord + Copy> CoarseGrainedTree<K> {
    pub fn new() -> Self {
        CoarseGrainedTree {
            root: Mutex::new(None),
            len: AtomicUsize::new(0),
        }
    }

    pub fn insert(&self, key: K) -> bool {
        let mut root = self.root.lock();
        let inserted = Self::insert_rec(&mut root, key);
        if inserted {
            self.len.fetch_add(1, Ordering::Relaxed);
        }
        inserted
    }

    fn insert_rec(link: &mut Link<K>, key: K) -> bool {
        match link {
            None => {
                *link = Some(Box::new(Node {
                    key,
                    left: None,
                    right: None,
                }));
                true
            }
            Some(node) => match key.cmp(&node.key) {
                cmp::Ordering::Less => Self::insert_rec(&mut node.left, key),
                cmp::Ordering::Greater => Self::insert_rec(&mut node.right, key),
                cmp::Ordering::Equal => false,
            },
        }
    }

    pub fn erase(&self, key: &K) {
        let mut root = self.root.lock();
        if Self::erase_rec(&mut root, key) {
            self.len.fetch_sub(1, Ordering::Relaxed);
        }
    }

    fn erase_rec(link: &mut Link<K>, key: &K) -> bool {
        match link {
            None => false,
            Some(node) if *key < node.key => Self::erase_rec(&mut node.left, key),
            Some(node) if *key > node.key => Self::erase_rec(&mut node.right, key),
            Some(_) => {
                Self::remove_root(link);
                true
            }
        }
    }

    /// Unlinks the node at `link`. A two-child victim is replaced by its
    /// in-order predecessor, the largest key of its left subtree.
    fn remove_root(link: &mut Link<K>) {
        let Some(mut node) = link.take() else { return };
        match (node.left.take(), node.right.take()) {
            (None, right) => *link = right,
            (left, None) => *link = left,
            (Some(left), Some(right)) => {
                let (rest, key) = Self::pop_max(left);
                node.left = rest;
                node.right = Some(right);
                node.key = key;
                *link = Some(node);
            }
        }
    }

    /// Removes the rightmost key of the subtree rooted at `node`, returning
    /// the remaining subtree and the key.
    fn pop_max(mut node: Box<Node<K>>) -> (Link<K>, K) {
        match node.right.take() {
            Some(right) => {
                let (rest, key) = Self::pop_max(right);
                node.right = rest;
                (Some(node), key)
            }
            None => (node.left.take(), node.key),
        }
    }

    pub fn find(&self, key: &K) -> bool {
        let root = self.root.lock();
        let mut cur = &*root;
        while let Some(node) = cur {
            match key.cmp(&node.key) {
                cmp::Ordering::Less => cur = &node.left,
                cmp::Ordering::Greater => cur = &node.right,
                cmp::Ordering::Equal => return true,
            }
        }
        false
    }
}

impl<K: Ord + Copy> Default for CoarseGrainedTree<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Ord + Copy + Send> ConcurrentSet<K> for CoarseGrainedTree<K> {
    fn new() -> Self {
        Self::new()
    }

    #[inline(always)]
    fn insert(&self, key: K) -> bool {
        self.insert(key)
    }

    #[inline(always)]
    fn erase(&self, key: &K) {
        self.erase(key)
    }

    #[inline(always)]
    fn find(&self, key: &K) -> bool {
        self.find(key)
    }

    fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    fn clear(&mut self) {
        *self.root.get_mut() = None;
        self.len.store(0, Ordering::Relaxed);
    }

    fn set_thread_count(&self, _n: usize) {}

    fn register_thread(&self, tid: usize) {
        // No per-thread state of its own; keep the id binding uniform with
        // the concurrent trees.
        smr::register_thread(tid);
    }
}

#[cfg(test)]
mod tests {
    use super::CoarseGrainedTree;
    use crate::tree::concurrent_set::tests as suite;

    #[test]
    fn matches_model() {
        suite::matches_model::<CoarseGrainedTree<i32>>();
    }

    #[test]
    fn round_trip() {
        suite::round_trip::<CoarseGrainedTree<i32>>();
    }

    #[test]
    fn extreme_keys() {
        suite::extreme_keys::<CoarseGrainedTree<i32>>();
    }

    #[test]
    fn small_scenarios() {
        suite::small_scenarios::<CoarseGrainedTree<i32>>();
    }

    #[test]
    fn disjoint_ranges() {
        suite::disjoint_ranges::<CoarseGrainedTree<i32>>(4, 10_000);
    }

    #[test]
    fn disjoint_inserts() {
        suite::disjoint_inserts::<CoarseGrainedTree<i32>>(2, 1_000);
    }

    #[test]
    fn overlapping_ranges() {
        suite::overlapping_ranges::<CoarseGrainedTree<i32>>(8, 512);
    }

    #[test]
    fn read_while_write() {
        suite::read_while_write::<CoarseGrainedTree<i32>>(3);
    }
}
