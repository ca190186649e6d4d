use std::cmp;
use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

use bitflags::bitflags;

use super::concurrent_set::ConcurrentSet;
use super::Key;
use crate::smr::{Collector, Guard};

bitflags! {
    /// A removal is registered by marking edges: the (parent, leaf) edge is
    /// _flagged_ (the leaf below is logically deleted) and the
    /// (parent, sibling) edge is _tagged_ (frozen while the cleanup swings
    /// the sibling up under the ancestor).
    struct Marks: usize {
        const FLAG = 1 << 0;
        const TAG = 1 << 1;
    }
}

impl Marks {
    fn new(flag: bool, tag: bool) -> Self {
        (if flag { Marks::FLAG } else { Marks::empty() })
            | (if tag { Marks::TAG } else { Marks::empty() })
    }

    fn flag(self) -> bool {
        !(self & Marks::FLAG).is_empty()
    }

    fn tag(self) -> bool {
        !(self & Marks::TAG).is_empty()
    }
}

/// Snapshot of a child word: a node address plus its two mark bits.
struct Marked<K> {
    bits: usize,
    _marker: PhantomData<*mut Node<K>>,
}

impl<K> Clone for Marked<K> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K> Copy for Marked<K> {}

impl<K> PartialEq for Marked<K> {
    fn eq(&self, other: &Self) -> bool {
        self.bits == other.bits
    }
}

impl<K> Eq for Marked<K> {}

impl<K> Marked<K> {
    fn new(ptr: *mut Node<K>, marks: Marks) -> Self {
        debug_assert_eq!(ptr as usize & Marks::all().bits(), 0);
        Marked {
            bits: ptr as usize | marks.bits(),
            _marker: PhantomData,
        }
    }

    const fn from_bits(bits: usize) -> Self {
        Marked {
            bits,
            _marker: PhantomData,
        }
    }

    fn ptr(self) -> *mut Node<K> {
        (self.bits & !Marks::all().bits()) as *mut Node<K>
    }

    fn is_null(self) -> bool {
        self.ptr().is_null()
    }

    fn marks(self) -> Marks {
        Marks::from_bits_truncate(self.bits)
    }

    fn flagged(self) -> bool {
        self.marks().flag()
    }

    fn tagged(self) -> bool {
        self.marks().tag()
    }
}

/// An atomic child word. Nodes are boxed, so the two low bits of the address
/// are always free for the marks.
struct AtomicEdge<K> {
    word: AtomicUsize,
    _marker: PhantomData<*mut Node<K>>,
}

impl<K> AtomicEdge<K> {
    fn null() -> Self {
        AtomicEdge {
            word: AtomicUsize::new(0),
            _marker: PhantomData,
        }
    }

    fn to(ptr: *mut Node<K>) -> Self {
        AtomicEdge {
            word: AtomicUsize::new(Marked::new(ptr, Marks::empty()).bits),
            _marker: PhantomData,
        }
    }

    fn load(&self, order: Ordering) -> Marked<K> {
        Marked::from_bits(self.word.load(order))
    }

    fn compare_exchange(
        &self,
        current: Marked<K>,
        new: Marked<K>,
        success: Ordering,
        failure: Ordering,
    ) -> Result<Marked<K>, Marked<K>> {
        self.word
            .compare_exchange(current.bits, new.bits, success, failure)
            .map(Marked::from_bits)
            .map_err(Marked::from_bits)
    }

    fn fetch_or(&self, marks: Marks, order: Ordering) -> Marked<K> {
        Marked::from_bits(self.word.fetch_or(marks.bits(), order))
    }
}

/// Internal nodes carry routing keys; real keys live only in leaves. Both
/// are immutable once linked except for the child words.
struct Node<K> {
    key: Key<K>,
    left: AtomicEdge<K>,
    right: AtomicEdge<K>,
}

impl<K> Node<K> {
    fn leaf(key: Key<K>) -> *mut Node<K> {
        Box::into_raw(Box::new(Node {
            key,
            left: AtomicEdge::null(),
            right: AtomicEdge::null(),
        }))
    }

    fn internal(key: Key<K>, left: *mut Node<K>, right: *mut Node<K>) -> *mut Node<K> {
        Box::into_raw(Box::new(Node {
            key,
            left: AtomicEdge::to(left),
            right: AtomicEdge::to(right),
        }))
    }
}

/// The path tail captured by a seek. The edge from `ancestor` toward
/// `successor` is the last unfrozen edge above `leaf`; cleanup swings it.
struct SeekRecord<K> {
    ancestor: *mut Node<K>,
    successor: *mut Node<K>,
    parent: *mut Node<K>,
    leaf: *mut Node<K>,
}

/// A lock-free external BST.
///
/// Three sentinel keys above every user key anchor the top of the tree:
///
/// ```text
///          r (Inf2)
///         /        \
///     s (Inf1)    inf2
///     /      \
///  inf0      inf1
/// ```
///
/// so a seek always finds a real ancestor, successor, parent, and leaf.
/// Writers change only child words, by CAS; a failed writer that finds the
/// edge it wanted marked helps complete the removal in its way before
/// retrying, which is what makes the whole structure lock-free.
pub struct LockFreeTree<K> {
    root: *mut Node<K>,
    collector: Collector,
    len: AtomicUsize,
}

unsafe impl<K: Send> Send for LockFreeTree<K> {}
unsafe impl<K: Send + Sync> Sync for LockFreeTree<K> {}

impl<K: Ord + Copy> LockFreeTree<K> {
    pub fn new() -> Self {
        LockFreeTree {
            root: Self::scaffold(),
            collector: Collector::new(),
            len: AtomicUsize::new(0),
        }
    }

    fn scaffold() -> *mut Node<K> {
        let inf0 = Node::leaf(Key::Inf0);
        let inf1 = Node::leaf(Key::Inf1);
        let inf2 = Node::leaf(Key::Inf2);
        let s = Node::internal(Key::Inf1, inf0, inf1);
        Node::internal(Key::Inf2, s, inf2)
    }

    /// The child edge of `node` on the side `key` belongs.
    unsafe fn edge_toward<'a>(node: *mut Node<K>, key: &K) -> &'a AtomicEdge<K> {
        if (*node).key.cmp(key) == cmp::Ordering::Greater {
            &(*node).left
        } else {
            &(*node).right
        }
    }

    /// Walks toward `key`, keeping the last two nodes of the path and the
    /// deepest unfrozen edge above them. Ancestor and successor stop
    /// advancing across a tagged edge; parent and leaf always advance.
    unsafe fn seek(&self, key: &K) -> SeekRecord<K> {
        let r = self.root;
        let s = (*r).left.load(Ordering::Acquire).ptr();
        let leaf_word = (*s).left.load(Ordering::Acquire);
        let mut rec = SeekRecord {
            ancestor: r,
            successor: s,
            parent: s,
            leaf: leaf_word.ptr(),
        };
        let mut parent_tagged = leaf_word.tagged();
        let mut cur = Self::edge_toward(rec.leaf, key).load(Ordering::Acquire);
        while !cur.is_null() {
            if !parent_tagged {
                rec.ancestor = rec.parent;
                rec.successor = rec.leaf;
            }
            rec.parent = rec.leaf;
            rec.leaf = cur.ptr();
            parent_tagged = cur.tagged();
            cur = Self::edge_toward(rec.leaf, key).load(Ordering::Acquire);
        }
        rec
    }

    pub fn find(&self, key: &K) -> bool {
        let _guard = self.collector.pin();
        unsafe {
            let s = (*self.root).left.load(Ordering::Acquire).ptr();
            let mut leaf = (*s).left.load(Ordering::Acquire).ptr();
            let mut cur = Self::edge_toward(leaf, key).load(Ordering::Acquire);
            while !cur.is_null() {
                leaf = cur.ptr();
                cur = Self::edge_toward(leaf, key).load(Ordering::Acquire);
            }
            (*leaf).key == *key
        }
    }

    pub fn insert(&self, key: K) -> bool {
        let guard = self.collector.pin();
        unsafe {
            loop {
                let rec = self.seek(&key);
                let leaf = rec.leaf;
                if (*leaf).key == key {
                    return false;
                }
                // Replace the leaf with a routing node over the old leaf and
                // the new one, keyed by the larger of the two.
                let new_leaf = Node::leaf(Key::Fin(key));
                let new_internal = if (*leaf).key.cmp(&key) == cmp::Ordering::Greater {
                    Node::internal((*leaf).key, new_leaf, leaf)
                } else {
                    Node::internal(Key::Fin(key), leaf, new_leaf)
                };
                let edge = Self::edge_toward(rec.parent, &key);
                match edge.compare_exchange(
                    Marked::new(leaf, Marks::empty()),
                    Marked::new(new_internal, Marks::empty()),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => {
                        self.len.fetch_add(1, Ordering::Relaxed);
                        return true;
                    }
                    Err(cur) => {
                        // Never published; discard and retry. If the edge
                        // still holds our leaf behind a mark, the marker's
                        // removal is in our way: help finish it first.
                        drop(Box::from_raw(new_internal));
                        drop(Box::from_raw(new_leaf));
                        if cur.ptr() == leaf {
                            self.cleanup(&guard, &key, &rec);
                        }
                    }
                }
            }
        }
    }

    pub fn erase(&self, key: &K) {
        let guard = self.collector.pin();
        unsafe {
            // Injection: flag the edge above the leaf, claiming the removal.
            let mut injected: *mut Node<K> = ptr::null_mut();
            loop {
                let rec = self.seek(key);
                if injected.is_null() {
                    let leaf = rec.leaf;
                    if (*leaf).key != *key {
                        return;
                    }
                    let edge = Self::edge_toward(rec.parent, key);
                    match edge.compare_exchange(
                        Marked::new(leaf, Marks::empty()),
                        Marked::new(leaf, Marks::FLAG),
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => {
                            injected = leaf;
                            if self.cleanup(&guard, key, &rec) {
                                self.len.fetch_sub(1, Ordering::Relaxed);
                                return;
                            }
                        }
                        Err(cur) => {
                            // Someone else marked this edge; help them out
                            // of the way, then retry our own injection.
                            if cur.ptr() == leaf {
                                self.cleanup(&guard, key, &rec);
                            }
                        }
                    }
                } else {
                    // Cleanup: the flag is ours; keep unlinking until the
                    // leaf is out, or discover a helper already did it.
                    if rec.leaf != injected {
                        self.len.fetch_sub(1, Ordering::Relaxed);
                        return;
                    }
                    if self.cleanup(&guard, key, &rec) {
                        self.len.fetch_sub(1, Ordering::Relaxed);
                        return;
                    }
                }
            }
        }
    }

    /// Physically removes the flagged leaf and its parent: freeze the
    /// sibling edge with a tag, then swing the ancestor→successor edge down
    /// to the sibling, preserving a flag the sibling edge may carry and
    /// clearing the tag. Returns false if the ancestor edge moved on, in
    /// which case the caller reseeks and retries.
    unsafe fn cleanup(&self, guard: &Guard<'_>, key: &K, rec: &SeekRecord<K>) -> bool {
        let parent = rec.parent;
        let successor_edge = Self::edge_toward(rec.ancestor, key);
        let (child_edge, sibling_edge) = if (*parent).key.cmp(key) == cmp::Ordering::Greater {
            (&(*parent).left, &(*parent).right)
        } else {
            (&(*parent).right, &(*parent).left)
        };
        let mut sibling_edge = sibling_edge;
        if !child_edge.load(Ordering::Acquire).flagged() {
            // The removal this record described has already been unlinked;
            // retarget so the CAS below fails without effect.
            sibling_edge = child_edge;
        }
        sibling_edge.fetch_or(Marks::TAG, Ordering::AcqRel);
        let sibling = sibling_edge.load(Ordering::Acquire);
        let replacement = Marked::new(sibling.ptr(), Marks::new(sibling.flagged(), false));
        if successor_edge
            .compare_exchange(
                Marked::new(rec.successor, Marks::empty()),
                replacement,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            guard.retire(parent);
            guard.retire(rec.leaf);
            true
        } else {
            false
        }
    }

}

impl<K: Ord + Copy> Default for LockFreeTree<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K> Drop for LockFreeTree<K> {
    fn drop(&mut self) {
        unsafe {
            Self::free_subtree(self.root);
        }
    }
}

impl<K> LockFreeTree<K> {
    unsafe fn free_subtree(node: *mut Node<K>) {
        if node.is_null() {
            return;
        }
        let node = Box::from_raw(node);
        Self::free_subtree(node.left.load(Ordering::Relaxed).ptr());
        Self::free_subtree(node.right.load(Ordering::Relaxed).ptr());
    }
}

impl<K: Ord + Copy + Send + Sync> ConcurrentSet<K> for LockFreeTree<K> {
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
        unsafe {
            Self::free_subtree(self.root);
        }
        self.collector.reclaim_all();
        self.root = Self::scaffold();
        self.len.store(0, Ordering::Relaxed);
    }

    fn set_thread_count(&self, n: usize) {
        self.collector.set_thread_count(n);
    }

    fn register_thread(&self, tid: usize) {
        self.collector.register(tid);
    }
}
