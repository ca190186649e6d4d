use std::cmp;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};

use parking_lot::lock_api::RawMutex as _;
use parking_lot::RawMutex;

use super::concurrent_set::ConcurrentSet;
use super::Key;
use crate::smr::{Collector, Guard};

#[derive(Clone, Copy, PartialEq, Eq)]
enum Dir {
    Left = 0,
    Right = 1,
}

impl Dir {
    fn flip(self) -> Dir {
        match self {
            Dir::Left => Dir::Right,
            Dir::Right => Dir::Left,
        }
    }
}

/// A tree node. `key` is immutable after creation; the child pointers, the
/// retired mark, and the back link are written only while holding `lock`.
/// Readers traverse the child pointers without the lock and take it solely
/// to validate the edge they are about to act on.
struct Node<K> {
    lock: RawMutex,
    key: Key<K>,
    children: [AtomicPtr<Node<K>>; 2],
    back: AtomicPtr<Node<K>>,
    retired: AtomicBool,
}

impl<K> Node<K> {
    fn alloc(key: Key<K>) -> *mut Node<K> {
        Box::into_raw(Box::new(Node {
            lock: RawMutex::INIT,
            key,
            children: [
                AtomicPtr::new(ptr::null_mut()),
                AtomicPtr::new(ptr::null_mut()),
            ],
            back: AtomicPtr::new(ptr::null_mut()),
            retired: AtomicBool::new(false),
        }))
    }

    /// Allocates a node that is already locked. Nothing else can contend
    /// before publication.
    fn alloc_locked(key: Key<K>) -> *mut Node<K> {
        let node = Self::alloc(key);
        unsafe { (*node).lock.lock() };
        node
    }

    fn child(&self, dir: Dir) -> &AtomicPtr<Node<K>> {
        &self.children[dir as usize]
    }
}

/// The result of a locate: `node` is locked and validated, `child` is the
/// value of `node.child(dir)` observed under that lock: null, or the node
/// holding the sought key.
struct Latch<K> {
    node: *mut Node<K>,
    dir: Dir,
    child: *mut Node<K>,
}

/// A BST with one mutex per node.
///
/// A permanent root with an infinite key anchors the tree; every user key
/// lives in its left subtree. Writers hold at most the two locks around the
/// edge they modify; deletions of an interior node decompose into
/// copy-on-rotate steps that bubble the victim down until it has no left
/// child, then splice it out. A removed node keeps its old child pointers
/// (a consistent, stale view) and gains a `back` link, so a reader that
/// latched it re-enters the live tree instead of restarting from scratch.
pub struct FineGrainedTree<K> {
    root: *mut Node<K>,
    collector: Collector,
    len: AtomicUsize,
}

unsafe impl<K: Send> Send for FineGrainedTree<K> {}
unsafe impl<K: Send + Sync> Sync for FineGrainedTree<K> {}

impl<K: Ord + Copy> FineGrainedTree<K> {
    pub fn new() -> Self {
        FineGrainedTree {
            root: Node::alloc(Key::Inf2),
            collector: Collector::new(),
            len: AtomicUsize::new(0),
        }
    }

    /// Descends toward `key` and returns the latched parent of its slot.
    ///
    /// The lock is taken only at the candidate node, then the decision is
    /// revalidated: a node retired in the meantime redirects the search
    /// through its back link, and a changed child pointer re-examines the
    /// same node. Skipping the recheck would let the caller act on an edge
    /// that is no longer in the tree.
    unsafe fn locate(&self, key: &K) -> Latch<K> {
        let mut cur = self.root;
        loop {
            let node = &*cur;
            let dir = if node.key.cmp(key) == cmp::Ordering::Greater {
                Dir::Left
            } else {
                Dir::Right
            };
            let child = node.child(dir).load(Ordering::Acquire);
            if !child.is_null() && (*child).key != *key {
                cur = child;
                continue;
            }
            node.lock.lock();
            if node.retired.load(Ordering::Acquire) {
                let back = node.back.load(Ordering::Acquire);
                node.lock.unlock();
                cur = back;
                continue;
            }
            if node.child(dir).load(Ordering::Acquire) != child {
                node.lock.unlock();
                continue;
            }
            return Latch {
                node: cur,
                dir,
                child,
            };
        }
    }

    pub fn insert(&self, key: K) -> bool {
        let _guard = self.collector.pin();
        unsafe {
            let latch = self.locate(&key);
            let inserted = if latch.child.is_null() {
                let fresh = Node::alloc(Key::Fin(key));
                (*latch.node).child(latch.dir).store(fresh, Ordering::Release);
                true
            } else {
                false
            };
            (*latch.node).lock.unlock();
            if inserted {
                self.len.fetch_add(1, Ordering::Relaxed);
            }
            inserted
        }
    }

    pub fn find(&self, key: &K) -> bool {
        let _guard = self.collector.pin();
        unsafe {
            let latch = self.locate(key);
            (*latch.node).lock.unlock();
            !latch.child.is_null()
        }
    }

    pub fn erase(&self, key: &K) {
        let guard = self.collector.pin();
        unsafe {
            let latch = self.locate(key);
            if latch.child.is_null() {
                (*latch.node).lock.unlock();
                return;
            }
            // The parent's lock pins this edge, so the victim cannot retire
            // underneath us; once locked it stays locked until unlinked.
            (*latch.child).lock.lock();
            self.delete_rotate(&guard, latch.node, latch.dir);
            self.len.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Removes the victim `f.child(dir)`. Both `f` and the victim are locked
    /// on entry; every lock has been released when this returns, and the
    /// victim is unlinked and retired.
    unsafe fn delete_rotate(&self, guard: &Guard<'_>, f: *mut Node<K>, dir: Dir) {
        let s = (*f).child(dir).load(Ordering::Acquire);
        if (*s).child(Dir::Left).load(Ordering::Acquire).is_null() {
            // Easy case: splice the right subtree into the parent edge.
            let right = (*s).child(Dir::Right).load(Ordering::Acquire);
            (*f).child(dir).store(right, Ordering::Release);
            (*s).back.store(f, Ordering::Release);
            (*s).retired.store(true, Ordering::Release);
            (*f).lock.unlock();
            (*s).lock.unlock();
            guard.retire(s);
        } else {
            // Rotate the victim's left child above it; the victim reappears
            // as the right child of the replacement, one step closer to the
            // easy case.
            let (g, h) = self.rotate(guard, f, dir, Dir::Left);
            if (*h).child(Dir::Left).load(Ordering::Acquire).is_null() {
                self.delete_rotate(guard, g, Dir::Right);
            } else {
                self.delete_rotate(guard, g, Dir::Right);
                self.try_rotate_back(guard, f, dir, g);
            }
        }
    }

    /// Opportunistically undoes the shape change of a rotation once the
    /// victim below it is gone. The window closes if `f` retired or the
    /// rotated edge moved on; the tree stays correct either way, merely
    /// differently shaped.
    unsafe fn try_rotate_back(&self, guard: &Guard<'_>, f: *mut Node<K>, dir: Dir, g: *mut Node<K>) {
        (*f).lock.lock();
        if (*f).retired.load(Ordering::Acquire) || (*f).child(dir).load(Ordering::Acquire) != g {
            (*f).lock.unlock();
            return;
        }
        (*g).lock.lock();
        if (*g).child(Dir::Right).load(Ordering::Acquire).is_null() {
            // The right subtree was emptied by other erasers; nothing to
            // rotate above g anymore.
            (*g).lock.unlock();
            (*f).lock.unlock();
            return;
        }
        let (g2, h2) = self.rotate(guard, f, dir, Dir::Right);
        (*g2).lock.unlock();
        (*h2).lock.unlock();
    }

    /// Copy-on-rotate at the edge `a.child(dir1)`: with `b` that child and
    /// `c = b.child(dir2)`, the pair is replaced by fresh nodes `c'` (taking
    /// `c`'s place above) and `b'` (below it), so `c` rises past `b`.
    ///
    /// `a` and `b` are locked on entry; `c` is locked here. All three are
    /// unlocked on exit, with `b` and `c` retired: `b` backs to `a`, `c`
    /// backs to its replacement. The fresh pair is returned still locked.
    /// Publication is the single store into `a`, so a reader that latched
    /// `b` or `c` keeps seeing a consistent frozen subtree.
    unsafe fn rotate(
        &self,
        guard: &Guard<'_>,
        a: *mut Node<K>,
        dir1: Dir,
        dir2: Dir,
    ) -> (*mut Node<K>, *mut Node<K>) {
        let b = (*a).child(dir1).load(Ordering::Acquire);
        let c = (*b).child(dir2).load(Ordering::Acquire);
        (*c).lock.lock();

        let b2 = Node::alloc_locked((*b).key);
        let c2 = Node::alloc_locked((*c).key);
        (*b2).child(dir2).store(
            (*c).child(dir2.flip()).load(Ordering::Acquire),
            Ordering::Relaxed,
        );
        (*b2).child(dir2.flip()).store(
            (*b).child(dir2.flip()).load(Ordering::Acquire),
            Ordering::Relaxed,
        );
        (*c2).child(dir2).store(
            (*c).child(dir2).load(Ordering::Acquire),
            Ordering::Relaxed,
        );
        (*c2).child(dir2.flip()).store(b2, Ordering::Relaxed);

        (*a).child(dir1).store(c2, Ordering::Release);
        (*b).back.store(a, Ordering::Release);
        (*b).retired.store(true, Ordering::Release);
        (*c).back.store(c2, Ordering::Release);
        (*c).retired.store(true, Ordering::Release);

        (*a).lock.unlock();
        (*b).lock.unlock();
        (*c).lock.unlock();
        guard.retire(b);
        guard.retire(c);
        (c2, b2)
    }
}

impl<K: Ord + Copy> Default for FineGrainedTree<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K> Drop for FineGrainedTree<K> {
    fn drop(&mut self) {
        unsafe {
            let root = Box::from_raw(self.root);
            Self::free_subtree(root.children[0].load(Ordering::Relaxed));
            Self::free_subtree(root.children[1].load(Ordering::Relaxed));
        }
    }
}

impl<K> FineGrainedTree<K> {
    unsafe fn free_subtree(node: *mut Node<K>) {
        if node.is_null() {
            return;
        }
        let node = Box::from_raw(node);
        Self::free_subtree(node.children[0].load(Ordering::Relaxed));
        Self::free_subtree(node.children[1].load(Ordering::Relaxed));
    }
}

impl<K: Ord + Copy + Send + Sync> ConcurrentSet<K> for FineGrainedTree<K> {
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
            let root = &*self.root;
            Self::free_subtree(root.children[0].load(Ordering::Relaxed));
            root.children[0].store(ptr::null_mut(), Ordering::Relaxed);
        }
        self.collector.reclaim_all();
        self.len.store(0, Ordering::Relaxed);
    }

    fn set_thread_count(&self, n: usize) {
        self.collector.set_thread_count(n);
    }

    fn register_thread(&self, tid: usize) {
        self.collector.register(tid);
    }
}

#[cfg(test)]
mod tests {
    use super::FineGrainedTree;
    use crate::tree::concurrent_set::tests as suite;
    use crate::ConcurrentSet;
    use crossbeam_utils::thread;

    #[test]
    fn matches_model() {
        suite::matches_model::<FineGrainedTree<i32>>();
    }

    #[test]
    fn round_trip() {
        suite::round_trip::<FineGrainedTree<i32>>();
    }

    #[test]
    fn extreme_keys() {
        suite::extreme_keys::<FineGrainedTree<i32>>();
    }

    #[test]
    fn small_scenarios() {
        suite::small_scenarios::<FineGrainedTree<i32>>();
    }

    #[test]
    fn disjoint_ranges() {
        suite::disjoint_ranges::<FineGrainedTree<i32>>(4, 10_000);
    }

    #[test]
    fn disjoint_inserts() {
        suite::disjoint_inserts::<FineGrainedTree<i32>>(2, 1_000);
    }

    #[test]
    fn overlapping_ranges() {
        suite::overlapping_ranges::<FineGrainedTree<i32>>(8, 512);
    }

    #[test]
    fn read_while_write() {
        suite::read_while_write::<FineGrainedTree<i32>>(3);
    }

    #[test]
    fn reclamation_churn() {
        suite::reclamation_churn::<FineGrainedTree<i32>>(8);
    }

    /// Erasing down a long left spine exercises the rotation path: every
    /// victim has a left child until the spine is consumed.
    #[test]
    fn rotation_heavy_erase() {
        let set = FineGrainedTree::<i32>::new();
        set.set_thread_count(1);
        set.register_thread(0);
        for key in (0..500).rev() {
            assert!(set.insert(key));
        }
        for key in (0..500).rev() {
            set.erase(&key);
            assert!(!set.find(&key));
        }
        assert_eq!(set.len(), 0);
    }

    /// Concurrent erasers racing on interleaved keys while readers traverse
    /// the same region, forcing readers through retired nodes' back links.
    #[test]
    fn racing_erasers_and_readers() {
        const RANGE: i32 = 4_096;
        let set = FineGrainedTree::<i32>::new();
        set.set_thread_count(4);
        set.register_thread(0);
        for key in 0..RANGE {
            assert!(set.insert(key));
        }
        thread::scope(|s| {
            let set = &set;
            for tid in 0..2 {
                s.spawn(move |_| {
                    set.register_thread(tid);
                    for key in 0..RANGE {
                        if key % 2 == tid as i32 {
                            set.erase(&key);
                        }
                    }
                });
            }
            for tid in 2..4 {
                s.spawn(move |_| {
                    set.register_thread(tid);
                    for key in 0..RANGE {
                        set.find(&key);
                    }
                });
            }
        })
        .unwrap();
        assert_eq!(set.len(), 0);
        for key in 0..RANGE {
            assert!(!set.find(&key));
        }
    }
}
