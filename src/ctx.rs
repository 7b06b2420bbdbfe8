use std::fmt;
use std::ptr::{self, NonNull};

use crate::geometry::{Geometry, CACHE_L1_LEN, CACHE_L2_LEN, LEAF_KEY_INVALID};
use crate::witness::ElmWitnesses;
use crate::{BaseAlloc, Rtree, SystemBase, Zeroable};

#[derive(Debug)]
struct CacheElm<L> {
    leaf_key: usize,
    leaf: *const L,
}

impl<L> Clone for CacheElm<L> {
    fn clone(&self) -> CacheElm<L> {
        *self
    }
}

impl<L> Copy for CacheElm<L> {}

impl<L> CacheElm<L> {
    const INVALID: CacheElm<L> = CacheElm {
        leaf_key: LEAF_KEY_INVALID,
        leaf: ptr::null(),
    };
}

/// Two-level cache from leaf keys to leaf arrays.
///
/// L1 is direct-mapped by [`Geometry::cache_slot`]. L2 is ordered by
/// recency, most recent first, and catches entries pushed out of L1.
/// A valid leaf key always comes with a non-null leaf pointer, and leaf
/// arrays are never freed while the tree lives, so a hit never needs to
/// touch the tree.
pub(crate) struct LeafCache<L> {
    l1: [CacheElm<L>; CACHE_L1_LEN],
    l2: [CacheElm<L>; CACHE_L2_LEN],
}

impl<L> LeafCache<L> {
    pub(crate) fn new() -> LeafCache<L> {
        LeafCache {
            l1: [CacheElm::INVALID; CACHE_L1_LEN],
            l2: [CacheElm::INVALID; CACHE_L2_LEN],
        }
    }

    pub(crate) fn reset(&mut self) {
        self.l1 = [CacheElm::INVALID; CACHE_L1_LEN];
        self.l2 = [CacheElm::INVALID; CACHE_L2_LEN];
    }

    pub(crate) fn contains(&self, leaf_key: usize) -> bool {
        self.l1
            .iter()
            .chain(self.l2.iter())
            .any(|elm| elm.leaf_key == leaf_key)
    }

    /// Looks up the leaf array holding `key`. An L2 hit is promoted into L1,
    /// the L1 entry it displaces takes the hit's L2 neighbor's place, and
    /// that neighbor moves down into the hit's old position.
    #[inline]
    fn get(&mut self, geometry: &Geometry, key: usize) -> Option<(NonNull<L>, Hit)> {
        let leaf_key = geometry.leaf_key(key);
        let slot = geometry.cache_slot(key);

        let l1 = self.l1[slot];
        if l1.leaf_key == leaf_key {
            return NonNull::new(l1.leaf as *mut L).map(|leaf| (leaf, Hit::L1));
        }

        let i = self.l2.iter().position(|elm| elm.leaf_key == leaf_key)?;
        let hit = self.l2[i];
        if i > 0 {
            self.l2[i] = self.l2[i - 1];
            self.l2[i - 1] = self.l1[slot];
        } else {
            self.l2[0] = self.l1[slot];
        }
        self.l1[slot] = hit;

        NonNull::new(hit.leaf as *mut L).map(|leaf| (leaf, Hit::L2))
    }

    /// Records a leaf array resolved by a hard lookup: the oldest L2 entry
    /// is evicted, the L1 entry at the new key's slot is demoted to the
    /// front of L2, and the new entry takes its place in L1.
    pub(crate) fn install(&mut self, geometry: &Geometry, key: usize, leaf: NonNull<L>) {
        self.l2.copy_within(..CACHE_L2_LEN - 1, 1);

        let slot = geometry.cache_slot(key);
        self.l2[0] = self.l1[slot];
        self.l1[slot] = CacheElm {
            leaf_key: geometry.leaf_key(key),
            leaf: leaf.as_ptr(),
        };
    }

    fn l1_leaf_keys(&self) -> impl Iterator<Item = usize> + '_ {
        self.l1
            .iter()
            .map(|elm| elm.leaf_key)
            .filter(|leaf_key| *leaf_key != LEAF_KEY_INVALID)
    }
}

#[derive(Debug, Clone, Copy)]
enum Hit {
    L1,
    L2,
}

/// Lookup counters of one [`RtreeCtx`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CtxStats {
    /// Lookups answered by the direct-mapped cache.
    pub l1_hits: u64,
    /// Lookups answered by the recency-ordered cache.
    pub l2_hits: u64,
    /// Lookups that walked the tree.
    pub hard_lookups: u64,
}

/// A thread's handle on an [`Rtree`].
///
/// Each thread that looks keys up creates its own context. The context
/// caches the leaf arrays it resolved most recently, so repeated lookups
/// of nearby keys skip the tree walk, and carries the thread's leaf
/// element witnesses. It borrows the tree, so cached leaf pointers can
/// never outlive it.
///
/// # Examples
///
/// ```
/// use std::sync::atomic::{AtomicUsize, Ordering};
///
/// use concurrent_rtree::{Geometry, Rtree};
///
/// let tree = Rtree::<AtomicUsize>::new(Geometry::DEFAULT).unwrap();
/// let mut ctx = tree.ctx();
///
/// let key = 0x7f00_1234_5000;
///
/// // a pure query never creates subtrees
/// assert!(ctx.lookup(key, false).is_none());
///
/// let slot = ctx.lookup(key, true).unwrap();
/// slot.store(64, Ordering::Relaxed);
///
/// assert_eq!(ctx.lookup(key, false).unwrap().load(Ordering::Relaxed), 64);
/// assert_eq!(ctx.stats().hard_lookups, 2);
/// assert_eq!(ctx.stats().l1_hits, 1);
/// ```
pub struct RtreeCtx<'t, L, B = SystemBase>
where
    L: Zeroable + Send + Sync,
    B: BaseAlloc,
{
    tree: &'t Rtree<L, B>,
    cache: LeafCache<L>,
    witnesses: ElmWitnesses,
    stats: CtxStats,
}

impl<L, B> fmt::Debug for RtreeCtx<'_, L, B>
where
    L: Zeroable + Send + Sync,
    B: BaseAlloc,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RtreeCtx")
            .field("l1", &self.cache.l1_leaf_keys().collect::<Vec<_>>())
            .field("witnesses", &self.witnesses)
            .field("stats", &self.stats)
            .finish()
    }
}

impl<'t, L, B> RtreeCtx<'t, L, B>
where
    L: Zeroable + Send + Sync,
    B: BaseAlloc,
{
    /// Creates a context with an empty cache.
    pub fn new(tree: &'t Rtree<L, B>) -> RtreeCtx<'t, L, B> {
        RtreeCtx {
            tree,
            cache: LeafCache::new(),
            witnesses: ElmWitnesses::default(),
            stats: CtxStats::default(),
        }
    }

    /// The tree this context looks keys up in.
    pub const fn tree(&self) -> &'t Rtree<L, B> {
        self.tree
    }

    /// Invalidates every cache entry and clears the counters.
    pub fn reset(&mut self) {
        self.cache.reset();
        self.stats = CtxStats::default();
    }

    /// Lookup counters since creation or the last [`reset`](Self::reset).
    pub const fn stats(&self) -> CtxStats {
        self.stats
    }

    /// Returns the leaf element for `key`.
    ///
    /// When `init_missing` is false this is a pure query that returns
    /// `None` if the subtree holding `key` was never created. Otherwise
    /// missing subtrees are created on the way down, and `None` means the
    /// backing allocator could not supply one.
    pub fn lookup(&mut self, key: usize, init_missing: bool) -> Option<&'t L> {
        unsafe { self.lookup_with(key, false, init_missing) }
    }

    /// Returns the leaf element for `key`, whose subtree is known to exist.
    ///
    /// Uses relaxed loads for the walk. Debug builds panic if the subtree
    /// turns out to be missing; release builds return `None`.
    ///
    /// # Safety
    ///
    /// Every array on the path to `key` must have been created before this
    /// call in happens-before order, for instance by an earlier
    /// [`lookup`](Self::lookup) of a key in the same leaf on this thread.
    pub unsafe fn lookup_dependent(&mut self, key: usize) -> Option<&'t L> {
        self.lookup_with(key, true, false)
    }

    /// Returns the leaf element for `key`, consulting the cache first and
    /// walking the tree on a miss.
    ///
    /// # Safety
    ///
    /// If `dependent` is true, the caller guarantees what
    /// [`lookup_dependent`](Self::lookup_dependent) requires.
    pub unsafe fn lookup_with(
        &mut self,
        key: usize,
        dependent: bool,
        init_missing: bool,
    ) -> Option<&'t L> {
        let geometry = self.tree.geometry();

        let leaf = match self.cache.get(geometry, key) {
            Some((leaf, Hit::L1)) => {
                self.stats.l1_hits += 1;
                leaf
            }
            Some((leaf, Hit::L2)) => {
                self.stats.l2_hits += 1;
                leaf
            }
            None => {
                self.stats.hard_lookups += 1;
                let elm = self
                    .tree
                    .lookup_hard(&mut self.cache, key, dependent, init_missing)?;
                return Some(&*elm.as_ptr());
            }
        };

        let subkey = geometry.subkey(key, geometry.height() - 1);
        Some(&*leaf.as_ptr().add(subkey))
    }

    /// Looks `key` up and acquires the witness of its leaf element.
    ///
    /// The element must be given back with
    /// [`release_elm`](Self::release_elm). Witnesses only exist in debug
    /// builds; see [`ElmWitnesses`].
    pub fn acquire_elm(&mut self, key: usize, init_missing: bool) -> Option<&'t L> {
        let elm = self.lookup(key, init_missing)?;
        self.witnesses.acquire(key, elm);
        Some(elm)
    }

    /// Asserts that this thread acquired `elm`.
    pub fn access_elm(&self, elm: &L) {
        self.witnesses.access(elm);
    }

    /// Releases the witness of an element from
    /// [`acquire_elm`](Self::acquire_elm).
    pub fn release_elm(&mut self, elm: &L) {
        self.witnesses.release(elm);
    }

    /// This thread's leaf element witnesses.
    pub fn witnesses(&mut self) -> &mut ElmWitnesses {
        &mut self.witnesses
    }
}
