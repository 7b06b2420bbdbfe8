#![cfg_attr(
    test,
    deny(
        missing_docs,
        future_incompatible,
        nonstandard_style,
        rust_2018_idioms,
        trivial_numeric_casts,
    )
)]
#![cfg_attr(test, deny(
    clippy::cast_lossless,
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_precision_loss,
    clippy::cast_sign_loss,
    clippy::decimal_literal_representation,
    clippy::doc_markdown,
    clippy::empty_enum,
    clippy::explicit_into_iter_loop,
    clippy::explicit_iter_loop,
    clippy::expl_impl_clone_on_copy,
    clippy::fallible_impl_from,
    clippy::filter_map_next,
    clippy::float_arithmetic,
    clippy::get_unwrap,
    clippy::if_not_else,
    clippy::invalid_upcast_comparisons,
    clippy::items_after_statements,
    clippy::manual_find_map,
    clippy::map_flatten,
    clippy::match_like_matches_macro,
    clippy::match_same_arms,
    clippy::maybe_infinite_iter,
    clippy::mem_forget,
    clippy::mut_mut,
    clippy::needless_borrow,
    clippy::needless_continue,
    clippy::needless_pass_by_value,
    clippy::non_ascii_literal,
    clippy::redundant_closure_for_method_calls,
    clippy::shadow_same,
    clippy::single_match_else,
    clippy::string_add,
    clippy::string_add_assign,
    clippy::type_repetition_in_bounds,
    clippy::unimplemented,
    clippy::unseparated_literal_suffix,
    clippy::used_underscore_binding,
    clippy::wildcard_dependencies,
))]
#![cfg_attr(
    test,
    warn(
        clippy::missing_const_for_fn,
        clippy::multiple_crate_versions,
        clippy::wildcard_enum_match_arm,
    )
)]

//! A concurrent radix tree mapping the high bits of an address to a
//! fixed-size metadata slot, the way a memory allocator recovers the
//! bookkeeping of an allocation from a raw pointer.
//!
//! The tree is made of arrays: interior arrays of atomic child pointers and,
//! at the last level, leaf arrays of caller-defined elements. The bit width
//! of every level comes from a [`Geometry`]. Arrays are created lazily, the
//! first time a key below them is looked up with `init_missing` set, and are
//! never freed or replaced while the tree lives. A child pointer therefore
//! only ever goes from null to non-null, which lets readers walk the tree
//! without taking any lock. The single init lock of the tree is only held
//! while a missing array is allocated and published.
//!
//! Lookups go through a per-thread [`RtreeCtx`], whose small two-level
//! cache of recently used leaf arrays answers most lookups without touching
//! the tree at all.
//!
//! The tree does not protect the contents of leaf elements; pick a leaf
//! element type made of atomics. Debug builds can check that threads follow
//! an acquire/release discipline on elements with the witnesses in
//! [`ElmWitnesses`].
//!
//! # Examples
//!
//! ```
//! use std::sync::atomic::{AtomicU64, Ordering};
//!
//! use concurrent_rtree::{Geometry, Rtree};
//!
//! let tree = Rtree::<AtomicU64>::new(Geometry::DEFAULT).unwrap();
//!
//! std::thread::scope(|s| {
//!     s.spawn(|| {
//!         let mut ctx = tree.ctx();
//!         let elm = ctx.lookup(0x1000_0000, true).unwrap();
//!         elm.store(42, Ordering::Release);
//!     });
//! });
//!
//! let mut ctx = tree.ctx();
//! let elm = ctx.lookup(0x1000_0000, false).unwrap();
//! assert_eq!(elm.load(Ordering::Acquire), 42);
//!
//! // keys in the same page share a slot
//! assert!(std::ptr::eq(elm, ctx.lookup(0x1000_0fff, false).unwrap()));
//! ```

#[cfg(not(feature = "fault_injection"))]
#[inline]
const fn debug_delay() -> bool {
    false
}

/// This function is useful for inducing random jitter into
/// the creation of subtrees, widening the windows in which
/// threads race to create the same array. It gets fully
/// eliminated by the compiler in non-test code.
#[cfg(feature = "fault_injection")]
fn debug_delay() -> bool {
    use std::thread;

    use rand::{thread_rng, Rng};

    let mut rng = thread_rng();

    match rng.gen_range(0..100) {
        0..=94 => false,
        _ => {
            thread::yield_now();
            true
        }
    }
}

#[macro_use]
mod log;

mod base;
mod ctx;
mod geometry;
#[cfg(feature = "serde")]
mod serde;
mod witness;

pub use base::{BaseAlloc, SystemBase, Zeroable};
pub use ctx::{CtxStats, RtreeCtx};
pub use geometry::{
    Geometry, Level, CACHELINE, CACHE_L1_LEN, CACHE_L2_LEN, LEAF_KEY_INVALID, MAX_HEIGHT,
    MAX_LEVEL_BITS,
};
pub use witness::{ElmWitnesses, LockOrder, ELM_ACQUIRE_MAX};

use std::fmt;
use std::marker::PhantomData;
use std::mem;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

#[cfg(feature = "timing")]
use std::sync::atomic::AtomicU64;
#[cfg(feature = "timing")]
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::base::{alloc_array, dealloc_array};
use crate::ctx::LeafCache;

/// Error type for building an [`Rtree`] or a [`Geometry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The level table is unusable.
    Geometry(&'static str),
    /// An array of the requested shape cannot be described or allocated.
    Layout(&'static str),
    /// The backing allocator could not supply an array.
    Alloc {
        /// Size of the failed request.
        bytes: usize,
    },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Geometry(reason) => write!(f, "invalid rtree geometry: {reason}"),
            Error::Layout(reason) => write!(f, "invalid rtree array layout: {reason}"),
            Error::Alloc { bytes } => write!(f, "failed to allocate {bytes} bytes for an rtree array"),
        }
    }
}

impl std::error::Error for Error {}

/// An element of an interior array: null until the child array below it
/// is created, then fixed for the life of the tree.
#[derive(Debug, Default)]
#[repr(transparent)]
struct NodeElm {
    child: AtomicPtr<()>,
}

unsafe impl Zeroable for NodeElm {}

/// Number of arrays created lazily since the tree was built.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Materialized {
    /// Interior arrays below the root.
    pub nodes: usize,
    /// Leaf arrays.
    pub leaves: usize,
}

/// A concurrent radix tree from address keys to leaf elements of type `L`.
///
/// `Rtree` is `Send` and `Sync`; share it by reference (or in an `Arc`) and
/// give every thread its own [`RtreeCtx`] from [`Rtree::ctx`].
///
/// Leaf elements start out zeroed, hence the [`Zeroable`] bound, and are
/// handed out as shared references, so they need interior mutability to be
/// of any use. Arrays come from `B`, a [`BaseAlloc`], and are only returned
/// to it when the tree is dropped.
pub struct Rtree<L, B = SystemBase>
where
    L: Zeroable + Send + Sync,
    B: BaseAlloc,
{
    geometry: Geometry,
    // interior array of level 0, or the only leaf array when the tree has
    // a single level
    root: NonNull<()>,
    // serializes the null -> non-null transition of every child pointer
    init_lock: Mutex<()>,
    base: B,
    nodes: AtomicUsize,
    leaves: AtomicUsize,
    #[cfg(feature = "timing")]
    slowest_op: AtomicU64,
    #[cfg(feature = "timing")]
    fastest_op: AtomicU64,
    _leaf: PhantomData<L>,
}

unsafe impl<L, B> Send for Rtree<L, B>
where
    L: Zeroable + Send + Sync,
    B: BaseAlloc,
{
}

unsafe impl<L, B> Sync for Rtree<L, B>
where
    L: Zeroable + Send + Sync,
    B: BaseAlloc,
{
}

impl<L, B> fmt::Debug for Rtree<L, B>
where
    L: Zeroable + Send + Sync,
    B: BaseAlloc,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rtree")
            .field("geometry", &self.geometry)
            .field("materialized", &self.materialized())
            .finish()
    }
}

impl<L> Rtree<L>
where
    L: Zeroable + Send + Sync,
{
    /// Creates an empty tree backed by the global allocator.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::sync::atomic::AtomicUsize;
    ///
    /// use concurrent_rtree::{Geometry, Rtree};
    ///
    /// let geometry = Geometry::for_address_space(32, 12).unwrap();
    /// let tree = Rtree::<AtomicUsize>::new(geometry).unwrap();
    /// assert_eq!(tree.geometry().height(), 2);
    /// ```
    pub fn new(geometry: Geometry) -> Result<Rtree<L>, Error> {
        Rtree::with_base(geometry, SystemBase)
    }
}

impl<L, B> Rtree<L, B>
where
    L: Zeroable + Send + Sync,
    B: BaseAlloc,
{
    /// Creates an empty tree whose arrays come from `base`.
    ///
    /// Only the root array is allocated here. On error nothing is left
    /// allocated.
    pub fn with_base(geometry: Geometry, base: B) -> Result<Rtree<L, B>, Error> {
        if mem::size_of::<L>() == 0 {
            return Err(Error::Layout("leaf elements must not be zero-sized"));
        }

        let root_len = geometry.level_len(0);
        let root = if geometry.height() == 1 {
            alloc_array::<L, B>(&base, root_len)?.cast()
        } else {
            alloc_array::<NodeElm, B>(&base, root_len)?.cast()
        };

        debug_log!(height = geometry.height(), root_len, "created rtree");

        Ok(Rtree {
            geometry,
            root,
            init_lock: Mutex::new(()),
            base,
            nodes: AtomicUsize::new(0),
            leaves: AtomicUsize::new(0),
            #[cfg(feature = "timing")]
            slowest_op: u64::MIN.into(),
            #[cfg(feature = "timing")]
            fastest_op: u64::MAX.into(),
            _leaf: PhantomData,
        })
    }

    /// Creates a lookup context for the calling thread.
    pub fn ctx(&self) -> RtreeCtx<'_, L, B> {
        RtreeCtx::new(self)
    }

    /// The level table of this tree.
    pub const fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    /// The allocator backing this tree.
    pub const fn base(&self) -> &B {
        &self.base
    }

    /// A **lagging** count of the arrays created so far, not counting the
    /// root.
    pub fn materialized(&self) -> Materialized {
        Materialized {
            nodes: self.nodes.load(Ordering::Relaxed),
            leaves: self.leaves.load(Ordering::Relaxed),
        }
    }

    /// Reads a child pointer. Dependent reads rely on an earlier acquire
    /// having published the child to this thread and get by with relaxed.
    #[inline]
    fn child_tryread(elm: &NodeElm, dependent: bool) -> Option<NonNull<()>> {
        let child = if dependent {
            elm.child.load(Ordering::Relaxed)
        } else {
            elm.child.load(Ordering::Acquire)
        };

        debug_assert!(
            !dependent || !child.is_null(),
            "dependent lookup reached an unmaterialized subtree"
        );

        NonNull::new(child)
    }

    #[inline]
    fn child_read(
        &self,
        elm: &NodeElm,
        level: usize,
        dependent: bool,
        init_missing: bool,
    ) -> Option<NonNull<()>> {
        match Self::child_tryread(elm, dependent) {
            Some(child) => Some(child),
            None if init_missing && !dependent => self.child_init(elm, level + 1),
            None => None,
        }
    }

    /// Creates the array at `level` below `elm`, unless another thread
    /// already did. Returns `None` if the backing allocator is exhausted, in
    /// which case `elm` stays null and a later lookup may try again.
    #[cold]
    fn child_init(&self, elm: &NodeElm, level: usize) -> Option<NonNull<()>> {
        debug_delay();

        let _init = self.init_lock.lock();

        debug_delay();

        // a non-null child was stored while holding init_lock, so the lock
        // already orders this load after that store
        if let Some(child) = NonNull::new(elm.child.load(Ordering::Relaxed)) {
            return Some(child);
        }

        let len = self.geometry.level_len(level);
        let is_leaf = level + 1 == self.geometry.height();
        let allocated: Result<NonNull<()>, Error> = if is_leaf {
            alloc_array::<L, B>(&self.base, len).map(NonNull::cast)
        } else {
            alloc_array::<NodeElm, B>(&self.base, len).map(NonNull::cast)
        };

        let child = match allocated {
            Ok(child) => child,
            Err(_error) => {
                warn_log!(depth = level, error = %_error, "failed to create rtree subtree");
                return None;
            }
        };

        debug_delay();

        // readers that never take init_lock synchronize with this store
        elm.child.store(child.as_ptr(), Ordering::Release);

        if is_leaf {
            self.leaves.fetch_add(1, Ordering::Relaxed);
        } else {
            self.nodes.fetch_add(1, Ordering::Relaxed);
        }

        debug_log!(depth = level, len, is_leaf, "created rtree subtree");

        Some(child)
    }

    /// Walks the tree to the leaf element for `key`, creating missing
    /// arrays on the way if `init_missing` is set, and records the leaf
    /// array in `cache`.
    ///
    /// # Safety
    ///
    /// With `dependent` set, every array on the path must have been created
    /// before this call in happens-before order.
    ///
    /// # Panics
    ///
    /// In debug builds, if the leaf holding `key` is already in `cache`:
    /// callers look in the cache before walking the tree.
    pub(crate) unsafe fn lookup_hard(
        &self,
        cache: &mut LeafCache<L>,
        key: usize,
        dependent: bool,
        init_missing: bool,
    ) -> Option<NonNull<L>> {
        let geometry = &self.geometry;
        let height = geometry.height();

        if cfg!(debug_assertions) {
            let leaf_key = geometry.leaf_key(key);
            assert!(
                !cache.contains(leaf_key),
                "hard lookup of leaf key {leaf_key:#x}, which is already cached"
            );
        }

        trace_log!(key, dependent, init_missing, "rtree hard lookup");

        #[cfg(feature = "timing")]
        let before = Instant::now();

        let leaf: NonNull<L> = if height == 1 {
            self.root.cast()
        } else {
            let mut node: NonNull<NodeElm> = self.root.cast();
            let mut level = 0;
            loop {
                let elm = &*node.as_ptr().add(geometry.subkey(key, level));
                let child = self.child_read(elm, level, dependent, init_missing)?;
                if level + 2 == height {
                    break child.cast();
                }
                node = child.cast();
                level += 1;
            }
        };

        cache.install(geometry, key, leaf);

        #[cfg(feature = "timing")]
        self.record_timing(before.elapsed());

        let subkey = geometry.subkey(key, height - 1);
        Some(NonNull::new_unchecked(leaf.as_ptr().add(subkey)))
    }

    #[cfg(feature = "timing")]
    fn print_timing(&self) {
        println!(
            "min : {:?}",
            Duration::from_nanos(self.fastest_op.load(Ordering::Acquire))
        );
        println!(
            "max : {:?}",
            Duration::from_nanos(self.slowest_op.load(Ordering::Acquire))
        );
    }

    #[cfg(feature = "timing")]
    fn record_timing(&self, time: Duration) {
        let nanos = u64::try_from(time.as_nanos()).unwrap_or(u64::MAX);
        let min = self.fastest_op.load(Ordering::Relaxed);
        if nanos < min {
            self.fastest_op.fetch_min(nanos, Ordering::Relaxed);
        }

        let max = self.slowest_op.load(Ordering::Relaxed);
        if nanos > max {
            self.slowest_op.fetch_max(nanos, Ordering::Relaxed);
        }
    }

    /// Frees `subtree`, an interior array at `level`, and everything below
    /// it. `freed` counts the arrays freed per level.
    unsafe fn delete_subtree(
        &mut self,
        subtree: NonNull<NodeElm>,
        level: usize,
        freed: &mut [usize; MAX_HEIGHT],
    ) {
        let nchildren = self.geometry.level_len(level);
        let leaf_parent = level + 2 == self.geometry.height();

        for i in 0..nchildren {
            let elm = &*subtree.as_ptr().add(i);
            // exclusive access: nothing can be publishing concurrently
            let child = match NonNull::new(elm.child.load(Ordering::Relaxed)) {
                Some(child) => child,
                None => continue,
            };

            if leaf_parent {
                let leaf_len = self.geometry.level_len(level + 1);
                dealloc_array::<L, B>(&self.base, child.cast(), leaf_len);
                freed[level + 1] += 1;
            } else {
                self.delete_subtree(child.cast(), level + 1, freed);
            }
        }

        dealloc_array::<NodeElm, B>(&self.base, subtree, nchildren);
        freed[level] += 1;
    }
}

impl<L, B> Drop for Rtree<L, B>
where
    L: Zeroable + Send + Sync,
    B: BaseAlloc,
{
    fn drop(&mut self) {
        #[cfg(feature = "timing")]
        self.print_timing();

        let mut freed = [0_usize; MAX_HEIGHT];
        let root_len = self.geometry.level_len(0);

        unsafe {
            if self.geometry.height() == 1 {
                dealloc_array::<L, B>(&self.base, self.root.cast(), root_len);
                freed[0] += 1;
            } else {
                self.delete_subtree(self.root.cast(), 0, &mut freed);
            }
        }

        debug_log!(?freed, "tore down rtree");

        if cfg!(feature = "print_utilization_on_drop") {
            for (level, count) in freed.iter().take(self.geometry.height()).enumerate() {
                println!(
                    "level {level} arrays {count} elements per array {}",
                    self.geometry.level_len(level)
                );
            }
        }
    }
}

const fn _test_impls() {
    const fn send<T: Send>() {}
    const fn sync<T: Sync>() {}
    send::<Rtree<AtomicUsize>>();
    sync::<Rtree<AtomicUsize>>();
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU64;

    use super::*;

    #[test]
    fn single_level_tree() {
        let geometry = Geometry::from_bits(usize::BITS - 20, &[8]).unwrap();
        let tree = Rtree::<AtomicU64>::new(geometry).unwrap();
        let mut ctx = tree.ctx();

        // the root is the leaf array, so every key resolves without creating
        // anything
        let a = ctx.lookup(0x1_000, false).unwrap();
        let b = ctx.lookup(0xff_000, false).unwrap();
        assert!(!std::ptr::eq(a, b));
        assert_eq!(tree.materialized(), Materialized::default());
        assert_eq!(ctx.stats().hard_lookups, 1);
        assert_eq!(ctx.stats().l1_hits, 1);
    }

    #[test]
    fn subtrees_are_created_on_demand() {
        let geometry = Geometry::from_bits(usize::BITS - 32, &[4, 4, 4, 8]).unwrap();
        let tree = Rtree::<AtomicU64>::new(geometry).unwrap();
        let mut ctx = tree.ctx();

        let key = 0x1234_5000;
        assert!(ctx.lookup(key, false).is_none());
        assert_eq!(tree.materialized(), Materialized::default());

        let elm = ctx.lookup(key, true).unwrap();
        assert_eq!(
            tree.materialized(),
            Materialized {
                nodes: 2,
                leaves: 1
            }
        );

        ctx.reset();
        assert!(std::ptr::eq(elm, ctx.lookup(key, false).unwrap()));

        // a sibling leaf under the same parent only adds a leaf
        ctx.lookup(key + (1 << 20), true).unwrap();
        assert_eq!(
            tree.materialized(),
            Materialized {
                nodes: 2,
                leaves: 2
            }
        );
    }

    #[test]
    fn zero_sized_leaves_are_rejected() {
        struct Empty;
        unsafe impl Zeroable for Empty {}

        assert_eq!(
            Rtree::<Empty>::new(Geometry::DEFAULT).err(),
            Some(Error::Layout("leaf elements must not be zero-sized"))
        );
        assert_eq!(
            Rtree::<[AtomicU64; 0]>::new(Geometry::DEFAULT).err(),
            Some(Error::Layout("leaf elements must not be zero-sized"))
        );
    }

    #[test]
    fn error_display() {
        let error = Error::Alloc { bytes: 64 };
        assert_eq!(
            error.to_string(),
            "failed to allocate 64 bytes for an rtree array"
        );
    }
}
