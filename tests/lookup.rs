mod common;

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use common::{CountingBase, FailingBase};
use concurrent_rtree::{Error, Geometry, Materialized, Rtree, Zeroable, MAX_LEVEL_BITS};

fn geometries() -> Vec<Geometry> {
    vec![
        Geometry::from_bits(usize::BITS - 22, &[10]).unwrap(),
        Geometry::from_bits(usize::BITS - 32, &[8, 12]).unwrap(),
        Geometry::from_bits(usize::BITS - 36, &[8, 8, 8]).unwrap(),
        Geometry::from_bits(usize::BITS - 40, &[7, 7, 7, 7]).unwrap(),
    ]
}

#[test]
fn every_height_maps_pages_to_distinct_slots() {
    common::init_tracing();

    for geometry in geometries() {
        let tree = Rtree::<AtomicUsize>::new(geometry).unwrap();
        let mut ctx = tree.ctx();
        let stride = geometry.key_stride();
        assert_eq!(stride, 1 << 12);

        // a scattering of pages across the whole key space of the geometry
        let significant = usize::BITS - geometry.ignored_high_bits() - 12;
        let pages: Vec<usize> = (0..512_usize)
            .map(|i| i.wrapping_mul(0x9e37_79b9) & ((1 << significant) - 1))
            .collect();

        for page in &pages {
            let key = page * stride;
            ctx.lookup(key, true).unwrap().store(*page, Ordering::Relaxed);
        }

        let mut ctx = tree.ctx();
        for page in &pages {
            let key = page * stride;
            let first = ctx.lookup(key, false).unwrap();
            let last = ctx.lookup(key + stride - 1, false).unwrap();
            assert!(std::ptr::eq(first, last));
            assert_eq!(first.load(Ordering::Relaxed), *page, "{geometry:?}");
        }

        // ignored high bits do not take part in a lookup
        if geometry.ignored_high_bits() > 0 {
            let high = 1_usize << (usize::BITS - 1);
            let a = ctx.lookup(pages[1] * stride, false).unwrap();
            let b = ctx.lookup(high | pages[1] * stride, false).unwrap();
            assert!(std::ptr::eq(a, b));
        }
    }
}

#[test]
fn queries_never_create_subtrees() {
    for geometry in geometries().into_iter().skip(1) {
        let base = Arc::new(CountingBase::default());
        let tree = Rtree::<AtomicU64, _>::with_base(geometry, base.clone()).unwrap();
        let mut ctx = tree.ctx();

        for i in 0..1024_usize {
            assert!(ctx.lookup(i.wrapping_mul(0x1357_9000), false).is_none());
        }

        assert_eq!(base.allocs(), 1);
        assert_eq!(tree.materialized(), Materialized::default());
        assert_eq!(ctx.stats().hard_lookups, 1024);
    }
}

#[test]
fn lookups_reuse_existing_subtrees() {
    let base = Arc::new(CountingBase::default());
    let geometry = Geometry::from_bits(usize::BITS - 36, &[8, 8, 8]).unwrap();
    let tree = Rtree::<AtomicU64, _>::with_base(geometry, base.clone()).unwrap();
    let mut ctx = tree.ctx();

    let key = 0xab_cd_e000;
    let elm = ctx.lookup(key, true).unwrap();
    assert_eq!(base.allocs(), 3);

    ctx.reset();
    assert!(std::ptr::eq(elm, ctx.lookup(key, true).unwrap()));
    assert_eq!(base.allocs(), 3);

    // a neighbor leaf only needs its leaf array
    ctx.lookup(key + (1 << 20), true).unwrap();
    assert_eq!(base.allocs(), 4);
    assert_eq!(
        tree.materialized(),
        Materialized {
            nodes: 1,
            leaves: 2
        }
    );
}

#[test]
fn allocation_failure_is_recoverable() {
    common::init_tracing();

    let geometry = Geometry::from_bits(usize::BITS - 36, &[8, 8, 8]).unwrap();
    let base = Arc::new(FailingBase::new(2));
    let tree = Rtree::<AtomicU64, _>::with_base(geometry, base.clone()).unwrap();
    let mut ctx = tree.ctx();

    // the interior array fits the budget, the leaf does not
    let key = 0x12_34_5000;
    assert!(ctx.lookup(key, true).is_none());
    assert_eq!(
        tree.materialized(),
        Materialized {
            nodes: 1,
            leaves: 0
        }
    );
    assert!(ctx.lookup(key, false).is_none());

    base.refill(1);
    let elm = ctx.lookup(key, true).unwrap();
    elm.store(7, Ordering::Relaxed);
    assert_eq!(ctx.lookup(key, false).unwrap().load(Ordering::Relaxed), 7);
    assert_eq!(base.counts().allocs(), 3);

    drop(ctx);
    drop(tree);
    assert_eq!(base.counts().deallocs(), 3);
    assert_eq!(base.counts().resident_bytes(), 0);
}

#[test]
fn construction_failure_is_reported() {
    let base = FailingBase::new(0);
    let err = Rtree::<AtomicU64, _>::with_base(Geometry::DEFAULT, base).unwrap_err();
    assert!(matches!(err, Error::Alloc { bytes } if bytes > 0));
    assert!(err.to_string().contains("failed to allocate"));
}

#[test]
fn arrays_are_cacheline_aligned() {
    let geometry = Geometry::from_bits(usize::BITS - 32, &[8, 12]).unwrap();
    let tree = Rtree::<AtomicU32>::new(geometry).unwrap();
    let mut ctx = tree.ctx();

    for leaf in 0..8_usize {
        let key = leaf << 24;
        let first = ctx.lookup(key, true).unwrap();
        assert_eq!(first as *const AtomicU32 as usize % 64, 0);
    }
}

#[repr(C)]
struct ExtentMeta {
    extent: AtomicUsize,
    size_class: AtomicU32,
    slab: AtomicU32,
}

unsafe impl Zeroable for ExtentMeta {}

#[cfg(target_pointer_width = "64")]
#[test]
fn compound_leaf_elements() {
    let tree = Rtree::<ExtentMeta>::new(Geometry::DEFAULT).unwrap();
    let mut ctx = tree.ctx();

    let extent = 0x7f12_3450_0000_usize;
    let pages = 4;
    for page in 0..pages {
        let meta = ctx.lookup(extent + page * 4096, true).unwrap();
        assert_eq!(meta.extent.load(Ordering::Relaxed), 0);
        meta.extent.store(extent, Ordering::Relaxed);
        meta.size_class.store(3, Ordering::Relaxed);
        meta.slab.store(u32::from(page == 0), Ordering::Relaxed);
    }

    // interior pointers resolve to the extent that owns them
    let meta = ctx.lookup(extent + 2 * 4096 + 100, false).unwrap();
    assert_eq!(meta.extent.load(Ordering::Relaxed), extent);
    assert_eq!(meta.slab.load(Ordering::Relaxed), 0);
}

#[test]
fn address_space_geometries() {
    for (lg_vaddr, height) in [(20, 1), (32, 2), (48, 2)] {
        if lg_vaddr > usize::BITS {
            continue;
        }
        let geometry = Geometry::for_address_space(lg_vaddr, 12).unwrap();
        assert_eq!(geometry.height(), height);

        let tree = Rtree::<AtomicU64>::new(geometry).unwrap();
        let mut ctx = tree.ctx();
        let key = (1_usize << (lg_vaddr - 1)) | 0x5000;
        ctx.lookup(key, true).unwrap().store(1, Ordering::Relaxed);
        assert_eq!(ctx.lookup(key, false).unwrap().load(Ordering::Relaxed), 1);
    }

    assert!(Geometry::for_address_space(12, 12).is_err());
    assert!(matches!(
        Geometry::from_bits(0, &[MAX_LEVEL_BITS + 1]),
        Err(Error::Geometry(_))
    ));
}
