use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::scope;
use std::time::Instant;

use concurrent_rtree::{Geometry, Rtree};

const THREADS: usize = 16;
const EXTENTS_PER_THREAD: usize = 256;
const PAGE: usize = 4096;
const EXTENT_PAGES: usize = 16;
const LOOKUPS_PER_THREAD: usize = 1024 * 1024;

// a registered extent: its base address, or zero for unmapped pages
type ExtentMap = Rtree<AtomicUsize>;

fn register(map: &ExtentMap, extents: &[Vec<u8>]) {
    let mut ctx = map.ctx();
    for extent in extents {
        let base = extent.as_ptr() as usize;
        let first_page = base & !(PAGE - 1);
        let last_page = (base + extent.len() - 1) & !(PAGE - 1);
        for page in (first_page..=last_page).step_by(PAGE) {
            ctx.lookup(page, true)
                .expect("out of memory")
                .store(base, Ordering::Release);
        }
    }
}

fn resolve(map: &ExtentMap, extents: &[Vec<u8>]) -> usize {
    let mut ctx = map.ctx();
    let mut resolved = 0;
    for i in 0..LOOKUPS_PER_THREAD {
        let extent = &extents[i % extents.len()];
        let base = extent.as_ptr() as usize;
        let interior = base + (i * 31) % extent.len();
        let elm = ctx.lookup(interior, false).expect("registered extent");
        // a page shared by two extents records the one registered last
        let owner = elm.load(Ordering::Acquire);
        if owner == base {
            resolved += 1;
        }
    }
    let stats = ctx.stats();
    println!(
        "l1 hits {} l2 hits {} hard lookups {}",
        stats.l1_hits, stats.l2_hits, stats.hard_lookups
    );
    resolved
}

fn main() {
    let map = ExtentMap::new(Geometry::DEFAULT).expect("failed to build extent map");

    let extents: Vec<Vec<Vec<u8>>> = (0..THREADS)
        .map(|_| {
            (0..EXTENTS_PER_THREAD)
                .map(|_| vec![0_u8; EXTENT_PAGES * PAGE])
                .collect()
        })
        .collect();

    let before = Instant::now();
    scope(|s| {
        let handles: Vec<_> = extents
            .iter()
            .map(|extents| {
                let map = &map;
                s.spawn(move || register(map, extents))
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
    });
    println!(
        "registered {} extents in {:?}, {:?}",
        THREADS * EXTENTS_PER_THREAD,
        before.elapsed(),
        map.materialized()
    );

    let before = Instant::now();
    let resolved: usize = scope(|s| {
        let handles: Vec<_> = extents
            .iter()
            .map(|extents| {
                let map = &map;
                s.spawn(move || resolve(map, extents))
            })
            .collect();
        handles.into_iter().map(|handle| handle.join().unwrap()).sum()
    });
    let elapsed = before.elapsed();

    println!(
        "resolved {} of {} interior pointers in {:?} ({} per second)",
        resolved,
        THREADS * LOOKUPS_PER_THREAD,
        elapsed,
        (THREADS * LOOKUPS_PER_THREAD) as u128 * 1000 / elapsed.as_millis().max(1)
    );
}
