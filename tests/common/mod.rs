//! Shared test utilities: backing allocators that count or refuse
//! allocations, and tracing setup.
//!
//! ```bash
//! RUST_LOG=concurrent_rtree=debug cargo test --features tracing
//! ```

#![allow(dead_code)]

use std::alloc::Layout;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Once;

use concurrent_rtree::{BaseAlloc, SystemBase};
use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

/// Installs a test-friendly fmt subscriber filtered by `RUST_LOG`.
///
/// Safe to call from every test; only the first call takes effect.
pub fn init_tracing() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// A [`BaseAlloc`] that counts the arrays it hands out and takes back.
#[derive(Debug, Default)]
pub struct CountingBase {
    allocs: AtomicUsize,
    deallocs: AtomicUsize,
    bytes: AtomicUsize,
}

impl CountingBase {
    pub fn allocs(&self) -> usize {
        self.allocs.load(Ordering::Acquire)
    }

    pub fn deallocs(&self) -> usize {
        self.deallocs.load(Ordering::Acquire)
    }

    pub fn resident_bytes(&self) -> usize {
        self.bytes.load(Ordering::Acquire)
    }
}

impl BaseAlloc for CountingBase {
    fn alloc_zeroed(&self, layout: Layout) -> Option<NonNull<u8>> {
        let ret = SystemBase.alloc_zeroed(layout)?;
        self.allocs.fetch_add(1, Ordering::AcqRel);
        self.bytes.fetch_add(layout.size(), Ordering::AcqRel);
        Some(ret)
    }

    unsafe fn dealloc(&self, ptr: NonNull<u8>, layout: Layout) {
        self.deallocs.fetch_add(1, Ordering::AcqRel);
        self.bytes.fetch_sub(layout.size(), Ordering::AcqRel);
        SystemBase.dealloc(ptr, layout);
    }
}

/// A [`BaseAlloc`] that refuses every allocation once its budget of
/// arrays is spent.
#[derive(Debug)]
pub struct FailingBase {
    budget: AtomicUsize,
    inner: CountingBase,
}

impl FailingBase {
    pub fn new(budget: usize) -> FailingBase {
        FailingBase {
            budget: AtomicUsize::new(budget),
            inner: CountingBase::default(),
        }
    }

    pub fn refill(&self, budget: usize) {
        self.budget.store(budget, Ordering::Release);
    }

    pub fn counts(&self) -> &CountingBase {
        &self.inner
    }
}

impl BaseAlloc for FailingBase {
    fn alloc_zeroed(&self, layout: Layout) -> Option<NonNull<u8>> {
        self.budget
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |budget| {
                budget.checked_sub(1)
            })
            .ok()?;
        self.inner.alloc_zeroed(layout)
    }

    unsafe fn dealloc(&self, ptr: NonNull<u8>, layout: Layout) {
        self.inner.dealloc(ptr, layout);
    }
}
