use std::alloc::{self, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{
    AtomicBool, AtomicI16, AtomicI32, AtomicI64, AtomicI8, AtomicIsize, AtomicPtr, AtomicU16,
    AtomicU32, AtomicU64, AtomicU8, AtomicUsize,
};
use std::sync::Arc;

use crate::geometry::CACHELINE;
use crate::Error;

/// Source of the memory backing interior and leaf arrays.
///
/// The tree only ever asks for zero-filled, cache-line aligned arrays and
/// only gives them back when the whole tree is torn down.
pub trait BaseAlloc: Send + Sync {
    /// Returns zero-filled memory fitting `layout`, or `None` if memory is
    /// exhausted. `layout` never has a size of zero.
    fn alloc_zeroed(&self, layout: Layout) -> Option<NonNull<u8>>;

    /// Returns memory to the allocator.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by [`BaseAlloc::alloc_zeroed`] on this
    /// allocator for the same `layout`, and must not be used afterwards.
    unsafe fn dealloc(&self, ptr: NonNull<u8>, layout: Layout);
}

/// A [`BaseAlloc`] drawing from the global allocator.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemBase;

impl BaseAlloc for SystemBase {
    fn alloc_zeroed(&self, layout: Layout) -> Option<NonNull<u8>> {
        debug_assert_ne!(layout.size(), 0);
        NonNull::new(unsafe { alloc::alloc_zeroed(layout) })
    }

    unsafe fn dealloc(&self, ptr: NonNull<u8>, layout: Layout) {
        alloc::dealloc(ptr.as_ptr(), layout);
    }
}

impl<B: BaseAlloc + ?Sized> BaseAlloc for Arc<B> {
    fn alloc_zeroed(&self, layout: Layout) -> Option<NonNull<u8>> {
        (**self).alloc_zeroed(layout)
    }

    unsafe fn dealloc(&self, ptr: NonNull<u8>, layout: Layout) {
        (**self).dealloc(ptr, layout);
    }
}

/// Types for which the all-zero bit pattern is a valid value.
///
/// Leaf arrays come straight from [`BaseAlloc::alloc_zeroed`] and are never
/// initialized any other way, so every leaf element type must be
/// `Zeroable`.
///
/// # Safety
///
/// Implementors must be inhabited by the all-zero bit pattern.
///
/// Zero-sized types, `[T; 0]` included, may implement the trait but are
/// rejected with [`Error::Layout`] when used as the leaf element of a tree.
pub unsafe trait Zeroable {}

macro_rules! impl_zeroable {
    ($($t:ty),+) => {
        $(
            unsafe impl Zeroable for $t {}
        )*
    }
}

impl_zeroable!(
    AtomicBool,
    AtomicU8,
    AtomicU16,
    AtomicU32,
    AtomicU64,
    AtomicUsize,
    AtomicI8,
    AtomicI16,
    AtomicI32,
    AtomicI64,
    AtomicIsize,
    u8,
    u16,
    u32,
    u64,
    usize,
    i8,
    i16,
    i32,
    i64,
    isize
);

unsafe impl<T> Zeroable for AtomicPtr<T> {}

unsafe impl<T: Zeroable, const N: usize> Zeroable for [T; N] {}

/// Cache-line aligned layout of an array of `len` elements of `T`.
pub(crate) fn array_layout<T>(len: usize) -> Result<Layout, Error> {
    Layout::array::<T>(len)
        .and_then(|layout| layout.align_to(CACHELINE))
        .map_err(|_| Error::Layout("array does not fit in the address space"))
}

/// Allocates a zeroed array of `len` elements of `T` from `base`.
pub(crate) fn alloc_array<T, B: BaseAlloc + ?Sized>(
    base: &B,
    len: usize,
) -> Result<NonNull<T>, Error> {
    let layout = array_layout::<T>(len)?;
    if layout.size() == 0 {
        return Err(Error::Layout("array elements must not be zero-sized"));
    }
    base.alloc_zeroed(layout)
        .map(NonNull::cast)
        .ok_or(Error::Alloc {
            bytes: layout.size(),
        })
}

/// Returns an array obtained from [`alloc_array`] to `base`, dropping its
/// elements first.
///
/// # Safety
///
/// `array` must come from `alloc_array::<T>(base, len)`, every element
/// must be initialized, and nothing may reference the array afterwards.
pub(crate) unsafe fn dealloc_array<T, B: BaseAlloc + ?Sized>(
    base: &B,
    array: NonNull<T>,
    len: usize,
) {
    if std::mem::needs_drop::<T>() {
        std::ptr::drop_in_place(std::ptr::slice_from_raw_parts_mut(array.as_ptr(), len));
    }
    match array_layout::<T>(len) {
        Ok(layout) => base.dealloc(array.cast(), layout),
        Err(_) => unreachable!("array was allocated with this layout"),
    }
}

#[test]
fn arrays_are_zeroed_and_aligned() {
    let array: NonNull<AtomicU64> = alloc_array(&SystemBase, 100).unwrap();
    assert_eq!(array.as_ptr() as usize % CACHELINE, 0);
    for i in 0..100 {
        let elm = unsafe { &*array.as_ptr().add(i) };
        assert_eq!(elm.load(std::sync::atomic::Ordering::Relaxed), 0);
    }
    unsafe { dealloc_array(&SystemBase, array, 100) };
}

#[test]
fn zero_sized_arrays_are_rejected() {
    assert_eq!(
        alloc_array::<(), _>(&SystemBase, 16).err(),
        Some(Error::Layout("array elements must not be zero-sized"))
    );
}
