//! Advisory lock-order witnesses for leaf elements.
//!
//! Nothing here provides mutual exclusion. A thread "acquires" a leaf
//! element to announce that it is about to mutate its payload, and the
//! witnesses check, in debug builds only, that the same thread never
//! acquires an element twice, never touches an element it has not
//! acquired, never holds more than [`ELM_ACQUIRE_MAX`] elements, and always
//! acquires elements in ascending key order. In release builds both types
//! are zero-sized and every operation compiles to nothing.

#[cfg(debug_assertions)]
use stack_map::StackMap;

/// Maximum number of leaf elements one thread may hold at once.
pub const ELM_ACQUIRE_MAX: usize = 4;

/// Identity of a leaf element: its address.
#[cfg(debug_assertions)]
fn identity<T>(elm: &T) -> usize {
    elm as *const T as usize
}

/// Per-thread lock-order checker for up to `N` virtual locks of one rank.
///
/// Locks are ordered by a caller-supplied key; a lock may only be taken
/// when its key is at least as large as the key of every lock already
/// held, which rules out lock-order inversions between call sites.
#[derive(Debug, Default)]
pub struct LockOrder<const N: usize> {
    // (ordering key, lock identity) of every held lock
    #[cfg(debug_assertions)]
    held: StackMap<(usize, usize), (), N>,
}

#[cfg(debug_assertions)]
impl<const N: usize> LockOrder<N> {
    /// Records that the lock `id` ordered by `key` is now held.
    pub fn lock(&mut self, key: usize, id: usize) {
        assert!(
            !self.held.contains_key(&(key, id)),
            "witness {id:#x} locked twice"
        );
        if let Some(last) = self.held.len().checked_sub(1).and_then(|i| self.held.get_index(i)) {
            let (max_key, max_id) = last.0;
            assert!(
                max_key <= key,
                "lock order reversal: witness {id:#x} (key {key:#x}) locked \
                 while holding witness {max_id:#x} (key {max_key:#x})"
            );
        }
        assert!(self.held.len() < N, "more than {N} witnesses held");
        self.held.insert((key, id), ());
    }

    /// Records that the lock `id` is no longer held.
    pub fn unlock(&mut self, key: usize, id: usize) {
        assert!(
            self.held.remove(&(key, id)).is_some(),
            "witness {id:#x} unlocked without being held"
        );
    }

    /// Asserts that the lock `id` is held.
    pub fn assert_owner(&self, key: usize, id: usize) {
        assert!(
            self.held.contains_key(&(key, id)),
            "witness {id:#x} is not held"
        );
    }

    /// Number of locks held.
    pub fn held(&self) -> usize {
        self.held.len()
    }
}

#[cfg(not(debug_assertions))]
impl<const N: usize> LockOrder<N> {
    /// Records that the lock `id` ordered by `key` is now held.
    #[inline(always)]
    pub fn lock(&mut self, _key: usize, _id: usize) {}

    /// Records that the lock `id` is no longer held.
    #[inline(always)]
    pub fn unlock(&mut self, _key: usize, _id: usize) {}

    /// Asserts that the lock `id` is held.
    #[inline(always)]
    pub fn assert_owner(&self, _key: usize, _id: usize) {}

    /// Number of locks held.
    #[inline(always)]
    pub fn held(&self) -> usize {
        0
    }
}

/// Per-thread pool of virtual locks over leaf elements.
///
/// Each acquired element occupies one record, keyed by the element's
/// address, that remembers the key the element was looked up with. The
/// key orders the virtual lock in a [`LockOrder`].
#[derive(Debug, Default)]
pub struct ElmWitnesses {
    // element identity -> ordering key
    #[cfg(debug_assertions)]
    slots: StackMap<usize, usize, ELM_ACQUIRE_MAX>,
    #[cfg(debug_assertions)]
    order: LockOrder<ELM_ACQUIRE_MAX>,
}

#[cfg(debug_assertions)]
impl ElmWitnesses {
    /// Acquires the virtual lock of `elm`, which was looked up with `key`.
    ///
    /// # Panics
    ///
    /// If `elm` is already held by this thread, if [`ELM_ACQUIRE_MAX`]
    /// elements are already held, if `key` is zero, or if `key` is smaller
    /// than the key of an element already held.
    pub fn acquire<T>(&mut self, key: usize, elm: &T) {
        let id = identity(elm);
        assert_ne!(key, 0, "leaf element witnesses need a non-zero key");
        assert!(
            !self.slots.contains_key(&id),
            "leaf element {id:#x} acquired twice"
        );
        assert!(
            self.slots.len() < ELM_ACQUIRE_MAX,
            "more than {ELM_ACQUIRE_MAX} leaf elements acquired at once"
        );

        self.order.lock(key, id);
        self.slots.insert(id, key);
    }

    /// Asserts that this thread holds `elm`.
    pub fn access<T>(&self, elm: &T) {
        let id = identity(elm);
        let key = self.key_of(id);
        self.order.assert_owner(key, id);
    }

    /// Releases the virtual lock of `elm`, freeing its record for reuse.
    pub fn release<T>(&mut self, elm: &T) {
        let id = identity(elm);
        let key = self.key_of(id);
        self.order.unlock(key, id);
        self.slots.remove(&id);
    }

    /// Number of elements currently held.
    pub fn held(&self) -> usize {
        self.slots.len()
    }

    fn key_of(&self, id: usize) -> usize {
        match self.slots.get(&id) {
            Some(key) => *key,
            None => panic!("leaf element {id:#x} was never acquired"),
        }
    }
}

#[cfg(not(debug_assertions))]
impl ElmWitnesses {
    /// Acquires the virtual lock of `elm`, which was looked up with `key`.
    #[inline(always)]
    pub fn acquire<T>(&mut self, _key: usize, _elm: &T) {}

    /// Asserts that this thread holds `elm`.
    #[inline(always)]
    pub fn access<T>(&self, _elm: &T) {}

    /// Releases the virtual lock of `elm`, freeing its record for reuse.
    #[inline(always)]
    pub fn release<T>(&mut self, _elm: &T) {}

    /// Number of elements currently held.
    #[inline(always)]
    pub fn held(&self) -> usize {
        0
    }
}

impl ElmWitnesses {
    /// Acquires every element in `elms` in ascending key order, whatever
    /// order they are given in.
    pub fn acquire_ordered<T>(&mut self, elms: &mut [(usize, &T)]) {
        elms.sort_unstable_by_key(|(key, _)| *key);
        for (key, elm) in elms.iter() {
            self.acquire(*key, *elm);
        }
    }

    /// Releases every element in `elms`.
    pub fn release_all<T>(&mut self, elms: &[(usize, &T)]) {
        for (_, elm) in elms.iter().rev() {
            self.release(*elm);
        }
    }
}

#[cfg(all(test, debug_assertions))]
mod tests {
    use super::*;

    #[test]
    fn ordered_locking() {
        let mut order = LockOrder::<3>::default();
        order.lock(1, 0x10);
        order.lock(2, 0x20);
        // equal keys never conflict
        order.lock(2, 0x30);
        order.assert_owner(2, 0x20);
        assert_eq!(order.held(), 3);

        order.unlock(2, 0x30);
        order.unlock(2, 0x20);
        order.unlock(1, 0x10);
        assert_eq!(order.held(), 0);

        // after releasing everything, any key may come first again
        order.lock(1, 0x10);
        order.unlock(1, 0x10);
    }

    #[test]
    #[should_panic(expected = "lock order reversal")]
    fn reversal_is_fatal() {
        let mut order = LockOrder::<2>::default();
        order.lock(2, 0x20);
        order.lock(1, 0x10);
    }

    #[test]
    #[should_panic(expected = "unlocked without being held")]
    fn unlock_unheld_is_fatal() {
        let mut order = LockOrder::<2>::default();
        order.unlock(2, 0x20);
    }

    #[test]
    fn records_are_reused() {
        let elms = [0_u64; ELM_ACQUIRE_MAX + 1];
        let mut witnesses = ElmWitnesses::default();

        for round in 0..3 {
            for (i, elm) in elms.iter().take(ELM_ACQUIRE_MAX).enumerate() {
                witnesses.acquire(round * 16 + i + 1, elm);
            }
            for elm in elms.iter().take(ELM_ACQUIRE_MAX) {
                witnesses.access(elm);
            }
            assert_eq!(witnesses.held(), ELM_ACQUIRE_MAX);
            for elm in &elms[..ELM_ACQUIRE_MAX] {
                witnesses.release(elm);
            }
            assert_eq!(witnesses.held(), 0);
        }

        // the same element, a different key
        witnesses.acquire(100, &elms[ELM_ACQUIRE_MAX]);
        witnesses.release(&elms[ELM_ACQUIRE_MAX]);
        witnesses.acquire(7, &elms[ELM_ACQUIRE_MAX]);
        witnesses.release(&elms[ELM_ACQUIRE_MAX]);
    }

    #[test]
    #[should_panic(expected = "never acquired")]
    fn access_unacquired_is_fatal() {
        let elm = 0_u64;
        let witnesses = ElmWitnesses::default();
        witnesses.access(&elm);
    }
}
