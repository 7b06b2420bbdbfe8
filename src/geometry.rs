//! Level geometry of the tree and the key arithmetic derived from it.
//!
//! Only the most significant bits of a key take part in a lookup. The
//! `nhib` highest bits are ignored entirely (they are always zero or
//! always sign-extended in a real address space), the next bits are
//! consumed level by level from the root, and the remaining low bits
//! address bytes within a page and are ignored as well.

use crate::Error;

/// Maximum number of levels a [`Geometry`] may have.
pub const MAX_HEIGHT: usize = 4;

/// Maximum number of key bits a single level may consume.
pub const MAX_LEVEL_BITS: u32 = 26;

/// Number of direct-mapped entries in the first level of the
/// per-thread leaf cache.
pub const CACHE_L1_LEN: usize = 16;

/// Number of entries in the recency-ordered second level of the
/// per-thread leaf cache.
pub const CACHE_L2_LEN: usize = 8;

/// Leaf key stored in empty cache entries.
///
/// The final level always consumes at least one bit, so bit 0 of a real
/// leaf key is always clear and this value can never match one.
pub const LEAF_KEY_INVALID: usize = 1;

/// Alignment of every interior and leaf array.
pub const CACHELINE: usize = 64;

const KEY_BITS: u32 = usize::BITS;

const _: () = assert!(CACHE_L1_LEN.is_power_of_two());

/// One level of the tree.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Level {
    /// Number of key bits consumed by this level.
    pub bits: u32,
    /// Number of key bits consumed by this level and every level above
    /// it, counting the ignored high bits.
    pub cumbits: u32,
}

/// The bit layout of a tree: its height and the key bits each level
/// consumes.
///
/// A `Geometry` can only be built through its validating constructors,
/// so every instance describes a usable tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    levels: [Level; MAX_HEIGHT],
    height: usize,
}

impl Default for Geometry {
    fn default() -> Geometry {
        Geometry::DEFAULT
    }
}

impl Geometry {
    /// Geometry for the host: 48-bit virtual addresses on 64-bit targets,
    /// 32-bit addresses otherwise, with 4 KiB pages.
    pub const DEFAULT: Geometry = {
        let lg_vaddr = if KEY_BITS == 64 { 48 } else { KEY_BITS };
        match Geometry::for_address_space(lg_vaddr, 12) {
            Ok(geometry) => geometry,
            Err(_) => panic!("default rtree geometry is invalid"),
        }
    };

    /// Derives a geometry covering `2^lg_vaddr` bytes of address space at
    /// `2^lg_page` byte granularity, using the shallowest tree (at most three
    /// levels) whose levels stay reasonably narrow.
    pub const fn for_address_space(lg_vaddr: u32, lg_page: u32) -> Result<Geometry, Error> {
        if lg_vaddr > KEY_BITS {
            return Err(Error::Geometry("address space is wider than a key"));
        }
        if lg_page >= lg_vaddr {
            return Err(Error::Geometry("page must be smaller than the address space"));
        }

        let nsb = lg_vaddr - lg_page;
        let nhib = KEY_BITS - lg_vaddr;
        let mut bits = [0_u32; MAX_HEIGHT];

        let height = if nsb <= 10 {
            bits[0] = nsb;
            1
        } else if nsb <= 36 {
            bits[0] = nsb / 2;
            bits[1] = nsb / 2 + nsb % 2;
            2
        } else if nsb <= 52 {
            bits[0] = nsb / 3;
            bits[1] = nsb / 3 + nsb % 3 / 2;
            bits[2] = nsb / 3 + nsb % 3 - nsb % 3 / 2;
            3
        } else {
            return Err(Error::Geometry(
                "too many significant bits for a three level tree",
            ));
        };

        Geometry::build(nhib, bits, height)
    }

    /// Builds a geometry from an explicit level table. `nhib` high key bits
    /// are ignored, then level `i` consumes `bits[i]` bits.
    pub const fn from_bits(nhib: u32, bits: &[u32]) -> Result<Geometry, Error> {
        if bits.is_empty() {
            return Err(Error::Geometry("a tree needs at least one level"));
        }
        if bits.len() > MAX_HEIGHT {
            return Err(Error::Geometry("too many levels"));
        }

        let mut table = [0_u32; MAX_HEIGHT];
        let mut i = 0;
        while i < bits.len() {
            table[i] = bits[i];
            i += 1;
        }

        Geometry::build(nhib, table, bits.len())
    }

    const fn build(nhib: u32, bits: [u32; MAX_HEIGHT], height: usize) -> Result<Geometry, Error> {
        if nhib >= KEY_BITS {
            return Err(Error::Geometry("every key bit is ignored"));
        }

        let mut levels = [Level { bits: 0, cumbits: 0 }; MAX_HEIGHT];
        let mut cumbits = nhib;
        let mut i = 0;
        while i < height {
            if bits[i] == 0 || bits[i] > MAX_LEVEL_BITS {
                return Err(Error::Geometry("level width out of range"));
            }
            cumbits += bits[i];
            if cumbits > KEY_BITS {
                return Err(Error::Geometry("levels consume more bits than a key has"));
            }
            levels[i] = Level {
                bits: bits[i],
                cumbits,
            };
            i += 1;
        }

        Ok(Geometry { levels, height })
    }

    /// Number of levels, including the leaf level.
    pub const fn height(&self) -> usize {
        self.height
    }

    /// The levels from the root down to the leaves.
    pub fn levels(&self) -> &[Level] {
        &self.levels[..self.height]
    }

    /// Number of high key bits that no level consumes.
    pub const fn ignored_high_bits(&self) -> u32 {
        self.levels[0].cumbits - self.levels[0].bits
    }

    /// Number of elements in an array at `level`.
    pub const fn level_len(&self, level: usize) -> usize {
        1 << self.levels[level].bits
    }

    /// Distance between two keys that land in adjacent leaf slots.
    pub const fn key_stride(&self) -> usize {
        match 1_usize.checked_shl(KEY_BITS - self.levels[self.height - 1].cumbits) {
            Some(stride) => stride,
            None => 0,
        }
    }

    /// Index into the array at `level` selected by `key`.
    #[inline]
    pub const fn subkey(&self, key: usize, level: usize) -> usize {
        let Level { bits, cumbits } = self.levels[level];
        let shifted = match key.checked_shr(KEY_BITS - cumbits) {
            Some(shifted) => shifted,
            None => 0,
        };
        shifted & ((1 << bits) - 1)
    }

    /// Number of low key bits that select a slot within a leaf array (or
    /// are ignored below it).
    #[inline]
    const fn leaf_shift(&self) -> u32 {
        let last = self.levels[self.height - 1];
        KEY_BITS - (last.cumbits - last.bits)
    }

    /// `key` with the bits below the leaf level cleared. Keys with equal
    /// leaf keys live in the same leaf array.
    #[inline]
    pub const fn leaf_key(&self, key: usize) -> usize {
        match usize::MAX.checked_shl(self.leaf_shift()) {
            Some(mask) => key & mask,
            None => 0,
        }
    }

    /// Direct-mapped L1 cache slot for `key`.
    #[inline]
    pub const fn cache_slot(&self, key: usize) -> usize {
        let shifted = match key.checked_shr(self.leaf_shift()) {
            Some(shifted) => shifted,
            None => 0,
        };
        shifted & (CACHE_L1_LEN - 1)
    }
}

#[cfg(target_pointer_width = "64")]
#[test]
fn default_geometry() {
    let g = Geometry::DEFAULT;
    assert_eq!(g.height(), 2);
    assert_eq!(
        g.levels(),
        &[
            Level {
                bits: 18,
                cumbits: 34
            },
            Level {
                bits: 18,
                cumbits: 52
            }
        ]
    );
    assert_eq!(g.ignored_high_bits(), 16);
    assert_eq!(g.key_stride(), 4096);
    assert_eq!(g.level_len(0), 1 << 18);
}

#[cfg(target_pointer_width = "64")]
#[test]
fn address_space_heights() {
    assert_eq!(Geometry::for_address_space(22, 12).unwrap().height(), 1);
    assert_eq!(Geometry::for_address_space(48, 12).unwrap().height(), 2);

    let g = Geometry::for_address_space(64, 12).unwrap();
    assert_eq!(g.height(), 3);
    let bits: Vec<u32> = g.levels().iter().map(|l| l.bits).collect();
    assert_eq!(bits, vec![17, 17, 18]);
    assert_eq!(g.levels()[2].cumbits, 52);

    assert!(Geometry::for_address_space(12, 12).is_err());
    assert!(Geometry::for_address_space(64, 4).is_err());
    assert!(Geometry::for_address_space(65, 12).is_err());
}

#[test]
fn explicit_tables_are_validated() {
    assert!(Geometry::from_bits(0, &[]).is_err());
    assert!(Geometry::from_bits(0, &[4, 4, 4, 4, 4]).is_err());
    assert!(Geometry::from_bits(0, &[0, 4]).is_err());
    assert!(Geometry::from_bits(0, &[MAX_LEVEL_BITS + 1]).is_err());
    assert!(Geometry::from_bits(KEY_BITS - 8, &[4, 5]).is_err());
    assert!(Geometry::from_bits(KEY_BITS, &[1]).is_err());

    let g = Geometry::from_bits(KEY_BITS - 32, &[5, 5, 5, 5]).unwrap();
    assert_eq!(g.height(), 4);
    assert_eq!(g.key_stride(), 1 << 12);
}

#[test]
fn key_decomposition() {
    let g = Geometry::from_bits(KEY_BITS - 32, &[8, 12]).unwrap();
    let key: usize = 0xab_cde_123;

    assert_eq!(g.subkey(key, 0), 0xab);
    assert_eq!(g.subkey(key, 1), 0xcde);
    assert_eq!(g.leaf_key(key), 0xab_000_000);
    assert_eq!(g.cache_slot(key), 0xb);

    // the same leaf, a different slot
    let neighbor = key + g.key_stride();
    assert_eq!(g.leaf_key(neighbor), g.leaf_key(key));
    assert_eq!(g.subkey(neighbor, 1), 0xcdf);

    // page offsets are ignored
    assert_eq!(g.subkey(key ^ 0x123, 1), g.subkey(key, 1));
}

#[test]
fn leaf_keys_never_collide_with_invalid() {
    let g = Geometry::from_bits(0, &[3, 1]).unwrap();
    for key in [0, 1, usize::MAX, usize::MAX / 2, 0x1234_5678] {
        assert_eq!(g.leaf_key(key) & LEAF_KEY_INVALID, 0);
        assert!(g.cache_slot(key) < CACHE_L1_LEN);
    }

    // no ignored bits at all: the leaf key is empty
    let g = Geometry::from_bits(0, &[10]).unwrap();
    assert_eq!(g.leaf_key(usize::MAX), 0);
    assert_eq!(g.cache_slot(usize::MAX), 0);
}
