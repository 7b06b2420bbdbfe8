#![no_main]
#[macro_use]
extern crate libfuzzer_sys;
extern crate arbitrary;
extern crate concurrent_rtree;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use arbitrary::Arbitrary;
use concurrent_rtree::{Geometry, Rtree};

const KEY_BITS: u32 = 32;

#[derive(Debug)]
enum Op {
    Store { key: usize, value: u64 },
    Load { key: usize },
    Dependent { key: usize },
    Reset,
}

impl<'a> Arbitrary<'a> for Op {
    fn arbitrary(u: &mut arbitrary::Unstructured<'a>) -> arbitrary::Result<Self> {
        let key = u.int_in_range(0..=(1_usize << KEY_BITS) - 1)?;
        Ok(if u.ratio(1, 2)? {
            Op::Store {
                key,
                value: u.arbitrary()?,
            }
        } else if u.ratio(2, 3)? {
            Op::Load { key }
        } else if u.ratio(1, 2)? {
            Op::Dependent { key }
        } else {
            Op::Reset
        })
    }
}

fuzz_target!(|ops: Vec<Op>| {
    let geometry = Geometry::from_bits(usize::BITS - KEY_BITS, &[4, 6, 10]).unwrap();
    let tree = Rtree::<AtomicU64>::new(geometry).unwrap();
    let mut ctx = tree.ctx();

    let mut values = HashMap::new();
    let mut leaves = HashSet::new();

    for op in ops {
        match op {
            Op::Store { key, value } => {
                ctx.lookup(key, true).unwrap().store(value, Ordering::Relaxed);
                values.insert(key >> 12, value);
                leaves.insert(geometry.leaf_key(key));
            }
            Op::Load { key } => {
                let got = ctx.lookup(key, false).map(|elm| elm.load(Ordering::Relaxed));
                let expected = leaves
                    .contains(&geometry.leaf_key(key))
                    .then(|| values.get(&(key >> 12)).copied().unwrap_or(0));
                assert_eq!(got, expected);
            }
            Op::Dependent { key } => {
                // only keys whose leaf this thread created are safe to walk
                // with relaxed loads
                if leaves.contains(&geometry.leaf_key(key)) {
                    let elm = unsafe { ctx.lookup_dependent(key) }.unwrap();
                    let expected = values.get(&(key >> 12)).copied().unwrap_or(0);
                    assert_eq!(elm.load(Ordering::Relaxed), expected);
                }
            }
            Op::Reset => ctx.reset(),
        }
    }

    assert_eq!(tree.materialized().leaves, leaves.len());
});
