#![no_main]
#[macro_use]
extern crate libfuzzer_sys;
extern crate concurrent_rtree;

use concurrent_rtree::{Geometry, MAX_HEIGHT, MAX_LEVEL_BITS};

fuzz_target!(|data: (u32, Vec<u32>)| {
    let serialized = bincode::serialize(&data).unwrap();

    let geometry: Geometry = match bincode::deserialize(&serialized) {
        Ok(geometry) => geometry,
        Err(_) => {
            assert!(Geometry::from_bits(data.0, &data.1).is_err());
            return;
        }
    };

    assert!((1..=MAX_HEIGHT).contains(&geometry.height()));
    assert_eq!(geometry.ignored_high_bits(), data.0);

    let mut cumbits = geometry.ignored_high_bits();
    for (level, bits) in geometry.levels().iter().zip(&data.1) {
        assert!(level.bits > 0 && level.bits <= MAX_LEVEL_BITS);
        assert_eq!(level.bits, *bits);
        cumbits += level.bits;
        assert_eq!(level.cumbits, cumbits);
    }
    assert!(cumbits <= usize::BITS);

    let reserialized = bincode::serialize(&geometry).unwrap();
    assert_eq!(serialized, reserialized);
});
