use std::fmt;

use serde::de::{self, Deserializer, MapAccess, SeqAccess, Visitor};
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};

use crate::Geometry;

const FIELDS: &[&str] = &["ignored_bits", "level_bits"];

impl Serialize for Geometry {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let level_bits: Vec<u32> = self.levels().iter().map(|level| level.bits).collect();

        let mut state = s.serialize_struct("Geometry", FIELDS.len())?;
        state.serialize_field("ignored_bits", &self.ignored_high_bits())?;
        state.serialize_field("level_bits", &level_bits)?;
        state.end()
    }
}

struct GeometryVisitor;

impl GeometryVisitor {
    fn build<E: de::Error>(ignored_bits: u32, level_bits: &[u32]) -> Result<Geometry, E> {
        Geometry::from_bits(ignored_bits, level_bits).map_err(E::custom)
    }
}

impl<'de> Visitor<'de> for GeometryVisitor {
    type Value = Geometry;

    fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str("an rtree geometry with ignored_bits and level_bits")
    }

    fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
    where
        A: SeqAccess<'de>,
    {
        let ignored_bits: u32 = seq
            .next_element()?
            .ok_or_else(|| de::Error::invalid_length(0, &self))?;
        let level_bits: Vec<u32> = seq
            .next_element()?
            .ok_or_else(|| de::Error::invalid_length(1, &self))?;

        GeometryVisitor::build(ignored_bits, &level_bits)
    }

    fn visit_map<M>(self, mut access: M) -> Result<Self::Value, M::Error>
    where
        M: MapAccess<'de>,
    {
        let mut ignored_bits: Option<u32> = None;
        let mut level_bits: Option<Vec<u32>> = None;

        while let Some(key) = access.next_key::<String>()? {
            match key.as_str() {
                "ignored_bits" => {
                    if ignored_bits.is_some() {
                        return Err(de::Error::duplicate_field("ignored_bits"));
                    }
                    ignored_bits = Some(access.next_value()?);
                }
                "level_bits" => {
                    if level_bits.is_some() {
                        return Err(de::Error::duplicate_field("level_bits"));
                    }
                    level_bits = Some(access.next_value()?);
                }
                other => return Err(de::Error::unknown_field(other, FIELDS)),
            }
        }

        let ignored_bits = ignored_bits.ok_or_else(|| de::Error::missing_field("ignored_bits"))?;
        let level_bits = level_bits.ok_or_else(|| de::Error::missing_field("level_bits"))?;

        GeometryVisitor::build(ignored_bits, &level_bits)
    }
}

impl<'de> Deserialize<'de> for Geometry {
    fn deserialize<D>(d: D) -> Result<Geometry, D::Error>
    where
        D: Deserializer<'de>,
    {
        d.deserialize_struct("Geometry", FIELDS, GeometryVisitor)
    }
}

#[test]
fn geometry_survives_bincode() {
    let geometry = Geometry::from_bits(usize::BITS - 40, &[8, 10, 10]).unwrap();
    let serialized = bincode::serialize(&geometry).unwrap();
    let deserialized: Geometry = bincode::deserialize(&serialized).unwrap();
    assert_eq!(geometry, deserialized);
}

#[test]
fn invalid_tables_are_rejected() {
    // ignored_bits, then a length-prefixed level table with a zero width
    let serialized = bincode::serialize(&(16_u32, vec![0_u32, 12])).unwrap();
    assert!(bincode::deserialize::<Geometry>(&serialized).is_err());

    let serialized = bincode::serialize(&(16_u32, vec![1_u32; 5])).unwrap();
    assert!(bincode::deserialize::<Geometry>(&serialized).is_err());
}
