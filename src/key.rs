//! Resource identity — the (type, group, instance) triple.
//!
//! # On-disk layout (16 bytes, all fields little-endian)
//!
//! ```text
//! Offset  Size  Field
//!    0      4   type_id      (LE u32)
//!    4      4   group_id     (LE u32)
//!    8      8   instance_id  (LE u64)
//! ```
//!
//! Keys are opaque: the library attaches no semantics to type values.
//! Ordering is lexicographic over (type, group, instance) and is the order
//! used wherever entries are sorted for display or dedup.  Equality and
//! hashing are field-wise, so a key is usable directly in hash maps.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Byte length of a serialized key.
pub const KEY_SIZE: usize = 16;

#[derive(Error, Debug)]
pub enum KeyParseError {
    #[error("Expected TYPE:GROUP:INSTANCE, got {0:?}")]
    BadShape(String),
    #[error("Invalid hex field {field}: {source}")]
    BadField {
        field:  &'static str,
        source: std::num::ParseIntError,
    },
}

/// The TGI triple identifying one resource inside a package.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceKey {
    pub type_id:     u32,
    pub group_id:    u32,
    pub instance_id: u64,
}

impl ResourceKey {
    #[inline]
    pub fn new(type_id: u32, group_id: u32, instance_id: u64) -> Self {
        Self { type_id, group_id, instance_id }
    }

    /// Parse the 16-byte wire form.  Infallible: any 16 bytes are a key.
    pub fn from_bytes(bytes: &[u8; KEY_SIZE]) -> Self {
        Self {
            type_id:     u32::from_le_bytes(bytes[0..4].try_into().unwrap()),
            group_id:    u32::from_le_bytes(bytes[4..8].try_into().unwrap()),
            instance_id: u64::from_le_bytes(bytes[8..16].try_into().unwrap()),
        }
    }

    /// Emit the 16-byte wire form.
    pub fn to_bytes(self) -> [u8; KEY_SIZE] {
        let mut buf = [0u8; KEY_SIZE];
        buf[0..4].copy_from_slice(&self.type_id.to_le_bytes());
        buf[4..8].copy_from_slice(&self.group_id.to_le_bytes());
        buf[8..16].copy_from_slice(&self.instance_id.to_le_bytes());
        buf
    }

    /// High 32 bits of the instance, as hoisted into a shared index header.
    #[inline]
    pub fn instance_high(self) -> u32 {
        (self.instance_id >> 32) as u32
    }

    /// Low 32 bits of the instance, always stored per entry.
    #[inline]
    pub fn instance_low(self) -> u32 {
        self.instance_id as u32
    }

    /// Reassemble an instance id from its hoisted/per-entry halves.
    #[inline]
    pub fn join_instance(high: u32, low: u32) -> u64 {
        ((high as u64) << 32) | low as u64
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:08X}:{:08X}:{:016X}",
            self.type_id, self.group_id, self.instance_id
        )
    }
}

impl FromStr for ResourceKey {
    type Err = KeyParseError;

    /// Parse the `TYPE:GROUP:INSTANCE` display form (hex, `0x` prefixes
    /// tolerated).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split(':');
        let (t, g, i) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(t), Some(g), Some(i), None) => (t, g, i),
            _ => return Err(KeyParseError::BadShape(s.to_owned())),
        };
        let strip = |p: &str| p.trim().trim_start_matches("0x").trim_start_matches("0X").to_owned();
        let type_id = u32::from_str_radix(&strip(t), 16)
            .map_err(|source| KeyParseError::BadField { field: "type", source })?;
        let group_id = u32::from_str_radix(&strip(g), 16)
            .map_err(|source| KeyParseError::BadField { field: "group", source })?;
        let instance_id = u64::from_str_radix(&strip(i), 16)
            .map_err(|source| KeyParseError::BadField { field: "instance", source })?;
        Ok(Self { type_id, group_id, instance_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn wire_roundtrip() {
        let key = ResourceKey::new(0x0333_9892, 0x0000_0002, 0x1234_5678_9ABC_DEF0);
        assert_eq!(ResourceKey::from_bytes(&key.to_bytes()), key);
    }

    #[test]
    fn wire_is_little_endian() {
        let key = ResourceKey::new(0x220557DA, 0, 0x1234);
        let bytes = key.to_bytes();
        assert_eq!(&bytes[0..4], &[0xDA, 0x57, 0x05, 0x22]);
        assert_eq!(&bytes[8..10], &[0x34, 0x12]);
    }

    #[test]
    fn display_parse_roundtrip() {
        let key = ResourceKey::new(0x00B2D882, 0x80000000, 0xFF00_0000_0000_0001);
        let shown = key.to_string();
        assert_eq!(shown, "00B2D882:80000000:FF00000000000001");
        assert_eq!(shown.parse::<ResourceKey>().unwrap(), key);
        assert_eq!("0x00B2D882:0x80000000:0xFF00000000000001".parse::<ResourceKey>().unwrap(), key);
    }

    #[test]
    fn parse_rejects_bad_shapes() {
        assert!("1234:5678".parse::<ResourceKey>().is_err());
        assert!("1:2:3:4".parse::<ResourceKey>().is_err());
        assert!("xx:yy:zz".parse::<ResourceKey>().is_err());
    }

    #[test]
    fn instance_split_and_join() {
        let key = ResourceKey::new(1, 2, 0xDEAD_BEEF_0000_0042);
        assert_eq!(key.instance_high(), 0xDEAD_BEEF);
        assert_eq!(key.instance_low(), 0x0000_0042);
        assert_eq!(
            ResourceKey::join_instance(key.instance_high(), key.instance_low()),
            key.instance_id
        );
    }

    proptest! {
        #[test]
        fn ordering_is_total(
            a in any::<(u32, u32, u64)>(),
            b in any::<(u32, u32, u64)>(),
            c in any::<(u32, u32, u64)>(),
        ) {
            let k = |(t, g, i): (u32, u32, u64)| ResourceKey::new(t, g, i);
            let (a, b, c) = (k(a), k(b), k(c));

            // Transitivity.
            if a < b && b < c {
                prop_assert!(a < c);
            }
            // Antisymmetry / equality agreement.
            prop_assert_eq!(a == b, a <= b && b <= a);
            // Lexicographic over the field tuple.
            let tup = |x: ResourceKey| (x.type_id, x.group_id, x.instance_id);
            prop_assert_eq!(a.cmp(&b), tup(a).cmp(&tup(b)));
        }

        #[test]
        fn bytes_roundtrip_any(t in any::<u32>(), g in any::<u32>(), i in any::<u64>()) {
            let key = ResourceKey::new(t, g, i);
            prop_assert_eq!(ResourceKey::from_bytes(&key.to_bytes()), key);
        }
    }
}
