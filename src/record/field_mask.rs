/// Fixed-width per-field bitset stored the way it is laid out on the wire.
///
/// Bit `i` lives in bit `i % 8` of byte `i / 8`; trailing bits of the last byte
/// are always zero.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FieldMask {
    field_count: usize,
    bytes: Vec<u8>,
}

impl FieldMask {
    pub fn new(field_count: usize) -> Self {
        Self {
            field_count,
            bytes: vec![0u8; Self::byte_len(field_count)],
        }
    }

    /// Number of bytes a mask over `field_count` fields occupies.
    pub fn byte_len(field_count: usize) -> usize {
        field_count.div_ceil(8)
    }

    pub(crate) fn from_bytes(field_count: usize, bytes: &[u8]) -> Self {
        let mut mask = Self::new(field_count);
        mask.bytes.copy_from_slice(&bytes[..Self::byte_len(field_count)]);
        if field_count % 8 != 0 {
            if let Some(last) = mask.bytes.last_mut() {
                *last &= (1u8 << (field_count % 8)) - 1;
            }
        }
        mask
    }

    pub fn get(&self, idx: usize) -> bool {
        idx < self.field_count && self.bytes[idx / 8] & (1 << (idx % 8)) != 0
    }

    pub fn set(&mut self, idx: usize) {
        assert!(idx < self.field_count, "field {idx} out of range");
        self.bytes[idx / 8] |= 1 << (idx % 8);
    }

    pub fn count_ones(&self) -> usize {
        self.bytes.iter().map(|b| b.count_ones() as usize).sum()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}
