//! Row identity used as the key for delta records.
//!
//! Big-endian so that byte order matches `(table_id, row_id)` order and all
//! deltas of a table are contiguous in the key space.

use bytes::{BufMut, Bytes, BytesMut};

pub const ROW_KEY_LEN: usize = 4 + 8;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("row key must be 12 bytes, got {0}")]
pub struct RowKeyError(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RowKey {
    pub table_id: u32,
    pub row_id: u64,
}

impl RowKey {
    pub fn new(table_id: u32, row_id: u64) -> Self {
        Self { table_id, row_id }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(ROW_KEY_LEN);
        buf.put_u32(self.table_id);
        buf.put_u64(self.row_id);
        buf.freeze()
    }

    pub fn decode(input: &[u8]) -> Result<Self, RowKeyError> {
        let raw: [u8; ROW_KEY_LEN] = input
            .try_into()
            .map_err(|_| RowKeyError(input.len()))?;
        let mut table_id = [0u8; 4];
        let mut row_id = [0u8; 8];
        table_id.copy_from_slice(&raw[..4]);
        row_id.copy_from_slice(&raw[4..]);
        Ok(Self {
            table_id: u32::from_be_bytes(table_id),
            row_id: u64::from_be_bytes(row_id),
        })
    }

    /// First key of `table_id`'s key range.
    pub fn table_start(table_id: u32) -> Bytes {
        Self::new(table_id, 0).encode()
    }
}

impl From<RowKey> for Bytes {
    fn from(key: RowKey) -> Self {
        key.encode()
    }
}
