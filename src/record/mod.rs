//! Delta record wire format.
//!
//! Every record starts with a one-byte [`RecordType`] tag. All integers are
//! little-endian.
//!
//! ```text
//! Insert: [tag=0][is_deleted u8][table_id u32][path_len u32][path]
//!         [field_count u32][load_num u32]
//!         [null_mask ceil(n/8)][field_head n*u32][body]
//! Update: [tag=1][table_id u32][path_len u32][path]
//!         [field_count u32][load_num u32]
//!         [null_mask ceil(n/8)][update_mask ceil(n/8)][field_head n*u32][body]
//! Delete: [tag=2][table_id u32][path_len u32][path][load_num u32]
//! ```
//!
//! Insert bodies hold the payload of every non-null field in field order.
//! Update bodies hold payloads only for fields whose update bit is set and
//! whose null bit is clear. `field_head[i]` is the payload length of field `i`
//! and is zero for fields without a payload.
//!
//! Encoding a header reports a [`HeaderLayout`] so that the masks and the
//! field-length table can be patched in after the body has been written.

mod field_mask;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

pub use field_mask::FieldMask;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("truncated input")]
    Truncated,

    #[error("unknown record type: {0}")]
    UnknownRecordType(u8),

    #[error("expected {expected:?} record, found {found:?}")]
    UnexpectedRecordType {
        expected: RecordType,
        found: RecordType,
    },

    #[error("table path is not valid utf-8")]
    InvalidTablePath,

    #[error("field count mismatch: existing {existing}, incoming {incoming}")]
    FieldCountMismatch { existing: u32, incoming: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum RecordType {
    Insert = 0,
    Update = 1,
    Delete = 2,
}

impl RecordType {
    pub fn from_u8(value: u8) -> Result<Self, DecodeError> {
        match value {
            0 => Ok(Self::Insert),
            1 => Ok(Self::Update),
            2 => Ok(Self::Delete),
            other => Err(DecodeError::UnknownRecordType(other)),
        }
    }

    /// Reads the tag of an encoded record without decoding the rest.
    pub fn peek(input: &[u8]) -> Result<Self, DecodeError> {
        let tag = input.first().ok_or(DecodeError::Truncated)?;
        Self::from_u8(*tag)
    }
}

/// Absolute offsets of the patchable sections of an encoded header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderLayout {
    pub null_offset: usize,
    /// Only present for update records.
    pub update_offset: Option<usize>,
    pub field_head_offset: usize,
}

/// Bounds-checked cursor over an encoded record.
#[derive(Debug)]
pub(crate) struct RecordReader<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> RecordReader<'a> {
    pub(crate) fn new(input: &'a [u8]) -> Self {
        Self { input, pos: 0 }
    }

    pub(crate) fn at(input: &'a [u8], pos: usize) -> Self {
        Self { input, pos }
    }

    pub(crate) fn position(&self) -> usize {
        self.pos
    }

    pub(crate) fn take(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        let end = self.pos.checked_add(len).ok_or(DecodeError::Truncated)?;
        let out = self
            .input
            .get(self.pos..end)
            .ok_or(DecodeError::Truncated)?;
        self.pos = end;
        Ok(out)
    }

    pub(crate) fn skip(&mut self, len: usize) -> Result<(), DecodeError> {
        self.take(len).map(|_| ())
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        let raw = self.take(4)?;
        Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    fn tag(&mut self, expected: RecordType) -> Result<(), DecodeError> {
        let found = RecordType::from_u8(self.u8()?)?;
        if found != expected {
            return Err(DecodeError::UnexpectedRecordType { expected, found });
        }
        Ok(())
    }

    fn table_path(&mut self) -> Result<String, DecodeError> {
        let len = self.u32()? as usize;
        let raw = self.take(len)?;
        std::str::from_utf8(raw)
            .map(str::to_owned)
            .map_err(|_| DecodeError::InvalidTablePath)
    }

    fn mask(&mut self, field_count: usize) -> Result<FieldMask, DecodeError> {
        let raw = self.take(FieldMask::byte_len(field_count))?;
        Ok(FieldMask::from_bytes(field_count, raw))
    }

    fn field_head(&mut self, field_count: usize) -> Result<Vec<u32>, DecodeError> {
        (0..field_count).map(|_| self.u32()).collect()
    }
}

fn put_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn put_table_path(buf: &mut Vec<u8>, path: &str) {
    put_u32(buf, wire_len(path.len(), "table path"));
    buf.extend_from_slice(path.as_bytes());
}

fn put_field_head(buf: &mut Vec<u8>, field_head: &[u32]) {
    for len in field_head {
        put_u32(buf, *len);
    }
}

/// Serializes a field-length table in its wire form, for post-hoc patching.
pub fn encode_field_head(field_head: &[u32]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(field_head.len() * 4);
    put_field_head(&mut buf, field_head);
    buf
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertHeader {
    pub is_deleted: bool,
    pub table_id: u32,
    pub table_path: String,
    pub field_count: u32,
    pub load_num: u32,
    pub null_mask: FieldMask,
    pub field_head: Vec<u32>,
}

impl InsertHeader {
    /// Header with every field non-null and zero length.
    pub fn new(
        is_deleted: bool,
        table_id: u32,
        table_path: impl Into<String>,
        field_count: u32,
        load_num: u32,
    ) -> Self {
        Self {
            is_deleted,
            table_id,
            table_path: table_path.into(),
            field_count,
            load_num,
            null_mask: FieldMask::new(field_count as usize),
            field_head: vec![0; field_count as usize],
        }
    }

    pub fn encoded_len(&self) -> usize {
        let n = self.field_count as usize;
        1 + 1 + 4 + 4 + self.table_path.len() + 4 + 4 + FieldMask::byte_len(n) + 4 * n
    }

    /// Sum of the payload lengths of the non-null fields.
    pub fn body_len(&self) -> usize {
        (0..self.field_count as usize)
            .filter(|&i| !self.null_mask.get(i))
            .map(|i| self.field_head[i] as usize)
            .sum()
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>) -> HeaderLayout {
        debug_assert_eq!(self.field_head.len(), self.field_count as usize);
        buf.push(RecordType::Insert as u8);
        buf.push(u8::from(self.is_deleted));
        put_u32(buf, self.table_id);
        put_table_path(buf, &self.table_path);
        put_u32(buf, self.field_count);
        put_u32(buf, self.load_num);
        let null_offset = buf.len();
        buf.extend_from_slice(self.null_mask.as_bytes());
        let field_head_offset = buf.len();
        put_field_head(buf, &self.field_head);
        HeaderLayout {
            null_offset,
            update_offset: None,
            field_head_offset,
        }
    }

    pub fn encode_to_vec(&self) -> (Vec<u8>, HeaderLayout) {
        let mut buf = Vec::with_capacity(self.encoded_len());
        let layout = self.encode_into(&mut buf);
        (buf, layout)
    }

    /// Decodes the header and returns it along with the body cursor.
    pub fn decode(input: &[u8]) -> Result<(Self, usize), DecodeError> {
        let mut reader = RecordReader::new(input);
        reader.tag(RecordType::Insert)?;
        let is_deleted = reader.u8()? != 0;
        let table_id = reader.u32()?;
        let table_path = reader.table_path()?;
        let field_count = reader.u32()?;
        let load_num = reader.u32()?;
        let null_mask = reader.mask(field_count as usize)?;
        let field_head = reader.field_head(field_count as usize)?;
        Ok((
            Self {
                is_deleted,
                table_id,
                table_path,
                field_count,
                load_num,
                null_mask,
                field_head,
            },
            reader.position(),
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateHeader {
    pub table_id: u32,
    pub table_path: String,
    pub field_count: u32,
    pub load_num: u32,
    pub null_mask: FieldMask,
    pub update_mask: FieldMask,
    pub field_head: Vec<u32>,
}

impl UpdateHeader {
    /// Header that touches no field.
    pub fn new(table_id: u32, table_path: impl Into<String>, field_count: u32, load_num: u32) -> Self {
        Self {
            table_id,
            table_path: table_path.into(),
            field_count,
            load_num,
            null_mask: FieldMask::new(field_count as usize),
            update_mask: FieldMask::new(field_count as usize),
            field_head: vec![0; field_count as usize],
        }
    }

    pub fn encoded_len(&self) -> usize {
        let n = self.field_count as usize;
        1 + 4 + 4 + self.table_path.len() + 4 + 4 + 2 * FieldMask::byte_len(n) + 4 * n
    }

    /// Whether field `idx` has bytes in the body.
    pub fn has_payload(&self, idx: usize) -> bool {
        self.update_mask.get(idx) && !self.null_mask.get(idx)
    }

    pub fn body_len(&self) -> usize {
        (0..self.field_count as usize)
            .filter(|&i| self.has_payload(i))
            .map(|i| self.field_head[i] as usize)
            .sum()
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>) -> HeaderLayout {
        debug_assert_eq!(self.field_head.len(), self.field_count as usize);
        buf.push(RecordType::Update as u8);
        put_u32(buf, self.table_id);
        put_table_path(buf, &self.table_path);
        put_u32(buf, self.field_count);
        put_u32(buf, self.load_num);
        let null_offset = buf.len();
        buf.extend_from_slice(self.null_mask.as_bytes());
        let update_offset = buf.len();
        buf.extend_from_slice(self.update_mask.as_bytes());
        let field_head_offset = buf.len();
        put_field_head(buf, &self.field_head);
        HeaderLayout {
            null_offset,
            update_offset: Some(update_offset),
            field_head_offset,
        }
    }

    pub fn encode_to_vec(&self) -> (Vec<u8>, HeaderLayout) {
        let mut buf = Vec::with_capacity(self.encoded_len());
        let layout = self.encode_into(&mut buf);
        (buf, layout)
    }

    pub fn decode(input: &[u8]) -> Result<(Self, usize), DecodeError> {
        let mut reader = RecordReader::new(input);
        reader.tag(RecordType::Update)?;
        let table_id = reader.u32()?;
        let table_path = reader.table_path()?;
        let field_count = reader.u32()?;
        let load_num = reader.u32()?;
        let null_mask = reader.mask(field_count as usize)?;
        let update_mask = reader.mask(field_count as usize)?;
        let field_head = reader.field_head(field_count as usize)?;
        Ok((
            Self {
                table_id,
                table_path,
                field_count,
                load_num,
                null_mask,
                update_mask,
                field_head,
            },
            reader.position(),
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteHeader {
    pub table_id: u32,
    pub table_path: String,
    pub load_num: u32,
}

impl DeleteHeader {
    pub fn new(table_id: u32, table_path: impl Into<String>, load_num: u32) -> Self {
        Self {
            table_id,
            table_path: table_path.into(),
            load_num,
        }
    }

    pub fn encoded_len(&self) -> usize {
        1 + 4 + 4 + self.table_path.len() + 4
    }

    /// Returns the body cursor, which is also the end of the record.
    pub fn encode_into(&self, buf: &mut Vec<u8>) -> usize {
        buf.push(RecordType::Delete as u8);
        put_u32(buf, self.table_id);
        put_table_path(buf, &self.table_path);
        put_u32(buf, self.load_num);
        buf.len()
    }

    pub fn encode_to_vec(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf
    }

    pub fn decode(input: &[u8]) -> Result<(Self, usize), DecodeError> {
        let mut reader = RecordReader::new(input);
        reader.tag(RecordType::Delete)?;
        let table_id = reader.u32()?;
        let table_path = reader.table_path()?;
        let load_num = reader.u32()?;
        Ok((
            Self {
                table_id,
                table_path,
                load_num,
            },
            reader.position(),
        ))
    }
}

/// How an update record treats one field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldUpdate {
    /// The update does not touch the field.
    Unchanged,
    Null,
    Value(Bytes),
}

/// A fully decoded record: header plus per-field payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeltaRecord {
    /// `fields` is empty when the insert carries the delete marker, since a
    /// deleted insert keeps its field table but no body.
    Insert {
        header: InsertHeader,
        fields: Vec<Option<Bytes>>,
    },
    Update {
        header: UpdateHeader,
        fields: Vec<FieldUpdate>,
    },
    Delete {
        header: DeleteHeader,
    },
}

impl DeltaRecord {
    /// Builds a live insert from a full row image; `None` is SQL NULL.
    ///
    /// # Panics
    ///
    /// If there are more than `u32::MAX` fields or a payload is 4 GiB or
    /// larger. Encoding panics the same way for a table path of that size.
    pub fn insert(
        table_id: u32,
        table_path: impl Into<String>,
        load_num: u32,
        fields: Vec<Option<Bytes>>,
    ) -> Self {
        let field_count = wire_len(fields.len(), "field count");
        let mut header = InsertHeader::new(false, table_id, table_path, field_count, load_num);
        for (idx, field) in fields.iter().enumerate() {
            match field {
                Some(value) => header.field_head[idx] = payload_len(value),
                None => header.null_mask.set(idx),
            }
        }
        Self::Insert { header, fields }
    }

    /// Builds an update; unchanged fields carry no payload.
    ///
    /// # Panics
    ///
    /// Under the same size limits as [`DeltaRecord::insert`].
    pub fn update(
        table_id: u32,
        table_path: impl Into<String>,
        load_num: u32,
        fields: Vec<FieldUpdate>,
    ) -> Self {
        let field_count = wire_len(fields.len(), "field count");
        let mut header = UpdateHeader::new(table_id, table_path, field_count, load_num);
        for (idx, field) in fields.iter().enumerate() {
            match field {
                FieldUpdate::Unchanged => {}
                FieldUpdate::Null => {
                    header.null_mask.set(idx);
                    header.update_mask.set(idx);
                }
                FieldUpdate::Value(value) => {
                    header.update_mask.set(idx);
                    header.field_head[idx] = payload_len(value);
                }
            }
        }
        Self::Update { header, fields }
    }

    pub fn delete(table_id: u32, table_path: impl Into<String>, load_num: u32) -> Self {
        Self::Delete {
            header: DeleteHeader::new(table_id, table_path, load_num),
        }
    }

    pub fn record_type(&self) -> RecordType {
        match self {
            Self::Insert { .. } => RecordType::Insert,
            Self::Update { .. } => RecordType::Update,
            Self::Delete { .. } => RecordType::Delete,
        }
    }

    pub fn load_num(&self) -> u32 {
        match self {
            Self::Insert { header, .. } => header.load_num,
            Self::Update { header, .. } => header.load_num,
            Self::Delete { header } => header.load_num,
        }
    }

    pub fn table_path(&self) -> &str {
        match self {
            Self::Insert { header, .. } => &header.table_path,
            Self::Update { header, .. } => &header.table_path,
            Self::Delete { header } => &header.table_path,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        match self {
            Self::Insert { header, .. } => header.is_deleted,
            Self::Update { .. } => false,
            Self::Delete { .. } => true,
        }
    }

    pub fn encode_to_vec(&self) -> Vec<u8> {
        match self {
            Self::Insert { header, fields } => {
                let mut buf = Vec::with_capacity(header.encoded_len() + header.body_len());
                header.encode_into(&mut buf);
                for value in fields.iter().flatten() {
                    buf.extend_from_slice(value);
                }
                buf
            }
            Self::Update { header, fields } => {
                let mut buf = Vec::with_capacity(header.encoded_len() + header.body_len());
                header.encode_into(&mut buf);
                for field in fields {
                    if let FieldUpdate::Value(value) = field {
                        buf.extend_from_slice(value);
                    }
                }
                buf
            }
            Self::Delete { header } => header.encode_to_vec(),
        }
    }

    pub fn encode(&self) -> Bytes {
        Bytes::from(self.encode_to_vec())
    }

    pub fn decode(input: &[u8]) -> Result<Self, DecodeError> {
        match RecordType::peek(input)? {
            RecordType::Insert => {
                let (header, body) = InsertHeader::decode(input)?;
                let mut fields = Vec::new();
                if !header.is_deleted {
                    let mut reader = RecordReader::at(input, body);
                    fields.reserve(header.field_count as usize);
                    for idx in 0..header.field_count as usize {
                        if header.null_mask.get(idx) {
                            fields.push(None);
                        } else {
                            let raw = reader.take(header.field_head[idx] as usize)?;
                            fields.push(Some(Bytes::copy_from_slice(raw)));
                        }
                    }
                }
                Ok(Self::Insert { header, fields })
            }
            RecordType::Update => {
                let (header, body) = UpdateHeader::decode(input)?;
                let mut reader = RecordReader::at(input, body);
                let mut fields = Vec::with_capacity(header.field_count as usize);
                for idx in 0..header.field_count as usize {
                    if header.null_mask.get(idx) {
                        fields.push(FieldUpdate::Null);
                    } else if header.update_mask.get(idx) {
                        let raw = reader.take(header.field_head[idx] as usize)?;
                        fields.push(FieldUpdate::Value(Bytes::copy_from_slice(raw)));
                    } else {
                        fields.push(FieldUpdate::Unchanged);
                    }
                }
                Ok(Self::Update { header, fields })
            }
            RecordType::Delete => {
                let (header, _) = DeleteHeader::decode(input)?;
                Ok(Self::Delete { header })
            }
        }
    }
}

fn payload_len(value: &Bytes) -> u32 {
    wire_len(value.len(), "field payload")
}

/// Lengths and counts are `u32` on the wire.
fn wire_len(len: usize, what: &str) -> u32 {
    match u32::try_from(len) {
        Ok(len) => len,
        Err(_) => panic!("{what} too large to encode: {len}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b(s: &'static str) -> Bytes {
        Bytes::from_static(s.as_bytes())
    }

    #[test]
    fn insert_layout_offsets() {
        let record = DeltaRecord::insert(7, "db/t1", 1, vec![Some(b("x")), None, Some(b("yz"))]);
        let DeltaRecord::Insert { header, .. } = &record else {
            unreachable!()
        };
        let (buf, layout) = header.encode_to_vec();
        assert_eq!(buf.len(), header.encoded_len());
        // tag + deleted + table_id + path_len + path + field_count + load_num
        assert_eq!(layout.null_offset, 1 + 1 + 4 + 4 + 5 + 4 + 4);
        assert_eq!(layout.field_head_offset, layout.null_offset + 1);
        // The body starts right after the field-length table.
        assert_eq!(buf.len(), layout.field_head_offset + 12);
        assert_eq!(layout.update_offset, None);
        assert_eq!(buf[layout.null_offset], 0b010);
    }

    #[test]
    fn insert_decode_reads_body() {
        let record = DeltaRecord::insert(7, "db/t1", 1, vec![Some(b("x")), None, Some(b("yz"))]);
        let encoded = record.encode_to_vec();
        let (header, body) = InsertHeader::decode(&encoded).unwrap();
        assert_eq!(header.field_head, vec![1, 0, 2]);
        assert_eq!(&encoded[body..], b"xyz");
        assert_eq!(DeltaRecord::decode(&encoded).unwrap(), record);
    }

    #[test]
    fn update_body_skips_untouched_and_null_fields() {
        let record = DeltaRecord::update(
            3,
            "db/t2",
            1,
            vec![FieldUpdate::Unchanged, FieldUpdate::Null, FieldUpdate::Value(b("new"))],
        );
        let encoded = record.encode_to_vec();
        let (header, body) = UpdateHeader::decode(&encoded).unwrap();
        assert!(!header.update_mask.get(0));
        assert!(header.update_mask.get(1) && header.null_mask.get(1));
        assert!(header.has_payload(2));
        assert_eq!(&encoded[body..], b"new");
        assert_eq!(DeltaRecord::decode(&encoded).unwrap(), record);
    }

    #[test]
    fn delete_is_header_only() {
        let record = DeltaRecord::delete(9, "db/t3", 4);
        let encoded = record.encode_to_vec();
        let (header, body) = DeleteHeader::decode(&encoded).unwrap();
        assert_eq!(body, encoded.len());
        assert_eq!(header.load_num, 4);
        assert!(record.is_tombstone());
    }

    #[test]
    fn deleted_insert_decodes_without_body() {
        let mut header = InsertHeader::new(true, 1, "db/t", 2, 3);
        header.field_head = vec![4, 4];
        let (encoded, _) = header.encode_to_vec();
        let decoded = DeltaRecord::decode(&encoded).unwrap();
        assert!(decoded.is_tombstone());
        let DeltaRecord::Insert { fields, header: decoded_header } = decoded else {
            panic!("expected insert");
        };
        assert!(fields.is_empty());
        assert_eq!(decoded_header.field_head, vec![4, 4]);
    }

    #[test]
    fn decode_rejects_bad_input() {
        assert_eq!(RecordType::peek(&[]), Err(DecodeError::Truncated));
        assert_eq!(RecordType::peek(&[9]), Err(DecodeError::UnknownRecordType(9)));

        let encoded = DeltaRecord::delete(1, "p", 1).encode_to_vec();
        assert_eq!(
            InsertHeader::decode(&encoded),
            Err(DecodeError::UnexpectedRecordType {
                expected: RecordType::Insert,
                found: RecordType::Delete,
            })
        );
        assert_eq!(
            DeleteHeader::decode(&encoded[..encoded.len() - 1]),
            Err(DecodeError::Truncated)
        );

        let mut bad_path = encoded.clone();
        bad_path[9] = 0xFF;
        assert_eq!(DeleteHeader::decode(&bad_path), Err(DecodeError::InvalidTablePath));
    }

    #[test]
    fn truncated_body_is_an_error() {
        let encoded = DeltaRecord::insert(1, "p", 1, vec![Some(b("abcd"))]).encode_to_vec();
        assert_eq!(
            DeltaRecord::decode(&encoded[..encoded.len() - 2]),
            Err(DecodeError::Truncated)
        );
    }

    #[test]
    fn wire_len_accepts_u32_range() {
        assert_eq!(wire_len(0, "field payload"), 0);
        assert_eq!(wire_len(u32::MAX as usize, "field payload"), u32::MAX);
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    #[should_panic(expected = "field payload too large to encode")]
    fn wire_len_rejects_lengths_past_u32() {
        wire_len(u32::MAX as usize + 1, "field payload");
    }
}
