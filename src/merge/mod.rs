//! Merge operator for delta records.
//!
//! The key-value engine calls [`MergeOperator::merge`] whenever it holds two
//! values for one row key: the older one as `existing` and the newer one as
//! `incoming`. The result is a single record equivalent to applying both in
//! order. Supported transitions:
//!
//! ```text
//! existing \ incoming   Insert   Update            Delete
//! Insert                -        Insert (fields)   Insert (is_deleted)
//! Update                -        Update (fields)   Delete
//! Delete                -        -                 Delete
//! ```
//!
//! Every other pair is reported as [`MergeOutcome::Incompatible`]. The
//! operator never retries or repairs a broken delta chain.

mod buffer;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::record::{
    encode_field_head, DecodeError, DeleteHeader, InsertHeader, RecordReader, RecordType,
    UpdateHeader,
};

use buffer::MergeBuffer;

/// Hard ceiling for a single merged record: 2 GiB, or the largest possible
/// allocation where that is smaller.
pub const DEFAULT_MAX_BUF_SIZE: usize = {
    const TWO_GIB: u64 = 1 << 31;
    if (isize::MAX as u64) < TWO_GIB {
        isize::MAX as usize
    } else {
        TWO_GIB as usize
    }
};

/// Field lengths above this are logged as suspicious.
pub const DEFAULT_SUSPICIOUS_FIELD_LEN: u32 = 1000;

#[derive(Debug, thiserror::Error)]
pub enum MergeError {
    #[error("{table_path} merged delta exceeds max buffer size {max_buf_size}")]
    BufferOverflow {
        table_path: String,
        max_buf_size: usize,
    },

    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeOptions {
    pub max_buf_size: usize,
    pub suspicious_field_len: u32,
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self {
            max_buf_size: DEFAULT_MAX_BUF_SIZE,
            suspicious_field_len: DEFAULT_SUSPICIOUS_FIELD_LEN,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    Merged(Bytes),
    /// The pair is not a valid transition. The engine must surface this as
    /// corruption rather than drop either value.
    Incompatible {
        existing: RecordType,
        incoming: RecordType,
    },
}

impl MergeOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Merged(_))
    }

    pub fn into_value(self) -> Option<Bytes> {
        match self {
            Self::Merged(value) => Some(value),
            Self::Incompatible { .. } => None,
        }
    }
}

/// Callback shape the key-value engine invokes on reads and compactions.
pub trait MergeOperator: Send + Sync {
    fn name(&self) -> &'static str;

    fn merge(
        &self,
        key: &[u8],
        existing: Option<&[u8]>,
        incoming: &[u8],
    ) -> Result<MergeOutcome, MergeError>;

    /// Folds `operands` (oldest first) onto `existing` pairwise.
    ///
    /// Stops at the first incompatible pair. Returns `None` when there is
    /// nothing to fold.
    fn full_merge(
        &self,
        key: &[u8],
        existing: Option<&[u8]>,
        operands: &[Bytes],
    ) -> Result<Option<MergeOutcome>, MergeError> {
        let mut acc: Option<Bytes> = existing.map(Bytes::copy_from_slice);
        for operand in operands {
            match self.merge(key, acc.as_deref(), operand)? {
                MergeOutcome::Merged(value) => acc = Some(value),
                incompatible => return Ok(Some(incompatible)),
            }
        }
        Ok(acc.map(MergeOutcome::Merged))
    }
}

/// Decoded header plus body cursor.
enum Head {
    Insert(InsertHeader, usize),
    Update(UpdateHeader, usize),
    Delete(DeleteHeader),
}

impl Head {
    fn decode(input: &[u8]) -> Result<Self, DecodeError> {
        Ok(match RecordType::peek(input)? {
            RecordType::Insert => {
                let (header, body) = InsertHeader::decode(input)?;
                Self::Insert(header, body)
            }
            RecordType::Update => {
                let (header, body) = UpdateHeader::decode(input)?;
                Self::Update(header, body)
            }
            RecordType::Delete => Self::Delete(DeleteHeader::decode(input)?.0),
        })
    }

    fn record_type(&self) -> RecordType {
        match self {
            Self::Insert(..) => RecordType::Insert,
            Self::Update(..) => RecordType::Update,
            Self::Delete(_) => RecordType::Delete,
        }
    }
}

/// Folds delta records under the rules in the module docs.
#[derive(Debug, Clone, Default)]
pub struct RecordMergeOperator {
    options: MergeOptions,
}

impl RecordMergeOperator {
    pub fn new(options: MergeOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &MergeOptions {
        &self.options
    }

    fn note_field_len(&self, table_path: &str, field: usize, len: u32) {
        if len > self.options.suspicious_field_len {
            tracing::debug!(table_path, field, len, "suspicious delta field length");
        }
    }

    /// Insert followed by update: the update's fields win field by field.
    fn insert_with_update(
        &self,
        existing: &[u8],
        base: InsertHeader,
        base_body: usize,
        incoming: &[u8],
        update: UpdateHeader,
        update_body: usize,
    ) -> Result<Bytes, MergeError> {
        if base.field_count != update.field_count {
            return Err(DecodeError::FieldCountMismatch {
                existing: base.field_count,
                incoming: update.field_count,
            }
            .into());
        }

        let mut head = InsertHeader::new(
            false,
            base.table_id,
            base.table_path.clone(),
            base.field_count,
            base.load_num.saturating_add(update.load_num),
        );
        let mut out = MergeBuffer::with_capacity(
            existing.len() + incoming.len(),
            self.options.max_buf_size,
            &base.table_path,
        );
        let (head_bytes, layout) = head.encode_to_vec();
        out.put_slice(&head_bytes)?;

        let mut base_cur = RecordReader::at(existing, base_body);
        let mut update_cur = RecordReader::at(incoming, update_body);
        for i in 0..base.field_count as usize {
            let base_len = base.field_head[i] as usize;
            let base_has_bytes = !base.null_mask.get(i);
            self.note_field_len(
                &base.table_path,
                i,
                update.field_head[i].max(base.field_head[i]),
            );

            if update.null_mask.get(i) {
                head.null_mask.set(i);
                if base_has_bytes {
                    base_cur.skip(base_len)?;
                }
            } else if update.update_mask.get(i) {
                let value = update_cur.take(update.field_head[i] as usize)?;
                out.put_slice(value)?;
                head.field_head[i] = update.field_head[i];
                if base_has_bytes {
                    base_cur.skip(base_len)?;
                }
            } else if !base_has_bytes {
                head.null_mask.set(i);
            } else {
                let value = base_cur.take(base_len)?;
                out.put_slice(value)?;
                head.field_head[i] = base.field_head[i];
            }
        }

        out.patch(layout.null_offset, head.null_mask.as_bytes());
        out.patch(layout.field_head_offset, &encode_field_head(&head.field_head));
        Ok(finish(out))
    }

    /// Update followed by update. Fields neither delta touches stay unset.
    fn update_with_update(
        &self,
        existing: &[u8],
        older: UpdateHeader,
        older_body: usize,
        incoming: &[u8],
        newer: UpdateHeader,
        newer_body: usize,
    ) -> Result<Bytes, MergeError> {
        if older.field_count != newer.field_count {
            return Err(DecodeError::FieldCountMismatch {
                existing: older.field_count,
                incoming: newer.field_count,
            }
            .into());
        }

        let mut head = UpdateHeader::new(
            older.table_id,
            older.table_path.clone(),
            older.field_count,
            older.load_num.saturating_add(newer.load_num),
        );
        let mut out = MergeBuffer::with_capacity(
            existing.len() + incoming.len(),
            self.options.max_buf_size,
            &older.table_path,
        );
        let (head_bytes, layout) = head.encode_to_vec();
        out.put_slice(&head_bytes)?;

        let mut older_cur = RecordReader::at(existing, older_body);
        let mut newer_cur = RecordReader::at(incoming, newer_body);
        for i in 0..older.field_count as usize {
            // A null field in an update carries no bytes even though its
            // update bit is set.
            let older_len = older.field_head[i] as usize;
            let older_has_bytes = older.has_payload(i);
            self.note_field_len(
                &older.table_path,
                i,
                newer.field_head[i].max(older.field_head[i]),
            );

            if newer.null_mask.get(i) {
                head.null_mask.set(i);
                head.update_mask.set(i);
                if older_has_bytes {
                    older_cur.skip(older_len)?;
                }
            } else if newer.update_mask.get(i) {
                let value = newer_cur.take(newer.field_head[i] as usize)?;
                out.put_slice(value)?;
                head.update_mask.set(i);
                head.field_head[i] = newer.field_head[i];
                if older_has_bytes {
                    older_cur.skip(older_len)?;
                }
            } else if older.null_mask.get(i) {
                head.null_mask.set(i);
                head.update_mask.set(i);
            } else if older.update_mask.get(i) {
                let value = older_cur.take(older_len)?;
                out.put_slice(value)?;
                head.update_mask.set(i);
                head.field_head[i] = older.field_head[i];
            }
        }

        out.patch(layout.null_offset, head.null_mask.as_bytes());
        if let Some(update_offset) = layout.update_offset {
            out.patch(update_offset, head.update_mask.as_bytes());
        }
        out.patch(layout.field_head_offset, &encode_field_head(&head.field_head));
        Ok(finish(out))
    }

    /// Re-encodes `head` into a fresh buffer; used for header-only results.
    fn header_only(
        &self,
        existing: &[u8],
        incoming: &[u8],
        table_path: &str,
        head: &[u8],
    ) -> Result<Bytes, MergeError> {
        let mut out = MergeBuffer::with_capacity(
            existing.len() + incoming.len(),
            self.options.max_buf_size,
            table_path,
        );
        out.put_slice(head)?;
        Ok(finish(out))
    }
}

fn finish(out: MergeBuffer<'_>) -> Bytes {
    tracing::trace!(len = out.len(), capacity = out.capacity(), "merged delta");
    Bytes::from(out.into_vec())
}

impl MergeOperator for RecordMergeOperator {
    fn name(&self) -> &'static str {
        "RecordMergeOperator"
    }

    fn merge(
        &self,
        _key: &[u8],
        existing: Option<&[u8]>,
        incoming: &[u8],
    ) -> Result<MergeOutcome, MergeError> {
        let Some(existing) = existing else {
            return Ok(MergeOutcome::Merged(Bytes::copy_from_slice(incoming)));
        };

        let existing_head = Head::decode(existing)?;
        if let Head::Insert(header, _) = &existing_head {
            if header.is_deleted {
                // Deltas that arrive after a delete are stale replays.
                tracing::debug!(
                    table_path = %header.table_path,
                    "dropping delta applied after delete"
                );
                return Ok(MergeOutcome::Merged(Bytes::copy_from_slice(existing)));
            }
        }
        let incoming_head = Head::decode(incoming)?;

        let merged = match (existing_head, incoming_head) {
            (Head::Insert(base, base_body), Head::Update(update, update_body)) => self
                .insert_with_update(existing, base, base_body, incoming, update, update_body)?,
            (Head::Insert(base, _), Head::Delete(delete)) => {
                let head = InsertHeader {
                    is_deleted: true,
                    load_num: base.load_num.saturating_add(delete.load_num),
                    ..base
                };
                let (head_bytes, _) = head.encode_to_vec();
                self.header_only(existing, incoming, &head.table_path, &head_bytes)?
            }
            (Head::Update(older, older_body), Head::Update(newer, newer_body)) => self
                .update_with_update(existing, older, older_body, incoming, newer, newer_body)?,
            (Head::Update(older, _), Head::Delete(delete)) => {
                let head = DeleteHeader::new(
                    older.table_id,
                    older.table_path,
                    older.load_num.saturating_add(delete.load_num),
                );
                self.header_only(existing, incoming, &head.table_path, &head.encode_to_vec())?
            }
            (Head::Delete(older), Head::Delete(newer)) => {
                let head = DeleteHeader::new(
                    older.table_id,
                    older.table_path,
                    older.load_num.saturating_add(newer.load_num),
                );
                self.header_only(existing, incoming, &head.table_path, &head.encode_to_vec())?
            }
            (existing_head, incoming_head) => {
                let existing = existing_head.record_type();
                let incoming = incoming_head.record_type();
                tracing::warn!(?existing, ?incoming, "undefined delta transition");
                return Ok(MergeOutcome::Incompatible { existing, incoming });
            }
        };

        Ok(MergeOutcome::Merged(merged))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{DeltaRecord, FieldUpdate};

    fn b(s: &'static str) -> Bytes {
        Bytes::from_static(s.as_bytes())
    }

    fn insert(fields: Vec<Option<Bytes>>, load_num: u32) -> Bytes {
        DeltaRecord::insert(1, "db/t", load_num, fields).encode()
    }

    #[test]
    fn default_ceiling_is_allocatable() {
        assert!(DEFAULT_MAX_BUF_SIZE <= isize::MAX as usize);
        #[cfg(target_pointer_width = "64")]
        assert_eq!(DEFAULT_MAX_BUF_SIZE, 2 * 1024 * 1024 * 1024);
        assert_eq!(MergeOptions::default().max_buf_size, DEFAULT_MAX_BUF_SIZE);
    }

    fn update(fields: Vec<FieldUpdate>, load_num: u32) -> Bytes {
        DeltaRecord::update(1, "db/t", load_num, fields).encode()
    }

    fn merged(existing: &Bytes, incoming: &Bytes) -> DeltaRecord {
        let op = RecordMergeOperator::default();
        let value = op
            .merge(b"k", Some(&existing[..]), incoming)
            .unwrap()
            .into_value()
            .expect("compatible pair");
        DeltaRecord::decode(&value).unwrap()
    }

    #[test]
    fn absent_existing_returns_incoming() {
        let op = RecordMergeOperator::default();
        let value = update(vec![FieldUpdate::Value(b("a"))], 1);
        let out = op.merge(b"k", None, &value).unwrap();
        assert_eq!(out, MergeOutcome::Merged(value));
    }

    #[test]
    fn insert_update_applies_rule_precedence() {
        let base = insert(vec![Some(b("a")), Some(b("bb")), None, Some(b("d"))], 1);
        let delta = update(
            vec![
                FieldUpdate::Value(b("AAA")),
                FieldUpdate::Null,
                FieldUpdate::Unchanged,
                FieldUpdate::Unchanged,
            ],
            1,
        );
        let out = merged(&base, &delta);
        assert_eq!(
            out,
            DeltaRecord::insert(1, "db/t", 2, vec![Some(b("AAA")), None, None, Some(b("d"))])
        );
    }

    #[test]
    fn update_fills_previously_null_field() {
        let base = insert(vec![None, Some(b("x"))], 1);
        let delta = update(vec![FieldUpdate::Value(b("v")), FieldUpdate::Unchanged], 1);
        let out = merged(&base, &delta);
        assert_eq!(out, DeltaRecord::insert(1, "db/t", 2, vec![Some(b("v")), Some(b("x"))]));
    }

    #[test]
    fn update_update_keeps_untouched_fields_unset() {
        let older = update(
            vec![
                FieldUpdate::Value(b("1")),
                FieldUpdate::Null,
                FieldUpdate::Unchanged,
                FieldUpdate::Value(b("4")),
            ],
            2,
        );
        let newer = update(
            vec![
                FieldUpdate::Unchanged,
                FieldUpdate::Unchanged,
                FieldUpdate::Unchanged,
                FieldUpdate::Value(b("four")),
            ],
            1,
        );
        let out = merged(&older, &newer);
        assert_eq!(
            out,
            DeltaRecord::update(
                1,
                "db/t",
                3,
                vec![
                    FieldUpdate::Value(b("1")),
                    FieldUpdate::Null,
                    FieldUpdate::Unchanged,
                    FieldUpdate::Value(b("four")),
                ],
            )
        );
    }

    #[test]
    fn newer_null_skips_older_bytes() {
        let older = update(vec![FieldUpdate::Value(b("gone")), FieldUpdate::Value(b("kept"))], 1);
        let newer = update(vec![FieldUpdate::Null, FieldUpdate::Unchanged], 1);
        let out = merged(&older, &newer);
        assert_eq!(
            out,
            DeltaRecord::update(1, "db/t", 2, vec![FieldUpdate::Null, FieldUpdate::Value(b("kept"))])
        );
    }

    #[test]
    fn insert_delete_keeps_field_table() {
        let base = insert(vec![Some(b("abc")), None], 2);
        let delete = DeltaRecord::delete(1, "db/t", 1).encode();
        let DeltaRecord::Insert { header, fields } = merged(&base, &delete) else {
            panic!("expected insert");
        };
        assert!(header.is_deleted);
        assert_eq!(header.load_num, 3);
        assert_eq!(header.field_head, vec![3, 0]);
        assert!(header.null_mask.get(1));
        assert!(fields.is_empty());
    }

    #[test]
    fn update_delete_and_delete_delete_yield_delete() {
        let delta = update(vec![FieldUpdate::Value(b("a"))], 2);
        let delete = DeltaRecord::delete(1, "db/t", 1).encode();
        assert_eq!(merged(&delta, &delete), DeltaRecord::delete(1, "db/t", 3));

        let older = DeltaRecord::delete(1, "db/t", 5).encode();
        assert_eq!(merged(&older, &delete), DeltaRecord::delete(1, "db/t", 6));
    }

    #[test]
    fn deleted_insert_absorbs_anything() {
        let op = RecordMergeOperator::default();
        let mut header = InsertHeader::new(true, 1, "db/t", 1, 4);
        header.field_head[0] = 1;
        let (existing, _) = header.encode_to_vec();
        for incoming in [
            insert(vec![Some(b("z"))], 1),
            update(vec![FieldUpdate::Null], 1),
            DeltaRecord::delete(1, "db/t", 1).encode(),
            Bytes::new(),
        ] {
            let out = op.merge(b"k", Some(&existing[..]), &incoming).unwrap();
            assert_eq!(out, MergeOutcome::Merged(Bytes::from(existing.clone())));
        }
    }

    #[test]
    fn undefined_transitions_fail_closed() {
        let op = RecordMergeOperator::default();
        let ins = insert(vec![Some(b("a"))], 1);
        let upd = update(vec![FieldUpdate::Value(b("b"))], 1);
        let del = DeltaRecord::delete(1, "db/t", 1).encode();
        let cases = [
            (&ins, &ins, RecordType::Insert, RecordType::Insert),
            (&upd, &ins, RecordType::Update, RecordType::Insert),
            (&del, &ins, RecordType::Delete, RecordType::Insert),
            (&del, &upd, RecordType::Delete, RecordType::Update),
        ];
        for (existing, incoming, e, i) in cases {
            let out = op.merge(b"k", Some(&existing[..]), incoming).unwrap();
            assert!(!out.is_success());
            assert_eq!(
                out,
                MergeOutcome::Incompatible {
                    existing: e,
                    incoming: i
                }
            );
        }
    }

    #[test]
    fn large_payload_is_copied_whole() {
        let base = insert(vec![Some(b("a")), Some(b("b"))], 1);
        let big = Bytes::from(vec![b'q'; 4096]);
        let delta = update(vec![FieldUpdate::Value(big.clone()), FieldUpdate::Unchanged], 1);
        let out = merged(&base, &delta);
        assert_eq!(out, DeltaRecord::insert(1, "db/t", 2, vec![Some(big), Some(b("b"))]));
    }

    #[test]
    fn overflow_names_table_and_limit() {
        let op = RecordMergeOperator::new(MergeOptions {
            max_buf_size: 64,
            ..MergeOptions::default()
        });
        let base = insert(vec![Some(b("a"))], 1);
        let delta = update(vec![FieldUpdate::Value(Bytes::from(vec![0u8; 60]))], 1);
        let err = op.merge(b"k", Some(&base[..]), &delta).unwrap_err();
        assert!(matches!(err, MergeError::BufferOverflow { max_buf_size: 64, .. }));
        assert_eq!(err.to_string(), "db/t merged delta exceeds max buffer size 64");
    }

    #[test]
    fn field_count_mismatch_is_decode_error() {
        let op = RecordMergeOperator::default();
        let base = insert(vec![Some(b("a"))], 1);
        let delta = update(vec![FieldUpdate::Unchanged, FieldUpdate::Unchanged], 1);
        let err = op.merge(b"k", Some(&base[..]), &delta).unwrap_err();
        assert!(matches!(
            err,
            MergeError::Decode(DecodeError::FieldCountMismatch {
                existing: 1,
                incoming: 2
            })
        ));
    }

    #[test]
    fn full_merge_folds_oldest_first() {
        let op = RecordMergeOperator::default();
        let base = insert(vec![Some(b("x")), Some(b("y"))], 1);
        let operands = vec![
            update(vec![FieldUpdate::Unchanged, FieldUpdate::Value(b("z"))], 1),
            DeltaRecord::delete(1, "db/t", 1).encode(),
        ];
        let out = op
            .full_merge(b"k", Some(&base[..]), &operands)
            .unwrap()
            .and_then(MergeOutcome::into_value)
            .unwrap();
        let DeltaRecord::Insert { header, .. } = DeltaRecord::decode(&out).unwrap() else {
            panic!("expected insert");
        };
        assert!(header.is_deleted);
        assert_eq!(header.load_num, 3);
        assert_eq!(header.field_head, vec![1, 1]);

        assert_eq!(op.full_merge(b"k", None, &[]).unwrap(), None);
    }
}
