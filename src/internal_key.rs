//! Internal key format and ordering.
//!
//! Entries are ordered by `(user_key ASC, seqno DESC, kind)`, so walking a
//! row key from the front yields its newest entry first. Readers collect
//! `Merge` operands until they hit the newest `Put` or `Del` base.

use bytes::Bytes;
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum KeyKind {
    /// Drops the whole delta chain for the key.
    Del = 0,
    /// A fully merged value that later operands fold onto.
    Put = 1,
    /// A delta record waiting to be folded.
    Merge = 2,
}

impl KeyKind {
    /// Whether the entry ends a backwards walk over a key's history.
    pub fn is_base(self) -> bool {
        matches!(self, Self::Del | Self::Put)
    }
}

/// Internal key `(user_key, seqno, kind)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InternalKey {
    pub user_key: Bytes,
    pub seqno: u64,
    pub kind: KeyKind,
}

impl InternalKey {
    pub fn new(user_key: Bytes, seqno: u64, kind: KeyKind) -> Self {
        Self {
            user_key,
            seqno,
            kind,
        }
    }

    /// Bytes charged to the memtable for this key.
    pub fn footprint(&self) -> usize {
        self.user_key.len() + 8 + 1
    }
}

impl PartialOrd for InternalKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for InternalKey {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.user_key.cmp(&other.user_key) {
            Ordering::Equal => match other.seqno.cmp(&self.seqno) {
                Ordering::Equal => (other.kind as u8).cmp(&(self.kind as u8)),
                other => other,
            },
            other => other,
        }
    }
}
