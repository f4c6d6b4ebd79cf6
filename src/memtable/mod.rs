use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use bytes::Bytes;
use crossbeam_skiplist::SkipMap;
use parking_lot::RwLock;
use rayon::prelude::*;

use crate::compaction::KeyHistory;
use crate::db::{Op, OpKind};
use crate::internal_key::{InternalKey, KeyKind};

/// Owns the live memtable. Compaction swaps in a rebuilt table wholesale so
/// readers always see either the folded or the unfolded history, never a mix.
#[derive(Debug)]
pub(crate) struct MemTableManager {
    shard_count: usize,
    current: RwLock<Arc<MemTable>>,
}

#[derive(Debug)]
pub(crate) struct MemTable {
    shards: Vec<MemTableShard>,
    approximate_bytes: AtomicU64,
    entries: AtomicU64,
}

#[derive(Debug)]
struct MemTableShard {
    map: SkipMap<InternalKey, Bytes>,
}

#[derive(Debug, Clone)]
struct InternalEntry {
    key: InternalKey,
    value: Bytes,
}

impl MemTableManager {
    pub fn new(shards: usize) -> Self {
        let shard_count = shards.max(1);
        Self {
            shard_count,
            current: RwLock::new(Arc::new(MemTable::new(shard_count))),
        }
    }

    pub fn current(&self) -> Arc<MemTable> {
        self.current.read().clone()
    }

    pub fn apply_batch(&self, seqno_base: u64, ops: &[Op]) {
        if ops.is_empty() {
            return;
        }
        let table = self.current();
        table.apply_batch(self.shard_count, seqno_base, ops);
    }

    /// Replaces the live table with one holding exactly `entries`.
    pub fn install(&self, entries: Vec<(InternalKey, Bytes)>) {
        let table = MemTable::new(self.shard_count);
        for (key, value) in entries {
            table.insert(self.shard_count, InternalEntry { key, value });
        }
        *self.current.write() = Arc::new(table);
    }

    pub fn approximate_bytes(&self) -> u64 {
        self.current().approximate_bytes()
    }

    pub fn entry_count(&self) -> u64 {
        self.current().entry_count()
    }
}

impl MemTable {
    fn new(shard_count: usize) -> Self {
        Self {
            shards: (0..shard_count)
                .map(|_| MemTableShard {
                    map: SkipMap::new(),
                })
                .collect(),
            approximate_bytes: AtomicU64::new(0),
            entries: AtomicU64::new(0),
        }
    }

    pub(crate) fn approximate_bytes(&self) -> u64 {
        self.approximate_bytes.load(AtomicOrdering::Relaxed)
    }

    pub(crate) fn entry_count(&self) -> u64 {
        self.entries.load(AtomicOrdering::Relaxed)
    }

    pub(crate) fn to_sorted_entries(&self) -> Vec<(InternalKey, Bytes)> {
        let mut out: Vec<(InternalKey, Bytes)> = Vec::new();
        for shard in &self.shards {
            for entry in shard.map.iter() {
                out.push((entry.key().clone(), entry.value().clone()));
            }
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    fn insert(&self, shard_count: usize, entry: InternalEntry) {
        let shard = shard_for_key(shard_count, entry.key.user_key.as_ref());
        self.account(&entry);
        self.shards[shard].map.insert(entry.key, entry.value);
    }

    fn account(&self, entry: &InternalEntry) {
        let bytes = entry.key.footprint() as u64 + entry.value.len() as u64;
        self.approximate_bytes
            .fetch_add(bytes, AtomicOrdering::Relaxed);
        self.entries.fetch_add(1, AtomicOrdering::Relaxed);
    }

    fn apply_batch(&self, shard_count: usize, seqno_base: u64, ops: &[Op]) {
        // Small foreground batches skip the rayon fan-out.
        if ops.len() <= 64 {
            for (idx, op) in ops.iter().enumerate() {
                self.insert(shard_count, entry_for_op(seqno_base + idx as u64, op));
            }
            return;
        }

        let mut per_shard: Vec<Vec<InternalEntry>> = (0..shard_count).map(|_| Vec::new()).collect();
        for (idx, op) in ops.iter().enumerate() {
            let shard = shard_for_key(shard_count, op.key.as_ref());
            per_shard[shard].push(entry_for_op(seqno_base + idx as u64, op));
        }

        self.shards
            .par_iter()
            .enumerate()
            .for_each(|(shard_idx, shard)| {
                for entry in &per_shard[shard_idx] {
                    self.account(entry);
                    shard.map.insert(entry.key.clone(), entry.value.clone());
                }
            });
    }

    /// Collects the entries for `user_key` visible at `snapshot_seqno`, newest
    /// first, stopping at the first `Put` or `Del`.
    pub(crate) fn history(&self, user_key: &[u8], snapshot_seqno: u64) -> Option<KeyHistory> {
        let shard = shard_for_key(self.shards.len(), user_key);
        let start = InternalKey::new(Bytes::copy_from_slice(user_key), u64::MAX, KeyKind::Merge);
        let end = InternalKey::new(Bytes::copy_from_slice(user_key), 0, KeyKind::Del);

        let mut history: Option<KeyHistory> = None;
        for entry in self.shards[shard].map.range(start..=end) {
            let ikey = entry.key();
            if ikey.seqno > snapshot_seqno {
                continue;
            }
            let done = history
                .get_or_insert_with(|| KeyHistory::new(ikey.seqno))
                .push_newer_first(ikey.kind, entry.value().clone());
            if done {
                break;
            }
        }
        history.map(KeyHistory::finish)
    }
}

fn entry_for_op(seqno: u64, op: &Op) -> InternalEntry {
    let (kind, value) = match op.kind {
        OpKind::Put => (KeyKind::Put, op.value.clone()),
        OpKind::Del => (KeyKind::Del, Bytes::new()),
        OpKind::Merge => (KeyKind::Merge, op.value.clone()),
    };
    InternalEntry {
        key: InternalKey::new(op.key.clone(), seqno, kind),
        value,
    }
}

fn shard_for_key(shard_count: usize, user_key: &[u8]) -> usize {
    use std::hash::Hasher;
    let mut hasher = ahash::AHasher::default();
    hasher.write(user_key);
    (hasher.finish() as usize) % shard_count
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compaction::Base;

    #[test]
    fn history_stops_at_newest_base() {
        let mem = MemTableManager::new(4);
        mem.apply_batch(
            1,
            &[
                Op::merge(&b"k"[..], &b"m0"[..]),
                Op::put(&b"k"[..], &b"base"[..]),
                Op::merge(&b"k"[..], &b"m1"[..]),
                Op::merge(&b"k"[..], &b"m2"[..]),
                Op::merge(&b"other"[..], &b"x"[..]),
            ],
        );

        let history = mem.current().history(b"k", u64::MAX).expect("history");
        assert_eq!(history.base, Some(Base::Put(Bytes::from_static(b"base"))));
        assert_eq!(
            history.operands,
            vec![Bytes::from_static(b"m1"), Bytes::from_static(b"m2")]
        );
        assert_eq!(history.newest_seqno, 4);
        assert!(mem.current().history(b"missing", u64::MAX).is_none());
    }

    #[test]
    fn history_respects_snapshot() {
        let mem = MemTableManager::new(2);
        mem.apply_batch(
            1,
            &[
                Op::merge(&b"k"[..], &b"m1"[..]),
                Op::delete(&b"k"[..]),
                Op::merge(&b"k"[..], &b"m3"[..]),
            ],
        );

        let at_one = mem.current().history(b"k", 1).expect("history");
        assert_eq!(at_one.base, None);
        assert_eq!(at_one.operands, vec![Bytes::from_static(b"m1")]);

        let latest = mem.current().history(b"k", 3).expect("history");
        assert_eq!(latest.base, Some(Base::Del));
        assert_eq!(latest.operands, vec![Bytes::from_static(b"m3")]);
    }

    #[test]
    fn large_batches_take_parallel_path() {
        let mem = MemTableManager::new(8);
        let ops: Vec<Op> = (0..500u32)
            .map(|i| Op::merge(format!("k{:04}", i % 50).into_bytes(), i.to_le_bytes().to_vec()))
            .collect();
        mem.apply_batch(1, &ops);

        assert_eq!(mem.entry_count(), 500);
        let history = mem.current().history(b"k0007", u64::MAX).expect("history");
        assert_eq!(history.operands.len(), 10);
        assert_eq!(history.operands[0], Bytes::from(7u32.to_le_bytes().to_vec()));
        assert!(mem.approximate_bytes() > 0);
    }

    #[test]
    fn install_replaces_contents() {
        let mem = MemTableManager::new(2);
        mem.apply_batch(1, &[Op::merge(&b"k"[..], &b"m"[..])]);
        mem.install(vec![(
            InternalKey::new(Bytes::from_static(b"k"), 1, KeyKind::Put),
            Bytes::from_static(b"folded"),
        )]);

        assert_eq!(mem.entry_count(), 1);
        let history = mem.current().history(b"k", u64::MAX).expect("history");
        assert_eq!(history.base, Some(Base::Put(Bytes::from_static(b"folded"))));
        assert!(history.operands.is_empty());
    }
}
