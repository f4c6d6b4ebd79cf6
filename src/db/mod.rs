mod options;

use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Context;
use parking_lot::Mutex;

use crate::compaction::{fold_history, group_histories, CompactionRunner, CompactionStats};
use crate::memtable::MemTableManager;
use crate::merge::{MergeOperator, RecordMergeOperator};
use crate::record::DeltaRecord;

pub use options::StoreOptions;

pub type Value = bytes::Bytes;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    /// Replaces the key's value outright.
    Put,
    /// Drops the key's value and delta chain.
    Del,
    /// Appends a delta to be folded by the merge operator.
    Merge,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Op {
    pub kind: OpKind,
    pub key: bytes::Bytes,
    pub value: bytes::Bytes,
}

impl Op {
    pub fn put(key: impl Into<bytes::Bytes>, value: impl Into<bytes::Bytes>) -> Self {
        Self {
            kind: OpKind::Put,
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn delete(key: impl Into<bytes::Bytes>) -> Self {
        Self {
            kind: OpKind::Del,
            key: key.into(),
            value: bytes::Bytes::new(),
        }
    }

    pub fn merge(key: impl Into<bytes::Bytes>, delta: impl Into<bytes::Bytes>) -> Self {
        Self {
            kind: OpKind::Merge,
            key: key.into(),
            value: delta.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Range {
    pub start: Bound<bytes::Bytes>,
    pub end: Bound<bytes::Bytes>,
}

impl Range {
    pub fn all() -> Self {
        Self {
            start: Bound::Unbounded,
            end: Bound::Unbounded,
        }
    }

    /// Every row key of `table_id`.
    pub fn table(table_id: u32) -> Self {
        let start = Bound::Included(crate::row_key::RowKey::table_start(table_id));
        let end = match table_id.checked_add(1) {
            Some(next) => Bound::Excluded(crate::row_key::RowKey::table_start(next)),
            None => Bound::Unbounded,
        };
        Self { start, end }
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        let after_start = match &self.start {
            Bound::Included(start) => key >= start.as_ref(),
            Bound::Excluded(start) => key > start.as_ref(),
            Bound::Unbounded => true,
        };
        let before_end = match &self.end {
            Bound::Included(end) => key <= end.as_ref(),
            Bound::Excluded(end) => key < end.as_ref(),
            Bound::Unbounded => true,
        };
        after_start && before_end
    }
}

/// In-memory delta store that folds row deltas through a merge operator.
///
/// Semantics:
/// - Writes get consecutive sequence numbers; a batch is visible to readers
///   only once every op in it has been applied.
/// - `get` and `scan` fold transiently and leave the stored chain untouched.
/// - `compact` folds every key into a single value and replaces the table.
#[derive(Clone)]
pub struct DeltaStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    options: StoreOptions,
    operator: Arc<dyn MergeOperator>,
    memtables: MemTableManager,
    /// Serializes writers against each other and against compaction.
    write_lock: Mutex<()>,
    next_seqno: AtomicU64,
    visible_seqno: AtomicU64,
}

impl DeltaStore {
    pub fn open(options: StoreOptions) -> Self {
        let operator = Arc::new(RecordMergeOperator::new(options.merge.clone()));
        Self::with_operator(options, operator)
    }

    pub fn with_operator(options: StoreOptions, operator: Arc<dyn MergeOperator>) -> Self {
        tracing::debug!(
            operator = operator.name(),
            shards = options.memtable_shards,
            "open delta store"
        );
        Self {
            inner: Arc::new(StoreInner {
                memtables: MemTableManager::new(options.memtable_shards),
                options,
                operator,
                write_lock: Mutex::new(()),
                next_seqno: AtomicU64::new(1),
                visible_seqno: AtomicU64::new(0),
            }),
        }
    }

    pub fn options(&self) -> &StoreOptions {
        &self.inner.options
    }

    pub fn put(
        &self,
        key: impl Into<bytes::Bytes>,
        value: impl Into<bytes::Bytes>,
    ) -> anyhow::Result<()> {
        self.write_batch(vec![Op::put(key, value)])
    }

    pub fn delete(&self, key: impl Into<bytes::Bytes>) -> anyhow::Result<()> {
        self.write_batch(vec![Op::delete(key)])
    }

    pub fn merge(
        &self,
        key: impl Into<bytes::Bytes>,
        delta: impl Into<bytes::Bytes>,
    ) -> anyhow::Result<()> {
        self.write_batch(vec![Op::merge(key, delta)])
    }

    /// Appends an encoded delta record under `key`.
    pub fn merge_record(
        &self,
        key: impl Into<bytes::Bytes>,
        record: &DeltaRecord,
    ) -> anyhow::Result<()> {
        self.merge(key, record.encode())
    }

    pub fn write_batch(&self, ops: Vec<Op>) -> anyhow::Result<()> {
        if ops.is_empty() {
            return Ok(());
        }
        let _guard = self.inner.write_lock.lock();
        let count = ops.len() as u64;
        let seqno_base = self.inner.next_seqno.fetch_add(count, Ordering::SeqCst);
        self.inner.memtables.apply_batch(seqno_base, &ops);
        self.inner
            .visible_seqno
            .store(seqno_base + count - 1, Ordering::Release);
        Ok(())
    }

    /// Current value of `key` with all pending deltas folded in.
    pub fn get(&self, key: impl AsRef<[u8]>) -> anyhow::Result<Option<Value>> {
        let key = key.as_ref();
        // Pin the table before the seqno: a table installed by compaction is
        // only read with a seqno at least as new as the one it was folded at.
        let table = self.inner.memtables.current();
        let Some(history) = table.history(key, self.visible_seqno()) else {
            return Ok(None);
        };
        fold_history(self.inner.operator.as_ref(), key, &history)
            .with_context(|| format!("fold deltas for key {key:?}"))
    }

    /// [`Self::get`] decoded as a delta record.
    pub fn get_record(&self, key: impl AsRef<[u8]>) -> anyhow::Result<Option<DeltaRecord>> {
        let Some(value) = self.get(key)? else {
            return Ok(None);
        };
        let record = DeltaRecord::decode(&value).context("decode folded record")?;
        Ok(Some(record))
    }

    /// Folded values of every live key in `range`, in key order.
    pub fn scan(&self, range: &Range) -> anyhow::Result<Vec<(Value, Value)>> {
        let table = self.inner.memtables.current();
        let snapshot = self.visible_seqno();
        let entries: Vec<_> = table
            .to_sorted_entries()
            .into_iter()
            .filter(|(ikey, _)| ikey.seqno <= snapshot && range.contains(ikey.user_key.as_ref()))
            .collect();

        let mut out = Vec::new();
        for (key, history) in group_histories(entries) {
            let value = fold_history(self.inner.operator.as_ref(), &key, &history)
                .with_context(|| format!("fold deltas for key {key:?}"))?;
            if let Some(value) = value {
                out.push((key, value));
            }
        }
        Ok(out)
    }

    /// Folds every key's delta chain into a single value.
    ///
    /// All-or-nothing: if any key fails to fold, the stored chains are left
    /// as they were and the error is returned.
    pub fn compact(&self) -> anyhow::Result<CompactionStats> {
        let _guard = self.inner.write_lock.lock();
        let entries = self.inner.memtables.current().to_sorted_entries();
        let output = CompactionRunner::run(self.inner.operator.as_ref(), entries)
            .context("compact delta chains")?;
        self.inner.memtables.install(output.entries);
        Ok(output.stats)
    }

    pub fn approximate_bytes(&self) -> u64 {
        self.inner.memtables.approximate_bytes()
    }

    /// Number of stored entries, counting every unfolded delta.
    pub fn entry_count(&self) -> u64 {
        self.inner.memtables.entry_count()
    }

    pub fn last_seqno(&self) -> u64 {
        self.visible_seqno()
    }

    fn visible_seqno(&self) -> u64 {
        self.inner.visible_seqno.load(Ordering::Acquire)
    }
}
