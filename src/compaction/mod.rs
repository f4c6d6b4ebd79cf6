//! Folding of per-key delta chains.
//!
//! The same fold backs both read paths: `get` folds transiently and discards
//! the result, compaction folds every key and persists one `Put` per key.

use bytes::Bytes;
use rayon::prelude::*;

use crate::internal_key::{InternalKey, KeyKind};
use crate::merge::{MergeError, MergeOperator, MergeOutcome};
use crate::record::RecordType;

#[derive(Debug, thiserror::Error)]
pub enum FoldError {
    #[error("merge failed: {0}")]
    Merge(#[from] MergeError),

    #[error("incompatible delta chain for key {key:?}: {existing:?} followed by {incoming:?}")]
    Incompatible {
        key: Bytes,
        existing: RecordType,
        incoming: RecordType,
    },
}

/// The newest non-operand entry of a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Base {
    Put(Bytes),
    Del,
}

/// Entries of one key needed to produce its current value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyHistory {
    pub base: Option<Base>,
    /// Oldest first once finished.
    pub operands: Vec<Bytes>,
    pub newest_seqno: u64,
}

impl KeyHistory {
    pub(crate) fn new(newest_seqno: u64) -> Self {
        Self {
            base: None,
            operands: Vec::new(),
            newest_seqno,
        }
    }

    /// Feeds entries newest first. Returns `true` once a base has been seen
    /// and older entries no longer matter.
    pub(crate) fn push_newer_first(&mut self, kind: KeyKind, value: Bytes) -> bool {
        match kind {
            KeyKind::Merge => self.operands.push(value),
            KeyKind::Put => self.base = Some(Base::Put(value)),
            KeyKind::Del => self.base = Some(Base::Del),
        }
        kind.is_base()
    }

    pub(crate) fn finish(mut self) -> Self {
        self.operands.reverse();
        self
    }
}

/// Produces the current value of a key, or `None` if it has none.
pub fn fold_history(
    operator: &dyn MergeOperator,
    key: &[u8],
    history: &KeyHistory,
) -> Result<Option<Bytes>, FoldError> {
    let existing = match &history.base {
        Some(Base::Put(value)) => Some(value.as_ref()),
        Some(Base::Del) | None => None,
    };
    if history.operands.is_empty() {
        return Ok(existing.map(Bytes::copy_from_slice));
    }

    match operator.full_merge(key, existing, &history.operands)? {
        Some(MergeOutcome::Merged(value)) => Ok(Some(value)),
        Some(MergeOutcome::Incompatible { existing, incoming }) => Err(FoldError::Incompatible {
            key: Bytes::copy_from_slice(key),
            existing,
            incoming,
        }),
        None => Ok(None),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompactionStats {
    pub keys_in: usize,
    pub keys_out: usize,
    pub entries_in: usize,
    pub operands_folded: usize,
}

#[derive(Debug)]
pub struct CompactionOutput {
    pub entries: Vec<(InternalKey, Bytes)>,
    pub stats: CompactionStats,
}

#[derive(Debug, Clone, Default)]
pub struct CompactionRunner;

impl CompactionRunner {
    /// Folds `entries` (sorted by internal key) into one `Put` per live key.
    ///
    /// Keys whose history ends in a `Del` with nothing newer are dropped. Any
    /// failure aborts the whole run so the caller keeps its unfolded input.
    pub fn run(
        operator: &dyn MergeOperator,
        entries: Vec<(InternalKey, Bytes)>,
    ) -> Result<CompactionOutput, FoldError> {
        let entries_in = entries.len();
        let histories = group_histories(entries);
        let operands_folded = histories.iter().map(|(_, h)| h.operands.len()).sum();

        let folded: Vec<Option<(InternalKey, Bytes)>> = histories
            .par_iter()
            .map(|(key, history)| {
                let value = fold_history(operator, key, history)?;
                Ok(value.map(|value| {
                    (
                        InternalKey::new(key.clone(), history.newest_seqno, KeyKind::Put),
                        value,
                    )
                }))
            })
            .collect::<Result<_, FoldError>>()?;

        let out: Vec<(InternalKey, Bytes)> = folded.into_iter().flatten().collect();
        let stats = CompactionStats {
            keys_in: histories.len(),
            keys_out: out.len(),
            entries_in,
            operands_folded,
        };
        tracing::debug!(?stats, "compacted delta chains");
        Ok(CompactionOutput {
            entries: out,
            stats,
        })
    }
}

pub(crate) fn group_histories(entries: Vec<(InternalKey, Bytes)>) -> Vec<(Bytes, KeyHistory)> {
    let mut out: Vec<(Bytes, KeyHistory)> = Vec::new();
    let mut done = false;
    for (ikey, value) in entries {
        match out.last_mut() {
            Some((key, history)) if *key == ikey.user_key => {
                if !done {
                    done = history.push_newer_first(ikey.kind, value);
                }
            }
            _ => {
                let mut history = KeyHistory::new(ikey.seqno);
                done = history.push_newer_first(ikey.kind, value);
                out.push((ikey.user_key, history));
            }
        }
    }
    out.into_iter()
        .map(|(key, history)| (key, history.finish()))
        .collect()
}
