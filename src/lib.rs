//! `deltamerge` folds row-level delta records for a columnar table layer built
//! on a log-structured key-value store.
//!
//! Base table data is immutable; inserts, updates and deletes made after a
//! load are appended as small delta records under the row's key:
//! - [`record`] defines the wire format of Insert, Update and Delete records.
//! - [`merge`] folds two records for the same key into one. This is the
//!   callback a key-value engine invokes on reads and compactions.
//! - [`DeltaStore`] is an in-memory engine that drives the merge operator the
//!   same way, with sequence-ordered writes, folding reads and compaction.

pub mod compaction;
pub mod db;
pub mod internal_key;
mod memtable;
pub mod merge;
pub mod record;
pub mod row_key;

pub use db::{DeltaStore, Op, OpKind, Range, StoreOptions, Value};
pub use merge::{MergeError, MergeOperator, MergeOptions, MergeOutcome, RecordMergeOperator};
pub use record::{DeltaRecord, FieldUpdate, RecordType};
pub use row_key::RowKey;
