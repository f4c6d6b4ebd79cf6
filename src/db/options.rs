use serde::{Deserialize, Serialize};

use crate::merge::MergeOptions;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreOptions {
    pub memtable_shards: usize,
    pub merge: MergeOptions,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            memtable_shards: 16,
            merge: MergeOptions::default(),
        }
    }
}
