//! One shard's in-memory storage.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::Result;

/// erased accumulator application: folds incoming value bytes into stored ones
pub type MergeFn = Arc<dyn Fn(&mut Vec<u8>, &[u8]) -> Result<()> + Send + Sync>;

/// The key/value map held by one shard. Keys are unique; iteration order is
/// unspecified. Only the dispatcher thread mutates a partition; concurrent
/// readers go through the shard's read lock.
pub struct Partition {
    entries: HashMap<Vec<u8>, Vec<u8>>,
    merge: MergeFn,
}

impl Partition {
    /// an empty partition that merges updates through `merge`
    pub fn new(merge: MergeFn) -> Partition {
        Partition {
            entries: HashMap::new(),
            merge,
        }
    }

    /// true when the key has a stored value
    pub fn contains(&self, key: &[u8]) -> bool {
        self.entries.contains_key(key)
    }

    /// the stored value bytes, if any
    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        self.entries.get(key).map(Vec::as_slice)
    }

    /// stores `value`, replacing any previous value
    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.entries.insert(key, value);
    }

    /// merges `value` into the stored one through the accumulator, creating
    /// the entry when absent
    ///
    /// # Errors
    /// propagates a marshal failure from the accumulator closure
    pub fn update(&mut self, key: Vec<u8>, value: Vec<u8>) -> Result<()> {
        match self.entries.get_mut(&key) {
            Some(existing) => (self.merge)(existing, &value),
            None => {
                self.entries.insert(key, value);
                Ok(())
            }
        }
    }

    /// number of stored entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// true when no entries are stored
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// walks the entries in unspecified order
    pub fn iter(&self) -> impl Iterator<Item = (&[u8], &[u8])> + '_ {
        self.entries
            .iter()
            .map(|(k, v)| (k.as_slice(), v.as_slice()))
    }
}
