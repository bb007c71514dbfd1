//! Sharded tables and their capability traits.
//!
//! The core stores and moves bytes; keys and values regain their types only
//! at the client edge through a [`Marshal`] pair, a [`Sharder`] and an
//! [`Accumulator`] supplied at table creation.

use std::marker::PhantomData;

use byteorder::{ByteOrder, LittleEndian};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Result, ShardError};

mod disk;
mod global;
mod partition;
mod server;

pub use self::disk::{
    load_blocks, DiskTable, DiskTableDescriptor, DiskTableIterator, FileBlock, TypedDiskTable,
};
pub use self::global::{GlobalTable, ShardState, TypedGlobalTable};
pub use self::partition::{MergeFn, Partition};
pub use self::server::TableServer;

/// Converts a typed key or value to and from its wire bytes.
pub trait Marshal<T>: Send + Sync {
    /// serializes a value
    ///
    /// # Errors
    /// returns [`ShardError::Marshal`] when the value cannot be serialized
    fn marshal(&self, value: &T) -> Result<Vec<u8>>;

    /// deserializes a value
    ///
    /// # Errors
    /// returns [`ShardError::Marshal`] for bytes that do not parse
    fn unmarshal(&self, bytes: &[u8]) -> Result<T>;
}

/// Maps a key to the shard index that owns it.
pub trait Sharder<K>: Send + Sync {
    /// the shard index for `key`; the table reduces it modulo its shard count
    fn shard_of(&self, key: &K) -> usize;
}

/// Merges an incoming update into the stored value.
///
/// Must be associative, because updates from different workers may be
/// reordered on the wire, and commutative as well when the asynchronous
/// request queue is in use.
pub trait Accumulator<V>: Send + Sync {
    /// folds `incoming` into `existing` in place
    fn merge(&self, existing: &mut V, incoming: V);
}

/// Identity of a global table: id and shard count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableDescriptor {
    /// table id, unique within a run
    pub id: u32,
    /// number of shards the key space is split into
    pub num_shards: usize,
}

/// Shards integer keys by value modulo the shard count.
#[derive(Debug, Clone, Copy, Default)]
pub struct ModSharder;

impl Sharder<i32> for ModSharder {
    fn shard_of(&self, key: &i32) -> usize {
        // negative keys wrap to a stable non-negative image
        *key as u32 as usize
    }
}

impl Sharder<u64> for ModSharder {
    fn shard_of(&self, key: &u64) -> usize {
        *key as usize
    }
}

/// Element-wise float-vector addition, the accumulator behind gradient
/// aggregation. A longer incoming vector extends the stored one.
#[derive(Debug, Clone, Copy, Default)]
pub struct SumAccumulator;

impl Accumulator<Vec<f32>> for SumAccumulator {
    fn merge(&self, existing: &mut Vec<f32>, incoming: Vec<f32>) {
        if incoming.len() > existing.len() {
            existing.resize(incoming.len(), 0.0);
        }
        for (slot, add) in existing.iter_mut().zip(incoming.into_iter()) {
            *slot += add;
        }
    }
}

/// Addition on scalar integers; handy for counters and tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct IntSumAccumulator;

impl Accumulator<i64> for IntSumAccumulator {
    fn merge(&self, existing: &mut i64, incoming: i64) {
        *existing += incoming;
    }
}

/// Marshals any serde type through JSON. The general-purpose choice for
/// values off the hot path.
pub struct JsonMarshal<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> Default for JsonMarshal<T> {
    fn default() -> Self {
        JsonMarshal {
            _marker: PhantomData,
        }
    }
}

impl<T> Marshal<T> for JsonMarshal<T>
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    fn marshal(&self, value: &T) -> Result<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| ShardError::Marshal(e.to_string()))
    }

    fn unmarshal(&self, bytes: &[u8]) -> Result<T> {
        serde_json::from_slice(bytes).map_err(|e| ShardError::Marshal(e.to_string()))
    }
}

/// Four-byte little-endian framing for `i32` keys.
#[derive(Debug, Clone, Copy, Default)]
pub struct IntMarshal;

impl Marshal<i32> for IntMarshal {
    fn marshal(&self, value: &i32) -> Result<Vec<u8>> {
        Ok(value.to_le_bytes().to_vec())
    }

    fn unmarshal(&self, bytes: &[u8]) -> Result<i32> {
        if bytes.len() != 4 {
            return Err(ShardError::Marshal(format!(
                "expected 4 bytes for an i32 key, got {}",
                bytes.len()
            )));
        }
        Ok(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
}

/// Packed little-endian framing for float vectors, the parameter payload.
#[derive(Debug, Clone, Copy, Default)]
pub struct FloatVecMarshal;

impl Marshal<Vec<f32>> for FloatVecMarshal {
    fn marshal(&self, value: &Vec<f32>) -> Result<Vec<u8>> {
        let mut bytes = vec![0u8; value.len() * 4];
        LittleEndian::write_f32_into(value, &mut bytes);
        Ok(bytes)
    }

    fn unmarshal(&self, bytes: &[u8]) -> Result<Vec<f32>> {
        if bytes.len() % 4 != 0 {
            return Err(ShardError::Marshal(format!(
                "float vector payload of {} bytes is not 4-aligned",
                bytes.len()
            )));
        }
        let mut values = vec![0f32; bytes.len() / 4];
        LittleEndian::read_f32_into(bytes, &mut values);
        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn int_marshal_round_trip() {
        let marshal = IntMarshal;
        for key in [0, 1, -1, 42, i32::max_value(), i32::min_value()].iter() {
            let bytes = marshal.marshal(key).unwrap();
            assert_eq!(marshal.unmarshal(&bytes).unwrap(), *key);
        }
        assert!(marshal.unmarshal(b"abc").is_err());
    }

    #[test]
    fn float_vec_marshal_round_trip() {
        let marshal = FloatVecMarshal;
        let vector = vec![0.0f32, -1.5, 3.25, f32::MAX];
        let bytes = marshal.marshal(&vector).unwrap();
        assert_eq!(bytes.len(), 16);
        assert_eq!(marshal.unmarshal(&bytes).unwrap(), vector);
        assert!(marshal.unmarshal(&bytes[..3]).is_err());
    }

    #[test]
    fn json_marshal_round_trip() {
        let marshal: JsonMarshal<Vec<String>> = JsonMarshal::default();
        let value = vec!["a".to_string(), "b".to_string()];
        let bytes = marshal.marshal(&value).unwrap();
        assert_eq!(marshal.unmarshal(&bytes).unwrap(), value);
    }

    #[test]
    fn sum_accumulator_extends_shorter_vectors() {
        let acc = SumAccumulator;
        let mut stored = vec![1.0f32, 2.0];
        acc.merge(&mut stored, vec![0.5, 0.5, 3.0]);
        assert_eq!(stored, vec![1.5, 2.5, 3.0]);
    }

    proptest! {
        // the final value after a sequence of updates must not depend on
        // arrival order
        #[test]
        fn int_sum_is_permutation_invariant(mut updates in proptest::collection::vec(-1000i64..1000, 1..20)) {
            let acc = IntSumAccumulator;

            let mut forward = 0i64;
            for u in updates.iter() {
                acc.merge(&mut forward, *u);
            }

            updates.reverse();
            let mut reversed = 0i64;
            for u in updates.iter() {
                acc.merge(&mut reversed, *u);
            }

            prop_assert_eq!(forward, reversed);
        }

        #[test]
        fn float_sum_is_associative_on_integral_grads(updates in proptest::collection::vec(
            proptest::collection::vec(-100i32..100, 3), 1..10)) {
            let acc = SumAccumulator;
            let updates: Vec<Vec<f32>> = updates
                .into_iter()
                .map(|v| v.into_iter().map(|x| x as f32).collect())
                .collect();

            let mut forward: Vec<f32> = Vec::new();
            for u in updates.iter() {
                acc.merge(&mut forward, u.clone());
            }

            let mut reversed: Vec<f32> = Vec::new();
            for u in updates.iter().rev() {
                acc.merge(&mut reversed, u.clone());
            }

            prop_assert_eq!(forward, reversed);
        }
    }
}
