//! The sharded, accumulating global table.
//!
//! [`GlobalTable`] is the erased core the dispatcher applies requests to:
//! byte-keyed partitions, one per shard, each gated by a serving state.
//! [`TypedGlobalTable`] is the client edge: it routes typed keys through the
//! sharder, applies locally-owned shards directly and sends everything else
//! to the owner over the transport.

use std::sync::{Arc, RwLock};
use std::thread;

use tracing::debug;

use crate::config::GlobalConfig;
use crate::dispatcher::Dispatcher;
use crate::error::{Result, ShardError};
use crate::message::{HashGet, TableData, Tag};
use crate::table::partition::{MergeFn, Partition};
use crate::table::{Marshal, Sharder, TableDescriptor};
use crate::transport::Transport;

/// Lifecycle of a shard on this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardState {
    /// no owner known yet
    Unassigned,
    /// owner fixed, but not accepting requests (starting up or mid-checkpoint)
    Assigned(usize),
    /// owner fixed and accepting requests
    Serving(usize),
}

impl ShardState {
    /// the owning rank, once assigned
    pub fn owner(&self) -> Option<usize> {
        match self {
            ShardState::Unassigned => None,
            ShardState::Assigned(owner) | ShardState::Serving(owner) => Some(*owner),
        }
    }
}

/// The erased core of one global table.
pub struct GlobalTable {
    descriptor: TableDescriptor,
    partitions: Vec<RwLock<Partition>>,
    states: Vec<RwLock<ShardState>>,
}

impl GlobalTable {
    /// builds the table with the default ownership policy
    /// `owner(shard) = shard % num_table_servers`, every shard `Assigned`
    pub fn new(descriptor: TableDescriptor, merge: MergeFn, num_table_servers: usize) -> GlobalTable {
        let partitions = (0..descriptor.num_shards)
            .map(|_| RwLock::new(Partition::new(merge.clone())))
            .collect();
        let states = (0..descriptor.num_shards)
            .map(|shard| RwLock::new(ShardState::Assigned(shard % num_table_servers)))
            .collect();
        GlobalTable {
            descriptor,
            partitions,
            states,
        }
    }

    /// the table's id
    pub fn id(&self) -> u32 {
        self.descriptor.id
    }

    /// the table's shard count
    pub fn num_shards(&self) -> usize {
        self.descriptor.num_shards
    }

    /// the current state of a shard
    pub fn state(&self, shard: usize) -> ShardState {
        *self.states[shard].read().unwrap()
    }

    /// the rank owning `shard`, if assigned
    pub fn owner_of(&self, shard: usize) -> Option<usize> {
        self.state(shard).owner()
    }

    /// installs an ownership override; shards whose owner changes drop back
    /// to `Assigned` until the new owner marks them serving
    pub fn set_owners(&self, owners: &[u32]) {
        for (shard, &owner) in owners.iter().enumerate().take(self.num_shards()) {
            let mut state = self.states[shard].write().unwrap();
            let owner = owner as usize;
            *state = match *state {
                ShardState::Serving(current) if current == owner => ShardState::Serving(owner),
                _ => ShardState::Assigned(owner),
            };
        }
        debug!("table {} owners set to {:?}", self.id(), owners);
    }

    /// moves a shard to `Serving`; requests against it start succeeding
    pub fn mark_serving(&self, shard: usize) {
        let mut state = self.states[shard].write().unwrap();
        if let Some(owner) = state.owner() {
            *state = ShardState::Serving(owner);
        }
    }

    /// moves a serving shard back to `Assigned`, making requests against it
    /// soft-fail; used while a checkpoint snapshot is being written
    pub fn suspend_serving(&self, shard: usize) {
        let mut state = self.states[shard].write().unwrap();
        if let Some(owner) = state.owner() {
            *state = ShardState::Assigned(owner);
        }
    }

    /// true when the shard accepts requests
    pub fn is_serving(&self, shard: usize) -> bool {
        matches!(self.state(shard), ShardState::Serving(_))
    }

    fn check_serving(&self, shard: usize) -> Result<()> {
        if self.is_serving(shard) {
            Ok(())
        } else {
            Err(ShardError::ShardNotReady {
                table: self.descriptor.id,
                shard: shard as u32,
            })
        }
    }

    /// stores a value on a serving shard
    ///
    /// # Errors
    /// [`ShardError::ShardNotReady`] when the shard is not serving
    pub fn apply_put(&self, shard: usize, key: Vec<u8>, value: Vec<u8>) -> Result<()> {
        self.check_serving(shard)?;
        self.partitions[shard].write().unwrap().put(key, value);
        Ok(())
    }

    /// merges a value into a serving shard through the accumulator
    ///
    /// # Errors
    /// [`ShardError::ShardNotReady`] when the shard is not serving, or the
    /// accumulator's marshal failure
    pub fn apply_update(&self, shard: usize, key: Vec<u8>, value: Vec<u8>) -> Result<()> {
        self.check_serving(shard)?;
        self.partitions[shard].write().unwrap().update(key, value)
    }

    /// reads a value from a serving shard
    ///
    /// # Errors
    /// [`ShardError::ShardNotReady`] when the shard is not serving
    pub fn apply_get(&self, shard: usize, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.check_serving(shard)?;
        Ok(self.partitions[shard]
            .read()
            .unwrap()
            .get(key)
            .map(<[u8]>::to_vec))
    }

    /// number of entries held by a shard, serving or not
    pub fn shard_len(&self, shard: usize) -> usize {
        self.partitions[shard].read().unwrap().len()
    }

    /// copies a shard's entries out, for checkpointing
    pub fn snapshot(&self, shard: usize) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.partitions[shard]
            .read()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.to_vec(), v.to_vec()))
            .collect()
    }

    /// re-inserts a recovered entry unless a newer one is already present.
    /// Recovery scans the checkpoint backward, so the first occurrence of a
    /// key is the newest and later (older) ones are ignored
    pub fn restore(&self, shard: usize, key: Vec<u8>, value: Vec<u8>) {
        let mut partition = self.partitions[shard].write().unwrap();
        if !partition.contains(&key) {
            partition.put(key, value);
        }
    }
}

/// The typed client edge of a global table.
pub struct TypedGlobalTable<K, V> {
    core: Arc<GlobalTable>,
    config: Arc<GlobalConfig>,
    transport: Arc<Transport>,
    dispatcher: Arc<Dispatcher>,
    sharder: Arc<dyn Sharder<K>>,
    key_marshal: Arc<dyn Marshal<K>>,
    value_marshal: Arc<dyn Marshal<V>>,
}

impl<K, V> TypedGlobalTable<K, V> {
    pub(crate) fn new(
        core: Arc<GlobalTable>,
        config: Arc<GlobalConfig>,
        transport: Arc<Transport>,
        dispatcher: Arc<Dispatcher>,
        sharder: Arc<dyn Sharder<K>>,
        key_marshal: Arc<dyn Marshal<K>>,
        value_marshal: Arc<dyn Marshal<V>>,
    ) -> TypedGlobalTable<K, V> {
        TypedGlobalTable {
            core,
            config,
            transport,
            dispatcher,
            sharder,
            key_marshal,
            value_marshal,
        }
    }

    /// the erased core, shared with the table server
    pub fn core(&self) -> Arc<GlobalTable> {
        self.core.clone()
    }

    /// the table's id
    pub fn id(&self) -> u32 {
        self.core.id()
    }

    // shard index, owning rank and marshalled key for one typed key
    fn route(&self, key: &K) -> Result<(usize, usize, Vec<u8>)> {
        let shard = self.sharder.shard_of(key) % self.core.num_shards();
        let owner = self.core.owner_of(shard).ok_or(ShardError::ShardNotReady {
            table: self.core.id(),
            shard: shard as u32,
        })?;
        let key_bytes = self.key_marshal.marshal(key)?;
        Ok((shard, owner, key_bytes))
    }

    fn apply_local<F>(&self, apply: F) -> Result<()>
    where
        F: Fn() -> Result<()>,
    {
        // the local fast path still honors the serving gate; it only spins
        // while the table server is loading a checkpoint
        loop {
            match apply() {
                Err(ref e) if e.is_soft() => thread::sleep(self.config.sleep_quantum()),
                other => return other,
            }
        }
    }

    /// stores a value, replacing any previous one. Remote shards are written
    /// asynchronously; the call does not wait for the owner to apply it
    ///
    /// # Errors
    /// propagates marshal failures
    pub fn put(&self, key: &K, value: &V) -> Result<()> {
        let (shard, owner, key_bytes) = self.route(key)?;
        let value_bytes = self.value_marshal.marshal(value)?;
        if owner == self.config.rank {
            self.dispatcher.sync_local_put(&key_bytes);
            self.apply_local(|| {
                self.core
                    .apply_put(shard, key_bytes.clone(), value_bytes.clone())
            })
        } else {
            let msg = TableData {
                table: self.core.id(),
                shard: shard as u32,
                source: self.config.rank as u32,
                key: key_bytes,
                value: value_bytes,
                missing: false,
            };
            self.transport.send(owner, Tag::PutRequest, msg.encode());
            Ok(())
        }
    }

    /// merges a value into the stored one through the table's accumulator
    ///
    /// # Errors
    /// propagates marshal failures
    pub fn update(&self, key: &K, value: &V) -> Result<()> {
        let (shard, owner, key_bytes) = self.route(key)?;
        let value_bytes = self.value_marshal.marshal(value)?;
        if owner == self.config.rank {
            self.dispatcher.sync_local_put(&key_bytes);
            self.apply_local(|| {
                self.core
                    .apply_update(shard, key_bytes.clone(), value_bytes.clone())
            })
        } else {
            let msg = TableData {
                table: self.core.id(),
                shard: shard as u32,
                source: self.config.rank as u32,
                key: key_bytes,
                value: value_bytes,
                missing: false,
            };
            self.transport.send(owner, Tag::UpdateRequest, msg.encode());
            Ok(())
        }
    }

    /// fetches the value for a key, blocking on the owner's response for
    /// remote shards
    ///
    /// # Errors
    /// [`ShardError::KeyAbsent`] when no value is stored; marshal failures
    pub fn get(&self, key: &K) -> Result<V> {
        let (shard, owner, key_bytes) = self.route(key)?;
        if owner == self.config.rank {
            self.dispatcher.sync_local_get(&key_bytes);
            loop {
                match self.core.apply_get(shard, &key_bytes) {
                    Ok(Some(bytes)) => return self.value_marshal.unmarshal(&bytes),
                    Ok(None) => return Err(ShardError::KeyAbsent),
                    Err(ref e) if e.is_soft() => thread::sleep(self.config.sleep_quantum()),
                    Err(e) => return Err(e),
                }
            }
        } else {
            let msg = HashGet {
                table: self.core.id(),
                shard: shard as u32,
                source: self.config.rank as u32,
                key: key_bytes,
            };
            self.transport.send(owner, Tag::GetRequest, msg.encode());
            let (payload, _) = self.transport.read(owner, Tag::PutResponse)?;
            let response = TableData::decode(&payload)?;
            if response.missing {
                return Err(ShardError::KeyAbsent);
            }
            self.value_marshal.unmarshal(&response.value)
        }
    }
}
