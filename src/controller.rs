//! The model controller: the trainer-facing client of the table substrate.
//!
//! Parameter tensors are too large to live under one key, so the controller
//! splits each one across `num_table_servers * split_size` keys, derived from
//! the parameter id and the split index. Bulk training data flows through
//! named disk tables instead.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::Result;
use crate::runtime::Runtime;
use crate::table::{
    DiskTable, FloatVecMarshal, GlobalTable, IntMarshal, ModSharder, SumAccumulator,
    TypedDiskTable, TypedGlobalTable,
};

/// keys per parameter id: key = `param_id * PARAM_KEY_STRIDE + split_index`
pub const PARAM_KEY_STRIDE: i32 = 2048;
// longest split shipped in one value
const MAX_SPLIT_LEN: usize = 1_000_000;
// records per disk-table block for data stores
const DATA_BLOCK_RECORDS: usize = 256 * 10;

/// One parameter tensor as the trainer sees it.
#[derive(Debug, Clone, Default)]
pub struct Param {
    /// parameter id, unique across the model
    pub id: i32,
    /// the parameter values
    pub data: Vec<f32>,
    /// the gradient of the last backward pass
    pub grad: Vec<f32>,
}

/// A created table, by kind.
pub enum TableRef {
    /// the parameter table's erased core
    Param(Arc<GlobalTable>),
    /// a bulk-data disk table
    Disk(Arc<DiskTable>),
}

/// Client wrapper that maps model-level operations onto table operations.
pub struct ModelController {
    param_table: TypedGlobalTable<i32, Vec<f32>>,
    disk_tables: HashMap<u32, TypedDiskTable<i32, Vec<f32>>>,
    store_table_map: HashMap<u32, u32>,
    split_size: usize,
    num_servers: usize,
    next_table_id: u32,
    num_data_stores: u32,
}

impl ModelController {
    /// creates the parameter table (table id 0) and an empty store map.
    /// `split_size` scales how many keys a tensor spreads over per server
    ///
    /// # Errors
    /// propagates table-creation failures
    pub fn new(runtime: &Runtime, split_size: usize) -> Result<ModelController> {
        let param_table = runtime.create_table(
            0,
            runtime.config().num_table_servers,
            Arc::new(ModSharder),
            Arc::new(SumAccumulator),
            Arc::new(IntMarshal),
            Arc::new(FloatVecMarshal),
        )?;
        Ok(ModelController {
            param_table,
            disk_tables: HashMap::new(),
            store_table_map: HashMap::new(),
            split_size,
            num_servers: runtime.config().num_table_servers,
            next_table_id: 1,
            num_data_stores: 0,
        })
    }

    // how a tensor of `length` elements spreads over keys:
    // number of splits, elements per split
    fn split_plan(&self, length: usize) -> (usize, usize) {
        let mut split_count = self.num_servers * self.split_size;
        let mut split_len = length / split_count;
        if length % split_count != 0 {
            split_len += 1;
        }
        if split_len > MAX_SPLIT_LEN {
            split_len = MAX_SPLIT_LEN;
            split_count = length / split_len + 1;
        }
        if split_count > PARAM_KEY_STRIDE as usize {
            warn!(
                "tensor of {} elements needs {} splits, more than the key stride allows",
                length, split_count
            );
        }
        (split_count, split_len)
    }

    fn split_key(param_id: i32, split_index: usize) -> i32 {
        param_id * PARAM_KEY_STRIDE + split_index as i32
    }

    /// sends every parameter's gradient to the table as accumulating updates
    ///
    /// # Errors
    /// propagates marshal/transport failures
    pub fn update(&self, params: &[Param]) -> Result<()> {
        for param in params {
            let length = param.grad.len();
            if length == 0 {
                continue;
            }
            let (split_count, split_len) = self.split_plan(length);
            let mut offset = 0;
            for j in 0..split_count {
                if offset >= length {
                    break;
                }
                let end = (offset + split_len).min(length);
                let chunk = param.grad[offset..end].to_vec();
                self.param_table.update(&Self::split_key(param.id, j), &chunk)?;
                offset = end;
            }
        }
        Ok(())
    }

    /// stores every parameter's values, replacing whatever is in the table
    ///
    /// # Errors
    /// propagates marshal/transport failures
    pub fn put(&self, params: &[Param]) -> Result<()> {
        for param in params {
            let length = param.data.len();
            if length == 0 {
                continue;
            }
            let (split_count, split_len) = self.split_plan(length);
            let mut offset = 0;
            for j in 0..split_count {
                if offset >= length {
                    break;
                }
                let end = (offset + split_len).min(length);
                let chunk = param.data[offset..end].to_vec();
                self.param_table.put(&Self::split_key(param.id, j), &chunk)?;
                offset = end;
            }
        }
        Ok(())
    }

    /// fills every parameter's values back from the table
    ///
    /// # Errors
    /// [`crate::ShardError::KeyAbsent`] when a split was never stored;
    /// marshal/transport failures
    pub fn get(&self, params: &mut [Param]) -> Result<()> {
        for param in params.iter_mut() {
            let length = param.data.len();
            if length == 0 {
                continue;
            }
            let (split_count, split_len) = self.split_plan(length);
            let mut offset = 0;
            for j in 0..split_count {
                if offset >= length {
                    break;
                }
                let values = self.param_table.get(&Self::split_key(param.id, j))?;
                debug!("split {} of param {}: {} values", j, param.id, values.len());
                for value in values.into_iter().take(split_len) {
                    if offset >= length {
                        break;
                    }
                    param.data[offset] = value;
                    offset += 1;
                }
            }
        }
        Ok(())
    }

    /// creates a named disk-backed data store and returns its store id.
    /// `fixed_server` pins all blocks to one rank
    pub fn create_data_store(
        &mut self,
        runtime: &Runtime,
        name: &str,
        fixed_server: Option<usize>,
    ) -> u32 {
        let store_id = 2 * self.num_data_stores;
        let table_id = self.next_table_id;
        let table = runtime.create_disk_table(
            table_id,
            DATA_BLOCK_RECORDS,
            name,
            Arc::new(IntMarshal),
            Arc::new(FloatVecMarshal),
            fixed_server,
        );
        self.disk_tables.insert(store_id, table);
        self.store_table_map.insert(store_id, table_id);
        self.next_table_id += 1;
        self.num_data_stores += 1;
        store_id
    }

    /// streams one record into a data store
    ///
    /// # Errors
    /// [`crate::ShardError::Config`] for an unknown store id
    pub fn put_data(&self, store_id: u32, record_id: i32, data: &[f32]) -> Result<()> {
        self.store(store_id)?.put(&record_id, &data.to_vec())
    }

    /// flushes a data store's residual producer buffer
    ///
    /// # Errors
    /// [`crate::ShardError::Config`] for an unknown store id
    pub fn flush_data(&self, store_id: u32) -> Result<()> {
        self.store(store_id)?.finish_put()
    }

    /// reads `count` records from a data store, loading on first use and
    /// rewinding at end of table so epochs can repeat
    ///
    /// # Errors
    /// [`crate::ShardError::Config`] for an unknown store id; IO failures
    pub fn get_data(&self, store_id: u32, count: usize) -> Result<Vec<(i32, Vec<f32>)>> {
        let table = self.store(store_id)?;
        if !table.has_loaded() {
            table.load()?;
        }
        let mut records = Vec::with_capacity(count);
        for _ in 0..count {
            if table.done() {
                table.load()?;
            }
            records.push(table.get()?);
            table.next()?;
        }
        Ok(records)
    }

    fn store(&self, store_id: u32) -> Result<&TypedDiskTable<i32, Vec<f32>>> {
        self.disk_tables.get(&store_id).ok_or_else(|| {
            crate::ShardError::Config(format!("no data store with id {}", store_id))
        })
    }

    /// every table this controller created, keyed by table id
    pub fn tables(&self) -> HashMap<u32, TableRef> {
        let mut tables = HashMap::new();
        for table in self.disk_tables.values() {
            tables.insert(table.inner().id(), TableRef::Disk(table.inner()));
        }
        tables.insert(self.param_table.id(), TableRef::Param(self.param_table.core()));
        tables
    }

    /// store id to table id, for reconstructing stores on other ranks
    pub fn store_table_map(&self) -> HashMap<u32, u32> {
        self.store_table_map.clone()
    }
}
