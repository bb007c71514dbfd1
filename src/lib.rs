#![deny(missing_docs)]
//! # shardtable
//! A distributed parameter-server substrate for data-parallel training.
//!
//! Worker processes issue `put`/`update`/`get` against sharded, accumulating
//! in-memory tables; requests travel over a rank-addressed message fabric to
//! the shard's owner, where a dispatcher orders them through a request queue
//! and applies them. Bulk training data streams through append-only,
//! block-spilling disk tables, and table shards can be checkpointed to
//! reverse-scannable log files.
//!
//! The process entry point is [`Runtime`]: it owns the transport, the
//! dispatcher and the table server, and is the only way to create tables.

pub mod checkpoint;
pub mod config;
pub mod controller;
pub mod dispatcher;
mod error;
pub mod fabric;
pub mod message;
pub mod queue;
pub mod record_file;
pub mod runtime;
pub mod table;
pub mod transport;

pub use crate::config::GlobalConfig;
pub use crate::controller::{ModelController, Param};
pub use crate::error::{Result, ShardError};
pub use crate::fabric::{Fabric, LocalMesh, TcpFabric, ANY_SOURCE};
pub use crate::message::Tag;
pub use crate::runtime::Runtime;
pub use crate::table::{
    Accumulator, DiskTable, FloatVecMarshal, GlobalTable, IntMarshal, IntSumAccumulator,
    JsonMarshal, Marshal, ModSharder, Sharder, SumAccumulator, TableServer, TypedDiskTable,
    TypedGlobalTable,
};
pub use crate::transport::Transport;
