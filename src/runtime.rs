//! The explicit process runtime.
//!
//! One [`Runtime`] per process, owned by `main` (or by a test), wires the
//! dispatcher, the transport and the table server together and is the only
//! place tables are created. There are no hidden globals: everything hangs
//! off this handle.

use std::sync::Arc;

use tracing::info;

use crate::config::GlobalConfig;
use crate::dispatcher::Dispatcher;
use crate::error::Result;
use crate::fabric::Fabric;
use crate::table::{
    Accumulator, DiskTable, DiskTableDescriptor, Marshal, MergeFn, GlobalTable, Sharder,
    TableDescriptor, TableServer, TypedDiskTable, TypedGlobalTable,
};
use crate::transport::Transport;

/// Everything a rank runs: config, dispatcher, transport, table server.
pub struct Runtime {
    config: Arc<GlobalConfig>,
    dispatcher: Arc<Dispatcher>,
    transport: Arc<Transport>,
    server: Arc<TableServer>,
}

impl Runtime {
    /// validates the config, wires the components and starts the network,
    /// dispatch and disk threads
    ///
    /// # Errors
    /// propagates config validation and thread-spawn failures
    pub fn start(config: GlobalConfig, fabric: Arc<dyn Fabric>) -> Result<Runtime> {
        config.validate()?;
        let config = Arc::new(config);
        let dispatcher = Arc::new(Dispatcher::new(&config));
        let transport = Arc::new(Transport::new(config.clone(), fabric, dispatcher.clone()));
        let server = TableServer::start(config.clone(), transport.clone(), dispatcher.clone());
        dispatcher.start()?;
        transport.start()?;
        info!(
            "runtime up on rank {} of {} ({} table servers)",
            config.rank, config.world_size, config.num_table_servers
        );
        Ok(Runtime {
            config,
            dispatcher,
            transport,
            server,
        })
    }

    /// the process configuration
    pub fn config(&self) -> &Arc<GlobalConfig> {
        &self.config
    }

    /// the transport endpoint
    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    /// the request dispatcher
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// the table-server glue for this rank
    pub fn table_server(&self) -> &Arc<TableServer> {
        &self.server
    }

    /// creates a sharded global table and brings the locally owned shards
    /// into service
    ///
    /// # Errors
    /// propagates checkpoint-restore IO errors
    pub fn create_table<K, V: 'static>(
        &self,
        id: u32,
        num_shards: usize,
        sharder: Arc<dyn Sharder<K>>,
        accumulator: Arc<dyn Accumulator<V>>,
        key_marshal: Arc<dyn Marshal<K>>,
        value_marshal: Arc<dyn Marshal<V>>,
    ) -> Result<TypedGlobalTable<K, V>> {
        let merge: MergeFn = {
            let value_marshal = value_marshal.clone();
            let accumulator = accumulator.clone();
            Arc::new(move |existing, incoming| {
                let mut stored = value_marshal.unmarshal(existing)?;
                let add = value_marshal.unmarshal(incoming)?;
                accumulator.merge(&mut stored, add);
                *existing = value_marshal.marshal(&stored)?;
                Ok(())
            })
        };
        let core = Arc::new(GlobalTable::new(
            TableDescriptor { id, num_shards },
            merge,
            self.config.num_table_servers,
        ));
        self.server.serve_table(core.clone())?;
        Ok(TypedGlobalTable::new(
            core,
            self.config.clone(),
            self.transport.clone(),
            self.dispatcher.clone(),
            sharder,
            key_marshal,
            value_marshal,
        ))
    }

    /// creates an append-only disk table. `fixed_server` pins every block to
    /// one rank; `None` shards frames by key hash
    pub fn create_disk_table<K, V>(
        &self,
        id: u32,
        max_records_per_block: usize,
        name: &str,
        key_marshal: Arc<dyn Marshal<K>>,
        value_marshal: Arc<dyn Marshal<V>>,
        fixed_server: Option<usize>,
    ) -> TypedDiskTable<K, V> {
        let inner = Arc::new(DiskTable::new(
            DiskTableDescriptor {
                id,
                name_prefix: name.to_string(),
                max_records_per_block,
                fixed_server,
            },
            self.config.clone(),
            Some(self.transport.clone()),
        ));
        self.server.serve_disk_table(inner.clone());
        TypedDiskTable::new(inner, key_marshal, value_marshal)
    }

    /// two-phase barrier across all ranks
    ///
    /// # Errors
    /// propagates a transport shutdown mid-barrier
    pub fn barrier(&self) -> Result<()> {
        self.transport.barrier()
    }

    /// true when no request is outstanding and no send is pending on this rank
    pub fn quiescent(&self) -> bool {
        !self.dispatcher.active() && !self.transport.active()
    }

    /// ordered teardown: drain outbound sends, stop the dispatch and disk
    /// loops, stop the network loop, tear down the fabric
    pub fn shutdown(self) {
        self.transport.flush();
        self.transport.print_stats();
        self.dispatcher.shutdown();
        self.transport.shutdown();
        info!("runtime down on rank {}", self.config.rank);
    }
}
