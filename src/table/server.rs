//! The table-server role: wires tables into the dispatcher, gates shards
//! through their serving states, and persists them to checkpoint logs.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use tracing::{debug, info, warn};

use crate::config::GlobalConfig;
use crate::dispatcher::{Dispatcher, Outcome, TableMessage};
use crate::checkpoint::LogFile;
use crate::error::{Result, ShardError};
use crate::fabric::ANY_SOURCE;
use crate::message::{
    decode_control, encode_control, ServerReady, ShardAssignment, TableData, Tag,
};
use crate::table::{DiskTable, GlobalTable};
use crate::transport::Transport;

/// Per-process glue between the dispatcher and the tables this rank serves.
pub struct TableServer {
    config: Arc<GlobalConfig>,
    transport: Arc<Transport>,
    tables: RwLock<HashMap<u32, Arc<GlobalTable>>>,
    disk_tables: RwLock<HashMap<u32, Arc<DiskTable>>>,
}

impl TableServer {
    /// builds the server and registers its handlers with the dispatcher and
    /// its assignment callback with the transport
    pub fn start(
        config: Arc<GlobalConfig>,
        transport: Arc<Transport>,
        dispatcher: Arc<Dispatcher>,
    ) -> Arc<TableServer> {
        let server = Arc::new(TableServer {
            config,
            transport: transport.clone(),
            tables: RwLock::new(HashMap::new()),
            disk_tables: RwLock::new(HashMap::new()),
        });

        let handler = server.clone();
        dispatcher.register_handler(
            Tag::PutRequest,
            Box::new(move |msg| handler.handle_put(msg)),
        );
        let handler = server.clone();
        dispatcher.register_handler(
            Tag::UpdateRequest,
            Box::new(move |msg| handler.handle_update(msg)),
        );
        let handler = server.clone();
        dispatcher.register_handler(
            Tag::GetRequest,
            Box::new(move |msg| handler.handle_get(msg)),
        );
        let handler = server.clone();
        dispatcher.register_disk_handler(Box::new(move |frame| {
            let table = handler.disk_tables.read().unwrap().get(&frame.table).cloned();
            match table {
                Some(table) => table.dump_to_file(frame),
                None => {
                    warn!("disk frame for unknown table {}", frame.table);
                    Ok(())
                }
            }
        }));

        // shard re-assignments bypass the request queues: the network thread
        // applies them inline as they arrive
        let handler = server.clone();
        let reader = transport.clone();
        transport.register_callback(
            Tag::ShardAssignment,
            Box::new(move || {
                while let Some((payload, _)) = reader.try_read(ANY_SOURCE, Tag::ShardAssignment) {
                    match decode_control::<ShardAssignment>(&payload) {
                        Ok(assignment) => {
                            if let Err(e) = handler.apply_assignment(&assignment) {
                                warn!("could not apply shard assignment: {:?}", e);
                            }
                        }
                        Err(e) => warn!("dropping malformed shard assignment: {:?}", e),
                    }
                }
            }),
        );

        server
    }

    /// adopts a global table: restores any checkpoint for the shards this
    /// rank owns and marks them serving
    ///
    /// # Errors
    /// propagates checkpoint IO errors
    pub fn serve_table(&self, table: Arc<GlobalTable>) -> Result<()> {
        self.tables.write().unwrap().insert(table.id(), table.clone());
        if !self.config.is_table_server() {
            return Ok(());
        }
        for shard in 0..table.num_shards() {
            if table.owner_of(shard) != Some(self.config.rank) {
                continue;
            }
            self.restore_checkpoint(&table, shard)?;
            table.mark_serving(shard);
        }
        Ok(())
    }

    /// adopts a disk table as a storage target for inbound bulk frames
    pub fn serve_disk_table(&self, table: Arc<DiskTable>) {
        self.disk_tables.write().unwrap().insert(table.id(), table);
    }

    /// announces to the coordinator that this server's shards are serving
    pub fn announce_ready(&self) -> Result<()> {
        let payload = encode_control(&ServerReady {
            rank: self.config.rank as u32,
        })?;
        self.transport
            .send(self.config.coordinator_rank(), Tag::RegisterWorker, payload);
        Ok(())
    }

    /// coordinator side: blocks until every table server has announced
    ///
    /// # Errors
    /// propagates a transport shutdown while waiting
    pub fn await_servers(&self) -> Result<()> {
        for _ in 0..self.config.num_table_servers {
            let (payload, _) = self.transport.read(ANY_SOURCE, Tag::RegisterWorker)?;
            let ready: ServerReady = decode_control(&payload)?;
            debug!("table server {} is serving", ready.rank);
        }
        Ok(())
    }

    /// installs an ownership override and brings the shards this rank now
    /// owns into service
    ///
    /// # Errors
    /// propagates checkpoint IO errors
    pub fn apply_assignment(&self, assignment: &ShardAssignment) -> Result<()> {
        let table = self.tables.read().unwrap().get(&assignment.table).cloned();
        let table = match table {
            Some(table) => table,
            None => {
                warn!("assignment for unknown table {}", assignment.table);
                return Ok(());
            }
        };
        table.set_owners(&assignment.owners);
        if self.config.is_table_server() {
            for shard in 0..table.num_shards() {
                if table.owner_of(shard) == Some(self.config.rank) && !table.is_serving(shard) {
                    self.restore_checkpoint(&table, shard)?;
                    table.mark_serving(shard);
                }
            }
        }
        Ok(())
    }

    /// snapshots the shards of `table_id` this rank owns into their
    /// checkpoint logs. Each shard is suspended for the duration, so
    /// concurrent updates soft-fail and retry after the snapshot
    ///
    /// # Errors
    /// propagates IO errors
    pub fn checkpoint_table(&self, table_id: u32) -> Result<()> {
        let table = self
            .tables
            .read()
            .unwrap()
            .get(&table_id)
            .cloned()
            .ok_or_else(|| ShardError::Config(format!("no table with id {}", table_id)))?;

        for shard in 0..table.num_shards() {
            if table.owner_of(shard) != Some(self.config.rank) || !table.is_serving(shard) {
                continue;
            }
            table.suspend_serving(shard);
            let snapshot = table.snapshot(shard);
            let result = (|| -> Result<()> {
                std::fs::create_dir_all(&self.config.data_dir)?;
                let mut log = LogFile::create(&self.checkpoint_path(table_id, shard), shard as i32)?;
                for (i, (key, value)) in snapshot.iter().enumerate() {
                    log.append(key, value, (i + 1) as i32)?;
                }
                log.sync()
            })();
            table.mark_serving(shard);
            result?;
            info!(
                "checkpointed shard {} of table {} ({} entries)",
                shard,
                table_id,
                table.shard_len(shard)
            );
        }
        Ok(())
    }

    fn restore_checkpoint(&self, table: &Arc<GlobalTable>, shard: usize) -> Result<()> {
        let path = self.checkpoint_path(table.id(), shard);
        if !path.exists() {
            return Ok(());
        }
        let mut log = LogFile::open(&path)?;
        let mut recovered = 0usize;
        // backward scan: the newest record for a key wins
        while let Some(entry) = log.previous_entry()? {
            table.restore(shard, entry.key, entry.value);
            recovered += 1;
        }
        info!(
            "restored shard {} of table {} from {} checkpoint records",
            shard,
            table.id(),
            recovered
        );
        Ok(())
    }

    fn checkpoint_path(&self, table_id: u32, shard: usize) -> PathBuf {
        self.config
            .data_dir
            .join(format!("ckpt_{}_{}.log", table_id, shard))
    }

    fn handle_put(&self, msg: &TableMessage) -> Result<Outcome> {
        let data = match msg {
            TableMessage::Put(data) => data,
            _ => return Err(ShardError::Protocol("put handler got a non-put message".into())),
        };
        self.apply_mutation(data, false)
    }

    fn handle_update(&self, msg: &TableMessage) -> Result<Outcome> {
        let data = match msg {
            TableMessage::Update(data) => data,
            _ => {
                return Err(ShardError::Protocol(
                    "update handler got a non-update message".into(),
                ))
            }
        };
        self.apply_mutation(data, true)
    }

    fn apply_mutation(&self, data: &TableData, accumulate: bool) -> Result<Outcome> {
        let table = match self.tables.read().unwrap().get(&data.table).cloned() {
            Some(table) => table,
            // the table may not have been created on this rank yet
            None => return Ok(Outcome::Retry),
        };
        let shard = data.shard as usize;
        let applied = if accumulate {
            table.apply_update(shard, data.key.clone(), data.value.clone())
        } else {
            table.apply_put(shard, data.key.clone(), data.value.clone())
        };
        match applied {
            Ok(()) => Ok(Outcome::Done),
            Err(ref e) if e.is_soft() => Ok(Outcome::Retry),
            Err(e) => Err(e),
        }
    }

    fn handle_get(&self, msg: &TableMessage) -> Result<Outcome> {
        let get = match msg {
            TableMessage::Get(get) => get,
            _ => return Err(ShardError::Protocol("get handler got a non-get message".into())),
        };
        let table = match self.tables.read().unwrap().get(&get.table).cloned() {
            Some(table) => table,
            None => return Ok(Outcome::Retry),
        };
        let shard = get.shard as usize;
        let value = match table.apply_get(shard, &get.key) {
            Ok(value) => value,
            Err(ref e) if e.is_soft() => return Ok(Outcome::Retry),
            Err(e) => return Err(e),
        };
        let response = TableData {
            table: get.table,
            shard: get.shard,
            source: self.config.rank as u32,
            key: get.key.clone(),
            missing: value.is_none(),
            value: value.unwrap_or_default(),
        };
        self.transport
            .send(get.source as usize, Tag::PutResponse, response.encode());
        Ok(Outcome::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::{Fabric, LocalMesh};
    use crate::table::partition::MergeFn;
    use crate::table::TableDescriptor;
    use std::time::{Duration, Instant};

    fn overwrite_merge() -> MergeFn {
        Arc::new(|existing, incoming| {
            *existing = incoming.to_vec();
            Ok(())
        })
    }

    struct Harness {
        config: Arc<GlobalConfig>,
        transport: Arc<Transport>,
        dispatcher: Arc<Dispatcher>,
        server: Arc<TableServer>,
    }

    fn single_rank(dir: &std::path::Path) -> Harness {
        let mut config = GlobalConfig::new(0, 1, 1, dir);
        config.sleep_micros = 100;
        let config = Arc::new(config);
        let fabric: Arc<dyn Fabric> = Arc::new(LocalMesh::new(1).pop().unwrap());
        let dispatcher = Arc::new(Dispatcher::new(&config));
        let transport = Arc::new(Transport::new(config.clone(), fabric, dispatcher.clone()));
        let server = TableServer::start(config.clone(), transport.clone(), dispatcher.clone());
        dispatcher.start().unwrap();
        transport.start().unwrap();
        Harness {
            config,
            transport,
            dispatcher,
            server,
        }
    }

    fn wait_until<F: Fn() -> bool>(cond: F) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "condition never held");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn new_table(id: u32) -> Arc<GlobalTable> {
        Arc::new(GlobalTable::new(
            TableDescriptor { id, num_shards: 1 },
            overwrite_merge(),
            1,
        ))
    }

    #[test]
    fn put_then_get_through_the_wire() {
        let dir = tempfile::tempdir().unwrap();
        let h = single_rank(dir.path());
        let table = new_table(1);
        h.server.serve_table(table.clone()).unwrap();

        let put = TableData {
            table: 1,
            shard: 0,
            source: 0,
            key: b"k".to_vec(),
            value: b"v".to_vec(),
            missing: false,
        };
        h.transport.send(0, Tag::PutRequest, put.encode());
        wait_until(|| table.shard_len(0) == 1);

        let get = crate::message::HashGet {
            table: 1,
            shard: 0,
            source: 0,
            key: b"k".to_vec(),
        };
        h.transport.send(0, Tag::GetRequest, get.encode());
        let (payload, _) = h.transport.read(0, Tag::PutResponse).unwrap();
        let response = TableData::decode(&payload).unwrap();
        assert!(!response.missing);
        assert_eq!(response.value, b"v".to_vec());

        // a miss comes back flagged, not dropped
        let miss = crate::message::HashGet {
            table: 1,
            shard: 0,
            source: 0,
            key: b"absent".to_vec(),
        };
        h.transport.send(0, Tag::GetRequest, miss.encode());
        let (payload, _) = h.transport.read(0, Tag::PutResponse).unwrap();
        assert!(TableData::decode(&payload).unwrap().missing);

        h.dispatcher.shutdown();
        h.transport.shutdown();
    }

    #[test]
    fn checkpoint_round_trips_through_restore() {
        let dir = tempfile::tempdir().unwrap();
        let h = single_rank(dir.path());
        let table = new_table(7);
        h.server.serve_table(table.clone()).unwrap();
        for i in 0..5u8 {
            table.apply_put(0, vec![i], vec![i; 3]).unwrap();
        }
        h.server.checkpoint_table(7).unwrap();
        assert!(table.is_serving(0));

        // a fresh process: new table core, restored from the log
        let table2 = new_table(7);
        h.server.serve_table(table2.clone()).unwrap();
        assert_eq!(table2.shard_len(0), 5);
        for i in 0..5u8 {
            assert_eq!(table2.apply_get(0, &[i]).unwrap(), Some(vec![i; 3]));
        }

        h.dispatcher.shutdown();
        h.transport.shutdown();
    }

    #[test]
    fn assignment_override_reaches_the_table() {
        let dir = tempfile::tempdir().unwrap();
        let h = single_rank(dir.path());
        // two shards spread over a two-server policy: this rank only owns
        // and serves shard 0
        let table = Arc::new(GlobalTable::new(
            TableDescriptor {
                id: 2,
                num_shards: 2,
            },
            overwrite_merge(),
            2,
        ));
        h.server.serve_table(table.clone()).unwrap();
        assert!(table.is_serving(0));
        assert!(!table.is_serving(1));

        // the override arrives as a control message, is applied inline on the
        // network thread, and brings the newly owned shard into service
        let assignment = ShardAssignment {
            table: 2,
            owners: vec![0, 0],
        };
        h.transport
            .send(0, Tag::ShardAssignment, encode_control(&assignment).unwrap());
        wait_until(|| table.is_serving(1));
        assert_eq!(table.owner_of(1), Some(h.config.rank));

        h.dispatcher.shutdown();
        h.transport.shutdown();
    }
}
