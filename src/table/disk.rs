//! The append-only, block-spilling disk table.
//!
//! A table is a sequence of record files named `<prefix>_<block>` under the
//! configured data directory; every block except possibly the last holds
//! exactly `max_records_per_block` records. Producers buffer records into
//! frames and ship them to the owning server (a fixed rank, or the hash of
//! the next key when the table is sharded); the server's disk-write handler
//! appends them, sealing and spilling blocks as they fill.

use std::collections::hash_map::DefaultHasher;
use std::fs;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use byteorder::{ByteOrder, LittleEndian};
use tracing::{debug, info};

use crate::config::GlobalConfig;
use crate::error::{Result, ShardError};
use crate::message::{DiskFrame, Tag};
use crate::record_file::{RecordReader, RecordWriter};
use crate::table::Marshal;
use crate::transport::Transport;

/// records buffered on the producer before a frame goes on the wire
pub(crate) const SEND_BUFFER_RECORDS: usize = 64;

/// Identity and tuning of a disk table.
#[derive(Debug, Clone)]
pub struct DiskTableDescriptor {
    /// table id, unique within a run
    pub id: u32,
    /// file-name prefix of this table's blocks
    pub name_prefix: String,
    /// records per sealed block
    pub max_records_per_block: usize,
    /// the single rank storing every block, or `None` to shard by key hash
    pub fixed_server: Option<usize>,
}

/// One sealed block on disk.
#[derive(Debug, Clone)]
pub struct FileBlock {
    /// path of the block file
    pub path: PathBuf,
    /// block index parsed from the file name
    pub index: u64,
    /// file size in bytes
    pub size: u64,
    /// cumulative size of the table up to and including this block
    pub end_pos: u64,
}

// chunk layout inside a block: u32 key_len | key | value
fn encode_record(key: &[u8], value: &[u8]) -> Vec<u8> {
    let mut chunk = vec![0u8; 4];
    LittleEndian::write_u32(&mut chunk, key.len() as u32);
    chunk.extend_from_slice(key);
    chunk.extend_from_slice(value);
    chunk
}

fn decode_record(chunk: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
    if chunk.len() < 4 {
        return Err(ShardError::Protocol("record chunk shorter than its key length".into()));
    }
    let key_len = LittleEndian::read_u32(&chunk[..4]) as usize;
    if 4 + key_len > chunk.len() {
        return Err(ShardError::Protocol("record chunk shorter than its key".into()));
    }
    Ok((chunk[4..4 + key_len].to_vec(), chunk[4 + key_len..].to_vec()))
}

// server-side block writer: appends records, seals a block at capacity and
// opens the next
struct BlockWriter {
    dir: PathBuf,
    name_prefix: String,
    max_records: usize,
    current: Option<RecordWriter>,
    block_index: u64,
    records_in_block: usize,
}

impl BlockWriter {
    fn new(dir: &Path, name_prefix: &str, max_records: usize) -> BlockWriter {
        BlockWriter {
            dir: dir.to_path_buf(),
            name_prefix: name_prefix.to_string(),
            max_records,
            current: None,
            block_index: 0,
            records_in_block: 0,
        }
    }

    fn block_path(&self, index: u64) -> PathBuf {
        self.dir.join(format!("{}_{}", self.name_prefix, index))
    }

    fn append(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        if self.current.is_none() {
            fs::create_dir_all(&self.dir)?;
            let path = self.block_path(self.block_index);
            self.current = Some(RecordWriter::create(&path)?);
        }
        let writer = self.current.as_mut().unwrap();
        writer.write_chunk(&encode_record(key, value))?;
        self.records_in_block += 1;
        if self.records_in_block == self.max_records {
            self.seal()?;
        }
        Ok(())
    }

    // sync + rename; until then the block is a .tmp no reader will see
    fn seal(&mut self) -> Result<()> {
        if let Some(writer) = self.current.take() {
            writer.close()?;
            debug!(
                "sealed block {} of {} with {} records",
                self.block_index, self.name_prefix, self.records_in_block
            );
            self.block_index += 1;
            self.records_in_block = 0;
        }
        Ok(())
    }
}

/// Streams the records of a loaded disk table, one block at a time.
pub struct DiskTableIterator {
    blocks: Vec<FileBlock>,
    next_block: usize,
    reader: Option<RecordReader>,
    current: Option<(Vec<u8>, Vec<u8>)>,
}

impl DiskTableIterator {
    /// opens the first block and positions on its first record
    ///
    /// # Errors
    /// propagates IO errors from opening or reading a block
    pub fn new(blocks: Vec<FileBlock>) -> Result<DiskTableIterator> {
        let mut iterator = DiskTableIterator {
            blocks,
            next_block: 0,
            reader: None,
            current: None,
        };
        iterator.advance()?;
        Ok(iterator)
    }

    /// true once every record of every block has been consumed
    pub fn done(&self) -> bool {
        self.current.is_none()
    }

    /// the record the iterator is positioned on
    pub fn value(&self) -> Option<&(Vec<u8>, Vec<u8>)> {
        self.current.as_ref()
    }

    /// moves to the next record, transparently crossing block boundaries
    ///
    /// # Errors
    /// propagates IO errors from the underlying record files
    pub fn advance(&mut self) -> Result<()> {
        loop {
            if let Some(reader) = self.reader.as_mut() {
                if let Some(chunk) = reader.read_chunk()? {
                    self.current = Some(decode_record(&chunk)?);
                    return Ok(());
                }
                // block exhausted
                self.reader = None;
            }
            if self.next_block >= self.blocks.len() {
                self.current = None;
                return Ok(());
            }
            self.reader = Some(RecordReader::open(&self.blocks[self.next_block].path)?);
            self.next_block += 1;
        }
    }
}

/// An append-only record store spilled across capacity-bounded block files.
///
/// One instance plays both roles: the producer edge (`put_str`,
/// `finish_put`) and the storing server (`dump_to_file`, wired to the
/// dispatcher's disk loop). Tables built without a transport write their
/// blocks locally, which is also the standalone mode.
pub struct DiskTable {
    descriptor: DiskTableDescriptor,
    config: Arc<GlobalConfig>,
    transport: Option<Arc<Transport>>,
    buffer: Mutex<DiskFrame>,
    writer: Mutex<BlockWriter>,
    iterator: Mutex<Option<DiskTableIterator>>,
}

impl DiskTable {
    /// builds the table; no files are touched until records arrive
    pub fn new(
        descriptor: DiskTableDescriptor,
        config: Arc<GlobalConfig>,
        transport: Option<Arc<Transport>>,
    ) -> DiskTable {
        let buffer = Mutex::new(DiskFrame::new(descriptor.id));
        let writer = Mutex::new(BlockWriter::new(
            &config.data_dir,
            &descriptor.name_prefix,
            descriptor.max_records_per_block,
        ));
        DiskTable {
            descriptor,
            config,
            transport,
            buffer,
            writer,
            iterator: Mutex::new(None),
        }
    }

    /// the table's descriptor
    pub fn descriptor(&self) -> &DiskTableDescriptor {
        &self.descriptor
    }

    /// the table's id
    pub fn id(&self) -> u32 {
        self.descriptor.id
    }

    // the rank that stores the next frame
    fn destination(&self, first_key: &[u8]) -> usize {
        match self.descriptor.fixed_server {
            Some(rank) => rank,
            None => {
                let mut hasher = DefaultHasher::new();
                first_key.hash(&mut hasher);
                hasher.finish() as usize % self.config.num_table_servers
            }
        }
    }

    /// buffers one record on the producer; a full buffer goes out as one frame
    ///
    /// # Errors
    /// propagates send/IO errors from a flushed frame
    pub fn put_str(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let full = {
            let mut buffer = self.buffer.lock().unwrap();
            buffer.records.push((key.to_vec(), value.to_vec()));
            buffer.records.len() >= SEND_BUFFER_RECORDS
        };
        if full {
            self.send_buffer(false)?;
        }
        Ok(())
    }

    /// flushes the residual buffer as the final frame of the stream
    ///
    /// # Errors
    /// propagates send/IO errors
    pub fn finish_put(&self) -> Result<()> {
        self.send_buffer(true)
    }

    fn send_buffer(&self, finished: bool) -> Result<()> {
        let frame = {
            let mut buffer = self.buffer.lock().unwrap();
            if buffer.records.is_empty() && !finished {
                return Ok(());
            }
            let mut frame = DiskFrame::new(self.descriptor.id);
            std::mem::swap(&mut frame.records, &mut buffer.records);
            frame.finished = finished;
            frame
        };

        match self.transport.as_ref() {
            Some(transport) => {
                let first_key = frame.records.first().map(|(k, _)| k.as_slice()).unwrap_or(&[]);
                let dst = self.destination(first_key);
                let tag = if finished {
                    Tag::DataPutRequestFinish
                } else {
                    Tag::DataPutRequest
                };
                transport.send(dst, tag, frame.encode());
                Ok(())
            }
            None => self.dump_to_file(&frame),
        }
    }

    /// appends a frame's records to the current block, sealing at capacity;
    /// a finished frame also seals the trailing partial block.
    /// This is the disk-write handler's entry point on the storing server
    ///
    /// # Errors
    /// propagates IO errors
    pub fn dump_to_file(&self, frame: &DiskFrame) -> Result<()> {
        let mut writer = self.writer.lock().unwrap();
        for (key, value) in &frame.records {
            writer.append(key, value)?;
        }
        if frame.finished {
            writer.seal()?;
            info!(
                "disk table {} finished with {} sealed blocks",
                self.descriptor.name_prefix, writer.block_index
            );
        }
        Ok(())
    }

    /// enumerates the sealed blocks and positions a fresh iterator on the
    /// first record. Calling it again rewinds
    ///
    /// # Errors
    /// propagates IO errors
    pub fn load(&self) -> Result<()> {
        let blocks = load_blocks(&self.config.data_dir, &self.descriptor.name_prefix)?;
        debug!(
            "disk table {} loaded {} blocks",
            self.descriptor.name_prefix,
            blocks.len()
        );
        *self.iterator.lock().unwrap() = Some(DiskTableIterator::new(blocks)?);
        Ok(())
    }

    /// true once [`DiskTable::load`] has run
    pub fn has_loaded(&self) -> bool {
        self.iterator.lock().unwrap().is_some()
    }

    /// true when the iterator has consumed every record (or nothing is loaded)
    pub fn done(&self) -> bool {
        self.iterator
            .lock()
            .unwrap()
            .as_ref()
            .map_or(true, DiskTableIterator::done)
    }

    /// the record the iterator is positioned on
    ///
    /// # Errors
    /// [`ShardError::KeyAbsent`] when the table is exhausted or not loaded
    pub fn get_str(&self) -> Result<(Vec<u8>, Vec<u8>)> {
        self.iterator
            .lock()
            .unwrap()
            .as_ref()
            .and_then(DiskTableIterator::value)
            .cloned()
            .ok_or(ShardError::KeyAbsent)
    }

    /// advances the iterator by one record
    ///
    /// # Errors
    /// propagates IO errors
    pub fn next(&self) -> Result<()> {
        if let Some(iterator) = self.iterator.lock().unwrap().as_mut() {
            iterator.advance()?;
        }
        Ok(())
    }
}

/// enumerates `<prefix>_<index>` block files under `dir`, sorted by index.
/// Staging `.tmp` files are invisible, so a crashed writer leaves no block
///
/// # Errors
/// propagates IO errors; a missing directory yields an empty table
pub fn load_blocks(dir: &Path, prefix: &str) -> Result<Vec<FileBlock>> {
    let mut blocks: Vec<FileBlock> = Vec::new();
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(ref e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(blocks),
        Err(e) => return Err(e.into()),
    };
    let wanted = format!("{}_", prefix);
    for entry in entries.flatten() {
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name();
        let name = match name.to_str() {
            Some(name) => name,
            None => continue,
        };
        // the suffix after the prefix must be a bare block index; anything
        // else (foreign files, .tmp staging) is not a block
        let index = match name.strip_prefix(&wanted).and_then(|s| s.parse::<u64>().ok()) {
            Some(index) => index,
            None => continue,
        };
        let size = entry.metadata()?.len();
        blocks.push(FileBlock {
            path: entry.path(),
            index,
            size,
            end_pos: 0,
        });
    }
    blocks.sort_by_key(|block| block.index);
    let mut end_pos = 0;
    for block in blocks.iter_mut() {
        end_pos += block.size;
        block.end_pos = end_pos;
    }
    Ok(blocks)
}

/// The typed edge of a disk table.
pub struct TypedDiskTable<K, V> {
    inner: Arc<DiskTable>,
    key_marshal: Arc<dyn Marshal<K>>,
    value_marshal: Arc<dyn Marshal<V>>,
}

impl<K, V> TypedDiskTable<K, V> {
    pub(crate) fn new(
        inner: Arc<DiskTable>,
        key_marshal: Arc<dyn Marshal<K>>,
        value_marshal: Arc<dyn Marshal<V>>,
    ) -> TypedDiskTable<K, V> {
        TypedDiskTable {
            inner,
            key_marshal,
            value_marshal,
        }
    }

    /// the erased table, shared with the table server's disk handler
    pub fn inner(&self) -> Arc<DiskTable> {
        self.inner.clone()
    }

    /// buffers one typed record for storage
    ///
    /// # Errors
    /// propagates marshal and send failures
    pub fn put(&self, key: &K, value: &V) -> Result<()> {
        let key_bytes = self.key_marshal.marshal(key)?;
        let value_bytes = self.value_marshal.marshal(value)?;
        self.inner.put_str(&key_bytes, &value_bytes)
    }

    /// flushes the residual producer buffer as the final frame
    ///
    /// # Errors
    /// propagates send failures
    pub fn finish_put(&self) -> Result<()> {
        self.inner.finish_put()
    }

    /// enumerates blocks and rewinds the iterator
    ///
    /// # Errors
    /// propagates IO errors
    pub fn load(&self) -> Result<()> {
        self.inner.load()
    }

    /// true once [`TypedDiskTable::load`] has run
    pub fn has_loaded(&self) -> bool {
        self.inner.has_loaded()
    }

    /// the typed record the iterator is positioned on
    ///
    /// # Errors
    /// [`ShardError::KeyAbsent`] at end of table; marshal failures
    pub fn get(&self) -> Result<(K, V)> {
        let (key_bytes, value_bytes) = self.inner.get_str()?;
        Ok((
            self.key_marshal.unmarshal(&key_bytes)?,
            self.value_marshal.unmarshal(&value_bytes)?,
        ))
    }

    /// advances the iterator by one record
    ///
    /// # Errors
    /// propagates IO errors
    pub fn next(&self) -> Result<()> {
        self.inner.next()
    }

    /// true when every record has been consumed
    pub fn done(&self) -> bool {
        self.inner.done()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_table(dir: &Path, max_records: usize) -> DiskTable {
        let config = Arc::new(GlobalConfig::new(0, 1, 1, dir));
        DiskTable::new(
            DiskTableDescriptor {
                id: 1,
                name_prefix: "batch".into(),
                max_records_per_block: max_records,
                fixed_server: Some(0),
            },
            config,
            None,
        )
    }

    #[test]
    fn spills_into_capacity_bounded_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let table = local_table(dir.path(), 3);

        for i in 0..10u8 {
            table.put_str(&[i], &[i; 4]).unwrap();
        }
        table.finish_put().unwrap();

        let blocks = load_blocks(dir.path(), "batch").unwrap();
        assert_eq!(blocks.len(), 4);
        assert_eq!(blocks[0].size, blocks[1].size);
        assert_eq!(blocks[1].size, blocks[2].size);
        // the trailing block holds the single residual record
        assert!(blocks[3].size < blocks[2].size);

        table.load().unwrap();
        for i in 0..10u8 {
            assert!(!table.done());
            let (key, value) = table.get_str().unwrap();
            assert_eq!(key, vec![i]);
            assert_eq!(value, vec![i; 4]);
            table.next().unwrap();
        }
        assert!(table.done());
    }

    #[test]
    fn crashed_writer_leaves_no_visible_block() {
        let dir = tempfile::tempdir().unwrap();
        let table = local_table(dir.path(), 3);

        table.put_str(b"a", b"1").unwrap();
        table.put_str(b"b", b"2").unwrap();
        // flush to the block writer without finishing, then "crash"
        table.send_buffer(false).unwrap();
        drop(table);

        let table = local_table(dir.path(), 3);
        table.load().unwrap();
        assert_eq!(load_blocks(dir.path(), "batch").unwrap().len(), 0);
        assert!(table.done());
        assert!(table.get_str().is_err());
    }

    #[test]
    fn iterator_crosses_block_boundaries() {
        let dir = tempfile::tempdir().unwrap();
        let table = local_table(dir.path(), 2);
        for i in 0..4u8 {
            table.put_str(&[i], b"v").unwrap();
        }
        table.finish_put().unwrap();

        let blocks = load_blocks(dir.path(), "batch").unwrap();
        assert_eq!(blocks.len(), 2);
        let mut iterator = DiskTableIterator::new(blocks).unwrap();
        let mut seen = Vec::new();
        while !iterator.done() {
            seen.push(iterator.value().unwrap().0.clone());
            iterator.advance().unwrap();
        }
        assert_eq!(seen, vec![vec![0u8], vec![1], vec![2], vec![3]]);
    }

    #[test]
    fn foreign_files_are_not_blocks() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("batch_0.tmp"), b"staging").unwrap();
        fs::write(dir.path().join("batch_notanumber"), b"junk").unwrap();
        fs::write(dir.path().join("other_0"), b"different table").unwrap();
        assert!(load_blocks(dir.path(), "batch").unwrap().is_empty());
    }
}
