//! The log-structured checkpoint file for global-table shards.
//!
//! Layout: a four-byte shard-id header, then append-only records of the form
//! `i32 key_len | key | value | i32 table_size | i32 total_len`. `total_len`
//! covers everything before itself in the record and trails it, so recovery
//! can walk the file backward from end-of-file without an index.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use tracing::debug;

use crate::error::{Result, ShardError};

const HEADER_LEN: u64 = 4;
// key_len and table_size fields inside a record
const RECORD_FIXED: usize = 8;

/// One recovered checkpoint record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointRecord {
    /// marshalled key bytes
    pub key: Vec<u8>,
    /// marshalled value bytes
    pub value: Vec<u8>,
    /// number of entries the shard held when this record was appended
    pub table_size: i32,
}

/// An open checkpoint log for one shard.
pub struct LogFile {
    file: File,
    path: PathBuf,
    // bytes already consumed from the end during a backward scan
    back_offset: u64,
}

impl LogFile {
    /// creates a fresh log, writing the shard-id header
    ///
    /// # Errors
    /// propagates the IO error
    pub fn create(path: &Path, shard_id: i32) -> Result<LogFile> {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .read(true)
            .truncate(true)
            .open(path)?;
        file.write_i32::<LittleEndian>(shard_id)?;
        debug!("created checkpoint log {:?} for shard {}", path, shard_id);
        Ok(LogFile {
            file,
            path: path.to_path_buf(),
            back_offset: 0,
        })
    }

    /// opens an existing log for appending or backward recovery;
    /// the file pointer moves to the end
    ///
    /// # Errors
    /// returns [`ShardError::Protocol`] for a file shorter than its header,
    /// otherwise propagates the IO error
    pub fn open(path: &Path) -> Result<LogFile> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.seek(SeekFrom::End(0))?;
        if len < HEADER_LEN {
            return Err(ShardError::Protocol(format!(
                "checkpoint log {:?} shorter than its header",
                path
            )));
        }
        Ok(LogFile {
            file,
            path: path.to_path_buf(),
            back_offset: 0,
        })
    }

    /// appends one record; `table_size` is the shard's entry count after the
    /// mutation this record captures
    ///
    /// # Errors
    /// propagates the IO error
    pub fn append(&mut self, key: &[u8], value: &[u8], table_size: i32) -> Result<()> {
        let total_len = (key.len() + value.len() + RECORD_FIXED) as i32;
        self.file.seek(SeekFrom::End(0))?;
        self.file.write_i32::<LittleEndian>(key.len() as i32)?;
        self.file.write_all(key)?;
        self.file.write_all(value)?;
        self.file.write_i32::<LittleEndian>(table_size)?;
        self.file.write_i32::<LittleEndian>(total_len)?;
        Ok(())
    }

    /// flushes appended records to disk
    ///
    /// # Errors
    /// propagates the IO error
    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    /// reads the record before the current backward-scan position, moving the
    /// scan one record toward the header; `None` once the header is reached.
    /// The first call after open yields the newest record
    ///
    /// # Errors
    /// returns [`ShardError::Protocol`] for a corrupt record, otherwise the IO error
    pub fn previous_entry(&mut self) -> Result<Option<CheckpointRecord>> {
        let len = self.file.seek(SeekFrom::End(0))?;
        // need at least the trailing total_len of one more record
        if len < HEADER_LEN + self.back_offset + 4 {
            return Ok(None);
        }

        self.back_offset += 4;
        self.file.seek(SeekFrom::End(-(self.back_offset as i64)))?;
        let total_len = self.file.read_i32::<LittleEndian>()? as u64;
        if total_len < RECORD_FIXED as u64 || HEADER_LEN + self.back_offset + total_len > len {
            return Err(ShardError::Protocol(format!(
                "corrupt checkpoint record in {:?}",
                self.path
            )));
        }

        self.back_offset += total_len;
        self.file.seek(SeekFrom::End(-(self.back_offset as i64)))?;
        let mut buf = vec![0u8; total_len as usize];
        self.file.read_exact(&mut buf)?;

        let key_len = i32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if key_len + RECORD_FIXED > buf.len() {
            return Err(ShardError::Protocol(format!(
                "corrupt checkpoint key length in {:?}",
                self.path
            )));
        }
        let key = buf[4..4 + key_len].to_vec();
        let value_end = buf.len() - 4;
        let value = buf[4 + key_len..value_end].to_vec();
        let table_size = i32::from_le_bytes([
            buf[value_end],
            buf[value_end + 1],
            buf[value_end + 2],
            buf[value_end + 3],
        ]);

        Ok(Some(CheckpointRecord {
            key,
            value,
            table_size,
        }))
    }

    /// reads the shard id from the header without disturbing appends
    ///
    /// # Errors
    /// propagates the IO error
    pub fn read_shard_id(&mut self) -> Result<i32> {
        self.file.seek(SeekFrom::Start(0))?;
        let shard_id = self.file.read_i32::<LittleEndian>()?;
        self.file.seek(SeekFrom::End(0))?;
        Ok(shard_id)
    }

    /// reads the `table_size` of the newest record by seeking eight bytes
    /// from the end (past the trailing `total_len`)
    ///
    /// # Errors
    /// propagates the IO error; calling this on a log with no records is an error
    pub fn read_latest_table_size(&mut self) -> Result<i32> {
        self.file.seek(SeekFrom::End(-8))?;
        let size = self.file.read_i32::<LittleEndian>()?;
        self.file.seek(SeekFrom::End(0))?;
        Ok(size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backward_scan_yields_reverse_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shard_3.ckpt");

        let records: Vec<(Vec<u8>, Vec<u8>)> = (0..5)
            .map(|i| {
                (
                    format!("key-{}", i).into_bytes(),
                    vec![i as u8; (i + 1) as usize * 3],
                )
            })
            .collect();

        let mut log = LogFile::create(&path, 3).unwrap();
        for (i, (key, value)) in records.iter().enumerate() {
            log.append(key, value, (i + 1) as i32).unwrap();
        }
        log.sync().unwrap();
        drop(log);

        let mut log = LogFile::open(&path).unwrap();
        assert_eq!(log.read_shard_id().unwrap(), 3);
        assert_eq!(log.read_latest_table_size().unwrap(), 5);

        for (i, (key, value)) in records.iter().enumerate().rev() {
            let entry = log.previous_entry().unwrap().unwrap();
            assert_eq!(&entry.key, key);
            assert_eq!(&entry.value, value);
            assert_eq!(entry.table_size, (i + 1) as i32);
        }
        assert!(log.previous_entry().unwrap().is_none());
    }

    #[test]
    fn append_after_reopen_extends_the_log() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shard_0.ckpt");

        let mut log = LogFile::create(&path, 0).unwrap();
        log.append(b"a", b"1", 1).unwrap();
        drop(log);

        let mut log = LogFile::open(&path).unwrap();
        log.append(b"b", b"22", 2).unwrap();
        assert_eq!(log.read_latest_table_size().unwrap(), 2);

        let newest = log.previous_entry().unwrap().unwrap();
        assert_eq!(newest.key, b"b".to_vec());
        let older = log.previous_entry().unwrap().unwrap();
        assert_eq!(older.key, b"a".to_vec());
        assert!(log.previous_entry().unwrap().is_none());
    }

    #[test]
    fn empty_values_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shard_1.ckpt");

        let mut log = LogFile::create(&path, 1).unwrap();
        log.append(b"k", b"", 1).unwrap();
        let entry = log.previous_entry().unwrap().unwrap();
        assert_eq!(entry.key, b"k".to_vec());
        assert!(entry.value.is_empty());
    }
}
