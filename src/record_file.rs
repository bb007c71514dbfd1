//! Length-prefixed record files with atomic staging.
//!
//! A record file is a flat sequence of `i32 len | len bytes` chunks. Writers
//! stage into `<path>.tmp` and only the final `close` syncs and renames the
//! file into place, so readers never observe a partially written file.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use tracing::debug;

use crate::error::Result;

/// Writer half of a record file. Data lands in `<path>.tmp` until
/// [`RecordWriter::close`] renames it into place.
pub struct RecordWriter {
    path: PathBuf,
    staging: PathBuf,
    writer: BufWriter<File>,
    pos: u64,
}

impl RecordWriter {
    /// opens the staging file for `path`, truncating any leftover staging data
    ///
    /// # Errors
    /// propagates the IO error
    pub fn create(path: &Path) -> Result<RecordWriter> {
        let staging = staging_path(path);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&staging)?;
        debug!("staging record file {:?}", staging);
        Ok(RecordWriter {
            path: path.to_path_buf(),
            staging,
            writer: BufWriter::new(file),
            pos: 0,
        })
    }

    /// appends one length-prefixed chunk
    ///
    /// # Errors
    /// propagates the IO error
    pub fn write_chunk(&mut self, data: &[u8]) -> Result<()> {
        self.writer.write_i32::<LittleEndian>(data.len() as i32)?;
        self.writer.write_all(data)?;
        self.pos += 4 + data.len() as u64;
        Ok(())
    }

    /// bytes written so far, including length prefixes
    pub fn tell(&self) -> u64 {
        self.pos
    }

    /// flushes, syncs, and renames the staging file to its final name.
    /// Until this call the file is invisible to readers; a crash before it
    /// leaves only the `.tmp` behind
    ///
    /// # Errors
    /// propagates the IO error
    pub fn close(mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        fs::rename(&self.staging, &self.path)?;
        debug!("sealed record file {:?}", self.path);
        Ok(())
    }
}

/// Reader half of a record file.
pub struct RecordReader {
    reader: BufReader<File>,
    pos: u64,
}

impl RecordReader {
    /// opens a sealed record file for sequential reading
    ///
    /// # Errors
    /// propagates the IO error
    pub fn open(path: &Path) -> Result<RecordReader> {
        let file = File::open(path)?;
        Ok(RecordReader {
            reader: BufReader::new(file),
            pos: 0,
        })
    }

    /// reads the next chunk; `None` at a clean end of file
    ///
    /// # Errors
    /// propagates the IO error; a length prefix without its payload is an error
    pub fn read_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        let len = match self.reader.read_i32::<LittleEndian>() {
            Ok(len) => len as usize,
            Err(ref e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut data = vec![0u8; len];
        self.reader.read_exact(&mut data)?;
        self.pos += 4 + len as u64;
        Ok(Some(data))
    }

    /// byte offset after the last chunk read
    pub fn tell(&self) -> u64 {
        self.pos
    }

    /// advances by whole chunks until the offset meets or exceeds `pos`.
    /// Seeking is approximate on purpose: chunk boundaries are the only
    /// positions the length-prefixed format can resume from
    ///
    /// # Errors
    /// propagates the IO error
    pub fn seek(&mut self, pos: u64) -> Result<()> {
        while self.pos < pos {
            if self.read_chunk()?.is_none() {
                break;
            }
        }
        Ok(())
    }
}

fn staging_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".tmp");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunks_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records");

        let mut writer = RecordWriter::create(&path).unwrap();
        writer.write_chunk(b"alpha").unwrap();
        writer.write_chunk(b"").unwrap();
        writer.write_chunk(&[9u8; 300]).unwrap();
        writer.close().unwrap();

        let mut reader = RecordReader::open(&path).unwrap();
        assert_eq!(reader.read_chunk().unwrap().unwrap(), b"alpha".to_vec());
        assert_eq!(reader.read_chunk().unwrap().unwrap(), Vec::<u8>::new());
        assert_eq!(reader.read_chunk().unwrap().unwrap(), vec![9u8; 300]);
        assert!(reader.read_chunk().unwrap().is_none());
    }

    #[test]
    fn staging_is_invisible_until_close() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records");

        let mut writer = RecordWriter::create(&path).unwrap();
        writer.write_chunk(b"half-done").unwrap();
        assert!(!path.exists());
        assert!(dir.path().join("records.tmp").exists());

        writer.close().unwrap();
        assert!(path.exists());
        assert!(!dir.path().join("records.tmp").exists());
    }

    #[test]
    fn abandoned_writer_leaves_only_staging() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records");

        let mut writer = RecordWriter::create(&path).unwrap();
        writer.write_chunk(b"doomed").unwrap();
        drop(writer); // simulated crash: no close, no rename
        assert!(!path.exists());
        assert!(dir.path().join("records.tmp").exists());
    }

    #[test]
    fn seek_lands_on_chunk_boundaries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records");

        let mut writer = RecordWriter::create(&path).unwrap();
        for chunk in [b"aa".as_ref(), b"bbbb", b"cc"].iter() {
            writer.write_chunk(chunk).unwrap();
        }
        writer.close().unwrap();

        // chunk offsets: 0, 6, 14; seeking into the middle of chunk 2
        // overshoots to its end
        let mut reader = RecordReader::open(&path).unwrap();
        reader.seek(8).unwrap();
        assert_eq!(reader.tell(), 14);
        assert_eq!(reader.read_chunk().unwrap().unwrap(), b"cc".to_vec());
    }
}
