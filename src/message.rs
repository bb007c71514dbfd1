//! Message tags and wire frames.
//!
//! Traffic splits into two planes. Data-plane frames (table requests and
//! responses, bulk disk records) are hand-framed little-endian binary with
//! the key at a fixed offset, so the request queue can pull the key and the
//! shard out of a payload without decoding the rest. Control-plane messages
//! (shard assignment, readiness, model config) are serde structs carried as
//! JSON; they are rare and never inspected partially.

use std::io::{self, Cursor, Read};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};

use crate::error::{Result, ShardError};

/// number of distinct tags; response queues are indexed by tag
pub const NUM_TAGS: usize = 13;

/// Message classes carried by the fabric. One tag per datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Tag {
    /// a table server announces readiness to the coordinator
    RegisterWorker = 0,
    /// coordinator pushes a shard-ownership override
    ShardAssignment = 1,
    /// coordinator ships the model description to the workers
    ModelConfig = 2,
    /// store a value, replacing whatever is there
    PutRequest = 3,
    /// fetch a value; answered with a `PutResponse`
    GetRequest = 4,
    /// merge a value into the stored one through the table's accumulator
    UpdateRequest = 5,
    /// answer to a `GetRequest`, carrying the value or a miss flag
    PutResponse = 6,
    /// a batch of bulk records bound for a disk table
    DataPutRequest = 7,
    /// the final batch of a bulk stream
    DataPutRequestFinish = 8,
    /// barrier phase one, coordinator to workers
    BarrierRequest = 9,
    /// barrier phase one, worker acknowledgement after flushing sends
    BarrierReply = 10,
    /// barrier phase two, coordinator releases the workers
    BarrierReady = 11,
    /// coordinator tells a worker to tear down
    Shutdown = 12,
}

impl Tag {
    /// decodes a wire byte into a tag
    ///
    /// # Errors
    /// returns [`ShardError::Protocol`] for a byte outside the closed enum
    pub fn from_u8(byte: u8) -> Result<Tag> {
        let tag = match byte {
            0 => Tag::RegisterWorker,
            1 => Tag::ShardAssignment,
            2 => Tag::ModelConfig,
            3 => Tag::PutRequest,
            4 => Tag::GetRequest,
            5 => Tag::UpdateRequest,
            6 => Tag::PutResponse,
            7 => Tag::DataPutRequest,
            8 => Tag::DataPutRequestFinish,
            9 => Tag::BarrierRequest,
            10 => Tag::BarrierReply,
            11 => Tag::BarrierReady,
            12 => Tag::Shutdown,
            other => {
                debug_assert!(false, "unknown tag byte {}", other);
                return Err(ShardError::Protocol(format!("unknown tag byte {}", other)));
            }
        };
        Ok(tag)
    }

    /// tags routed through the request queue and the dispatcher
    pub fn is_table_request(self) -> bool {
        matches!(self, Tag::PutRequest | Tag::GetRequest | Tag::UpdateRequest)
    }

    /// tags routed to the disk-write queue
    pub fn is_disk_data(self) -> bool {
        matches!(self, Tag::DataPutRequest | Tag::DataPutRequestFinish)
    }
}

/// A raw request as it sits in a request queue: the tag plus the undecoded payload.
#[derive(Debug, Clone)]
pub struct TaggedMessage {
    /// class of the request
    pub tag: Tag,
    /// the undecoded frame bytes
    pub data: Vec<u8>,
}

// Shared layout of PUT/UPDATE/GET frames:
//   u32 table | u32 shard | u32 source | u32 key_len | key | ...
// extract_key/extract_shard depend on this prefix and nothing else.
const KEY_LEN_OFFSET: usize = 12;
const KEY_OFFSET: usize = 16;

/// Payload of a put or update request, and of the response to a get.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableData {
    /// id of the table being addressed
    pub table: u32,
    /// shard the key belongs to
    pub shard: u32,
    /// rank of the sender
    pub source: u32,
    /// marshalled key bytes
    pub key: Vec<u8>,
    /// marshalled value bytes; empty together with `missing` for a miss reply
    pub value: Vec<u8>,
    /// set on a get response when the key had no stored value
    pub missing: bool,
}

impl TableData {
    /// frames this message for the wire
    pub fn encode(&self) -> Vec<u8> {
        let mut buf =
            Vec::with_capacity(KEY_OFFSET + self.key.len() + 4 + self.value.len() + 1);
        buf.write_u32::<LittleEndian>(self.table).unwrap();
        buf.write_u32::<LittleEndian>(self.shard).unwrap();
        buf.write_u32::<LittleEndian>(self.source).unwrap();
        buf.write_u32::<LittleEndian>(self.key.len() as u32).unwrap();
        buf.extend_from_slice(&self.key);
        buf.write_u32::<LittleEndian>(self.value.len() as u32).unwrap();
        buf.extend_from_slice(&self.value);
        buf.push(self.missing as u8);
        buf
    }

    /// parses a frame produced by [`TableData::encode`]
    ///
    /// # Errors
    /// returns [`ShardError::Protocol`] for truncated or oversized frames
    pub fn decode(bytes: &[u8]) -> Result<TableData> {
        Self::decode_io(bytes)
            .map_err(|e| ShardError::Protocol(format!("bad table frame: {}", e)))
    }

    fn decode_io(bytes: &[u8]) -> io::Result<TableData> {
        let mut cursor = Cursor::new(bytes);
        let table = cursor.read_u32::<LittleEndian>()?;
        let shard = cursor.read_u32::<LittleEndian>()?;
        let source = cursor.read_u32::<LittleEndian>()?;
        let key = read_bytes(&mut cursor)?;
        let value = read_bytes(&mut cursor)?;
        let missing = cursor.read_u8()? != 0;
        Ok(TableData {
            table,
            shard,
            source,
            key,
            value,
            missing,
        })
    }
}

/// Payload of a get request. Shares the key-first prefix with [`TableData`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashGet {
    /// id of the table being addressed
    pub table: u32,
    /// shard the key belongs to
    pub shard: u32,
    /// rank the response must be sent back to
    pub source: u32,
    /// marshalled key bytes
    pub key: Vec<u8>,
}

impl HashGet {
    /// frames this message for the wire
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(KEY_OFFSET + self.key.len());
        buf.write_u32::<LittleEndian>(self.table).unwrap();
        buf.write_u32::<LittleEndian>(self.shard).unwrap();
        buf.write_u32::<LittleEndian>(self.source).unwrap();
        buf.write_u32::<LittleEndian>(self.key.len() as u32).unwrap();
        buf.extend_from_slice(&self.key);
        buf
    }

    /// parses a frame produced by [`HashGet::encode`]
    ///
    /// # Errors
    /// returns [`ShardError::Protocol`] for truncated frames
    pub fn decode(bytes: &[u8]) -> Result<HashGet> {
        let inner = |bytes: &[u8]| -> io::Result<HashGet> {
            let mut cursor = Cursor::new(bytes);
            let table = cursor.read_u32::<LittleEndian>()?;
            let shard = cursor.read_u32::<LittleEndian>()?;
            let source = cursor.read_u32::<LittleEndian>()?;
            let key = read_bytes(&mut cursor)?;
            Ok(HashGet {
                table,
                shard,
                source,
                key,
            })
        };
        inner(bytes).map_err(|e| ShardError::Protocol(format!("bad get frame: {}", e)))
    }
}

/// A batch of bulk records bound for one disk table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiskFrame {
    /// id of the destination disk table
    pub table: u32,
    /// marks the last frame of a bulk stream
    pub finished: bool,
    /// the `(key, value)` records of this batch, already marshalled
    pub records: Vec<(Vec<u8>, Vec<u8>)>,
}

impl DiskFrame {
    /// an empty frame for the given table
    pub fn new(table: u32) -> Self {
        DiskFrame {
            table,
            finished: false,
            records: Vec::new(),
        }
    }

    /// frames this batch for the wire
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.write_u32::<LittleEndian>(self.table).unwrap();
        buf.push(self.finished as u8);
        buf.write_u32::<LittleEndian>(self.records.len() as u32).unwrap();
        for (key, value) in &self.records {
            buf.write_u32::<LittleEndian>(key.len() as u32).unwrap();
            buf.extend_from_slice(key);
            buf.write_u32::<LittleEndian>(value.len() as u32).unwrap();
            buf.extend_from_slice(value);
        }
        buf
    }

    /// parses a frame produced by [`DiskFrame::encode`]
    ///
    /// # Errors
    /// returns [`ShardError::Protocol`] for truncated frames
    pub fn decode(bytes: &[u8]) -> Result<DiskFrame> {
        let inner = |bytes: &[u8]| -> io::Result<DiskFrame> {
            let mut cursor = Cursor::new(bytes);
            let table = cursor.read_u32::<LittleEndian>()?;
            let finished = cursor.read_u8()? != 0;
            let count = cursor.read_u32::<LittleEndian>()? as usize;
            let mut records = Vec::with_capacity(count);
            for _ in 0..count {
                let key = read_bytes(&mut cursor)?;
                let value = read_bytes(&mut cursor)?;
                records.push((key, value));
            }
            Ok(DiskFrame {
                table,
                finished,
                records,
            })
        };
        inner(bytes).map_err(|e| ShardError::Protocol(format!("bad disk frame: {}", e)))
    }
}

fn read_bytes(cursor: &mut Cursor<&[u8]>) -> io::Result<Vec<u8>> {
    let len = cursor.read_u32::<LittleEndian>()? as usize;
    let remaining = cursor.get_ref().len() as u64 - cursor.position();
    if (len as u64) > remaining {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("length prefix {} exceeds remaining {} bytes", len, remaining),
        ));
    }
    let mut bytes = vec![0u8; len];
    cursor.read_exact(&mut bytes)?;
    Ok(bytes)
}

/// pulls the marshalled key out of a table-request payload without decoding the body
///
/// # Errors
/// returns [`ShardError::Protocol`] when the payload is shorter than its key prefix
pub fn extract_key(data: &[u8]) -> Result<Vec<u8>> {
    if data.len() < KEY_OFFSET {
        return Err(ShardError::Protocol("payload shorter than key prefix".into()));
    }
    let mut len_bytes = [0u8; 4];
    len_bytes.copy_from_slice(&data[KEY_LEN_OFFSET..KEY_OFFSET]);
    let len = u32::from_le_bytes(len_bytes) as usize;
    if data.len() < KEY_OFFSET + len {
        return Err(ShardError::Protocol("payload shorter than its key".into()));
    }
    Ok(data[KEY_OFFSET..KEY_OFFSET + len].to_vec())
}

/// pulls the shard index out of a table-request payload without decoding the body
///
/// # Errors
/// returns [`ShardError::Protocol`] when the payload is shorter than the fixed prefix
pub fn extract_shard(data: &[u8]) -> Result<u32> {
    if data.len() < KEY_OFFSET {
        return Err(ShardError::Protocol("payload shorter than shard prefix".into()));
    }
    let mut shard_bytes = [0u8; 4];
    shard_bytes.copy_from_slice(&data[4..8]);
    Ok(u32::from_le_bytes(shard_bytes))
}

/// Control message: a shard-ownership override pushed by the coordinator.
/// `owners[shard]` is the owning rank.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ShardAssignment {
    /// id of the table being re-assigned
    pub table: u32,
    /// owning rank per shard index
    pub owners: Vec<u32>,
}

/// Control message: a table server announcing that its shards are serving.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerReady {
    /// rank of the announcing server
    pub rank: u32,
}

/// Control message: the opaque model description the coordinator ships to workers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModelSpec {
    /// serialized model description; the substrate never interprets it
    pub blob: String,
}

/// serializes a control message as JSON bytes
///
/// # Errors
/// propagates the serde error
pub fn encode_control<T: Serialize>(msg: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(msg)?)
}

/// parses a control message from JSON bytes
///
/// # Errors
/// propagates the serde error
pub fn decode_control<'a, T: Deserialize<'a>>(bytes: &'a [u8]) -> Result<T> {
    Ok(serde_json::from_slice(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_data_round_trip() {
        let msg = TableData {
            table: 7,
            shard: 3,
            source: 12,
            key: b"param-42".to_vec(),
            value: vec![1, 2, 3, 4, 5],
            missing: false,
        };
        assert_eq!(TableData::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn miss_reply_round_trip() {
        let msg = TableData {
            table: 1,
            shard: 0,
            source: 2,
            key: b"k".to_vec(),
            value: Vec::new(),
            missing: true,
        };
        assert_eq!(TableData::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn hash_get_round_trip() {
        let msg = HashGet {
            table: 2,
            shard: 1,
            source: 0,
            key: b"weights".to_vec(),
        };
        assert_eq!(HashGet::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn disk_frame_round_trip() {
        let mut frame = DiskFrame::new(9);
        frame.records.push((b"r1".to_vec(), vec![0u8; 16]));
        frame.records.push((b"r2".to_vec(), vec![7u8; 3]));
        frame.finished = true;
        assert_eq!(DiskFrame::decode(&frame.encode()).unwrap(), frame);
    }

    #[test]
    fn key_and_shard_extract_without_decode() {
        let put = TableData {
            table: 7,
            shard: 5,
            source: 1,
            key: b"the-key".to_vec(),
            value: vec![9; 100],
            missing: false,
        }
        .encode();
        assert_eq!(extract_key(&put).unwrap(), b"the-key".to_vec());
        assert_eq!(extract_shard(&put).unwrap(), 5);

        // a get frame shares the same prefix
        let get = HashGet {
            table: 7,
            shard: 5,
            source: 1,
            key: b"the-key".to_vec(),
        }
        .encode();
        assert_eq!(extract_key(&get).unwrap(), b"the-key".to_vec());
        assert_eq!(extract_shard(&get).unwrap(), 5);
    }

    #[test]
    fn truncated_frames_are_protocol_errors() {
        let good = HashGet {
            table: 1,
            shard: 0,
            source: 0,
            key: b"abcdef".to_vec(),
        }
        .encode();
        let err = HashGet::decode(&good[..good.len() - 2]).unwrap_err();
        assert!(matches!(err, ShardError::Protocol(_)));
        assert!(extract_key(&good[..10]).is_err());
    }

    #[test]
    fn unknown_tag_rejected() {
        assert!(Tag::from_u8(12).is_ok());
        // release behavior; in debug builds the assert fires first
        #[cfg(not(debug_assertions))]
        assert!(Tag::from_u8(200).is_err());
    }

    #[test]
    fn control_round_trip() {
        let assign = ShardAssignment {
            table: 3,
            owners: vec![0, 1, 0, 1],
        };
        let bytes = encode_control(&assign).unwrap();
        let back: ShardAssignment = decode_control(&bytes).unwrap();
        assert_eq!(back, assign);
    }
}
