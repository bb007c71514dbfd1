//! A TCP mesh fabric: one listener per rank, lazily connected peer sockets,
//! length-prefixed frames over buffered streams.

use std::io::{BufReader, BufWriter, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crossbeam::channel::{self, Receiver, Sender};
use tracing::{debug, info, warn};

use crate::error::{Result, ShardError};
use crate::fabric::{Fabric, Frame};
use crate::message::Tag;

// peers come up in arbitrary order at launch, so the first send to each
// retries connecting for a while before giving up
const CONNECT_ATTEMPTS: u32 = 40;
const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(250);

/// One rank's endpoint on a TCP full mesh.
///
/// The listener accepts one inbound connection per peer; a reader thread per
/// connection feeds a single inbound channel that `try_recv` drains.
/// Outbound connections are opened on first send to each destination.
pub struct TcpFabric {
    rank: usize,
    hosts: Vec<SocketAddr>,
    writers: Vec<Mutex<Option<BufWriter<TcpStream>>>>,
    inbox: Receiver<Frame>,
    running: Arc<AtomicBool>,
    accept_thread: Mutex<Option<thread::JoinHandle<()>>>,
    send_failures: AtomicU64,
    poll: Duration,
}

impl TcpFabric {
    /// binds the listener for `rank` and starts accepting peers.
    /// `hosts` holds one address per rank
    ///
    /// # Errors
    /// returns the IO error when the listen address cannot be bound
    pub fn bind(rank: usize, hosts: Vec<SocketAddr>, poll: Duration) -> Result<TcpFabric> {
        let listener = TcpListener::bind(hosts[rank])?;
        listener.set_nonblocking(true)?;
        info!("rank {} listening on {}", rank, hosts[rank]);

        let (inbox_tx, inbox) = channel::unbounded::<Frame>();
        let running = Arc::new(AtomicBool::new(true));

        let accept_running = running.clone();
        let accept_thread = thread::Builder::new()
            .name(format!("fabric-accept-{}", rank))
            .spawn(move || accept_loop(listener, inbox_tx, accept_running, poll))?;

        let writers = (0..hosts.len()).map(|_| Mutex::new(None)).collect();
        Ok(TcpFabric {
            rank,
            hosts,
            writers,
            inbox,
            running,
            accept_thread: Mutex::new(Some(accept_thread)),
            send_failures: AtomicU64::new(0),
            poll,
        })
    }

    fn connect(&self, dst: usize) -> Result<BufWriter<TcpStream>> {
        let addr = self.hosts[dst];
        let mut attempt = 0;
        loop {
            match TcpStream::connect(addr) {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    if attempt > 0 {
                        info!("connected to rank {} after {} retries", dst, attempt);
                    }
                    return Ok(BufWriter::new(stream));
                }
                Err(e) if attempt < CONNECT_ATTEMPTS => {
                    debug!("connect to rank {} failed ({}), retrying", dst, e);
                    attempt += 1;
                    thread::sleep(CONNECT_RETRY_DELAY);
                }
                Err(e) => {
                    return Err(ShardError::TransportFatal(format!(
                        "could not reach rank {} at {}: {}",
                        dst, addr, e
                    )))
                }
            }
        }
    }

    /// number of sends the fabric reported as failed
    pub fn failures(&self) -> u64 {
        self.send_failures.load(Ordering::Relaxed)
    }
}

impl Fabric for TcpFabric {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.hosts.len()
    }

    fn send(&self, dst: usize, tag: Tag, payload: &[u8]) -> Result<()> {
        if !self.running.load(Ordering::Relaxed) {
            return Err(ShardError::Shutdown);
        }
        let mut slot = self
            .writers
            .get(dst)
            .ok_or_else(|| {
                ShardError::TransportFatal(format!(
                    "rank {} outside world of {}",
                    dst,
                    self.hosts.len()
                ))
            })?
            .lock()
            .unwrap();
        if slot.is_none() {
            *slot = Some(self.connect(dst)?);
        }
        let writer = slot.as_mut().unwrap();

        let wrote = write_frame(writer, self.rank, tag, payload);
        if let Err(e) = wrote {
            // one reconnect attempt before reporting the send as failed
            self.send_failures.fetch_add(1, Ordering::Relaxed);
            warn!("send to rank {} failed ({}), reconnecting", dst, e);
            *slot = Some(self.connect(dst)?);
            write_frame(slot.as_mut().unwrap(), self.rank, tag, payload)?;
        }
        Ok(())
    }

    fn try_recv(&self) -> Option<Frame> {
        self.inbox.try_recv().ok()
    }

    fn shutdown(&self) {
        self.running.store(false, Ordering::Relaxed);
        for writer in &self.writers {
            // closing the streams unblocks the peers' reader threads
            *writer.lock().unwrap() = None;
        }
        if let Some(handle) = self.accept_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

fn accept_loop(
    listener: TcpListener,
    inbox_tx: Sender<Frame>,
    running: Arc<AtomicBool>,
    poll: Duration,
) {
    while running.load(Ordering::Relaxed) {
        match listener.accept() {
            Ok((stream, peer)) => {
                debug!("accepted connection from {}", peer);
                let tx = inbox_tx.clone();
                let reader_running = running.clone();
                let spawned = thread::Builder::new()
                    .name(format!("fabric-read-{}", peer))
                    .spawn(move || reader_loop(stream, tx, reader_running));
                if let Err(e) = spawned {
                    warn!("could not spawn reader for {}: {}", peer, e);
                }
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(poll);
            }
            Err(e) => {
                warn!("accept failed: {}", e);
                thread::sleep(poll);
            }
        }
    }
}

fn reader_loop(stream: TcpStream, inbox_tx: Sender<Frame>, running: Arc<AtomicBool>) {
    let mut reader = BufReader::new(stream);
    while running.load(Ordering::Relaxed) {
        match read_frame(&mut reader) {
            Ok(Some(frame)) => {
                if inbox_tx.send(frame).is_err() {
                    break;
                }
            }
            Ok(None) => break, // peer closed
            Err(e) => {
                debug!("connection dropped: {:?}", e);
                break;
            }
        }
    }
}

// wire layout per frame: u32 payload_len | u32 src | u8 tag | payload
fn write_frame<W: Write>(writer: &mut W, src: usize, tag: Tag, payload: &[u8]) -> Result<()> {
    writer.write_u32::<LittleEndian>(payload.len() as u32)?;
    writer.write_u32::<LittleEndian>(src as u32)?;
    writer.write_u8(tag as u8)?;
    writer.write_all(payload)?;
    writer.flush()?;
    Ok(())
}

fn read_frame<R: Read>(reader: &mut R) -> Result<Option<Frame>> {
    let len = match reader.read_u32::<LittleEndian>() {
        Ok(len) => len as usize,
        Err(ref e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let src = reader.read_u32::<LittleEndian>()? as usize;
    let tag = Tag::from_u8(reader.read_u8()?)?;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    Ok(Some(Frame { src, tag, payload }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn free_addrs(n: usize) -> Vec<SocketAddr> {
        (0..n)
            .map(|_| {
                let listener = TcpListener::bind("127.0.0.1:0").unwrap();
                listener.local_addr().unwrap()
            })
            .collect()
    }

    #[test]
    fn two_rank_round_trip() {
        let hosts = free_addrs(2);
        let poll = Duration::from_millis(1);
        let a = TcpFabric::bind(0, hosts.clone(), poll).unwrap();
        let b = TcpFabric::bind(1, hosts, poll).unwrap();

        a.send(1, Tag::ModelConfig, b"hello").unwrap();
        let frame = loop {
            if let Some(f) = b.try_recv() {
                break f;
            }
            thread::sleep(poll);
        };
        assert_eq!(frame.src, 0);
        assert_eq!(frame.tag, Tag::ModelConfig);
        assert_eq!(frame.payload, b"hello".to_vec());

        b.send(0, Tag::PutResponse, b"world").unwrap();
        let frame = loop {
            if let Some(f) = a.try_recv() {
                break f;
            }
            thread::sleep(poll);
        };
        assert_eq!(frame.src, 1);
        assert_eq!(frame.payload, b"world".to_vec());

        a.shutdown();
        b.shutdown();
    }
}
