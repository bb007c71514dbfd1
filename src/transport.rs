//! The process-wide message endpoint: one network thread multiplexing the
//! fabric into per-tag, per-peer queues.
//!
//! The loop probes the fabric, routes table requests and bulk data into the
//! dispatcher, parks everything else in response queues for synchronous
//! readers, then pushes queued outbound sends through and retires the
//! completed ones. Control-plane tags may additionally register an inline
//! callback that runs on the network thread right after routing.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::config::GlobalConfig;
use crate::dispatcher::Dispatcher;
use crate::error::{Result, ShardError};
use crate::fabric::{Fabric, Frame, ANY_SOURCE};
use crate::message::{self, Tag};

/// callback invoked on the network thread after a frame of its tag is routed
pub type TagCallback = Box<dyn Fn() + Send + Sync>;

/// Byte counters for bulk-data traffic, kept for throughput reporting.
#[derive(Debug, Default)]
pub struct TransferStats {
    first_byte_received: Option<Instant>,
    last_byte_received: Option<Instant>,
    total_bytes_received: u64,
}

/// The process-wide transport endpoint.
pub struct Transport {
    config: Arc<GlobalConfig>,
    fabric: Arc<dyn Fabric>,
    dispatcher: Arc<Dispatcher>,
    pending_sends: Mutex<VecDeque<(usize, Tag, Vec<u8>)>>,
    in_flight: AtomicUsize,
    // one FIFO per (tag, source); one lock per tag
    response_queues: Vec<Mutex<HashMap<usize, VecDeque<Vec<u8>>>>>,
    callbacks: RwLock<Vec<Option<TagCallback>>>,
    running: Arc<AtomicBool>,
    io_thread: Mutex<Option<thread::JoinHandle<()>>>,
    stats: Mutex<TransferStats>,
    send_failures: AtomicU64,
}

impl Transport {
    /// builds the endpoint; the network loop starts with [`Transport::start`]
    pub fn new(
        config: Arc<GlobalConfig>,
        fabric: Arc<dyn Fabric>,
        dispatcher: Arc<Dispatcher>,
    ) -> Transport {
        Transport {
            config,
            fabric,
            dispatcher,
            pending_sends: Mutex::new(VecDeque::new()),
            in_flight: AtomicUsize::new(0),
            response_queues: (0..message::NUM_TAGS).map(|_| Mutex::new(HashMap::new())).collect(),
            callbacks: RwLock::new((0..message::NUM_TAGS).map(|_| None).collect()),
            running: Arc::new(AtomicBool::new(true)),
            io_thread: Mutex::new(None),
            stats: Mutex::new(TransferStats::default()),
            send_failures: AtomicU64::new(0),
        }
    }

    /// this process's rank on the fabric
    pub fn rank(&self) -> usize {
        self.fabric.rank()
    }

    /// total number of ranks on the fabric
    pub fn world_size(&self) -> usize {
        self.fabric.world_size()
    }

    /// registers the inline callback for a control tag.
    /// Must be called before [`Transport::start`] routes frames of that tag
    pub fn register_callback(&self, tag: Tag, callback: TagCallback) {
        self.callbacks.write().unwrap()[tag as usize] = Some(callback);
    }

    /// queues one message for delivery; returns immediately.
    /// The payload is owned by the transport until the underlying send retires
    pub fn send(&self, dst: usize, tag: Tag, payload: Vec<u8>) {
        self.pending_sends.lock().unwrap().push_back((dst, tag, payload));
    }

    /// sends to every rank except the coordinator
    pub fn broadcast(&self, tag: Tag, payload: &[u8]) {
        for rank in 0..self.world_size() - 1 {
            self.send(rank, tag, payload.to_vec());
        }
    }

    /// broadcasts, then blocks until every non-coordinator has replied with `reply`
    pub fn sync_broadcast(&self, tag: Tag, reply: Tag, payload: &[u8]) -> Result<()> {
        self.broadcast(tag, payload);
        self.wait_for_sync(reply, self.world_size() - 1)
    }

    fn wait_for_sync(&self, reply: Tag, mut count: usize) -> Result<()> {
        while count > 0 {
            self.read(ANY_SOURCE, reply)?;
            count -= 1;
        }
        Ok(())
    }

    /// blocking read of one message with the given tag from `src`
    /// (or any rank for [`ANY_SOURCE`]); returns the payload and its source
    ///
    /// # Errors
    /// returns [`ShardError::Shutdown`] when the transport stops while waiting
    pub fn read(&self, src: usize, tag: Tag) -> Result<(Vec<u8>, usize)> {
        loop {
            if let Some(found) = self.try_read(src, tag) {
                return Ok(found);
            }
            if !self.running.load(Ordering::Relaxed) {
                return Err(ShardError::Shutdown);
            }
            thread::sleep(self.config.sleep_quantum());
        }
    }

    /// polling read; `None` when no matching message is queued
    pub fn try_read(&self, src: usize, tag: Tag) -> Option<(Vec<u8>, usize)> {
        if src == ANY_SOURCE {
            for rank in 0..self.world_size() {
                if let Some(found) = self.check_queue(rank, tag) {
                    return Some(found);
                }
            }
            None
        } else {
            self.check_queue(src, tag)
        }
    }

    fn check_queue(&self, src: usize, tag: Tag) -> Option<(Vec<u8>, usize)> {
        let mut queues = self.response_queues[tag as usize].lock().unwrap();
        let payload = queues.get_mut(&src)?.pop_front()?;
        Some((payload, src))
    }

    /// true while any outbound send is queued or in flight
    pub fn active(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst) > 0
            || !self.pending_sends.lock().unwrap().is_empty()
    }

    /// blocks until the outbound queue is empty and all sends have retired
    pub fn flush(&self) {
        while self.active() {
            thread::sleep(self.config.sleep_quantum());
        }
    }

    /// two-phase barrier across all ranks, driven by the coordinator
    ///
    /// # Errors
    /// returns [`ShardError::Shutdown`] when the transport stops mid-barrier
    pub fn barrier(&self) -> Result<()> {
        let coordinator = self.config.coordinator_rank();
        if self.config.is_coordinator() {
            self.sync_broadcast(Tag::BarrierRequest, Tag::BarrierReply, &[])?;
            self.broadcast(Tag::BarrierReady, &[]);
        } else {
            self.read(coordinator, Tag::BarrierRequest)?;
            // everything this rank sent must be on the wire before it reports in
            self.flush();
            self.send(coordinator, Tag::BarrierReply, Vec::new());
            self.read(coordinator, Tag::BarrierReady)?;
        }
        Ok(())
    }

    /// starts the network loop
    ///
    /// # Errors
    /// propagates the spawn error
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let transport = self.clone();
        let handle = thread::Builder::new()
            .name("network".into())
            .spawn(move || transport.network_loop())?;
        *self.io_thread.lock().unwrap() = Some(handle);
        Ok(())
    }

    /// stops the network loop, joins it, and tears down the fabric
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.io_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
        self.fabric.shutdown();
    }

    /// logs the observed bulk-data receive throughput
    pub fn print_stats(&self) {
        let stats = self.stats.lock().unwrap();
        if let (Some(first), Some(last)) = (stats.first_byte_received, stats.last_byte_received) {
            let elapsed = last.duration_since(first).as_secs_f64();
            if elapsed > 0.0 {
                info!(
                    "bulk receive throughput = {:.0} bytes/s over {} bytes",
                    stats.total_bytes_received as f64 / elapsed,
                    stats.total_bytes_received
                );
            }
        }
    }

    fn network_loop(self: Arc<Self>) {
        debug!("network loop starting on rank {}", self.rank());
        while self.running.load(Ordering::Relaxed) {
            let mut idle = true;

            if let Some(frame) = self.fabric.try_recv() {
                idle = false;
                self.route(frame);
            }

            // push the send queue through
            loop {
                let next = self.pending_sends.lock().unwrap().pop_front();
                let (dst, tag, payload) = match next {
                    Some(send) => send,
                    None => break,
                };
                idle = false;
                self.in_flight.fetch_add(1, Ordering::SeqCst);
                if let Err(e) = self.fabric.send(dst, tag, &payload) {
                    // the fabric is reliable; a reported failure is counted
                    // but the message is considered delivered
                    let failures = self.send_failures.fetch_add(1, Ordering::Relaxed) + 1;
                    warn!("send to rank {} reported failure #{}: {:?}", dst, failures, e);
                }
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
            }

            if idle {
                thread::sleep(self.config.sleep_quantum());
            }
        }
        debug!("network loop exiting on rank {}", self.rank());
    }

    fn route(&self, frame: Frame) {
        let Frame { src, tag, payload } = frame;

        if tag == Tag::DataPutRequest {
            let mut stats = self.stats.lock().unwrap();
            let now = Instant::now();
            if stats.first_byte_received.is_none() {
                stats.first_byte_received = Some(now);
            }
            stats.last_byte_received = Some(now);
            stats.total_bytes_received += payload.len() as u64;
        }

        if tag.is_table_request() || tag.is_disk_data() {
            self.dispatcher.enqueue(tag, payload);
        } else {
            let mut queues = self.response_queues[tag as usize].lock().unwrap();
            queues.entry(src).or_insert_with(VecDeque::new).push_back(payload);
        }

        // control-plane messages that must bypass the queues
        let callbacks = self.callbacks.read().unwrap();
        if let Some(callback) = callbacks[tag as usize].as_ref() {
            callback();
        }
    }
}
