//! The request dispatcher: one worker loop pulling from the request queue
//! and applying table handlers, one loop draining the disk-write queue.
//!
//! Handlers are registered by the table server at startup. A handler either
//! completes a request or reports a soft failure, in which case the raw
//! payload goes back to the tail of its queue and is retried later.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time::Duration;

use tracing::{debug, error, warn};

use crate::config::GlobalConfig;
use crate::error::Result;
use crate::message::{self, DiskFrame, HashGet, TableData, Tag, TaggedMessage};
use crate::queue::RequestQueue;

/// what a handler did with a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// the request is fully applied; its admission slot is released
    Done,
    /// soft failure (shard not serving yet); the raw payload is re-enqueued
    Retry,
}

/// A table request parsed into its typed form, as handed to a handler.
#[derive(Debug)]
pub enum TableMessage {
    /// a `PutRequest` payload
    Put(TableData),
    /// an `UpdateRequest` payload
    Update(TableData),
    /// a `GetRequest` payload
    Get(HashGet),
}

impl TableMessage {
    /// the marshalled key the request addresses
    pub fn key(&self) -> &[u8] {
        match self {
            TableMessage::Put(d) | TableMessage::Update(d) => &d.key,
            TableMessage::Get(g) => &g.key,
        }
    }
}

/// handler invoked for one table request; registered per tag
pub type TableHandler = Box<dyn Fn(&TableMessage) -> Result<Outcome> + Send + Sync>;

/// handler invoked for one bulk-data frame off the disk queue
pub type DiskHandler = Box<dyn Fn(&DiskFrame) -> Result<()> + Send + Sync>;

/// The per-process dispatcher: request queue, handler table, disk queue.
pub struct Dispatcher {
    queue: RequestQueue,
    handlers: RwLock<Vec<Option<TableHandler>>>,
    disk_queue: Mutex<VecDeque<Vec<u8>>>,
    disk_handler: RwLock<Option<DiskHandler>>,
    outstanding: AtomicUsize,
    running: Arc<AtomicBool>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
    sleep: Duration,
    synchronous: bool,
}

impl Dispatcher {
    /// builds a dispatcher with the queue variant the config selects;
    /// the loops start with [`Dispatcher::start`]
    pub fn new(config: &GlobalConfig) -> Dispatcher {
        let running = Arc::new(AtomicBool::new(true));
        Dispatcher {
            queue: RequestQueue::new(
                config.synchronous,
                config.num_table_servers,
                running.clone(),
                config.sleep_quantum(),
            ),
            handlers: RwLock::new((0..message::NUM_TAGS).map(|_| None).collect()),
            disk_queue: Mutex::new(VecDeque::new()),
            disk_handler: RwLock::new(None),
            outstanding: AtomicUsize::new(0),
            running,
            threads: Mutex::new(Vec::new()),
            sleep: config.sleep_quantum(),
            synchronous: config.synchronous,
        }
    }

    /// registers the handler for a table-request tag
    pub fn register_handler(&self, tag: Tag, handler: TableHandler) {
        debug_assert!(tag.is_table_request());
        self.handlers.write().unwrap()[tag as usize] = Some(handler);
    }

    /// registers the handler the disk loop applies to each bulk frame
    pub fn register_disk_handler(&self, handler: DiskHandler) {
        *self.disk_handler.write().unwrap() = Some(handler);
    }

    /// routes a raw inbound request to the request queue or the disk queue
    pub fn enqueue(&self, tag: Tag, data: Vec<u8>) {
        if tag.is_table_request() {
            if self.queue.enqueue(tag, data) {
                self.outstanding.fetch_add(1, Ordering::SeqCst);
            }
        } else if tag.is_disk_data() {
            self.disk_queue.lock().unwrap().push_back(data);
        } else {
            warn!("dispatcher cannot route tag {:?}", tag);
        }
    }

    /// true while any table request is admitted but not yet completed;
    /// the coordinator polls this to detect quiescence
    pub fn active(&self) -> bool {
        self.outstanding.load(Ordering::SeqCst) > 0
    }

    /// spins until a local get on `key` would observe every queued mutation.
    /// No-op under the asynchronous queue
    pub fn sync_local_get(&self, key: &[u8]) {
        if !self.synchronous {
            return;
        }
        while !self.queue.sync_local_get(key) {
            thread::sleep(self.sleep);
        }
    }

    /// spins until a local put on `key` would not overtake a queued get.
    /// No-op under the asynchronous queue
    pub fn sync_local_put(&self, key: &[u8]) {
        if !self.synchronous {
            return;
        }
        while !self.queue.sync_local_put(key) {
            thread::sleep(self.sleep);
        }
    }

    /// starts the process loop and the disk loop
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let mut threads = self.threads.lock().unwrap();

        let dispatcher = self.clone();
        threads.push(
            thread::Builder::new()
                .name("dispatch".into())
                .spawn(move || dispatcher.process_loop())?,
        );
        let dispatcher = self.clone();
        threads.push(
            thread::Builder::new()
                .name("disk-write".into())
                .spawn(move || dispatcher.disk_loop())?,
        );
        Ok(())
    }

    /// stops both loops and joins them
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        let mut threads = self.threads.lock().unwrap();
        for handle in threads.drain(..) {
            let _ = handle.join();
        }
    }

    // pull → parse → handle → complete or re-enqueue
    fn process_loop(self: Arc<Self>) {
        while let Some(msg) = self.queue.next_request() {
            self.dispatch_one(msg);
        }
        debug!("dispatch loop exiting");
    }

    fn dispatch_one(&self, msg: TaggedMessage) {
        let parsed = match msg.tag {
            Tag::GetRequest => HashGet::decode(&msg.data).map(TableMessage::Get),
            Tag::PutRequest => TableData::decode(&msg.data).map(TableMessage::Put),
            Tag::UpdateRequest => TableData::decode(&msg.data).map(TableMessage::Update),
            other => {
                warn!("non-table tag {:?} in request queue", other);
                self.outstanding.fetch_sub(1, Ordering::SeqCst);
                return;
            }
        };
        let typed = match parsed {
            Ok(typed) => typed,
            Err(e) => {
                // bad payload: logged and dropped
                warn!("dropping unparseable request: {:?}", e);
                self.outstanding.fetch_sub(1, Ordering::SeqCst);
                return;
            }
        };

        let handlers = self.handlers.read().unwrap();
        let handler = match handlers[msg.tag as usize].as_ref() {
            Some(handler) => handler,
            None => {
                warn!("no handler registered for {:?}", msg.tag);
                self.outstanding.fetch_sub(1, Ordering::SeqCst);
                return;
            }
        };

        match handler(&typed) {
            Ok(Outcome::Done) => {
                self.outstanding.fetch_sub(1, Ordering::SeqCst);
                self.queue.event_complete(typed.key());
            }
            Ok(Outcome::Retry) => {
                // back to the tail; the admission slot is released so the
                // retry goes through admission again
                self.queue.event_complete(typed.key());
                self.queue.enqueue(msg.tag, msg.data);
            }
            Err(e) => {
                error!("handler for {:?} failed: {:?}", msg.tag, e);
                self.outstanding.fetch_sub(1, Ordering::SeqCst);
                self.queue.event_complete(typed.key());
            }
        }
    }

    fn disk_loop(self: Arc<Self>) {
        while self.running.load(Ordering::Relaxed) {
            let data = self.disk_queue.lock().unwrap().pop_front();
            let data = match data {
                Some(data) => data,
                None => {
                    thread::sleep(self.sleep);
                    continue;
                }
            };
            let frame = match DiskFrame::decode(&data) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!("dropping unparseable disk frame: {:?}", e);
                    continue;
                }
            };
            let handler = self.disk_handler.read().unwrap();
            match handler.as_ref() {
                Some(handler) => {
                    if let Err(e) = handler(&frame) {
                        error!("disk write failed: {:?}", e);
                    }
                }
                None => warn!("disk frame arrived before a handler was registered"),
            }
        }
        debug!("disk loop exiting");
    }
}
