//! Request admission queues feeding the dispatcher.
//!
//! Two strategies behind one enum. The asynchronous queue gives plain FIFO
//! per producing server. The synchronous queue additionally interlocks puts
//! and updates against gets on the same key, so that a worker that issued a
//! put before a get is guaranteed to observe the put's effect.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use tracing::warn;

use crate::message::{self, Tag, TaggedMessage};

/// the two request classes the synchronous queue interlocks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Class {
    /// put or update: mutates the stored value
    Put,
    /// get: reads the stored value
    Get,
}

fn class_of(tag: Tag) -> Class {
    match tag {
        Tag::GetRequest => Class::Get,
        _ => Class::Put,
    }
}

/// A per-process admission structure for inbound table requests.
///
/// The dispatcher thread is the only caller of [`RequestQueue::next_request`];
/// the transport's network loop is the producer.
pub enum RequestQueue {
    /// FIFO per producing server, no cross-class ordering
    Async(AsyncQueue),
    /// per-key put/get interlock on top of the per-server FIFOs
    Sync(SyncQueue),
}

impl RequestQueue {
    /// builds the queue variant selected by configuration
    pub fn new(
        synchronous: bool,
        num_servers: usize,
        running: Arc<AtomicBool>,
        sleep: Duration,
    ) -> RequestQueue {
        if synchronous {
            RequestQueue::Sync(SyncQueue::new(num_servers, running, sleep))
        } else {
            RequestQueue::Async(AsyncQueue::new(num_servers, running, sleep))
        }
    }

    /// appends a raw request; returns false when the payload prefix cannot be
    /// parsed (the request is dropped and logged)
    pub fn enqueue(&self, tag: Tag, data: Vec<u8>) -> bool {
        match self {
            RequestQueue::Async(q) => q.enqueue(tag, data),
            RequestQueue::Sync(q) => q.enqueue(tag, data),
        }
    }

    /// blocks (spin-sleeping) until a request is admissible, then hands it
    /// out; returns `None` once the process is shutting down
    pub fn next_request(&self) -> Option<TaggedMessage> {
        match self {
            RequestQueue::Async(q) => q.next_request(),
            RequestQueue::Sync(q) => q.next_request(),
        }
    }

    /// true when a local get on `key` would observe every queued mutation
    pub fn sync_local_get(&self, key: &[u8]) -> bool {
        match self {
            RequestQueue::Async(_) => true,
            RequestQueue::Sync(q) => q.sync_local_get(key),
        }
    }

    /// true when a local put on `key` would not overtake a queued get
    pub fn sync_local_put(&self, key: &[u8]) -> bool {
        match self {
            RequestQueue::Async(_) => true,
            RequestQueue::Sync(q) => q.sync_local_put(key),
        }
    }

    /// releases the admission slot held by the request handed out for `key`
    pub fn event_complete(&self, key: &[u8]) {
        if let RequestQueue::Sync(q) = self {
            q.event_complete(key)
        }
    }
}

/// FIFO-per-server queue: `enqueue` parses only the shard owner out of the
/// payload prefix and appends; `next_request` round-robins the servers.
pub struct AsyncQueue {
    inner: Mutex<AsyncInner>,
    num_servers: usize,
    running: Arc<AtomicBool>,
    sleep: Duration,
}

struct AsyncInner {
    queues: Vec<VecDeque<TaggedMessage>>,
    cursor: usize,
}

impl AsyncQueue {
    fn new(num_servers: usize, running: Arc<AtomicBool>, sleep: Duration) -> AsyncQueue {
        AsyncQueue {
            inner: Mutex::new(AsyncInner {
                queues: (0..num_servers).map(|_| VecDeque::new()).collect(),
                cursor: 0,
            }),
            num_servers,
            running,
            sleep,
        }
    }

    fn enqueue(&self, tag: Tag, data: Vec<u8>) -> bool {
        let shard = match message::extract_shard(&data) {
            Ok(shard) => shard,
            Err(e) => {
                warn!("dropping request with unreadable prefix: {:?}", e);
                return false;
            }
        };
        let server = shard as usize % self.num_servers;
        let mut inner = self.inner.lock().unwrap();
        inner.queues[server].push_back(TaggedMessage { tag, data });
        true
    }

    fn next_request(&self) -> Option<TaggedMessage> {
        loop {
            {
                let mut inner = self.inner.lock().unwrap();
                let start = inner.cursor;
                for i in 0..self.num_servers {
                    let s = (start + i) % self.num_servers;
                    if let Some(msg) = inner.queues[s].pop_front() {
                        inner.cursor = (s + 1) % self.num_servers;
                        return Some(msg);
                    }
                }
            }
            if !self.running.load(Ordering::Relaxed) {
                return None;
            }
            thread::sleep(self.sleep);
        }
    }
}

/// Per-key interlocking queue.
///
/// Keys are interned to dense ids. Each key tracks, in arrival order, the
/// sequence numbers of its queued puts and gets; a request is admissible only
/// when no older request of the opposite class is still queued for its key
/// and no request for the key is currently being processed. The very first
/// update of a key bypasses the interlock, since there is no prior value for
/// a get to be consistent with.
pub struct SyncQueue {
    inner: Mutex<SyncInner>,
    num_servers: usize,
    running: Arc<AtomicBool>,
    sleep: Duration,
}

struct SyncInner {
    put_queues: Vec<VecDeque<SeqMessage>>,
    get_queues: Vec<VecDeque<SeqMessage>>,
    // last class served per server, for put/get alternation
    served_put_last: Vec<bool>,
    access_counters: Vec<u64>,
    key_map: HashMap<Vec<u8>, usize>,
    keys: Vec<KeyState>,
    cursor: usize,
    next_seq: u64,
}

struct SeqMessage {
    seq: u64,
    key_id: usize,
    msg: TaggedMessage,
}

struct KeyState {
    busy: Option<Class>,
    // cleared once the first put-class request for the key drains
    first_update: bool,
    queued_puts: VecDeque<u64>,
    queued_gets: VecDeque<u64>,
}

impl SyncQueue {
    fn new(num_servers: usize, running: Arc<AtomicBool>, sleep: Duration) -> SyncQueue {
        SyncQueue {
            inner: Mutex::new(SyncInner {
                put_queues: (0..num_servers).map(|_| VecDeque::new()).collect(),
                get_queues: (0..num_servers).map(|_| VecDeque::new()).collect(),
                served_put_last: vec![false; num_servers],
                access_counters: vec![0; num_servers],
                key_map: HashMap::new(),
                keys: Vec::new(),
                cursor: 0,
                next_seq: 0,
            }),
            num_servers,
            running,
            sleep,
        }
    }

    fn enqueue(&self, tag: Tag, data: Vec<u8>) -> bool {
        let (shard, key) = match (message::extract_shard(&data), message::extract_key(&data)) {
            (Ok(shard), Ok(key)) => (shard, key),
            (shard, key) => {
                warn!(
                    "dropping request with unreadable prefix: {:?} / {:?}",
                    shard.err(),
                    key.err()
                );
                return false;
            }
        };
        let server = shard as usize % self.num_servers;

        let mut inner = self.inner.lock().unwrap();
        let key_id = intern(&mut inner, key);
        let seq = inner.next_seq;
        inner.next_seq += 1;

        let entry = SeqMessage {
            seq,
            key_id,
            msg: TaggedMessage { tag, data },
        };
        match class_of(tag) {
            Class::Put => {
                inner.keys[key_id].queued_puts.push_back(seq);
                inner.put_queues[server].push_back(entry);
            }
            Class::Get => {
                inner.keys[key_id].queued_gets.push_back(seq);
                inner.get_queues[server].push_back(entry);
            }
        }
        true
    }

    fn next_request(&self) -> Option<TaggedMessage> {
        loop {
            {
                let mut inner = self.inner.lock().unwrap();
                let start = inner.cursor;
                for i in 0..self.num_servers {
                    let s = (start + i) % self.num_servers;
                    // alternate: whichever class was served last goes second
                    let try_get_first = inner.served_put_last[s];
                    let order = if try_get_first {
                        [Class::Get, Class::Put]
                    } else {
                        [Class::Put, Class::Get]
                    };
                    for &class in &order {
                        if let Some(msg) = Self::take_admissible(&mut inner, s, class) {
                            return Some(msg);
                        }
                    }
                }
            }
            if !self.running.load(Ordering::Relaxed) {
                return None;
            }
            thread::sleep(self.sleep);
        }
    }

    // pops the head of the chosen queue if the admission rule allows it
    fn take_admissible(inner: &mut SyncInner, server: usize, class: Class) -> Option<TaggedMessage> {
        let head = match class {
            Class::Put => inner.put_queues[server].front(),
            Class::Get => inner.get_queues[server].front(),
        }?;
        let key_id = head.key_id;
        let seq = head.seq;
        let tag = head.msg.tag;

        let state = &inner.keys[key_id];
        if state.busy.is_some() {
            return None;
        }
        let admissible = match class {
            // a get must not overtake an older queued put for its key
            Class::Get => state.queued_puts.front().map_or(true, |&p| seq < p),
            // a put must not overtake an older queued get, except the very
            // first update for the key, which has nothing to be ordered against
            Class::Put => {
                (state.first_update && tag == Tag::UpdateRequest)
                    || state.queued_gets.front().map_or(true, |&g| seq < g)
            }
        };
        if !admissible {
            return None;
        }

        let taken = match class {
            Class::Put => inner.put_queues[server].pop_front().unwrap(),
            Class::Get => inner.get_queues[server].pop_front().unwrap(),
        };
        let state = &mut inner.keys[key_id];
        match class {
            Class::Put => {
                state.queued_puts.pop_front();
            }
            Class::Get => {
                state.queued_gets.pop_front();
            }
        }
        state.busy = Some(class);
        inner.served_put_last[server] = class == Class::Put;
        inner.access_counters[server] += 1;
        inner.cursor = (server + 1) % inner.put_queues.len();
        Some(taken.msg)
    }

    fn sync_local_get(&self, key: &[u8]) -> bool {
        let inner = self.inner.lock().unwrap();
        match inner.key_map.get(key) {
            None => true,
            Some(&id) => {
                let state = &inner.keys[id];
                state.queued_puts.is_empty() && state.busy != Some(Class::Put)
            }
        }
    }

    fn sync_local_put(&self, key: &[u8]) -> bool {
        let inner = self.inner.lock().unwrap();
        match inner.key_map.get(key) {
            None => true,
            Some(&id) => {
                let state = &inner.keys[id];
                state.queued_gets.is_empty() && state.busy != Some(Class::Get)
            }
        }
    }

    fn event_complete(&self, key: &[u8]) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(&id) = inner.key_map.get(key) {
            let state = &mut inner.keys[id];
            if state.busy == Some(Class::Put) {
                state.first_update = false;
            }
            state.busy = None;
        }
    }
}

fn intern(inner: &mut SyncInner, key: Vec<u8>) -> usize {
    if let Some(&id) = inner.key_map.get(&key) {
        return id;
    }
    let id = inner.keys.len();
    inner.keys.push(KeyState {
        busy: None,
        first_update: true,
        queued_puts: VecDeque::new(),
        queued_gets: VecDeque::new(),
    });
    inner.key_map.insert(key, id);
    id
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{HashGet, TableData};

    fn put_frame(shard: u32, key: &[u8], value: &[u8]) -> Vec<u8> {
        TableData {
            table: 1,
            shard,
            source: 0,
            key: key.to_vec(),
            value: value.to_vec(),
            missing: false,
        }
        .encode()
    }

    fn get_frame(shard: u32, key: &[u8]) -> Vec<u8> {
        HashGet {
            table: 1,
            shard,
            source: 0,
            key: key.to_vec(),
        }
        .encode()
    }

    fn fresh(synchronous: bool, servers: usize) -> RequestQueue {
        RequestQueue::new(
            synchronous,
            servers,
            Arc::new(AtomicBool::new(true)),
            Duration::from_micros(100),
        )
    }

    #[test]
    fn async_queue_is_fifo_per_server() {
        let queue = fresh(false, 2);
        for i in 0..4u32 {
            assert!(queue.enqueue(Tag::PutRequest, put_frame(0, &[i as u8], b"v")));
        }
        for i in 0..4u8 {
            let msg = queue.next_request().unwrap();
            assert_eq!(message::extract_key(&msg.data).unwrap(), vec![i]);
        }
    }

    #[test]
    fn async_queue_round_robins_servers() {
        let queue = fresh(false, 2);
        // shard 0 -> server 0, shard 1 -> server 1
        queue.enqueue(Tag::PutRequest, put_frame(0, b"a", b"v"));
        queue.enqueue(Tag::PutRequest, put_frame(0, b"b", b"v"));
        queue.enqueue(Tag::PutRequest, put_frame(1, b"c", b"v"));

        let first = queue.next_request().unwrap();
        let second = queue.next_request().unwrap();
        let keys = vec![
            message::extract_key(&first.data).unwrap(),
            message::extract_key(&second.data).unwrap(),
        ];
        // one from each server before server 0's second request
        assert!(keys.contains(&b"a".to_vec()));
        assert!(keys.contains(&b"c".to_vec()));
    }

    #[test]
    fn sync_queue_put_blocks_younger_get() {
        let queue = fresh(true, 1);
        queue.enqueue(Tag::PutRequest, put_frame(0, b"k", b"v1"));
        queue.enqueue(Tag::GetRequest, get_frame(0, b"k"));

        let first = queue.next_request().unwrap();
        assert_eq!(first.tag, Tag::PutRequest);

        // the get is inadmissible until the put completes
        if let RequestQueue::Sync(q) = &queue {
            let mut inner = q.inner.lock().unwrap();
            assert!(SyncQueue::take_admissible(&mut inner, 0, Class::Get).is_none());
        }
        queue.event_complete(b"k");
        let second = queue.next_request().unwrap();
        assert_eq!(second.tag, Tag::GetRequest);
    }

    #[test]
    fn sync_queue_unrelated_keys_do_not_interlock() {
        let queue = fresh(true, 1);
        queue.enqueue(Tag::PutRequest, put_frame(0, b"k1", b"v"));
        queue.enqueue(Tag::GetRequest, get_frame(0, b"k2"));

        // both are admissible; alternation serves them back to back
        let first = queue.next_request().unwrap();
        let second = queue.next_request().unwrap();
        let tags = vec![first.tag, second.tag];
        assert!(tags.contains(&Tag::PutRequest));
        assert!(tags.contains(&Tag::GetRequest));
    }

    #[test]
    fn sync_queue_first_update_bypasses_interlock() {
        let queue = fresh(true, 1);
        queue.enqueue(Tag::GetRequest, get_frame(0, b"k"));
        queue.enqueue(Tag::UpdateRequest, put_frame(0, b"k", b"v"));

        // the very first update for a key overtakes the older queued get
        let first = queue.next_request().unwrap();
        assert_eq!(first.tag, Tag::UpdateRequest);
        queue.event_complete(b"k");
        let second = queue.next_request().unwrap();
        assert_eq!(second.tag, Tag::GetRequest);
        queue.event_complete(b"k");

        // once a put-class request has drained the bypass is gone: a younger
        // update now waits for the older get
        queue.enqueue(Tag::GetRequest, get_frame(0, b"k"));
        queue.enqueue(Tag::UpdateRequest, put_frame(0, b"k", b"v2"));
        if let RequestQueue::Sync(q) = &queue {
            let mut inner = q.inner.lock().unwrap();
            assert!(SyncQueue::take_admissible(&mut inner, 0, Class::Put).is_none());
        }
        let third = queue.next_request().unwrap();
        assert_eq!(third.tag, Tag::GetRequest);
    }

    #[test]
    fn sync_local_hooks_track_queued_classes() {
        let queue = fresh(true, 1);
        assert!(queue.sync_local_get(b"k"));
        queue.enqueue(Tag::PutRequest, put_frame(0, b"k", b"v"));
        assert!(!queue.sync_local_get(b"k"));
        assert!(queue.sync_local_put(b"k"));

        let msg = queue.next_request().unwrap();
        assert_eq!(msg.tag, Tag::PutRequest);
        // still busy until completion
        assert!(!queue.sync_local_get(b"k"));
        queue.event_complete(b"k");
        assert!(queue.sync_local_get(b"k"));
    }

    #[test]
    fn shutdown_unblocks_next_request() {
        let running = Arc::new(AtomicBool::new(true));
        let queue = Arc::new(RequestQueue::new(
            false,
            1,
            running.clone(),
            Duration::from_micros(100),
        ));
        let consumer = {
            let queue = queue.clone();
            thread::spawn(move || queue.next_request())
        };
        running.store(false, Ordering::Relaxed);
        assert!(consumer.join().unwrap().is_none());
    }
}
