//! An in-process fabric: every rank is a thread in the same process and the
//! wires are unbounded channels. This is what the integration tests run on.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam::channel::{self, Receiver, Sender};

use crate::error::{Result, ShardError};
use crate::fabric::{Fabric, Frame};
use crate::message::Tag;

/// Builder for a full mesh of [`LocalFabric`] endpoints.
pub struct LocalMesh;

impl LocalMesh {
    /// creates one connected endpoint per rank; endpoint `i` has rank `i`
    pub fn new(world_size: usize) -> Vec<LocalFabric> {
        let mut inboxes = Vec::with_capacity(world_size);
        let mut senders = Vec::with_capacity(world_size);
        for _ in 0..world_size {
            let (tx, rx) = channel::unbounded::<Frame>();
            senders.push(tx);
            inboxes.push(rx);
        }

        inboxes
            .into_iter()
            .enumerate()
            .map(|(rank, inbox)| LocalFabric {
                rank,
                peers: senders.clone(),
                inbox,
                running: Arc::new(AtomicBool::new(true)),
            })
            .collect()
    }
}

/// One rank's endpoint on the in-process mesh.
pub struct LocalFabric {
    rank: usize,
    peers: Vec<Sender<Frame>>,
    inbox: Receiver<Frame>,
    running: Arc<AtomicBool>,
}

impl Fabric for LocalFabric {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.peers.len()
    }

    fn send(&self, dst: usize, tag: Tag, payload: &[u8]) -> Result<()> {
        if !self.running.load(Ordering::Relaxed) {
            return Err(ShardError::Shutdown);
        }
        let sender = self.peers.get(dst).ok_or_else(|| {
            ShardError::TransportFatal(format!("rank {} outside world of {}", dst, self.peers.len()))
        })?;
        sender
            .send(Frame {
                src: self.rank,
                tag,
                payload: payload.to_vec(),
            })
            .map_err(|_| ShardError::TransportFatal(format!("rank {} is gone", dst)))
    }

    fn try_recv(&self) -> Option<Frame> {
        self.inbox.try_recv().ok()
    }

    fn shutdown(&self) {
        self.running.store(false, Ordering::Relaxed);
    }
}
