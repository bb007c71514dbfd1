//! The rank-addressed message-passing fabric underneath the transport.
//!
//! A fabric delivers `{src, tag, payload}` datagrams reliably and in order
//! per (sender, receiver, tag). The transport's network loop is the only
//! consumer of `try_recv`; sends may come from any thread.

use crate::error::Result;
use crate::message::Tag;

mod local;
mod tcp;

pub use self::local::{LocalFabric, LocalMesh};
pub use self::tcp::TcpFabric;

/// wildcard source rank accepted by the transport's read operations
pub const ANY_SOURCE: usize = usize::MAX;

/// One datagram as it comes off the fabric.
#[derive(Debug)]
pub struct Frame {
    /// rank of the sender
    pub src: usize,
    /// message class
    pub tag: Tag,
    /// opaque frame bytes
    pub payload: Vec<u8>,
}

/// A process's endpoint on the message-passing fabric.
pub trait Fabric: Send + Sync {
    /// this process's address
    fn rank(&self) -> usize;

    /// total number of ranks
    fn world_size(&self) -> usize;

    /// hands one datagram to the fabric for delivery to `dst`.
    /// Returns once the payload is on its way; delivery is reliable and
    /// in order per (src, dst, tag)
    ///
    /// # Errors
    /// returns [`crate::ShardError::TransportFatal`] when the peer is gone
    fn send(&self, dst: usize, tag: Tag, payload: &[u8]) -> Result<()>;

    /// takes the next inbound datagram if one is waiting
    fn try_recv(&self) -> Option<Frame>;

    /// tears down the endpoint; subsequent sends fail and receivers drain out
    fn shutdown(&self);
}
