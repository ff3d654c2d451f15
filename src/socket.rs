use std::fmt::{Display, Formatter};
use std::net::SocketAddr;
use async_trait::async_trait;

/// Identifies a socket within its multiplexer. Datagrams carry the receiver's socket id so the
///  multiplexer can route them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId(pub u32);

impl Display for SocketId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A single reliable-datagram connection end point. Congestion control, retransmission and
///  sequencing live behind this trait.
///
/// Closing a socket is the only way of cancelling operations on it: every outstanding
///  operation completes with an error once the socket is closed, and callers distinguish
///  timeouts from other failures by checking [UdtSocket::is_open] first.
#[async_trait]
pub trait UdtSocket: Send + Sync + 'static {
    /// The id under which this socket is registered with its multiplexer, if it is
    fn id(&self) -> Option<SocketId>;
    fn set_id(&self, id: SocketId);

    fn remote_id(&self) -> Option<SocketId>;
    fn remote_endpoint(&self) -> Option<SocketAddr>;

    /// Binds this socket to a peer that initiated a connection. This is called by the acceptor
    ///  when it pairs a handshake with this socket.
    fn set_remote(&self, remote_id: SocketId, remote_endpoint: SocketAddr);

    fn is_open(&self) -> bool;
    /// Idempotent
    fn close(&self);

    async fn connect(&self) -> std::io::Result<()>;

    /// Reads into `buf` until at least `min_bytes` are available, returning the number of
    ///  bytes read. This may be less than `buf.len()`.
    async fn read(&self, buf: &mut [u8], min_bytes: usize) -> std::io::Result<usize>;

    /// Writes all of `buf`
    async fn write(&self, buf: &[u8]) -> std::io::Result<()>;
}
