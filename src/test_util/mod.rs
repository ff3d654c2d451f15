//! This module contains an in-memory stand-in for UDT sockets and multiplexers. It is used for
//!  testing the transport itself, but it is also exported for application testing.
//!
//! A [MemoryNetwork] connects [MemoryMultiplexer]s by address. Connecting a [MemorySocket]
//!  sends a real handshake datagram through the target multiplexer's [SocketDispatcher], so it
//!  is paired by whatever acceptor is registered there - and it waits forever if there is none,
//!  which is handy for testing connect timeouts. The data path is a [tokio::io::duplex] pipe
//!  whose capacity can be made small to force partial deliveries.

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use async_trait::async_trait;
use bytes::BytesMut;
use rustc_hash::FxHashMap;
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::select;
use tokio::sync::{oneshot, watch};
use tracing::trace;
use crate::acceptor::Acceptor;
use crate::handshake::HandshakePacket;
use crate::multiplexer::{Multiplexer, SocketDispatcher};
use crate::socket::{SocketId, UdtSocket};

pub const DEFAULT_PIPE_CAPACITY: usize = 64 * 1024;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct MemoryNetwork {
    pipe_capacity: usize,
    multiplexers: Mutex<FxHashMap<SocketAddr, Weak<MemoryMultiplexer>>>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<MemoryNetwork> {
        Self::with_pipe_capacity(DEFAULT_PIPE_CAPACITY)
    }

    pub fn with_pipe_capacity(pipe_capacity: usize) -> Arc<MemoryNetwork> {
        Arc::new(MemoryNetwork {
            pipe_capacity,
            multiplexers: Default::default(),
        })
    }

    /// Creates a multiplexer at `addr`, replacing whatever was bound there before
    pub fn bind(self: &Arc<Self>, addr: SocketAddr) -> Arc<MemoryMultiplexer> {
        let multiplexer = Arc::new_cyclic(|myself| MemoryMultiplexer {
            network: self.clone(),
            local_addr: addr,
            dispatcher: SocketDispatcher::new(),
            pending_pipes: Default::default(),
            myself: myself.clone(),
        });

        lock(&self.multiplexers).insert(addr, Arc::downgrade(&multiplexer));
        multiplexer
    }

    pub fn multiplexer(&self, addr: SocketAddr) -> Option<Arc<MemoryMultiplexer>> {
        lock(&self.multiplexers)
            .get(&addr)
            .and_then(Weak::upgrade)
    }

    /// Creates two sockets that are connected to each other without a handshake, for testing
    ///  one side of an exchange against raw reads and writes on the other.
    pub fn socket_pair(a: &Arc<MemoryMultiplexer>, b: &Arc<MemoryMultiplexer>) -> (Arc<MemorySocket>, Arc<MemorySocket>) {
        let (stream_a, stream_b) = duplex(a.network.pipe_capacity);

        let socket_a = MemorySocket::new(Arc::downgrade(a), a.local_addr, Some(b.local_addr));
        let socket_b = MemorySocket::new(Arc::downgrade(b), b.local_addr, Some(a.local_addr));

        let id_a = a.dispatcher.add_socket(socket_a.clone());
        let id_b = b.dispatcher.add_socket(socket_b.clone());

        for (socket, id, remote_id, stream) in [(&socket_a, id_a, id_b, stream_a), (&socket_b, id_b, id_a, stream_b)] {
            let mut state = socket.state();
            state.id = Some(id);
            state.remote_id = Some(remote_id);
            state.pipe = Some(Arc::new(Pipe::new(stream)));
        }

        (socket_a, socket_b)
    }
}

struct PendingPipe {
    stream: DuplexStream,
    on_connected: oneshot::Sender<()>,
}

pub struct MemoryMultiplexer {
    network: Arc<MemoryNetwork>,
    local_addr: SocketAddr,
    dispatcher: SocketDispatcher,
    /// the far ends of pipes offered by connecting sockets, by their address and socket id
    pending_pipes: Mutex<FxHashMap<(SocketAddr, SocketId), PendingPipe>>,
    myself: Weak<MemoryMultiplexer>,
}

impl MemoryMultiplexer {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn dispatcher(&self) -> &SocketDispatcher {
        &self.dispatcher
    }

    fn take_pending_pipe(&self, remote_endpoint: SocketAddr, remote_id: SocketId) -> Option<PendingPipe> {
        lock(&self.pending_pipes).remove(&(remote_endpoint, remote_id))
    }
}

impl Multiplexer for MemoryMultiplexer {
    fn acceptor(&self) -> Option<Arc<Acceptor>> {
        self.dispatcher.acceptor()
    }

    fn set_acceptor(&self, acceptor: Option<&Arc<Acceptor>>) {
        self.dispatcher.set_acceptor(acceptor)
    }

    fn add_socket(&self, socket: Arc<dyn UdtSocket>) -> SocketId {
        self.dispatcher.add_socket(socket)
    }

    fn remove_socket(&self, id: SocketId) {
        self.dispatcher.remove_socket(id)
    }

    fn create_socket(&self, remote_endpoint: Option<SocketAddr>) -> Arc<dyn UdtSocket> {
        MemorySocket::new(self.myself.clone(), self.local_addr, remote_endpoint)
    }
}

struct Pipe {
    reader: tokio::sync::Mutex<ReadHalf<DuplexStream>>,
    writer: tokio::sync::Mutex<WriteHalf<DuplexStream>>,
}

impl Pipe {
    fn new(stream: DuplexStream) -> Pipe {
        let (reader, writer) = tokio::io::split(stream);
        Pipe {
            reader: tokio::sync::Mutex::new(reader),
            writer: tokio::sync::Mutex::new(writer),
        }
    }
}

#[derive(Default)]
struct SocketState {
    id: Option<SocketId>,
    remote_id: Option<SocketId>,
    remote_endpoint: Option<SocketAddr>,
    pipe: Option<Arc<Pipe>>,
    /// the multiplexer holding our offered pipe while a connect is in progress
    connecting_to: Option<Weak<MemoryMultiplexer>>,
}

pub struct MemorySocket {
    multiplexer: Weak<MemoryMultiplexer>,
    local_addr: SocketAddr,
    state: Mutex<SocketState>,
    closed: watch::Sender<bool>,
    myself: Weak<MemorySocket>,
}

impl MemorySocket {
    fn new(multiplexer: Weak<MemoryMultiplexer>, local_addr: SocketAddr, remote_endpoint: Option<SocketAddr>) -> Arc<MemorySocket> {
        Arc::new_cyclic(|myself| MemorySocket {
            multiplexer,
            local_addr,
            state: Mutex::new(SocketState {
                remote_endpoint,
                ..Default::default()
            }),
            closed: watch::channel(false).0,
            myself: myself.clone(),
        })
    }

    fn state(&self) -> MutexGuard<'_, SocketState> {
        lock(&self.state)
    }

    fn pipe(&self) -> io::Result<Arc<Pipe>> {
        self.state().pipe.clone()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "socket is not connected"))
    }

    fn closed_error() -> io::Error {
        io::Error::new(io::ErrorKind::ConnectionAborted, "socket was closed")
    }

    /// Runs `op` until it completes or the socket is closed
    async fn unless_closed<T>(&self, op: impl std::future::Future<Output = io::Result<T>>) -> io::Result<T> {
        if !self.is_open() {
            return Err(Self::closed_error());
        }

        let mut closed = self.closed.subscribe();
        select! {
            _ = closed.wait_for(|closed| *closed) => Err(Self::closed_error()),
            result = op => result,
        }
    }

    async fn do_connect(&self) -> io::Result<()> {
        let remote_endpoint = self.remote_endpoint()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no remote end point"))?;
        let multiplexer = self.multiplexer.upgrade()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "multiplexer is gone"))?;
        let target = multiplexer.network.multiplexer(remote_endpoint)
            .ok_or_else(|| io::Error::new(io::ErrorKind::ConnectionRefused, format!("nothing bound at {:?}", remote_endpoint)))?;
        let myself = self.myself.upgrade()
            .ok_or_else(Self::closed_error)?;

        let id = multiplexer.add_socket(myself);
        self.set_id(id);

        let (local, remote) = duplex(multiplexer.network.pipe_capacity);
        let (on_connected, connected) = oneshot::channel();
        lock(&target.pending_pipes).insert((self.local_addr, id), PendingPipe { stream: remote, on_connected });
        self.state().connecting_to = Some(Arc::downgrade(&target));

        let mut handshake = BytesMut::with_capacity(HandshakePacket::SERIALIZED_LEN);
        HandshakePacket::new_request(id, remote_endpoint, rand::random())
            .ser(&mut handshake);
        trace!("sending handshake from socket {} to {:?}", id, remote_endpoint);
        target.dispatcher.dispatch_handshake(&handshake, self.local_addr);

        connected.await
            .map_err(|_| io::Error::new(io::ErrorKind::ConnectionRefused, "connection request was discarded"))?;

        let mut state = self.state();
        state.pipe = Some(Arc::new(Pipe::new(local)));
        state.connecting_to = None;
        Ok(())
    }
}

#[async_trait]
impl UdtSocket for MemorySocket {
    fn id(&self) -> Option<SocketId> {
        self.state().id
    }

    fn set_id(&self, id: SocketId) {
        self.state().id = Some(id);
    }

    fn remote_id(&self) -> Option<SocketId> {
        self.state().remote_id
    }

    fn remote_endpoint(&self) -> Option<SocketAddr> {
        self.state().remote_endpoint
    }

    fn set_remote(&self, remote_id: SocketId, remote_endpoint: SocketAddr) {
        let pending = self.multiplexer.upgrade()
            .and_then(|m| m.take_pending_pipe(remote_endpoint, remote_id));

        let mut state = self.state();
        state.remote_id = Some(remote_id);
        state.remote_endpoint = Some(remote_endpoint);

        // handshakes injected by tests have no pipe behind them
        if let Some(pending) = pending {
            state.pipe = Some(Arc::new(Pipe::new(pending.stream)));
            let _ = pending.on_connected.send(());
        }
    }

    fn is_open(&self) -> bool {
        !*self.closed.borrow()
    }

    fn close(&self) {
        if self.closed.send_replace(true) {
            return;
        }

        let (id, connecting_to) = {
            let mut state = self.state();
            // dropping our end of the pipe is what the peer sees as EOF
            state.pipe = None;
            (state.id, state.connecting_to.take())
        };
        trace!("closed socket {:?}", id);

        let Some(id) = id else {
            return;
        };
        if let Some(target) = connecting_to.and_then(|t| t.upgrade()) {
            target.take_pending_pipe(self.local_addr, id);
        }
        if let Some(multiplexer) = self.multiplexer.upgrade() {
            multiplexer.remove_socket(id);
        }
    }

    async fn connect(&self) -> io::Result<()> {
        if self.state().pipe.is_some() {
            return Ok(());
        }
        self.unless_closed(self.do_connect()).await
    }

    async fn read(&self, buf: &mut [u8], min_bytes: usize) -> io::Result<usize> {
        let pipe = self.pipe()?;

        self.unless_closed(async {
            let mut reader = pipe.reader.lock().await;
            let mut num_read = 0;
            while num_read < min_bytes.min(buf.len()) {
                match reader.read(&mut buf[num_read..]).await? {
                    0 => return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "peer closed the connection")),
                    n => num_read += n,
                }
            }
            Ok(num_read)
        }).await
    }

    async fn write(&self, buf: &[u8]) -> io::Result<()> {
        let pipe = self.pipe()?;

        self.unless_closed(async {
            let mut writer = pipe.writer.lock().await;
            writer.write_all(buf).await?;
            writer.flush().await
        }).await
    }
}
