use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use anyhow::{anyhow, bail};
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};
use crate::condition::TransportCondition;
use crate::handshake::HandshakePacket;
use crate::multiplexer::Multiplexer;
use crate::socket::{SocketId, UdtSocket};

/// A connection request that arrived while no accept operation was waiting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PendingRequest {
    remote_socket_id: SocketId,
    remote_endpoint: SocketAddr,
}

struct WaitingAccept {
    socket: Arc<dyn UdtSocket>,
    on_accepted: oneshot::Sender<()>,
}

#[derive(Default)]
struct AcceptorState {
    pending_requests: VecDeque<PendingRequest>,
    waiting: Option<WaitingAccept>,
}

/// The acceptor pairs incoming handshakes with accept operations. Both arrive asynchronously
///  and independently of each other, so whichever comes first is parked: handshakes in a FIFO
///  queue, accept operations in a single slot (there can be only one accept operation in
///  progress at any given time).
///
/// An acceptor is 'open' while it is registered with its multiplexer. A multiplexer has at most
///  one acceptor.
pub struct Acceptor {
    multiplexer: Arc<dyn Multiplexer>,
    state: Mutex<AcceptorState>,
}

impl Acceptor {
    pub fn new(multiplexer: Arc<dyn Multiplexer>) -> Arc<Acceptor> {
        Arc::new(Acceptor {
            multiplexer,
            state: Default::default(),
        })
    }

    /// Registers this acceptor with its multiplexer. If the multiplexer has a different
    ///  acceptor already, this is a no-op and the acceptor remains closed.
    pub fn open(self: &Arc<Self>) {
        match self.multiplexer.acceptor() {
            None => self.multiplexer.set_acceptor(Some(self)),
            Some(other) if !Arc::ptr_eq(&other, self) => {
                debug!("multiplexer has a different acceptor - not opening");
            }
            Some(_) => {}
        }
    }

    pub fn is_open(self: &Arc<Self>) -> bool {
        self.multiplexer.acceptor()
            .map(|registered| Arc::ptr_eq(&registered, self))
            .unwrap_or(false)
    }

    /// Discards all pending connection requests, aborts a waiting accept operation and
    ///  unregisters from the multiplexer. Idempotent.
    pub fn close(self: &Arc<Self>) {
        {
            let mut state = self.lock();
            state.pending_requests.clear();
            // dropping the sender aborts the accept operation
            state.waiting = None;
        }

        if self.is_open() {
            self.multiplexer.set_acceptor(None);
        }
    }

    fn lock(&self) -> MutexGuard<'_, AcceptorState> {
        self.state.lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Starts accepting a connection with `socket`. If a connection request is pending, the
    ///  oldest one is assigned to the socket right away. Otherwise the socket waits for the
    ///  next handshake to arrive.
    ///
    /// The returned receiver completes when `socket` is connected to its peer. It fails if the
    ///  acceptor is closed before that happens.
    pub fn start_accept(&self, socket: Arc<dyn UdtSocket>) -> anyhow::Result<oneshot::Receiver<()>> {
        let (on_accepted, accepted) = oneshot::channel();

        let pending = {
            let mut state = self.lock();
            if state.waiting.is_some() {
                bail!("there can be only one accept operation at a time");
            }

            match state.pending_requests.pop_front() {
                Some(pending) => pending,
                None => {
                    trace!("no pending connection request - waiting for a handshake");
                    state.waiting = Some(WaitingAccept { socket, on_accepted });
                    return Ok(accepted);
                }
            }
        };

        self.assign(&socket, pending);
        let _ = on_accepted.send(());
        Ok(accepted)
    }

    /// Accepts the next connection with `socket`, see [Acceptor::start_accept]
    pub async fn accept(&self, socket: Arc<dyn UdtSocket>) -> anyhow::Result<()> {
        self.start_accept(socket)?
            .await
            .map_err(|_| anyhow!("accept aborted: acceptor was closed"))
    }

    /// Called by the multiplexer for every handshake datagram that does not belong to a known
    ///  socket
    pub fn handle_receive_from(&self, datagram: &[u8], from: SocketAddr) {
        let packet = match HandshakePacket::deser(&mut &datagram[..]) {
            Ok(packet) => packet,
            Err(e) => {
                // the peer will retry, so dropping is all there is to do
                warn!("acceptor ignoring packet from {:?} - {}: {}", from, TransportCondition::InvalidHandshake, e);
                return;
            }
        };

        let request = PendingRequest {
            remote_socket_id: packet.socket_id(),
            remote_endpoint: from,
        };

        let waiting = {
            let mut state = self.lock();
            match state.waiting.take() {
                Some(waiting) => waiting,
                None => {
                    debug!("queueing connection request from {:?} (socket {})", from, request.remote_socket_id);
                    state.pending_requests.push_back(request);
                    return;
                }
            }
        };

        self.assign(&waiting.socket, request);
        let _ = waiting.on_accepted.send(());
    }

    fn assign(&self, socket: &Arc<dyn UdtSocket>, request: PendingRequest) {
        debug!("accepting connection from {:?} (socket {})", request.remote_endpoint, request.remote_socket_id);

        socket.set_remote(request.remote_socket_id, request.remote_endpoint);
        let id = self.multiplexer.add_socket(socket.clone());
        socket.set_id(id);
    }

    #[cfg(test)]
    fn num_pending_requests(&self) -> usize {
        self.lock().pending_requests.len()
    }
}
