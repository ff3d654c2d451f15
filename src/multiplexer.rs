use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use rustc_hash::FxHashMap;
use tracing::{debug, trace};
use crate::acceptor::Acceptor;
use crate::socket::{SocketId, UdtSocket};

/// A multiplexer owns a single datagram end point that is shared by many sockets. It routes
///  incoming datagrams to sockets by their socket id, and forwards handshakes that belong to no
///  known socket to its acceptor (if there is one).
pub trait Multiplexer: Send + Sync + 'static {
    fn acceptor(&self) -> Option<Arc<Acceptor>>;
    fn set_acceptor(&self, acceptor: Option<&Arc<Acceptor>>);

    /// Registers a socket for receiving datagrams, returning the id it was registered under
    fn add_socket(&self, socket: Arc<dyn UdtSocket>) -> SocketId;
    fn remove_socket(&self, id: SocketId);

    /// Creates a new socket that uses this multiplexer's end point. Client sockets are created
    ///  for a specific remote end point, while sockets for accepting connections get their peer
    ///  assigned by the acceptor.
    fn create_socket(&self, remote_endpoint: Option<SocketAddr>) -> Arc<dyn UdtSocket>;
}

/// The dispatch table of a multiplexer: the sockets registered with it by id, and its acceptor.
///
/// The acceptor is held weakly - an acceptor that is dropped is implicitly unregistered.
pub struct SocketDispatcher {
    inner: Mutex<DispatcherInner>,
}

struct DispatcherInner {
    sockets: FxHashMap<SocketId, Arc<dyn UdtSocket>>,
    next_socket_id: u32,
    acceptor: Weak<Acceptor>,
}

impl Default for SocketDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl SocketDispatcher {
    pub fn new() -> SocketDispatcher {
        Self::with_initial_socket_id(rand::random())
    }

    pub fn with_initial_socket_id(initial: u32) -> SocketDispatcher {
        SocketDispatcher {
            inner: Mutex::new(DispatcherInner {
                sockets: FxHashMap::default(),
                next_socket_id: initial,
                acceptor: Weak::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, DispatcherInner> {
        self.inner.lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn acceptor(&self) -> Option<Arc<Acceptor>> {
        self.lock().acceptor.upgrade()
    }

    pub fn set_acceptor(&self, acceptor: Option<&Arc<Acceptor>>) {
        self.lock().acceptor = acceptor
            .map(Arc::downgrade)
            .unwrap_or_default();
    }

    pub fn add_socket(&self, socket: Arc<dyn UdtSocket>) -> SocketId {
        let mut inner = self.lock();

        // 0 is reserved for 'no socket' in handshakes
        let id = loop {
            let candidate = SocketId(inner.next_socket_id);
            inner.next_socket_id = inner.next_socket_id.wrapping_add(1);
            if candidate.0 != 0 && !inner.sockets.contains_key(&candidate) {
                break candidate;
            }
        };

        trace!("registering socket {}", id);
        inner.sockets.insert(id, socket);
        id
    }

    pub fn remove_socket(&self, id: SocketId) {
        if self.lock().sockets.remove(&id).is_some() {
            trace!("unregistered socket {}", id);
        }
    }

    pub fn socket(&self, id: SocketId) -> Option<Arc<dyn UdtSocket>> {
        self.lock().sockets.get(&id).cloned()
    }

    pub fn num_sockets(&self) -> usize {
        self.lock().sockets.len()
    }

    /// Passes a handshake datagram that could not be routed to an existing socket on to the
    ///  acceptor. Without an acceptor, the datagram is dropped.
    pub fn dispatch_handshake(&self, datagram: &[u8], from: SocketAddr) {
        // NB: the lock must be released before calling the acceptor, which calls back into the
        //  dispatcher to register the accepted socket
        let acceptor = self.acceptor();

        match acceptor {
            Some(acceptor) => acceptor.handle_receive_from(datagram, from),
            None => debug!("no acceptor - dropping handshake from {:?}", from),
        }
    }
}
