use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use anyhow::bail;
#[cfg(test)] use mockall::automock;
use rustc_hash::FxHashMap;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, span, warn, Instrument, Level};
use crate::acceptor::Acceptor;
use crate::condition::TransportCondition;
use crate::config::TransportConfig;
use crate::connection::{Connection, ConnectionId};
use crate::multiplexer::Multiplexer;
use crate::socket::UdtSocket;

/// Information about a received message beyond its payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageInfo {
    /// the peer that sent the message
    pub endpoint: SocketAddr,
}

/// The application's reply to a received message. `timeout` is the time to wait for the next
///  message on the same connection after sending the reply; [crate::config::IMMEDIATE_TIMEOUT]
///  closes the connection once the reply is sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub message: Vec<u8>,
    pub timeout: Duration,
}

impl Response {
    pub fn new(message: impl Into<Vec<u8>>, timeout: Duration) -> Response {
        Response {
            message: message.into(),
            timeout,
        }
    }
}

/// The owner of connections, notified of everything that happens on them.
///
/// All calls can come from arbitrary threads. `on_message_received` in particular is called
///  outside of the connection's task and may block.
#[cfg_attr(test, automock)]
pub trait Transport: Send + Sync + 'static {
    /// Returns the response to send back, if any. `None` (or an empty message) closes the
    ///  connection.
    fn on_message_received(&self, message: &[u8], info: &MessageInfo) -> Option<Response>;

    /// Called at most once per connection, right before the connection is removed
    fn on_error(&self, condition: TransportCondition);

    /// Called exactly once per connection, when it is closed
    fn remove_connection(&self, id: ConnectionId);
}

/// Application callbacks for a [UdtTransport]
#[cfg_attr(test, automock)]
pub trait MessageHandler: Send + Sync + 'static {
    fn on_message_received(&self, message: &[u8], info: &MessageInfo) -> Option<Response>;

    fn on_error(&self, condition: TransportCondition) {
        debug!("connection failed: {}", condition);
    }
}

struct Listener {
    acceptor: Arc<Acceptor>,
    accept_loop: JoinHandle<()>,
}

/// A transport on top of a [Multiplexer]: it sends messages to peers, optionally listens for
///  incoming connections, and keeps track of all connections that are in progress.
pub struct UdtTransport {
    config: Arc<TransportConfig>,
    multiplexer: Arc<dyn Multiplexer>,
    handler: Arc<dyn MessageHandler>,
    connections: Mutex<FxHashMap<ConnectionId, Arc<Connection>>>,
    listener: Mutex<Option<Listener>>,
    myself: Weak<UdtTransport>,
}

impl UdtTransport {
    pub fn new(config: TransportConfig, multiplexer: Arc<dyn Multiplexer>, handler: Arc<dyn MessageHandler>) -> anyhow::Result<Arc<UdtTransport>> {
        config.validate()?;

        Ok(Arc::new_cyclic(|myself| UdtTransport {
            config: Arc::new(config),
            multiplexer,
            handler,
            connections: Default::default(),
            listener: Default::default(),
            myself: myself.clone(),
        }))
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    fn connections(&self) -> MutexGuard<'_, FxHashMap<ConnectionId, Arc<Connection>>> {
        self.connections.lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn listener(&self) -> MutexGuard<'_, Option<Listener>> {
        self.listener.lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn num_connections(&self) -> usize {
        self.connections().len()
    }

    pub fn is_listening(&self) -> bool {
        self.listener().is_some()
    }

    /// Starts accepting incoming connections, each of which expects a request. Listening when
    ///  already listening is a no-op; it is an error if some other acceptor is registered with
    ///  the multiplexer.
    pub fn start_listening(&self) -> anyhow::Result<()> {
        let mut listener = self.listener();
        if listener.is_some() {
            debug!("already listening");
            return Ok(());
        }

        let acceptor = Acceptor::new(self.multiplexer.clone());
        acceptor.open();
        if !acceptor.is_open() {
            bail!("multiplexer has an acceptor already");
        }

        info!("start listening for connections");
        let accept_loop = tokio::spawn(
            Self::accept_loop(self.myself.clone(), acceptor.clone())
                .instrument(span!(Level::DEBUG, "accept_loop"))
        );

        *listener = Some(Listener { acceptor, accept_loop });
        Ok(())
    }

    /// Stops accepting connections and discards pending connection requests. Connections that
    ///  were accepted already are not affected.
    pub fn stop_listening(&self) {
        let Some(listener) = self.listener().take() else {
            return;
        };

        info!("stop listening for connections");
        listener.acceptor.close();
        listener.accept_loop.abort();
    }

    async fn accept_loop(transport: Weak<UdtTransport>, acceptor: Arc<Acceptor>) {
        loop {
            let socket = match transport.upgrade() {
                Some(transport) => transport.multiplexer.create_socket(None),
                None => break,
            };

            if let Err(e) = acceptor.accept(socket.clone()).await {
                debug!("accept loop terminating: {}", e);
                socket.close();
                break;
            }

            let Some(transport) = transport.upgrade() else {
                socket.close();
                break;
            };

            let Some(remote_endpoint) = socket.remote_endpoint() else {
                error!("accepted socket has no remote end point - skipping");
                socket.close();
                continue;
            };

            debug!("accepted connection from {:?}", remote_endpoint);
            transport.add_connection(socket, remote_endpoint)
                .start_receiving();
        }
    }

    /// Sends `message` to `endpoint` on a new connection. The connection then waits for a
    ///  response for up to `response_timeout`, unless that is
    ///  [crate::config::IMMEDIATE_TIMEOUT].
    ///
    /// This returns immediately; all outcomes are reported through the [MessageHandler].
    pub fn send(&self, endpoint: SocketAddr, message: &[u8], response_timeout: Duration) -> ConnectionId {
        let socket = self.multiplexer.create_socket(Some(endpoint));
        let connection = self.add_connection(socket, endpoint);
        connection.start_sending(message, response_timeout);
        connection.id()
    }

    /// Closes all connections in progress
    pub fn close_all(&self) {
        let connections = self.connections().values()
            .cloned()
            .collect::<Vec<_>>();

        debug!("closing {} connections", connections.len());
        for connection in connections {
            connection.close();
        }
    }

    fn add_connection(&self, socket: Arc<dyn UdtSocket>, remote_endpoint: SocketAddr) -> Arc<Connection> {
        let transport: Weak<dyn Transport> = self.myself.clone();
        let connection = Connection::new(transport, socket, remote_endpoint, self.config.clone());
        self.connections().insert(connection.id(), connection.clone());
        connection
    }
}

impl Transport for UdtTransport {
    fn on_message_received(&self, message: &[u8], info: &MessageInfo) -> Option<Response> {
        self.handler.on_message_received(message, info)
    }

    fn on_error(&self, condition: TransportCondition) {
        self.handler.on_error(condition)
    }

    fn remove_connection(&self, id: ConnectionId) {
        if self.connections().remove(&id).is_none() {
            warn!("removing connection {} that is not registered", id);
        }
    }
}

impl Drop for UdtTransport {
    fn drop(&mut self) {
        self.stop_listening();
    }
}
