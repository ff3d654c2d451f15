use std::fmt::{Display, Formatter};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use bytes::{Bytes, BytesMut};
use tokio::select;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, span, trace, warn, Instrument, Level};
use crate::condition::TransportCondition;
use crate::config::{TransportConfig, IMMEDIATE_TIMEOUT};
use crate::frame::{decode_frame_len, encode_frame, FRAME_HEADER_LEN};
use crate::socket::UdtSocket;
use crate::transport::{MessageInfo, Response, Transport};
use crate::watchdog::{deadline_after, Watchdog};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> ConnectionId {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        ConnectionId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl Display for ConnectionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A connection drives a single socket through one exchange of framed messages:
///
/// * client side ([Connection::start_sending]): connect, send a request, and (unless the
///   request is 'send only') receive and dispatch the response
/// * server side ([Connection::start_receiving]): receive and dispatch a request, and send the
///   response the application provides (if any)
///
/// Every received message is dispatched to the owning [Transport]. If the application responds
///  with a response timeout other than [IMMEDIATE_TIMEOUT], the connection expects another
///  message, so a conversation can go back and forth on the same connection.
///
/// All work for a connection happens in a single task, one step at a time. Each step is
///  supervised by a [Watchdog], and the connection is closed when it expires. Every exchange
///  ends with exactly one close, notifying the transport to drop the connection - and failed
///  exchanges report exactly one [TransportCondition] before that.
pub struct Connection {
    id: ConnectionId,
    config: Arc<TransportConfig>,
    transport: Weak<dyn Transport>,
    socket: Arc<dyn UdtSocket>,
    remote_endpoint: SocketAddr,
    close_requested: watch::Sender<bool>,
    started: AtomicBool,
    closed: AtomicBool,
}

impl Connection {
    pub fn new(
        transport: Weak<dyn Transport>,
        socket: Arc<dyn UdtSocket>,
        remote_endpoint: SocketAddr,
        config: Arc<TransportConfig>,
    ) -> Arc<Connection> {
        let (close_requested, _) = watch::channel(false);

        Arc::new(Connection {
            id: ConnectionId::next(),
            config,
            transport,
            socket,
            remote_endpoint,
            close_requested,
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn remote_endpoint(&self) -> SocketAddr {
        self.remote_endpoint
    }

    pub fn socket(&self) -> &Arc<dyn UdtSocket> {
        &self.socket
    }

    /// Server side: waits for a request on an accepted socket
    pub fn start_receiving(self: &Arc<Self>) {
        let Some(exchange) = self.start_exchange(self.config.initial_timeout) else {
            return;
        };
        self.spawn(exchange.run_receiving());
    }

    /// Client side: connects, and sends `message`. A `response_timeout` of [IMMEDIATE_TIMEOUT]
    ///  means that no response is expected, and the connection is closed after sending;
    ///  otherwise the response is dispatched to the transport when it arrives, and it must arrive
    ///  within `response_timeout` after the request was sent.
    pub fn start_sending(self: &Arc<Self>, message: &[u8], response_timeout: Duration) {
        let Some(exchange) = self.start_exchange(response_timeout) else {
            return;
        };
        let message = Bytes::copy_from_slice(message);
        self.spawn(exchange.run_sending(message));
    }

    /// Requests the connection to be closed. This can be called from anywhere: the connection
    ///  closes from its own task, cancelling the step in progress.
    pub fn close(&self) {
        self.close_requested.send_replace(true);

        // not started yet, so there is no task that could do the closing
        if !self.started.swap(true, Ordering::AcqRel) {
            self.do_close();
        }
    }

    fn start_exchange(self: &Arc<Self>, timeout_for_response: Duration) -> Option<Exchange> {
        if self.started.swap(true, Ordering::AcqRel) {
            warn!("connection {} was started or closed before - ignoring", self.id);
            return None;
        }

        Some(Exchange {
            connection: self.clone(),
            socket: self.socket.clone(),
            supervisor: Supervisor {
                watchdog: Watchdog::new(),
                close_requested: self.close_requested.subscribe(),
            },
            buffer: BytesMut::new(),
            data_size: 0,
            data_received: 0,
            timeout_for_response,
            response_deadline: Instant::now(),
        })
    }

    fn spawn(&self, exchange: impl Future<Output = ()> + Send + 'static) {
        let span = span!(Level::DEBUG, "connection", id = %self.id, remote = ?self.remote_endpoint);
        tokio::spawn(exchange.instrument(span));
    }

    fn do_close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        debug!("closing connection {}", self.id);
        self.socket.close();
        if let Some(transport) = self.transport.upgrade() {
            transport.remove_connection(self.id);
        }
    }

    fn close_on_error(&self, condition: TransportCondition) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }

        debug!("closing connection {} on error: {}", self.id, condition);
        if let Some(transport) = self.transport.upgrade() {
            transport.on_error(condition);
        }
        self.do_close();
    }
}

/// Runs socket operations under supervision: an operation is abandoned and the socket closed
///  when the watchdog expires or the connection is asked to close, whichever comes first.
struct Supervisor {
    watchdog: Watchdog,
    close_requested: watch::Receiver<bool>,
}

impl Supervisor {
    async fn run<T>(&mut self, socket: &dyn UdtSocket, op: impl Future<Output = io::Result<T>>) -> io::Result<T> {
        let Supervisor { watchdog, close_requested } = self;

        select! {
            biased;
            _ = close_requested.wait_for(|requested| *requested) => {
                socket.close();
                Err(io::Error::new(io::ErrorKind::ConnectionAborted, "connection was closed"))
            }
            _ = watchdog.expired() => {
                debug!("timed out - closing socket");
                socket.close();
                Err(io::Error::new(io::ErrorKind::TimedOut, "timed out"))
            }
            result = op => result,
        }
    }
}

/// The state of a connection's exchange. This is owned by the connection's task, so no
///  synchronization is needed.
struct Exchange {
    connection: Arc<Connection>,
    socket: Arc<dyn UdtSocket>,
    supervisor: Supervisor,
    buffer: BytesMut,
    data_size: u32,
    data_received: usize,
    timeout_for_response: Duration,
    response_deadline: Instant,
}

impl Exchange {
    async fn run_receiving(mut self) {
        let outcome = self.receive_and_respond().await;
        self.finish(outcome);
    }

    async fn run_sending(mut self, message: Bytes) {
        let outcome = self.send_and_receive(message).await;
        self.finish(outcome);
    }

    fn finish(self, outcome: Result<(), TransportCondition>) {
        match outcome {
            Ok(()) => self.connection.do_close(),
            Err(condition) => self.connection.close_on_error(condition),
        }
    }

    async fn send_and_receive(&mut self, message: Bytes) -> Result<(), TransportCondition> {
        self.encode(&message)?;
        self.connect().await?;
        self.write().await?;

        if self.timeout_for_response == IMMEDIATE_TIMEOUT {
            return Ok(());
        }
        self.receive_and_respond().await
    }

    async fn receive_and_respond(&mut self) -> Result<(), TransportCondition> {
        loop {
            self.read_size().await?;
            self.read_data().await?;

            let Some(response) = self.dispatch().await else {
                return Ok(());
            };

            self.encode(&response.message)?;
            self.timeout_for_response = response.timeout;
            self.write().await?;

            if self.timeout_for_response == IMMEDIATE_TIMEOUT {
                return Ok(());
            }
        }
    }

    fn config(&self) -> &TransportConfig {
        &self.connection.config
    }

    /// Checks the outcome of a supervised socket operation. A closed socket means the watchdog
    ///  (or an explicit close) cut the operation short, regardless of what the operation itself
    ///  reported.
    fn check<T>(&self, result: io::Result<T>, on_timeout: TransportCondition, on_failure: TransportCondition) -> Result<T, TransportCondition> {
        if !self.socket.is_open() {
            return Err(on_timeout);
        }
        result.map_err(|e| {
            debug!("socket error: {}", e);
            on_failure
        })
    }

    fn encode(&mut self, message: &[u8]) -> Result<(), TransportCondition> {
        self.buffer = encode_frame(message, self.config().max_message_size)?;
        Ok(())
    }

    async fn connect(&mut self) -> Result<(), TransportCondition> {
        trace!("connecting");
        let initial_timeout = self.config().initial_timeout;
        self.supervisor.watchdog.expire_from_now(initial_timeout);

        let socket = self.socket.clone();
        let result = self.supervisor.run(socket.as_ref(), socket.connect()).await;
        self.check(result, TransportCondition::ConnectTimeout, TransportCondition::ConnectFailure)
    }

    async fn write(&mut self) -> Result<(), TransportCondition> {
        let send_timeout = self.config().send_timeout(self.buffer.len() - FRAME_HEADER_LEN);
        trace!("sending {} bytes, timeout {:?}", self.buffer.len(), send_timeout);
        self.supervisor.watchdog.expire_from_now(send_timeout);

        let socket = self.socket.clone();
        let result = self.supervisor.run(socket.as_ref(), socket.write(&self.buffer)).await;
        self.check(result, TransportCondition::SendTimeout, TransportCondition::SendFailure)
    }

    async fn read_size(&mut self) -> Result<(), TransportCondition> {
        self.buffer.clear();
        self.buffer.resize(FRAME_HEADER_LEN, 0);

        let now = Instant::now();
        self.response_deadline = deadline_after(now, self.timeout_for_response);
        let stall_timeout = self.config().stall_timeout;
        self.supervisor.watchdog.expire_at_stall_or_deadline(self.response_deadline, stall_timeout);

        let socket = self.socket.clone();
        let result = self.supervisor.run(socket.as_ref(), socket.read(&mut self.buffer[..], FRAME_HEADER_LEN)).await;
        self.check(result, TransportCondition::ReceiveTimeout, TransportCondition::ReceiveFailure)?;

        let data_size = decode_frame_len(&self.buffer)
            .map_err(|e| {
                warn!("invalid frame header: {}", e);
                TransportCondition::ReceiveFailure
            })?;
        if data_size > self.config().max_message_size {
            warn!("incoming message of {} bytes exceeds limit of {} - closing", data_size, self.config().max_message_size);
            return Err(TransportCondition::ReceiveFailure);
        }

        trace!("receiving message of {} bytes", data_size);
        self.data_size = data_size;
        self.data_received = 0;
        self.buffer.clear();
        Ok(())
    }

    async fn read_data(&mut self) -> Result<(), TransportCondition> {
        let data_size = self.data_size as usize;
        let stall_timeout = self.config().stall_timeout;
        let max_chunk_size = self.config().max_chunk_size;

        while self.data_received < data_size {
            let start = self.data_received;
            let end = start + max_chunk_size.min(data_size - start);
            self.buffer.resize(end, 0);

            self.supervisor.watchdog.expire_at_stall_or_deadline(self.response_deadline, stall_timeout);

            let socket = self.socket.clone();
            let result = self.supervisor.run(socket.as_ref(), socket.read(&mut self.buffer[start..end], 1)).await;
            let num_read = self.check(result, TransportCondition::ReceiveTimeout, TransportCondition::ReceiveFailure)?;

            if num_read == 0 {
                debug!("connection closed by peer after {} of {} bytes", start, data_size);
                return Err(TransportCondition::ReceiveFailure);
            }
            self.data_received += num_read;
        }

        // the application's message handling has unbounded cost that is none of our business
        self.supervisor.watchdog.disarm();
        Ok(())
    }

    /// Hands the received message to the transport (outside this connection's task), returning
    ///  the response - or `None` if there is nothing to send back
    async fn dispatch(&mut self) -> Option<Response> {
        let Some(transport) = self.connection.transport.upgrade() else {
            debug!("transport is gone - dropping message");
            return None;
        };

        let message = self.buffer.split().freeze();
        let info = MessageInfo {
            endpoint: self.connection.remote_endpoint,
        };

        match tokio::task::spawn_blocking(move || transport.on_message_received(&message, &info)).await {
            Ok(response) => response.filter(|r| !r.message.is_empty()),
            Err(e) => {
                error!("message handler failed: {}", e);
                None
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use mockall::predicate::eq;
    use rstest::rstest;
    use tokio::sync::mpsc;
    use tokio::time::sleep;
    use crate::multiplexer::Multiplexer;
    use crate::test_util::{MemoryMultiplexer, MemoryNetwork, MemorySocket};
    use crate::transport::MockTransport;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127,0,0,1], port))
    }

    fn frame(payload: &[u8]) -> Vec<u8> {
        let mut result = (payload.len() as u32).to_be_bytes().to_vec();
        result.extend_from_slice(payload);
        result
    }

    async fn read_frame(peer: &MemorySocket) -> Vec<u8> {
        let mut header = [0u8; 4];
        peer.read(&mut header, 4).await.unwrap();
        let len = u32::from_be_bytes(header) as usize;
        let mut payload = vec![0u8; len];
        peer.read(&mut payload, len).await.unwrap();
        payload
    }

    async fn assert_peer_sees_eof(peer: &MemorySocket) {
        let mut buf = [0u8; 1];
        assert!(peer.read(&mut buf, 1).await.is_err());
    }

    struct Fixture {
        _multiplexers: (Arc<MemoryMultiplexer>, Arc<MemoryMultiplexer>),
        local: Arc<MemorySocket>,
        peer: Arc<MemorySocket>,
    }

    fn fixture(pipe_capacity: usize) -> Fixture {
        let network = MemoryNetwork::with_pipe_capacity(pipe_capacity);
        let local_mux = network.bind(addr(1));
        let peer_mux = network.bind(addr(2));
        let (local, peer) = MemoryNetwork::socket_pair(&local_mux, &peer_mux);
        Fixture {
            _multiplexers: (local_mux, peer_mux),
            local,
            peer,
        }
    }

    /// a transport that answers with `on_message`, expects exactly the error `error` (if any),
    ///  and reports connection removal through the returned channel
    fn mock_transport(
        on_message: impl Fn(&[u8]) -> Option<Response> + Send + 'static,
        error: Option<TransportCondition>,
    ) -> (Arc<MockTransport>, mpsc::UnboundedReceiver<ConnectionId>) {
        let mut transport = MockTransport::new();
        transport.expect_on_message_received()
            .returning(move |message, _| on_message(message));
        match error {
            Some(condition) => transport.expect_on_error().with(eq(condition)).times(1).return_const(()),
            None => transport.expect_on_error().never(),
        };

        let (removed_send, removed) = mpsc::unbounded_channel();
        transport.expect_remove_connection()
            .times(1)
            .returning(move |id| { let _ = removed_send.send(id); });

        (Arc::new(transport), removed)
    }

    fn connection(transport: &Arc<MockTransport>, socket: &Arc<MemorySocket>, config: TransportConfig) -> Arc<Connection> {
        let weak: Weak<MockTransport> = Arc::downgrade(transport);
        Connection::new(weak, socket.clone(), addr(2), Arc::new(config))
    }

    #[tokio::test]
    async fn test_server_ping_pong_wire_bytes() {
        let f = fixture(1024);
        let (transport, mut removed) = mock_transport(
            |message| (message == b"ping").then(|| Response::new("pong", IMMEDIATE_TIMEOUT)),
            None,
        );

        let connection = connection(&transport, &f.local, TransportConfig::default());
        connection.start_receiving();

        f.peer.write(&[0,0,0,4, 0x70,0x69,0x6e,0x67]).await.unwrap();

        let mut response = [0u8; 8];
        f.peer.read(&mut response, 8).await.unwrap();
        assert_eq!(response, [0,0,0,4, 0x70,0x6f,0x6e,0x67]);

        assert_eq!(removed.recv().await, Some(connection.id()));
        assert_peer_sees_eof(&f.peer).await;
        assert!(!f.local.is_open());
    }

    #[tokio::test]
    async fn test_client_ping_pong() {
        let f = fixture(1024);
        let (received_send, mut received) = mpsc::unbounded_channel();
        let (transport, mut removed) = mock_transport(
            move |message| {
                let _ = received_send.send(message.to_vec());
                None
            },
            None,
        );

        let connection = connection(&transport, &f.local, TransportConfig::default());
        connection.start_sending(b"ping", Duration::from_secs(5));

        assert_eq!(read_frame(&f.peer).await, b"ping");
        f.peer.write(&frame(b"pong")).await.unwrap();

        assert_eq!(received.recv().await, Some(b"pong".to_vec()));
        assert_eq!(removed.recv().await, Some(connection.id()));
    }

    #[rstest]
    #[case::none(None)]
    #[case::empty(Some(Response::new(Vec::new(), Duration::from_secs(5))))]
    #[tokio::test]
    async fn test_no_response_closes_without_writing(#[case] response: Option<Response>) {
        let f = fixture(1024);
        let (transport, mut removed) = mock_transport(move |_| response.clone(), None);

        let connection = connection(&transport, &f.local, TransportConfig::default());
        connection.start_receiving();
        f.peer.write(&frame(b"ping")).await.unwrap();

        assert_eq!(removed.recv().await, Some(connection.id()));
        assert_peer_sees_eof(&f.peer).await;
    }

    #[tokio::test]
    async fn test_zero_length_message_is_dispatched() {
        let f = fixture(1024);
        let (received_send, mut received) = mpsc::unbounded_channel();
        let (transport, mut removed) = mock_transport(
            move |message| {
                let _ = received_send.send(message.to_vec());
                None
            },
            None,
        );

        let connection = connection(&transport, &f.local, TransportConfig::default());
        connection.start_receiving();
        f.peer.write(&[0,0,0,0]).await.unwrap();

        assert_eq!(received.recv().await, Some(Vec::new()));
        assert_eq!(removed.recv().await, Some(connection.id()));
    }

    #[tokio::test]
    async fn test_oversized_response_is_not_sent() {
        let f = fixture(1024);
        let (transport, mut removed) = mock_transport(
            |_| Some(Response::new(vec![1u8; 17], IMMEDIATE_TIMEOUT)),
            Some(TransportCondition::MessageTooLarge),
        );

        let mut config = TransportConfig::default();
        config.max_message_size = 16;
        let connection = connection(&transport, &f.local, config);
        connection.start_receiving();
        f.peer.write(&frame(b"ping")).await.unwrap();

        assert_eq!(removed.recv().await, Some(connection.id()));
        assert_peer_sees_eof(&f.peer).await;
    }

    #[tokio::test]
    async fn test_oversized_request_is_not_sent() {
        let f = fixture(1024);
        let (transport, mut removed) = mock_transport(|_| None, Some(TransportCondition::MessageTooLarge));

        let mut config = TransportConfig::default();
        config.max_message_size = 16;
        let connection = connection(&transport, &f.local, config);
        connection.start_sending(&[1u8; 17], Duration::from_secs(5));

        assert_eq!(removed.recv().await, Some(connection.id()));
        assert_peer_sees_eof(&f.peer).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_timeout() {
        let f = fixture(16);
        let (transport, mut removed) = mock_transport(|_| None, Some(TransportCondition::SendTimeout));

        // the peer never reads, so the write blocks once the pipe is full
        let start = Instant::now();
        let connection = connection(&transport, &f.local, TransportConfig::default());
        connection.start_sending(&[5u8; 1000], Duration::from_secs(5));

        assert_eq!(removed.recv().await, Some(connection.id()));
        assert!(start.elapsed() >= Duration::from_millis(500));
        assert!(start.elapsed() < Duration::from_millis(600));
        assert!(!f.local.is_open());
    }

    #[tokio::test]
    async fn test_send_failure() {
        let f = fixture(1024);
        let (transport, mut removed) = mock_transport(|_| None, Some(TransportCondition::SendFailure));

        f.peer.close();
        let connection = connection(&transport, &f.local, TransportConfig::default());
        connection.start_sending(b"ping", Duration::from_secs(5));

        assert_eq!(removed.recv().await, Some(connection.id()));
    }

    #[tokio::test]
    async fn test_oversized_incoming_frame_is_rejected() {
        let f = fixture(1024);
        let (transport, mut removed) = mock_transport(|_| None, Some(TransportCondition::ReceiveFailure));

        let mut config = TransportConfig::default();
        config.max_message_size = 16;
        let connection = connection(&transport, &f.local, config);
        connection.start_receiving();
        f.peer.write(&[0,0,0,17]).await.unwrap();

        assert_eq!(removed.recv().await, Some(connection.id()));
    }

    #[tokio::test]
    async fn test_peer_closing_mid_message() {
        let f = fixture(1024);
        let (transport, mut removed) = mock_transport(|_| None, Some(TransportCondition::ReceiveFailure));

        let connection = connection(&transport, &f.local, TransportConfig::default());
        connection.start_receiving();
        f.peer.write(&[0,0,0,10, 1,2,3]).await.unwrap();
        f.peer.close();

        assert_eq!(removed.recv().await, Some(connection.id()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stall_timeout() {
        let f = fixture(1024);
        let (transport, mut removed) = mock_transport(|_| None, Some(TransportCondition::ReceiveTimeout));

        let start = Instant::now();
        let connection = connection(&transport, &f.local, TransportConfig::default());
        connection.start_receiving();
        f.peer.write(&[0,0,0,10, 1,2]).await.unwrap();

        assert_eq!(removed.recv().await, Some(connection.id()));
        assert!(start.elapsed() >= Duration::from_secs(3));
        assert!(start.elapsed() < Duration::from_secs(4));
        assert!(!f.local.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_response_deadline_cuts_off_progress() {
        let f = fixture(1024);
        let (transport, mut removed) = mock_transport(|_| None, Some(TransportCondition::ReceiveTimeout));

        let connection = connection(&transport, &f.local, TransportConfig::default());
        connection.start_sending(b"ping", Duration::from_secs(4));
        assert_eq!(read_frame(&f.peer).await, b"ping");
        let start = Instant::now();

        // progress every two seconds is well within the stall timeout
        let peer = f.peer.clone();
        tokio::spawn(async move {
            if peer.write(&[0,0,0,100]).await.is_err() {
                return;
            }
            loop {
                sleep(Duration::from_secs(2)).await;
                if peer.write(b"x").await.is_err() {
                    return;
                }
            }
        });

        assert_eq!(removed.recv().await, Some(connection.id()));
        assert!(start.elapsed() >= Duration::from_secs(4));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_progress_survives() {
        let f = fixture(1024);
        let (received_send, mut received) = mpsc::unbounded_channel();
        let (transport, mut removed) = mock_transport(
            move |message| {
                let _ = received_send.send(message.to_vec());
                None
            },
            None,
        );

        let connection = connection(&transport, &f.local, TransportConfig::default());
        connection.start_receiving();

        // 8 seconds in total: more than the stall timeout, less than the initial timeout
        f.peer.write(&[0,0,0,4]).await.unwrap();
        for b in b"slow" {
            sleep(Duration::from_secs(2)).await;
            f.peer.write(&[*b]).await.unwrap();
        }

        assert_eq!(received.recv().await, Some(b"slow".to_vec()));
        assert_eq!(removed.recv().await, Some(connection.id()));
    }

    #[tokio::test]
    async fn test_partial_deliveries() {
        let f = fixture(3);
        let (received_send, mut received) = mpsc::unbounded_channel();
        let (transport, mut removed) = mock_transport(
            move |message| {
                let _ = received_send.send(message.to_vec());
                None
            },
            None,
        );

        let mut config = TransportConfig::default();
        config.max_chunk_size = 64;
        let connection = connection(&transport, &f.local, config);

        let request = (0..1000).map(|i| i as u8).collect::<Vec<_>>();
        connection.start_sending(&request, Duration::from_secs(5));
        assert_eq!(read_frame(&f.peer).await, request);

        let response = (0..1000).map(|i| (i % 7) as u8).collect::<Vec<_>>();
        f.peer.write(&frame(&response)).await.unwrap();

        assert_eq!(received.recv().await, Some(response));
        assert_eq!(removed.recv().await, Some(connection.id()));
    }

    #[tokio::test]
    async fn test_send_only_closes_after_sending() {
        let f = fixture(1024);
        let (transport, mut removed) = mock_transport(|_| panic!("no response expected"), None);

        let connection = connection(&transport, &f.local, TransportConfig::default());
        connection.start_sending(b"ping", IMMEDIATE_TIMEOUT);

        assert_eq!(read_frame(&f.peer).await, b"ping");
        assert_eq!(removed.recv().await, Some(connection.id()));
        assert_peer_sees_eof(&f.peer).await;
    }

    #[tokio::test]
    async fn test_conversation() {
        let f = fixture(1024);
        let (transport, mut removed) = mock_transport(
            |message| match message {
                b"1" => Some(Response::new("a", Duration::from_secs(5))),
                b"2" => Some(Response::new("b", IMMEDIATE_TIMEOUT)),
                _ => None,
            },
            None,
        );

        let connection = connection(&transport, &f.local, TransportConfig::default());
        connection.start_receiving();

        f.peer.write(&frame(b"1")).await.unwrap();
        assert_eq!(read_frame(&f.peer).await, b"a");
        f.peer.write(&frame(b"2")).await.unwrap();
        assert_eq!(read_frame(&f.peer).await, b"b");

        assert_eq!(removed.recv().await, Some(connection.id()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout() {
        let network = MemoryNetwork::new();
        let client_mux = network.bind(addr(1));
        let _server_mux = network.bind(addr(2));
        let socket = client_mux.create_socket(Some(addr(2)));

        let (transport, mut removed) = mock_transport(|_| None, Some(TransportCondition::ConnectTimeout));
        let weak: Weak<MockTransport> = Arc::downgrade(&transport);
        let connection = Connection::new(weak, socket, addr(2), Arc::new(TransportConfig::default()));

        let start = Instant::now();
        connection.start_sending(b"ping", Duration::from_secs(5));

        assert_eq!(removed.recv().await, Some(connection.id()));
        assert!(start.elapsed() >= Duration::from_secs(10));
        assert!(start.elapsed() < Duration::from_secs(11));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let network = MemoryNetwork::new();
        let client_mux = network.bind(addr(1));
        let socket = client_mux.create_socket(Some(addr(2)));

        let (transport, mut removed) = mock_transport(|_| None, Some(TransportCondition::ConnectFailure));
        let weak: Weak<MockTransport> = Arc::downgrade(&transport);
        let connection = Connection::new(weak, socket, addr(2), Arc::new(TransportConfig::default()));
        connection.start_sending(b"ping", Duration::from_secs(5));

        assert_eq!(removed.recv().await, Some(connection.id()));
    }

    #[test]
    fn test_close_before_start() {
        let f = fixture(1024);
        let (transport, mut removed) = mock_transport(|_| None, None);

        let connection = connection(&transport, &f.local, TransportConfig::default());
        connection.close();
        connection.close();

        assert_eq!(removed.try_recv().ok(), Some(connection.id()));
        assert!(!f.local.is_open());

        // no effect after closing
        connection.start_receiving();
        assert!(removed.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_close_while_receiving() {
        let f = fixture(1024);
        let (transport, mut removed) = mock_transport(|_| None, Some(TransportCondition::ReceiveTimeout));

        let connection = connection(&transport, &f.local, TransportConfig::default());
        connection.start_receiving();
        f.peer.write(&[0,0]).await.unwrap();
        sleep(Duration::from_millis(10)).await;

        connection.close();
        connection.close();

        assert_eq!(removed.recv().await, Some(connection.id()));
        assert_peer_sees_eof(&f.peer).await;
    }
}
