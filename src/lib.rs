//! Message transport over UDT sockets: every message travels on its own short-lived connection.
//!
//! * An [acceptor::Acceptor] pairs incoming connection handshakes with accept operations
//! * A [connection::Connection] carries one request (and optionally a conversation of
//!   responses) as length-prefixed frames, supervising each step with stall and response
//!   timeouts
//! * [transport::UdtTransport] ties this together on top of a [multiplexer::Multiplexer]
//!
//! The UDT socket and multiplexer implementations themselves are collaborators behind the
//!  [socket::UdtSocket] and [multiplexer::Multiplexer] traits; [test_util] has in-memory
//!  implementations of both.

pub mod acceptor;
pub mod condition;
pub mod config;
pub mod connection;
pub mod frame;
pub mod handshake;
pub mod multiplexer;
pub mod socket;
pub mod test_util;
pub mod transport;
pub mod watchdog;
