use std::fmt::{Display, Formatter};

/// The ways a single exchange on a connection can fail. All of these are terminal for the
///  connection they occur on: there is no retry at this level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportCondition {
    ConnectFailure,
    ConnectTimeout,
    SendFailure,
    SendTimeout,
    ReceiveFailure,
    ReceiveTimeout,
    /// A message exceeds the configured maximum size. This is detected locally before anything
    ///  is sent.
    MessageTooLarge,
    /// An inbound handshake could not be decoded. These are dropped by the acceptor since
    ///  there is no connection to report them on yet.
    InvalidHandshake,
}

impl TransportCondition {
    pub fn is_timeout(&self) -> bool {
        matches!(self,
            TransportCondition::ConnectTimeout | TransportCondition::SendTimeout | TransportCondition::ReceiveTimeout
        )
    }
}

impl Display for TransportCondition {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TransportCondition::ConnectFailure => "connect failed",
            TransportCondition::ConnectTimeout => "connect timed out",
            TransportCondition::SendFailure => "send failed",
            TransportCondition::SendTimeout => "send timed out",
            TransportCondition::ReceiveFailure => "receive failed",
            TransportCondition::ReceiveTimeout => "receive timed out",
            TransportCondition::MessageTooLarge => "message exceeds maximum size",
            TransportCondition::InvalidHandshake => "invalid handshake packet",
        };
        f.write_str(s)
    }
}

impl std::error::Error for TransportCondition {}
