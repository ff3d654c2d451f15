use std::time::Duration;
use anyhow::bail;

/// Response timeout that marks a message as 'send only': the connection is closed as soon as
///  the message is written, without waiting for a response.
pub const IMMEDIATE_TIMEOUT: Duration = Duration::ZERO;

#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Timeout for establishing a connection. This is also the time a server side connection
    ///  waits for the first request after it was accepted.
    pub initial_timeout: Duration,

    /// Maximum time without progress (connect, write, partial read) before a connection is
    ///  considered stalled and closed. This is independent of the overall response deadline:
    ///  a slow transfer survives as long as it keeps making progress, and the deadline
    ///  is not reached.
    pub stall_timeout: Duration,

    /// Lower bound for the time allowed to write a message
    pub min_send_timeout: Duration,
    /// Additional time allowed per byte of payload when writing a message, so that big
    ///  messages get proportionally more time
    pub send_timeout_per_byte: Duration,

    /// Upper limit for the payload of a single message. This applies to outgoing messages
    ///  (which are rejected locally) as well as to the declared length of incoming messages.
    pub max_message_size: u32,
    /// Maximum number of bytes requested from the socket in a single read
    pub max_chunk_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportConfig {
    pub fn new() -> TransportConfig {
        TransportConfig {
            initial_timeout: Duration::from_secs(10),
            stall_timeout: Duration::from_secs(3),
            min_send_timeout: Duration::from_millis(500),
            send_timeout_per_byte: Duration::from_micros(10),
            max_message_size: 64 * 1024 * 1024,
            max_chunk_size: 64 * 1024,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.stall_timeout.is_zero() {
            bail!("stall timeout must be positive");
        }
        if self.max_message_size == 0 {
            bail!("max message size must be positive");
        }
        if self.max_chunk_size == 0 {
            bail!("max chunk size must be positive");
        }
        Ok(())
    }

    /// The time allowed for writing a message with a payload of `body_len` bytes
    pub fn send_timeout(&self, body_len: usize) -> Duration {
        let body_len = u32::try_from(body_len).unwrap_or(u32::MAX);
        self.send_timeout_per_byte
            .saturating_mul(body_len)
            .max(self.min_send_timeout)
    }
}
