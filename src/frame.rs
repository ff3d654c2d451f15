//! Messages are exchanged as frames: a length prefix (u32 BE) followed by exactly that many
//!  payload bytes.
//!
//! ```ascii
//! 0: payload length (u32 BE)
//! 4: payload
//! ```

use bytes::{Buf, BufMut, BytesMut};
use tracing::error;
use crate::condition::TransportCondition;

pub const FRAME_HEADER_LEN: usize = std::mem::size_of::<u32>();

/// Serializes `payload` into a new frame buffer. Payloads exceeding `max_message_size` are
///  rejected, and no frame is produced.
pub fn encode_frame(payload: &[u8], max_message_size: u32) -> Result<BytesMut, TransportCondition> {
    let len = match u32::try_from(payload.len()) {
        Ok(len) if len <= max_message_size => len,
        _ => {
            error!("message size {} bytes exceeds limit of {}", payload.len(), max_message_size);
            return Err(TransportCondition::MessageTooLarge);
        }
    };

    let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len());
    buf.put_u32(len);
    buf.put_slice(payload);
    Ok(buf)
}

pub fn decode_frame_len(mut header: &[u8]) -> anyhow::Result<u32> {
    if header.len() != FRAME_HEADER_LEN {
        anyhow::bail!("frame header must be {} bytes, was {}", FRAME_HEADER_LEN, header.len());
    }
    Ok(header.try_get_u32()?)
}
