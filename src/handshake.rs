//! Handshake packets are the first datagram of a new connection. They are UDT control packets
//!  with a fixed size of 64 bytes; all numbers in network byte order (BE):
//!
//! ```ascii
//!  0: flags + control type (u16): 0x8000 - control bit set, type 0 'handshake'
//!  2: reserved (u16)
//!  4: additional info (u32)
//!  8: timestamp (u32)
//! 12: destination socket id (u32) - 0 for a connection request
//! 16: UDT version (u32) - always 4
//! 20: socket type (u32): 1 stream, 2 datagram
//! 24: initial packet sequence number (u32)
//! 28: maximum packet size (u32)
//! 32: maximum flow window size (u32)
//! 36: connection type (i32): 1 regular, 0 rendezvous, -1 / -2 responses
//! 40: socket id of the sender (u32)
//! 44: SYN cookie (u32)
//! 48: peer IP address (16 bytes; IP V4 in the first four bytes)
//! ```

use std::net::{IpAddr, SocketAddr};
use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use crate::socket::SocketId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u32)]
pub enum SocketType {
    Stream = 1,
    Datagram = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(i32)]
pub enum ConnectionType {
    Regular = 1,
    Rendezvous = 0,
    Response = -1,
    SecondResponse = -2,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakePacket {
    pub timestamp: u32,
    pub destination_socket_id: SocketId,
    pub socket_type: SocketType,
    pub initial_packet_sequence_number: u32,
    pub maximum_packet_size: u32,
    pub maximum_flow_window_size: u32,
    pub connection_type: ConnectionType,
    pub socket_id: SocketId,
    pub syn_cookie: u32,
    pub ip_address: [u8; 16],
}

impl HandshakePacket {
    pub const SERIALIZED_LEN: usize = 64;
    pub const UDT_VERSION: u32 = 4;

    const CONTROL_HANDSHAKE: u16 = 0x8000;

    /// A connection request from `socket_id`, as sent by a connecting socket
    pub fn new_request(socket_id: SocketId, peer: SocketAddr, initial_packet_sequence_number: u32) -> HandshakePacket {
        let mut ip_address = [0u8; 16];
        match peer.ip() {
            IpAddr::V4(ip) => ip_address[..4].copy_from_slice(&ip.octets()),
            IpAddr::V6(ip) => ip_address.copy_from_slice(&ip.octets()),
        }

        HandshakePacket {
            timestamp: 0,
            destination_socket_id: SocketId(0),
            socket_type: SocketType::Stream,
            initial_packet_sequence_number,
            maximum_packet_size: 1500,
            maximum_flow_window_size: 25600,
            connection_type: ConnectionType::Regular,
            socket_id,
            syn_cookie: 0,
            ip_address,
        }
    }

    pub fn socket_id(&self) -> SocketId {
        self.socket_id
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u16(Self::CONTROL_HANDSHAKE);
        buf.put_u16(0);
        buf.put_u32(0);
        buf.put_u32(self.timestamp);
        buf.put_u32(self.destination_socket_id.0);
        buf.put_u32(Self::UDT_VERSION);
        buf.put_u32(self.socket_type.into());
        buf.put_u32(self.initial_packet_sequence_number);
        buf.put_u32(self.maximum_packet_size);
        buf.put_u32(self.maximum_flow_window_size);
        buf.put_i32(self.connection_type.into());
        buf.put_u32(self.socket_id.0);
        buf.put_u32(self.syn_cookie);
        buf.put_slice(&self.ip_address);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<HandshakePacket> {
        if buf.remaining() < Self::SERIALIZED_LEN {
            bail!("handshake packet must be {} bytes, was {}", Self::SERIALIZED_LEN, buf.remaining());
        }

        let flags_and_type = buf.try_get_u16()?;
        if flags_and_type != Self::CONTROL_HANDSHAKE {
            bail!("not a handshake control packet: {:04x}", flags_and_type);
        }
        let _reserved = buf.try_get_u16()?;
        let _additional_info = buf.try_get_u32()?;
        let timestamp = buf.try_get_u32()?;
        let destination_socket_id = SocketId(buf.try_get_u32()?);

        let version = buf.try_get_u32()?;
        if version != Self::UDT_VERSION {
            bail!("unsupported UDT version {}", version);
        }

        let socket_type = buf.try_get_u32()?;
        let socket_type = SocketType::try_from(socket_type)
            .map_err(|_| anyhow!("invalid socket type {}", socket_type))?;
        let initial_packet_sequence_number = buf.try_get_u32()?;
        let maximum_packet_size = buf.try_get_u32()?;
        let maximum_flow_window_size = buf.try_get_u32()?;
        let connection_type = buf.try_get_i32()?;
        let connection_type = ConnectionType::try_from(connection_type)
            .map_err(|_| anyhow!("invalid connection type {}", connection_type))?;
        let socket_id = SocketId(buf.try_get_u32()?);
        let syn_cookie = buf.try_get_u32()?;

        let mut ip_address = [0u8; 16];
        buf.try_copy_to_slice(&mut ip_address)?;

        Ok(HandshakePacket {
            timestamp,
            destination_socket_id,
            socket_type,
            initial_packet_sequence_number,
            maximum_packet_size,
            maximum_flow_window_size,
            connection_type,
            socket_id,
            syn_cookie,
            ip_address,
        })
    }
}
