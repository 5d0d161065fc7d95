//! Wire framing: `channel:id;payload` with a JSON payload.

use serde_json::Value;
use thiserror::Error;

/// Separates the `channel:id` header from the JSON payload.
pub const EVENT_SEPARATOR: char = ';';
/// Separates the channel name from the packet id inside the header.
pub const ID_SEPARATOR: char = ':';
/// Channels starting with this prefix are handled by the framework itself.
pub const INTERNAL_PREFIX: char = '!';

/// Connection handshake channel (`!connect`).
pub const CONNECT_CHANNEL: &str = "!connect";
/// Ping/keepalive channel (`!ping`).
pub const PING_CHANNEL: &str = "!ping";

/// Largest datagram either side will send or receive.
///
/// 16-bit UDP length field minus the 20-byte IP header and 8-byte UDP header.
pub const MAX_DATAGRAM_SIZE: usize = 0xffff - 20 - 8;

/// Sent in place of the request id when the server rejects an event.
pub const REJECT_PACKET_ID: i32 = -1;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("could not parse packet: bad format")]
    BadFormat,
}

/// The framing unit exchanged over UDP.
///
/// `packet_id` semantics: values `> 0` are per-channel sequence numbers
/// stamped by the sending client, `0` marks unsequenced traffic (internal
/// channels and plain events), and negative values mark a server reject.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub channel: String,
    pub packet_id: i32,
    pub content: Value,
}

impl Packet {
    /// An unsequenced packet (id 0).
    pub fn new(channel: impl Into<String>, content: Value) -> Self {
        Self::with_id(channel, content, 0)
    }

    pub fn with_id(channel: impl Into<String>, content: Value, packet_id: i32) -> Self {
        Self {
            channel: channel.into(),
            packet_id,
            content,
        }
    }

    /// Parses the textual wire form.
    ///
    /// The header is everything before the first `;`; the channel is
    /// everything before the first `:` of the header and must be non-empty.
    /// The payload may itself contain `;` and `:`.
    pub fn parse(data: &str) -> Result<Self, PacketError> {
        let (header, payload) = data.split_once(EVENT_SEPARATOR).ok_or(PacketError::BadFormat)?;
        let (channel, id_str) = header.split_once(ID_SEPARATOR).ok_or(PacketError::BadFormat)?;

        if channel.is_empty() {
            return Err(PacketError::BadFormat);
        }

        let packet_id = id_str.parse::<i32>().map_err(|_| PacketError::BadFormat)?;
        let content = serde_json::from_str(payload).map_err(|_| PacketError::BadFormat)?;

        Ok(Self {
            channel: channel.to_string(),
            packet_id,
            content,
        })
    }

    /// Formats the packet for transmission; the exact inverse of [`parse`].
    ///
    /// [`parse`]: Packet::parse
    pub fn to_wire(&self) -> String {
        format!(
            "{}{}{}{}{}",
            self.channel, ID_SEPARATOR, self.packet_id, EVENT_SEPARATOR, self.content
        )
    }

    pub fn is_internal(&self) -> bool {
        self.channel.starts_with(INTERNAL_PREFIX)
    }
}
