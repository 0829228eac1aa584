use std::collections::BTreeMap;

use crate::error::{CodecError, Result};

/// TRANSWARP v1 magic. Any deviation is a different protocol version.
pub const MAGIC: [u8; 4] = [0x01, 0x02, 0x02, 0x00];

/// Length of the fixed message section preceding headers and payload.
pub const MESSAGE_SECTION_LEN: usize = 15;

/// Sequence value reserved for unsequenced control frames (hello, ack, probe).
pub const UNSEQUENCED: i32 = -1;

/// `reply_for` value marking a ping as a request rather than an echo.
pub const NO_REPLY_FOR: i32 = -1;

/// Reserved header key carrying an RTT sample in milliseconds.
pub const HEADER_RTT: u8 = 0;

/// Default datagram ceiling. The codec does not fragment; callers stay under
/// the runtime MTU.
pub const DEFAULT_MTU: usize = 1472;

/// Largest encodable header value (length field is a u8).
pub const MAX_HEADER_VALUE_LEN: usize = u8::MAX as usize;

/// Largest encodable payload (length field is a u16).
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Hello = 0,
    Ping = 1,
    Ack = 2,
    Probe = 3,
    Payload = 4,
    Acknowledgement = 5,
}

impl MessageType {
    /// Data frames draw non-negative sequences from the link allocator and
    /// pass through the windows; everything else is unsequenced control.
    pub fn is_sequenced(self) -> bool {
        matches!(
            self,
            MessageType::Ping | MessageType::Payload | MessageType::Acknowledgement
        )
    }
}

impl TryFrom<u8> for MessageType {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(MessageType::Hello),
            1 => Ok(MessageType::Ping),
            2 => Ok(MessageType::Ack),
            3 => Ok(MessageType::Probe),
            4 => Ok(MessageType::Payload),
            5 => Ok(MessageType::Acknowledgement),
            other => Err(CodecError::UnknownType(other)),
        }
    }
}

/// One TRANSWARP frame. `fragment`/`of_fragments` are reserved on the wire;
/// decode rejects anything other than `fragment=0, of_fragments=1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub sequence: i32,
    pub fragment: u8,
    pub of_fragments: u8,
    pub message_type: MessageType,
    pub headers: BTreeMap<u8, Vec<u8>>,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Unsequenced control frame.
    pub fn control(message_type: MessageType, payload: Vec<u8>) -> Self {
        Self {
            sequence: UNSEQUENCED,
            fragment: 0,
            of_fragments: 1,
            message_type,
            headers: BTreeMap::new(),
            payload,
        }
    }

    /// Sequenced data frame.
    pub fn sequenced(message_type: MessageType, sequence: i32, payload: Vec<u8>) -> Self {
        Self {
            sequence,
            fragment: 0,
            of_fragments: 1,
            message_type,
            headers: BTreeMap::new(),
            payload,
        }
    }

    pub fn hello(token: &str) -> Self {
        Self::control(MessageType::Hello, token.as_bytes().to_vec())
    }

    pub fn ping(sequence: i32, reply_for: i32) -> Self {
        Self::sequenced(MessageType::Ping, sequence, reply_for.to_le_bytes().to_vec())
    }

    pub fn ack(for_sequence: i32, advertised_window: i32) -> Self {
        let mut payload = Vec::with_capacity(8);
        payload.extend_from_slice(&for_sequence.to_le_bytes());
        payload.extend_from_slice(&advertised_window.to_le_bytes());
        Self::control(MessageType::Ack, payload)
    }

    pub fn probe() -> Self {
        Self::control(MessageType::Probe, Vec::new())
    }

    /// Serialized length of this frame as a datagram.
    pub fn wire_len(&self) -> usize {
        let headers: usize = self.headers.values().map(|v| 2 + v.len()).sum();
        MESSAGE_SECTION_LEN + headers + self.payload.len()
    }

    /// Peer token carried by a hello frame.
    pub fn hello_token(&self) -> Result<String> {
        Ok(String::from_utf8(self.payload.clone())?)
    }

    /// `reply_for` carried by a ping frame.
    pub fn ping_reply_for(&self) -> Result<i32> {
        read_i32(&self.payload, 0, "reply_for")
    }

    /// `(for_sequence, advertised_window)` carried by an ack frame.
    pub fn ack_fields(&self) -> Result<(i32, i32)> {
        let for_sequence = read_i32(&self.payload, 0, "for_sequence")?;
        let advertised_window = read_i32(&self.payload, 4, "advertised_window")?;
        Ok((for_sequence, advertised_window))
    }
}

pub(crate) fn read_i32(data: &[u8], at: usize, what: &'static str) -> Result<i32> {
    let end = at.checked_add(4).ok_or(CodecError::Arithmetic {
        what,
        value: at as i64,
    })?;
    let bytes = data.get(at..end).ok_or(CodecError::Short {
        need: end,
        have: data.len(),
    })?;
    let mut raw = [0u8; 4];
    raw.copy_from_slice(bytes);
    Ok(i32::from_le_bytes(raw))
}

pub(crate) fn read_u32(data: &[u8], at: usize, what: &'static str) -> Result<u32> {
    let end = at.checked_add(4).ok_or(CodecError::Arithmetic {
        what,
        value: at as i64,
    })?;
    let bytes = data.get(at..end).ok_or(CodecError::Short {
        need: end,
        have: data.len(),
    })?;
    let mut raw = [0u8; 4];
    raw.copy_from_slice(bytes);
    Ok(u32::from_le_bytes(raw))
}
