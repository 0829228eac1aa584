use std::collections::BTreeMap;

use bytes::{BufMut, BytesMut};

use crate::error::{CodecError, Result};
use crate::frame::{
    read_i32, Frame, MessageType, DEFAULT_MTU, MAGIC, MAX_HEADER_VALUE_LEN, MAX_PAYLOAD_LEN,
    MESSAGE_SECTION_LEN,
};

/// Datagram-oriented codec for TRANSWARP v1 frames.
///
/// Message section layout (little-endian):
///
/// ```text
/// <magic:[4]>            0  1  2  3
/// <sequence:i32>         4  5  6  7
/// <fragment:u8>          8
/// <of_fragments:u8>      9
/// <type:u8>              10
/// <headers_len:u16>      11 12
/// <payload_len:u16>      13 14
/// <headers>              15 -> (15 + headers_len)
/// <payload>              (15 + headers_len) -> (15 + headers_len + payload_len)
/// ```
pub struct WireCodec;

impl WireCodec {
    /// Encode under the default datagram ceiling.
    pub fn encode(frame: &Frame, dst: &mut BytesMut) -> Result<()> {
        Self::encode_with_limit(frame, dst, DEFAULT_MTU)
    }

    /// Encode with a custom datagram ceiling. Fails only on unrepresentable
    /// input; the codec never fragments.
    pub fn encode_with_limit(frame: &Frame, dst: &mut BytesMut, max_len: usize) -> Result<()> {
        let headers = encode_headers(&frame.headers)?;
        if headers.len() > u16::MAX as usize {
            return Err(CodecError::TooLarge {
                what: "headers",
                len: headers.len(),
                max: u16::MAX as usize,
            });
        }
        if frame.payload.len() > MAX_PAYLOAD_LEN {
            return Err(CodecError::TooLarge {
                what: "payload",
                len: frame.payload.len(),
                max: MAX_PAYLOAD_LEN,
            });
        }
        let total = MESSAGE_SECTION_LEN + headers.len() + frame.payload.len();
        if total > max_len {
            return Err(CodecError::TooLarge {
                what: "datagram",
                len: total,
                max: max_len,
            });
        }

        dst.reserve(total);
        dst.put_slice(&MAGIC);
        dst.put_i32_le(frame.sequence);
        dst.put_u8(frame.fragment);
        dst.put_u8(frame.of_fragments);
        dst.put_u8(frame.message_type as u8);
        dst.put_u16_le(headers.len() as u16);
        dst.put_u16_le(frame.payload.len() as u16);
        dst.put_slice(&headers);
        dst.put_slice(&frame.payload);
        Ok(())
    }

    /// Decode one datagram. Any malformed input yields a typed error; the
    /// caller logs and drops without disturbing the link.
    pub fn decode(data: &[u8]) -> Result<Frame> {
        if data.len() < MESSAGE_SECTION_LEN {
            return Err(CodecError::Short {
                need: MESSAGE_SECTION_LEN,
                have: data.len(),
            });
        }
        if data[..4] != MAGIC {
            return Err(CodecError::Magic);
        }
        let sequence = read_i32(data, 4, "sequence")?;
        let fragment = data[8];
        let of_fragments = data[9];
        let message_type = MessageType::try_from(data[10])?;
        let headers_len = u16::from_le_bytes([data[11], data[12]]) as usize;
        let payload_len = u16::from_le_bytes([data[13], data[14]]) as usize;

        let headers_end = MESSAGE_SECTION_LEN + headers_len;
        let payload_end = headers_end + payload_len;
        if data.len() < payload_end {
            return Err(CodecError::Short {
                need: payload_end,
                have: data.len(),
            });
        }

        if fragment != 0 || of_fragments != 1 {
            return Err(CodecError::Fragmented {
                fragment,
                of_fragments,
            });
        }
        if message_type.is_sequenced() && sequence < 0 {
            return Err(CodecError::UnsequencedData {
                message_type: message_type as u8,
            });
        }

        let headers = decode_headers(&data[MESSAGE_SECTION_LEN..headers_end])?;
        Ok(Frame {
            sequence,
            fragment,
            of_fragments,
            message_type,
            headers,
            payload: data[headers_end..payload_end].to_vec(),
        })
    }
}

/*
 * Headers wire format, repeated until the declared block length is consumed:
 *
 * <key:u8>       0
 * <length:u8>    1
 * <data>         2 -> (2 + length)
 */
fn encode_headers(headers: &BTreeMap<u8, Vec<u8>>) -> Result<Vec<u8>> {
    let mut data = Vec::new();
    for (key, value) in headers {
        if value.len() > MAX_HEADER_VALUE_LEN {
            return Err(CodecError::TooLarge {
                what: "header value",
                len: value.len(),
                max: MAX_HEADER_VALUE_LEN,
            });
        }
        data.push(*key);
        data.push(value.len() as u8);
        data.extend_from_slice(value);
    }
    Ok(data)
}

fn decode_headers(data: &[u8]) -> Result<BTreeMap<u8, Vec<u8>>> {
    let mut headers = BTreeMap::new();
    let mut i = 0;
    while i < data.len() {
        if i + 2 > data.len() {
            return Err(CodecError::HeaderOverrun {
                declared: i + 2,
                remaining: data.len(),
            });
        }
        let key = data[i];
        let length = data[i + 1] as usize;
        let end = i + 2 + length;
        if end > data.len() {
            return Err(CodecError::HeaderOverrun {
                declared: end,
                remaining: data.len(),
            });
        }
        headers.insert(key, data[i + 2..end].to_vec());
        i = end;
    }
    Ok(headers)
}
