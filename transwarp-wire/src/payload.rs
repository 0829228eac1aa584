use std::collections::BTreeMap;

use crate::error::{CodecError, Result};
use crate::frame::{read_i32, read_u32, Frame, MessageType};

/// Fabric data unit carried by a `Payload` frame.
///
/// Wire layout of the frame payload (little-endian):
///
/// ```text
/// <session_id_len:i32>   0  1  2  3
/// <flags:u32>            4  5  6  7
/// <sequence:i32>         8  9 10 11
/// <data_len:i32>        12 13 14 15
/// <session_id>          16 -> (16 + session_id_len)
/// <data>                (16 + session_id_len) -> (16 + session_id_len + data_len)
/// ```
///
/// Upper-layer headers ride in the frame header block, not here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    pub session_id: String,
    pub flags: u32,
    pub sequence: i32,
    pub headers: BTreeMap<u8, Vec<u8>>,
    pub data: Vec<u8>,
}

impl Payload {
    /// Wrap into a sequenced `Payload` frame for transmission.
    pub fn to_frame(&self, sequence: i32) -> Frame {
        let mut payload =
            Vec::with_capacity(16 + self.session_id.len() + self.data.len());
        payload.extend_from_slice(&(self.session_id.len() as i32).to_le_bytes());
        payload.extend_from_slice(&self.flags.to_le_bytes());
        payload.extend_from_slice(&self.sequence.to_le_bytes());
        payload.extend_from_slice(&(self.data.len() as i32).to_le_bytes());
        payload.extend_from_slice(self.session_id.as_bytes());
        payload.extend_from_slice(&self.data);

        let mut frame = Frame::sequenced(MessageType::Payload, sequence, payload);
        frame.headers = self.headers.clone();
        frame
    }

    pub fn from_frame(frame: &Frame) -> Result<Self> {
        let session_id_len = checked_len(read_i32(&frame.payload, 0, "session_id_len")?)?;
        let flags = read_u32(&frame.payload, 4, "flags")?;
        let sequence = read_i32(&frame.payload, 8, "sequence")?;
        let data_len = checked_len(read_i32(&frame.payload, 12, "data_len")?)?;

        let session_id = take(&frame.payload, 16, session_id_len)?;
        let data = take(&frame.payload, 16 + session_id_len, data_len)?;

        Ok(Self {
            session_id: String::from_utf8(session_id.to_vec())?,
            flags,
            sequence,
            headers: frame.headers.clone(),
            data: data.to_vec(),
        })
    }
}

/// Fabric acknowledgement carried by an `Acknowledgement` frame.
///
/// Wire layout of the frame payload (little-endian):
///
/// ```text
/// <session_id_len:i32>   0  1  2  3
/// <flags:u32>            4  5  6  7
/// <count:i32>            8  9 10 11
/// <session_id>          12 -> (12 + session_id_len)
/// <sequence_list>       (12 + session_id_len) -> .. + 4 * count
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acknowledgement {
    pub session_id: String,
    pub flags: u32,
    pub sequence_list: Vec<i32>,
}

impl Acknowledgement {
    /// Wrap into a sequenced `Acknowledgement` frame for transmission.
    pub fn to_frame(&self, sequence: i32) -> Frame {
        let mut payload =
            Vec::with_capacity(12 + self.session_id.len() + 4 * self.sequence_list.len());
        payload.extend_from_slice(&(self.session_id.len() as i32).to_le_bytes());
        payload.extend_from_slice(&self.flags.to_le_bytes());
        payload.extend_from_slice(&(self.sequence_list.len() as i32).to_le_bytes());
        payload.extend_from_slice(self.session_id.as_bytes());
        for sequence_id in &self.sequence_list {
            payload.extend_from_slice(&sequence_id.to_le_bytes());
        }
        Frame::sequenced(MessageType::Acknowledgement, sequence, payload)
    }

    pub fn from_frame(frame: &Frame) -> Result<Self> {
        let session_id_len = checked_len(read_i32(&frame.payload, 0, "session_id_len")?)?;
        let flags = read_u32(&frame.payload, 4, "flags")?;
        let count = checked_len(read_i32(&frame.payload, 8, "count")?)?;

        let session_id = take(&frame.payload, 12, session_id_len)?;
        let mut sequence_list = Vec::with_capacity(count);
        let mut at = 12 + session_id_len;
        for _ in 0..count {
            sequence_list.push(read_i32(&frame.payload, at, "sequence_id")?);
            at += 4;
        }

        Ok(Self {
            session_id: String::from_utf8(session_id.to_vec())?,
            flags,
            sequence_list,
        })
    }
}

fn checked_len(value: i32) -> Result<usize> {
    usize::try_from(value).map_err(|_| CodecError::Arithmetic {
        what: "length",
        value: value as i64,
    })
}

fn take(data: &[u8], at: usize, len: usize) -> Result<&[u8]> {
    let end = at.checked_add(len).ok_or(CodecError::Arithmetic {
        what: "extent",
        value: at as i64,
    })?;
    data.get(at..end).ok_or(CodecError::Short {
        need: end,
        have: data.len(),
    })
}
