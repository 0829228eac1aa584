#![forbid(unsafe_code)]

//! TRANSWARP v1 wire format.
//!
//! A TRANSWARP datagram is a single frame: a 15-byte little-endian message
//! section (magic, sequence, fragment fields, message type, section lengths)
//! followed by a header block and an opaque payload. This crate owns the
//! byte-level contract only; it performs no I/O and holds no link state.

pub mod codec;
pub mod error;
pub mod frame;
pub mod payload;

pub use codec::WireCodec;
pub use error::{CodecError, Result};
pub use frame::{Frame, MessageType, DEFAULT_MTU, HEADER_RTT, MAGIC, NO_REPLY_FOR, UNSEQUENCED};
pub use payload::{Acknowledgement, Payload};
