#![forbid(unsafe_code)]

//! TRANSWARP link runtime.
//!
//! An ordered, reliable, link-oriented channel between two routers over
//! unreliable datagrams: sliding transmit window with per-frame
//! retransmission, receive-side reorder buffer with cumulative release,
//! per-receipt acks carrying the receiver's advertised window, ping-based
//! liveness, hello establishment, and a structured per-link trace stream.
//!
//! The transport is a library component inside the router process. It talks
//! upward through the [`Forwarder`] trait and downward through [`Link`]
//! handles produced by the [`Dialer`] and [`Listener`].

pub mod config;
pub mod dialer;
pub mod errors;
pub mod forwarder;
pub mod link;
pub mod listener;
pub mod rx_window;
pub mod sequence;
pub mod trace;
pub mod tx_window;

pub use config::{DialerConfig, LinkConfig, ListenerConfig, BINDING};
pub use dialer::Dialer;
pub use errors::{Error, Result};
pub use forwarder::{Forwarder, LinkEvent};
pub use link::Link;
pub use listener::Listener;
pub use rx_window::{AckRequest, RxOutcome, RxWindow};
pub use trace::{TraceRecord, TraceSink};
pub use tx_window::TxWindow;

pub use transwarp_wire::{Acknowledgement, Payload};
