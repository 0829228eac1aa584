//! Upward delivery contract between a link and the fabric forwarder.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use transwarp_wire::{Acknowledgement, Payload};

use crate::link::Link;

/// The upper-layer collaborator that consumes inbound data units.
/// `link_address` is the link's peer token.
#[async_trait]
pub trait Forwarder: Send + Sync + 'static {
    async fn forward_payload(&self, link_address: &str, payload: Payload);
    async fn forward_acknowledgement(&self, link_address: &str, acknowledgement: Acknowledgement);
}

/// Out-of-band link notifications. Teardown decisions belong to the
/// receiver of these events, not to the transport.
pub enum LinkEvent {
    /// A listener accepted a hello from an unknown peer and established a
    /// link.
    Accepted(Arc<Link>),
    /// Liveness lapsed: the last ping echo lags the last request by more
    /// than the configured threshold. Emitted once per lapse episode.
    Unhealthy { token: String, lag: Duration },
}
